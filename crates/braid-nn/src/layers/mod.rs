// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod activation;
pub mod class_conditional;
pub mod conv;
pub mod linear;
pub mod normalization;

pub use activation::Relu;
pub use class_conditional::{BatchPartition, ClassConditionalBatchNorm, PartitionBook};
pub use conv::{Conv2d, GlobalAvgPool2d, MaxPool2d};
pub use linear::Linear;
pub use normalization::{BatchNorm, FeatureLayout};
