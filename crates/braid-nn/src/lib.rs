//! Braid (paired-input) networks for person re-identification.
//!
//! The crate keeps a small `nn.Module` style surface over row-major tensors:
//! twin-branch layers whose outputs swap when their inputs swap, batch norm
//! conditioned on a class partition of the batch, and a sample-rate learning
//! loop that tunes how often the pair sampler draws positive pairs.

pub mod braid;
pub mod dataset;
pub mod io;
pub mod layers;
pub mod loss;
pub mod module;
pub mod optim;
pub mod srl;
pub mod trainer;

pub use braid::{BraidModule, BraidNet, BraidPair};
pub use dataset::{PairBatch, PairDataset};
pub use io::{
    latest_srl_checkpoint, load_bincode, load_json, load_srl_state_json, save_bincode, save_json,
    save_srl_state_json,
};
pub use layers::{BatchNorm, ClassConditionalBatchNorm, FeatureLayout, Linear, PartitionBook};
pub use loss::{ElementwiseLoss, Loss};
pub use module::{Module, Parameter};
pub use optim::{OptimizerConfig, OptimizerKind, ScalarOptimizer};
pub use srl::{RateAdaptiveLoss, RateUpdatable, SampleRateController, SrlSettings};
pub use trainer::{EpochStats, PairTrainer, TrainerSettings};

pub use braid_tensor::{PureResult, Tensor, TensorError};
