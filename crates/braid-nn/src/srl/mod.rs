// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Sample-rate learning: a learnable positive-pair rate fed back from the
//! gap between negative and positive pair losses.

mod controller;
mod loss;
mod sampler;

pub use controller::{SampleRateController, SrlStateDict};
pub use loss::{LossBreakdown, RateAdaptiveLoss};
pub use sampler::{
    PairSampler, RandomPairSampler, RateHandle, RateUpdatable, SampleRateBatchSampler,
    SampleRateSampler,
};

use crate::loss::ElementwiseLoss;
use crate::optim::{OptimizerConfig, OptimizerKind};
use crate::{PureResult, TensorError};
use braid_config::layered::LayeredConfig;
use serde::{Deserialize, Serialize};

/// `[srl]` section of a run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SrlSettings {
    pub optim: String,
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub norm: bool,
    pub loss: String,
}

impl Default for SrlSettings {
    fn default() -> Self {
        Self {
            optim: "adam".to_string(),
            lr: 0.1,
            momentum: 0.0,
            weight_decay: 0.0,
            norm: false,
            loss: "bce".to_string(),
        }
    }
}

impl SrlSettings {
    /// Reads the `[srl]` section, falling back to defaults when it is absent.
    pub fn from_config(config: &LayeredConfig) -> PureResult<Self> {
        let section = config
            .section::<SrlSettings>(&["srl"])
            .map_err(|err| TensorError::SerializationError {
                message: err.to_string(),
            })?;
        Ok(section.unwrap_or_default())
    }

    pub fn optimizer_config(&self) -> PureResult<OptimizerConfig> {
        let kind: OptimizerKind = self.optim.parse()?;
        Ok(OptimizerConfig::new(kind, self.lr)
            .with_momentum(self.momentum)
            .with_weight_decay(self.weight_decay))
    }

    pub fn loss_variant(&self) -> PureResult<ElementwiseLoss> {
        self.loss.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_default_when_section_is_missing() {
        let config = LayeredConfig::from_toml_str("[trainer]\nepochs = 3\n").unwrap();
        assert_eq!(SrlSettings::from_config(&config).unwrap(), SrlSettings::default());
    }

    #[test]
    fn settings_read_partial_section() {
        let config =
            LayeredConfig::from_toml_str("[srl]\noptim = \"sgd\"\nlr = 0.5\nnorm = true\n").unwrap();
        let settings = SrlSettings::from_config(&config).unwrap();
        assert!(settings.norm);
        assert_eq!(settings.loss, "bce");
        let optim = settings.optimizer_config().unwrap();
        assert_eq!(optim.kind, OptimizerKind::Sgd);
        assert_eq!(optim.lr, 0.5);
    }

    #[test]
    fn settings_surface_unknown_names() {
        let settings = SrlSettings {
            optim: "lbfgs".to_string(),
            loss: "hinge".to_string(),
            ..SrlSettings::default()
        };
        assert!(matches!(
            settings.optimizer_config(),
            Err(TensorError::UnsupportedOptimizerKind { .. })
        ));
        assert!(matches!(
            settings.loss_variant(),
            Err(TensorError::UnsupportedLossVariant { .. })
        ));
    }

    #[test]
    fn malformed_section_is_a_serialisation_error() {
        let config = LayeredConfig::from_toml_str("[srl]\nlr = \"fast\"\n").unwrap();
        assert!(matches!(
            SrlSettings::from_config(&config),
            Err(TensorError::SerializationError { .. })
        ));
    }
}
