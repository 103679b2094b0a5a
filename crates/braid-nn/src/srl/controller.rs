// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::sampler::{PairSampler, RateUpdatable};
use super::SrlSettings;
use crate::optim::{OptimizerConfig, ScalarOptimizer};
use crate::{PureResult, TensorError};
use std::collections::BTreeMap;

/// Flat checkpoint mapping: `alpha` plus `optim.*` optimiser fields.
pub type SrlStateDict = BTreeMap<String, f64>;

const OPTIM_PREFIX: &str = "optim.";

fn sigmoid(x: f64) -> f64 {
    let s = if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    };
    // keep the rate strictly inside (0, 1) once the logit saturates
    s.clamp(f64::EPSILON, 1.0 - f64::EPSILON)
}

/// Owns the rate logit `alpha` and its optimiser, and pushes
/// `sigmoid(alpha)` to the sampler after every applied step.
pub struct SampleRateController {
    sampler: Box<dyn RateUpdatable>,
    optimizer: ScalarOptimizer,
    alpha: f64,
    rate: f64,
}

impl core::fmt::Debug for SampleRateController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "SampleRateController(optim={},alpha={},rate={})",
            self.optimizer.kind(),
            self.alpha,
            self.rate
        )
    }
}

impl SampleRateController {
    /// Starts at `alpha = 0` and immediately pushes the rate `0.5`.
    pub fn new(mut sampler: Box<dyn RateUpdatable>, config: OptimizerConfig) -> PureResult<Self> {
        let optimizer = ScalarOptimizer::new(config)?;
        let alpha = 0.0;
        let rate = sigmoid(alpha);
        sampler.update(rate);
        Ok(Self {
            sampler,
            optimizer,
            alpha,
            rate,
        })
    }

    /// Binds to the rate capability of `sampler`.
    pub fn from_sampler(sampler: &dyn PairSampler, settings: &SrlSettings) -> PureResult<Self> {
        let handle = sampler
            .rate_handle()
            .ok_or_else(|| TensorError::InvalidSamplerType {
                sampler: sampler.name().to_string(),
            })?;
        Self::new(Box::new(handle), settings.optimizer_config()?)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn optimizer(&self) -> &ScalarOptimizer {
        &self.optimizer
    }

    /// Applies one update driven by `signal`, the upstream gradient of the
    /// rate. Returns `false` and leaves every piece of state untouched when
    /// the signal is not finite.
    pub fn step(&mut self, signal: f64) -> bool {
        if !signal.is_finite() {
            tracing::warn!(signal, rate = self.rate, "skipping sample-rate update");
            return false;
        }
        let s = sigmoid(self.alpha);
        let grad = signal * s * (1.0 - s);
        self.optimizer.step(&mut self.alpha, grad);
        self.rate = sigmoid(self.alpha);
        self.sampler.update(self.rate);
        tracing::trace!(alpha = self.alpha, rate = self.rate, "sample rate updated");
        true
    }

    pub fn state_dict(&self) -> SrlStateDict {
        let mut state = SrlStateDict::new();
        state.insert("alpha".to_string(), self.alpha);
        for (key, value) in self.optimizer.state_dict() {
            state.insert(format!("{OPTIM_PREFIX}{key}"), value);
        }
        state
    }

    /// Restores `alpha` and the optimiser state, then pushes the restored
    /// rate to the sampler.
    pub fn load_state_dict(&mut self, state: &SrlStateDict) -> PureResult<()> {
        let alpha = *state.get("alpha").ok_or_else(|| TensorError::MissingParameter {
            name: "alpha".to_string(),
        })?;
        if !alpha.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "srl_alpha",
                value: alpha as f32,
            });
        }
        let optim_state: BTreeMap<String, f64> = state
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(OPTIM_PREFIX)
                    .map(|stripped| (stripped.to_string(), *value))
            })
            .collect();
        let mut optimizer = self.optimizer.clone();
        optimizer.load_state_dict(&optim_state)?;
        self.optimizer = optimizer;
        self.alpha = alpha;
        self.rate = sigmoid(alpha);
        self.sampler.update(self.rate);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::OptimizerKind;
    use crate::srl::{RandomPairSampler, RateHandle, SampleRateSampler};

    fn controller(kind: OptimizerKind) -> (SampleRateController, RateHandle) {
        let handle = RateHandle::new(0.0);
        let controller =
            SampleRateController::new(Box::new(handle.clone()), OptimizerConfig::new(kind, 0.1))
                .unwrap();
        (controller, handle)
    }

    #[test]
    fn construction_pushes_half() {
        let (controller, handle) = controller(OptimizerKind::Adam);
        assert_eq!(controller.rate(), 0.5);
        assert_eq!(handle.get(), 0.5);
    }

    #[test]
    fn gradient_flows_through_the_sigmoid() {
        let (mut controller, handle) = controller(OptimizerKind::Sgd);
        assert!(controller.step(2.0));
        // d alpha = -lr * 2 * 0.25
        assert!((controller.alpha() + 0.05).abs() < 1e-12);
        assert_eq!(handle.get(), controller.rate());
        assert!(controller.rate() < 0.5);
    }

    #[test]
    fn non_finite_signal_is_ignored() {
        let (mut controller, handle) = controller(OptimizerKind::AmsGrad);
        controller.step(0.3);
        let before = controller.state_dict();
        assert!(!controller.step(f64::NAN));
        assert!(!controller.step(f64::INFINITY));
        assert_eq!(controller.state_dict(), before);
        assert_eq!(handle.get(), controller.rate());
    }

    #[test]
    fn requires_a_rate_capable_sampler() {
        let pids = [0, 0, 1, 1];
        let random = RandomPairSampler::new(&pids, Some(1)).unwrap();
        let err = SampleRateController::from_sampler(&random, &SrlSettings::default()).unwrap_err();
        assert!(matches!(err, TensorError::InvalidSamplerType { ref sampler } if sampler == "RandomPairSampler"));

        let sampler = SampleRateSampler::new(&pids, Some(1)).unwrap();
        let controller = SampleRateController::from_sampler(&sampler, &SrlSettings::default()).unwrap();
        assert_eq!(sampler.rate(), controller.rate());
    }

    #[test]
    fn load_pushes_the_restored_rate() {
        let (mut source, _) = controller(OptimizerKind::Adam);
        for _ in 0..5 {
            source.step(-1.0);
        }
        let (mut target, handle) = controller(OptimizerKind::Adam);
        target.load_state_dict(&source.state_dict()).unwrap();
        assert_eq!(handle.get(), source.rate());
        assert!(source.rate() > 0.5);

        let mut missing = source.state_dict();
        missing.remove("alpha");
        assert!(matches!(
            target.load_state_dict(&missing),
            Err(TensorError::MissingParameter { .. })
        ));
    }
}
