// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! First-order optimisers for a single `f64` parameter, following the update
//! rules of `torch.optim` (SGD, Adam, Adam with AMSGrad, AdamW).

use crate::{PureResult, TensorError};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Supported optimiser families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
    AmsGrad,
    AdamW,
}

impl OptimizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Adam => "adam",
            OptimizerKind::AmsGrad => "amsgrad",
            OptimizerKind::AdamW => "adamw",
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizerKind {
    type Err = TensorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            "amsgrad" => Ok(OptimizerKind::AmsGrad),
            "adamw" => Ok(OptimizerKind::AdamW),
            _ => Err(TensorError::UnsupportedOptimizerKind {
                kind: value.to_string(),
            }),
        }
    }
}

/// Hyperparameters. `momentum` only applies to SGD; the Adam family uses
/// `betas` and `eps`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub betas: (f64, f64),
    pub eps: f64,
}

impl OptimizerConfig {
    pub fn new(kind: OptimizerKind, lr: f64) -> Self {
        Self {
            kind,
            lr,
            momentum: 0.0,
            weight_decay: 0.0,
            betas: (0.9, 0.999),
            eps: 1e-8,
        }
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    fn validate(&self) -> PureResult<()> {
        if !(self.lr > 0.0) || !self.lr.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: self.lr as f32,
            });
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(TensorError::InvalidValue {
                label: "optimizer_momentum",
            });
        }
        if !(self.weight_decay >= 0.0) || !self.weight_decay.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "optimizer_weight_decay",
            });
        }
        let (beta1, beta2) = self.betas;
        if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) || !(self.eps > 0.0) {
            return Err(TensorError::InvalidValue {
                label: "optimizer_betas",
            });
        }
        Ok(())
    }
}

/// Optimiser state for one scalar parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarOptimizer {
    config: OptimizerConfig,
    initial_lr: f64,
    step: u64,
    exp_avg: f64,
    exp_avg_sq: f64,
    max_exp_avg_sq: f64,
    momentum_buffer: Option<f64>,
}

impl ScalarOptimizer {
    pub fn new(config: OptimizerConfig) -> PureResult<Self> {
        config.validate()?;
        Ok(Self {
            initial_lr: config.lr,
            config,
            step: 0,
            exp_avg: 0.0,
            exp_avg_sq: 0.0,
            max_exp_avg_sq: 0.0,
            momentum_buffer: None,
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.config.kind
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn lr(&self) -> f64 {
        self.config.lr
    }

    /// Learning rate at construction, kept for schedulers.
    pub fn initial_lr(&self) -> f64 {
        self.initial_lr
    }

    pub fn set_lr(&mut self, lr: f64) -> PureResult<()> {
        let mut config = self.config;
        config.lr = lr;
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Applies one update of `param` against `grad`.
    pub fn step(&mut self, param: &mut f64, grad: f64) {
        match self.config.kind {
            OptimizerKind::Sgd => self.sgd_step(param, grad),
            OptimizerKind::Adam | OptimizerKind::AmsGrad => {
                let grad = grad + self.config.weight_decay * *param;
                self.adam_step(param, grad);
            }
            OptimizerKind::AdamW => {
                *param *= 1.0 - self.config.lr * self.config.weight_decay;
                self.adam_step(param, grad);
            }
        }
    }

    fn sgd_step(&mut self, param: &mut f64, grad: f64) {
        self.step += 1;
        let mut direction = grad + self.config.weight_decay * *param;
        if self.config.momentum != 0.0 {
            let buffer = match self.momentum_buffer {
                None => direction,
                Some(previous) => self.config.momentum * previous + direction,
            };
            self.momentum_buffer = Some(buffer);
            direction = buffer;
        }
        *param -= self.config.lr * direction;
    }

    fn adam_step(&mut self, param: &mut f64, grad: f64) {
        self.step += 1;
        let (beta1, beta2) = self.config.betas;
        self.exp_avg = beta1 * self.exp_avg + (1.0 - beta1) * grad;
        self.exp_avg_sq = beta2 * self.exp_avg_sq + (1.0 - beta2) * grad * grad;
        let t = i32::try_from(self.step).unwrap_or(i32::MAX);
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);
        let second = if self.config.kind == OptimizerKind::AmsGrad {
            self.max_exp_avg_sq = self.max_exp_avg_sq.max(self.exp_avg_sq);
            self.max_exp_avg_sq
        } else {
            self.exp_avg_sq
        };
        let denom = second.sqrt() / bias_correction2.sqrt() + self.config.eps;
        *param -= self.config.lr / bias_correction1 * self.exp_avg / denom;
    }

    /// Flat snapshot of every moment buffer and schedule field.
    pub fn state_dict(&self) -> BTreeMap<String, f64> {
        let mut state = BTreeMap::new();
        state.insert("lr".to_string(), self.config.lr);
        state.insert("initial_lr".to_string(), self.initial_lr);
        state.insert("step".to_string(), self.step as f64);
        state.insert("exp_avg".to_string(), self.exp_avg);
        state.insert("exp_avg_sq".to_string(), self.exp_avg_sq);
        state.insert("max_exp_avg_sq".to_string(), self.max_exp_avg_sq);
        if let Some(buffer) = self.momentum_buffer {
            state.insert("momentum_buffer".to_string(), buffer);
        }
        state
    }

    pub fn load_state_dict(&mut self, state: &BTreeMap<String, f64>) -> PureResult<()> {
        let field = |name: &str| -> PureResult<f64> {
            state
                .get(name)
                .copied()
                .ok_or_else(|| TensorError::MissingParameter {
                    name: name.to_string(),
                })
        };
        let step = field("step")?;
        if !(step >= 0.0) || step.fract() != 0.0 {
            return Err(TensorError::InvalidValue {
                label: "optimizer_state_step",
            });
        }
        self.set_lr(field("lr")?)?;
        self.initial_lr = field("initial_lr")?;
        self.step = step as u64;
        self.exp_avg = field("exp_avg")?;
        self.exp_avg_sq = field("exp_avg_sq")?;
        self.max_exp_avg_sq = field("max_exp_avg_sq")?;
        self.momentum_buffer = state.get("momentum_buffer").copied();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_kinds_only() {
        assert_eq!("AdamW".parse::<OptimizerKind>().unwrap(), OptimizerKind::AdamW);
        assert_eq!("amsgrad".parse::<OptimizerKind>().unwrap(), OptimizerKind::AmsGrad);
        let err = "rmsprop".parse::<OptimizerKind>().unwrap_err();
        assert!(matches!(err, TensorError::UnsupportedOptimizerKind { ref kind } if kind == "rmsprop"));
    }

    #[test]
    fn sgd_with_momentum_accumulates() {
        let config = OptimizerConfig::new(OptimizerKind::Sgd, 0.1).with_momentum(0.5);
        let mut opt = ScalarOptimizer::new(config).unwrap();
        let mut param = 1.0;
        opt.step(&mut param, 1.0);
        assert!((param - 0.9).abs() < 1e-12);
        opt.step(&mut param, 1.0);
        // buffer = 0.5 * 1 + 1
        assert!((param - 0.75).abs() < 1e-12);
    }

    #[test]
    fn first_adam_step_moves_by_lr() {
        for kind in [OptimizerKind::Adam, OptimizerKind::AmsGrad, OptimizerKind::AdamW] {
            let mut opt = ScalarOptimizer::new(OptimizerConfig::new(kind, 0.1)).unwrap();
            let mut param = 0.0;
            opt.step(&mut param, 0.25);
            assert!((param + 0.1).abs() < 1e-6, "{kind}: {param}");
        }
    }

    #[test]
    fn adamw_decays_before_the_update() {
        let config = OptimizerConfig::new(OptimizerKind::AdamW, 0.1).with_weight_decay(0.5);
        let mut opt = ScalarOptimizer::new(config).unwrap();
        let mut param = 2.0;
        opt.step(&mut param, 0.0);
        assert!((param - 1.9).abs() < 1e-12);
    }

    #[test]
    fn amsgrad_keeps_the_running_max() {
        let mut opt =
            ScalarOptimizer::new(OptimizerConfig::new(OptimizerKind::AmsGrad, 0.01)).unwrap();
        let mut param = 0.0;
        opt.step(&mut param, 10.0);
        opt.step(&mut param, 0.0);
        let state = opt.state_dict();
        assert!(state["max_exp_avg_sq"] > state["exp_avg_sq"]);
    }

    #[test]
    fn rejects_invalid_hyperparameters() {
        assert!(ScalarOptimizer::new(OptimizerConfig::new(OptimizerKind::Sgd, 0.0)).is_err());
        let config = OptimizerConfig::new(OptimizerKind::Sgd, 0.1).with_weight_decay(-1.0);
        assert!(ScalarOptimizer::new(config).is_err());
    }

    #[test]
    fn state_round_trip_restores_moments() {
        let config = OptimizerConfig::new(OptimizerKind::Sgd, 0.1).with_momentum(0.9);
        let mut opt = ScalarOptimizer::new(config).unwrap();
        let mut param = 0.0;
        for grad in [0.3, -0.1, 0.7] {
            opt.step(&mut param, grad);
        }
        let mut restored = ScalarOptimizer::new(config).unwrap();
        restored.load_state_dict(&opt.state_dict()).unwrap();
        assert_eq!(restored, opt);

        let mut partial = opt.state_dict();
        partial.remove("exp_avg");
        assert!(restored.load_state_dict(&partial).is_err());
    }
}
