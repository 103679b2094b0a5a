// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::braid::BraidNet;
use crate::dataset::PairDataset;
use crate::io;
use crate::layers::PartitionBook;
use crate::srl::{PairSampler, RateAdaptiveLoss, SrlSettings};
use crate::{PureResult, TensorError};
use braid_config::layered::LayeredConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// `[trainer]` section of a run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    pub batch_size: usize,
    pub steps_per_epoch: usize,
    pub lr: f32,
    pub print_freq: usize,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            steps_per_epoch: 100,
            lr: 0.01,
            print_freq: 10,
        }
    }
}

impl TrainerSettings {
    pub fn from_config(config: &LayeredConfig) -> PureResult<Self> {
        let section = config
            .section::<TrainerSettings>(&["trainer"])
            .map_err(|err| TensorError::SerializationError {
                message: err.to_string(),
            })?;
        Ok(section.unwrap_or_default())
    }
}

/// Summary of one pass over `steps_per_epoch` batches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub steps: usize,
    pub mean_loss: f32,
    pub rate: f64,
    pub positive_loss: f32,
    pub negative_loss: f32,
}

/// Pair-verification training loop with a learned sample rate: draw pairs,
/// score them, feed the loss gap back to the sampler, then update the net.
pub struct PairTrainer {
    net: BraidNet,
    sampler: Box<dyn PairSampler>,
    criterion: RateAdaptiveLoss,
    dataset: PairDataset,
    settings: TrainerSettings,
    epoch: usize,
}

impl core::fmt::Debug for PairTrainer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "PairTrainer(sampler={},epoch={},criterion={:?})",
            self.sampler.name(),
            self.epoch,
            self.criterion.controller()
        )
    }
}

impl PairTrainer {
    /// Binds a rate-adaptive criterion to `sampler`. Fails with
    /// `InvalidSamplerType` when the sampler exposes no rate.
    pub fn new(
        net: BraidNet,
        sampler: Box<dyn PairSampler>,
        dataset: PairDataset,
        srl: &SrlSettings,
        settings: TrainerSettings,
    ) -> PureResult<Self> {
        if settings.batch_size == 0 || settings.steps_per_epoch == 0 {
            return Err(TensorError::EmptyInput("trainer_settings"));
        }
        if !(settings.lr > 0.0) || !settings.lr.is_finite() {
            return Err(TensorError::NonPositiveLearningRate { rate: settings.lr });
        }
        let criterion = RateAdaptiveLoss::from_settings(sampler.as_ref(), srl)?;
        Ok(Self {
            net,
            sampler,
            criterion,
            dataset,
            settings,
            epoch: 0,
        })
    }

    pub fn net(&self) -> &BraidNet {
        &self.net
    }

    pub fn criterion(&self) -> &RateAdaptiveLoss {
        &self.criterion
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    /// Number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// One optimisation step. Returns the aggregate loss.
    pub fn train_step(&mut self) -> PureResult<f32> {
        let pairs = self.sampler.sample_batch(self.settings.batch_size)?;
        let batch = self.dataset.gather(&pairs)?;
        let book = PartitionBook::from_labels(&batch.labels, 2)?;
        self.net.set_training(true);
        self.net.bind_partitions(&book);
        let scores = self.net.forward(&batch.pair)?;
        let breakdown = self.criterion.compute(&scores, &batch.targets)?;
        let grad = self.criterion.grad(&scores, &batch.targets)?;
        self.net.zero_accumulators()?;
        self.net.backward(&grad)?;
        self.net.correct_gradients()?;
        self.net.apply_step(self.settings.lr)?;
        Ok(breakdown.loss)
    }

    pub fn train_epoch(&mut self) -> PureResult<EpochStats> {
        let epoch = self.epoch + 1;
        let steps = self.settings.steps_per_epoch;
        let mut total = 0.0f64;
        for step in 0..steps {
            let loss = self.train_step()?;
            total += loss as f64;
            if self.settings.print_freq > 0 && (step + 1) % self.settings.print_freq == 0 {
                tracing::debug!(
                    epoch,
                    step = step + 1,
                    steps,
                    loss,
                    mean_loss = total / (step + 1) as f64,
                    rate = self.criterion.controller().rate(),
                    "train step"
                );
            }
        }
        let (positive_loss, negative_loss) =
            self.criterion.recent_losses().unwrap_or((f32::NAN, f32::NAN));
        let stats = EpochStats {
            epoch,
            steps,
            mean_loss: (total / steps as f64) as f32,
            rate: self.criterion.controller().rate(),
            positive_loss,
            negative_loss,
        };
        self.epoch = epoch;
        tracing::info!(
            epoch,
            mean_loss = stats.mean_loss,
            rate = stats.rate,
            lr = self.settings.lr,
            "epoch finished"
        );
        Ok(stats)
    }

    /// Writes the net parameters and the controller state for the current
    /// epoch into `dir`.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, dir: P) -> PureResult<PathBuf> {
        let dir = dir.as_ref();
        io::save_state_dict_bincode(
            &self.net.state_dict()?,
            dir.join(format!("braid_net_ep{}.bin", self.epoch)),
        )?;
        let path = dir.join(io::srl_checkpoint_name(self.epoch));
        io::save_srl_state_json(&self.criterion.state_dict(), Some(self.epoch), &path)?;
        Ok(path)
    }

    /// Restores the latest checkpoint in `dir`, if any. Returns its epoch.
    pub fn resume<P: AsRef<Path>>(&mut self, dir: P) -> PureResult<Option<usize>> {
        let dir = dir.as_ref();
        let Some((epoch, path)) = io::latest_srl_checkpoint(dir)? else {
            return Ok(None);
        };
        let net_state = io::load_state_dict_bincode(dir.join(format!("braid_net_ep{epoch}.bin")))?;
        self.net.load_state_dict(&net_state)?;
        self.criterion
            .load_state_dict(&io::load_srl_state_json(&path)?)?;
        self.epoch = epoch;
        tracing::info!(epoch, rate = self.criterion.controller().rate(), "resumed from checkpoint");
        Ok(Some(epoch))
    }
}
