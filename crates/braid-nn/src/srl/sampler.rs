// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, TensorError};
use braid_config::determinism;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Receiver of the learned positive-pair rate.
pub trait RateUpdatable {
    fn update(&mut self, rate: f64);
}

/// Shared positive-pair rate. Clones observe the same value, so a loader
/// thread can read what the training thread last pushed.
#[derive(Debug, Clone)]
pub struct RateHandle(Arc<AtomicU64>);

impl RateHandle {
    pub fn new(rate: f64) -> Self {
        let rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.5 };
        Self(Arc::new(AtomicU64::new(rate.to_bits())))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Stores `rate` clamped to `[0, 1]`. NaN is ignored.
    pub fn set(&self, rate: f64) {
        if rate.is_nan() {
            tracing::warn!("ignoring NaN sample rate");
            return;
        }
        self.0.store(rate.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }
}

impl RateUpdatable for RateHandle {
    fn update(&mut self, rate: f64) {
        self.set(rate);
    }
}

/// Draws batches of index pairs over a labelled dataset.
pub trait PairSampler {
    fn name(&self) -> &str;

    fn sample_batch(&mut self, batch_size: usize) -> PureResult<Vec<(usize, usize)>>;

    /// Rate capability. Samplers without one cannot be driven by a
    /// [`crate::srl::SampleRateController`].
    fn rate_handle(&self) -> Option<RateHandle> {
        None
    }
}

/// Identity bookkeeping shared by the samplers.
#[derive(Debug, Clone)]
struct PairIndex {
    by_identity: Vec<Vec<usize>>,
    with_pairs: Vec<usize>,
    len: usize,
}

impl PairIndex {
    fn new(identities: &[usize]) -> PureResult<Self> {
        if identities.len() < 2 {
            return Err(TensorError::EmptyInput("pair_sampler_identities"));
        }
        let mut grouped: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (idx, &pid) in identities.iter().enumerate() {
            grouped.entry(pid).or_default().push(idx);
        }
        let by_identity: Vec<Vec<usize>> = grouped.into_values().collect();
        let with_pairs = by_identity
            .iter()
            .enumerate()
            .filter(|(_, members)| members.len() >= 2)
            .map(|(group, _)| group)
            .collect();
        Ok(Self {
            by_identity,
            with_pairs,
            len: identities.len(),
        })
    }

    fn positive(&self, rng: &mut StdRng) -> PureResult<(usize, usize)> {
        let group = self
            .with_pairs
            .choose(rng)
            .ok_or(TensorError::EmptyInput("pair_sampler_positive_identities"))?;
        let members = &self.by_identity[*group];
        let first = rng.gen_range(0..members.len());
        let mut second = rng.gen_range(0..members.len() - 1);
        if second >= first {
            second += 1;
        }
        Ok((members[first], members[second]))
    }

    fn negative(&self, rng: &mut StdRng) -> PureResult<(usize, usize)> {
        let groups = self.by_identity.len();
        if groups < 2 {
            return Err(TensorError::EmptyInput("pair_sampler_negative_identities"));
        }
        let first = rng.gen_range(0..groups);
        let mut second = rng.gen_range(0..groups - 1);
        if second >= first {
            second += 1;
        }
        let a = &self.by_identity[first];
        let b = &self.by_identity[second];
        Ok((a[rng.gen_range(0..a.len())], b[rng.gen_range(0..b.len())]))
    }
}

fn check_batch(batch_size: usize) -> PureResult<()> {
    if batch_size == 0 {
        return Err(TensorError::EmptyInput("pair_sampler_batch"));
    }
    Ok(())
}

/// Uniform pairs of distinct samples. Has no rate capability.
#[derive(Debug)]
pub struct RandomPairSampler {
    index: PairIndex,
    rng: StdRng,
}

impl RandomPairSampler {
    pub fn new(identities: &[usize], seed: Option<u64>) -> PureResult<Self> {
        Ok(Self {
            index: PairIndex::new(identities)?,
            rng: determinism::rng_from_optional(seed, "random_pair_sampler"),
        })
    }
}

impl PairSampler for RandomPairSampler {
    fn name(&self) -> &str {
        "RandomPairSampler"
    }

    fn sample_batch(&mut self, batch_size: usize) -> PureResult<Vec<(usize, usize)>> {
        check_batch(batch_size)?;
        let len = self.index.len;
        Ok((0..batch_size)
            .map(|_| {
                let first = self.rng.gen_range(0..len);
                let mut second = self.rng.gen_range(0..len - 1);
                if second >= first {
                    second += 1;
                }
                (first, second)
            })
            .collect())
    }
}

/// Each pair is positive with probability equal to the current rate.
#[derive(Debug)]
pub struct SampleRateSampler {
    index: PairIndex,
    rate: RateHandle,
    rng: StdRng,
}

impl SampleRateSampler {
    pub fn new(identities: &[usize], seed: Option<u64>) -> PureResult<Self> {
        Ok(Self {
            index: PairIndex::new(identities)?,
            rate: RateHandle::new(0.5),
            rng: determinism::rng_from_optional(seed, "sample_rate_sampler"),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate.get()
    }
}

impl RateUpdatable for SampleRateSampler {
    fn update(&mut self, rate: f64) {
        self.rate.set(rate);
    }
}

impl PairSampler for SampleRateSampler {
    fn name(&self) -> &str {
        "SampleRateSampler"
    }

    fn sample_batch(&mut self, batch_size: usize) -> PureResult<Vec<(usize, usize)>> {
        check_batch(batch_size)?;
        let rate = self.rate.get();
        (0..batch_size)
            .map(|_| {
                if self.rng.gen_bool(rate) {
                    self.index.positive(&mut self.rng)
                } else {
                    self.index.negative(&mut self.rng)
                }
            })
            .collect()
    }

    fn rate_handle(&self) -> Option<RateHandle> {
        Some(self.rate.clone())
    }
}

/// Exactly `round(rate * batch)` positive pairs per batch, shuffled.
#[derive(Debug)]
pub struct SampleRateBatchSampler {
    index: PairIndex,
    rate: RateHandle,
    rng: StdRng,
}

impl SampleRateBatchSampler {
    pub fn new(identities: &[usize], seed: Option<u64>) -> PureResult<Self> {
        Ok(Self {
            index: PairIndex::new(identities)?,
            rate: RateHandle::new(0.5),
            rng: determinism::rng_from_optional(seed, "sample_rate_batch_sampler"),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate.get()
    }

    pub fn positives_for(&self, batch_size: usize) -> usize {
        ((self.rate.get() * batch_size as f64).round() as usize).min(batch_size)
    }
}

impl RateUpdatable for SampleRateBatchSampler {
    fn update(&mut self, rate: f64) {
        self.rate.set(rate);
    }
}

impl PairSampler for SampleRateBatchSampler {
    fn name(&self) -> &str {
        "SampleRateBatchSampler"
    }

    fn sample_batch(&mut self, batch_size: usize) -> PureResult<Vec<(usize, usize)>> {
        check_batch(batch_size)?;
        let positives = self.positives_for(batch_size);
        let mut pairs = Vec::with_capacity(batch_size);
        for _ in 0..positives {
            pairs.push(self.index.positive(&mut self.rng)?);
        }
        for _ in positives..batch_size {
            pairs.push(self.index.negative(&mut self.rng)?);
        }
        pairs.shuffle(&mut self.rng);
        Ok(pairs)
    }

    fn rate_handle(&self) -> Option<RateHandle> {
        Some(self.rate.clone())
    }
}
