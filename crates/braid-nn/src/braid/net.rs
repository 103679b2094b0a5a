// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{BraidModule, BraidNormKind, BraidPair, FcBlock, FusionHead, LinearBraidBlock};
use crate::layers::{FeatureLayout, PartitionBook};
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::cell::RefCell;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Trace {
    block_inputs: Vec<BraidPair>,
    head_input: BraidPair,
    fc_inputs: Vec<Tensor>,
}

/// Braid blocks, a fusion head, then fully connected blocks producing one
/// score per pair.
pub struct BraidNet {
    blocks: Vec<Box<dyn BraidModule>>,
    head: FusionHead,
    fc: Vec<FcBlock>,
    trace: RefCell<Option<Trace>>,
}

impl core::fmt::Debug for BraidNet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "BraidNet(blocks={},head={:?},fc={})",
            self.blocks.len(),
            self.head.fusion(),
            self.fc.len()
        )
    }
}

impl BraidNet {
    pub fn new(
        blocks: Vec<Box<dyn BraidModule>>,
        head: FusionHead,
        fc: Vec<FcBlock>,
    ) -> PureResult<Self> {
        match fc.last() {
            Some(tail) if tail.is_tail() => {}
            _ => return Err(TensorError::EmptyInput("braid_net_tail")),
        }
        Ok(Self {
            blocks,
            head,
            fc,
            trace: RefCell::new(None),
        })
    }

    /// Stack of linear braid blocks with the given widths, a `SumY` head and a
    /// single-logit tail.
    pub fn linear(
        name: impl Into<String>,
        input_dim: usize,
        widths: &[usize],
        kind: BraidNormKind,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let name = name.into();
        let mut blocks: Vec<Box<dyn BraidModule>> = Vec::with_capacity(widths.len());
        let mut width = input_dim;
        for (idx, &next) in widths.iter().enumerate() {
            let block_seed = seed.map(|s| s.wrapping_add(16 * idx as u64));
            blocks.push(Box::new(LinearBraidBlock::new(
                format!("{name}::braid{idx}"),
                width,
                next,
                kind,
                block_seed,
            )?));
            width = next;
        }
        let head = FusionHead::sum_y(
            format!("{name}::y"),
            FeatureLayout::Flat { features: width },
        )?;
        let tail = FcBlock::new(
            format!("{name}::tail"),
            head.output_dim(),
            1,
            true,
            seed.map(|s| s.wrapping_add(7919)),
        )?;
        Self::new(blocks, head, vec![tail])
    }

    pub fn forward(&self, input: &BraidPair) -> PureResult<Tensor> {
        let mut block_inputs = Vec::with_capacity(self.blocks.len());
        let mut current = input.clone();
        for block in &self.blocks {
            let next = block.forward(&current)?;
            block_inputs.push(current);
            current = next;
        }
        let mut activ = self.head.forward(&current)?;
        let mut fc_inputs = Vec::with_capacity(self.fc.len());
        for fc in &self.fc {
            let next = fc.forward(&activ)?;
            fc_inputs.push(activ);
            activ = next;
        }
        *self.trace.borrow_mut() = Some(Trace {
            block_inputs,
            head_input: current,
            fc_inputs,
        });
        Ok(activ)
    }

    /// Backpropagates `grad_output` (gradient wrt the scores of the last
    /// forward pass) and returns the gradient wrt both input branches.
    pub fn backward(&mut self, grad_output: &Tensor) -> PureResult<BraidPair> {
        let trace = self
            .trace
            .borrow_mut()
            .take()
            .ok_or(TensorError::InvalidValue {
                label: "braid_net_trace",
            })?;
        let mut grad = grad_output.clone();
        for (fc, input) in self.fc.iter_mut().zip(&trace.fc_inputs).rev() {
            grad = fc.backward(input, &grad)?;
        }
        let mut grad_pair = self.head.backward(&trace.head_input, &grad)?;
        for (block, input) in self.blocks.iter_mut().zip(&trace.block_inputs).rev() {
            grad_pair = block.backward(input, &grad_pair)?;
        }
        Ok(grad_pair)
    }

    /// Runs the tied-weight gradient correction of every braid block.
    pub fn correct_gradients(&mut self) -> PureResult<()> {
        for block in &mut self.blocks {
            block.correct_gradients()?;
        }
        Ok(())
    }

    pub fn set_training(&self, training: bool) {
        for block in &self.blocks {
            block.set_training(training);
        }
        self.head.set_training(training);
        for fc in &self.fc {
            fc.set_training(training);
        }
    }

    pub fn bind_partitions(&self, partitions: &PartitionBook) {
        for block in &self.blocks {
            block.bind_partitions(partitions);
        }
    }

    pub fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for block in &self.blocks {
            block.visit_parameters(visitor)?;
        }
        self.head.visit_parameters(visitor)?;
        for fc in &self.fc {
            fc.visit_parameters(visitor)?;
        }
        Ok(())
    }

    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for block in &mut self.blocks {
            block.visit_parameters_mut(visitor)?;
        }
        self.head.visit_parameters_mut(visitor)?;
        for fc in &mut self.fc {
            fc.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    pub fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    pub fn apply_step(&mut self, learning_rate: f32) -> PureResult<()> {
        if learning_rate <= 0.0 || !learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: learning_rate,
            });
        }
        self.visit_parameters_mut(&mut |param| param.apply_step(learning_rate))
    }

    pub fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    pub fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn pair(seed: u64) -> BraidPair {
        BraidPair::new(
            Tensor::random_normal(6, 4, 0.0, 1.0, Some(seed)).unwrap(),
            Tensor::random_normal(6, 4, 0.0, 1.0, Some(seed + 1)).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn scores_are_symmetric_in_the_pair() {
        let net = BraidNet::linear("net", 4, &[5, 3], BraidNormKind::Batch, Some(3)).unwrap();
        let input = pair(10);
        let scores = net.forward(&input).unwrap();
        let swapped = net.forward(&input.clone().swap()).unwrap();
        assert_eq!(scores.shape(), (6, 1));
        for (x, y) in scores.data().iter().zip(swapped.data()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-4);
        }
    }

    #[test]
    fn backward_populates_every_parameter() {
        let mut net = BraidNet::linear("net", 4, &[3], BraidNormKind::Batch, Some(5)).unwrap();
        let input = pair(20);
        let scores = net.forward(&input).unwrap();
        let grad = net.backward(&scores).unwrap();
        assert_eq!(grad.shape(), (6, 4));
        net.visit_parameters(&mut |param| {
            assert!(param.gradient().is_some(), "{} has no gradient", param.name());
            Ok(())
        })
        .unwrap();
        assert!(net.backward(&scores).is_err());
    }

    #[test]
    fn state_dict_round_trips() {
        let source = BraidNet::linear("net", 4, &[3], BraidNormKind::Batch, Some(1)).unwrap();
        let mut target = BraidNet::linear("net", 4, &[3], BraidNormKind::Batch, Some(2)).unwrap();
        target.load_state_dict(&source.state_dict().unwrap()).unwrap();
        assert_eq!(target.state_dict().unwrap(), source.state_dict().unwrap());
    }
}
