use braid_nn::optim::{OptimizerConfig, OptimizerKind};
use braid_nn::srl::{RateAdaptiveLoss, RateHandle, SampleRateController};
use braid_nn::{io, ElementwiseLoss, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

const KINDS: [OptimizerKind; 4] = [
    OptimizerKind::Sgd,
    OptimizerKind::Adam,
    OptimizerKind::AmsGrad,
    OptimizerKind::AdamW,
];

fn controller(config: OptimizerConfig) -> (SampleRateController, RateHandle) {
    let handle = RateHandle::new(0.5);
    let controller = SampleRateController::new(Box::new(handle.clone()), config).unwrap();
    (controller, handle)
}

fn sgd(lr: f64) -> OptimizerConfig {
    OptimizerConfig::new(OptimizerKind::Sgd, lr)
}

fn rate_loss(normalise: bool) -> (RateAdaptiveLoss, RateHandle) {
    let (controller, handle) = controller(sgd(1.0));
    (
        RateAdaptiveLoss::new(controller, ElementwiseLoss::BinaryCrossEntropy, normalise),
        handle,
    )
}

#[derive(Clone)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn with_captured_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink = Capture(buffer.clone());
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || sink.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let out = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    (out, logs)
}

#[test]
fn rate_stays_strictly_inside_the_unit_interval() {
    let mut rng = StdRng::seed_from_u64(17);
    for kind in KINDS {
        let (mut controller, handle) = controller(OptimizerConfig::new(kind, 0.5));
        for step in 0..3000 {
            // long runs of one sign push the logit far out
            let signal = if step < 1500 {
                rng.gen_range(10.0..1e4)
            } else {
                rng.gen_range(-1e4..1e4)
            };
            controller.step(signal);
            let rate = controller.rate();
            assert!(rate > 0.0 && rate < 1.0, "{kind}: rate {rate} at step {step}");
            assert_eq!(handle.get(), rate);
        }
    }
}

#[test]
fn nan_step_is_a_bit_identical_no_op() {
    for kind in KINDS {
        let (mut controller, handle) = controller(OptimizerConfig::new(kind, 0.1));
        controller.step(0.7);
        controller.step(-0.2);
        let alpha = controller.alpha().to_bits();
        let rate = controller.rate().to_bits();
        let state = controller.state_dict();
        let pushed = handle.get().to_bits();

        let (applied, logs) = with_captured_logs(|| controller.step(f64::NAN));
        assert!(!applied);
        assert!(logs.contains("skipping sample-rate update"), "{logs}");
        assert_eq!(controller.alpha().to_bits(), alpha);
        assert_eq!(controller.rate().to_bits(), rate);
        assert_eq!(handle.get().to_bits(), pushed);
        let after = controller.state_dict();
        assert_eq!(after.len(), state.len());
        for (key, value) in &state {
            assert_eq!(after[key].to_bits(), value.to_bits(), "{kind}: {key}");
        }
    }
}

#[test]
fn harder_negatives_lower_the_rate_and_harder_positives_raise_it() {
    let positive = [true, true, false, false];

    let (mut loss, handle) = rate_loss(true);
    loss.aggregate(&[0.2, 0.2, 0.8, 0.8], &positive).unwrap();
    assert!(loss.controller().rate() < 0.5);
    assert_eq!(handle.get(), loss.controller().rate());

    let (mut loss, handle) = rate_loss(true);
    loss.aggregate(&[0.8, 0.8, 0.2, 0.2], &positive).unwrap();
    assert!(loss.controller().rate() > 0.5);
    assert_eq!(handle.get(), loss.controller().rate());
}

#[test]
fn state_round_trip_reproduces_the_trajectory() {
    for kind in KINDS {
        let config = OptimizerConfig::new(kind, 0.05)
            .with_weight_decay(0.01)
            .with_momentum(if kind == OptimizerKind::Sgd { 0.9 } else { 0.0 });
        let mut rng = StdRng::seed_from_u64(99);
        let (mut original, _) = controller(config);
        for _ in 0..50 {
            original.step(rng.gen_range(-3.0..3.0));
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join(io::srl_checkpoint_name(50));
        io::save_srl_state_json(&original.state_dict(), Some(50), &path).unwrap();
        let (mut restored, handle) = controller(config);
        restored
            .load_state_dict(&io::load_srl_state_json(&path).unwrap())
            .unwrap();
        assert_eq!(handle.get().to_bits(), original.rate().to_bits());

        for _ in 0..50 {
            let signal = rng.gen_range(-3.0..3.0);
            original.step(signal);
            restored.step(signal);
            assert_eq!(original.alpha().to_bits(), restored.alpha().to_bits(), "{kind}");
            assert_eq!(original.rate().to_bits(), restored.rate().to_bits(), "{kind}");
        }
        assert_eq!(original.state_dict(), restored.state_dict());
    }
}

#[test]
fn balanced_loss_matches_the_closed_form() {
    let (mut loss, _) = rate_loss(true);
    let mut losses = vec![1.0f32; 3];
    losses.extend(std::iter::repeat(0.0).take(7));
    let positive: Vec<bool> = (0..10).map(|i| i < 3).collect();
    let out = loss.aggregate(&losses, &positive).unwrap();
    assert!((out.loss as f64 - 0.21f64.sqrt()).abs() < 1e-6, "{}", out.loss);
    assert_eq!(out.positive_loss, 1.0);
    assert_eq!(out.negative_loss, 0.0);
    assert_eq!(loss.recent_losses(), Some((1.0, 0.0)));
}

#[test]
fn all_negative_batch_yields_zero_loss_and_keeps_the_rate() {
    let (mut loss, handle) = rate_loss(true);
    let rate = loss.controller().rate();
    let (out, logs) = with_captured_logs(|| {
        loss.aggregate(&[0.3, 0.9, 1.4, 0.1], &[false; 4]).unwrap()
    });
    assert!(out.positive_loss.is_nan());
    assert_eq!(out.loss.to_bits(), 0.0f32.to_bits());
    assert!(logs.contains("positive loss is NaN"), "{logs}");
    assert_eq!(loss.controller().rate().to_bits(), rate.to_bits());
    assert_eq!(handle.get().to_bits(), rate.to_bits());
}

#[test]
fn all_negative_scores_through_compute_leave_the_rate_alone() {
    let (mut loss, handle) = rate_loss(true);
    let rate = handle.get();
    let scores = Tensor::from_vec(4, 1, vec![0.4, -1.2, 2.0, 0.0]).unwrap();
    let labels = Tensor::zeros(4, 1).unwrap();

    let (out, logs) = with_captured_logs(|| loss.compute(&scores, &labels).unwrap());
    assert_eq!(out.positives, 0);
    assert_eq!(out.batch, 4);
    assert!(out.positive_loss.is_nan());
    assert!(out.negative_loss.is_finite() && out.negative_loss > 0.0);
    assert_eq!(out.loss.to_bits(), 0.0f32.to_bits());
    assert!(logs.contains("positive loss is NaN"), "{logs}");
    assert_eq!(loss.controller().rate().to_bits(), rate.to_bits());
    assert_eq!(handle.get().to_bits(), rate.to_bits());

    let grad = loss.grad(&scores, &labels).unwrap();
    assert!(grad.data().iter().all(|g| *g == 0.0));
}

#[test]
fn compute_splits_rows_by_nonzero_label() {
    let (mut loss, handle) = rate_loss(true);
    let scores = Tensor::from_vec(5, 1, vec![1.5, -0.5, 0.3, -2.0, 0.8]).unwrap();
    let labels = Tensor::from_vec(5, 1, vec![1.0, 0.0, 1.0, 0.0, 0.0]).unwrap();
    let per_sample = ElementwiseLoss::BinaryCrossEntropy
        .per_sample(&scores, &labels)
        .unwrap();
    let pos = (per_sample[0] as f64 + per_sample[2] as f64) / 2.0;
    let neg = (per_sample[1] as f64 + per_sample[3] as f64 + per_sample[4] as f64) / 3.0;

    let out = loss.compute(&scores, &labels).unwrap();
    assert_eq!(out.positives, 2);
    assert!((out.positive_loss as f64 - pos).abs() < 1e-6);
    assert!((out.negative_loss as f64 - neg).abs() < 1e-6);
    assert!((out.loss as f64 - (pos + neg) * 0.24f64.sqrt()).abs() < 1e-5);
    assert_eq!(loss.last_breakdown(), Some(&out));
    // one SGD step moves the rate against the harder side
    assert_eq!(handle.get() < 0.5, neg > pos);
}

#[test]
fn unknown_names_fail_fast() {
    assert!(matches!(
        "lion".parse::<OptimizerKind>(),
        Err(braid_nn::TensorError::UnsupportedOptimizerKind { .. })
    ));
    assert!(matches!(
        "focal".parse::<ElementwiseLoss>(),
        Err(braid_nn::TensorError::UnsupportedLossVariant { .. })
    ));
}
