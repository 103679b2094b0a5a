// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)

use braid_config::layered::{ConfigLayering, LayeredConfig};
use braid_nn::braid::{BraidNet, BraidNormKind};
use braid_nn::srl::{SampleRateBatchSampler, SrlSettings};
use braid_nn::{PairDataset, PairTrainer, PureResult, Tensor, TrainerSettings};
use std::env;
use std::path::PathBuf;

const IDENTITIES: usize = 16;
const SHOTS: usize = 4;
const FEATURES: usize = 8;

fn main() {
    let mut epochs = 5usize;
    let mut checkpoint: Option<PathBuf> = None;
    let mut seed = 0u64;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--epochs" => epochs = parse_next(&mut args, "--epochs"),
            "--seed" => seed = parse_next(&mut args, "--seed"),
            "--checkpoint" => {
                let Some(path) = args.next() else {
                    eprintln!("braid_srl: --checkpoint requires a directory");
                    std::process::exit(2);
                };
                checkpoint = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                print_help();
                return;
            }
            other => {
                eprintln!("braid_srl: unknown argument '{other}'");
                print_help();
                std::process::exit(2);
            }
        }
    }

    if let Err(err) = braid_config::tracing::init_tracing() {
        eprintln!("braid_srl: {err}");
    }

    let config = LayeredConfig::load(ConfigLayering::discover()).unwrap_or_else(|err| {
        eprintln!("braid_srl: {err}");
        std::process::exit(2);
    });

    if let Err(err) = run(&config, epochs, checkpoint, seed) {
        eprintln!("braid_srl: {err}");
        braid_config::tracing::flush_chrome_trace();
        std::process::exit(1);
    }
    braid_config::tracing::flush_chrome_trace();
}

fn run(
    config: &LayeredConfig,
    epochs: usize,
    checkpoint: Option<PathBuf>,
    seed: u64,
) -> PureResult<()> {
    let srl = SrlSettings::from_config(config)?;
    let settings = TrainerSettings::from_config(config)?;
    let dataset = synthetic_identities(seed)?;
    let sampler = SampleRateBatchSampler::new(dataset.identities(), Some(seed))?;
    let net = BraidNet::linear(
        "braid",
        FEATURES,
        &[16, 8],
        BraidNormKind::ClassConditional { num_classes: 2 },
        Some(seed),
    )?;
    let mut trainer = PairTrainer::new(net, Box::new(sampler), dataset, &srl, settings)?;
    if let Some(dir) = checkpoint.as_ref() {
        std::fs::create_dir_all(dir).map_err(|err| braid_nn::TensorError::IoError {
            message: err.to_string(),
        })?;
        trainer.resume(dir)?;
    }
    for _ in 0..epochs {
        let stats = trainer.train_epoch()?;
        println!(
            "epoch {:>3}  loss {:.6}  rate {:.4}  pos {:.4}  neg {:.4}",
            stats.epoch, stats.mean_loss, stats.rate, stats.positive_loss, stats.negative_loss
        );
        if let Some(dir) = checkpoint.as_ref() {
            trainer.save_checkpoint(dir)?;
        }
    }
    Ok(())
}

/// Noisy samples around one random centre per identity.
fn synthetic_identities(seed: u64) -> PureResult<PairDataset> {
    let centres = Tensor::random_normal(IDENTITIES, FEATURES, 0.0, 1.0, Some(seed))?;
    let noise = Tensor::random_normal(
        IDENTITIES * SHOTS,
        FEATURES,
        0.0,
        0.3,
        Some(seed.wrapping_add(1)),
    )?;
    let identities: Vec<usize> = (0..IDENTITIES * SHOTS).map(|row| row / SHOTS).collect();
    let features = Tensor::from_fn(IDENTITIES * SHOTS, FEATURES, |r, c| {
        centres.row(r / SHOTS)[c] + noise.row(r)[c]
    })?;
    PairDataset::new(features, identities)
}

fn parse_next<T: std::str::FromStr>(args: &mut impl Iterator<Item = String>, flag: &str) -> T {
    let Some(raw) = args.next() else {
        eprintln!("braid_srl: {flag} requires a value");
        std::process::exit(2);
    };
    raw.parse().unwrap_or_else(|_| {
        eprintln!("braid_srl: invalid value '{raw}' for {flag}");
        std::process::exit(2);
    })
}

fn print_help() {
    println!(
        "braid_srl [--epochs N] [--seed S] [--checkpoint DIR]\n\n\
         Trains a linear braid net on synthetic identities with a learned\n\
         positive-pair rate. Reads [srl] and [trainer] from the layered run\n\
         configuration (BRAID_CONFIG_ROOT, BRAID_CONFIG_BASE, BRAID_CONFIG_RUN)."
    );
}
