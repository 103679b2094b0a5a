use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

const DEFAULT_SEED: u64 = 42;

/// Process-wide seeding policy for weight initialisation and pair sampling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterminismConfig {
    /// Whether label-derived seeds replace host entropy.
    pub enabled: bool,
    /// Base seed mixed into every label-derived seed.
    pub base_seed: u64,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_seed: DEFAULT_SEED,
        }
    }
}

impl DeterminismConfig {
    /// Deterministic configuration pinned to `base_seed`.
    pub fn seeded(base_seed: u64) -> Self {
        Self {
            enabled: true,
            base_seed,
        }
    }

    /// Reads `BRAID_DETERMINISTIC` and `BRAID_DETERMINISTIC_SEED`.
    fn from_env() -> Self {
        let enabled = std::env::var("BRAID_DETERMINISTIC")
            .ok()
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        let base_seed = std::env::var("BRAID_DETERMINISTIC_SEED")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_SEED);
        Self { enabled, base_seed }
    }

    /// Derives a stable seed for a component label such as `"sampler/pairs"`.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.base_seed.hash(&mut hasher);
        label.hash(&mut hasher);
        hasher.finish()
    }
}

fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim(),
        "" | "0" | "false" | "False" | "FALSE" | "off" | "OFF" | "no"
    )
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Returns the lazily initialised configuration.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(DeterminismConfig::from_env)
}

/// Installs `cfg` unless a configuration was already read. Returns the active one.
pub fn configure(cfg: DeterminismConfig) -> &'static DeterminismConfig {
    CONFIG.get_or_init(|| cfg)
}

/// RNG for a component label. Falls back to host entropy when determinism is off.
pub fn rng_from_label(label: &str) -> StdRng {
    let cfg = config();
    if cfg.enabled {
        StdRng::seed_from_u64(cfg.seed_for(label))
    } else {
        StdRng::from_entropy()
    }
}

/// RNG seeded from an explicit seed, or from the label policy when `seed` is `None`.
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => rng_from_label(label),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
    use std::sync::{Mutex, OnceLock};

    fn with_env(vars: &[(&str, Option<&str>)], test: impl FnOnce()) {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        let _lock = GUARD.get_or_init(|| Mutex::new(())).lock().unwrap();

        let snapshot: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, value)| {
                let previous = std::env::var(key).ok();
                match value {
                    Some(val) => std::env::set_var(key, val),
                    None => std::env::remove_var(key),
                }
                ((*key).to_string(), previous)
            })
            .collect();

        let result = catch_unwind(AssertUnwindSafe(test));

        for (key, value) in snapshot {
            match value {
                Some(val) => std::env::set_var(&key, val),
                None => std::env::remove_var(&key),
            }
        }

        if let Err(err) = result {
            resume_unwind(err);
        }
    }

    #[test]
    fn environment_defaults_disable_determinism() {
        with_env(
            &[
                ("BRAID_DETERMINISTIC", None),
                ("BRAID_DETERMINISTIC_SEED", None),
            ],
            || {
                let cfg = DeterminismConfig::from_env();
                assert_eq!(cfg, DeterminismConfig::default());
            },
        );
    }

    #[test]
    fn environment_seed_is_honoured() {
        with_env(
            &[
                ("BRAID_DETERMINISTIC", Some("1")),
                ("BRAID_DETERMINISTIC_SEED", Some("1337")),
            ],
            || {
                let cfg = DeterminismConfig::from_env();
                assert_eq!(cfg, DeterminismConfig::seeded(1337));
            },
        );
    }

    #[test]
    fn textual_false_keeps_entropy() {
        with_env(&[("BRAID_DETERMINISTIC", Some("off"))], || {
            assert!(!DeterminismConfig::from_env().enabled);
        });
    }

    #[test]
    fn label_seeds_are_stable_and_distinct() {
        let cfg = DeterminismConfig::seeded(99);
        assert_eq!(cfg.seed_for("sampler"), cfg.seed_for("sampler"));
        assert_ne!(cfg.seed_for("sampler"), cfg.seed_for("init"));
    }

    #[test]
    fn explicit_seed_wins_over_policy() {
        let mut a = rng_from_optional(Some(7), "any");
        let mut b = rng_from_optional(Some(7), "other");
        assert_eq!(a.gen::<u64>(), b.gen::<u64>());
    }
}
