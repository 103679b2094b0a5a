//! Process-level configuration for braid training runs: seeding policy,
//! tracing bootstrap and layered TOML/JSON run files.

pub mod determinism;
pub mod layered;
pub mod tracing;

pub use layered::{ConfigLayering, LayeredConfig, LayeredConfigError};
