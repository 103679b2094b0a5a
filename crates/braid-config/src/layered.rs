// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Run configuration files, merged base (TOML) then run (JSON).
#[derive(Clone, Debug, Default)]
pub struct ConfigLayering {
    pub base: Option<PathBuf>,
    pub run: Option<PathBuf>,
}

impl ConfigLayering {
    /// Discovers layers from `BRAID_CONFIG_BASE`, `BRAID_CONFIG_RUN`, or
    /// `base.toml` / `run.json` under `BRAID_CONFIG_ROOT` (default `.`).
    /// Missing files are skipped.
    pub fn discover() -> Self {
        let root = std::env::var("BRAID_CONFIG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let base = std::env::var("BRAID_CONFIG_BASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| root.join("base.toml"));
        let run = std::env::var("BRAID_CONFIG_RUN")
            .map(PathBuf::from)
            .unwrap_or_else(|_| root.join("run.json"));

        ConfigLayering {
            base: existing_path(base),
            run: existing_path(run),
        }
    }

    pub fn with_base<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.base = Some(path.into());
        self
    }

    pub fn with_run<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.run = Some(path.into());
        self
    }
}

fn existing_path(path: PathBuf) -> Option<PathBuf> {
    path.exists().then_some(path)
}

/// Merged configuration tree.
#[derive(Clone, Debug)]
pub struct LayeredConfig {
    layering: ConfigLayering,
    value: Value,
}

impl LayeredConfig {
    /// Loads and merges the configured layers. Later layers override scalar
    /// leaves and extend tables.
    pub fn load(layering: ConfigLayering) -> Result<Self, LayeredConfigError> {
        let mut value = Value::Object(Default::default());
        if let Some(path) = layering.base.as_ref() {
            if let Some(layer) = load_toml(path)? {
                merge(&mut value, &layer);
            }
        }
        if let Some(path) = layering.run.as_ref() {
            if let Some(layer) = load_json(path)? {
                merge(&mut value, &layer);
            }
        }
        Ok(LayeredConfig { layering, value })
    }

    /// Configuration built from an in-memory TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, LayeredConfigError> {
        let parsed: toml::Value =
            toml::from_str(text).map_err(|source| LayeredConfigError::Toml {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        let value = serde_json::to_value(parsed).map_err(|source| LayeredConfigError::Json {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Ok(LayeredConfig {
            layering: ConfigLayering::default(),
            value,
        })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn layering(&self) -> &ConfigLayering {
        &self.layering
    }

    /// Typed view of a nested section, `None` when any key on the path is absent.
    pub fn section<T>(&self, path: &[&str]) -> Result<Option<T>, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        let mut node = &self.value;
        for key in path {
            match node {
                Value::Object(map) => match map.get(*key) {
                    Some(value) => node = value,
                    None => return Ok(None),
                },
                _ => return Ok(None),
            }
        }
        serde_json::from_value(node.clone()).map(Some)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LayeredConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML {path:?}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse JSON {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn read_layer(path: &Path) -> Result<Option<String>, LayeredConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .map_err(|source| LayeredConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_toml(path: &Path) -> Result<Option<Value>, LayeredConfigError> {
    let Some(text) = read_layer(path)? else {
        return Ok(None);
    };
    let value: toml::Value = toml::from_str(&text).map_err(|source| LayeredConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::to_value(value)
        .map(Some)
        .map_err(|source| LayeredConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
}

fn load_json(path: &Path) -> Result<Option<Value>, LayeredConfigError> {
    let Some(text) = read_layer(path)? else {
        return Ok(None);
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| LayeredConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
}

fn merge(dest: &mut Value, src: &Value) {
    match (dest, src) {
        (Value::Object(dest_map), Value::Object(src_map)) => {
            for (key, value) in src_map {
                match dest_map.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        dest_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dest_slot, src_value) => {
            *dest_slot = src_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Srl {
        optim: String,
        lr: f64,
        #[serde(default)]
        momentum: f64,
    }

    #[test]
    fn run_layer_overrides_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.toml");
        fs::write(
            &base,
            r#"
            [srl]
            optim = "adam"
            lr = 0.1
            momentum = 0.9
            "#,
        )
        .unwrap();
        let run = dir.path().join("run.json");
        fs::write(&run, r#"{"srl":{"optim":"sgd"}}"#).unwrap();

        let layering = ConfigLayering::default().with_base(&base).with_run(&run);
        let merged = LayeredConfig::load(layering).unwrap();
        let srl: Srl = merged.section(&["srl"]).unwrap().unwrap();
        assert_eq!(
            srl,
            Srl {
                optim: "sgd".into(),
                lr: 0.1,
                momentum: 0.9
            }
        );
    }

    #[test]
    fn missing_sections_are_none() {
        let merged = LayeredConfig::from_toml_str("[trainer]\nepochs = 3\n").unwrap();
        let srl: Option<Srl> = merged.section(&["srl"]).unwrap();
        assert!(srl.is_none());
    }

    #[test]
    fn malformed_toml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.toml");
        fs::write(&base, "[srl\noptim=").unwrap();
        let err = LayeredConfig::load(ConfigLayering::default().with_base(&base)).unwrap_err();
        assert!(matches!(err, LayeredConfigError::Toml { .. }));
    }
}
