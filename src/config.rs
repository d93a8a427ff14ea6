//! Dual-format solver configuration: a structured JSON document attempted
//! first, falling back to a permissive line-oriented `key: value` format.

use std::{fs, str::FromStr};

use log::{debug, info};
use serde::Deserialize;

use crate::{
    Error, Result,
    backend::{OptimizerBackend, dense::DenseOptimizer},
};

/// The fixed set of optimizer implementations a config may name.
///
/// Resolution is case-insensitive; an unrecognized name is a fatal
/// configuration error, never a silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Nesterov,
    Adagrad,
    Rmsprop,
    Adadelta,
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "nesterov" => Ok(OptimizerKind::Nesterov),
            "adagrad" => Ok(OptimizerKind::Adagrad),
            "rmsprop" => Ok(OptimizerKind::Rmsprop),
            "adadelta" => Ok(OptimizerKind::Adadelta),
            "adam" => Ok(OptimizerKind::Adam),
            _ => Err(Error::UnknownOptimizer(s.to_string())),
        }
    }
}

/// The resolved {backend, optimizer, solver descriptor} triple.
///
/// Valid iff all three fields are non-empty; immutable once resolved.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct SolverConfig {
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub optimizer: String,
    #[serde(default)]
    pub solver_file: String,
}

impl SolverConfig {
    pub fn is_valid(&self) -> bool {
        !self.backend.is_empty() && !self.optimizer.is_empty() && !self.solver_file.is_empty()
    }

    /// Parses a config file, trying JSON first and falling back to the
    /// permissive line format. Fails fatally if any required field is empty
    /// after both attempts.
    pub fn load(config_file: &str) -> Result<Self> {
        let text = fs::read_to_string(config_file)?;

        let config = match serde_json::from_str::<SolverConfig>(&text) {
            Ok(config) => config,
            Err(_) => {
                debug!("config {config_file} is not structured, using permissive parser");
                Self::parse_permissive(&text)
            }
        };

        if !config.is_valid() {
            return Err(Error::InvalidConfig {
                path: config_file.to_string(),
            });
        }

        Ok(config)
    }

    /// Line-oriented fallback parser: blank lines and `#` comments skipped,
    /// split at the first `:`, keys lower-cased, one layer of matching quotes
    /// stripped from values, unknown keys ignored.
    fn parse_permissive(text: &str) -> Self {
        let mut config = SolverConfig::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                continue;
            };

            let key = key.trim().to_lowercase();
            let value = strip_quotes(value.trim()).to_string();

            match key.as_str() {
                "backend" => config.backend = value,
                "optimizer" => config.optimizer = value,
                "solver_file" => config.solver_file = value,
                _ => {}
            }
        }

        config
    }
}

fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        if (first == b'"' || first == b'\'') && bytes[bytes.len() - 1] == first {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Constructs the concrete optimizer named by the config.
///
/// Backend dispatch is a closed set; both an unrecognized backend and an
/// unrecognized optimizer name fail here, at construction time.
pub fn build_optimizer(
    config: &SolverConfig,
    async_mode: bool,
) -> Result<Box<dyn OptimizerBackend>> {
    match config.backend.to_lowercase().as_str() {
        "dense" => {
            let kind: OptimizerKind = config.optimizer.parse()?;
            info!(
                "building dense {:?} optimizer from {}",
                kind, config.solver_file
            );
            let optimizer = DenseOptimizer::from_descriptor(&config.solver_file, kind, async_mode)?;
            Ok(Box::new(optimizer))
        }
        _ => Err(Error::UnknownBackend(config.backend.clone())),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write_temp(name: &str, contents: &str) -> String {
        let path = std::env::temp_dir().join(format!("policy_net_{}_{name}", std::process::id()));
        fs::write(&path, contents).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn loads_structured_config() {
        let path = write_temp(
            "cfg_json",
            r#"{ "backend": "dense", "optimizer": "adam", "solver_file": "solver.json" }"#,
        );
        let config = SolverConfig::load(&path).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(config.backend, "dense");
        assert_eq!(config.optimizer, "adam");
        assert_eq!(config.solver_file, "solver.json");
    }

    #[test]
    fn permissive_and_structured_resolve_identically() {
        let structured = write_temp(
            "cfg_a",
            r#"{ "backend": "dense", "optimizer": "adam", "solver_file": "solver.json" }"#,
        );
        // Different key order, comments, whitespace and quoting.
        let permissive = write_temp(
            "cfg_b",
            "# solver selection\n\
             solver_file: 'solver.json'\n\
             \n\
             OPTIMIZER:   \"adam\"\n\
             backend: dense\n",
        );

        let a = SolverConfig::load(&structured).unwrap();
        let b = SolverConfig::load(&permissive).unwrap();
        fs::remove_file(&structured).ok();
        fs::remove_file(&permissive).ok();

        assert_eq!(a, b);
    }

    #[test]
    fn missing_field_is_fatal() {
        let path = write_temp("cfg_missing", "backend: dense\noptimizer: sgd\n");
        let err = SolverConfig::load(&path).unwrap_err();
        fs::remove_file(&path).ok();

        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn optimizer_kind_is_case_insensitive() {
        assert_eq!("SGD".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert_eq!(
            "NesTeroV".parse::<OptimizerKind>().unwrap(),
            OptimizerKind::Nesterov
        );
    }

    #[test]
    fn bogus_optimizer_never_defaults() {
        let err = "bogus".parse::<OptimizerKind>().unwrap_err();
        assert!(matches!(err, Error::UnknownOptimizer(name) if name == "bogus"));
    }

    #[test]
    fn unknown_backend_is_fatal() {
        let config = SolverConfig {
            backend: "tensor9000".to_string(),
            optimizer: "sgd".to_string(),
            solver_file: "solver.json".to_string(),
        };

        let err = build_optimizer(&config, false).err().unwrap();
        assert!(matches!(err, Error::UnknownBackend(name) if name == "tensor9000"));
    }

    #[test]
    fn strips_one_quote_layer_only() {
        assert_eq!(strip_quotes("\"abc\""), "abc");
        assert_eq!(strip_quotes("'abc'"), "abc");
        assert_eq!(strip_quotes("\"'abc'\""), "'abc'");
        assert_eq!(strip_quotes("abc"), "abc");
        assert_eq!(strip_quotes("\"abc'"), "\"abc'");
    }
}
