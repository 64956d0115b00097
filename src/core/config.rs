//! LC-010: Engine configuration.
//!
//! Parses layercalc.yaml and validates structural constraints:
//! - chunk_size must be positive
//! - external_group must be a valid identifier other than the project group
//! - external_parent, when given, must differ from external_group

use super::error::{EngineError, Result};
use super::formula;
use super::store::{Store, DEFAULT_CHUNK_SIZE};
use super::types::PROJECT_GROUP;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default name of the external-input layer.
pub const DEFAULT_EXTERNAL_GROUP: &str = "external_inputs";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// SQLite file; in-memory when absent
    #[serde(default)]
    pub store: Option<PathBuf>,

    /// Rows per bulk-insert statement
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Group receiving pushed values
    #[serde(default = "default_external_group")]
    pub external_group: String,

    /// Group the external layer depends on; project when absent
    #[serde(default)]
    pub external_parent: Option<String>,

    /// JSONL recalculation journal
    #[serde(default)]
    pub journal: Option<PathBuf>,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_external_group() -> String {
    DEFAULT_EXTERNAL_GROUP.to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: None,
            chunk_size: default_chunk_size(),
            external_group: default_external_group(),
            external_parent: None,
            journal: None,
        }
    }
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a layercalc.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    parse_config(&content)
}

/// Parse a layercalc.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<EngineConfig> {
    serde_yaml_ng::from_str(yaml).map_err(|e| EngineError::Config(format!("YAML parse error: {}", e)))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &EngineConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.chunk_size == 0 {
        errors.push(ValidationError {
            message: "chunk_size must be greater than 0".to_string(),
        });
    }

    if !formula::is_identifier(&config.external_group) {
        errors.push(ValidationError {
            message: format!(
                "external_group '{}' is not a valid identifier",
                config.external_group
            ),
        });
    }
    if config.external_group == PROJECT_GROUP {
        errors.push(ValidationError {
            message: format!("external_group must not be '{}'", PROJECT_GROUP),
        });
    }

    if config.external_parent.as_deref() == Some(config.external_group.as_str()) {
        errors.push(ValidationError {
            message: format!("external group '{}' depends on itself", config.external_group),
        });
    }

    errors
}

/// Validate, then open the configured store.
pub fn open_store(config: &EngineConfig) -> Result<Store> {
    let errors = validate_config(config);
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        return Err(EngineError::Config(messages.join("; ")));
    }
    let store = match config.store {
        Some(ref path) => Store::open(path)?,
        None => Store::open_in_memory()?,
    };
    Ok(store.with_chunk_size(config.chunk_size))
}
