//! LC-007: Engine error taxonomy.
//!
//! Every fallible operation returns [`EngineError`]. Kinds that name offending
//! symbols or parameters carry the complete, sorted set rather than the first
//! hit, so callers can report a whole batch at once.

use thiserror::Error;

/// Engine result type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("undefined symbols: {}", .names.join(", "))]
    MissingSymbol { names: Vec<String> },

    #[error("duplicate parameter names in batch: {}", .0.join(", "))]
    DuplicateName(Vec<String>),

    #[error("parameters already exist: {}", .0.join(", "))]
    NameExists(Vec<String>),

    #[error("parameter '{name}' is used by formulas in: {}", .referencing_groups.join(", "))]
    DependencyInUse {
        name: String,
        referencing_groups: Vec<String>,
    },

    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("invalid formula '{formula}': {message}")]
    Formula { formula: String, message: String },

    #[error("dependency cycle detected involving: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("unknown parameter '{name}' in group '{group}'")]
    UnknownParameter { group: String, name: String },

    #[error("invalid parameter name: '{0}'")]
    InvalidName(String),

    #[error("group '{group}' exists as {existing}, requested as {requested}")]
    KindMismatch {
        group: String,
        existing: String,
        requested: String,
    },

    #[error("group '{dependent}' cannot depend on '{dependee}': {reason}")]
    InvalidDependency {
        dependent: String,
        dependee: String,
        reason: String,
    },

    #[error("parameter '{name}' in group '{group}' is defined by a formula")]
    DerivedParameter { group: String, name: String },

    #[error("group '{group}' cannot be fresh while '{dependee}' is expired")]
    StaleDependee { group: String, dependee: String },

    #[error("'{name}' is defined in several groups: {}", .groups.join(", "))]
    AmbiguousName { name: String, groups: Vec<String> },

    #[error("invalid metadata: {0}")]
    Metadata(String),

    #[error("content graph error: {0}")]
    Graph(String),

    #[error("config error: {0}")]
    Config(String),
}

impl EngineError {
    /// Build a `MissingSymbol` error with a sorted, deduplicated name list.
    pub fn missing<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        Self::MissingSymbol { names }
    }

    pub(crate) fn formula(formula: &str, message: impl Into<String>) -> Self {
        Self::Formula {
            formula: formula.to_string(),
            message: message.into(),
        }
    }
}
