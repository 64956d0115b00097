//! LC-001: Data model: groups, parameters, dependency edges, parameterized exchanges.
//!
//! Groups are the unit of freshness. Each group has a [`GroupKind`] that fixes
//! which other kinds it may depend on. Parameters carry an optional formula, a
//! cached amount, and a flat scalar metadata bag.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::error::EngineError;

/// Name of the single project-wide group.
pub const PROJECT_GROUP: &str = "project";

// ============================================================================
// Groups
// ============================================================================

/// Layer kind of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Project,
    Database,
    Activity,
    ExternalInput,
}

impl GroupKind {
    /// Position in the layer stack. Dependees always sit at a lower rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Project => 0,
            Self::Database => 1,
            Self::Activity => 2,
            Self::ExternalInput => 3,
        }
    }

    /// Whether a group of this kind may depend on a group of kind `dependee`.
    pub fn may_depend_on(self, dependee: GroupKind) -> bool {
        dependee.rank() < self.rank()
            || (self == Self::Activity && dependee == Self::Activity)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Database => "database",
            Self::Activity => "activity",
            Self::ExternalInput => "external_input",
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(Self::Project),
            "database" => Ok(Self::Database),
            "activity" => Ok(Self::Activity),
            "external_input" => Ok(Self::ExternalInput),
            other => Err(EngineError::Config(format!("unknown group kind: {}", other))),
        }
    }
}

/// A named freshness unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub kind: GroupKind,
    pub fresh: bool,
}

/// Directed edge: `dependent` formulas may read `dependee` values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupDependency {
    pub dependent: String,
    pub dependee: String,
}

// ============================================================================
// Parameters
// ============================================================================

/// Scalar metadata value. Nested structures are rejected on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// Flat metadata bag attached to a parameter.
pub type ExtraData = BTreeMap<String, MetaValue>;

/// Encode a metadata bag for storage.
pub fn encode_extra(data: &ExtraData) -> Result<String, EngineError> {
    // JSON has no NaN or infinity; they would serialize as null and never load back
    if let Some((key, value)) = data
        .iter()
        .find(|(_, v)| matches!(v, MetaValue::Float(f) if !f.is_finite()))
    {
        return Err(EngineError::Metadata(format!(
            "key '{}' holds non-finite value {:?}",
            key, value
        )));
    }
    serde_json::to_string(data).map_err(|e| EngineError::Metadata(e.to_string()))
}

/// Decode a stored metadata bag. Fails on anything but a flat scalar map.
pub fn decode_extra(raw: &str) -> Result<ExtraData, EngineError> {
    serde_json::from_str(raw).map_err(|e| EngineError::Metadata(e.to_string()))
}

/// A stored parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub id: i64,
    pub group: String,
    pub name: String,
    pub formula: Option<String>,
    pub amount: f64,
    pub data: ExtraData,
}

/// Input record for bulk ingestion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    pub name: String,

    #[serde(default)]
    pub formula: Option<String>,

    /// Defaults to 0 when absent.
    #[serde(default)]
    pub amount: Option<f64>,

    #[serde(default)]
    pub data: ExtraData,
}

impl ParameterRecord {
    /// Record with a literal amount and no formula.
    pub fn value(name: &str, amount: f64) -> Self {
        Self {
            name: name.to_string(),
            amount: Some(amount),
            ..Default::default()
        }
    }

    /// Record defined by a formula.
    pub fn formula(name: &str, formula: &str) -> Self {
        Self {
            name: name.to_string(),
            formula: Some(formula.to_string()),
            ..Default::default()
        }
    }
}

// ============================================================================
// Exchanges
// ============================================================================

/// Identifier of an exchange record in the external content graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeRef(pub i64);

impl fmt::Display for ExchangeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exc-{}", self.0)
    }
}

/// Binding of a group formula to an external exchange amount.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterizedExchange {
    pub id: i64,
    pub group: String,
    pub exchange: ExchangeRef,
    pub formula: String,
}

// ============================================================================
// Recalculation results
// ============================================================================

/// One exchange that could not be recomputed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeFailure {
    pub group: String,
    pub exchange: ExchangeRef,
    pub error: String,
}

/// Outcome of a `recalculate_all` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecalcReport {
    /// Groups recomputed and freshened, in visit order
    pub recalculated: Vec<String>,

    /// Groups skipped because they were already fresh
    pub skipped: u32,

    /// Parameter amounts written to the store
    pub amounts_written: u32,

    /// Exchange amounts written to the content graph
    pub exchanges_written: u32,

    /// Exchanges that failed; others were still written
    pub exchange_failures: Vec<ExchangeFailure>,
}

impl RecalcReport {
    /// True when the call wrote nothing anywhere.
    pub fn is_noop(&self) -> bool {
        self.recalculated.is_empty() && self.amounts_written == 0 && self.exchanges_written == 0
    }
}

/// Resolved name → amount mapping available to a group's formulas.
pub type SymbolTable = rustc_hash::FxHashMap<String, f64>;

/// Ordered amounts keyed by parameter name, as committed by a recompute.
pub type Amounts = IndexMap<String, f64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lc001_kind_ranks_ordered() {
        assert!(GroupKind::Project.rank() < GroupKind::Database.rank());
        assert!(GroupKind::Database.rank() < GroupKind::Activity.rank());
        assert!(GroupKind::Activity.rank() < GroupKind::ExternalInput.rank());
    }

    #[test]
    fn test_lc001_may_depend_on() {
        assert!(GroupKind::Database.may_depend_on(GroupKind::Project));
        assert!(GroupKind::Activity.may_depend_on(GroupKind::Database));
        assert!(GroupKind::Activity.may_depend_on(GroupKind::Activity));
        assert!(GroupKind::ExternalInput.may_depend_on(GroupKind::Activity));
        assert!(!GroupKind::Project.may_depend_on(GroupKind::Database));
        assert!(!GroupKind::Database.may_depend_on(GroupKind::Database));
        assert!(!GroupKind::ExternalInput.may_depend_on(GroupKind::ExternalInput));
    }

    #[test]
    fn test_lc001_kind_string_roundtrip() {
        for kind in [
            GroupKind::Project,
            GroupKind::Database,
            GroupKind::Activity,
            GroupKind::ExternalInput,
        ] {
            assert_eq!(kind.to_string().parse::<GroupKind>().unwrap(), kind);
        }
        assert!("process".parse::<GroupKind>().is_err());
    }

    #[test]
    fn test_lc001_extra_data_scalars() {
        let mut data = ExtraData::new();
        data.insert("alias".into(), "x".into());
        data.insert("lower".into(), MetaValue::Float(0.5));
        data.insert("count".into(), MetaValue::Int(3));
        data.insert("flag".into(), MetaValue::Bool(true));
        let raw = encode_extra(&data).unwrap();
        assert_eq!(decode_extra(&raw).unwrap(), data);
    }

    #[test]
    fn test_lc001_extra_data_rejects_nested() {
        assert!(matches!(
            decode_extra(r#"{"uncertainty": {"loc": 1.0}}"#),
            Err(EngineError::Metadata(_))
        ));
        assert!(matches!(
            decode_extra(r#"{"tags": [1, 2]}"#),
            Err(EngineError::Metadata(_))
        ));
    }

    #[test]
    fn test_lc001_extra_data_rejects_non_finite() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut data = ExtraData::new();
            data.insert("unit".into(), "kg".into());
            data.insert("scale".into(), MetaValue::Float(bad));
            match encode_extra(&data) {
                Err(EngineError::Metadata(msg)) => assert!(msg.contains("scale")),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_lc001_record_from_yaml_defaults() {
        let yaml = r#"
- name: wood
  amount: 2.0
- name: steel
  formula: wood * 1.5
  data:
    unit: kg
"#;
        let records: Vec<ParameterRecord> = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(records[0], ParameterRecord::value("wood", 2.0));
        assert_eq!(records[1].formula.as_deref(), Some("wood * 1.5"));
        assert_eq!(records[1].amount, None);
        assert_eq!(records[1].data["unit"], MetaValue::Text("kg".into()));
    }

    #[test]
    fn test_lc001_report_noop() {
        assert!(RecalcReport::default().is_noop());
        let report = RecalcReport {
            recalculated: vec!["project".into()],
            ..Default::default()
        };
        assert!(!report.is_noop());
    }
}
