//! Layercalc: layered parameter store with incremental recalculation.
//!
//! Parameters live in groups arranged as layers (project, database,
//! activity, external input). Each group carries a freshness flag; a
//! mutation expires the group and everything downstream, and a
//! recalculation recomputes only expired groups before pushing formula-driven
//! exchange amounts into an external content graph.

pub mod core;
pub mod graph;
pub mod journal;
pub mod session;

pub use crate::core::error::{EngineError, Result};
pub use crate::core::types::{ParameterRecord, RecalcReport};
pub use graph::{ContentGraph, MemoryGraph};
pub use session::Session;
