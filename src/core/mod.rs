//! Core engine logic: formulas, storage, layer resolution, recalculation.

pub mod chain;
pub mod config;
pub mod error;
pub mod formula;
pub mod recalc;
pub mod resolver;
pub mod store;
pub mod types;
