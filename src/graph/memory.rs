//! LC-008: In-memory content graph.

use super::{ContentGraph, Exchange};
use crate::core::error::{EngineError, Result};
use crate::core::types::ExchangeRef;
use indexmap::IndexMap;
use std::collections::BTreeSet;

/// Exchange records held in memory, with a dirty-dataset set.
#[derive(Debug, Default, Clone)]
pub struct MemoryGraph {
    exchanges: IndexMap<ExchangeRef, Exchange>,
    dirty: BTreeSet<String>,
    next_id: i64,
    writes: u32,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exchange consumed by `process` in `dataset`. Returns its id.
    pub fn add_exchange(
        &mut self,
        process: &str,
        dataset: &str,
        input: &str,
        amount: f64,
        formula: Option<&str>,
    ) -> ExchangeRef {
        self.next_id += 1;
        let id = ExchangeRef(self.next_id);
        self.exchanges.insert(
            id,
            Exchange {
                id,
                process: process.to_string(),
                dataset: dataset.to_string(),
                input: input.to_string(),
                amount,
                formula: formula.map(str::to_string),
            },
        );
        id
    }

    pub fn is_dirty(&self, dataset: &str) -> bool {
        self.dirty.contains(dataset)
    }

    pub fn dirty(&self) -> &BTreeSet<String> {
        &self.dirty
    }

    /// Clear dirty flags, as after reprocessing.
    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// Number of amount writes since creation.
    pub fn writes(&self) -> u32 {
        self.writes
    }
}

impl ContentGraph for MemoryGraph {
    fn exchanges_of(&self, process: &str) -> Result<Vec<Exchange>> {
        Ok(self
            .exchanges
            .values()
            .filter(|e| e.process == process)
            .cloned()
            .collect())
    }

    fn exchange(&self, id: ExchangeRef) -> Result<Exchange> {
        self.exchanges
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::Graph(format!("unknown exchange {}", id)))
    }

    fn set_amount(&mut self, id: ExchangeRef, amount: f64) -> Result<()> {
        let exchange = self
            .exchanges
            .get_mut(&id)
            .ok_or_else(|| EngineError::Graph(format!("unknown exchange {}", id)))?;
        exchange.amount = amount;
        self.writes += 1;
        Ok(())
    }

    fn mark_dirty(&mut self, dataset: &str) -> Result<()> {
        self.dirty.insert(dataset.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lc008_exchanges_of_filters_by_process() {
        let mut g = MemoryGraph::new();
        let a = g.add_exchange("battery", "cars", "lithium", 1.0, Some("w"));
        g.add_exchange("motor", "cars", "copper", 2.0, None);
        let b = g.add_exchange("battery", "cars", "steel", 3.0, None);
        let ids: Vec<_> = g.exchanges_of("battery").unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a, b]);
        assert!(g.exchanges_of("ghost").unwrap().is_empty());
    }

    #[test]
    fn test_lc008_ids_unique() {
        let mut g = MemoryGraph::new();
        let a = g.add_exchange("p", "d", "x", 1.0, None);
        let b = g.add_exchange("p", "d", "y", 1.0, None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_lc008_dirty_tracking() {
        let mut g = MemoryGraph::new();
        g.mark_dirty("cars").unwrap();
        g.mark_dirty("cars").unwrap();
        assert_eq!(g.dirty().len(), 1);
        g.clear_dirty();
        assert!(!g.is_dirty("cars"));
    }
}
