//! LC-008: External content graph seam.
//!
//! The engine only needs four things from the process/exchange database it
//! feeds: list a process's exchanges, look one up, overwrite its amount, and
//! flag the owning dataset as needing reprocessing.

pub mod memory;

use crate::core::error::Result;
use crate::core::store::Store;
use crate::core::types::ExchangeRef;
use tracing::debug;

pub use memory::MemoryGraph;

/// An amount flowing into a process, as stored by the content graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub id: ExchangeRef,

    /// Consuming process
    pub process: String,

    /// Dataset that owns the consuming process
    pub dataset: String,

    /// Supplying entity
    pub input: String,

    pub amount: f64,

    /// Formula text when the amount is parameterized
    pub formula: Option<String>,
}

/// Read/write access to exchange records.
pub trait ContentGraph {
    /// Every exchange consumed by `process`.
    fn exchanges_of(&self, process: &str) -> Result<Vec<Exchange>>;

    fn exchange(&self, id: ExchangeRef) -> Result<Exchange>;

    /// Overwrite an exchange's stored amount.
    fn set_amount(&mut self, id: ExchangeRef, amount: f64) -> Result<()>;

    /// Flag a dataset as modified since its last processing.
    fn mark_dirty(&mut self, dataset: &str) -> Result<()>;
}

/// Write an evaluated amount and dirty the owning dataset.
pub fn write_exchange<G: ContentGraph + ?Sized>(
    graph: &mut G,
    id: ExchangeRef,
    amount: f64,
) -> Result<()> {
    let exchange = graph.exchange(id)?;
    graph.set_amount(id, amount)?;
    graph.mark_dirty(&exchange.dataset)
}

/// Bind every formula-bearing exchange of `process` to `group`.
///
/// Replaces the group's previous bindings for that process's exchanges and
/// expires the group. Returns the number of bindings made.
pub fn add_exchanges_to_group<G: ContentGraph + ?Sized>(
    store: &mut Store,
    graph: &G,
    group: &str,
    process: &str,
) -> Result<usize> {
    let exchanges = graph.exchanges_of(process)?;
    let remove: Vec<ExchangeRef> = exchanges.iter().map(|e| e.id).collect();
    let add: Vec<(ExchangeRef, String)> = exchanges
        .into_iter()
        .filter_map(|e| e.formula.map(|f| (e.id, f)))
        .collect();
    store.replace_exchanges(group, &remove, &add)?;
    debug!(group, process, bound = add.len(), "exchanges bound");
    Ok(add.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::EngineError;
    use crate::core::types::ParameterRecord;

    #[test]
    fn test_lc008_write_exchange_dirties_dataset() {
        let mut graph = MemoryGraph::new();
        let id = graph.add_exchange("battery", "cars", "lithium", 1.0, Some("battery_weight"));
        write_exchange(&mut graph, id, 120.0).unwrap();
        assert_eq!(graph.exchange(id).unwrap().amount, 120.0);
        assert!(graph.is_dirty("cars"));
        assert_eq!(graph.writes(), 1);
    }

    #[test]
    fn test_lc008_write_unknown_exchange() {
        let mut graph = MemoryGraph::new();
        assert!(matches!(
            write_exchange(&mut graph, ExchangeRef(99), 1.0),
            Err(EngineError::Graph(_))
        ));
        assert!(graph.dirty().is_empty());
    }

    #[test]
    fn test_lc008_add_exchanges_to_group() {
        let mut store = Store::open_in_memory().unwrap();
        store.activity_group("battery", "cars").unwrap();
        let mut graph = MemoryGraph::new();
        let lithium = graph.add_exchange("battery", "cars", "lithium", 1.0, Some("cells * 0.2"));
        graph.add_exchange("battery", "cars", "casing", 1.0, None);
        graph.add_exchange("motor", "cars", "copper", 1.0, Some("coils"));

        assert_eq!(add_exchanges_to_group(&mut store, &graph, "battery", "battery").unwrap(), 1);
        let bound = store.parameterized_exchanges("battery").unwrap();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].exchange, lithium);
        assert_eq!(bound[0].formula, "cells * 0.2");

        // Rebinding replaces rather than duplicates
        store
            .bulk_replace("battery", vec![ParameterRecord::value("cells", 10.0)], true)
            .unwrap();
        add_exchanges_to_group(&mut store, &graph, "battery", "battery").unwrap();
        assert_eq!(store.parameterized_exchanges("battery").unwrap().len(), 1);
        assert!(!store.is_fresh("battery").unwrap());
    }
}
