//! LC-011: Caller-facing session.
//!
//! Owns the store, the content graph, and the configuration for one caller.
//! An optimizing caller pushes values onto the external-input layer, calls
//! [`Session::recalculate_all`], then reads results back; everything else is
//! model maintenance.

use crate::core::chain;
use crate::core::config::{self, EngineConfig};
use crate::core::error::{EngineError, Result};
use crate::core::recalc;
use crate::core::resolver;
use crate::core::store::Store;
use crate::core::types::*;
use crate::graph::{self, ContentGraph};
use std::collections::BTreeMap;
use tracing::info;

/// Metadata key naming the optimizer variable behind an external input.
pub const ALIAS_KEY: &str = "alias";

/// A registered external input.
#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    pub name: String,
    pub alias: Option<String>,
    pub amount: f64,
}

/// Store, content graph, and config for one caller.
#[derive(Debug)]
pub struct Session<G: ContentGraph> {
    store: Store,
    graph: G,
    config: EngineConfig,
}

impl<G: ContentGraph> Session<G> {
    /// Open the configured store and make sure the external layer exists.
    pub fn open(config: EngineConfig, graph: G) -> Result<Self> {
        let mut store = config::open_store(&config)?;
        store.project_group()?;
        store.external_group(&config.external_group, config.external_parent.as_deref())?;
        info!(external = %config.external_group, "session opened");
        Ok(Self {
            store,
            graph,
            config,
        })
    }

    /// In-memory store with default configuration.
    pub fn in_memory(graph: G) -> Result<Self> {
        Self::open(EngineConfig::default(), graph)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut G {
        &mut self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Name of the group pushed values land in.
    pub fn external_group(&self) -> &str {
        &self.config.external_group
    }

    // ========================================================================
    // Optimizer surface
    // ========================================================================

    /// Set one external-input amount; creates the input if needed.
    pub fn push(&mut self, name: &str, value: f64) -> Result<()> {
        let mut amounts = Amounts::new();
        amounts.insert(name.to_string(), value);
        self.push_many(&amounts)
    }

    /// Set several external-input amounts in one transaction.
    pub fn push_many(&mut self, amounts: &Amounts) -> Result<()> {
        let group = self.config.external_group.clone();
        self.store.upsert_amounts(&group, amounts)
    }

    /// Resolved amount of `name`.
    ///
    /// Looks through the external-input layer first, which sees every group it
    /// depends on. Otherwise the name must be defined by exactly one group.
    pub fn read(&self, name: &str) -> Result<f64> {
        let table = resolver::resolve_symbol_table(&self.store, &self.config.external_group)?;
        if let Some(value) = table.get(name) {
            return Ok(*value);
        }

        let mut found = Vec::new();
        for group in resolver::recalc_order(&self.store)? {
            if let Some(param) = self.store.parameter(&group.name, name)? {
                found.push((group.name, param.amount));
            }
        }
        match found.len() {
            0 => Err(EngineError::missing([name])),
            1 => Ok(found[0].1),
            _ => Err(EngineError::AmbiguousName {
                name: name.to_string(),
                groups: found.into_iter().map(|(group, _)| group).collect(),
            }),
        }
    }

    /// Resolved amount of `name` as seen from `group`.
    pub fn read_in(&self, group: &str, name: &str) -> Result<f64> {
        resolver::resolve_symbol_table(&self.store, group)?
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::missing([name]))
    }

    pub fn recalculate_all(&mut self) -> Result<RecalcReport> {
        recalc::recalculate_all(&mut self.store, &mut self.graph, self.config.journal.as_deref())
    }

    // ========================================================================
    // Model maintenance
    // ========================================================================

    /// Bulk-ingest parameter records into `group`.
    pub fn ingest(&mut self, group: &str, records: Vec<ParameterRecord>, overwrite: bool) -> Result<usize> {
        self.store.bulk_replace(group, records, overwrite)
    }

    /// Rename a parameter, rewriting dependents when `cascade` is set.
    pub fn rename(&mut self, group: &str, old: &str, new: &str, cascade: bool) -> Result<RecalcReport> {
        chain::rename_parameter(
            &mut self.store,
            &mut self.graph,
            group,
            old,
            new,
            cascade,
            self.config.journal.as_deref(),
        )
    }

    /// Delete a parameter nothing depends on.
    pub fn delete(&mut self, group: &str, name: &str) -> Result<()> {
        chain::delete_parameter(&mut self.store, group, name)
    }

    /// Bind the formula-bearing exchanges of `process` to `group`.
    pub fn add_exchanges_to_group(&mut self, group: &str, process: &str) -> Result<usize> {
        graph::add_exchanges_to_group(&mut self.store, &self.graph, group, process)
    }

    // ========================================================================
    // External inputs
    // ========================================================================

    /// Create or update an external input, tagging it with the optimizer
    /// variable it is driven by.
    pub fn register_input(&mut self, name: &str, value: f64, alias: Option<&str>) -> Result<()> {
        let group = self.config.external_group.clone();
        if let Some(existing) = self.store.parameter(&group, name)? {
            if existing.formula.is_some() {
                return Err(EngineError::DerivedParameter {
                    group,
                    name: name.to_string(),
                });
            }
        }
        let mut record = ParameterRecord::value(name, value);
        if let Some(alias) = alias {
            record.data.insert(ALIAS_KEY.to_string(), MetaValue::from(alias));
        }
        self.store.bulk_replace(&group, vec![record], true)?;
        Ok(())
    }

    /// Every external input with its alias, in registration order.
    pub fn inputs(&self) -> Result<Vec<Input>> {
        Ok(self
            .store
            .parameters(&self.config.external_group)?
            .into_iter()
            .map(|p| Input {
                alias: match p.data.get(ALIAS_KEY) {
                    Some(MetaValue::Text(alias)) => Some(alias.clone()),
                    _ => None,
                },
                name: p.name,
                amount: p.amount,
            })
            .collect())
    }

    /// Push values keyed by alias. Fails without writing if any alias is unknown.
    pub fn push_aliased(&mut self, values: &BTreeMap<String, f64>) -> Result<()> {
        let by_alias: BTreeMap<String, String> = self
            .inputs()?
            .into_iter()
            .filter_map(|input| input.alias.map(|alias| (alias, input.name)))
            .collect();
        let unknown: Vec<&String> = values.keys().filter(|a| !by_alias.contains_key(*a)).collect();
        if !unknown.is_empty() {
            return Err(EngineError::missing(unknown.into_iter().cloned()));
        }
        let amounts: Amounts = values
            .iter()
            .filter_map(|(alias, value)| by_alias.get(alias).map(|name| (name.clone(), *value)))
            .collect();
        self.push_many(&amounts)
    }

    /// Delete every external input. Returns how many were removed.
    pub fn clear_inputs(&mut self) -> Result<usize> {
        let group = self.config.external_group.clone();
        self.store.clear_group(&group)
    }
}
