//! LC-005: Recalculation orchestrator.
//!
//! Walks groups in dependency order, skips fresh ones, and recomputes the
//! rest: parse formulas, check every referenced symbol resolves, evaluate
//! siblings in their own dependency order, then commit all amounts and the
//! freshness flip together. Every commit leaves the group's exchanges
//! pending; pending exchanges are re-evaluated and written to the content
//! graph at the end of the call, including a call that failed part way.

use super::error::{EngineError, Result};
use super::formula::Formula;
use super::resolver;
use super::store::Store;
use super::types::*;
use crate::graph::{self, ContentGraph};
use crate::journal::{self, RecalcEvent};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Recompute every expired group, then every exchange whose group has
/// committed amounts not yet pushed to the graph.
///
/// The first group that fails aborts the call with that group's error; the
/// failed group and its dependents stay expired, while exchanges of groups
/// committed before the failure are still written. Exchange failures do not
/// abort; they are collected into the report.
#[instrument(skip_all, name = "recalculate_all")]
pub fn recalculate_all<G: ContentGraph + ?Sized>(
    store: &mut Store,
    graph: &mut G,
    journal_path: Option<&Path>,
) -> Result<RecalcReport> {
    let run_id = journal::generate_run_id();
    journal::record(
        journal_path,
        RecalcEvent::RecalcStarted {
            run_id: run_id.clone(),
        },
    );

    let mut report = RecalcReport::default();
    let order = resolver::recalc_order(store)?;
    let names: Vec<String> = order.iter().map(|g| g.name.clone()).collect();
    for group in order {
        if group.fresh {
            report.skipped += 1;
            continue;
        }
        match recalculate_group(store, &group.name) {
            Ok(written) => {
                debug!(group = %group.name, written, "group recalculated");
                journal::record(
                    journal_path,
                    RecalcEvent::GroupRecalculated {
                        run_id: run_id.clone(),
                        group: group.name.clone(),
                        amounts_written: written,
                    },
                );
                report.amounts_written += written;
                report.recalculated.push(group.name);
            }
            Err(e) => {
                warn!(group = %group.name, error = %e, "group recalculation failed");
                journal::record(
                    journal_path,
                    RecalcEvent::GroupFailed {
                        run_id: run_id.clone(),
                        group: group.name,
                        error: e.to_string(),
                    },
                );
                if let Err(flush_err) =
                    flush_exchanges(store, graph, &names, &run_id, journal_path, &mut report)
                {
                    warn!(error = %flush_err, "exchange flush after failure did not complete");
                }
                return Err(e);
            }
        }
    }

    flush_exchanges(store, graph, &names, &run_id, journal_path, &mut report)?;

    info!(
        recalculated = report.recalculated.len(),
        skipped = report.skipped,
        exchanges = report.exchanges_written,
        exchange_failures = report.exchange_failures.len(),
        "recalculation complete"
    );
    journal::record(
        journal_path,
        RecalcEvent::RecalcCompleted {
            run_id,
            recalculated: report.recalculated.len() as u32,
            skipped: report.skipped,
            exchanges_written: report.exchanges_written,
            exchange_failures: report.exchange_failures.len() as u32,
        },
    );
    Ok(report)
}

/// Recompute one group against its ancestors and commit. Returns amounts written.
///
/// Nothing is written unless every formula in the group evaluates.
pub fn recalculate_group(store: &mut Store, group: &str) -> Result<u32> {
    let mut table = resolver::ancestor_table(store, group)?;
    let params = store.parameters(group)?;

    let mut formulas: BTreeMap<String, Formula> = BTreeMap::new();
    for param in &params {
        if let Some(ref source) = param.formula {
            formulas.insert(param.name.clone(), Formula::parse(source)?);
        }
    }

    let own: BTreeSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
    let missing: BTreeSet<String> = formulas
        .values()
        .flat_map(Formula::symbols)
        .filter(|s| !own.contains(s.as_str()) && !table.contains_key(s))
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::missing(missing));
    }

    for param in &params {
        table.insert(param.name.clone(), param.amount);
    }

    let mut amounts = Amounts::new();
    for name in evaluation_order(&formulas)? {
        let value = formulas[&name].evaluate(&table)?;
        table.insert(name.clone(), value);
        amounts.insert(name, value);
    }

    store.update_amounts(group, &amounts)?;
    Ok(amounts.len() as u32)
}

/// Order formula-defined siblings so each follows the siblings it reads.
fn evaluation_order(formulas: &BTreeMap<String, Formula>) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut readers: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, formula) in formulas {
        let deps: Vec<String> = formula
            .symbols()
            .into_iter()
            .filter(|s| formulas.contains_key(s))
            .collect();
        in_degree.insert(name.as_str(), deps.len());
        for dep in deps {
            if let Some((key, _)) = formulas.get_key_value(&dep) {
                readers.entry(key.as_str()).or_default().push(name.as_str());
            }
        }
    }

    // BTreeMap iteration keeps the initial queue alphabetical
    let mut queue: VecDeque<&str> = formulas
        .keys()
        .map(String::as_str)
        .filter(|n| in_degree.get(n) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(formulas.len());
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());
        let mut ready = Vec::new();
        for &reader in readers.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(reader) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(reader);
                }
            }
        }
        ready.sort();
        queue.extend(ready);
    }

    if order.len() != formulas.len() {
        let cycle_members: Vec<String> = formulas
            .keys()
            .filter(|n| !order.contains(n))
            .cloned()
            .collect();
        return Err(EngineError::DependencyCycle(cycle_members));
    }
    Ok(order)
}

/// Write exchanges of every group with pending amounts, in recalculation order.
///
/// The pending flag clears once a group's bindings have all been attempted;
/// individual failures are reported, not retried.
fn flush_exchanges<G: ContentGraph + ?Sized>(
    store: &mut Store,
    graph: &mut G,
    order: &[String],
    run_id: &str,
    journal_path: Option<&Path>,
    report: &mut RecalcReport,
) -> Result<()> {
    let pending = store.exchanges_pending()?;
    for group in order.iter().filter(|g| pending.contains(*g)) {
        recalculate_exchanges(store, graph, group, run_id, journal_path, report)?;
        store.clear_exchanges_pending(group)?;
    }
    Ok(())
}

fn recalculate_exchanges<G: ContentGraph + ?Sized>(
    store: &Store,
    graph: &mut G,
    group: &str,
    run_id: &str,
    journal_path: Option<&Path>,
    report: &mut RecalcReport,
) -> Result<()> {
    let bindings = store.parameterized_exchanges(group)?;
    if bindings.is_empty() {
        return Ok(());
    }
    let table = resolver::resolve_symbol_table(store, group)?;

    for binding in bindings {
        let outcome = Formula::parse(&binding.formula)
            .and_then(|f| f.evaluate(&table))
            .and_then(|amount| graph::write_exchange(&mut *graph, binding.exchange, amount).map(|_| amount));
        match outcome {
            Ok(amount) => {
                report.exchanges_written += 1;
                journal::record(
                    journal_path,
                    RecalcEvent::ExchangeWritten {
                        run_id: run_id.to_string(),
                        group: group.to_string(),
                        exchange: binding.exchange.0,
                        amount,
                    },
                );
            }
            Err(e) => {
                warn!(group, exchange = %binding.exchange, error = %e, "exchange recalculation failed");
                journal::record(
                    journal_path,
                    RecalcEvent::ExchangeFailed {
                        run_id: run_id.to_string(),
                        group: group.to_string(),
                        exchange: binding.exchange.0,
                        error: e.to_string(),
                    },
                );
                report.exchange_failures.push(ExchangeFailure {
                    group: group.to_string(),
                    exchange: binding.exchange,
                    error: e.to_string(),
                });
            }
        }
    }
    Ok(())
}
