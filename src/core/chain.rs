//! LC-006: Dependency-chain analysis.
//!
//! A group's dependency chain is the set of names its formulas and
//! parameterized exchanges read but do not define themselves. The chain
//! decides whether a parameter may be deleted and which formulas a cascading
//! rename has to rewrite.

use super::error::{EngineError, Result};
use super::formula::{self, Formula};
use super::recalc;
use super::resolver;
use super::store::{self, Store};
use super::types::*;
use crate::graph::ContentGraph;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{info, warn};

/// Names referenced by `group`'s formulas and exchanges but not defined in `group`.
pub fn required_external_symbols(store: &Store, group: &str) -> Result<BTreeSet<String>> {
    let params = store.parameters(group)?;
    let own: BTreeSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
    let mut required = referenced_symbols(store, group)?;
    required.retain(|name| !own.contains(name.as_str()));
    Ok(required)
}

/// Every symbol read by any formula or exchange binding of `group`.
fn referenced_symbols(store: &Store, group: &str) -> Result<BTreeSet<String>> {
    let mut symbols = BTreeSet::new();
    for param in store.parameters(group)? {
        if let Some(ref source) = param.formula {
            symbols.extend(Formula::parse(source)?.symbols());
        }
    }
    for binding in store.parameterized_exchanges(group)? {
        symbols.extend(formula::symbols(&binding.formula)?);
    }
    Ok(symbols)
}

/// The ancestor of `group` whose definition of `name` its formulas see.
fn supplier(store: &Store, group: &str, name: &str) -> Result<Option<String>> {
    let mut found = None;
    for ancestor in resolver::ancestors(store, group)? {
        if store.parameter(&ancestor, name)?.is_some() {
            found = Some(ancestor);
        }
    }
    Ok(found)
}

/// Group whose definition of `name` is visible from `viewer`: its own, else the nearest ancestor's.
fn resolution(store: &Store, viewer: &str, name: &str) -> Result<Option<String>> {
    if store.parameter(viewer, name)?.is_some() {
        return Ok(Some(viewer.to_string()));
    }
    supplier(store, viewer, name)
}

/// Like [`resolution`], as if `renamed` already defined `name`.
fn resolution_after_rename(
    store: &Store,
    viewer: &str,
    renamed: &str,
    name: &str,
) -> Result<Option<String>> {
    if viewer == renamed || store.parameter(viewer, name)?.is_some() {
        return Ok(Some(viewer.to_string()));
    }
    let mut found = None;
    for ancestor in resolver::ancestors(store, viewer)? {
        if ancestor == renamed || store.parameter(&ancestor, name)?.is_some() {
            found = Some(ancestor);
        }
    }
    Ok(found)
}

/// Groups whose formulas would read something else after renaming to `new`.
///
/// A rewritten reference must land on the renamed parameter, and an existing
/// reference to `new` must keep resolving where it did before.
fn rename_collisions(
    store: &Store,
    group: &str,
    new: &str,
    rewritten: &[String],
) -> Result<BTreeSet<String>> {
    let mut collisions = BTreeSet::new();
    for viewer in rewritten {
        if resolution_after_rename(store, viewer, group, new)?.as_deref() != Some(group) {
            collisions.insert(viewer.clone());
        }
    }
    let mut viewers = vec![group.to_string()];
    viewers.extend(store.transitive_dependents(group)?);
    for viewer in &viewers {
        if referenced_symbols(store, viewer)?.contains(new)
            && resolution(store, viewer, new)? != resolution_after_rename(store, viewer, group, new)?
        {
            collisions.insert(viewer.clone());
        }
    }
    Ok(collisions)
}

/// Groups whose formulas read parameter `name` of `group`, sorted.
///
/// Includes `group` itself when a sibling formula or exchange uses the name.
/// A dependent that shadows the name, or sees it through a nearer ancestor,
/// does not count.
pub fn referencing_groups(store: &Store, group: &str, name: &str) -> Result<Vec<String>> {
    store.require_group(group)?;
    let mut referencing = BTreeSet::new();
    if referenced_symbols(store, group)?.contains(name) {
        referencing.insert(group.to_string());
    }
    for dependent in store.transitive_dependents(group)? {
        if required_external_symbols(store, &dependent)?.contains(name)
            && supplier(store, &dependent, name)?.as_deref() == Some(group)
        {
            referencing.insert(dependent);
        }
    }
    Ok(referencing.into_iter().collect())
}

/// True when no formula or exchange depends on `name` in `group`.
pub fn is_deletable(store: &Store, group: &str, name: &str) -> Result<bool> {
    Ok(referencing_groups(store, group, name)?.is_empty())
}

fn require_parameter(store: &Store, group: &str, name: &str) -> Result<Parameter> {
    store
        .parameter(group, name)?
        .ok_or_else(|| EngineError::UnknownParameter {
            group: group.to_string(),
            name: name.to_string(),
        })
}

/// Delete a parameter nothing depends on, then expire its group.
pub fn delete_parameter(store: &mut Store, group: &str, name: &str) -> Result<()> {
    require_parameter(store, group, name)?;
    let referencing = referencing_groups(store, group, name)?;
    if !referencing.is_empty() {
        return Err(EngineError::DependencyInUse {
            name: name.to_string(),
            referencing_groups: referencing,
        });
    }
    let tx = store.transaction()?;
    store::delete_parameter_in(&tx, group, name)?;
    tx.commit()?;
    info!(group, name, "parameter deleted");
    Ok(())
}

/// Rename a parameter, then recalculate.
///
/// Fails with `DependencyInUse` when other formulas read the parameter and
/// `cascade` is off. With `cascade`, every dependent formula is rewritten to
/// the new name in the same transaction as the rename itself. Fails with
/// `NameExists` when `new` is defined or already read somewhere that would
/// make any formula resolve to a different parameter afterwards.
pub fn rename_parameter<G: ContentGraph + ?Sized>(
    store: &mut Store,
    graph: &mut G,
    group: &str,
    old: &str,
    new: &str,
    cascade: bool,
    journal: Option<&Path>,
) -> Result<RecalcReport> {
    require_parameter(store, group, old)?;
    if old == new {
        return Ok(RecalcReport::default());
    }
    if !formula::is_valid_parameter_name(new) {
        return Err(EngineError::InvalidName(new.to_string()));
    }
    if store.parameter(group, new)?.is_some() {
        return Err(EngineError::NameExists(vec![new.to_string()]));
    }

    let referencing = referencing_groups(store, group, old)?;
    if !referencing.is_empty() && !cascade {
        return Err(EngineError::DependencyInUse {
            name: old.to_string(),
            referencing_groups: referencing,
        });
    }

    let collisions = rename_collisions(store, group, new, &referencing)?;
    if !collisions.is_empty() {
        warn!(group, old, new, ?collisions, "rename would change formula resolution");
        return Err(EngineError::NameExists(vec![new.to_string()]));
    }

    let mut targets: BTreeSet<String> = referencing.into_iter().collect();
    targets.insert(group.to_string());
    let tx = store.transaction()?;
    let rewritten = store::rewrite_formulas_in(&tx, old, new, &|g: &Group| targets.contains(&g.name))?;
    store::rename_parameter_in(&tx, group, old, new)?;
    tx.commit()?;
    info!(group, old, new, rewritten = rewritten.len(), "parameter renamed");

    recalc::recalculate_all(store, graph, journal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    fn setup() -> (Store, MemoryGraph) {
        let mut s = Store::open_in_memory().unwrap();
        s.activity_group("battery", "cars").unwrap();
        s.bulk_replace(
            PROJECT_GROUP,
            vec![ParameterRecord::value("wood", 2.0), ParameterRecord::formula("steel", "wood*1.5")],
            true,
        )
        .unwrap();
        (s, MemoryGraph::new())
    }

    #[test]
    fn test_lc006_required_external_symbols() {
        let (mut s, _) = setup();
        s.bulk_replace(
            "battery",
            vec![
                ParameterRecord::value("cells", 4.0),
                ParameterRecord::formula("mass", "cells * steel + sqrt(wood)"),
            ],
            true,
        )
        .unwrap();
        s.add_parameterized_exchange("battery", ExchangeRef(1), "mass + lithium")
            .unwrap();
        let required = required_external_symbols(&s, "battery").unwrap();
        let expected: BTreeSet<String> =
            ["lithium", "steel", "wood"].iter().map(|s| s.to_string()).collect();
        assert_eq!(required, expected);
        assert!(required_external_symbols(&s, PROJECT_GROUP).unwrap().is_empty());
    }

    #[test]
    fn test_lc006_delete_referenced_parameter_refused() {
        let (mut s, _) = setup();
        assert!(!is_deletable(&s, PROJECT_GROUP, "wood").unwrap());
        match delete_parameter(&mut s, PROJECT_GROUP, "wood") {
            Err(EngineError::DependencyInUse {
                name,
                referencing_groups,
            }) => {
                assert_eq!(name, "wood");
                assert_eq!(referencing_groups, vec![PROJECT_GROUP]);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(s.parameter(PROJECT_GROUP, "wood").unwrap().is_some());
    }

    #[test]
    fn test_lc006_delete_unreferenced_parameter() {
        let (mut s, _) = setup();
        s.freshen(PROJECT_GROUP).unwrap();
        assert!(is_deletable(&s, PROJECT_GROUP, "steel").unwrap());
        delete_parameter(&mut s, PROJECT_GROUP, "steel").unwrap();
        assert!(s.parameter(PROJECT_GROUP, "steel").unwrap().is_none());
        assert!(!s.is_fresh(PROJECT_GROUP).unwrap());
        assert!(matches!(
            delete_parameter(&mut s, PROJECT_GROUP, "steel"),
            Err(EngineError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_lc006_referencing_groups_across_layers() {
        let (mut s, _) = setup();
        s.bulk_replace("battery", vec![ParameterRecord::formula("casing", "wood + 1")], true)
            .unwrap();
        assert_eq!(
            referencing_groups(&s, PROJECT_GROUP, "wood").unwrap(),
            vec!["battery", PROJECT_GROUP]
        );
    }

    #[test]
    fn test_lc006_shadowed_name_not_a_reference() {
        let (mut s, _) = setup();
        s.bulk_replace("cars", vec![ParameterRecord::value("wood", 9.0)], true)
            .unwrap();
        s.bulk_replace("battery", vec![ParameterRecord::formula("casing", "wood + 1")], true)
            .unwrap();
        assert_eq!(
            referencing_groups(&s, PROJECT_GROUP, "wood").unwrap(),
            vec![PROJECT_GROUP]
        );
        assert_eq!(referencing_groups(&s, "cars", "wood").unwrap(), vec!["battery"]);
    }

    #[test]
    fn test_lc006_cascade_rename() {
        let (mut s, mut g) = setup();
        recalc::recalculate_all(&mut s, &mut g, None).unwrap();
        assert!(matches!(
            rename_parameter(&mut s, &mut g, PROJECT_GROUP, "wood", "timber", false, None),
            Err(EngineError::DependencyInUse { .. })
        ));

        let report =
            rename_parameter(&mut s, &mut g, PROJECT_GROUP, "wood", "timber", true, None).unwrap();
        assert!(report.recalculated.contains(&PROJECT_GROUP.to_string()));
        let steel = s.parameter(PROJECT_GROUP, "steel").unwrap().unwrap();
        assert_eq!(steel.formula.as_deref(), Some("timber*1.5"));
        assert_eq!(steel.amount, 3.0);
        assert!(s.parameter(PROJECT_GROUP, "wood").unwrap().is_none());
        assert!(s.is_fresh(PROJECT_GROUP).unwrap());
    }

    #[test]
    fn test_lc006_cascade_rename_spares_overlapping_names() {
        let (mut s, mut g) = setup();
        s.bulk_replace(
            "cars",
            vec![
                ParameterRecord::value("wood2", 10.0),
                ParameterRecord::formula("frame", "wood + wood2"),
            ],
            true,
        )
        .unwrap();
        s.add_parameterized_exchange("battery", ExchangeRef(3), "wood * 2")
            .unwrap();
        rename_parameter(&mut s, &mut g, PROJECT_GROUP, "wood", "timber", true, None).unwrap();
        let frame = s.parameter("cars", "frame").unwrap().unwrap();
        assert_eq!(frame.formula.as_deref(), Some("timber + wood2"));
        assert_eq!(frame.amount, 12.0);
        assert_eq!(s.parameterized_exchanges("battery").unwrap()[0].formula, "timber * 2");
    }

    fn layered(project: &[(&str, f64)], cars: &[(&str, f64)], casing: &str) -> Store {
        let mut s = Store::open_in_memory().unwrap();
        s.activity_group("battery", "cars").unwrap();
        let values = |pairs: &[(&str, f64)]| {
            pairs
                .iter()
                .map(|(n, v)| ParameterRecord::value(n, *v))
                .collect::<Vec<_>>()
        };
        s.bulk_replace(PROJECT_GROUP, values(project), true).unwrap();
        s.bulk_replace("cars", values(cars), true).unwrap();
        s.bulk_replace("battery", vec![ParameterRecord::formula("casing", casing)], true)
            .unwrap();
        s
    }

    #[test]
    fn test_lc006_rename_refused_when_intermediate_layer_defines_target() {
        let mut s = layered(&[("wood", 2.0)], &[("timber", 100.0)], "wood + 1");
        let mut g = MemoryGraph::new();
        recalc::recalculate_all(&mut s, &mut g, None).unwrap();
        assert!(matches!(
            rename_parameter(&mut s, &mut g, PROJECT_GROUP, "wood", "timber", true, None),
            Err(EngineError::NameExists(_))
        ));
        let casing = s.parameter("battery", "casing").unwrap().unwrap();
        assert_eq!(casing.formula.as_deref(), Some("wood + 1"));
        assert_eq!(casing.amount, 3.0);
        assert!(s.parameter(PROJECT_GROUP, "wood").unwrap().is_some());
    }

    #[test]
    fn test_lc006_rename_refused_when_it_shadows_existing_reference() {
        let mut s = layered(&[("timber", 100.0)], &[("wood", 2.0)], "timber + wood");
        let mut g = MemoryGraph::new();
        assert!(matches!(
            rename_parameter(&mut s, &mut g, "cars", "wood", "timber", true, None),
            Err(EngineError::NameExists(_))
        ));
        assert!(s.parameter("cars", "wood").unwrap().is_some());
    }

    #[test]
    fn test_lc006_rename_may_shadow_distant_definition() {
        let mut s = layered(&[("timber", 100.0)], &[("wood", 2.0)], "wood + 1");
        let mut g = MemoryGraph::new();
        recalc::recalculate_all(&mut s, &mut g, None).unwrap();
        rename_parameter(&mut s, &mut g, "cars", "wood", "timber", true, None).unwrap();
        let casing = s.parameter("battery", "casing").unwrap().unwrap();
        assert_eq!(casing.formula.as_deref(), Some("timber + 1"));
        assert_eq!(casing.amount, 3.0);
    }

    #[test]
    fn test_lc006_rename_rejections() {
        let (mut s, mut g) = setup();
        assert!(matches!(
            rename_parameter(&mut s, &mut g, PROJECT_GROUP, "wood", "steel", true, None),
            Err(EngineError::NameExists(_))
        ));
        assert!(matches!(
            rename_parameter(&mut s, &mut g, PROJECT_GROUP, "wood", "9lives", true, None),
            Err(EngineError::InvalidName(_))
        ));
        assert!(matches!(
            rename_parameter(&mut s, &mut g, PROJECT_GROUP, "ghost", "x", true, None),
            Err(EngineError::UnknownParameter { .. })
        ));
        let report =
            rename_parameter(&mut s, &mut g, PROJECT_GROUP, "wood", "wood", false, None).unwrap();
        assert!(report.is_noop());
    }
}
