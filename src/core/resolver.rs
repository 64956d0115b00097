//! LC-003: Layer resolution and recalculation ordering.
//!
//! Builds a DAG from group dependency edges and computes a topological order
//! using Kahn's algorithm with deterministic (kind rank, then name)
//! tie-breaking. Symbol tables are assembled along that order, so a group's
//! own values shadow its ancestors' and nearer ancestors shadow distant ones.

use super::error::{EngineError, Result};
use super::store::Store;
use super::types::*;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Topological recalculation order: every dependee before its dependents.
pub fn build_recalc_order(groups: &[Group], edges: &[GroupDependency]) -> Result<Vec<String>> {
    let rank: HashMap<&str, u8> = groups
        .iter()
        .map(|g| (g.name.as_str(), g.kind.rank()))
        .collect();
    let mut in_degree: HashMap<&str, usize> = groups.iter().map(|g| (g.name.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

    for edge in edges {
        if !rank.contains_key(edge.dependee.as_str()) {
            return Err(EngineError::UnknownGroup(edge.dependee.clone()));
        }
        let Some(degree) = in_degree.get_mut(edge.dependent.as_str()) else {
            return Err(EngineError::UnknownGroup(edge.dependent.clone()));
        };
        *degree += 1;
        adjacency
            .entry(edge.dependee.as_str())
            .or_default()
            .push(edge.dependent.as_str());
    }

    let mut zero_degree: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(name, _)| *name)
        .collect();
    sort_ready(&mut zero_degree, &rank);
    let mut queue: VecDeque<&str> = zero_degree.into();

    let mut order = Vec::with_capacity(groups.len());
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());

        let mut next_ready = Vec::new();
        for &neighbor in adjacency.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(neighbor) {
                *degree -= 1;
                if *degree == 0 {
                    next_ready.push(neighbor);
                }
            }
        }
        sort_ready(&mut next_ready, &rank);
        queue.extend(next_ready);
    }

    if order.len() != groups.len() {
        let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
        let mut cycle_members: Vec<String> = groups
            .iter()
            .filter(|g| !ordered.contains(g.name.as_str()))
            .map(|g| g.name.clone())
            .collect();
        cycle_members.sort();
        return Err(EngineError::DependencyCycle(cycle_members));
    }

    Ok(order)
}

/// Sort ready groups by layer rank, then name.
fn sort_ready<'a>(ready: &mut [&'a str], rank: &HashMap<&'a str, u8>) {
    ready.sort_by_key(|name| (rank.get(name).copied().unwrap_or(u8::MAX), *name));
}

/// Every group in recalculation order.
pub fn recalc_order(store: &Store) -> Result<Vec<Group>> {
    let groups = store.groups()?;
    let order = build_recalc_order(&groups, &store.dependencies()?)?;
    let mut by_name: HashMap<String, Group> =
        groups.into_iter().map(|g| (g.name.clone(), g)).collect();
    Ok(order.into_iter().filter_map(|n| by_name.remove(&n)).collect())
}

/// Transitive dependees of `group`, most distant first.
///
/// Orders only the upstream subgraph, so the cost follows the number of
/// ancestors rather than the size of the whole store.
pub fn ancestors(store: &Store, group: &str) -> Result<Vec<String>> {
    store.require_group(group)?;
    let mut upstream = BTreeSet::new();
    let mut edges = Vec::new();
    let mut queue = VecDeque::from([group.to_string()]);
    while let Some(current) = queue.pop_front() {
        for dependee in store.dependees(&current)? {
            if current != group {
                edges.push(GroupDependency {
                    dependent: current.clone(),
                    dependee: dependee.clone(),
                });
            }
            if upstream.insert(dependee.clone()) {
                queue.push_back(dependee);
            }
        }
    }
    let groups = upstream
        .iter()
        .map(|name| store.require_group(name))
        .collect::<Result<Vec<_>>>()?;
    build_recalc_order(&groups, &edges)
}

/// Combined amounts of every ancestor of `group`, not including the group itself.
pub fn ancestor_table(store: &Store, group: &str) -> Result<SymbolTable> {
    let mut table = SymbolTable::default();
    for ancestor in ancestors(store, group)? {
        for param in store.parameters(&ancestor)? {
            table.insert(param.name, param.amount);
        }
    }
    Ok(table)
}

/// Symbol table visible to `group`'s formulas: ancestors, then its own values.
pub fn resolve_symbol_table(store: &Store, group: &str) -> Result<SymbolTable> {
    let mut table = ancestor_table(store, group)?;
    for param in store.parameters(group)? {
        table.insert(param.name, param.amount);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, kind: GroupKind) -> Group {
        Group {
            id: 0,
            name: name.to_string(),
            kind,
            fresh: false,
        }
    }

    fn edge(dependent: &str, dependee: &str) -> GroupDependency {
        GroupDependency {
            dependent: dependent.to_string(),
            dependee: dependee.to_string(),
        }
    }

    #[test]
    fn test_lc003_order_layers_first() {
        let groups = vec![
            group("zz_input", GroupKind::ExternalInput),
            group("battery", GroupKind::Activity),
            group("cars", GroupKind::Database),
            group(PROJECT_GROUP, GroupKind::Project),
            group("bikes", GroupKind::Database),
        ];
        let edges = vec![
            edge("cars", PROJECT_GROUP),
            edge("bikes", PROJECT_GROUP),
            edge("battery", "cars"),
            edge("zz_input", "battery"),
        ];
        let order = build_recalc_order(&groups, &edges).unwrap();
        assert_eq!(order, vec![PROJECT_GROUP, "bikes", "cars", "battery", "zz_input"]);
    }

    #[test]
    fn test_lc003_rank_breaks_ties_before_name() {
        let groups = vec![
            group("a_activity", GroupKind::Activity),
            group("z_database", GroupKind::Database),
        ];
        let order = build_recalc_order(&groups, &[]).unwrap();
        assert_eq!(order, vec!["z_database", "a_activity"]);
    }

    #[test]
    fn test_lc003_cycle_detected() {
        let groups = vec![
            group("a", GroupKind::Activity),
            group("b", GroupKind::Activity),
            group("c", GroupKind::Activity),
        ];
        let edges = vec![edge("a", "b"), edge("b", "a"), edge("c", "a")];
        match build_recalc_order(&groups, &edges) {
            Err(EngineError::DependencyCycle(members)) => {
                assert_eq!(members, vec!["a", "b", "c"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_lc003_unknown_edge_endpoint() {
        let groups = vec![group(PROJECT_GROUP, GroupKind::Project)];
        assert!(matches!(
            build_recalc_order(&groups, &[edge("ghost", PROJECT_GROUP)]),
            Err(EngineError::UnknownGroup(_))
        ));
    }

    #[test]
    fn test_lc003_ancestor_chain() {
        let mut s = Store::open_in_memory().unwrap();
        s.activity_group("battery", "cars").unwrap();
        s.external_group("inputs", Some("battery")).unwrap();
        assert_eq!(
            ancestors(&s, "inputs").unwrap(),
            vec![PROJECT_GROUP, "cars", "battery"]
        );
        assert_eq!(ancestors(&s, "battery").unwrap(), vec![PROJECT_GROUP, "cars"]);
        assert_eq!(ancestors(&s, "cars").unwrap(), vec![PROJECT_GROUP]);
        assert!(ancestors(&s, PROJECT_GROUP).unwrap().is_empty());
    }

    #[test]
    fn test_lc003_ancestors_ignore_unrelated_groups() {
        let mut s = Store::open_in_memory().unwrap();
        s.activity_group("battery", "cars").unwrap();
        s.activity_group("cells", "cars").unwrap();
        s.activity_group("anode", "cars").unwrap();
        s.add_dependency("battery", "cells").unwrap();
        s.add_dependency("cells", "anode").unwrap();
        s.activity_group("wheel", "bikes").unwrap();
        assert_eq!(
            ancestors(&s, "battery").unwrap(),
            vec![PROJECT_GROUP, "cars", "anode", "cells"]
        );
        assert_eq!(ancestors(&s, "wheel").unwrap(), vec![PROJECT_GROUP, "bikes"]);
    }

    #[test]
    fn test_lc003_own_values_shadow_ancestors() {
        let mut s = Store::open_in_memory().unwrap();
        s.activity_group("battery", "cars").unwrap();
        s.bulk_replace(
            PROJECT_GROUP,
            vec![
                ParameterRecord::value("a", 1.0),
                ParameterRecord::value("b", 1.0),
                ParameterRecord::value("c", 1.0),
            ],
            true,
        )
        .unwrap();
        s.bulk_replace(
            "cars",
            vec![ParameterRecord::value("b", 2.0), ParameterRecord::value("c", 2.0)],
            true,
        )
        .unwrap();
        s.bulk_replace("battery", vec![ParameterRecord::value("c", 3.0)], true)
            .unwrap();

        let table = resolve_symbol_table(&s, "battery").unwrap();
        assert_eq!(table["a"], 1.0);
        assert_eq!(table["b"], 2.0);
        assert_eq!(table["c"], 3.0);

        let parents = ancestor_table(&s, "battery").unwrap();
        assert_eq!(parents["c"], 2.0);

        let project = resolve_symbol_table(&s, PROJECT_GROUP).unwrap();
        assert_eq!(project.len(), 3);
        assert_eq!(project["c"], 1.0);
    }
}
