//! Compact forms of stored roles
//!
//! The exact form expands back to precisely the stored roles and is what
//! create-merge builds on. The display form additionally lets the empty
//! "all" marker absorb its axis and joins job workflows.

use crate::domain::{Role, RoleFilter, ACCESS_TYPE_DEVTRON_APP, ENTITY_APPS};
use std::collections::{BTreeMap, BTreeSet};

/// Which field varies inside a merged filter, and which one it is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axes {
    /// environment → entityName
    EnvApp,
    /// namespace → resource
    NamespaceResource,
    /// entityName only
    EntityName,
}

fn merge_key(role: &Role, display: bool) -> (String, Axes) {
    let t = role.tuple();
    if t.entity == crate::domain::ENTITY_CLUSTER {
        return (
            format!("{}_{}_{}_{}_{}", t.entity, t.action, t.cluster, t.group, t.kind),
            Axes::NamespaceResource,
        );
    }
    if !t.team.is_empty() {
        let mut key = format!("{}_{}_{}", t.team, t.action, t.access_type);
        if t.entity == crate::domain::ENTITY_JOBS {
            key = format!("{}_{}", key, t.entity);
            if !display {
                key = format!("{}_{}", key, t.workflow);
            }
        }
        if !t.subaction.is_empty() {
            key = format!("{}_{}", key, t.subaction);
        }
        return (key, Axes::EnvApp);
    }
    (format!("{}_{}", t.entity, t.action), Axes::EntityName)
}

/// An empty value means "all" and swallows the rest of the set.
fn absorb_all(values: &mut BTreeSet<String>) {
    if values.contains("") {
        values.clear();
        values.insert(String::new());
    }
}

fn join(values: &BTreeSet<String>) -> String {
    values.iter().cloned().collect::<Vec<_>>().join(",")
}

/// Group `outer → inner` pairs so outers sharing an identical inner set land
/// in one entry.
fn collapse(pairs: &BTreeMap<String, BTreeSet<String>>, display: bool) -> Vec<(String, String)> {
    let mut by_inner: BTreeMap<BTreeSet<String>, BTreeSet<String>> = BTreeMap::new();
    for (outer, inners) in pairs {
        let mut inners = inners.clone();
        if display {
            absorb_all(&mut inners);
        }
        by_inner.entry(inners).or_default().insert(outer.clone());
    }
    by_inner
        .into_iter()
        .map(|(inners, mut outers)| {
            if display {
                absorb_all(&mut outers);
            }
            (join(&outers), join(&inners))
        })
        .collect()
}

fn display_defaults(mut filter: RoleFilter) -> RoleFilter {
    if filter.entity.is_empty() {
        filter.entity = ENTITY_APPS.to_string();
    }
    if filter.entity == ENTITY_APPS && filter.access_type.is_empty() {
        filter.access_type = ACCESS_TYPE_DEVTRON_APP.to_string();
    }
    filter
}

struct MergeGroup {
    base: RoleFilter,
    axes: Axes,
    /// outer → inner values
    pairs: BTreeMap<String, BTreeSet<String>>,
    workflows: BTreeSet<String>,
}

fn merge(roles: &[Role], display: bool) -> (Vec<RoleFilter>, bool) {
    let mut super_admin = false;
    let mut groups: BTreeMap<String, MergeGroup> = BTreeMap::new();

    for role in roles {
        if role.is_super_admin() {
            super_admin = true;
            continue;
        }
        let (key, axes) = merge_key(role, display);
        let base = RoleFilter::from(role);
        let (outer, inner) = match axes {
            Axes::EnvApp => (base.environment.clone(), base.entity_name.clone()),
            Axes::NamespaceResource => (base.namespace.clone(), base.resource.clone()),
            Axes::EntityName => (String::new(), base.entity_name.clone()),
        };
        let workflow = base.workflow.clone();
        let group = groups.entry(key).or_insert_with(|| MergeGroup {
            base,
            axes,
            pairs: BTreeMap::new(),
            workflows: BTreeSet::new(),
        });
        group.pairs.entry(outer).or_default().insert(inner);
        group.workflows.insert(workflow);
    }

    let mut filters = Vec::new();
    for (_, mut group) in groups {
        if display && group.base.is_jobs() {
            absorb_all(&mut group.workflows);
            group.base.workflow = join(&group.workflows);
        }
        for (outers, inners) in collapse(&group.pairs, display) {
            let mut filter = group.base.clone();
            match group.axes {
                Axes::EnvApp => {
                    filter.environment = outers;
                    filter.entity_name = inners;
                }
                Axes::NamespaceResource => {
                    filter.namespace = outers;
                    filter.resource = inners;
                }
                Axes::EntityName => filter.entity_name = inners,
            }
            filters.push(display_defaults(filter));
        }
    }
    (filters, super_admin)
}

/// Merge roles into compact filters that expand back to exactly `roles`.
/// The super-admin role is reported through the returned flag.
pub fn merge_role_filters(roles: &[Role]) -> (Vec<RoleFilter>, bool) {
    merge(roles, false)
}

/// Display form of `roles`: an empty value on an axis reads as "all".
pub fn display_role_filters(roles: &[Role]) -> (Vec<RoleFilter>, bool) {
    merge(roles, true)
}
