//! Immutable snapshot of `p` policies and `g` edges
//!
//! Subjects and roles are interned into one arena; edges are adjacency lists
//! of arena indices. Writers clone a snapshot, mutate it and publish it whole.

use super::matcher::{action_match, key_match};
use crate::domain::{canonical_subject, Effect, Grouping, Policy};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct PolicyIndex {
    names: Vec<String>,
    ids: HashMap<String, usize>,
    edges: Vec<Vec<usize>>,
    policies: HashMap<String, Vec<Policy>>,
    policy_count: usize,
    grouping_count: usize,
    generation: u64,
}

impl PolicyIndex {
    pub fn build(policies: Vec<Policy>, groupings: Vec<Grouping>) -> Self {
        let mut index = Self::default();
        for policy in policies {
            index.add_policy(policy);
        }
        for grouping in groupings {
            index.add_grouping(&grouping);
        }
        index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Successor snapshot: same content, next generation.
    pub fn next(&self) -> Self {
        let mut next = self.clone();
        next.generation = self.generation + 1;
        next
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn policy_count(&self) -> usize {
        self.policy_count
    }

    pub fn grouping_count(&self) -> usize {
        self.grouping_count
    }

    fn intern(&mut self, name: &str) -> usize {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        self.edges.push(Vec::new());
        id
    }

    // ==================== Mutation ====================

    /// Returns false when the policy is already present.
    pub fn add_policy(&mut self, policy: Policy) -> bool {
        let bucket = self.policies.entry(policy.sub.clone()).or_default();
        if bucket.contains(&policy) {
            return false;
        }
        bucket.push(policy);
        self.policy_count += 1;
        true
    }

    /// Returns false when the policy was not present.
    pub fn remove_policy(&mut self, policy: &Policy) -> bool {
        let Some(bucket) = self.policies.get_mut(&policy.sub) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|p| p != policy);
        let removed = before - bucket.len();
        if bucket.is_empty() {
            self.policies.remove(&policy.sub);
        }
        self.policy_count -= removed;
        removed > 0
    }

    pub fn add_grouping(&mut self, grouping: &Grouping) -> bool {
        let sub = self.intern(&canonical_subject(&grouping.sub));
        let role = self.intern(&grouping.role);
        if self.edges[sub].contains(&role) {
            return false;
        }
        self.edges[sub].push(role);
        self.grouping_count += 1;
        true
    }

    pub fn remove_grouping(&mut self, grouping: &Grouping) -> bool {
        let sub = canonical_subject(&grouping.sub);
        let (Some(&sub), Some(&role)) = (self.ids.get(&sub), self.ids.get(&grouping.role)) else {
            return false;
        };
        let before = self.edges[sub].len();
        self.edges[sub].retain(|&r| r != role);
        let removed = before - self.edges[sub].len();
        self.grouping_count -= removed;
        removed > 0
    }

    /// Drop every `p` policy owned by one of `roles` and every edge that
    /// targets one of them. Returns the number of removed tuples.
    pub fn remove_roles(&mut self, roles: &[String]) -> usize {
        let mut removed = 0;
        for role in roles {
            if let Some(bucket) = self.policies.remove(role) {
                removed += bucket.len();
                self.policy_count -= bucket.len();
            }
            if let Some(&target) = self.ids.get(role) {
                for adjacency in self.edges.iter_mut() {
                    let before = adjacency.len();
                    adjacency.retain(|&r| r != target);
                    let dropped = before - adjacency.len();
                    removed += dropped;
                    self.grouping_count -= dropped;
                }
            }
        }
        removed
    }

    // ==================== Lookup ====================

    /// Transitive closure of `g` from `subject`, the subject itself first.
    pub fn resolve(&self, subject: &str) -> Vec<String> {
        let subject = canonical_subject(subject);
        let Some(&start) = self.ids.get(&subject) else {
            return vec![subject];
        };

        let mut visited = vec![false; self.names.len()];
        let mut stack = vec![start];
        let mut closure = Vec::new();
        visited[start] = true;
        while let Some(node) = stack.pop() {
            closure.push(self.names[node].clone());
            for &next in &self.edges[node] {
                if !visited[next] {
                    visited[next] = true;
                    stack.push(next);
                }
            }
        }
        closure
    }

    /// Direct `g` targets of `subject`.
    pub fn direct_roles(&self, subject: &str) -> Vec<String> {
        match self.ids.get(&canonical_subject(subject)) {
            Some(&id) => self.edges[id]
                .iter()
                .map(|&r| self.names[r].clone())
                .collect(),
            None => vec![],
        }
    }

    /// Policies owned by any of `owners` whose resource and action match.
    /// With `indexed` the per-owner buckets are consulted directly, otherwise
    /// every policy is scanned.
    pub fn candidates<'a>(
        &'a self,
        owners: &[String],
        res: &str,
        act: &str,
        indexed: bool,
    ) -> Vec<&'a Policy> {
        let matches = |p: &&Policy| key_match(res, &p.res) && action_match(act, &p.act);
        if indexed {
            owners
                .iter()
                .filter_map(|owner| self.policies.get(owner))
                .flat_map(|bucket| bucket.iter())
                .filter(matches)
                .collect()
        } else {
            self.policies
                .values()
                .flat_map(|bucket| bucket.iter())
                .filter(|p| owners.contains(&p.sub))
                .filter(matches)
                .collect()
        }
    }

    pub fn policies(&self) -> impl Iterator<Item = &Policy> {
        self.policies.values().flat_map(|bucket| bucket.iter())
    }

    pub fn groupings(&self) -> impl Iterator<Item = Grouping> + '_ {
        self.edges.iter().enumerate().flat_map(move |(sub, roles)| {
            roles
                .iter()
                .map(move |&role| Grouping::new(&self.names[sub], &self.names[role]))
        })
    }
}

/// `some(allow) && !some(deny)` over the candidates matching `obj`.
pub fn decide(candidates: &[&Policy], obj: &str) -> bool {
    let mut allowed = false;
    for policy in candidates {
        if key_match(obj, &policy.obj) {
            match policy.eft {
                Effect::Deny => return false,
                Effect::Allow => allowed = true,
            }
        }
    }
    allowed
}
