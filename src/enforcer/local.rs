//! In-process policy engine

use super::index::{decide, PolicyIndex};
use super::{EngineDump, PolicyEngine, PolicySource};
use crate::config::EnforcerConfig;
use crate::domain::{canonical_subject, Grouping, Policy};
use crate::error::Result;
use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Evaluation knobs of the in-process engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Look policies up by owning subject instead of scanning them all.
    pub indexed: bool,
    /// Compute the candidate set once per batch instead of once per object.
    pub batch_path: bool,
    /// Memoize role closures per subject.
    pub role_cache: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            indexed: false,
            batch_path: true,
            role_cache: false,
        }
    }
}

impl From<&EnforcerConfig> for EngineOptions {
    fn from(config: &EnforcerConfig) -> Self {
        Self {
            indexed: config.use_casbin_v2,
            batch_path: config.use_custom_enforcer,
            role_cache: config.custom_role_cache_allowed,
        }
    }
}

/// Closures computed against one snapshot generation.
#[derive(Default)]
struct RoleCache {
    generation: u64,
    closures: HashMap<String, Arc<Vec<String>>>,
}

pub struct LocalPolicyEngine<S: PolicySource> {
    source: Arc<S>,
    options: EngineOptions,
    state: RwLock<Arc<PolicyIndex>>,
    role_cache: Mutex<RoleCache>,
}

impl<S: PolicySource + 'static> LocalPolicyEngine<S> {
    pub fn new(source: Arc<S>, options: EngineOptions) -> Self {
        Self {
            source,
            options,
            state: RwLock::new(Arc::new(PolicyIndex::default())),
            role_cache: Mutex::new(RoleCache::default()),
        }
    }

    /// Build an engine and load it from the source.
    pub async fn load(source: Arc<S>, options: EngineOptions) -> Result<Self> {
        let engine = Self::new(source, options);
        engine.reload().await?;
        Ok(engine)
    }

    fn snapshot(&self) -> Arc<PolicyIndex> {
        self.state.read().clone()
    }

    /// Clone the current snapshot, mutate it and publish the result.
    fn publish<T>(&self, mutate: impl FnOnce(&mut PolicyIndex) -> T) -> T {
        let mut guard = self.state.write();
        let mut next = guard.next();
        let out = mutate(&mut next);
        gauge!("rbac_engine_policies").set(next.policy_count() as f64);
        *guard = Arc::new(next);
        out
    }

    fn closure(&self, index: &PolicyIndex, subject: &str) -> Arc<Vec<String>> {
        if !self.options.role_cache {
            return Arc::new(index.resolve(subject));
        }
        let key = canonical_subject(subject);
        {
            let cache = self.role_cache.lock();
            if cache.generation == index.generation() {
                if let Some(hit) = cache.closures.get(&key) {
                    return hit.clone();
                }
            }
        }
        let resolved = Arc::new(index.resolve(&key));
        let mut cache = self.role_cache.lock();
        if cache.generation != index.generation() {
            // Only a newer snapshot may replace the cached generation.
            if cache.generation > index.generation() {
                return resolved;
            }
            cache.generation = index.generation();
            cache.closures.clear();
        }
        cache.closures.insert(key, resolved.clone());
        resolved
    }

    /// Union of the closures of every subject.
    fn owners(&self, index: &PolicyIndex, subjects: &[String]) -> Vec<String> {
        let mut owners = BTreeSet::new();
        for subject in subjects {
            owners.extend(self.closure(index, subject).iter().cloned());
        }
        owners.into_iter().collect()
    }

    fn decide_all(
        &self,
        index: &PolicyIndex,
        subjects: &[String],
        res: &str,
        act: &str,
        objs: &[String],
    ) -> Vec<bool> {
        let owners = self.owners(index, subjects);
        if self.options.batch_path {
            let candidates = index.candidates(&owners, res, act, self.options.indexed);
            objs.iter().map(|obj| decide(&candidates, obj)).collect()
        } else {
            objs.iter()
                .map(|obj| {
                    let candidates = index.candidates(&owners, res, act, self.options.indexed);
                    decide(&candidates, obj)
                })
                .collect()
        }
    }

    fn record(decisions: &[bool], started: Instant) {
        histogram!("rbac_enforce_duration_seconds").record(started.elapsed().as_secs_f64());
        let allowed = decisions.iter().filter(|d| **d).count() as u64;
        counter!("rbac_enforce_total", "result" => "allow").increment(allowed);
        counter!("rbac_enforce_total", "result" => "deny")
            .increment(decisions.len() as u64 - allowed);
    }
}

#[async_trait]
impl<S: PolicySource + 'static> PolicyEngine for LocalPolicyEngine<S> {
    async fn enforce(&self, subjects: &[String], res: &str, act: &str, obj: &str) -> Result<bool> {
        let started = Instant::now();
        let index = self.snapshot();
        let decisions = self.decide_all(&index, subjects, res, act, &[obj.to_string()]);
        Self::record(&decisions, started);
        Ok(decisions.first().copied().unwrap_or(false))
    }

    async fn enforce_batch(
        &self,
        subjects: &[String],
        res: &str,
        act: &str,
        objs: &[String],
    ) -> Result<Vec<bool>> {
        let started = Instant::now();
        let index = self.snapshot();
        let decisions = self.decide_all(&index, subjects, res, act, objs);
        histogram!("rbac_enforce_batch_objects").record(objs.len() as f64);
        Self::record(&decisions, started);
        Ok(decisions)
    }

    async fn add_policies(&self, policies: &[Policy]) -> Result<Vec<Policy>> {
        let unapplied = self.publish(|index| {
            policies
                .iter()
                .filter(|p| !index.add_policy((*p).clone()))
                .cloned()
                .collect::<Vec<_>>()
        });
        for policy in policies {
            self.invalidate_cache(&policy.sub).await?;
        }
        debug!(
            added = policies.len() - unapplied.len(),
            skipped = unapplied.len(),
            "Added policies"
        );
        Ok(unapplied)
    }

    async fn remove_policies(&self, policies: &[Policy]) -> Result<Vec<Policy>> {
        let unapplied = self.publish(|index| {
            policies
                .iter()
                .filter(|p| !index.remove_policy(p))
                .cloned()
                .collect::<Vec<_>>()
        });
        for policy in policies {
            self.invalidate_cache(&policy.sub).await?;
        }
        Ok(unapplied)
    }

    async fn add_groupings(&self, groupings: &[Grouping]) -> Result<Vec<Grouping>> {
        // The new generation retires every cached closure.
        let unapplied = self.publish(|index| {
            groupings
                .iter()
                .filter(|g| !index.add_grouping(g))
                .cloned()
                .collect::<Vec<_>>()
        });
        Ok(unapplied)
    }

    async fn remove_groupings(&self, groupings: &[Grouping]) -> Result<Vec<Grouping>> {
        let unapplied = self.publish(|index| {
            groupings
                .iter()
                .filter(|g| !index.remove_grouping(g))
                .cloned()
                .collect::<Vec<_>>()
        });
        Ok(unapplied)
    }

    async fn remove_role_from_subject(&self, sub: &str, role: &str) -> Result<bool> {
        let grouping = Grouping::new(sub, role);
        Ok(self.publish(|index| index.remove_grouping(&grouping)))
    }

    async fn remove_policies_by_roles(&self, roles: &[String]) -> Result<usize> {
        if roles.is_empty() {
            return Ok(0);
        }
        let removed = self.publish(|index| index.remove_roles(roles));
        info!(roles = roles.len(), removed, "Removed policies by role");
        Ok(removed)
    }

    async fn roles_for_subject(&self, sub: &str) -> Result<Vec<String>> {
        let index = self.snapshot();
        let subject = canonical_subject(sub);
        Ok(self
            .closure(&index, &subject)
            .iter()
            .filter(|role| **role != subject)
            .cloned()
            .collect())
    }

    async fn reload(&self) -> Result<()> {
        let loaded = async {
            let policies = self.source.load_policies().await?;
            let groupings = self.source.load_groupings().await?;
            Ok::<_, crate::error::AppError>((policies, groupings))
        }
        .await;

        let (policies, groupings) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Engine reload failed, keeping current state");
                counter!("rbac_engine_reload_total", "result" => "failure").increment(1);
                return Err(e);
            }
        };

        let (policy_count, grouping_count) = self.publish(|index| {
            let generation = index.generation();
            *index = PolicyIndex::build(policies, groupings).with_generation(generation);
            (index.policy_count(), index.grouping_count())
        });
        counter!("rbac_engine_reload_total", "result" => "success").increment(1);
        info!(policy_count, grouping_count, "Policy engine reloaded");
        Ok(())
    }

    async fn invalidate_cache(&self, sub: &str) -> Result<()> {
        self.role_cache.lock().closures.remove(&canonical_subject(sub));
        Ok(())
    }

    async fn invalidate_all(&self) -> Result<()> {
        self.role_cache.lock().closures.clear();
        Ok(())
    }

    async fn dump(&self) -> Result<EngineDump> {
        let index = self.snapshot();
        let mut policies: Vec<Policy> = index.policies().cloned().collect();
        policies.sort_by(|a, b| (&a.sub, &a.res, &a.obj).cmp(&(&b.sub, &b.res, &b.obj)));
        let mut groupings: Vec<Grouping> = index.groupings().collect();
        groupings.sort();
        let mut cached_subjects: Vec<String> =
            self.role_cache.lock().closures.keys().cloned().collect();
        cached_subjects.sort();
        Ok(EngineDump {
            policies,
            groupings,
            cached_subjects,
        })
    }

    async fn policy_count(&self) -> Result<usize> {
        Ok(self.snapshot().policy_count())
    }
}
