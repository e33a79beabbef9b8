//! Policy engine: authoritative in-memory index of `p` policies and `g` edges

pub mod index;
pub mod local;
pub mod matcher;
pub mod remote;

pub use index::PolicyIndex;
pub use local::{EngineOptions, LocalPolicyEngine};
pub use remote::RemotePolicyEngine;

use crate::domain::{Grouping, Policy};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Where the engine (re)loads its state from.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn load_policies(&self) -> Result<Vec<Policy>>;
    async fn load_groupings(&self) -> Result<Vec<Grouping>>;
}

/// Snapshot exposed by `/user/role/cache`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineDump {
    pub policies: Vec<Policy>,
    pub groupings: Vec<Grouping>,
    pub cached_subjects: Vec<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn enforce(&self, subjects: &[String], res: &str, act: &str, obj: &str) -> Result<bool>;

    /// One decision per object, in order.
    async fn enforce_batch(
        &self,
        subjects: &[String],
        res: &str,
        act: &str,
        objs: &[String],
    ) -> Result<Vec<bool>>;

    /// Returns the policies that could not be applied.
    async fn add_policies(&self, policies: &[Policy]) -> Result<Vec<Policy>>;
    async fn remove_policies(&self, policies: &[Policy]) -> Result<Vec<Policy>>;
    async fn add_groupings(&self, groupings: &[Grouping]) -> Result<Vec<Grouping>>;
    async fn remove_groupings(&self, groupings: &[Grouping]) -> Result<Vec<Grouping>>;
    async fn remove_role_from_subject(&self, sub: &str, role: &str) -> Result<bool>;

    /// Drop `p` policies owned by the roles and edges pointing at them.
    /// Returns the number of tuples actually removed.
    async fn remove_policies_by_roles(&self, roles: &[String]) -> Result<usize>;

    /// Roles reachable from `sub`, excluding `sub` itself.
    async fn roles_for_subject(&self, sub: &str) -> Result<Vec<String>>;

    async fn reload(&self) -> Result<()>;
    async fn invalidate_cache(&self, sub: &str) -> Result<()>;
    async fn invalidate_all(&self) -> Result<()>;
    async fn dump(&self) -> Result<EngineDump>;
    async fn policy_count(&self) -> Result<usize>;
}
