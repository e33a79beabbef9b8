//! gRPC client for an out-of-process policy engine (`casbin.CasbinService`)

use super::{EngineDump, PolicyEngine};
use crate::config::RemoteEngineConfig;
use crate::domain::{Grouping, Policy, PolicyType};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

/// Wire messages. Field tags are part of the service contract.
pub mod proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PolicyMessage {
        #[prost(string, tag = "1")]
        pub ptype: String,
        #[prost(string, tag = "2")]
        pub sub: String,
        #[prost(string, tag = "3")]
        pub res: String,
        #[prost(string, tag = "4")]
        pub act: String,
        #[prost(string, tag = "5")]
        pub obj: String,
        #[prost(string, tag = "6")]
        pub eft: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GroupingMessage {
        #[prost(string, tag = "1")]
        pub sub: String,
        #[prost(string, tag = "2")]
        pub role: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct EnforceRequest {
        #[prost(string, repeated, tag = "1")]
        pub subjects: Vec<String>,
        #[prost(string, tag = "2")]
        pub resource: String,
        #[prost(string, tag = "3")]
        pub action: String,
        #[prost(string, tag = "4")]
        pub object: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct EnforceReply {
        #[prost(bool, tag = "1")]
        pub allowed: bool,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct EnforceBatchRequest {
        #[prost(string, repeated, tag = "1")]
        pub subjects: Vec<String>,
        #[prost(string, tag = "2")]
        pub resource: String,
        #[prost(string, tag = "3")]
        pub action: String,
        #[prost(string, repeated, tag = "4")]
        pub objects: Vec<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct EnforceBatchReply {
        #[prost(bool, repeated, tag = "1")]
        pub allowed: Vec<bool>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PoliciesRequest {
        #[prost(message, repeated, tag = "1")]
        pub policies: Vec<PolicyMessage>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PoliciesReply {
        #[prost(message, repeated, tag = "1")]
        pub unapplied: Vec<PolicyMessage>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GroupingsRequest {
        #[prost(message, repeated, tag = "1")]
        pub groupings: Vec<GroupingMessage>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GroupingsReply {
        #[prost(message, repeated, tag = "1")]
        pub unapplied: Vec<GroupingMessage>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RolesRequest {
        #[prost(string, repeated, tag = "1")]
        pub roles: Vec<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CountReply {
        #[prost(uint64, tag = "1")]
        pub count: u64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct SubjectRequest {
        #[prost(string, tag = "1")]
        pub subject: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RolesReply {
        #[prost(string, repeated, tag = "1")]
        pub roles: Vec<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct DumpReply {
        /// JSON-encoded engine dump
        #[prost(string, tag = "1")]
        pub json: String,
        #[prost(uint64, tag = "2")]
        pub policy_count: u64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Empty {}
}

use proto::*;

const SERVICE: &str = "/casbin.CasbinService/";

impl From<&Policy> for PolicyMessage {
    fn from(policy: &Policy) -> Self {
        Self {
            ptype: match policy.ptype {
                PolicyType::P => "p".to_string(),
                PolicyType::G => "g".to_string(),
            },
            sub: policy.sub.clone(),
            res: policy.res.clone(),
            act: policy.act.clone(),
            obj: policy.obj.clone(),
            eft: policy.eft.as_str().to_string(),
        }
    }
}

impl From<PolicyMessage> for Policy {
    fn from(message: PolicyMessage) -> Self {
        Policy {
            ptype: if message.ptype == "g" {
                PolicyType::G
            } else {
                PolicyType::P
            },
            sub: message.sub,
            res: message.res,
            act: message.act,
            obj: message.obj,
            eft: message.eft.parse().unwrap_or_default(),
        }
    }
}

impl From<&Grouping> for GroupingMessage {
    fn from(grouping: &Grouping) -> Self {
        Self {
            sub: grouping.sub.clone(),
            role: grouping.role.clone(),
        }
    }
}

impl From<GroupingMessage> for Grouping {
    fn from(message: GroupingMessage) -> Self {
        Grouping::new(message.sub, message.role)
    }
}

fn transport_error(method: &str, status: tonic::Status) -> AppError {
    AppError::Engine(format!("{} failed: {}", method, status.message()))
}

/// Remote engine with the same contract as the in-process one.
#[derive(Clone)]
pub struct RemotePolicyEngine {
    inner: tonic::client::Grpc<Channel>,
}

impl RemotePolicyEngine {
    /// Lazily connecting client; transport errors surface per call.
    pub fn connect(config: &RemoteEngineConfig) -> Result<Self> {
        let endpoint = Endpoint::from_shared(config.url.clone())
            .map_err(|e| AppError::Engine(format!("Invalid engine url {}: {}", config.url, e)))?;
        Ok(Self::with_channel(
            endpoint.connect_lazy(),
            config.max_message_size_bytes(),
        ))
    }

    pub fn with_channel(channel: Channel, max_message_size: usize) -> Self {
        let inner = tonic::client::Grpc::new(channel)
            .max_decoding_message_size(max_message_size)
            .max_encoding_message_size(max_message_size);
        Self { inner }
    }

    async fn unary<Req, Reply>(&self, method: &'static str, request: Req) -> Result<Reply>
    where
        Req: prost::Message + Send + Sync + 'static,
        Reply: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.inner.clone();
        grpc.ready()
            .await
            .map_err(|e| AppError::Engine(format!("Engine not ready: {}", e)))?;

        let path = PathAndQuery::try_from(format!("{}{}", SERVICE, method))
            .map_err(|e| AppError::Engine(format!("Invalid method path: {}", e)))?;
        let codec: ProstCodec<Req, Reply> = ProstCodec::default();
        debug!(method, "Calling remote policy engine");
        let response = grpc
            .unary(tonic::Request::new(request), path, codec)
            .await
            .map_err(|status| transport_error(method, status))?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl PolicyEngine for RemotePolicyEngine {
    async fn enforce(&self, subjects: &[String], res: &str, act: &str, obj: &str) -> Result<bool> {
        let reply: EnforceReply = self
            .unary(
                "Enforce",
                EnforceRequest {
                    subjects: subjects.to_vec(),
                    resource: res.to_string(),
                    action: act.to_string(),
                    object: obj.to_string(),
                },
            )
            .await?;
        Ok(reply.allowed)
    }

    async fn enforce_batch(
        &self,
        subjects: &[String],
        res: &str,
        act: &str,
        objs: &[String],
    ) -> Result<Vec<bool>> {
        let reply: EnforceBatchReply = self
            .unary(
                "EnforceBatch",
                EnforceBatchRequest {
                    subjects: subjects.to_vec(),
                    resource: res.to_string(),
                    action: act.to_string(),
                    objects: objs.to_vec(),
                },
            )
            .await?;
        if reply.allowed.len() != objs.len() {
            return Err(AppError::Engine(format!(
                "EnforceBatch returned {} decisions for {} objects",
                reply.allowed.len(),
                objs.len()
            )));
        }
        Ok(reply.allowed)
    }

    async fn add_policies(&self, policies: &[Policy]) -> Result<Vec<Policy>> {
        let reply: PoliciesReply = self
            .unary(
                "AddPolicies",
                PoliciesRequest {
                    policies: policies.iter().map(PolicyMessage::from).collect(),
                },
            )
            .await?;
        Ok(reply.unapplied.into_iter().map(Policy::from).collect())
    }

    async fn remove_policies(&self, policies: &[Policy]) -> Result<Vec<Policy>> {
        let reply: PoliciesReply = self
            .unary(
                "RemovePolicies",
                PoliciesRequest {
                    policies: policies.iter().map(PolicyMessage::from).collect(),
                },
            )
            .await?;
        Ok(reply.unapplied.into_iter().map(Policy::from).collect())
    }

    async fn add_groupings(&self, groupings: &[Grouping]) -> Result<Vec<Grouping>> {
        let reply: GroupingsReply = self
            .unary(
                "AddGroupings",
                GroupingsRequest {
                    groupings: groupings.iter().map(GroupingMessage::from).collect(),
                },
            )
            .await?;
        Ok(reply.unapplied.into_iter().map(Grouping::from).collect())
    }

    async fn remove_groupings(&self, groupings: &[Grouping]) -> Result<Vec<Grouping>> {
        let reply: GroupingsReply = self
            .unary(
                "RemoveGroupings",
                GroupingsRequest {
                    groupings: groupings.iter().map(GroupingMessage::from).collect(),
                },
            )
            .await?;
        Ok(reply.unapplied.into_iter().map(Grouping::from).collect())
    }

    async fn remove_role_from_subject(&self, sub: &str, role: &str) -> Result<bool> {
        let unapplied = self.remove_groupings(&[Grouping::new(sub, role)]).await?;
        Ok(unapplied.is_empty())
    }

    async fn remove_policies_by_roles(&self, roles: &[String]) -> Result<usize> {
        let reply: CountReply = self
            .unary(
                "RemovePoliciesByRoles",
                RolesRequest {
                    roles: roles.to_vec(),
                },
            )
            .await?;
        Ok(reply.count as usize)
    }

    async fn roles_for_subject(&self, sub: &str) -> Result<Vec<String>> {
        let reply: RolesReply = self
            .unary(
                "GetRolesForSubject",
                SubjectRequest {
                    subject: sub.to_string(),
                },
            )
            .await?;
        Ok(reply.roles)
    }

    async fn reload(&self) -> Result<()> {
        let _: Empty = self.unary("Reload", Empty {}).await?;
        Ok(())
    }

    async fn invalidate_cache(&self, sub: &str) -> Result<()> {
        let _: Empty = self
            .unary(
                "InvalidateCache",
                SubjectRequest {
                    subject: sub.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn invalidate_all(&self) -> Result<()> {
        let _: Empty = self
            .unary(
                "InvalidateCache",
                SubjectRequest {
                    subject: String::new(),
                },
            )
            .await?;
        Ok(())
    }

    async fn dump(&self) -> Result<EngineDump> {
        let reply: DumpReply = self.unary("Dump", Empty {}).await?;
        serde_json::from_str(&reply.json)
            .map_err(|e| AppError::Engine(format!("Malformed engine dump: {}", e)))
    }

    async fn policy_count(&self) -> Result<usize> {
        let reply: DumpReply = self.unary("Dump", Empty {}).await?;
        Ok(reply.policy_count as usize)
    }
}
