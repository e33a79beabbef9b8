//! Default role / policy template rendering
//!
//! Templates come in two dialects:
//! - `GoTemplate`: placeholders written as `{{.Team}}`, substituted by name.
//! - `Indexed`: `%` sentinels with a position → parameter map, substituted by
//!   a single byte walk.
//!
//! Both dialects produce the same text for the same parameters; the rendered
//! text is then decoded as JSON into a role descriptor or a policy list.

pub mod catalog;

pub use catalog::{TemplateCatalog, TemplateKey};

use crate::domain::{RoleTuple, ENTITY_CLUSTER, ENTITY_JOBS};
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Named parameter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParamKey {
    Entity,
    EntityName,
    Team,
    App,
    Env,
    Cluster,
    Namespace,
    Group,
    Kind,
    Resource,
    Workflow,
    TeamObj,
    AppObj,
    EnvObj,
    ClusterObj,
    NamespaceObj,
    GroupObj,
    KindObj,
    ResourceObj,
    WorkflowObj,
}

impl ParamKey {
    const ALL: [ParamKey; 20] = [
        ParamKey::Entity,
        ParamKey::EntityName,
        ParamKey::Team,
        ParamKey::App,
        ParamKey::Env,
        ParamKey::Cluster,
        ParamKey::Namespace,
        ParamKey::Group,
        ParamKey::Kind,
        ParamKey::Resource,
        ParamKey::Workflow,
        ParamKey::TeamObj,
        ParamKey::AppObj,
        ParamKey::EnvObj,
        ParamKey::ClusterObj,
        ParamKey::NamespaceObj,
        ParamKey::GroupObj,
        ParamKey::KindObj,
        ParamKey::ResourceObj,
        ParamKey::WorkflowObj,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ParamKey::Entity => "Entity",
            ParamKey::EntityName => "EntityName",
            ParamKey::Team => "Team",
            ParamKey::App => "App",
            ParamKey::Env => "Env",
            ParamKey::Cluster => "Cluster",
            ParamKey::Namespace => "Namespace",
            ParamKey::Group => "Group",
            ParamKey::Kind => "Kind",
            ParamKey::Resource => "Resource",
            ParamKey::Workflow => "Workflow",
            ParamKey::TeamObj => "TeamObj",
            ParamKey::AppObj => "AppObj",
            ParamKey::EnvObj => "EnvObj",
            ParamKey::ClusterObj => "ClusterObj",
            ParamKey::NamespaceObj => "NamespaceObj",
            ParamKey::GroupObj => "GroupObj",
            ParamKey::KindObj => "KindObj",
            ParamKey::ResourceObj => "ResourceObj",
            ParamKey::WorkflowObj => "WorkflowObj",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|key| key.name() == name)
    }
}

/// Resolved parameter values for one role tuple.
pub type ParamMap = HashMap<ParamKey, String>;

fn obj(value: &str) -> String {
    if value.is_empty() {
        "*".to_string()
    } else {
        value.to_string()
    }
}

/// Build the parameter map for a tuple. `*Obj` slots substitute `*` for empty
/// values; plain slots stay empty so they can be stored as NULL.
pub fn param_map(tuple: &RoleTuple) -> ParamMap {
    let mut params = ParamMap::new();
    params.insert(ParamKey::Entity, tuple.entity.clone());
    if tuple.entity == ENTITY_CLUSTER {
        params.insert(ParamKey::Cluster, tuple.cluster.clone());
        params.insert(ParamKey::Namespace, tuple.namespace.clone());
        params.insert(ParamKey::Group, tuple.group.clone());
        params.insert(ParamKey::Kind, tuple.kind.clone());
        params.insert(ParamKey::Resource, tuple.resource.clone());
        params.insert(ParamKey::ClusterObj, obj(&tuple.cluster));
        params.insert(ParamKey::NamespaceObj, obj(&tuple.namespace));
        params.insert(ParamKey::GroupObj, obj(&tuple.group));
        params.insert(ParamKey::KindObj, obj(&tuple.kind));
        params.insert(ParamKey::ResourceObj, obj(&tuple.resource));
    } else {
        params.insert(ParamKey::EntityName, tuple.entity_name.clone());
        params.insert(ParamKey::Team, tuple.team.clone());
        params.insert(ParamKey::App, tuple.entity_name.clone());
        params.insert(ParamKey::Env, tuple.environment.clone());
        params.insert(ParamKey::TeamObj, obj(&tuple.team));
        params.insert(ParamKey::AppObj, obj(&tuple.entity_name));
        params.insert(ParamKey::EnvObj, obj(&tuple.environment));
        if tuple.entity == ENTITY_JOBS {
            params.insert(ParamKey::Workflow, tuple.workflow.clone());
            params.insert(ParamKey::WorkflowObj, obj(&tuple.workflow));
        }
    }
    params
}

/// A default template in one of the two dialects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Template {
    GoTemplate(String),
    Indexed {
        value: String,
        index_key_map: BTreeMap<usize, ParamKey>,
    },
}

const OPEN: &str = "{{.";
const CLOSE: &str = "}}";

impl Template {
    /// Rebuild an indexed template from its stored form. Map values are
    /// parameter names.
    pub fn indexed_from_parts(value: String, index_key_map: &str) -> Result<Self> {
        let raw: BTreeMap<usize, String> = serde_json::from_str(index_key_map).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Invalid index key map: {}", e))
        })?;
        let mut map = BTreeMap::new();
        for (position, name) in raw {
            let key = ParamKey::from_name(&name).ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!("Unknown template parameter: {}", name))
            })?;
            if value.as_bytes().get(position) != Some(&b'%') {
                return Err(AppError::Internal(anyhow::anyhow!(
                    "Index {} does not point at a sentinel",
                    position
                )));
            }
            map.insert(position, key);
        }
        Ok(Template::Indexed {
            value,
            index_key_map: map,
        })
    }

    /// Compile a Go-style template into the indexed dialect. Unknown
    /// placeholders are rejected so both dialects stay equivalent.
    pub fn compile(&self) -> Result<Template> {
        let source = match self {
            Template::Indexed { .. } => return Ok(self.clone()),
            Template::GoTemplate(source) => source,
        };

        let mut value = String::with_capacity(source.len());
        let mut index_key_map = BTreeMap::new();
        let mut rest = source.as_str();
        while let Some(start) = rest.find(OPEN) {
            value.push_str(&rest[..start]);
            let after = &rest[start + OPEN.len()..];
            let end = after.find(CLOSE).ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!("Unterminated template placeholder"))
            })?;
            let name = after[..end].trim();
            let key = ParamKey::from_name(name).ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!("Unknown template parameter: {}", name))
            })?;
            index_key_map.insert(value.len(), key);
            value.push('%');
            rest = &after[end + CLOSE.len()..];
        }
        value.push_str(rest);

        Ok(Template::Indexed {
            value,
            index_key_map,
        })
    }

    /// Render against a parameter map. Missing parameters render as empty.
    pub fn render(&self, params: &ParamMap) -> String {
        match self {
            Template::GoTemplate(source) => {
                let mut out = String::with_capacity(source.len());
                let mut rest = source.as_str();
                while let Some(start) = rest.find(OPEN) {
                    out.push_str(&rest[..start]);
                    let after = &rest[start + OPEN.len()..];
                    match after.find(CLOSE) {
                        Some(end) => {
                            if let Some(key) = ParamKey::from_name(after[..end].trim()) {
                                if let Some(v) = params.get(&key) {
                                    out.push_str(v);
                                }
                            }
                            rest = &after[end + CLOSE.len()..];
                        }
                        None => {
                            out.push_str(&rest[start..]);
                            rest = "";
                        }
                    }
                }
                out.push_str(rest);
                out
            }
            Template::Indexed {
                value,
                index_key_map,
            } => {
                if index_key_map.is_empty() {
                    return value.clone();
                }
                let bytes = value.as_bytes();
                let mut out: Vec<u8> = Vec::with_capacity(bytes.len() + 32);
                for (i, b) in bytes.iter().enumerate() {
                    match (b, index_key_map.get(&i)) {
                        (b'%', Some(key)) => {
                            if let Some(v) = params.get(key) {
                                out.extend_from_slice(v.as_bytes());
                            }
                        }
                        _ => out.push(*b),
                    }
                }
                // Substitutions are whole UTF-8 strings spliced at ASCII
                // positions, so the output stays valid UTF-8.
                String::from_utf8_lossy(&out).into_owned()
            }
        }
    }

    /// Render and decode the result as JSON.
    pub fn render_json<T: serde::de::DeserializeOwned>(&self, params: &ParamMap) -> Result<T> {
        let rendered = self.render(params);
        serde_json::from_str(&rendered).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Rendered template is not valid JSON: {}", e))
        })
    }
}
