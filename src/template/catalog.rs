//! Read-mostly cache of default role / policy templates

use super::{param_map, Template};
use crate::domain::{NewRole, Policy, PolicyList, RoleDescriptor, RoleTuple};
use crate::error::{AppError, Result};
use crate::repository::template::{DefaultTemplateRow, TemplateKind};
use crate::repository::TemplateRepository;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// `(entity, accessType, roleType)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateKey {
    pub entity: String,
    pub access_type: String,
    pub role_type: String,
}

impl TemplateKey {
    pub fn new(
        entity: impl Into<String>,
        access_type: impl Into<String>,
        role_type: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            access_type: access_type.into(),
            role_type: role_type.into(),
        }
    }

    pub fn for_tuple(tuple: &RoleTuple) -> Self {
        Self::new(
            tuple.template_entity(),
            tuple.template_access_type(),
            tuple.template_role_type(),
        )
    }
}

impl std::fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.entity, self.access_type, self.role_type)
    }
}

#[derive(Debug, Clone, Default)]
struct CatalogEntry {
    role: Option<Template>,
    policy: Option<Template>,
}

/// Role row plus the `p` policies it grants.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedRole {
    pub role: NewRole,
    pub policies: Vec<Policy>,
}

pub struct TemplateCatalog<T: TemplateRepository> {
    repo: Arc<T>,
    use_v2: bool,
    entries: RwLock<Arc<HashMap<TemplateKey, CatalogEntry>>>,
}

impl<T: TemplateRepository> TemplateCatalog<T> {
    pub fn new(repo: Arc<T>, use_v2: bool) -> Self {
        Self {
            repo,
            use_v2,
            entries: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    fn to_template(&self, row: &DefaultTemplateRow) -> Result<Template> {
        let template = match row.kind() {
            TemplateKind::Indexed => Template::indexed_from_parts(
                row.value.clone(),
                row.index_key_map.as_deref().unwrap_or("{}"),
            )?,
            TemplateKind::Go => Template::GoTemplate(row.value.clone()),
        };
        if self.use_v2 {
            template.compile()
        } else {
            Ok(template)
        }
    }

    /// Load every default template from the store and swap the cache.
    pub async fn refresh(&self) -> Result<usize> {
        let role_rows = self.repo.list_role_templates().await?;
        let policy_rows = self.repo.list_policy_templates().await?;

        let mut entries: HashMap<TemplateKey, CatalogEntry> = HashMap::new();
        for row in &role_rows {
            match self.to_template(row) {
                Ok(template) => entries.entry(row.key()).or_default().role = Some(template),
                Err(e) => warn!(key = %row.key(), error = %e, "Skipping invalid role template"),
            }
        }
        for row in &policy_rows {
            match self.to_template(row) {
                Ok(template) => entries.entry(row.key()).or_default().policy = Some(template),
                Err(e) => warn!(key = %row.key(), error = %e, "Skipping invalid policy template"),
            }
        }

        let count = entries.len();
        *self.entries.write() = Arc::new(entries);
        info!(templates = count, v2 = self.use_v2, "Default templates loaded");
        Ok(count)
    }

    /// Cached entry, falling back to a direct store lookup on a miss.
    async fn entry(&self, key: &TemplateKey) -> Result<CatalogEntry> {
        if let Some(entry) = self.entries.read().get(key) {
            return Ok(entry.clone());
        }

        debug!(key = %key, "Template cache miss");
        let role = self
            .repo
            .find_role_template(&key.entity, &key.access_type, &key.role_type)
            .await?;
        let policy = self
            .repo
            .find_policy_template(&key.entity, &key.access_type, &key.role_type)
            .await?;
        let entry = CatalogEntry {
            role: role.as_ref().map(|row| self.to_template(row)).transpose()?,
            policy: policy.as_ref().map(|row| self.to_template(row)).transpose()?,
        };

        if entry.role.is_some() {
            let mut guard = self.entries.write();
            let mut next = HashMap::clone(&guard);
            next.insert(key.clone(), entry.clone());
            *guard = Arc::new(next);
        }
        Ok(entry)
    }

    /// Render the role row and its policies for one concrete tuple.
    pub async fn render(&self, tuple: &RoleTuple) -> Result<RenderedRole> {
        let key = TemplateKey::for_tuple(tuple);
        let entry = self.entry(&key).await?;
        let role_template = entry.role.ok_or_else(|| {
            AppError::BadRequest(format!("No default role template for {}", key))
        })?;

        let params = param_map(tuple);
        let descriptor: RoleDescriptor = role_template.render_json(&params)?;
        if descriptor.role.is_empty() {
            return Err(AppError::Internal(anyhow::anyhow!(
                "Role template {} rendered an empty role key",
                key
            )));
        }

        let policies = match entry.policy {
            Some(template) => template.render_json::<PolicyList>(&params)?.data,
            None => Vec::new(),
        };

        Ok(RenderedRole {
            role: NewRole {
                role: descriptor.role,
                tuple: tuple.clone(),
            },
            policies,
        })
    }

    pub fn uses_v2(&self) -> bool {
        self.use_v2
    }
}
