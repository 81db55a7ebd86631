//! Tenant resolution: maps an authenticated identity onto the set of
//! tenants it may query. Two providers exist behind one client, picked
//! by configuration.

use crate::auth::Identity;
use crate::config::LabelsConfig;
use enforcer::TenantSet;
use sqlx::MySqlPool;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TenantError {
    #[error("tenant lookup failed: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct TenantProvider {
    admin_group: Option<String>,
    inner: ProviderInner,
}

#[derive(Clone)]
enum ProviderInner {
    ConfigMap(Arc<StaticMappings>),
    Mysql(MySqlPool),
}

impl TenantProvider {
    pub fn configmap(labels: LabelsConfig, admin_group: Option<String>) -> Self {
        TenantProvider {
            admin_group,
            inner: ProviderInner::ConfigMap(Arc::new(StaticMappings::from(labels))),
        }
    }

    pub fn mysql(pool: MySqlPool, admin_group: Option<String>) -> Self {
        TenantProvider {
            admin_group,
            inner: ProviderInner::Mysql(pool),
        }
    }

    /// Union of the user's own entry and every group entry. Members of
    /// the admin group get the sentinel set and bypass rewriting.
    pub async fn resolve(&self, identity: &Identity) -> Result<TenantSet, TenantError> {
        if let Some(admin) = &self.admin_group
            && identity.in_group(admin)
        {
            return Ok(TenantSet::all());
        }

        match &self.inner {
            ProviderInner::ConfigMap(mappings) => Ok(mappings.resolve(identity)),
            ProviderInner::Mysql(pool) => resolve_from_db(pool, identity).await,
        }
    }
}

/// The configmap variant: two maps loaded from the labels file.
/// Missing keys contribute nothing.
struct StaticMappings {
    users: HashMap<String, Vec<String>>,
    groups: HashMap<String, Vec<String>>,
}

impl From<LabelsConfig> for StaticMappings {
    fn from(labels: LabelsConfig) -> Self {
        StaticMappings {
            users: labels.users,
            groups: labels.groups,
        }
    }
}

impl StaticMappings {
    fn resolve(&self, identity: &Identity) -> TenantSet {
        let mut tenants = BTreeSet::new();
        if let Some(own) = self.users.get(&identity.preferred_username) {
            tenants.extend(own.iter().cloned());
        }
        for group in &identity.groups {
            if let Some(entry) = self.groups.get(group) {
                tenants.extend(entry.iter().cloned());
            }
        }
        TenantSet::Names(tenants)
    }
}

/// The relational variant. Both lookups use bound parameters; caller
/// input never reaches the statement text.
async fn resolve_from_db(pool: &MySqlPool, identity: &Identity) -> Result<TenantSet, TenantError> {
    let mut tenants: BTreeSet<String> =
        sqlx::query_scalar::<_, String>("SELECT tenant FROM user_tenants WHERE username = ?")
            .bind(&identity.preferred_username)
            .fetch_all(pool)
            .await?
            .into_iter()
            .collect();

    for group in &identity.groups {
        let rows =
            sqlx::query_scalar::<_, String>("SELECT tenant FROM group_tenants WHERE group_name = ?")
                .bind(group)
                .fetch_all(pool)
                .await?;
        tenants.extend(rows);
    }

    Ok(TenantSet::Names(tenants))
}
