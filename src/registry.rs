use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    credentials::CredentialStore,
    error::DispatchError,
    gateway::{GatewayFactory, PushGateway},
    metrics,
};

/// How many times a resolve reloads after its load was invalidated midway.
const MAX_LOAD_ATTEMPTS: usize = 3;

/// Empty, whitespace and the literals "undefined" and "null" all mean "no tenant".
pub fn is_missing_tenant_id(tenant_id: &str) -> bool {
    let trimmed = tenant_id.trim();
    trimmed.is_empty() || trimmed == "undefined" || trimmed == "null"
}

#[derive(Default)]
struct Cache {
    handles: HashMap<String, Arc<dyn PushGateway>>,
    /// Bumped by `invalidate(tenant)`.
    generations: HashMap<String, u64>,
    /// Bumped by `invalidate_all`.
    epoch: u64,
}

impl Cache {
    fn stamp(&self, tenant_id: &str) -> (u64, u64) {
        (
            self.epoch,
            self.generations.get(tenant_id).copied().unwrap_or(0),
        )
    }
}

/// Process-wide cache of initialized per-tenant push handles.
///
/// Handles are built lazily from the credential store on first use. Two
/// concurrent first-time resolves for the same tenant may both build a
/// handle; the first insert wins and the loser is released. Invalidating a
/// tenant bumps that tenant's generation, so a resolve which loaded its blob
/// before the invalidation releases the stale handle and loads again. Other
/// tenants' in-flight resolves are unaffected.
pub struct TenantRegistry {
    store: Arc<dyn CredentialStore>,
    factory: Arc<dyn GatewayFactory>,
    cache: RwLock<Cache>,
}

impl TenantRegistry {
    pub fn new(store: Arc<dyn CredentialStore>, factory: Arc<dyn GatewayFactory>) -> Self {
        Self {
            store,
            factory,
            cache: RwLock::new(Cache::default()),
        }
    }

    pub async fn resolve(&self, tenant_id: &str) -> Result<Arc<dyn PushGateway>, DispatchError> {
        if is_missing_tenant_id(tenant_id) {
            return Err(DispatchError::TenantIdMissing);
        }
        let tenant_id = tenant_id.trim();

        for attempt in 1..=MAX_LOAD_ATTEMPTS {
            let stamp = {
                let cache = self.cache.read().await;
                if let Some(handle) = cache.handles.get(tenant_id) {
                    metrics::REGISTRY_CACHE_HITS.inc();
                    debug!(tenant_id = %tenant_id, "Using cached push gateway");
                    return Ok(handle.clone());
                }
                cache.stamp(tenant_id)
            };
            metrics::REGISTRY_CACHE_MISSES.inc();

            let handle = self.load(tenant_id).await?;

            let mut cache = self.cache.write().await;
            if cache.stamp(tenant_id) != stamp {
                drop(cache);
                warn!(
                    tenant_id = %tenant_id,
                    attempt,
                    "Tenant cache invalidated during load, reloading"
                );
                handle.release().await;
                continue;
            }
            if let Some(existing) = cache.handles.get(tenant_id) {
                let existing = existing.clone();
                drop(cache);
                debug!(tenant_id = %tenant_id, "Lost handle construction race, releasing duplicate");
                handle.release().await;
                return Ok(existing);
            }
            cache.handles.insert(tenant_id.to_string(), handle.clone());
            drop(cache);

            info!(tenant_id = %tenant_id, "Created push gateway for tenant");
            return Ok(handle);
        }

        Err(DispatchError::Gateway {
            tenant_id: tenant_id.to_string(),
            message: "credential kept changing while loading".to_string(),
        })
    }

    async fn load(&self, tenant_id: &str) -> Result<Arc<dyn PushGateway>, DispatchError> {
        metrics::CREDENTIAL_LOADS.inc();
        let blob = match self.store.get(tenant_id).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                return Err(DispatchError::CredentialNotFound {
                    tenant_id: tenant_id.to_string(),
                })
            }
            // The store refuses ids it can never hold a credential for.
            Err(DispatchError::Validation(reason)) => {
                warn!(tenant_id = %tenant_id, reason = %reason, "Unusable tenant id");
                return Err(DispatchError::TenantIdMissing);
            }
            Err(e) => return Err(e),
        };
        self.factory.build(tenant_id, &blob).await
    }

    /// Drops the cached handle for one tenant. Returns whether one existed.
    pub async fn invalidate(&self, tenant_id: &str) -> bool {
        let tenant_id = tenant_id.trim();
        let removed = {
            let mut cache = self.cache.write().await;
            *cache.generations.entry(tenant_id.to_string()).or_default() += 1;
            cache.handles.remove(tenant_id)
        };

        match removed {
            Some(handle) => {
                handle.release().await;
                info!(tenant_id = %tenant_id, "Tenant cache cleared");
                true
            }
            None => {
                debug!(tenant_id = %tenant_id, "No cached push gateway for tenant");
                false
            }
        }
    }

    /// Releases and clears every cached handle.
    pub async fn invalidate_all(&self) -> usize {
        let drained: Vec<(String, Arc<dyn PushGateway>)> = {
            let mut cache = self.cache.write().await;
            cache.epoch += 1;
            cache.handles.drain().collect()
        };

        for (tenant_id, handle) in &drained {
            handle.release().await;
            debug!(tenant_id = %tenant_id, "Released push gateway");
        }

        info!(count = drained.len(), "Tenant gateway cache cleared");
        drained.len()
    }

    pub async fn cached_tenants(&self) -> BTreeSet<String> {
        self.cache.read().await.handles.keys().cloned().collect()
    }
}
