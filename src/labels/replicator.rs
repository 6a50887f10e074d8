//! Label replicator with a read-mostly, per-account label-id cache.
//!
//! Lookup order for each taxonomy value: memory cache, `label_cache` table,
//! provider label list (exact remote name), and only then `create_label`.
//! A cached id the provider no longer knows drops the account's cache and
//! the labels are resolved once more.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{LabelError, ProviderError};
use crate::labels::{is_hidden, label_targets, pick_color};
use crate::pipeline::types::Classification;
use crate::providers::{
    CredentialSource, LabelSpec, ProviderAdapter, RemoteLabel, with_auth_refresh,
};
use crate::store::traits::{Account, CachedLabel, Database};

/// Writes a classification back to the mailbox as labels (and a folder).
pub struct LabelReplicator {
    db: Arc<dyn Database>,
    credentials: Arc<dyn CredentialSource>,
    /// account id → taxonomy name → cached label.
    cache: RwLock<HashMap<String, HashMap<String, CachedLabel>>>,
    /// account id → lock held while resolving a cache miss, so one name is
    /// created once per account.
    create_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LabelReplicator {
    pub fn new(db: Arc<dyn Database>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            db,
            credentials,
            cache: RwLock::new(HashMap::new()),
            create_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Apply every label of `classification` to one message in a single call,
    /// then move it into the topic folder when the provider has folders.
    ///
    /// Returns the number of labels applied.
    pub async fn replicate(
        &self,
        adapter: &dyn ProviderAdapter,
        account: &Account,
        message_id: &str,
        classification: &Classification,
    ) -> Result<usize, LabelError> {
        let folders = adapter.supports_folders();
        let names = label_targets(classification, folders);

        let mut ids = self.resolve_all(adapter, account, &names).await?;
        match self.apply(adapter, account, message_id, &ids).await {
            Err(e @ (ProviderError::NotFound { .. } | ProviderError::InvalidResponse { .. })) => {
                warn!(
                    account = %account.id,
                    message = %message_id,
                    error = %e,
                    "Cached label ids rejected, refreshing label cache"
                );
                self.invalidate(&account.id).await?;
                ids = self.resolve_all(adapter, account, &names).await?;
                self.apply(adapter, account, message_id, &ids).await?;
            }
            other => other?,
        }

        if folders {
            let topic = classification.topic.as_str();
            with_auth_refresh(self.credentials.as_ref(), account, move || {
                adapter.move_to_folder(account, message_id, topic)
            })
            .await?;
        }

        debug!(
            account = %account.id,
            message = %message_id,
            labels = ids.len(),
            folder = folders,
            "Labels replicated"
        );
        Ok(ids.len())
    }

    /// Forget every cached label id of an account, in memory and stored.
    pub async fn invalidate(&self, account_id: &str) -> Result<(), LabelError> {
        let lock = self.account_lock(account_id).await;
        let _guard = lock.lock().await;
        self.db.clear_cached_labels(account_id).await?;
        self.cache
            .write()
            .await
            .insert(account_id.to_string(), HashMap::new());
        Ok(())
    }

    async fn apply(
        &self,
        adapter: &dyn ProviderAdapter,
        account: &Account,
        message_id: &str,
        ids: &[String],
    ) -> Result<(), ProviderError> {
        with_auth_refresh(self.credentials.as_ref(), account, move || {
            adapter.apply_labels(account, message_id, ids)
        })
        .await
    }

    async fn resolve_all(
        &self,
        adapter: &dyn ProviderAdapter,
        account: &Account,
        names: &[String],
    ) -> Result<Vec<String>, LabelError> {
        let mut remote = None;
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            ids.push(self.resolve(adapter, account, name, &mut remote).await?);
        }
        Ok(ids)
    }

    async fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.create_locks.lock().await;
        Arc::clone(locks.entry(account_id.to_string()).or_default())
    }

    /// Remote id for one taxonomy name, creating the label on first use.
    async fn resolve(
        &self,
        adapter: &dyn ProviderAdapter,
        account: &Account,
        name: &str,
        remote: &mut Option<Vec<RemoteLabel>>,
    ) -> Result<String, LabelError> {
        if let Some(hit) = self.cached(&account.id, name).await? {
            return Ok(hit.remote_id);
        }

        let lock = self.account_lock(&account.id).await;
        let _guard = lock.lock().await;
        // Another worker may have resolved it while we waited.
        if let Some(hit) = self.cached(&account.id, name).await? {
            return Ok(hit.remote_id);
        }

        if remote.is_none() {
            let listed = with_auth_refresh(self.credentials.as_ref(), account, move || {
                adapter.list_labels(account)
            })
            .await?;
            *remote = Some(listed);
        }
        let labels = remote.get_or_insert_with(Vec::new);
        let remote_name = adapter.remote_label_name(name);

        let label = match labels.iter().find(|l| l.name == remote_name) {
            Some(existing) => {
                debug!(account = %account.id, label = %remote_name, "Reusing existing remote label");
                existing.clone()
            }
            None => {
                let used: Vec<String> = labels.iter().filter_map(|l| l.color.clone()).collect();
                let color = adapter
                    .reserved_color(name)
                    .or_else(|| pick_color(adapter.palette(), &used));
                let spec = LabelSpec {
                    name: remote_name,
                    color: color.map(String::from),
                    hidden: is_hidden(name),
                };
                let spec = &spec;
                let created = with_auth_refresh(self.credentials.as_ref(), account, move || {
                    adapter.create_label(account, spec)
                })
                .await?;
                info!(
                    account = %account.id,
                    label = %created.name,
                    id = %created.id,
                    color = created.color.as_deref().unwrap_or("none"),
                    "Created remote label"
                );
                labels.push(created.clone());
                created
            }
        };

        let entry = CachedLabel {
            name: name.to_string(),
            remote_id: label.id.clone(),
            color: label.color,
        };
        self.db.put_cached_label(&account.id, &entry).await?;
        self.cache
            .write()
            .await
            .entry(account.id.clone())
            .or_default()
            .insert(name.to_string(), entry);
        Ok(label.id)
    }

    /// Memory lookup, loading the account's stored cache on first access.
    async fn cached(&self, account_id: &str, name: &str) -> Result<Option<CachedLabel>, LabelError> {
        if let Some(labels) = self.cache.read().await.get(account_id) {
            return Ok(labels.get(name).cloned());
        }

        let stored = self.db.get_cached_labels(account_id).await?;
        let mut cache = self.cache.write().await;
        let labels = cache
            .entry(account_id.to_string())
            .or_insert_with(|| stored.into_iter().map(|l| (l.name.clone(), l)).collect());
        Ok(labels.get(name).cloned())
    }
}
