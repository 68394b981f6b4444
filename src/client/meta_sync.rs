use crate::client::engine::SyncEngine;
use crate::client::errors::SyncError;
use crate::client::local_store::LocalStore;
use crate::client::transport::SyncTransport;
use crate::core::models::{
    meta::{MetaBundle, MetaKind},
    settings,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Keeps a budget's category, member and source lists in step with the server.
///
/// The server stores whole bundles and the last writer wins. Pulling never lets an empty
/// server list wipe a populated local one. Servers without the budget metadata endpoint are
/// handled by keeping bundles in the user's settings under `metaByBudget`.
pub struct MetaSync {
    store: Arc<LocalStore>,
    transport: Arc<dyn SyncTransport>,
}

impl MetaSync {
    pub fn new(store: Arc<LocalStore>, transport: Arc<dyn SyncTransport>) -> Self {
        MetaSync { store, transport }
    }

    pub fn for_engine(engine: &SyncEngine) -> Self {
        MetaSync::new(Arc::clone(engine.store()), Arc::clone(engine.transport()))
    }

    pub async fn local(&self, budget_id: i64) -> MetaBundle {
        self.store.meta(budget_id).await
    }

    pub async fn pull(&self, budget_id: i64) -> Result<MetaBundle, SyncError> {
        let server = self.fetch(budget_id).await?;
        let mut bundle = self.store.meta(budget_id).await;
        bundle.merge_from_server(server);
        self.store.set_meta(budget_id, bundle.clone()).await;
        debug!("Pulled metadata for budget {}", budget_id);
        Ok(bundle)
    }

    /// Sends the whole local bundle and keeps the server's echo.
    pub async fn push(&self, budget_id: i64) -> Result<MetaBundle, SyncError> {
        let bundle = self.store.meta(budget_id).await;
        let stored = self.store_remote(budget_id, bundle).await?;
        self.store.set_meta(budget_id, stored.clone()).await;
        info!("Pushed metadata for budget {}", budget_id);
        Ok(stored)
    }

    async fn fetch(&self, budget_id: i64) -> Result<MetaBundle, SyncError> {
        match self.transport.get_meta(budget_id).await {
            Err(e) if endpoint_missing(&e) => {
                warn!("Budget metadata unavailable, reading settings instead: {}", e);
                let settings = self.transport.get_settings().await?;
                Ok(settings::budget_meta(&settings, budget_id))
            }
            other => other,
        }
    }

    async fn store_remote(&self, budget_id: i64, bundle: MetaBundle) -> Result<MetaBundle, SyncError> {
        match self.transport.put_meta(budget_id, bundle.clone()).await {
            Err(e) if endpoint_missing(&e) => {
                warn!("Budget metadata unavailable, writing settings instead: {}", e);
                let current = self.transport.get_settings().await?;
                let next = settings::with_budget_meta(current, budget_id, &bundle);
                self.transport.put_settings(next).await?;
                Ok(bundle)
            }
            other => other,
        }
    }

    /// Appends `label` unless an equal label is already listed.
    pub async fn add_label(&self, budget_id: i64, kind: MetaKind, label: &str) -> Result<MetaBundle, SyncError> {
        let label = clean_label(label)?;
        let mut bundle = self.store.meta(budget_id).await;
        let list = bundle.list_mut(kind);
        if list.iter().any(|existing| existing == &label) {
            return Ok(bundle);
        }
        list.push(label);
        self.store.set_meta(budget_id, bundle).await;
        self.push(budget_id).await
    }

    pub async fn rename_label(
        &self,
        budget_id: i64,
        kind: MetaKind,
        from: &str,
        to: &str,
    ) -> Result<MetaBundle, SyncError> {
        let to = clean_label(to)?;
        let mut bundle = self.store.meta(budget_id).await;
        let list = bundle.list_mut(kind);
        let Some(pos) = list.iter().position(|existing| existing == from) else {
            return Err(SyncError::NotFound(format!("label {}", from)));
        };
        if list.iter().any(|existing| existing == &to) {
            list.remove(pos);
        } else {
            list[pos] = to;
        }
        self.store.set_meta(budget_id, bundle).await;
        self.push(budget_id).await
    }

    pub async fn remove_label(&self, budget_id: i64, kind: MetaKind, label: &str) -> Result<MetaBundle, SyncError> {
        let mut bundle = self.store.meta(budget_id).await;
        let list = bundle.list_mut(kind);
        let before = list.len();
        list.retain(|existing| existing != label);
        if list.len() == before {
            return Ok(bundle);
        }
        self.store.set_meta(budget_id, bundle).await;
        self.push(budget_id).await
    }
}

/// A 404 or a non-JSON answer means the server predates budget metadata.
fn endpoint_missing(err: &SyncError) -> bool {
    matches!(err, SyncError::NotFound(_) | SyncError::Decode(_))
}

fn clean_label(label: &str) -> Result<String, SyncError> {
    let label = label.trim();
    if label.is_empty() {
        return Err(SyncError::Malformed("label cannot be empty".to_string()));
    }
    Ok(label.to_string())
}
