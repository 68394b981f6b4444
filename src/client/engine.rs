//! Client side of the sync protocol.
//!
//! A session is one (mode, budget) pair. Changing either cancels the session's background tasks
//! and bumps a generation counter; requests that were already in flight finish, but their
//! results are dropped when the generation they started under is no longer current.

use crate::client::errors::SyncError;
use crate::client::local_store::{LocalStore, LocalTransaction, Origin, TransactionDraft, TransactionPatch};
use crate::client::transport::SyncTransport;
use crate::core::fingerprint;
use crate::core::models::{
    event::{ChangeEvent, UpdateOp, UpdatePayload},
    sync::{BulkItem, BulkUpsertOutcome},
    transaction::RecordId,
};
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    Local,
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Pulling,
    Pushing,
    Ok,
    Live,
    Error,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub pull_interval: Duration,
    pub push_debounce: Duration,
    pub push_attempts: u32,
    pub retry_base: Duration,
    /// Push and pull as soon as a server session starts.
    pub sync_on_start: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            pull_interval: Duration::from_secs(5),
            push_debounce: Duration::from_millis(800),
            push_attempts: 3,
            retry_base: Duration::from_millis(500),
            sync_on_start: true,
        }
    }
}

struct Session {
    generation: u64,
    mode: SyncMode,
    budget_id: Option<i64>,
    cancel: CancellationToken,
}

pub struct SyncEngine {
    store: Arc<LocalStore>,
    transport: Arc<dyn SyncTransport>,
    config: ClientConfig,
    session: Mutex<Session>,
    sync_lock: tokio::sync::Mutex<()>,
    push_wanted: Notify,
    live: AtomicBool,
    status: watch::Sender<SyncStatus>,
    updates: broadcast::Sender<UpdatePayload>,
}

impl SyncEngine {
    /// Creates an engine in local mode with no active budget.
    pub fn new(store: Arc<LocalStore>, transport: Arc<dyn SyncTransport>, config: ClientConfig) -> Arc<Self> {
        let (status, _) = watch::channel(SyncStatus::Idle);
        let (updates, _) = broadcast::channel(64);
        Arc::new(SyncEngine {
            store,
            transport,
            config,
            session: Mutex::new(Session {
                generation: 0,
                mode: SyncMode::Local,
                budget_id: None,
                cancel: CancellationToken::new(),
            }),
            sync_lock: tokio::sync::Mutex::new(()),
            push_wanted: Notify::new(),
            live: AtomicBool::new(false),
            status,
            updates,
        })
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn SyncTransport> {
        &self.transport
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Real-time `update` payloads as they arrive, for listeners beyond the transaction list.
    pub fn updates(&self) -> broadcast::Receiver<UpdatePayload> {
        self.updates.subscribe()
    }

    pub fn mode(&self) -> SyncMode {
        self.session().mode
    }

    pub fn budget_id(&self) -> Option<i64> {
        self.session().budget_id
    }

    fn set_status(&self, status: SyncStatus) {
        self.status.send_replace(status);
    }

    pub fn set_mode(self: &Arc<Self>, mode: SyncMode) {
        let budget_id = self.budget_id();
        self.restart(mode, budget_id);
    }

    pub fn set_budget(self: &Arc<Self>, budget_id: Option<i64>) {
        let mode = self.mode();
        self.restart(mode, budget_id);
    }

    /// Starts a server-mode session for `budget_id`, e.g. right after login.
    pub fn start(self: &Arc<Self>, budget_id: i64) {
        self.restart(SyncMode::Server, Some(budget_id));
    }

    /// Cancels background work and falls back to local mode.
    pub fn stop(&self) {
        let mut session = self.session();
        session.cancel.cancel();
        session.generation += 1;
        session.mode = SyncMode::Local;
        session.cancel = CancellationToken::new();
        drop(session);
        self.live.store(false, Ordering::SeqCst);
        self.set_status(SyncStatus::Idle);
        info!("Sync stopped");
    }

    fn restart(self: &Arc<Self>, mode: SyncMode, budget_id: Option<i64>) {
        let (generation, cancel) = {
            let mut session = self.session();
            session.cancel.cancel();
            session.generation += 1;
            session.mode = mode;
            session.budget_id = budget_id;
            session.cancel = CancellationToken::new();
            (session.generation, session.cancel.clone())
        };
        self.live.store(false, Ordering::SeqCst);

        let Some(budget_id) = budget_id.filter(|_| mode == SyncMode::Server) else {
            self.set_status(SyncStatus::Idle);
            debug!("Sync session {} is local only", generation);
            return;
        };
        info!("Sync session {} started for budget {}", generation, budget_id);
        if self.config.sync_on_start {
            tokio::spawn(Arc::clone(self).initial_sync(generation));
        }
        tokio::spawn(Arc::clone(self).pull_loop(generation, cancel.clone()));
        tokio::spawn(Arc::clone(self).push_worker(generation, cancel.clone()));
        tokio::spawn(Arc::clone(self).realtime(generation, budget_id, cancel));
    }

    fn session_budget(&self, generation: u64) -> Result<i64, SyncError> {
        let session = self.session();
        if session.generation != generation || session.mode != SyncMode::Server {
            return Err(SyncError::SessionEnded);
        }
        session.budget_id.ok_or(SyncError::NoActiveBudget)
    }

    fn ensure_current(&self, generation: u64) -> Result<(), SyncError> {
        self.session_budget(generation).map(|_| ())
    }

    fn current_generation(&self) -> u64 {
        self.session().generation
    }

    /// Publishes the outcome of a pass, unless its session has been replaced meanwhile.
    fn finish<T>(&self, generation: u64, result: &Result<T, SyncError>) {
        if self.current_generation() != generation {
            return;
        }
        match result {
            Ok(_) if self.live.load(Ordering::SeqCst) => self.set_status(SyncStatus::Live),
            Ok(_) => self.set_status(SyncStatus::Ok),
            Err(SyncError::SessionEnded) => {}
            Err(_) => self.set_status(SyncStatus::Error),
        }
    }

    // LOCAL OPERATIONS

    pub async fn add(&self, mut draft: TransactionDraft) -> LocalTransaction {
        if draft.budget_id.is_none() {
            draft.budget_id = self.budget_id();
        }
        let record = self.store.add(draft).await;
        self.request_push();
        record
    }

    pub async fn update(&self, patch: TransactionPatch) -> Option<LocalTransaction> {
        let record = self.store.update(patch).await;
        if record.is_some() {
            self.request_push();
        }
        record
    }

    /// Tombstones locally; server copies are also deleted on the server when online.
    pub async fn delete(&self, id: &RecordId) -> Option<LocalTransaction> {
        let record = self.store.soft_delete(id).await?;
        let server_id = (record.origin == Origin::Server)
            .then(|| record.id.as_int())
            .flatten();
        if let (Some(server_id), SyncMode::Server) = (server_id, self.mode()) {
            match self.transport.soft_delete(server_id).await {
                Ok(outcome) => debug!("Server tombstoned {} at {}", outcome.id, outcome.deleted_at),
                Err(e) => warn!("Server delete of {} failed, left to the next push: {}", server_id, e),
            }
        }
        self.request_push();
        Some(record)
    }

    /// Active records of the current budget, plus records not yet tied to a budget.
    pub async fn transactions(&self) -> Vec<LocalTransaction> {
        let budget_id = self.budget_id();
        self.store
            .get_all()
            .await
            .into_iter()
            .filter(|t| t.is_active() && (t.budget_id.is_none() || t.budget_id == budget_id))
            .collect()
    }

    fn request_push(&self) {
        if self.mode() == SyncMode::Server {
            self.push_wanted.notify_one();
        }
    }

    pub async fn push_now(&self) -> Result<BulkUpsertOutcome, SyncError> {
        self.run_push(self.current_generation()).await
    }

    pub async fn pull_now(&self) -> Result<usize, SyncError> {
        self.run_pull(self.current_generation()).await
    }

    // PULL

    async fn run_pull(&self, generation: u64) -> Result<usize, SyncError> {
        let result = match self.ensure_current(generation) {
            Ok(()) => {
                self.set_status(SyncStatus::Pulling);
                self.pull(generation).await
            }
            Err(e) => Err(e),
        };
        self.finish(generation, &result);
        result
    }

    async fn pull(&self, generation: u64) -> Result<usize, SyncError> {
        let budget_id = self.session_budget(generation)?;
        let _guard = self.sync_lock.lock().await;

        let records = self.transport.list_active(budget_id).await?;
        self.ensure_current(generation)?;
        let imported = self.store.import_batch(records).await;

        let since = self.store.tombstone_cursor(budget_id).await;
        let tombstones = self.transport.list_tombstones(budget_id, since).await?;
        self.ensure_current(generation)?;
        let deleted = self.store.apply_tombstones(budget_id, &tombstones).await;
        if let Some(cursor) = tombstones.iter().map(|t| t.seq).max() {
            self.store.set_tombstone_cursor(budget_id, cursor).await;
        }
        debug!(
            "Pulled budget {}: {} record(s), {} new deletion(s)",
            budget_id, imported, deleted
        );
        Ok(imported)
    }

    // PUSH

    async fn run_push(&self, generation: u64) -> Result<BulkUpsertOutcome, SyncError> {
        let result = match self.ensure_current(generation) {
            Ok(()) => {
                self.set_status(SyncStatus::Pushing);
                self.push(generation).await
            }
            Err(e) => Err(e),
        };
        self.finish(generation, &result);
        result
    }

    async fn push(&self, generation: u64) -> Result<BulkUpsertOutcome, SyncError> {
        let budget_id = self.session_budget(generation)?;
        let _guard = self.sync_lock.lock().await;

        let items: Vec<BulkItem> = self
            .store
            .get_all()
            .await
            .iter()
            .filter(|t| t.needs_push() && t.budget_id.is_none_or(|b| b == budget_id))
            .map(|t| bulk_item(budget_id, t))
            .collect();
        if items.is_empty() {
            return Ok(BulkUpsertOutcome::default());
        }

        let submitted = items.len();
        let outcome = self.bulk_with_retry(budget_id, items).await?;
        self.ensure_current(generation)?;

        // Import first so a tombstone written during the request carries over by content.
        self.store.import_batch(outcome.records().cloned().collect()).await;
        for mapping in &outcome.mapping {
            if let Some(client_id) = &mapping.client_id {
                if !client_id.loosely_eq(&RecordId::Int(mapping.server_id)) {
                    self.store.hard_remove(client_id).await;
                }
            }
        }
        info!(
            "Pushed {} item(s) to budget {}: {} created, {} duplicate, {} updated",
            submitted,
            budget_id,
            outcome.created.len(),
            outcome.duplicates.len(),
            outcome.updated.len()
        );
        Ok(outcome)
    }

    async fn bulk_with_retry(&self, budget_id: i64, items: Vec<BulkItem>) -> Result<BulkUpsertOutcome, SyncError> {
        let mut delay = self.config.retry_base;
        let mut attempt = 1;
        loop {
            match self.transport.bulk_upsert(budget_id, items.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < self.config.push_attempts => {
                    warn!("Push attempt {} failed, retrying in {:?}: {}", attempt, delay, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // BACKGROUND TASKS

    async fn initial_sync(self: Arc<Self>, generation: u64) {
        if let Err(e) = self.run_push(generation).await {
            warn!("Initial push failed: {}", e);
        }
        if let Err(e) = self.run_pull(generation).await {
            warn!("Initial pull failed: {}", e);
        }
    }

    async fn pull_loop(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        let every = self.config.pull_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_pull(generation).await {
                        warn!("Periodic pull failed: {}", e);
                    }
                }
            }
        }
    }

    /// Coalesces bursts of local edits into one push after a quiet period.
    async fn push_worker(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = self.push_wanted.notified() => {}
            }
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = self.push_wanted.notified() => continue,
                    _ = tokio::time::sleep(self.config.push_debounce) => break,
                }
            }
            if let Err(e) = self.run_push(generation).await {
                warn!("Background push failed: {}", e);
            }
        }
    }

    async fn realtime(self: Arc<Self>, generation: u64, budget_id: i64, cancel: CancellationToken) {
        let mut events = match self.transport.subscribe(budget_id).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Real-time channel unavailable for budget {}: {}", budget_id, e);
                return;
            }
        };
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = events.next() => next,
            };
            match next {
                Some(Ok(ChangeEvent::Hello)) => {
                    if self.current_generation() == generation {
                        self.live.store(true, Ordering::SeqCst);
                        self.set_status(SyncStatus::Live);
                    }
                }
                Some(Ok(ChangeEvent::Ping)) => {}
                Some(Ok(ChangeEvent::Update(payload))) => {
                    debug!("Update {:?} on budget {}", payload.op, payload.budget_id);
                    let _ = self.updates.send(payload.clone());
                    if payload.op != UpdateOp::Meta {
                        if let Err(e) = self.run_pull(generation).await {
                            warn!("Pull after update failed: {}", e);
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!("Real-time channel failed: {}", e);
                    break;
                }
                None => break,
            }
        }
        if self.current_generation() == generation {
            self.live.store(false, Ordering::SeqCst);
        }
        debug!("Real-time channel closed for budget {}", budget_id);
    }
}

fn bulk_item(budget_id: i64, record: &LocalTransaction) -> BulkItem {
    let content_hash = record.fields.content_hash();
    BulkItem {
        client_id: Some(record.id.clone()),
        idempotency_key: Some(fingerprint::idempotency_key(budget_id, &content_hash, &record.fields)),
        content_hash: Some(content_hash),
        fields: record.fields.clone(),
        deleted_at: record.deleted_at,
    }
}
