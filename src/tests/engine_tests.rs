use crate::client::engine::{ClientConfig, SyncEngine, SyncMode, SyncStatus};
use crate::client::errors::SyncError;
use crate::client::local_store::{LocalDefaults, LocalStore, Origin, TransactionDraft};
use crate::client::transport::{EventStream, SyncTransport};
use crate::core::models::{
    event::{ChangeEvent, UpdateOp},
    meta::MetaBundle,
    sync::{BulkItem, BulkUpsertOutcome, SoftDeleteOutcome},
    transaction::{RecordId, Tombstone, Transaction, TransactionKind},
};
use crate::core::services::BudgetService;
use crate::infrastructure::storage::in_memory::InMemoryStorage;
use crate::tests::{DirectTransport, create_test_service, expense, owner_with_budget};
use async_trait::async_trait;
use serde_json::Value;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use std::time::Duration;

/// Background work only runs when a test asks for it.
fn quiet_config() -> ClientConfig {
    ClientConfig {
        pull_interval: Duration::from_secs(3600),
        push_debounce: Duration::from_secs(3600),
        push_attempts: 3,
        retry_base: Duration::from_millis(1),
        sync_on_start: false,
    }
}

fn draft(amount: f64, category: &str) -> TransactionDraft {
    TransactionDraft::new(TransactionKind::Expense, amount, category)
}

/// Counts bulk uploads and fails them with queued errors first.
struct ScriptedTransport {
    inner: DirectTransport,
    bulk_calls: AtomicUsize,
    failures: Mutex<Vec<SyncError>>,
}

impl ScriptedTransport {
    fn new(inner: DirectTransport, failures: Vec<SyncError>) -> Self {
        ScriptedTransport {
            inner,
            bulk_calls: AtomicUsize::new(0),
            failures: Mutex::new(failures),
        }
    }

    fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncTransport for ScriptedTransport {
    async fn list_active(&self, budget_id: i64) -> Result<Vec<Transaction>, SyncError> {
        self.inner.list_active(budget_id).await
    }

    async fn bulk_upsert(&self, budget_id: i64, items: Vec<BulkItem>) -> Result<BulkUpsertOutcome, SyncError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let failure = {
            let mut failures = self.failures.lock().unwrap();
            (!failures.is_empty()).then(|| failures.remove(0))
        };
        match failure {
            Some(err) => Err(err),
            None => self.inner.bulk_upsert(budget_id, items).await,
        }
    }

    async fn soft_delete(&self, id: i64) -> Result<SoftDeleteOutcome, SyncError> {
        self.inner.soft_delete(id).await
    }

    async fn list_tombstones(&self, budget_id: i64, since: Option<i64>) -> Result<Vec<Tombstone>, SyncError> {
        self.inner.list_tombstones(budget_id, since).await
    }

    async fn get_meta(&self, budget_id: i64) -> Result<MetaBundle, SyncError> {
        self.inner.get_meta(budget_id).await
    }

    async fn put_meta(&self, budget_id: i64, bundle: MetaBundle) -> Result<MetaBundle, SyncError> {
        self.inner.put_meta(budget_id, bundle).await
    }

    async fn get_settings(&self) -> Result<Value, SyncError> {
        self.inner.get_settings().await
    }

    async fn put_settings(&self, settings: Value) -> Result<Value, SyncError> {
        self.inner.put_settings(settings).await
    }

    async fn subscribe(&self, budget_id: i64) -> Result<EventStream, SyncError> {
        self.inner.subscribe(budget_id).await
    }
}

/// Holds bulk uploads until released and records the order of server calls.
struct GatedTransport {
    inner: DirectTransport,
    entered: Notify,
    release: Notify,
    calls: Mutex<Vec<&'static str>>,
}

impl GatedTransport {
    fn new(inner: DirectTransport) -> Self {
        GatedTransport {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncTransport for GatedTransport {
    async fn list_active(&self, budget_id: i64) -> Result<Vec<Transaction>, SyncError> {
        self.record("list");
        self.inner.list_active(budget_id).await
    }

    async fn bulk_upsert(&self, budget_id: i64, items: Vec<BulkItem>) -> Result<BulkUpsertOutcome, SyncError> {
        self.record("bulk");
        self.entered.notify_one();
        self.release.notified().await;
        let outcome = self.inner.bulk_upsert(budget_id, items).await;
        self.record("bulk done");
        outcome
    }

    async fn soft_delete(&self, id: i64) -> Result<SoftDeleteOutcome, SyncError> {
        self.inner.soft_delete(id).await
    }

    async fn list_tombstones(&self, budget_id: i64, since: Option<i64>) -> Result<Vec<Tombstone>, SyncError> {
        self.inner.list_tombstones(budget_id, since).await
    }

    async fn get_meta(&self, budget_id: i64) -> Result<MetaBundle, SyncError> {
        self.inner.get_meta(budget_id).await
    }

    async fn put_meta(&self, budget_id: i64, bundle: MetaBundle) -> Result<MetaBundle, SyncError> {
        self.inner.put_meta(budget_id, bundle).await
    }

    async fn get_settings(&self) -> Result<Value, SyncError> {
        self.inner.get_settings().await
    }

    async fn put_settings(&self, settings: Value) -> Result<Value, SyncError> {
        self.inner.put_settings(settings).await
    }

    async fn subscribe(&self, budget_id: i64) -> Result<EventStream, SyncError> {
        self.inner.subscribe(budget_id).await
    }
}

/// Stops the engine from inside the event stream, just before the greeting is delivered.
struct StopOnHello {
    inner: DirectTransport,
    engine: Mutex<Weak<SyncEngine>>,
    greeted: Arc<AtomicBool>,
}

#[async_trait]
impl SyncTransport for StopOnHello {
    async fn list_active(&self, budget_id: i64) -> Result<Vec<Transaction>, SyncError> {
        self.inner.list_active(budget_id).await
    }

    async fn bulk_upsert(&self, budget_id: i64, items: Vec<BulkItem>) -> Result<BulkUpsertOutcome, SyncError> {
        self.inner.bulk_upsert(budget_id, items).await
    }

    async fn soft_delete(&self, id: i64) -> Result<SoftDeleteOutcome, SyncError> {
        self.inner.soft_delete(id).await
    }

    async fn list_tombstones(&self, budget_id: i64, since: Option<i64>) -> Result<Vec<Tombstone>, SyncError> {
        self.inner.list_tombstones(budget_id, since).await
    }

    async fn get_meta(&self, budget_id: i64) -> Result<MetaBundle, SyncError> {
        self.inner.get_meta(budget_id).await
    }

    async fn put_meta(&self, budget_id: i64, bundle: MetaBundle) -> Result<MetaBundle, SyncError> {
        self.inner.put_meta(budget_id, bundle).await
    }

    async fn get_settings(&self) -> Result<Value, SyncError> {
        self.inner.get_settings().await
    }

    async fn put_settings(&self, settings: Value) -> Result<Value, SyncError> {
        self.inner.put_settings(settings).await
    }

    async fn subscribe(&self, _budget_id: i64) -> Result<EventStream, SyncError> {
        let engine = self.engine.lock().unwrap().clone();
        let greeted = self.greeted.clone();
        let hello = futures::stream::once(async move {
            if let Some(engine) = engine.upgrade() {
                engine.stop();
            }
            greeted.store(true, Ordering::SeqCst);
            Ok(ChangeEvent::Hello)
        });
        Ok(hello.chain(futures::stream::pending()).boxed())
    }
}

async fn engine_for(
    service: &Arc<BudgetService<InMemoryStorage>>,
    config: ClientConfig,
) -> Arc<SyncEngine> {
    let transport = DirectTransport::login(service.clone(), "owner@example.com").await;
    SyncEngine::new(
        Arc::new(LocalStore::in_memory(LocalDefaults::default())),
        Arc::new(transport),
        config,
    )
}

#[tokio::test]
async fn test_push_replaces_local_ids() {
    let service = Arc::new(create_test_service());
    let (_, budget) = owner_with_budget(&service).await;
    let engine = engine_for(&service, quiet_config()).await;
    engine.start(budget.id);

    engine.add(draft(10.0, "Food")).await;
    engine.add(draft(20.0, "Rent")).await;
    let outcome = engine.push_now().await.unwrap();
    assert_eq!(outcome.created.len(), 2);

    let listed = engine.transactions().await;
    assert_eq!(listed.len(), 2);
    for record in &listed {
        assert!(record.id.as_int().unwrap() > 0);
        assert_eq!(record.origin, Origin::Server);
        assert_eq!(record.budget_id, Some(budget.id));
    }

    let second = engine.push_now().await.unwrap();
    assert_eq!(second, BulkUpsertOutcome::default());
    assert_eq!(engine.store().get_all().await.len(), 2);
}

#[tokio::test]
async fn test_local_deletion_survives_pull_and_reaches_server() {
    let service = Arc::new(create_test_service());
    let (owner, budget) = owner_with_budget(&service).await;
    let created = service
        .create_transaction(&owner, budget.id, expense(15.0, "Taxi", "2024-04-04"))
        .await
        .unwrap();
    let engine = engine_for(&service, quiet_config()).await;
    engine.start(budget.id);
    engine.pull_now().await.unwrap();

    // Deleted while offline: only the local copy is touched.
    let id = RecordId::Int(created.id);
    engine.store().soft_delete(&id).await.unwrap();
    engine.pull_now().await.unwrap();
    assert!(!engine.store().get(&id).await.unwrap().is_active());
    assert!(engine.transactions().await.is_empty());

    let outcome = engine.push_now().await.unwrap();
    assert_eq!(outcome.updated.len(), 1);
    assert!(service.list_active(&owner, budget.id).await.unwrap().is_empty());
    assert!(!engine.store().get(&id).await.unwrap().is_active());
}

#[tokio::test]
async fn test_remote_deletion_arrives_through_tombstones() {
    let service = Arc::new(create_test_service());
    let (owner, budget) = owner_with_budget(&service).await;
    let created = service
        .create_transaction(&owner, budget.id, expense(7.0, "Tea", "2024-04-05"))
        .await
        .unwrap();
    let engine = engine_for(&service, quiet_config()).await;
    engine.start(budget.id);
    engine.pull_now().await.unwrap();
    assert_eq!(engine.transactions().await.len(), 1);

    let outcome = service.soft_delete(&owner, created.id).await.unwrap();
    engine.pull_now().await.unwrap();
    assert!(engine.transactions().await.is_empty());
    let stored = engine.store().get(&RecordId::Int(created.id)).await.unwrap();
    assert_eq!(stored.deleted_at, Some(outcome.deleted_at));
    assert_eq!(engine.store().tombstone_cursor(budget.id).await, Some(1));
}

#[tokio::test]
async fn test_offline_deletion_reaches_device_that_already_pulled_newer_ones() {
    let service = Arc::new(create_test_service());
    let (owner, budget) = owner_with_budget(&service).await;
    let x = service
        .create_transaction(&owner, budget.id, expense(11.0, "Gift", "2024-04-07"))
        .await
        .unwrap();
    let y = service
        .create_transaction(&owner, budget.id, expense(12.0, "Fuel", "2024-04-08"))
        .await
        .unwrap();
    let phone = engine_for(&service, quiet_config()).await;
    let laptop = engine_for(&service, quiet_config()).await;
    phone.start(budget.id);
    laptop.start(budget.id);
    phone.pull_now().await.unwrap();
    laptop.pull_now().await.unwrap();

    // The phone deletes X offline, then someone deletes Y online.
    let x_id = RecordId::Int(x.id);
    phone.store().soft_delete(&x_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    service.soft_delete(&owner, y.id).await.unwrap();
    laptop.pull_now().await.unwrap();
    assert_eq!(laptop.transactions().await.len(), 1);
    let cursor = laptop.store().tombstone_cursor(budget.id).await;

    // The phone reconnects and uploads its older deletion.
    phone.push_now().await.unwrap();
    assert!(service.list_active(&owner, budget.id).await.unwrap().is_empty());

    laptop.pull_now().await.unwrap();
    assert!(laptop.transactions().await.is_empty());
    assert!(!laptop.store().get(&x_id).await.unwrap().is_active());
    assert!(laptop.store().tombstone_cursor(budget.id).await > cursor);
}

#[tokio::test]
async fn test_delete_of_server_record_goes_online() {
    let service = Arc::new(create_test_service());
    let (owner, budget) = owner_with_budget(&service).await;
    let created = service
        .create_transaction(&owner, budget.id, expense(2.0, "Bread", "2024-04-06"))
        .await
        .unwrap();
    let engine = engine_for(&service, quiet_config()).await;
    engine.start(budget.id);
    engine.pull_now().await.unwrap();

    engine.delete(&RecordId::Text(created.id.to_string())).await.unwrap();
    assert!(service.list_active(&owner, budget.id).await.unwrap().is_empty());
    assert!(engine.delete(&RecordId::Int(999)).await.is_none());
}

#[tokio::test]
async fn test_realtime_delete_of_seven() {
    let service = Arc::new(create_test_service());
    let (owner, budget) = owner_with_budget(&service).await;
    for n in 1..=7 {
        service
            .create_transaction(&owner, budget.id, expense(n as f64, "Item", "2024-01-01"))
            .await
            .unwrap();
    }
    let engine = engine_for(&service, quiet_config()).await;
    let mut status = engine.status();
    let mut updates = engine.updates();
    engine.start(budget.id);
    engine.pull_now().await.unwrap();
    assert_eq!(engine.transactions().await.len(), 7);

    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == SyncStatus::Live))
        .await
        .unwrap()
        .unwrap();

    service.soft_delete(&owner, 7).await.unwrap();
    let payload = tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload.op, UpdateOp::SoftDelete);
    assert_eq!(payload.id, Some(7));

    engine.pull_now().await.unwrap();
    let remaining = engine.transactions().await;
    assert_eq!(remaining.len(), 6);
    assert!(remaining.iter().all(|t| t.id != RecordId::Int(7)));
}

#[tokio::test]
async fn test_transient_push_failures_are_retried() {
    let service = Arc::new(create_test_service());
    let (_, budget) = owner_with_budget(&service).await;
    let transport = Arc::new(ScriptedTransport::new(
        DirectTransport::login(service.clone(), "owner@example.com").await,
        vec![
            SyncError::Transient("connection reset".to_string()),
            SyncError::Transient("502".to_string()),
        ],
    ));
    let engine = SyncEngine::new(
        Arc::new(LocalStore::in_memory(LocalDefaults::default())),
        transport.clone(),
        quiet_config(),
    );
    engine.start(budget.id);
    engine.add(draft(5.0, "Parking")).await;

    let outcome = engine.push_now().await.unwrap();
    assert_eq!(outcome.created.len(), 1);
    assert_eq!(transport.bulk_calls(), 3);
}

#[tokio::test]
async fn test_auth_failures_are_not_retried() {
    let service = Arc::new(create_test_service());
    let (_, budget) = owner_with_budget(&service).await;
    let transport = Arc::new(ScriptedTransport::new(
        DirectTransport::login(service.clone(), "owner@example.com").await,
        vec![SyncError::Unauthorized("expired".to_string())],
    ));
    let engine = SyncEngine::new(
        Arc::new(LocalStore::in_memory(LocalDefaults::default())),
        transport.clone(),
        quiet_config(),
    );
    let mut status = engine.status();
    engine.start(budget.id);
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == SyncStatus::Live))
        .await
        .unwrap()
        .unwrap();
    let local = engine.add(draft(5.0, "Parking")).await;

    let result = engine.push_now().await;
    assert!(matches!(result, Err(SyncError::Unauthorized(_))));
    assert_eq!(transport.bulk_calls(), 1);
    assert_eq!(*engine.status().borrow(), SyncStatus::Error);
    assert!(engine.store().get(&local.id).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_edits_is_pushed_once() {
    let service = Arc::new(create_test_service());
    let (owner, budget) = owner_with_budget(&service).await;
    let transport = Arc::new(ScriptedTransport::new(
        DirectTransport::login(service.clone(), "owner@example.com").await,
        Vec::new(),
    ));
    let config = ClientConfig {
        push_debounce: Duration::from_millis(800),
        ..quiet_config()
    };
    let engine = SyncEngine::new(
        Arc::new(LocalStore::in_memory(LocalDefaults::default())),
        transport.clone(),
        config,
    );
    engine.start(budget.id);

    for n in 1..=3 {
        engine.add(draft(n as f64, "Snack")).await;
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(transport.bulk_calls(), 1);
    assert_eq!(service.list_active(&owner, budget.id).await.unwrap().len(), 3);
    assert!(
        engine
            .transactions()
            .await
            .iter()
            .all(|t| t.id.as_int().unwrap() > 0)
    );
}

#[tokio::test]
async fn test_local_mode_keeps_everything_on_device() {
    let service = Arc::new(create_test_service());
    let (owner, budget) = owner_with_budget(&service).await;
    let engine = engine_for(&service, quiet_config()).await;
    engine.start(budget.id);
    engine.set_mode(SyncMode::Local);
    assert_eq!(engine.mode(), SyncMode::Local);
    assert_eq!(engine.budget_id(), Some(budget.id));

    engine.add(draft(9.0, "Cinema")).await;
    assert!(matches!(engine.push_now().await, Err(SyncError::SessionEnded)));
    assert!(service.list_active(&owner, budget.id).await.unwrap().is_empty());
    assert_eq!(engine.transactions().await.len(), 1);

    engine.set_mode(SyncMode::Server);
    assert_eq!(engine.push_now().await.unwrap().created.len(), 1);

    engine.stop();
    assert_eq!(engine.mode(), SyncMode::Local);
    assert_eq!(*engine.status().borrow(), SyncStatus::Idle);
}

#[tokio::test]
async fn test_push_without_budget_is_rejected() {
    let service = Arc::new(create_test_service());
    owner_with_budget(&service).await;
    let engine = engine_for(&service, quiet_config()).await;
    engine.set_mode(SyncMode::Server);
    assert!(matches!(engine.push_now().await, Err(SyncError::NoActiveBudget)));
}

#[tokio::test]
async fn test_pull_waits_for_push_in_flight() {
    let service = Arc::new(create_test_service());
    let (owner, budget) = owner_with_budget(&service).await;
    let transport = Arc::new(GatedTransport::new(
        DirectTransport::login(service.clone(), "owner@example.com").await,
    ));
    let engine = SyncEngine::new(
        Arc::new(LocalStore::in_memory(LocalDefaults::default())),
        transport.clone(),
        quiet_config(),
    );
    engine.start(budget.id);
    let local = engine.add(draft(4.0, "Lunch")).await;

    let pushing = tokio::spawn({
        let engine = engine.clone();
        async move { engine.push_now().await }
    });
    transport.entered.notified().await;
    let pulling = tokio::spawn({
        let engine = engine.clone();
        async move { engine.pull_now().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.calls(), vec!["bulk"]);

    transport.release.notify_one();
    pushing.await.unwrap().unwrap();
    pulling.await.unwrap().unwrap();
    // The real-time listener may pull again after the bulk update; every pull comes later.
    let calls = transport.calls();
    assert_eq!(calls[..2], ["bulk", "bulk done"]);
    assert!(calls.len() > 2 && calls[2..].iter().all(|call| *call == "list"));

    // The pull saw the reconciled store: one server copy, no leftover local id.
    assert!(engine.store().get(&local.id).await.is_none());
    let listed = engine.transactions().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].origin, Origin::Server);
    assert_eq!(service.list_active(&owner, budget.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_greeting_after_stop_leaves_engine_idle() {
    let service = Arc::new(create_test_service());
    let (_, budget) = owner_with_budget(&service).await;
    let transport = Arc::new(StopOnHello {
        inner: DirectTransport::login(service.clone(), "owner@example.com").await,
        engine: Mutex::new(Weak::new()),
        greeted: Arc::new(AtomicBool::new(false)),
    });
    let engine = SyncEngine::new(
        Arc::new(LocalStore::in_memory(LocalDefaults::default())),
        transport.clone(),
        quiet_config(),
    );
    *transport.engine.lock().unwrap() = Arc::downgrade(&engine);

    engine.start(budget.id);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !transport.greeted.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(engine.mode(), SyncMode::Local);
    assert_eq!(*engine.status().borrow(), SyncStatus::Idle);
}
