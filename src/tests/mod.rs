mod engine_tests;
mod transaction_tests;

use crate::api::models::ApiError;
use crate::client::errors::SyncError;
use crate::client::transport::{EventStream, SyncTransport};
use crate::core::errors::BudgetError;
use crate::core::models::{
    budget::Budget,
    meta::MetaBundle,
    sync::{BulkItem, BulkUpsertOutcome, SoftDeleteOutcome},
    transaction::{RecordId, Tombstone, Transaction, TransactionFields, TransactionKind},
    user::AuthUser,
};
use crate::core::notifier::ChangeNotifier;
use crate::core::services::{BudgetService, ServiceSettings};
use crate::infrastructure::storage::in_memory::InMemoryStorage;
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const TEST_SECRET: &str = "test-secret";
pub const TEST_PASSWORD: &str = "password123";

pub fn test_settings() -> ServiceSettings {
    ServiceSettings {
        bcrypt_cost: 4,
        ..ServiceSettings::default()
    }
}

pub fn create_test_service() -> BudgetService<InMemoryStorage> {
    create_test_service_with(test_settings())
}

pub fn create_test_service_with(settings: ServiceSettings) -> BudgetService<InMemoryStorage> {
    let notifier = ChangeNotifier::new(16);
    notifier.start();
    BudgetService::new(InMemoryStorage::new(), notifier, TEST_SECRET.to_string(), settings)
}

pub fn temp_data_dir() -> PathBuf {
    std::env::temp_dir().join(format!("budget-sync-test-{}", Uuid::new_v4()))
}

pub async fn register_user(service: &BudgetService<InMemoryStorage>, email: &str) -> AuthUser {
    service.register(email, TEST_PASSWORD, "Test User").await.unwrap()
}

/// Registered owner plus one budget.
pub async fn owner_with_budget(service: &BudgetService<InMemoryStorage>) -> (AuthUser, Budget) {
    let owner = register_user(service, "owner@example.com").await;
    let budget = service.create_budget(&owner, "Family").await.unwrap();
    (owner, budget)
}

pub fn date(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
}

pub fn expense(amount: f64, category: &str, day: &str) -> TransactionFields {
    TransactionFields {
        kind: TransactionKind::Expense,
        amount,
        category: category.to_string(),
        member: String::new(),
        source: String::new(),
        note: None,
        date: date(day),
        time: None,
        created_at: None,
    }
}

pub fn bulk_item(client_id: i64, fields: TransactionFields) -> BulkItem {
    BulkItem {
        client_id: Some(RecordId::Int(client_id)),
        fields,
        content_hash: None,
        idempotency_key: None,
        deleted_at: None,
    }
}

fn sync_error(err: BudgetError) -> SyncError {
    let api_error = ApiError(err);
    let status = api_error.status().as_u16();
    SyncError::from_status(status, api_error.0.to_string())
}

/// Talks to a [`BudgetService`] in process, with the same error classification as HTTP.
pub struct DirectTransport {
    service: Arc<BudgetService<InMemoryStorage>>,
    user: AuthUser,
    token: String,
    ping_every: Duration,
}

impl DirectTransport {
    pub async fn login(service: Arc<BudgetService<InMemoryStorage>>, email: &str) -> Self {
        let outcome = service.login(email, TEST_PASSWORD).await.unwrap();
        DirectTransport {
            service,
            user: outcome.user,
            token: outcome.token,
            ping_every: Duration::from_secs(30),
        }
    }

    pub fn user(&self) -> &AuthUser {
        &self.user
    }
}

#[async_trait]
impl SyncTransport for DirectTransport {
    async fn list_active(&self, budget_id: i64) -> Result<Vec<Transaction>, SyncError> {
        self.service.list_active(&self.user, budget_id).await.map_err(sync_error)
    }

    async fn bulk_upsert(&self, budget_id: i64, items: Vec<BulkItem>) -> Result<BulkUpsertOutcome, SyncError> {
        self.service
            .bulk_upsert(&self.user, budget_id, items)
            .await
            .map_err(sync_error)
    }

    async fn soft_delete(&self, id: i64) -> Result<SoftDeleteOutcome, SyncError> {
        self.service.soft_delete(&self.user, id).await.map_err(sync_error)
    }

    async fn list_tombstones(&self, budget_id: i64, since: Option<i64>) -> Result<Vec<Tombstone>, SyncError> {
        self.service
            .list_tombstones(&self.user, budget_id, since)
            .await
            .map_err(sync_error)
    }

    async fn get_meta(&self, budget_id: i64) -> Result<MetaBundle, SyncError> {
        self.service.get_meta(&self.user, budget_id).await.map_err(sync_error)
    }

    async fn put_meta(&self, budget_id: i64, bundle: MetaBundle) -> Result<MetaBundle, SyncError> {
        self.service
            .put_meta(&self.user, budget_id, bundle)
            .await
            .map_err(sync_error)
    }

    async fn get_settings(&self) -> Result<Value, SyncError> {
        self.service.get_settings(&self.user).await.map_err(sync_error)
    }

    async fn put_settings(&self, settings: Value) -> Result<Value, SyncError> {
        self.service.put_settings(&self.user, settings).await.map_err(sync_error)
    }

    async fn subscribe(&self, budget_id: i64) -> Result<EventStream, SyncError> {
        let subscription = self
            .service
            .subscribe(&self.token, budget_id)
            .await
            .map_err(sync_error)?;
        Ok(subscription.into_stream(self.ping_every).map(Ok).boxed())
    }
}
