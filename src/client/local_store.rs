//! Device-local record store.
//!
//! State lives in memory behind one async mutex and is mirrored to a JSON snapshot after every
//! mutation. Persistence is best effort: a failed write is logged and the in-memory result is
//! still returned. Nothing in this module ever clears a `deletedAt`.

use crate::core::models::{
    meta::MetaBundle,
    transaction::{RecordId, Tombstone, Transaction, TransactionFields, TransactionKind},
};
use chrono::{Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Server,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalTransaction {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<i64>,
    #[serde(flatten)]
    pub fields: TransactionFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub origin: Origin,
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

impl LocalTransaction {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn fingerprint(&self) -> String {
        self.content_hash
            .clone()
            .unwrap_or_else(|| self.fields.content_hash())
    }

    /// Not yet acknowledged by the server, or carrying a deletion to propagate.
    pub fn needs_push(&self) -> bool {
        self.origin != Origin::Server || self.deleted_at.is_some()
    }

    pub fn from_server(record: Transaction) -> Self {
        LocalTransaction {
            id: RecordId::Int(record.id),
            budget_id: Some(record.budget_id),
            fields: record.fields,
            content_hash: record.content_hash,
            origin: Origin::Server,
            deleted_at: record.deleted_at,
        }
    }
}

/// Device defaults applied to drafts that leave the field empty.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalDefaults {
    pub member: String,
    pub source: String,
}

/// A new entry as typed by the user.
#[derive(Clone, Debug)]
pub struct TransactionDraft {
    pub kind: TransactionKind,
    pub amount: f64,
    pub category: String,
    pub member: Option<String>,
    pub source: Option<String>,
    pub note: Option<String>,
    pub date: Option<NaiveDate>,
    pub time: Option<String>,
    pub created_at: Option<i64>,
    pub budget_id: Option<i64>,
}

impl TransactionDraft {
    pub fn new(kind: TransactionKind, amount: f64, category: impl Into<String>) -> Self {
        TransactionDraft {
            kind,
            amount,
            category: category.into(),
            member: None,
            source: None,
            note: None,
            date: None,
            time: None,
            created_at: None,
            budget_id: None,
        }
    }
}

/// Partial edit. `None` keeps the stored value.
#[derive(Clone, Debug)]
pub struct TransactionPatch {
    pub id: RecordId,
    pub kind: Option<TransactionKind>,
    pub amount: Option<f64>,
    pub category: Option<String>,
    pub member: Option<String>,
    pub source: Option<String>,
    pub note: Option<String>,
    pub date: Option<NaiveDate>,
    pub time: Option<String>,
    pub created_at: Option<i64>,
}

impl TransactionPatch {
    pub fn new(id: impl Into<RecordId>) -> Self {
        TransactionPatch {
            id: id.into(),
            kind: None,
            amount: None,
            category: None,
            member: None,
            source: None,
            note: None,
            date: None,
            time: None,
            created_at: None,
        }
    }

    fn apply(self, fields: &mut TransactionFields) {
        if let Some(kind) = self.kind {
            fields.kind = kind;
        }
        if let Some(amount) = self.amount {
            fields.amount = amount;
        }
        if let Some(category) = self.category {
            fields.category = category;
        }
        if let Some(member) = self.member {
            fields.member = member;
        }
        if let Some(source) = self.source {
            fields.source = source;
        }
        if self.note.is_some() {
            fields.note = self.note;
        }
        if let Some(date) = self.date {
            fields.date = date;
        }
        if self.time.is_some() {
            fields.time = self.time;
        }
        if self.created_at.is_some() {
            fields.created_at = self.created_at;
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalState {
    #[serde(default)]
    transactions: Vec<LocalTransaction>,
    #[serde(default)]
    meta: BTreeMap<String, MetaBundle>,
    #[serde(default)]
    tombstone_cursors: BTreeMap<String, i64>,
    #[serde(default)]
    last_local_id: i64,
}

impl LocalState {
    fn next_local_id(&mut self) -> RecordId {
        let lowest = self
            .transactions
            .iter()
            .filter_map(|t| t.id.as_int())
            .min()
            .unwrap_or(0);
        self.last_local_id = self.last_local_id.min(lowest).min(0) - 1;
        RecordId::Int(self.last_local_id)
    }

    /// Exact key first, then a loose scan so `7` finds a record stored under `"7"`.
    fn position(&self, id: &RecordId) -> Option<usize> {
        self.transactions
            .iter()
            .position(|t| &t.id == id)
            .or_else(|| self.transactions.iter().position(|t| t.id.loosely_eq(id)))
    }
}

pub struct LocalStore {
    state: Mutex<LocalState>,
    path: Option<PathBuf>,
    defaults: LocalDefaults,
}

impl LocalStore {
    pub fn in_memory(defaults: LocalDefaults) -> Self {
        LocalStore {
            state: Mutex::new(LocalState::default()),
            path: None,
            defaults,
        }
    }

    /// Loads the snapshot at `path`. A missing or unreadable snapshot starts an empty store.
    pub async fn open(path: impl Into<PathBuf>, defaults: LocalDefaults) -> Self {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Ignoring unreadable local snapshot {}: {}", path.display(), e);
                LocalState::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LocalState::default(),
            Err(e) => {
                warn!("Cannot read local snapshot {}: {}", path.display(), e);
                LocalState::default()
            }
        };
        LocalStore {
            state: Mutex::new(state),
            path: Some(path),
            defaults,
        }
    }

    async fn persist(&self, state: &LocalState) {
        let Some(path) = &self.path else {
            return;
        };
        let encoded = match serde_json::to_string(state) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode local snapshot: {}", e);
                return;
            }
        };
        let tmp = path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, encoded).await {
            warn!("Failed to write local snapshot {}: {}", tmp.display(), e);
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            warn!("Failed to replace local snapshot {}: {}", path.display(), e);
        }
    }

    pub async fn add(&self, draft: TransactionDraft) -> LocalTransaction {
        let non_empty = |value: Option<String>, fallback: &str| {
            value
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| fallback.to_string())
        };
        let mut state = self.state.lock().await;
        let record = LocalTransaction {
            id: state.next_local_id(),
            budget_id: draft.budget_id,
            fields: TransactionFields {
                kind: draft.kind,
                amount: draft.amount,
                category: draft.category,
                member: non_empty(draft.member, &self.defaults.member),
                source: non_empty(draft.source, &self.defaults.source),
                note: draft.note,
                date: draft.date.unwrap_or_else(|| Local::now().date_naive()),
                time: draft.time,
                created_at: Some(draft.created_at.unwrap_or_else(|| Utc::now().timestamp_millis())),
            },
            content_hash: None,
            origin: Origin::Local,
            deleted_at: None,
        };
        state.transactions.push(record.clone());
        self.persist(&state).await;
        debug!("Added local transaction {}", record.id);
        record
    }

    /// Every record, tombstones included.
    pub async fn get_all(&self) -> Vec<LocalTransaction> {
        self.state.lock().await.transactions.clone()
    }

    pub async fn get(&self, id: &RecordId) -> Option<LocalTransaction> {
        let state = self.state.lock().await;
        state.position(id).map(|pos| state.transactions[pos].clone())
    }

    /// Marks the record deleted unless it already is. Returns the record as stored.
    pub async fn soft_delete(&self, id: &RecordId) -> Option<LocalTransaction> {
        let mut state = self.state.lock().await;
        let pos = state.position(id)?;
        let record = &mut state.transactions[pos];
        if record.deleted_at.is_some() {
            return Some(record.clone());
        }
        record.deleted_at = Some(Utc::now().timestamp_millis());
        let record = record.clone();
        self.persist(&state).await;
        Some(record)
    }

    pub async fn hard_remove(&self, id: &RecordId) -> bool {
        let mut state = self.state.lock().await;
        let Some(pos) = state.position(id) else {
            return false;
        };
        state.transactions.remove(pos);
        self.persist(&state).await;
        true
    }

    pub async fn update(&self, patch: TransactionPatch) -> Option<LocalTransaction> {
        let mut state = self.state.lock().await;
        let pos = state.position(&patch.id)?;
        let record = &mut state.transactions[pos];
        patch.apply(&mut record.fields);
        // Content changed, the stored fingerprint no longer applies.
        record.content_hash = None;
        let record = record.clone();
        self.persist(&state).await;
        Some(record)
    }

    /// Imports server records.
    ///
    /// A local tombstone always survives: under the same id, or under another id with the same
    /// content in the same budget (or not yet tied to one), its `deletedAt` carries over to the
    /// incoming record. `time` and `createdAt`
    /// missing from the incoming copy are kept from the local one.
    pub async fn import_batch(&self, records: Vec<Transaction>) -> usize {
        if records.is_empty() {
            return 0;
        }
        let mut state = self.state.lock().await;
        let count = records.len();
        for record in records {
            let mut incoming = LocalTransaction::from_server(record);
            if let Some(pos) = state.position(&incoming.id) {
                let existing = &mut state.transactions[pos];
                preserve_timing(&mut incoming.fields, &existing.fields);
                incoming.deleted_at = existing.deleted_at.or(incoming.deleted_at);
                *existing = incoming;
                continue;
            }

            let fingerprint = incoming.fingerprint();
            if let Some(tombstone) = state.transactions.iter().find(|t| {
                t.deleted_at.is_some()
                    && t.budget_id.is_none_or(|b| Some(b) == incoming.budget_id)
                    && t.fingerprint() == fingerprint
            }) {
                debug!("Tombstone {} carried over to {}", tombstone.id, incoming.id);
                preserve_timing(&mut incoming.fields, &tombstone.fields);
                incoming.deleted_at = incoming.deleted_at.or(tombstone.deleted_at);
            }
            state.transactions.push(incoming);
        }
        self.persist(&state).await;
        count
    }

    /// Marks local copies deleted from `budget_id`'s tombstone feed. Content matches only
    /// consider server copies of the same budget. Returns how many changed.
    pub async fn apply_tombstones(&self, budget_id: i64, tombstones: &[Tombstone]) -> usize {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for tombstone in tombstones {
            let id = RecordId::Int(tombstone.id);
            let pos = state.position(&id).or_else(|| {
                tombstone.content_hash.as_ref().and_then(|hash| {
                    state.transactions.iter().position(|t| {
                        t.origin == Origin::Server
                            && t.budget_id == Some(budget_id)
                            && &t.fingerprint() == hash
                    })
                })
            });
            if let Some(pos) = pos {
                let record = &mut state.transactions[pos];
                if record.deleted_at.is_none() {
                    record.deleted_at = Some(tombstone.deleted_at);
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.persist(&state).await;
        }
        changed
    }

    pub async fn meta(&self, budget_id: i64) -> MetaBundle {
        self.state
            .lock()
            .await
            .meta
            .get(&budget_id.to_string())
            .cloned()
            .unwrap_or_default()
    }

    pub async fn set_meta(&self, budget_id: i64, bundle: MetaBundle) {
        let mut state = self.state.lock().await;
        state.meta.insert(budget_id.to_string(), bundle);
        self.persist(&state).await;
    }

    pub async fn tombstone_cursor(&self, budget_id: i64) -> Option<i64> {
        self.state
            .lock()
            .await
            .tombstone_cursors
            .get(&budget_id.to_string())
            .copied()
    }

    /// Cursors only move forward.
    pub async fn set_tombstone_cursor(&self, budget_id: i64, cursor: i64) {
        let mut state = self.state.lock().await;
        let entry = state.tombstone_cursors.entry(budget_id.to_string()).or_insert(cursor);
        *entry = (*entry).max(cursor);
        self.persist(&state).await;
    }
}

fn preserve_timing(incoming: &mut TransactionFields, local: &TransactionFields) {
    if incoming.time.is_none() {
        incoming.time = local.time.clone();
    }
    if incoming.created_at.is_none() {
        incoming.created_at = local.created_at;
    }
}
