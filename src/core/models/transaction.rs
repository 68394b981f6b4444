use crate::core::errors::BudgetError;
use crate::core::fingerprint;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Income,
    Expense,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionKind::Income => "income",
            TransactionKind::Expense => "expense",
        };
        write!(f, "{}", s)
    }
}

/// Identifier as it travels between devices and the server.
///
/// Browsers and older clients send ids either as JSON numbers or as numeric strings, so both
/// forms are accepted and compared loosely.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl RecordId {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RecordId::Int(n) => Some(*n),
            RecordId::Text(s) => s.trim().parse().ok(),
        }
    }

    /// `7` and `"7"` name the same record.
    pub fn loosely_eq(&self, other: &RecordId) -> bool {
        match (self, other) {
            (RecordId::Int(a), RecordId::Int(b)) => a == b,
            (RecordId::Text(a), RecordId::Text(b)) => a.trim() == b.trim(),
            _ => self.to_string() == other.to_string(),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(n) => write!(f, "{}", n),
            RecordId::Text(s) => write!(f, "{}", s.trim()),
        }
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        RecordId::Int(value)
    }
}

/// The semantic part of a transaction: everything the content fingerprint covers.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFields {
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub amount: f64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub member: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl TransactionFields {
    pub fn validate(&self) -> Result<(), BudgetError> {
        if !self.amount.is_finite() {
            return Err(BudgetError::invalid_input("amount", "amount must be a finite number"));
        }
        if self.amount < 0.0 {
            return Err(BudgetError::invalid_input("amount", "amount cannot be negative"));
        }
        Ok(())
    }

    pub fn content_hash(&self) -> String {
        fingerprint::content_hash(self)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: i64,
    pub budget_id: i64,
    #[serde(flatten)]
    pub fields: TransactionFields,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub deleted_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<i64>,
    /// Server clock when the deletion was first recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstoned_at: Option<i64>,
    /// Position in the tombstone feed, assigned by the server in recording order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstone_seq: Option<i64>,
}

impl Transaction {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Stamps feed position and server time on a record that carries a deletion but has no
    /// feed entry yet. Returns whether anything changed.
    pub fn record_tombstone(&mut self, seq: i64, now: i64) -> bool {
        if self.deleted_at.is_none() || self.tombstone_seq.is_some() {
            return false;
        }
        self.tombstone_seq = Some(seq);
        self.tombstoned_at = Some(now);
        true
    }

    /// Stored hash, or the fingerprint recomputed for legacy records that predate hashing.
    pub fn effective_content_hash(&self) -> String {
        self.content_hash
            .clone()
            .unwrap_or_else(|| self.fields.content_hash())
    }

    pub fn dedup_key(&self) -> String {
        fingerprint::dedup_key(
            self.budget_id,
            &self.effective_content_hash(),
            self.fields.amount,
            self.fields.date,
        )
    }
}

/// A deletion as exposed by the tombstone feed.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub id: i64,
    pub content_hash: Option<String>,
    pub deleted_at: i64,
    /// Feed cursor. Clients pass the largest one seen as `since`.
    #[serde(default)]
    pub seq: i64,
}

/// Next free feed position in a transaction set.
pub fn next_tombstone_seq(all: &[Transaction]) -> i64 {
    all.iter().filter_map(|t| t.tombstone_seq).max().unwrap_or(0) + 1
}
