//! Content fingerprints used as deduplication and idempotency signals.
//!
//! The hash is SHA-256 over the pipe-joined semantic fields of a transaction. Every field is
//! trimmed and lower-cased before joining, and the delimiter is escaped inside values, so two
//! entries that only differ in letter case or surrounding whitespace collapse to one hash.
//! This is a dedup key, not a security primitive.

use crate::core::models::transaction::TransactionFields;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};

fn normalize(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .replace('\\', "\\\\")
        .replace('|', "\\|")
}

/// Canonical pre-image of the fingerprint. Missing fields are empty strings.
pub fn canonical_form(fields: &TransactionFields) -> String {
    let parts = [
        fields.kind.to_string(),
        format_amount(fields.amount),
        fields.category.clone(),
        fields.member.clone(),
        fields.source.clone(),
        fields.date.to_string(),
        fields.note.clone().unwrap_or_default(),
        fields.time.clone().unwrap_or_default(),
        fields.created_at.map(|ts| ts.to_string()).unwrap_or_default(),
    ];
    parts.iter().map(|p| normalize(p)).collect::<Vec<_>>().join("|")
}

pub fn content_hash(fields: &TransactionFields) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_form(fields).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `100.0` renders as `100`, `12.5` as `12.5`.
pub fn format_amount(amount: f64) -> String {
    format!("{}", amount)
}

/// Natural key for idempotent insert: `(budgetId, contentHash, amount, date)`.
pub fn dedup_key(budget_id: i64, content_hash: &str, amount: f64, date: NaiveDate) -> String {
    format!("{}:{}:{}:{}", budget_id, content_hash, format_amount(amount), date)
}

/// Key a client attaches to every pushed item; refines the dedup key with creation time.
pub fn idempotency_key(budget_id: i64, content_hash: &str, fields: &TransactionFields) -> String {
    format!(
        "{}:{}:{}",
        dedup_key(budget_id, content_hash, fields.amount, fields.date),
        fields.time.as_deref().unwrap_or(""),
        fields.created_at.map(|ts| ts.to_string()).unwrap_or_default()
    )
}
