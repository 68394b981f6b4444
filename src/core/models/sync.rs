use super::transaction::{RecordId, Transaction, TransactionFields};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One entry of a bulk upload.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BulkItem {
    #[serde(default)]
    pub client_id: Option<RecordId>,
    #[serde(flatten)]
    pub fields: TransactionFields,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

/// Resolution of one submitted client id.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    pub client_id: Option<RecordId>,
    pub server_id: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpsertOutcome {
    #[serde(default)]
    pub created: Vec<Transaction>,
    #[serde(default)]
    pub duplicates: Vec<Transaction>,
    #[serde(default)]
    pub updated: Vec<Transaction>,
    #[serde(default)]
    pub mapping: Vec<IdMapping>,
}

impl BulkUpsertOutcome {
    /// Every authoritative record the batch resolved to.
    pub fn records(&self) -> impl Iterator<Item = &Transaction> {
        self.created
            .iter()
            .chain(self.duplicates.iter())
            .chain(self.updated.iter())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SoftDeleteOutcome {
    pub id: i64,
    pub deleted_at: i64,
}
