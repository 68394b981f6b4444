use crate::client::errors::SyncError;
use crate::client::sse::SseDecoder;
use crate::core::models::{
    event::ChangeEvent,
    meta::MetaBundle,
    sync::{BulkItem, BulkUpsertOutcome, SoftDeleteOutcome},
    transaction::{Tombstone, Transaction},
};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::debug;

pub type EventStream = BoxStream<'static, Result<ChangeEvent, SyncError>>;

/// Everything the sync engine needs from the server, already authenticated.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn list_active(&self, budget_id: i64) -> Result<Vec<Transaction>, SyncError>;

    async fn bulk_upsert(&self, budget_id: i64, items: Vec<BulkItem>) -> Result<BulkUpsertOutcome, SyncError>;

    async fn soft_delete(&self, id: i64) -> Result<SoftDeleteOutcome, SyncError>;

    async fn list_tombstones(&self, budget_id: i64, since: Option<i64>) -> Result<Vec<Tombstone>, SyncError>;

    async fn get_meta(&self, budget_id: i64) -> Result<MetaBundle, SyncError>;

    async fn put_meta(&self, budget_id: i64, bundle: MetaBundle) -> Result<MetaBundle, SyncError>;

    /// Per-user settings object.
    async fn get_settings(&self) -> Result<Value, SyncError>;

    async fn put_settings(&self, settings: Value) -> Result<Value, SyncError>;

    async fn subscribe(&self, budget_id: i64) -> Result<EventStream, SyncError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BulkBody {
    budget_id: i64,
    items: Vec<BulkItem>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// [`SyncTransport`] over the JSON HTTP API.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        HttpTransport {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, SyncError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(SyncError::from_status(status.as_u16(), message))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SyncError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::Decode(e.to_string()))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn list_active(&self, budget_id: i64) -> Result<Vec<Transaction>, SyncError> {
        let request = self
            .client
            .get(self.url("/transactions"))
            .query(&[("budgetId", budget_id)]);
        self.json(request).await
    }

    async fn bulk_upsert(&self, budget_id: i64, items: Vec<BulkItem>) -> Result<BulkUpsertOutcome, SyncError> {
        let request = self
            .client
            .post(self.url("/transactions/bulk"))
            .json(&BulkBody { budget_id, items });
        self.json(request).await
    }

    async fn soft_delete(&self, id: i64) -> Result<SoftDeleteOutcome, SyncError> {
        let request = self.client.delete(self.url(&format!("/transactions/{}", id)));
        self.json(request).await
    }

    async fn list_tombstones(&self, budget_id: i64, since: Option<i64>) -> Result<Vec<Tombstone>, SyncError> {
        let mut request = self
            .client
            .get(self.url("/transactions/tombstones"))
            .query(&[("budgetId", budget_id)]);
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }
        self.json(request).await
    }

    async fn get_meta(&self, budget_id: i64) -> Result<MetaBundle, SyncError> {
        let request = self.client.get(self.url(&format!("/budgets/{}/meta", budget_id)));
        self.json(request).await
    }

    async fn put_meta(&self, budget_id: i64, bundle: MetaBundle) -> Result<MetaBundle, SyncError> {
        let request = self
            .client
            .put(self.url(&format!("/budgets/{}/meta", budget_id)))
            .json(&bundle);
        self.json(request).await
    }

    async fn get_settings(&self) -> Result<Value, SyncError> {
        self.json(self.client.get(self.url("/settings"))).await
    }

    async fn put_settings(&self, settings: Value) -> Result<Value, SyncError> {
        let request = self.client.put(self.url("/settings")).json(&settings);
        self.json(request).await
    }

    async fn subscribe(&self, budget_id: i64) -> Result<EventStream, SyncError> {
        let request = self
            .client
            .get(self.url("/events"))
            .query(&[("budgetId", budget_id)])
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let response = self.send(request).await?;
        debug!("Event stream opened for budget {}", budget_id);

        let mut decoder = SseDecoder::new();
        let events = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => decoder
                    .push(&bytes)
                    .into_iter()
                    .filter_map(|frame| ChangeEvent::parse(&frame.event, &frame.data))
                    .map(Ok)
                    .collect::<Vec<_>>(),
                Err(e) => vec![Err(SyncError::Transient(e.to_string()))],
            })
            .flat_map(futures::stream::iter)
            .boxed();
        Ok(events)
    }
}
