use crate::core::errors::BudgetError;
use crate::infrastructure::storage::{Collection, Storage};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Storage kept entirely in process memory. Used by tests and throwaway servers.
#[derive(Clone)]
pub struct InMemoryStorage {
    slots: Arc<HashMap<Collection, Mutex<Option<Value>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        let slots = Collection::ALL
            .into_iter()
            .map(|collection| (collection, Mutex::new(None)))
            .collect();
        InMemoryStorage { slots: Arc::new(slots) }
    }

    fn slot(&self, collection: Collection) -> Result<&Mutex<Option<Value>>, BudgetError> {
        self.slots
            .get(&collection)
            .ok_or_else(|| BudgetError::StorageError(format!("Unknown collection {:?}", collection)))
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn decode<T: DeserializeOwned + Default>(value: &Option<Value>) -> Result<T, BudgetError> {
    match value {
        None => Ok(T::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| BudgetError::StorageError(format!("Failed to decode collection: {}", e))),
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn read<T>(&self, collection: Collection) -> Result<T, BudgetError>
    where
        T: DeserializeOwned + Default + Send,
    {
        let slot = self.slot(collection)?.lock().await;
        decode(&slot)
    }

    async fn update<T, R, F>(&self, collection: Collection, mutate: F) -> Result<R, BudgetError>
    where
        T: Serialize + DeserializeOwned + Default + Send,
        R: Send,
        F: FnOnce(&mut T) -> Result<R, BudgetError> + Send,
    {
        let mut slot = self.slot(collection)?.lock().await;
        let mut data: T = decode(&slot)?;
        let out = mutate(&mut data)?;
        let encoded = serde_json::to_value(&data)
            .map_err(|e| BudgetError::StorageError(format!("Failed to encode collection: {}", e)))?;
        *slot = Some(encoded);
        Ok(out)
    }
}
