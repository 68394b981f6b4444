use crate::core::errors::BudgetError;
use crate::infrastructure::storage::{Collection, Storage};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One pretty-printed JSON file per collection under a data directory.
///
/// A missing file reads as an empty collection. A file that exists but does not parse is an
/// error: silently starting from empty would overwrite the user's data on the next save.
#[derive(Clone)]
pub struct JsonFileStorage {
    data_dir: PathBuf,
    locks: Arc<HashMap<Collection, Mutex<()>>>,
}

impl JsonFileStorage {
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, BudgetError> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await.map_err(|e| {
            BudgetError::StorageError(format!("Cannot create data dir {}: {}", data_dir.display(), e))
        })?;
        info!("Using JSON data directory {}", data_dir.display());
        let locks = Collection::ALL
            .into_iter()
            .map(|collection| (collection, Mutex::new(())))
            .collect();
        Ok(JsonFileStorage {
            data_dir,
            locks: Arc::new(locks),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn path(&self, collection: Collection) -> PathBuf {
        self.data_dir.join(collection.file_name())
    }

    fn lock(&self, collection: Collection) -> Result<&Mutex<()>, BudgetError> {
        self.locks
            .get(&collection)
            .ok_or_else(|| BudgetError::StorageError(format!("Unknown collection {:?}", collection)))
    }

    async fn load<T: DeserializeOwned + Default>(&self, collection: Collection) -> Result<T, BudgetError> {
        let path = self.path(collection);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(T::default()),
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| BudgetError::StorageError(format!("Corrupt {}: {}", path.display(), e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(BudgetError::StorageError(format!(
                "Cannot read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn encode<T: Serialize>(&self, collection: Collection, data: &T) -> Result<String, BudgetError> {
        serde_json::to_string_pretty(data).map_err(|e| {
            BudgetError::StorageError(format!("Failed to encode {}: {}", collection.file_name(), e))
        })
    }

    async fn save(&self, collection: Collection, encoded: String) -> Result<(), BudgetError> {
        let path = self.path(collection);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, encoded)
            .await
            .map_err(|e| BudgetError::StorageError(format!("Cannot write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| BudgetError::StorageError(format!("Cannot replace {}: {}", path.display(), e)))?;
        debug!("Saved {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl Storage for JsonFileStorage {
    async fn read<T>(&self, collection: Collection) -> Result<T, BudgetError>
    where
        T: DeserializeOwned + Default + Send,
    {
        let _guard = self.lock(collection)?.lock().await;
        self.load(collection).await
    }

    async fn update<T, R, F>(&self, collection: Collection, mutate: F) -> Result<R, BudgetError>
    where
        T: Serialize + DeserializeOwned + Default + Send,
        R: Send,
        F: FnOnce(&mut T) -> Result<R, BudgetError> + Send,
    {
        let _guard = self.lock(collection)?.lock().await;
        let mut data: T = self.load(collection).await?;
        let out = mutate(&mut data)?;
        // Encoded before the write so no borrow of `data` lives across an await.
        let encoded = self.encode(collection, &data)?;
        drop(data);
        self.save(collection, encoded).await?;
        Ok(out)
    }
}
