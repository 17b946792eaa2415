//! [`HeartRateSink`] over the SQLite store.

use async_trait::async_trait;
use pulse_core::{Error, HeartRateSink, Result, StoredHeartRate};
use pulse_store::Store;
use tokio::sync::Mutex;

/// Persists session samples into a [`Store`].
#[derive(Debug)]
pub struct StoreSink {
    store: Mutex<Store>,
}

impl StoreSink {
    pub fn new(store: Store) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    /// Number of stored readings.
    pub async fn count(&self) -> Result<u64> {
        self.store.lock().await.count().map_err(Error::persistence)
    }
}

#[async_trait]
impl HeartRateSink for StoreSink {
    async fn insert(&self, value: u16, timestamp_millis: i64) -> Result<()> {
        let store = self.store.lock().await;
        store
            .insert(value, timestamp_millis)
            .map(|_| ())
            .map_err(Error::persistence)
    }

    async fn delete_all(&self) -> Result<()> {
        let store = self.store.lock().await;
        store.delete_all().map(|_| ()).map_err(Error::persistence)
    }

    async fn get_all(&self) -> Result<Vec<StoredHeartRate>> {
        let store = self.store.lock().await;
        store.get_all().map_err(Error::persistence)
    }
}
