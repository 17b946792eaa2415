//! Persistence sink boundary.
//!
//! The coordinator hands every sample that arrives while reading is active to
//! a [`HeartRateSink`]. The backing store lives outside this crate; the CLI
//! adapts `pulse-store` to this trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use pulse_types::StoredHeartRate;

use crate::error::{Error, Result};

/// Where decoded heart-rate values are persisted.
#[async_trait]
pub trait HeartRateSink: Send + Sync {
    /// Store one reading.
    async fn insert(&self, value: u16, timestamp_millis: i64) -> Result<()>;

    /// Remove every stored reading.
    async fn delete_all(&self) -> Result<()>;

    /// All stored readings, oldest first.
    async fn get_all(&self) -> Result<Vec<StoredHeartRate>>;
}

/// A [`HeartRateSink`] kept in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: RwLock<Vec<StoredHeartRate>>,
    should_fail: AtomicBool,
    insert_delay: Option<Duration>,
}

impl MemorySink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every insert take `delay`, like a slow disk.
    #[must_use]
    pub fn with_insert_delay(mut self, delay: Duration) -> Self {
        self.insert_delay = Some(delay);
        self
    }

    /// Make every call fail with [`Error::Persistence`].
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Number of stored readings.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check(&self) -> Result<()> {
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(Error::Persistence("memory sink set to fail".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl HeartRateSink for MemorySink {
    async fn insert(&self, value: u16, timestamp_millis: i64) -> Result<()> {
        if let Some(delay) = self.insert_delay {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        self.records.write().await.push(StoredHeartRate {
            value,
            timestamp_millis,
        });
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        self.check()?;
        self.records.write().await.clear();
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<StoredHeartRate>> {
        self.check()?;
        let mut records = self.records.read().await.clone();
        records.sort_by_key(|r| r.timestamp_millis);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_get_all_ordered() {
        let sink = MemorySink::new();
        sink.insert(70, 2_000).await.unwrap();
        sink.insert(68, 1_000).await.unwrap();

        let all = sink.get_all().await.unwrap();
        assert_eq!(
            all,
            vec![
                StoredHeartRate {
                    value: 68,
                    timestamp_millis: 1_000
                },
                StoredHeartRate {
                    value: 70,
                    timestamp_millis: 2_000
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_all() {
        let sink = MemorySink::new();
        sink.insert(70, 1).await.unwrap();
        sink.delete_all().await.unwrap();
        assert!(sink.is_empty().await);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let sink = MemorySink::new();
        sink.set_should_fail(true);
        assert!(matches!(
            sink.insert(70, 1).await,
            Err(Error::Persistence(_))
        ));
        sink.set_should_fail(false);
        assert_eq!(sink.len().await, 0);
    }
}
