//! Persistent trace store on an embedded sled database

use crate::error::{Error, Result};
use crate::trace::store::{SweepSchedule, DEFAULT_SWEEP_INTERVAL};
use crate::trace::{RequestTrace, TraceStore};
use crate::types::RequestId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct SledRecord {
    expires_at: DateTime<Utc>,
    trace: RequestTrace,
}

/// Trace store backed by an embedded sled database
///
/// Records survive process restarts until their TTL runs out.
#[derive(Clone)]
pub struct SledTraceStore {
    tree: sled::Tree,
    sweep: Arc<SweepSchedule>,
}

impl SledTraceStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(&db)
    }

    /// Use the `traces` tree of an already opened database
    pub fn from_db(db: &sled::Db) -> Result<Self> {
        let tree = db.open_tree("traces")?;
        Ok(Self {
            tree,
            sweep: Arc::new(SweepSchedule::new(DEFAULT_SWEEP_INTERVAL)),
        })
    }

    /// Sweep expired records on write at most once per `interval`
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep = Arc::new(SweepSchedule::new(interval));
        self
    }

    fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for entry in self.tree.iter() {
            let (key, bytes) = entry?;
            let expired = match Self::decode(&bytes) {
                Ok(record) => record.expires_at <= now,
                // Unreadable records can never be served again
                Err(_) => true,
            };
            if expired {
                self.tree.remove(key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn decode(bytes: &[u8]) -> Result<SledRecord> {
        serde_json::from_slice(bytes).map_err(Error::from)
    }
}

#[async_trait]
impl TraceStore for SledTraceStore {
    async fn load(&self, request_id: &RequestId) -> Result<Option<RequestTrace>> {
        let Some(bytes) = self.tree.get(request_id.as_str().as_bytes())? else {
            return Ok(None);
        };
        let record = Self::decode(&bytes)?;
        if record.expires_at <= Utc::now() {
            self.tree.remove(request_id.as_str().as_bytes())?;
            return Ok(None);
        }
        Ok(Some(record.trace))
    }

    async fn save(&self, trace: &RequestTrace, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::storage(format!("TTL out of range: {}", e)))?;
        let record = SledRecord {
            expires_at: Utc::now() + ttl,
            trace: trace.clone(),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.tree.insert(trace.request_id.as_str().as_bytes(), bytes)?;
        if self.sweep.claim() {
            let removed = self.sweep_expired()?;
            if removed > 0 {
                tracing::debug!(removed, "swept expired traces");
            }
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.sweep_expired()
    }

    fn store_type(&self) -> &str {
        "sled"
    }
}

impl std::fmt::Debug for SledTraceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledTraceStore")
            .field("records", &self.tree.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Step;

    fn trace(id: &str) -> RequestTrace {
        RequestTrace::new(RequestId::from_string(id))
    }

    #[tokio::test]
    async fn test_sled_store_roundtrip_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledTraceStore::open(dir.path().join("traces.db")).unwrap();

        let mut record = trace("req-1");
        record.steps.push(Step::open("coordinator"));
        store.save(&record, Duration::from_secs(60)).await.unwrap();

        let loaded = store
            .load(&RequestId::from_string("req-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.steps[0].participant, "coordinator");

        store.save(&trace("req-2"), Duration::from_millis(1)).await.unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.load(&RequestId::from_string("req-2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sled_writes_sweep_unread_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledTraceStore::open(dir.path().join("traces.db"))
            .unwrap()
            .with_sweep_interval(Duration::from_millis(10));

        for i in 0..50 {
            store
                .save(&trace(&format!("old-{}", i)), Duration::from_millis(1))
                .await
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(20));

        store.save(&trace("fresh"), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.tree.len(), 1);
    }
}
