//! TTL-bounded key-value stores for request traces
//!
//! [`MemoryTraceStore`] lives here; the persistent sled store sits behind
//! the `storage` feature. Both drop expired records lazily on read and in
//! a sweep that runs on write at most once per sweep interval.

use crate::error::Result;
use crate::trace::RequestTrace;
use crate::types::RequestId;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Storage for [`RequestTrace`] records keyed by request ID
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Load a trace, `None` if absent or expired
    async fn load(&self, request_id: &RequestId) -> Result<Option<RequestTrace>>;

    /// Write a trace and (re)arm its expiry
    async fn save(&self, trace: &RequestTrace, ttl: Duration) -> Result<()>;

    /// Drop expired records, returning how many were removed
    async fn purge_expired(&self) -> Result<usize>;

    /// Store type for debugging/logging
    fn store_type(&self) -> &str;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    trace: RequestTrace,
    expires_at: Instant,
}

/// How often a write also sweeps out expired records
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Throttle for the write-side sweep of expired records
#[derive(Debug)]
pub(crate) struct SweepSchedule {
    interval: Duration,
    last: Mutex<Instant>,
}

impl SweepSchedule {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(Instant::now()),
        }
    }

    /// Whether a sweep is due; claims it when it is
    pub(crate) fn claim(&self) -> bool {
        // a sweep already in progress elsewhere covers this write
        let Some(mut last) = self.last.try_lock() else {
            return false;
        };
        if last.elapsed() < self.interval {
            return false;
        }
        *last = Instant::now();
        true
    }
}

/// Process-local trace store
#[derive(Debug, Clone)]
pub struct MemoryTraceStore {
    entries: Arc<DashMap<RequestId, MemoryEntry>>,
    sweep: Arc<SweepSchedule>,
}

impl Default for MemoryTraceStore {
    fn default() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }
}

impl MemoryTraceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store sweeping expired records at most once per `interval`
    pub fn with_sweep_interval(interval: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            sweep: Arc::new(SweepSchedule::new(interval)),
        }
    }

    fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Number of live (possibly expired but not yet evicted) records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl TraceStore for MemoryTraceStore {
    async fn load(&self, request_id: &RequestId) -> Result<Option<RequestTrace>> {
        let now = Instant::now();
        match self.entries.get(request_id) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.trace.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        // Lazy eviction; the read guard above is released by now
        self.entries.remove_if(request_id, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    async fn save(&self, trace: &RequestTrace, ttl: Duration) -> Result<()> {
        self.entries.insert(
            trace.request_id.clone(),
            MemoryEntry {
                trace: trace.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        if self.sweep.claim() {
            let removed = self.sweep_expired();
            if removed > 0 {
                tracing::debug!(removed, "swept expired traces");
            }
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        Ok(self.sweep_expired())
    }

    fn store_type(&self) -> &str {
        "memory"
    }
}
