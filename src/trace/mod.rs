//! Step-level request tracing
//!
//! Every orchestrated request leaves a [`RequestTrace`]: an append-only list
//! of [`Step`]s naming who took part and how long each part took. The
//! [`StepRecorder`] writes those steps into a TTL-bounded [`TraceStore`].
//!
//! Recording is strictly best effort. A missing request ID, a failing store
//! or a store that does not answer within the recorder's store timeout is
//! logged and ignored, so it never changes the outcome of the call being
//! traced and delays it by at most one timeout per store operation.

#[cfg(feature = "storage")]
pub mod sled_store;
pub mod store;

use crate::error::{Error, Result};
use crate::types::{RequestId, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "storage")]
pub use sled_store::SledTraceStore;
pub use store::{MemoryTraceStore, TraceStore};

/// One participant's involvement in a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique step identifier
    pub step_id: StepId,
    /// Participant label
    pub participant: String,
    /// Start timestamp
    pub start_time: DateTime<Utc>,
    /// End timestamp (`None` while open)
    pub end_time: Option<DateTime<Utc>>,
    /// Whether the participant's part succeeded (`None` while open)
    pub success: Option<bool>,
}

impl Step {
    /// Create an open step starting now
    pub fn open(participant: impl Into<String>) -> Self {
        Self {
            step_id: StepId::new(),
            participant: participant.into(),
            start_time: Utc::now(),
            end_time: None,
            success: None,
        }
    }

    /// Create a step that is already closed, started at `start_time`
    pub fn closed(participant: impl Into<String>, start_time: DateTime<Utc>, success: bool) -> Self {
        let end_time = Utc::now().max(start_time);
        Self {
            step_id: StepId::new(),
            participant: participant.into(),
            start_time,
            end_time: Some(end_time),
            success: Some(success),
        }
    }

    /// Whether the step has not been closed
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Close the step. Returns `false` if it was already closed.
    pub fn close(&mut self, success: bool) -> bool {
        if !self.is_open() {
            return false;
        }
        self.end_time = Some(Utc::now());
        self.success = Some(success);
        true
    }

    /// Elapsed time of a closed step
    pub fn duration(&self) -> Option<Duration> {
        self.end_time
            .and_then(|end| (end - self.start_time).to_std().ok())
    }

    /// Current status
    pub fn status(&self) -> StepStatus {
        match self.success {
            None => StepStatus::Open,
            Some(true) => StepStatus::Succeeded,
            Some(false) => StepStatus::Failed,
        }
    }
}

/// Status of a step as shown to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Still running
    Open,
    /// Closed successfully
    Succeeded,
    /// Closed with failure
    Failed,
    /// Never closed although the request itself finished (route view only)
    Abandoned,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Open => "open",
            Self::Succeeded => "ok",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        };
        f.write_str(label)
    }
}

/// All steps recorded for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTrace {
    /// Request these steps belong to
    pub request_id: RequestId,
    /// Steps in start order
    pub steps: Vec<Step>,
}

impl RequestTrace {
    /// Create an empty trace
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            steps: Vec::new(),
        }
    }

    /// Find a step by ID
    pub fn step(&self, step_id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Steps that were never closed
    pub fn open_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.is_open())
    }

    /// Distinct participant labels in order of first appearance
    pub fn participants(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for step in &self.steps {
            if !seen.contains(&step.participant.as_str()) {
                seen.push(step.participant.as_str());
            }
        }
        seen
    }

    /// Operator-facing view of the request route.
    ///
    /// Once the first (coordinator) step is closed the request is over, and
    /// steps still open are reported as abandoned.
    pub fn route(&self) -> Vec<RouteEntry> {
        let finished = self.steps.first().is_some_and(|s| !s.is_open());
        self.steps
            .iter()
            .map(|step| RouteEntry {
                participant: step.participant.clone(),
                status: match step.status() {
                    StepStatus::Open if finished => StepStatus::Abandoned,
                    status => status,
                },
                duration_ms: step.duration().map(|d| d.as_millis() as u64),
            })
            .collect()
    }

    fn sort(&mut self) {
        self.steps.sort_by_key(|s| s.start_time);
    }
}

/// One line of a rendered request route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Participant label
    pub participant: String,
    /// Step status
    pub status: StepStatus,
    /// Duration of closed steps, in milliseconds
    pub duration_ms: Option<u64>,
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.duration_ms {
            Some(ms) => write!(f, "{} [{}] {}ms", self.participant, self.status, ms),
            None => write!(f, "{} [{}]", self.participant, self.status),
        }
    }
}

/// Longest a single store operation may take before it counts as failed
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// Writes steps into a shared [`TraceStore`]
#[derive(Clone)]
pub struct StepRecorder {
    store: Arc<dyn TraceStore>,
    ttl: Duration,
    store_timeout: Duration,
}

impl StepRecorder {
    /// Create a recorder writing into `store` with the given retention
    pub fn new(store: Arc<dyn TraceStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Recorder over a fresh in-memory store
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryTraceStore::new()), ttl)
    }

    /// Bound every store operation by `timeout`
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Open a step for `participant`.
    ///
    /// Returns `None` when the request ID is blank or the store fails.
    pub async fn start_step(&self, request_id: &RequestId, participant: &str) -> Option<StepId> {
        self.start_steps(request_id, &[participant]).await.pop().flatten()
    }

    /// Open one step per participant with a single store round trip.
    ///
    /// The returned IDs line up with `participants`; all are `None` when
    /// the request ID is blank or the store fails.
    pub async fn start_steps(&self, request_id: &RequestId, participants: &[&str]) -> Vec<Option<StepId>> {
        if request_id.is_empty() {
            tracing::debug!(steps = participants.len(), "skipping steps for blank request id");
            return vec![None; participants.len()];
        }
        let steps: Vec<Step> = participants.iter().map(|p| Step::open(*p)).collect();
        self.append(request_id, steps).await
    }

    /// Append a step that already finished, e.g. a relay hop observed after
    /// the fact. Returns `None` when the request ID is blank or the store fails.
    pub async fn record_step(
        &self,
        request_id: &RequestId,
        participant: &str,
        started_at: DateTime<Utc>,
        success: bool,
    ) -> Option<StepId> {
        if request_id.is_empty() {
            return None;
        }
        self.append(request_id, vec![Step::closed(participant, started_at, success)])
            .await
            .pop()
            .flatten()
    }

    async fn append(&self, request_id: &RequestId, steps: Vec<Step>) -> Vec<Option<StepId>> {
        let failed = vec![None; steps.len()];
        let mut trace = match self.load(request_id).await {
            Ok(existing) => existing.unwrap_or_else(|| RequestTrace::new(request_id.clone())),
            Err(e) => {
                tracing::warn!(request_id = %request_id, steps = steps.len(), error = %e, "trace load failed");
                return failed;
            }
        };

        let ids: Vec<Option<StepId>> = steps.iter().map(|s| Some(s.step_id)).collect();
        trace.steps.extend(steps);

        match self.save(&trace).await {
            Ok(()) => ids,
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "trace save failed");
                failed
            }
        }
    }

    /// Close a step. The first close wins; later calls are no-ops.
    pub async fn end_step(&self, request_id: &RequestId, step_id: Option<StepId>, success: bool) {
        self.end_steps(request_id, &[(step_id, success)]).await;
    }

    /// Close several steps with a single store round trip
    pub async fn end_steps(&self, request_id: &RequestId, closes: &[(Option<StepId>, bool)]) {
        if request_id.is_empty() || closes.iter().all(|(step, _)| step.is_none()) {
            return;
        }

        let mut trace = match self.load(request_id).await {
            Ok(Some(trace)) => trace,
            Ok(None) => {
                tracing::debug!(request_id = %request_id, "trace expired before step end");
                return;
            }
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "trace load failed");
                return;
            }
        };

        let mut closed = false;
        for (step_id, success) in closes {
            let Some(step_id) = step_id else { continue };
            if let Some(step) = trace.steps.iter_mut().find(|s| s.step_id == *step_id) {
                closed |= step.close(*success);
            }
        }
        if !closed {
            return;
        }

        if let Err(e) = self.save(&trace).await {
            tracing::warn!(request_id = %request_id, error = %e, "trace save failed");
        }
    }

    /// Read a request's steps ordered by start time
    pub async fn get_trace(&self, request_id: &RequestId) -> RequestTrace {
        match self.load(request_id).await {
            Ok(Some(mut trace)) => {
                trace.sort();
                trace
            }
            Ok(None) => RequestTrace::new(request_id.clone()),
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "trace load failed");
                RequestTrace::new(request_id.clone())
            }
        }
    }

    /// Retention applied on every write
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Bound on each store operation
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    async fn load(&self, request_id: &RequestId) -> Result<Option<RequestTrace>> {
        tokio::time::timeout(self.store_timeout, self.store.load(request_id))
            .await
            .map_err(|_| Error::storage(format!("load timed out after {:?}", self.store_timeout)))?
    }

    async fn save(&self, trace: &RequestTrace) -> Result<()> {
        tokio::time::timeout(self.store_timeout, self.store.save(trace, self.ttl))
            .await
            .map_err(|_| Error::storage(format!("save timed out after {:?}", self.store_timeout)))?
    }
}

impl fmt::Debug for StepRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRecorder")
            .field("store", &self.store.store_type())
            .field("ttl", &self.ttl)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}
