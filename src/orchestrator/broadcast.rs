//! Broadcast aggregation - fan out, wait, partition the replies

use crate::error::{RemoteError, Result};
use crate::orchestrator::fanout::FanOut;
use crate::orchestrator::{validate_fan_out, Aggregator};
use crate::types::{CorrelatedRequest, RecipientId, RequestId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Result of one broadcast.
///
/// `succeeded`, `failed` and `missing` partition the recipient set: every
/// recipient appears in exactly one of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationOutcome {
    /// Request the replies belong to (use it to fetch the trace)
    pub request_id: RequestId,
    /// Recipients that replied with usable text
    pub succeeded: BTreeMap<RecipientId, String>,
    /// Recipients that replied with a known failure
    pub failed: BTreeMap<RecipientId, RemoteError>,
    /// Recipients that did not reply before the deadline
    pub missing: BTreeSet<RecipientId>,
}

impl AggregationOutcome {
    /// Create an empty outcome
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            succeeded: BTreeMap::new(),
            failed: BTreeMap::new(),
            missing: BTreeSet::new(),
        }
    }

    /// Every recipient replied successfully
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.missing.is_empty()
    }

    /// Number of recipients covered
    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.missing.len()
    }

    /// Whether no recipient is covered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All recipients covered, sorted
    pub fn recipients(&self) -> BTreeSet<RecipientId> {
        self.succeeded
            .keys()
            .chain(self.failed.keys())
            .chain(self.missing.iter())
            .cloned()
            .collect()
    }
}

impl fmt::Display for AggregationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (recipient, text) in &self.succeeded {
            writeln!(f, "{}: {}", recipient, text)?;
        }
        for (recipient, err) in &self.failed {
            writeln!(f, "{}: failed ({})", recipient, err)?;
        }
        for recipient in &self.missing {
            writeln!(f, "{}: no response — may be unavailable", recipient)?;
        }
        Ok(())
    }
}

impl Aggregator {
    /// Send `payload` to every recipient and wait up to `deadline` for replies.
    ///
    /// Returns early once every recipient has reported. Only invalid
    /// arguments produce an `Err`; remote failures and silence are reported
    /// in the outcome.
    #[tracing::instrument(name = "aggregate", skip_all, fields(recipients = recipients.len()))]
    pub async fn aggregate(
        &self,
        recipients: &[RecipientId],
        payload: Value,
        deadline: Duration,
    ) -> Result<AggregationOutcome> {
        let recipients = validate_fan_out(recipients, &payload, deadline)?;
        let request = CorrelatedRequest::new(payload);
        let mut outcome = AggregationOutcome::new(request.request_id.clone());

        let mut fan_out = FanOut::start(self, recipients, request, deadline).await;
        while let Some(resolution) = fan_out.next().await {
            match resolution.result {
                Ok(text) => {
                    outcome.succeeded.insert(resolution.sender, text);
                }
                Err(err) => {
                    outcome.failed.insert(resolution.sender, err);
                }
            }
        }
        outcome.missing = fan_out.finish().await.into_iter().collect();

        for note in fan_out.take_notes() {
            tracing::warn!(request_id = %outcome.request_id, note = %note, "broadcast note");
        }
        tracing::info!(
            request_id = %outcome.request_id,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            missing = outcome.missing.len(),
            "broadcast finished"
        );

        Ok(outcome)
    }
}
