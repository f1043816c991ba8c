//! Orchestrator module - multi-recipient coordination patterns
//!
//! # Patterns
//!
//! - **Broadcast**: fan one request out to a fixed recipient set and fold
//!   the replies into an [`AggregationOutcome`]
//! - **Streaming broadcast**: the same fan-out, surfaced as a stream of
//!   [`BroadcastEvent`]s in arrival order
//! - **Group relay**: publish once to a chain of participants that forward
//!   work to each other, and watch the channel for a terminal marker
//!
//! Partial failure is the common case here. Slow, absent and failing
//! recipients are reported in the returned values; only caller mistakes
//! come back as `Err`.
//!
//! # Example
//!
//! ```rust,ignore
//! use switchboard::orchestrator::Aggregator;
//!
//! let outcome = aggregator
//!     .aggregate(&recipients, json!("Who can ship 10 crates?"), Duration::from_secs(2))
//!     .await?;
//! println!("{}", outcome);
//! ```

pub mod broadcast;
pub(crate) mod fanout;
pub mod plan;
pub mod relay;
pub mod streaming;

use crate::error::{Error, Result};
use crate::trace::StepRecorder;
use crate::transport::Transport;
use crate::types::{payload_is_empty, RecipientId};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

// Re-exports
pub use broadcast::AggregationOutcome;
pub use plan::{Workflow, WorkflowOutcome, WorkflowPlan};
pub use relay::{GroupRelay, GroupRelayResult};
pub use streaming::{BroadcastEvent, BroadcastStream};

/// Default participant label for coordinator steps
pub const DEFAULT_COORDINATOR: &str = "coordinator";

/// Default prefix for channel topics
pub const DEFAULT_TOPIC_PREFIX: &str = "switchboard";

/// Fans one request out to many recipients.
///
/// [`aggregate`](Aggregator::aggregate) collects to completion;
/// [`aggregate_stream`](Aggregator::aggregate_stream) yields as replies
/// arrive. Both run on the same deadline-bounded read.
#[derive(Clone)]
pub struct Aggregator {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) recorder: StepRecorder,
    pub(crate) coordinator: String,
    pub(crate) topic_prefix: String,
}

impl Aggregator {
    /// Create an aggregator
    pub fn new(transport: Arc<dyn Transport>, recorder: StepRecorder) -> Self {
        Self {
            transport,
            recorder,
            coordinator: DEFAULT_COORDINATOR.to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
        }
    }

    /// Set the coordinator label used in traces
    pub fn with_coordinator(mut self, coordinator: impl Into<String>) -> Self {
        self.coordinator = coordinator.into();
        self
    }

    /// Set the channel topic prefix
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("transport", &self.transport.transport_type())
            .field("recorder", &self.recorder)
            .field("coordinator", &self.coordinator)
            .field("topic_prefix", &self.topic_prefix)
            .finish()
    }
}

/// Check the arguments shared by every fan-out call and drop repeated
/// recipients, keeping first-seen order.
pub(crate) fn validate_fan_out(
    recipients: &[RecipientId],
    payload: &Value,
    deadline: Duration,
) -> Result<Vec<RecipientId>> {
    if recipients.is_empty() {
        return Err(Error::invalid_input("recipient set must not be empty"));
    }
    if let Some(blank) = recipients.iter().position(RecipientId::is_empty) {
        return Err(Error::invalid_input(format!("recipient #{} is blank", blank)));
    }
    if deadline.is_zero() {
        return Err(Error::invalid_input("deadline must be positive"));
    }
    if payload_is_empty(payload) {
        return Err(Error::invalid_input("payload must not be empty"));
    }

    let mut unique = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        if !unique.contains(recipient) {
            unique.push(recipient.clone());
        }
    }
    Ok(unique)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(names: &[&str]) -> Vec<RecipientId> {
        names.iter().map(|n| RecipientId::new(*n)).collect()
    }

    #[test]
    fn test_validation_rejects_caller_errors() {
        let second = Duration::from_secs(1);
        assert!(validate_fan_out(&[], &json!("x"), second).unwrap_err().is_caller_error());
        assert!(validate_fan_out(&ids(&["a"]), &json!("x"), Duration::ZERO).is_err());
        assert!(validate_fan_out(&ids(&["a"]), &Value::Null, second).is_err());
        assert!(validate_fan_out(&ids(&["a", " "]), &json!("x"), second).is_err());
    }

    #[test]
    fn test_validation_dedupes_in_order() {
        let unique = validate_fan_out(&ids(&["b", "a", "b"]), &json!({"q": 1}), Duration::from_secs(1)).unwrap();
        assert_eq!(unique, ids(&["b", "a"]));
    }
}
