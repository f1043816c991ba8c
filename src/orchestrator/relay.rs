//! Group relay - participants forward work to each other while the
//! coordinator watches the shared channel for a terminal marker

use crate::error::{Error, Result};
use crate::orchestrator::{DEFAULT_COORDINATOR, DEFAULT_TOPIC_PREFIX};
use crate::trace::StepRecorder;
use crate::transport::Transport;
use crate::types::{payload_is_empty, CorrelatedReply, CorrelatedRequest, RecipientId, ReplyBody, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// Result of one relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRelayResult {
    /// Request the relay ran under
    pub request_id: RequestId,
    /// Text of the first reply containing the terminal marker
    pub terminal_payload: Option<String>,
    /// Every message seen on the channel, in arrival order
    pub observed_hops: Vec<CorrelatedReply>,
    /// The deadline passed (or the channel failed) before the marker showed up
    pub timed_out: bool,
    /// Time from publish to return
    pub elapsed: Duration,
    /// Channel errors met along the way
    #[serde(default)]
    pub notes: Vec<String>,
}

impl GroupRelayResult {
    /// Senders of the observed hops, in order
    pub fn hop_senders(&self) -> Vec<&str> {
        self.observed_hops.iter().map(|h| h.sender.as_str()).collect()
    }

    /// Whether the terminal marker was seen
    pub fn completed(&self) -> bool {
        !self.timed_out && self.terminal_payload.is_some()
    }
}

/// Observes relay workflows.
///
/// The relay never routes anything itself: it publishes the opening request
/// to the seed participants and then only reads the channel.
///
/// Each observed hop is traced as a closed step for its sender, spanning
/// from the previous observation (or the publish) to this one.
#[derive(Clone)]
pub struct GroupRelay {
    transport: Arc<dyn Transport>,
    recorder: StepRecorder,
    coordinator: String,
    topic_prefix: String,
}

impl GroupRelay {
    /// Create a relay observer
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

    /// Publish `payload` to the seeds and wait for a reply containing
    /// `terminal_marker`, or for `deadline` to pass.
    ///
    /// Marker matching is a substring test on the reply text, falling back
    /// to the raw body when the reply carries no text. Transport failures
    /// end the relay early with `timed_out` set and the error in `notes`;
    /// only invalid arguments are returned as `Err`.
    #[tracing::instrument(name = "relay", skip_all, fields(seeds = seed_recipients.len(), marker = %terminal_marker))]
    pub async fn relay(
        &self,
        seed_recipients: &[RecipientId],
        payload: Value,
        terminal_marker: &str,
        deadline: Duration,
    ) -> Result<GroupRelayResult> {
        if seed_recipients.is_empty() {
            return Err(Error::invalid_input("seed recipients must not be empty"));
        }
        if seed_recipients.iter().any(RecipientId::is_empty) {
            return Err(Error::invalid_input("seed recipients must not be blank"));
        }
        if deadline.is_zero() {
            return Err(Error::invalid_input("deadline must be positive"));
        }
        if terminal_marker.is_empty() {
            return Err(Error::invalid_input("terminal marker must not be empty"));
        }
        if payload_is_empty(&payload) {
            return Err(Error::invalid_input("payload must not be empty"));
        }

        let started = Instant::now();
        let deadline_at = started + deadline;
        let request = CorrelatedRequest::new(payload);
        let request_id = request.request_id.clone();
        let coordinator_step = self.recorder.start_step(&request_id, &self.coordinator).await;

        let mut result = GroupRelayResult {
            request_id: request_id.clone(),
            terminal_payload: None,
            observed_hops: Vec::new(),
            timed_out: true,
            elapsed: Duration::ZERO,
            notes: Vec::new(),
        };

        let topic = format!("{}.relay.{}", self.topic_prefix, request_id);
        let opened = match self.transport.open_channel(&topic, seed_recipients).await {
            Ok(mut channel) => channel.publish(&request).await.map(|()| channel),
            Err(e) => Err(e),
        };
        let mut channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(request_id = %request_id, topic = %topic, error = %e, "relay could not start");
                result.notes.push(format!("relay on {} failed to start: {}", topic, e));
                result.elapsed = started.elapsed();
                self.recorder.end_step(&request_id, coordinator_step, false).await;
                return Ok(result);
            }
        };
        let mut last_observed = Utc::now();

        loop {
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let hop = match timeout_at(deadline_at, channel.next_reply(remaining)).await {
                Err(_) => break,
                Ok(Ok(None)) => continue,
                Ok(Ok(Some(hop))) => hop,
                Ok(Err(e)) => {
                    tracing::warn!(request_id = %request_id, error = %e, "relay channel failed");
                    result.notes.push(format!("channel read failed: {}", e));
                    break;
                }
            };

            self.record_hop(&request_id, &hop, last_observed).await;
            last_observed = Utc::now();
            tracing::debug!(
                request_id = %request_id,
                sender = %hop.sender,
                addressed_to = hop.addressed_to.len(),
                "relay hop"
            );

            let text = hop_text(&hop.body);
            let terminal = text.contains(terminal_marker);
            result.observed_hops.push(hop);
            if terminal {
                result.terminal_payload = Some(text);
                result.timed_out = false;
                break;
            }
        }
        drop(channel);

        result.elapsed = started.elapsed();
        self.recorder
            .end_step(&request_id, coordinator_step, !result.timed_out)
            .await;

        if result.timed_out {
            tracing::warn!(
                request_id = %request_id,
                hops = result.observed_hops.len(),
                "relay ended without terminal marker"
            );
        } else {
            tracing::info!(
                request_id = %request_id,
                hops = result.observed_hops.len(),
                elapsed_ms = result.elapsed.as_millis() as u64,
                "relay completed"
            );
        }

        Ok(result)
    }

    async fn record_hop(&self, request_id: &RequestId, hop: &CorrelatedReply, since: DateTime<Utc>) {
        let success = !matches!(hop.body, ReplyBody::Rejected(_));
        self.recorder
            .record_step(request_id, hop.sender.as_str(), since, success)
            .await;
    }
}

impl std::fmt::Debug for GroupRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupRelay")
            .field("transport", &self.transport.transport_type())
            .field("coordinator", &self.coordinator)
            .field("topic_prefix", &self.topic_prefix)
            .finish()
    }
}

fn hop_text(body: &ReplyBody) -> String {
    body.extract_text().unwrap_or_else(|| body.render())
}
