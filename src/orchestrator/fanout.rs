//! Deadline-bounded multiplexed read shared by the batch and streaming aggregators

use crate::error::RemoteError;
use crate::orchestrator::Aggregator;
use crate::trace::StepRecorder;
use crate::transport::Channel;
use crate::types::{CorrelatedRequest, RecipientId, ReplyOutcome, RequestId, StepId};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// One recipient accounted for
#[derive(Debug, Clone)]
pub(crate) struct Resolution {
    pub sender: RecipientId,
    pub result: std::result::Result<String, RemoteError>,
}

/// State of one fan-out call: the open channel, who is still owed a reply,
/// and the trace steps to close as replies arrive.
pub(crate) struct FanOut {
    request_id: RequestId,
    recorder: StepRecorder,
    recipients: Vec<RecipientId>,
    coordinator_step: Option<StepId>,
    recipient_steps: HashMap<RecipientId, Option<StepId>>,
    resolved: HashSet<RecipientId>,
    channel: Option<Box<dyn Channel>>,
    setup_failure: Option<String>,
    deadline: Instant,
    any_failed: bool,
    notes: Vec<String>,
}

impl FanOut {
    /// Open the channel, publish the request, then open the coordinator step
    /// and one step per recipient in a single trace write. The deadline
    /// starts counting here.
    ///
    /// Setup failures are not returned: every recipient later resolves as a
    /// transport failure.
    pub(crate) async fn start(
        aggregator: &Aggregator,
        recipients: Vec<RecipientId>,
        request: CorrelatedRequest,
        deadline: Duration,
    ) -> Self {
        let deadline = Instant::now() + deadline;
        let request_id = request.request_id.clone();
        let recorder = aggregator.recorder.clone();

        let topic = format!("{}.broadcast.{}", aggregator.topic_prefix, request_id);
        let (channel, setup_failure) = match aggregator.transport.open_channel(&topic, &recipients).await {
            Ok(mut channel) => match channel.publish(&request).await {
                Ok(()) => (Some(channel), None),
                Err(e) => (None, Some(format!("publish on {} failed: {}", topic, e))),
            },
            Err(e) => (None, Some(format!("could not open channel {}: {}", topic, e))),
        };
        if let Some(failure) = &setup_failure {
            tracing::warn!(request_id = %request_id, error = %failure, "broadcast setup failed");
        }

        let labels: Vec<&str> = std::iter::once(aggregator.coordinator.as_str())
            .chain(recipients.iter().map(RecipientId::as_str))
            .collect();
        let mut steps = recorder.start_steps(&request_id, &labels).await.into_iter();
        let coordinator_step = steps.next().flatten();
        let recipient_steps: HashMap<RecipientId, Option<StepId>> =
            recipients.iter().cloned().zip(steps).collect();

        Self {
            request_id,
            recorder,
            recipients,
            coordinator_step,
            recipient_steps,
            resolved: HashSet::new(),
            channel,
            notes: setup_failure.iter().cloned().collect(),
            setup_failure,
            deadline,
            any_failed: false,
        }
    }

    /// Wait for the next recipient to report.
    ///
    /// Returns `None` once everyone has reported, the deadline passed, or the
    /// channel broke. Replies from strangers and repeat replies are dropped.
    pub(crate) async fn next(&mut self) -> Option<Resolution> {
        if let Some(failure) = self.setup_failure.clone() {
            let sender = self.first_unresolved()?;
            return Some(
                self.resolve(sender, ReplyOutcome::RemoteError(RemoteError::transport_failure(failure)))
                    .await,
            );
        }

        loop {
            if self.resolved.len() == self.recipients.len() {
                return None;
            }
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let channel = self.channel.as_mut()?;

            let reply = match timeout_at(self.deadline, channel.next_reply(remaining)).await {
                Err(_) => return None,
                Ok(Ok(None)) => continue,
                Ok(Ok(Some(reply))) => reply,
                Ok(Err(e)) => {
                    tracing::warn!(request_id = %self.request_id, error = %e, "channel read failed");
                    self.notes.push(format!("channel read failed: {}", e));
                    self.channel = None;
                    return None;
                }
            };

            if !self.recipient_steps.contains_key(&reply.sender) {
                tracing::debug!(request_id = %self.request_id, sender = %reply.sender, "ignoring reply from non-recipient");
                continue;
            }
            if self.resolved.contains(&reply.sender) {
                tracing::debug!(request_id = %self.request_id, sender = %reply.sender, "dropping duplicate reply");
                continue;
            }

            let outcome = reply.outcome();
            return Some(self.resolve(reply.sender, outcome).await);
        }
    }

    async fn resolve(&mut self, sender: RecipientId, outcome: ReplyOutcome) -> Resolution {
        let result = match outcome {
            ReplyOutcome::Success(text) => Ok(text),
            ReplyOutcome::RemoteError(err) => Err(err),
            ReplyOutcome::Timeout => Err(RemoteError::transport_failure("reply timed out")),
        };
        self.any_failed |= result.is_err();
        self.resolved.insert(sender.clone());

        let step = self.recipient_steps.get(&sender).copied().flatten();
        self.recorder.end_step(&self.request_id, step, result.is_ok()).await;
        tracing::debug!(request_id = %self.request_id, sender = %sender, ok = result.is_ok(), "recipient reported");

        Resolution { sender, result }
    }

    fn first_unresolved(&self) -> Option<RecipientId> {
        self.recipients
            .iter()
            .find(|r| !self.resolved.contains(*r))
            .cloned()
    }

    /// Release the channel, close the coordinator step and return the
    /// recipients that never reported. Their steps stay open.
    pub(crate) async fn finish(&mut self) -> Vec<RecipientId> {
        self.channel = None;
        let missing: Vec<RecipientId> = self
            .recipients
            .iter()
            .filter(|r| !self.resolved.contains(*r))
            .cloned()
            .collect();

        let success = missing.is_empty() && !self.any_failed;
        self.recorder
            .end_step(&self.request_id, self.coordinator_step, success)
            .await;
        missing
    }

    /// Out-of-band error text gathered along the way
    pub(crate) fn take_notes(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notes)
    }
}
