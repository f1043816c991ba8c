//! Streaming broadcast - replies surfaced as they arrive

use crate::error::{RemoteError, Result};
use crate::orchestrator::fanout::FanOut;
use crate::orchestrator::{validate_fan_out, Aggregator};
use crate::types::{CorrelatedRequest, RecipientId, RequestId};
use futures::stream::{BoxStream, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// One event of a streaming broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BroadcastEvent {
    /// A recipient replied with usable text
    Delivered {
        sender: RecipientId,
        payload: String,
    },
    /// A recipient replied with a known failure
    Failed {
        sender: RecipientId,
        error: RemoteError,
    },
    /// Final event when some recipients never replied, plus any channel errors
    MissingSummary {
        recipients: Vec<RecipientId>,
        notes: Vec<String>,
    },
}

impl BroadcastEvent {
    /// Recipient this event is about (`None` for the summary)
    pub fn sender(&self) -> Option<&RecipientId> {
        match self {
            Self::Delivered { sender, .. } | Self::Failed { sender, .. } => Some(sender),
            Self::MissingSummary { .. } => None,
        }
    }
}

/// Stream of [`BroadcastEvent`]s for one request.
///
/// Dropping the stream early releases the channel. Recipients that had not
/// reported yet keep their trace steps open.
pub struct BroadcastStream {
    request_id: RequestId,
    inner: BoxStream<'static, BroadcastEvent>,
}

impl BroadcastStream {
    /// Request the events belong to
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }
}

impl Stream for BroadcastStream {
    type Item = BroadcastEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for BroadcastStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastStream")
            .field("request_id", &self.request_id)
            .finish()
    }
}

impl Aggregator {
    /// Like [`aggregate`](Aggregator::aggregate), but yields each reply as it
    /// arrives. When some recipients never reported, the stream ends with a
    /// single [`BroadcastEvent::MissingSummary`].
    ///
    /// Arguments are checked now. Nothing is sent until the stream is first
    /// polled, and the deadline starts counting at that point.
    pub fn aggregate_stream(
        &self,
        recipients: &[RecipientId],
        payload: Value,
        deadline: Duration,
    ) -> Result<BroadcastStream> {
        let recipients = validate_fan_out(recipients, &payload, deadline)?;
        let request = CorrelatedRequest::new(payload);
        let request_id = request.request_id.clone();
        let aggregator = self.clone();

        let inner = async_stream::stream! {
            let mut fan_out = FanOut::start(&aggregator, recipients, request, deadline).await;
            while let Some(resolution) = fan_out.next().await {
                yield match resolution.result {
                    Ok(payload) => BroadcastEvent::Delivered { sender: resolution.sender, payload },
                    Err(error) => BroadcastEvent::Failed { sender: resolution.sender, error },
                };
            }
            let missing = fan_out.finish().await;
            let notes = fan_out.take_notes();
            tracing::info!(missing = missing.len(), "streaming broadcast finished");
            if !missing.is_empty() {
                yield BroadcastEvent::MissingSummary { recipients: missing, notes };
            } else {
                for note in notes {
                    tracing::warn!(note = %note, "broadcast note");
                }
            }
        };

        Ok(BroadcastStream {
            request_id,
            inner: Box::pin(inner),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, RemoteErrorKind};
    use crate::orchestrator::AggregationOutcome;
    use crate::trace::{StepRecorder, StepStatus};
    use crate::transport::{Channel, InMemoryTransport, Outbound, Scripted, Transport};
    use crate::types::{CorrelatedReply, ReplyBody};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Arc;

    /// Transport whose channels deliver one reply from "A" and then break
    struct BreakingTransport;

    struct BreakingChannel {
        topic: String,
        served: bool,
    }

    #[async_trait]
    impl Transport for BreakingTransport {
        async fn send(&self, _recipient: &RecipientId, _request: &CorrelatedRequest) -> Result<ReplyBody> {
            Err(Error::transport("unicast not supported"))
        }

        async fn open_channel(&self, topic: &str, _recipients: &[RecipientId]) -> Result<Box<dyn Channel>> {
            Ok(Box::new(BreakingChannel {
                topic: topic.to_string(),
                served: false,
            }))
        }

        fn transport_type(&self) -> &str {
            "breaking"
        }
    }

    #[async_trait]
    impl Channel for BreakingChannel {
        async fn publish(&mut self, _request: &CorrelatedRequest) -> Result<()> {
            Ok(())
        }

        async fn next_reply(&mut self, _budget: Duration) -> Result<Option<CorrelatedReply>> {
            if self.served {
                return Err(Error::transport("connection reset"));
            }
            self.served = true;
            Ok(Some(CorrelatedReply::new("A".into(), ReplyBody::text("payload_A"))))
        }

        fn topic(&self) -> &str {
            &self.topic
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn ids(names: &[&str]) -> Vec<RecipientId> {
        names.iter().map(|n| RecipientId::new(*n)).collect()
    }

    fn transport() -> InMemoryTransport {
        InMemoryTransport::new()
            .with_participant("A", Scripted::new().on_request(Outbound::text("payload_A").after(ms(100))))
            .with_participant("B", Scripted::new().on_request(Outbound::rejected("err_B").after(ms(200))))
            .with_participant("C", Scripted::silent())
    }

    fn aggregator(transport: InMemoryTransport) -> (Aggregator, StepRecorder) {
        let recorder = StepRecorder::in_memory(Duration::from_secs(60));
        (Aggregator::new(Arc::new(transport), recorder.clone()), recorder)
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_arrive_in_reply_order_then_summary() {
        let (aggregator, _) = aggregator(transport());
        let stream = aggregator
            .aggregate_stream(&ids(&["C", "B", "A"]), json!("quote please"), Duration::from_secs(2))
            .unwrap();
        let events: Vec<BroadcastEvent> = stream.collect().await;

        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            BroadcastEvent::Delivered {
                sender: "A".into(),
                payload: "payload_A".to_string()
            }
        );
        match &events[1] {
            BroadcastEvent::Failed { sender, error } => {
                assert_eq!(sender.as_str(), "B");
                assert_eq!(error.kind, RemoteErrorKind::RemoteRejected);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            events[2],
            BroadcastEvent::MissingSummary {
                recipients: ids(&["C"]),
                notes: Vec::new()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_matches_batch_outcome() {
        let (aggregator, _) = aggregator(transport());
        let recipients = ids(&["A", "B", "C"]);

        let batch = aggregator
            .aggregate(&recipients, json!("ping"), Duration::from_secs(2))
            .await
            .unwrap();

        let stream = aggregator
            .aggregate_stream(&recipients, json!("ping"), Duration::from_secs(2))
            .unwrap();
        let mut folded = AggregationOutcome::new(stream.request_id().clone());
        let events: Vec<BroadcastEvent> = stream.collect().await;
        for event in events {
            match event {
                BroadcastEvent::Delivered { sender, payload } => {
                    folded.succeeded.insert(sender, payload);
                }
                BroadcastEvent::Failed { sender, error } => {
                    folded.failed.insert(sender, error);
                }
                BroadcastEvent::MissingSummary { recipients, .. } => {
                    folded.missing.extend(recipients);
                }
            }
        }

        assert_eq!(folded.succeeded, batch.succeeded);
        assert_eq!(folded.failed, batch.failed);
        assert_eq!(folded.missing, batch.missing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_stream_releases_channel() {
        let transport = transport();
        let handle = transport.clone();
        let (aggregator, recorder) = aggregator(transport);

        let mut stream = aggregator
            .aggregate_stream(&ids(&["A", "B", "C"]), json!("ping"), Duration::from_secs(2))
            .unwrap();
        let request_id = stream.request_id().clone();
        assert_eq!(handle.open_channel_count(), 0);

        let first = stream.next().await.unwrap();
        assert_eq!(first.sender().map(RecipientId::as_str), Some("A"));
        assert_eq!(handle.open_channel_count(), 1);

        drop(stream);
        assert_eq!(handle.open_channel_count(), 0);

        let trace = recorder.get_trace(&request_id).await;
        let open: Vec<&str> = trace.open_steps().map(|s| s.participant.as_str()).collect();
        assert!(open.contains(&"B"));
        assert!(open.contains(&"C"));
        assert!(open.contains(&"coordinator"));
        assert!(trace
            .steps
            .iter()
            .any(|s| s.participant == "A" && s.status() == StepStatus::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_summary_when_everyone_reports() {
        let transport = InMemoryTransport::new()
            .with_participant("A", Scripted::new().on_request(Outbound::text("a").after(ms(30))))
            .with_participant("B", Scripted::new().on_request(Outbound::text("b").after(ms(10))));
        let (aggregator, _) = aggregator(transport);

        let events: Vec<BroadcastEvent> = aggregator
            .aggregate_stream(&ids(&["A", "B"]), json!("ping"), Duration::from_secs(5))
            .unwrap()
            .collect()
            .await;
        let senders: Vec<&str> = events.iter().filter_map(|e| e.sender()).map(RecipientId::as_str).collect();
        assert_eq!(senders, vec!["B", "A"]);
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_arguments_fail_before_streaming() {
        let (aggregator, _) = aggregator(transport());
        let err = aggregator
            .aggregate_stream(&ids(&["A"]), json!("ping"), Duration::ZERO)
            .unwrap_err();
        assert!(err.is_caller_error());
    }

    #[tokio::test]
    async fn test_unreachable_transport_yields_failures_without_summary() {
        let transport = transport();
        transport.set_offline(true);
        let (aggregator, _) = aggregator(transport);

        let events: Vec<BroadcastEvent> = aggregator
            .aggregate_stream(&ids(&["A", "B"]), json!("ping"), Duration::from_secs(1))
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(
            e,
            BroadcastEvent::Failed { error, .. } if error.kind == RemoteErrorKind::TransportFailure
        )));
    }

    #[tokio::test]
    async fn test_channel_failure_mid_broadcast_lands_in_summary_notes() {
        let recorder = StepRecorder::in_memory(Duration::from_secs(60));
        let aggregator = Aggregator::new(Arc::new(BreakingTransport), recorder.clone());

        let events: Vec<BroadcastEvent> = aggregator
            .aggregate_stream(&ids(&["A", "B", "C"]), json!("ping"), Duration::from_secs(5))
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sender().map(RecipientId::as_str), Some("A"));
        match &events[1] {
            BroadcastEvent::MissingSummary { recipients, notes } => {
                assert_eq!(recipients, &ids(&["B", "C"]));
                assert_eq!(notes.len(), 1);
                assert!(notes[0].contains("connection reset"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
