//! Single-recipient request dispatch with step tracing

use crate::error::{Error, RemoteError, Result};
use crate::trace::StepRecorder;
use crate::transport::Transport;
use crate::types::{CorrelatedRequest, RecipientId, ReplyOutcome};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Sends one request to one recipient and records the exchange.
///
/// Each call leaves exactly two steps in the request trace: one labelled
/// `"<coordinator>:exchange"` spanning the whole exchange and one for the
/// recipient spanning the wait for its reply. Both are opened and closed in
/// one trace write each.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    recorder: StepRecorder,
    coordinator: String,
    timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        transport: Arc<dyn Transport>,
        recorder: StepRecorder,
        coordinator: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            recorder,
            coordinator: coordinator.into(),
            timeout,
        }
    }

    /// Send `payload` to `recipient` under a fresh request ID
    pub async fn send(&self, recipient: &RecipientId, payload: Value) -> Result<String> {
        self.send_request(recipient, &CorrelatedRequest::new(payload))
            .await
    }

    /// Send an already correlated request
    #[tracing::instrument(
        name = "dispatch",
        skip_all,
        fields(request_id = %request.request_id, recipient = %recipient)
    )]
    pub async fn send_request(
        &self,
        recipient: &RecipientId,
        request: &CorrelatedRequest,
    ) -> Result<String> {
        if recipient.is_empty() {
            return Err(Error::invalid_input("recipient must not be empty"));
        }
        if request.has_empty_payload() {
            return Err(Error::invalid_input("payload must not be empty"));
        }

        let request_id = &request.request_id;
        let exchange_label = self.exchange_label();
        let steps = self
            .recorder
            .start_steps(request_id, &[exchange_label.as_str(), recipient.as_str()])
            .await;
        let (exchange_step, recipient_step) = (steps[0], steps[1]);

        let result = match tokio::time::timeout(self.timeout, self.transport.send(recipient, request)).await {
            Ok(Ok(body)) => ReplyOutcome::classify(&body)
                .into_result(|| Error::timeout(format!("no reply from {}", recipient))),
            Ok(Err(e)) => Err(Error::Remote(RemoteError::transport_failure(e.to_string()))),
            Err(_) => Err(Error::timeout(format!(
                "no reply from {} within {:?}",
                recipient, self.timeout
            ))),
        };

        let success = result.is_ok();
        self.recorder
            .end_steps(request_id, &[(recipient_step, success), (exchange_step, success)])
            .await;

        match &result {
            Ok(_) => tracing::info!("exchange completed"),
            Err(e) => tracing::warn!(error = %e, "exchange failed"),
        }

        result
    }

    /// Unicast timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Trace label of the coordinator-side step
    pub fn exchange_label(&self) -> String {
        format!("{}:exchange", self.coordinator)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("transport", &self.transport.transport_type())
            .field("coordinator", &self.coordinator)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteErrorKind;
    use crate::trace::tests::{StalledStore, UnreachableStore};
    use crate::trace::StepStatus;
    use crate::transport::{InMemoryTransport, Outbound, Scripted};
    use crate::types::{ReplyBody, RequestId};
    use serde_json::json;

    fn transport() -> InMemoryTransport {
        InMemoryTransport::new()
            .with_participant("Farm", Scripted::new().on_request(Outbound::text("10 crates of apples")))
            .with_participant("Bank", Scripted::new().on_request(Outbound::rejected("account frozen")))
            .with_participant(
                "Blank",
                Scripted::new().on_request(Outbound::reply(ReplyBody::Payload(json!({ "parts": [] })))),
            )
            .with_participant(
                "Odd",
                Scripted::new().on_request(Outbound::reply(ReplyBody::Payload(json!({ "code": 7 })))),
            )
            .with_participant("Mute", Scripted::silent())
    }

    fn dispatcher(transport: InMemoryTransport, recorder: StepRecorder) -> Dispatcher {
        Dispatcher::new(Arc::new(transport), recorder, "coordinator", Duration::from_secs(5))
    }

    async fn remote_kind(dispatcher: &Dispatcher, recipient: &str) -> RemoteErrorKind {
        match dispatcher.send(&recipient.into(), json!("hello")).await {
            Err(Error::Remote(err)) => err.kind,
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_success_records_two_closed_steps() {
        let recorder = StepRecorder::in_memory(Duration::from_secs(60));
        let dispatcher = dispatcher(transport(), recorder.clone());
        let request = CorrelatedRequest::new(json!("order apples"));

        let reply = dispatcher.send_request(&"Farm".into(), &request).await.unwrap();
        assert_eq!(reply, "10 crates of apples");

        let trace = recorder.get_trace(&request.request_id).await;
        assert_eq!(trace.participants(), vec!["coordinator:exchange", "Farm"]);
        assert!(trace.steps.iter().all(|s| s.status() == StepStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_reply_classification_errors() {
        let recorder = StepRecorder::in_memory(Duration::from_secs(60));
        let dispatcher = dispatcher(transport(), recorder);

        assert_eq!(remote_kind(&dispatcher, "Bank").await, RemoteErrorKind::RemoteRejected);
        assert_eq!(remote_kind(&dispatcher, "Blank").await, RemoteErrorKind::EmptyReply);
        assert_eq!(remote_kind(&dispatcher, "Odd").await, RemoteErrorKind::MalformedReply);
        assert_eq!(remote_kind(&dispatcher, "Nobody").await, RemoteErrorKind::TransportFailure);
    }

    #[tokio::test]
    async fn test_transport_failure_marks_both_steps_failed() {
        let recorder = StepRecorder::in_memory(Duration::from_secs(60));
        let transport = transport();
        transport.set_offline(true);
        let dispatcher = dispatcher(transport, recorder.clone());
        let request = CorrelatedRequest::new(json!("order apples"));

        let err = dispatcher.send_request(&"Farm".into(), &request).await.unwrap_err();
        assert!(matches!(err, Error::Remote(RemoteError { kind: RemoteErrorKind::TransportFailure, .. })));

        let trace = recorder.get_trace(&request.request_id).await;
        assert_eq!(trace.steps.len(), 2);
        assert!(trace.steps.iter().all(|s| s.status() == StepStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_recipient_times_out() {
        let recorder = StepRecorder::in_memory(Duration::from_secs(60));
        let dispatcher = dispatcher(transport(), recorder);
        let err = dispatcher.send(&"Mute".into(), json!("anyone?")).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_caller_errors_are_rejected_before_sending() {
        let recorder = StepRecorder::in_memory(Duration::from_secs(60));
        let dispatcher = dispatcher(transport(), recorder.clone());
        let request = CorrelatedRequest::with_id(RequestId::new(), Value::Null);

        let err = dispatcher.send_request(&"Farm".into(), &request).await.unwrap_err();
        assert!(err.is_caller_error());
        assert!(recorder.get_trace(&request.request_id).await.steps.is_empty());

        let err = dispatcher.send(&"".into(), json!("x")).await.unwrap_err();
        assert!(err.is_caller_error());
    }

    #[tokio::test]
    async fn test_trace_store_failure_does_not_change_reply() {
        let recorder = StepRecorder::new(Arc::new(UnreachableStore), Duration::from_secs(60));
        let dispatcher = dispatcher(transport(), recorder);
        let reply = dispatcher.send(&"Farm".into(), json!("order apples")).await.unwrap();
        assert_eq!(reply, "10 crates of apples");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_trace_store_does_not_delay_reply() {
        let transport = InMemoryTransport::new().with_participant(
            "Farm",
            Scripted::new().on_request(Outbound::text("10 crates of apples").after(Duration::from_millis(300))),
        );
        let healthy = dispatcher(transport.clone(), StepRecorder::in_memory(Duration::from_secs(60)));
        let stalled = dispatcher(
            transport,
            StepRecorder::new(Arc::new(StalledStore::new()), Duration::from_secs(60))
                .with_store_timeout(Duration::from_millis(50)),
        );

        let started = tokio::time::Instant::now();
        let expected = healthy.send(&"Farm".into(), json!("order apples")).await.unwrap();
        let baseline = started.elapsed();

        let started = tokio::time::Instant::now();
        let reply = stalled.send(&"Farm".into(), json!("order apples")).await.unwrap();
        assert_eq!(reply, expected);
        // two bounded trace writes at most
        assert!(started.elapsed() <= baseline + Duration::from_millis(100));
    }
}
