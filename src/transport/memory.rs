//! In-process transport hosting participants as async handlers
//!
//! Useful for tests, demos and single-process deployments. Every message a
//! participant emits is surfaced on the channel it arrived through, tagged
//! by sender, and routed onward to the participants it was forwarded to.

use crate::error::{Error, Result};
use crate::transport::{Channel, Transport};
use crate::types::{CorrelatedReply, CorrelatedRequest, RecipientId, ReplyBody, RequestId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Message delivered to a participant
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Request this message belongs to
    pub request_id: RequestId,
    /// Forwarding participant; `None` when sent by the coordinator
    pub from: Option<RecipientId>,
    /// Message body
    pub body: ReplyBody,
}

/// Message emitted by a participant in response to an [`Inbound`]
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Body surfaced on the channel
    pub body: ReplyBody,
    /// Participants that receive this message next
    pub forward_to: Vec<RecipientId>,
    /// Delay between receiving the inbound message and emitting this one
    pub delay: Duration,
}

impl Outbound {
    /// Reply with a raw body
    pub fn reply(body: ReplyBody) -> Self {
        Self {
            body,
            forward_to: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    /// Reply with plain text
    pub fn text(text: impl Into<String>) -> Self {
        Self::reply(ReplyBody::text(text))
    }

    /// Reply with a remote failure
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::reply(ReplyBody::rejected(reason))
    }

    /// Forward this message to other participants
    pub fn forward_to<I, R>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<RecipientId>,
    {
        self.forward_to = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Emit after a delay
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A participant hosted by [`InMemoryTransport`]
#[async_trait]
pub trait Participant: Send + Sync {
    /// Handle one inbound message; an empty vector means "stay silent"
    async fn handle(&self, inbound: &Inbound) -> Vec<Outbound>;
}

#[derive(Debug, Clone)]
enum Trigger {
    Coordinator,
    From(RecipientId),
    Any,
}

impl Trigger {
    fn matches(&self, from: Option<&RecipientId>) -> bool {
        match (self, from) {
            (Self::Any, _) => true,
            (Self::Coordinator, None) => true,
            (Self::From(expected), Some(actual)) => expected == actual,
            _ => false,
        }
    }
}

/// Rule-driven participant
///
/// Every rule whose trigger matches the inbound message contributes its
/// outbound message, so registering two replies for the coordinator makes
/// the participant answer twice.
#[derive(Debug, Clone, Default)]
pub struct Scripted {
    rules: Vec<(Trigger, Outbound)>,
}

impl Scripted {
    /// Participant with no rules (never answers)
    pub fn new() -> Self {
        Self::default()
    }

    /// Participant that never answers
    pub fn silent() -> Self {
        Self::new()
    }

    /// Answer messages sent by the coordinator
    pub fn on_request(mut self, outbound: Outbound) -> Self {
        self.rules.push((Trigger::Coordinator, outbound));
        self
    }

    /// Answer messages forwarded by `sender`
    pub fn on_message_from(mut self, sender: impl Into<RecipientId>, outbound: Outbound) -> Self {
        self.rules.push((Trigger::From(sender.into()), outbound));
        self
    }

    /// Answer every message
    pub fn on_any(mut self, outbound: Outbound) -> Self {
        self.rules.push((Trigger::Any, outbound));
        self
    }
}

#[async_trait]
impl Participant for Scripted {
    async fn handle(&self, inbound: &Inbound) -> Vec<Outbound> {
        self.rules
            .iter()
            .filter(|(trigger, _)| trigger.matches(inbound.from.as_ref()))
            .map(|(_, outbound)| outbound.clone())
            .collect()
    }
}

type Registry = Arc<RwLock<HashMap<RecipientId, Arc<dyn Participant>>>>;

/// In-process [`Transport`]
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    participants: Registry,
    open_channels: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
}

impl InMemoryTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant (builder style)
    pub fn with_participant(
        self,
        id: impl Into<RecipientId>,
        participant: impl Participant + 'static,
    ) -> Self {
        self.register(id, participant);
        self
    }

    /// Register or replace a participant
    pub fn register(&self, id: impl Into<RecipientId>, participant: impl Participant + 'static) {
        self.participants.write().insert(id.into(), Arc::new(participant));
    }

    /// Remove a participant
    pub fn unregister(&self, id: &RecipientId) -> bool {
        self.participants.write().remove(id).is_some()
    }

    /// Simulate an unreachable network: every send and channel open fails
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of channels currently subscribed
    pub fn open_channel_count(&self) -> usize {
        self.open_channels.load(Ordering::SeqCst)
    }

    fn lookup(&self, id: &RecipientId) -> Option<Arc<dyn Participant>> {
        self.participants.read().get(id).cloned()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::transport("transport offline"))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("participants", &self.participants.read().len())
            .field("open_channels", &self.open_channel_count())
            .field("offline", &self.offline.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, recipient: &RecipientId, request: &CorrelatedRequest) -> Result<ReplyBody> {
        self.ensure_online()?;
        let participant = self
            .lookup(recipient)
            .ok_or_else(|| Error::transport(format!("unknown recipient: {}", recipient)))?;

        let inbound = Inbound {
            request_id: request.request_id.clone(),
            from: None,
            body: ReplyBody::Payload(request.payload.clone()),
        };

        let mut outbounds = participant.handle(&inbound).await;
        outbounds.sort_by_key(|o| o.delay);
        match outbounds.into_iter().next() {
            Some(outbound) => {
                tokio::time::sleep(outbound.delay).await;
                Ok(outbound.body)
            }
            // A silent participant behaves like one that never answers
            None => std::future::pending().await,
        }
    }

    async fn open_channel(
        &self,
        topic: &str,
        recipients: &[RecipientId],
    ) -> Result<Box<dyn Channel>> {
        self.ensure_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.open_channels.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(topic, members = recipients.len(), "opened in-memory channel");

        Ok(Box::new(InMemoryChannel {
            topic: topic.to_string(),
            members: recipients.to_vec(),
            hub: Arc::new(Hub {
                participants: self.participants.clone(),
                replies: tx,
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
            rx,
            open_channels: self.open_channels.clone(),
        }))
    }

    fn transport_type(&self) -> &str {
        "in-memory"
    }
}

struct Hub {
    participants: Registry,
    replies: mpsc::UnboundedSender<CorrelatedReply>,
    tasks: Mutex<Vec<AbortHandle>>,
    closed: AtomicBool,
}

fn deliver(hub: Arc<Hub>, target: RecipientId, inbound: Inbound) {
    if hub.closed.load(Ordering::SeqCst) {
        return;
    }
    let Some(participant) = hub.participants.read().get(&target).cloned() else {
        tracing::debug!(recipient = %target, "no participant registered, message dropped");
        return;
    };

    let task_hub = hub.clone();
    let handle = tokio::spawn(async move {
        let received = tokio::time::Instant::now();
        let mut outbounds = participant.handle(&inbound).await;
        outbounds.sort_by_key(|o| o.delay);

        for outbound in outbounds {
            tokio::time::sleep_until(received + outbound.delay).await;
            if task_hub.closed.load(Ordering::SeqCst) {
                return;
            }

            let reply = CorrelatedReply::new(target.clone(), outbound.body.clone())
                .with_addressed_to(outbound.forward_to.clone());
            if task_hub.replies.send(reply).is_err() {
                return;
            }

            for next in outbound.forward_to {
                deliver(
                    task_hub.clone(),
                    next,
                    Inbound {
                        request_id: inbound.request_id.clone(),
                        from: Some(target.clone()),
                        body: outbound.body.clone(),
                    },
                );
            }
        }
    });
    hub.tasks.lock().push(handle.abort_handle());
}

/// Channel handed out by [`InMemoryTransport`]
pub struct InMemoryChannel {
    topic: String,
    members: Vec<RecipientId>,
    hub: Arc<Hub>,
    rx: mpsc::UnboundedReceiver<CorrelatedReply>,
    open_channels: Arc<AtomicUsize>,
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn publish(&mut self, request: &CorrelatedRequest) -> Result<()> {
        for member in &self.members {
            deliver(
                self.hub.clone(),
                member.clone(),
                Inbound {
                    request_id: request.request_id.clone(),
                    from: None,
                    body: ReplyBody::Payload(request.payload.clone()),
                },
            );
        }
        Ok(())
    }

    async fn next_reply(&mut self, budget: Duration) -> Result<Option<CorrelatedReply>> {
        match tokio::time::timeout(budget, self.rx.recv()).await {
            Ok(Some(reply)) => Ok(Some(reply)),
            Ok(None) => Err(Error::transport(format!("channel {} closed", self.topic))),
            Err(_) => Ok(None),
        }
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.hub.closed.store(true, Ordering::SeqCst);
        for task in self.hub.tasks.lock().drain(..) {
            task.abort();
        }
        self.open_channels.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(topic = %self.topic, "released in-memory channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_unicast_returns_first_reply() {
        let transport = InMemoryTransport::new().with_participant(
            "echo",
            Scripted::new().on_request(Outbound::text("pong").after(Duration::from_millis(10))),
        );

        let request = CorrelatedRequest::new(json!("ping"));
        let body = transport.send(&"echo".into(), &request).await.unwrap();
        assert_eq!(body, ReplyBody::text("pong"));
    }

    #[tokio::test]
    async fn test_unicast_unknown_recipient_fails() {
        let transport = InMemoryTransport::new();
        let request = CorrelatedRequest::new(json!("ping"));
        let err = transport.send(&"ghost".into(), &request).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_routes_forwarded_messages() {
        let transport = InMemoryTransport::new()
            .with_participant("a", Scripted::new().on_request(Outbound::text("to b").forward_to(["b"])))
            .with_participant("b", Scripted::new().on_message_from("a", Outbound::text("done")));

        let mut channel = transport
            .open_channel("t", &["a".into()])
            .await
            .unwrap();
        channel.publish(&CorrelatedRequest::new(json!("go"))).await.unwrap();

        let first = channel.next_reply(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(first.sender.as_str(), "a");
        assert_eq!(first.addressed_to, vec![RecipientId::new("b")]);

        let second = channel.next_reply(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(second.sender.as_str(), "b");
        assert_eq!(second.body.extract_text().as_deref(), Some("done"));

        let idle = channel.next_reply(Duration::from_millis(50)).await.unwrap();
        assert!(idle.is_none());
    }

    #[tokio::test]
    async fn test_dropping_channel_releases_subscription() {
        let transport = InMemoryTransport::new();
        let channel = transport.open_channel("t", &[]).await.unwrap();
        assert_eq!(transport.open_channel_count(), 1);
        drop(channel);
        assert_eq!(transport.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_transport_refuses_channels() {
        let transport = InMemoryTransport::new();
        transport.set_offline(true);
        assert!(transport.open_channel("t", &[]).await.is_err());
    }
}
