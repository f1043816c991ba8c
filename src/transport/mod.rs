//! Transport port consumed by the orchestration engine
//!
//! The engine never moves bytes itself. A [`Transport`] delivers unicast
//! requests and opens shared [`Channel`]s; what sits behind it (HTTP, a
//! message broker, an in-process hub) is the implementor's business.

pub mod memory;

use crate::error::Result;
use crate::types::{CorrelatedReply, CorrelatedRequest, RecipientId, ReplyBody};
use async_trait::async_trait;
use std::time::Duration;

pub use memory::{InMemoryTransport, Inbound, Outbound, Participant, Scripted};

/// Capability to reach remote participants
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request to one recipient and wait for its single reply
    async fn send(&self, recipient: &RecipientId, request: &CorrelatedRequest) -> Result<ReplyBody>;

    /// Prepare a multicast channel visible to `recipients`
    async fn open_channel(
        &self,
        topic: &str,
        recipients: &[RecipientId],
    ) -> Result<Box<dyn Channel>>;

    /// Transport type for debugging/logging
    fn transport_type(&self) -> &str;
}

/// An open multicast subscription
///
/// Dropping the channel releases the subscription.
#[async_trait]
pub trait Channel: Send {
    /// Publish one request to every recipient the channel was opened for
    async fn publish(&mut self, request: &CorrelatedRequest) -> Result<()>;

    /// Wait at most `budget` for the next inbound message.
    ///
    /// Returns `Ok(None)` when the budget elapses without a message.
    async fn next_reply(&mut self, budget: Duration) -> Result<Option<CorrelatedReply>>;

    /// Topic this channel was opened on
    fn topic(&self) -> &str;
}
