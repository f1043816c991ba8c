//! # switchboard
//!
//! Fan-out, fan-in and relay orchestration across independently operated
//! remote participants, with step-level request tracing.
//!
//! ## Features
//!
//! - **Dispatch**: one request to one recipient, classified into text or a
//!   typed [`RemoteError`]
//! - **Broadcast**: one request to many recipients, partitioned into
//!   succeeded, failed and missing within a hard deadline
//! - **Streaming broadcast**: the same fan-out yielding replies as they arrive
//! - **Group relay**: seed a chain of participants and watch their shared
//!   channel for a terminal marker
//! - **Request traces**: who took part in each request, for how long, and
//!   whether their part succeeded, kept in a TTL-bounded store
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use switchboard::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = InMemoryTransport::new()
//!         .with_participant("Farm", Scripted::new().on_request(Outbound::text("10 crates")));
//!     let switchboard = Switchboard::builder()
//!         .transport(Arc::new(transport))
//!         .build()?;
//!
//!     let outcome = switchboard
//!         .aggregator()
//!         .aggregate(&["Farm".into()], json!("apples?"), Duration::from_secs(2))
//!         .await?;
//!     println!("{}", outcome);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod orchestrator;
pub mod switchboard;
pub mod trace;
pub mod tracing_ext;
pub mod transport;
pub mod types;

// Re-exports
pub use config::SwitchboardConfig;
pub use dispatcher::Dispatcher;
pub use error::{Error, RemoteError, RemoteErrorKind, Result};
pub use orchestrator::{
    AggregationOutcome, Aggregator, BroadcastEvent, BroadcastStream, GroupRelay, GroupRelayResult,
    Workflow, WorkflowOutcome, WorkflowPlan,
};
pub use switchboard::{Switchboard, SwitchboardBuilder};
#[cfg(feature = "storage")]
pub use trace::SledTraceStore;
pub use trace::{MemoryTraceStore, RequestTrace, RouteEntry, Step, StepRecorder, StepStatus, TraceStore};
pub use tracing_ext::{init_tracing, LogFormat};
pub use transport::{Channel, InMemoryTransport, Inbound, Outbound, Participant, Scripted, Transport};
pub use types::{
    CorrelatedReply, CorrelatedRequest, RecipientId, ReplyBody, ReplyOutcome, RequestId, StepId,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::SwitchboardConfig;
    pub use crate::error::{Error, RemoteError, RemoteErrorKind, Result};
    pub use crate::orchestrator::{
        AggregationOutcome, Aggregator, BroadcastEvent, GroupRelay, GroupRelayResult, WorkflowPlan,
    };
    pub use crate::switchboard::Switchboard;
    pub use crate::trace::{RequestTrace, StepRecorder, StepStatus};
    pub use crate::transport::{InMemoryTransport, Outbound, Participant, Scripted, Transport};
    pub use crate::types::{RecipientId, ReplyBody, RequestId};
    pub use futures::StreamExt;
    pub use serde_json::json;
    pub use std::sync::Arc;
    pub use std::time::Duration;
}
