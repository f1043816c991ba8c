//! Switchboard facade - one transport, one trace store, one configuration

use crate::config::SwitchboardConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::orchestrator::{Aggregator, GroupRelay};
use crate::trace::{MemoryTraceStore, RequestTrace, StepRecorder, TraceStore};
use crate::transport::Transport;
use crate::types::RequestId;
use std::sync::Arc;

/// Hands out orchestrators that share a transport and a trace store.
///
/// ```rust,ignore
/// let switchboard = Switchboard::builder()
///     .transport(Arc::new(transport))
///     .config(SwitchboardConfig::from_env()?)
///     .build()?;
///
/// let reply = switchboard.dispatcher().send(&"Farm".into(), json!("apples?")).await?;
/// ```
#[derive(Clone)]
pub struct Switchboard {
    transport: Arc<dyn Transport>,
    recorder: StepRecorder,
    config: SwitchboardConfig,
}

impl Switchboard {
    /// Create a new switchboard builder
    pub fn builder() -> SwitchboardBuilder {
        SwitchboardBuilder::new()
    }

    /// Unicast dispatcher
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.transport.clone(),
            self.recorder.clone(),
            self.config.coordinator.clone(),
            self.config.dispatch_timeout(),
        )
    }

    /// Broadcast aggregator
    pub fn aggregator(&self) -> Aggregator {
        Aggregator::new(self.transport.clone(), self.recorder.clone())
            .with_coordinator(self.config.coordinator.clone())
            .with_topic_prefix(self.config.topic_prefix.clone())
    }

    /// Relay observer
    pub fn relay(&self) -> GroupRelay {
        GroupRelay::new(self.transport.clone(), self.recorder.clone())
            .with_coordinator(self.config.coordinator.clone())
            .with_topic_prefix(self.config.topic_prefix.clone())
    }

    /// Shared step recorder
    pub fn recorder(&self) -> &StepRecorder {
        &self.recorder
    }

    /// Steps recorded for a request
    pub async fn trace(&self, request_id: &RequestId) -> RequestTrace {
        self.recorder.get_trace(request_id).await
    }

    /// Active configuration
    pub fn config(&self) -> &SwitchboardConfig {
        &self.config
    }
}

impl std::fmt::Debug for Switchboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switchboard")
            .field("transport", &self.transport.transport_type())
            .field("recorder", &self.recorder)
            .field("config", &self.config)
            .finish()
    }
}

/// Builder for [`Switchboard`]
#[derive(Default)]
pub struct SwitchboardBuilder {
    transport: Option<Arc<dyn Transport>>,
    trace_store: Option<Arc<dyn TraceStore>>,
    config: Option<SwitchboardConfig>,
}

impl SwitchboardBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transport (required)
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the trace store (defaults to an in-memory store)
    pub fn trace_store(mut self, store: Arc<dyn TraceStore>) -> Self {
        self.trace_store = Some(store);
        self
    }

    /// Set the configuration (defaults to [`SwitchboardConfig::default`])
    pub fn config(mut self, config: SwitchboardConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the switchboard
    pub fn build(self) -> Result<Switchboard> {
        let transport = self
            .transport
            .ok_or_else(|| Error::config("Switchboard transport is required"))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let store = self
            .trace_store
            .unwrap_or_else(|| Arc::new(MemoryTraceStore::new()));
        tracing::debug!(
            transport = transport.transport_type(),
            store = store.store_type(),
            coordinator = %config.coordinator,
            "switchboard ready"
        );

        Ok(Switchboard {
            transport,
            recorder: StepRecorder::new(store, config.trace_ttl())
                .with_store_timeout(config.trace_store_timeout()),
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemoryTransport, Outbound, Scripted};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_builder_requires_transport() {
        let err = Switchboard::builder().build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let config = SwitchboardConfig::default().with_coordinator("");
        let result = Switchboard::builder()
            .transport(Arc::new(InMemoryTransport::new()))
            .config(config)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_orchestrators_share_recorder_and_label() {
        let transport = InMemoryTransport::new()
            .with_participant("Farm", Scripted::new().on_request(Outbound::text("apples ready")));
        let switchboard = Switchboard::builder()
            .transport(Arc::new(transport))
            .config(
                SwitchboardConfig::default()
                    .with_coordinator("host")
                    .with_trace_ttl(Duration::from_secs(600)),
            )
            .build()
            .unwrap();
        assert_eq!(switchboard.recorder().ttl(), Duration::from_secs(600));

        let outcome = switchboard
            .aggregator()
            .aggregate(&["Farm".into()], json!("ready?"), Duration::from_secs(1))
            .await
            .unwrap();

        let trace = switchboard.trace(&outcome.request_id).await;
        assert_eq!(trace.participants(), vec!["host", "Farm"]);
    }
}
