//! Workflow plans parsed from YAML
//!
//! A plan names one workflow and the payload it starts with:
//!
//! ```yaml
//! name: apple-delivery
//! payload: "Deliver 10 crates of apples"
//! workflow:
//!   pattern: relay
//!   seed_recipients: [Farm, Shipper, Accountant]
//!   terminal_marker: DELIVERED
//!   deadline_ms: 60000
//! ```
//!
//! Deadlines are optional and fall back to the [`SwitchboardConfig`]
//! defaults of the switchboard running the plan.
//!
//! [`SwitchboardConfig`]: crate::config::SwitchboardConfig

use crate::error::{Error, Result};
use crate::orchestrator::{AggregationOutcome, GroupRelayResult};
use crate::switchboard::Switchboard;
use crate::types::RecipientId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// One runnable workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPlan {
    /// Plan name, used in logs
    pub name: String,
    /// Opening payload
    pub payload: Value,
    /// Workflow to run
    pub workflow: Workflow,
}

/// Supported workflow patterns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum Workflow {
    /// Fan the payload out and collect replies
    Broadcast {
        recipients: Vec<RecipientId>,
        #[serde(default)]
        deadline_ms: Option<u64>,
    },
    /// Seed a relay and wait for the terminal marker
    Relay {
        seed_recipients: Vec<RecipientId>,
        terminal_marker: String,
        #[serde(default)]
        deadline_ms: Option<u64>,
    },
}

impl Workflow {
    /// Pattern name as written in YAML
    pub fn pattern(&self) -> &'static str {
        match self {
            Self::Broadcast { .. } => "broadcast",
            Self::Relay { .. } => "relay",
        }
    }
}

/// Result of running a [`WorkflowPlan`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", content = "outcome", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Broadcast(AggregationOutcome),
    Relay(GroupRelayResult),
}

impl WorkflowPlan {
    /// Load a plan from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let plan: Self = serde_yaml::from_str(yaml)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Load a plan from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("workflow plan needs a name"));
        }
        let deadline_ms = match &self.workflow {
            Workflow::Broadcast { deadline_ms, .. } | Workflow::Relay { deadline_ms, .. } => *deadline_ms,
        };
        if deadline_ms == Some(0) {
            return Err(Error::config(format!("{}: deadline_ms must be positive", self.name)));
        }
        Ok(())
    }

    /// Run the plan
    pub async fn run(&self, switchboard: &Switchboard) -> Result<WorkflowOutcome> {
        let config = switchboard.config();
        tracing::info!(plan = %self.name, pattern = self.workflow.pattern(), "running workflow plan");

        match &self.workflow {
            Workflow::Broadcast { recipients, deadline_ms } => {
                let deadline = deadline_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| config.broadcast_deadline());
                let outcome = switchboard
                    .aggregator()
                    .aggregate(recipients, self.payload.clone(), deadline)
                    .await?;
                Ok(WorkflowOutcome::Broadcast(outcome))
            }
            Workflow::Relay {
                seed_recipients,
                terminal_marker,
                deadline_ms,
            } => {
                let deadline = deadline_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| config.relay_deadline());
                let result = switchboard
                    .relay()
                    .relay(seed_recipients, self.payload.clone(), terminal_marker, deadline)
                    .await?;
                Ok(WorkflowOutcome::Relay(result))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemoryTransport, Outbound, Scripted};
    use std::sync::Arc;

    #[test]
    fn test_parse_broadcast_plan() {
        let yaml = r#"
name: "quote-round"
payload: "Who can ship 10 crates by Friday?"
workflow:
  pattern: broadcast
  recipients: [ShipperA, ShipperB, ShipperC]
  deadline_ms: 2000
"#;

        let plan = WorkflowPlan::from_yaml(yaml).unwrap();
        assert_eq!(plan.name, "quote-round");
        assert_eq!(plan.workflow.pattern(), "broadcast");
        match plan.workflow {
            Workflow::Broadcast { recipients, deadline_ms } => {
                assert_eq!(recipients.len(), 3);
                assert_eq!(deadline_ms, Some(2000));
            }
            other => panic!("unexpected workflow {:?}", other),
        }
    }

    #[test]
    fn test_parse_relay_plan_with_structured_payload() {
        let yaml = r#"
name: "apple-delivery"
payload:
  item: apples
  crates: 10
workflow:
  pattern: relay
  seed_recipients: [Farm, Shipper, Accountant]
  terminal_marker: "DELIVERED"
"#;

        let plan = WorkflowPlan::from_yaml(yaml).unwrap();
        assert_eq!(plan.payload["crates"], 10);
        match plan.workflow {
            Workflow::Relay {
                seed_recipients,
                terminal_marker,
                deadline_ms,
            } => {
                assert_eq!(seed_recipients[0].as_str(), "Farm");
                assert_eq!(terminal_marker, "DELIVERED");
                assert!(deadline_ms.is_none());
            }
            other => panic!("unexpected workflow {:?}", other),
        }
    }

    #[test]
    fn test_invalid_plans_are_rejected() {
        let unknown = r#"
name: "x"
payload: "y"
workflow:
  pattern: debate
"#;
        assert!(matches!(WorkflowPlan::from_yaml(unknown), Err(Error::Yaml(_))));

        let zero_deadline = r#"
name: "x"
payload: "y"
workflow:
  pattern: broadcast
  recipients: [a]
  deadline_ms: 0
"#;
        assert!(matches!(WorkflowPlan::from_yaml(zero_deadline), Err(Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_broadcast_plan() {
        let transport = InMemoryTransport::new()
            .with_participant("ShipperA", Scripted::new().on_request(Outbound::text("Friday, 40 EUR")))
            .with_participant("ShipperB", Scripted::silent());
        let switchboard = Switchboard::builder()
            .transport(Arc::new(transport))
            .build()
            .unwrap();

        let plan = WorkflowPlan::from_yaml(
            r#"
name: "quote-round"
payload: "Who can ship?"
workflow:
  pattern: broadcast
  recipients: [ShipperA, ShipperB]
  deadline_ms: 500
"#,
        )
        .unwrap();

        match plan.run(&switchboard).await.unwrap() {
            WorkflowOutcome::Broadcast(outcome) => {
                assert_eq!(outcome.succeeded.len(), 1);
                assert!(outcome.missing.contains(&RecipientId::new("ShipperB")));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
