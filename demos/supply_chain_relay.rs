//! Relay example: farm, shipper and accountant hand an order along until
//! the shipper reports delivery

use switchboard::prelude::*;
use switchboard::{init_tracing, LogFormat, WorkflowOutcome};

const PLAN: &str = r#"
name: "apple-delivery"
payload: "Deliver 10 crates of apples to the market"
workflow:
  pattern: relay
  seed_recipients: [Farm, Shipper, Accountant]
  terminal_marker: "DELIVERED"
  deadline_ms: 60000
"#;

fn supply_chain() -> InMemoryTransport {
    let step = Duration::from_millis(400);

    InMemoryTransport::new()
        .with_participant(
            "Farm",
            Scripted::new().on_request(
                Outbound::text("10 crates packed, ready for pickup")
                    .forward_to(["Shipper"])
                    .after(Duration::from_millis(300)),
            ),
        )
        .with_participant(
            "Shipper",
            Scripted::new()
                .on_message_from(
                    "Farm",
                    Outbound::text("Picked up, invoice for 40 EUR")
                        .forward_to(["Accountant"])
                        .after(step),
                )
                .on_message_from(
                    "Accountant",
                    Outbound::text("DELIVERED to the market")
                        .forward_to(["Supervisor"])
                        .after(step),
                ),
        )
        .with_participant(
            "Accountant",
            Scripted::new().on_message_from(
                "Shipper",
                Outbound::text("PAYMENT_COMPLETE").forward_to(["Shipper"]).after(step),
            ),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogFormat::Pretty);

    println!("=== Switchboard Supply Chain Relay ===\n");

    let switchboard = Switchboard::builder()
        .transport(Arc::new(supply_chain()))
        .build()?;
    let plan = WorkflowPlan::from_yaml(PLAN)?;
    println!("✓ Loaded plan '{}'\n", plan.name);

    let WorkflowOutcome::Relay(result) = plan.run(&switchboard).await? else {
        anyhow::bail!("plan '{}' is not a relay", plan.name);
    };

    for (i, hop) in result.observed_hops.iter().enumerate() {
        let to: Vec<&str> = hop.addressed_to.iter().map(RecipientId::as_str).collect();
        println!(
            "  {}. {} → {}: {}",
            i + 1,
            hop.sender,
            if to.is_empty() { "coordinator".to_string() } else { to.join(", ") },
            hop.body.render()
        );
    }

    if result.timed_out {
        println!("\n⏳ Relay timed out after {:?}", result.elapsed);
    } else {
        println!(
            "\n✅ Completed in {:?}: {}",
            result.elapsed,
            result.terminal_payload.as_deref().unwrap_or_default()
        );
    }

    println!("\n🧭 Route");
    for entry in switchboard.trace(&result.request_id).await.route() {
        println!("  {}", entry);
    }

    Ok(())
}
