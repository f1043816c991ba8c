//! Broadcast example: ask three shippers for a quote and fold the answers

use switchboard::prelude::*;
use switchboard::{init_tracing, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogFormat::Pretty);

    println!("=== Switchboard Broadcast Example ===\n");

    // One quick shipper, one that refuses, one that never answers
    let transport = InMemoryTransport::new()
        .with_participant(
            "ShipperA",
            Scripted::new().on_request(
                Outbound::text("Can ship 10 crates on Friday for 40 EUR")
                    .after(Duration::from_millis(100)),
            ),
        )
        .with_participant(
            "ShipperB",
            Scripted::new().on_request(
                Outbound::rejected("No trucks available this week").after(Duration::from_millis(200)),
            ),
        )
        .with_participant("ShipperC", Scripted::silent());

    let switchboard = Switchboard::builder()
        .transport(Arc::new(transport))
        .config(SwitchboardConfig::from_env()?)
        .build()?;
    println!("✓ Switchboard ready\n");

    let recipients: Vec<RecipientId> = vec!["ShipperA".into(), "ShipperB".into(), "ShipperC".into()];
    let payload = json!("Who can ship 10 crates of apples by Friday?");

    println!("📝 Batch broadcast");
    let outcome = switchboard
        .aggregator()
        .aggregate(&recipients, payload.clone(), Duration::from_secs(2))
        .await?;
    println!("{}", outcome);

    println!("🧭 Route");
    for entry in switchboard.trace(&outcome.request_id).await.route() {
        println!("  {}", entry);
    }

    println!("\n📡 Streaming broadcast");
    let mut stream = switchboard
        .aggregator()
        .aggregate_stream(&recipients, payload, Duration::from_secs(2))?;
    while let Some(event) = stream.next().await {
        match event {
            BroadcastEvent::Delivered { sender, payload } => println!("  ✅ {}: {}", sender, payload),
            BroadcastEvent::Failed { sender, error } => println!("  ❌ {}: {}", sender, error),
            BroadcastEvent::MissingSummary { recipients, .. } => {
                for recipient in recipients {
                    println!("  ⏳ {}: no response — may be unavailable", recipient);
                }
            }
        }
    }

    Ok(())
}
