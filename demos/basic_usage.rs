// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic trending-engine usage example.
//!
//! Demonstrates:
//! 1. Starting the engine (Redis when `REDIS_URL` is set, in-memory otherwise)
//! 2. Recording likes, comments and deduplicated views
//! 3. Reading the trending list
//! 4. Flushing view counts to SQLite
//! 5. Health check and captured metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! REDIS_URL=redis://localhost:6379 RUST_LOG=trending_engine=debug cargo run --example basic_usage
//! ```

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tracing_subscriber::EnvFilter;
use trending_engine::{EngineState, ScoreEvent, TrendingConfig, TrendingEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           trending-engine: Basic Usage Example                ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    let config = TrendingConfig {
        redis_url: std::env::var("REDIS_URL").ok(),
        redis_prefix: Some("demo:".into()),
        sql_url: Some("sqlite::memory:".into()),
        view_flush_interval_secs: 1,
        ..Default::default()
    };

    let mut engine = TrendingEngine::new(config)?;
    println!("🚀 Starting engine...");
    engine.start().await?;
    assert_eq!(engine.state(), EngineState::Running);
    println!("   ✅ Running");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Record activity
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Recording activity...");
    let activity = [
        (101, ScoreEvent::Like),
        (101, ScoreEvent::Comment),
        (102, ScoreEvent::Like),
        (102, ScoreEvent::Like),
        (103, ScoreEvent::Comment),
        (104, ScoreEvent::Like),
        (104, ScoreEvent::Unlike),
    ];
    for (item, event) in activity {
        let score = engine.record(item, event).await?;
        println!("   └─ {item} {event} → {score}");
    }

    for viewer in ["ip:10.0.0.1", "ip:10.0.0.2", "ip:10.0.0.1"] {
        let counted = engine.record_view(103, viewer).await?;
        println!("   └─ view 103 by {viewer} (counted: {counted})");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Trending
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔥 Trending:");
    for (rank, entry) in engine.top_n_with_scores(5).await?.iter().enumerate() {
        println!("   {}. item {} ({})", rank + 1, entry.item_id, entry.score);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Flush views, health
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n💾 Flushing view counts...");
    println!("   └─ {:?}", engine.flush_views().await?);

    println!("\n🩺 Health:");
    println!("{}", serde_json::to_string_pretty(&engine.health().await)?);

    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   ✅ State: {}", engine.state());

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {line}");
    }
}
