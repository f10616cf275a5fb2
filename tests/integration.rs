//! Integration Tests for Trending Engine
//!
//! Tests against a real Redis. Uses testcontainers, so Docker is the only
//! requirement; every test is `#[ignore]`d by default.
//!
//! # Running Tests
//! ```bash
//! # Run all integration tests (requires Docker)
//! cargo test --test integration -- --ignored
//!
//! # Run only happy-path tests
//! cargo test --test integration happy -- --ignored
//! ```
//!
//! # Test Organization
//! - `happy_*` - Normal operation: increments, ranking, decay script, dedup
//! - `failure_*` - Malformed data and lost backends

use std::sync::Arc;
use std::time::Duration;

use trending_engine::{
    CircuitState, EngineState, RedisScoreStore, RedisViewDedup, ScoreEvent, ScoreStore, SqlViewStore,
    TrendingConfig, TrendingEngine, ViewDedup,
};

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

// =============================================================================
// Container Helpers
// =============================================================================

/// Create a Redis container with health check
fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

fn redis_url(container: &Container<'_, GenericImage>) -> String {
    format!("redis://127.0.0.1:{}", container.get_host_port_ipv4(6379))
}

async fn store(url: &str, prefix: &str) -> RedisScoreStore {
    RedisScoreStore::with_prefix(url, "realtime:score", Some(prefix))
        .await
        .expect("Failed to connect to Redis")
}

// =============================================================================
// Happy Path
// =============================================================================

#[tokio::test]
#[ignore]
async fn happy_increment_and_rank() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let store = store(&redis_url(&redis), "rank:").await;

    store.increment(1, 10.0).await.unwrap();
    store.increment(2, 5.0).await.unwrap();
    store.increment(3, 2.0).await.unwrap();
    assert_eq!(store.increment(3, -5.0).await.unwrap(), -3.0);

    assert_eq!(store.top_n(0, 5).await.unwrap(), vec![1, 2, 3]);
    assert_eq!(store.top_n(1, 1).await.unwrap(), vec![2]);
    assert_eq!(store.count().await.unwrap(), 3);
}

#[tokio::test]
#[ignore]
async fn happy_ties_break_by_ascending_id() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let store = store(&redis_url(&redis), "ties:").await;

    for id in [30, 4, 200, 17] {
        store.increment(id, 7.0).await.unwrap();
    }
    store.increment(9, 8.0).await.unwrap();
    store.increment(5, 1.0).await.unwrap();

    assert_eq!(store.top_n(0, 10).await.unwrap(), vec![9, 4, 17, 30, 200, 5]);
    // Page edges cut through the tie
    assert_eq!(store.top_n(0, 3).await.unwrap(), vec![9, 4, 17]);
    assert_eq!(store.top_n(3, 2).await.unwrap(), vec![30, 200]);
    assert_eq!(store.top_n(5, 2).await.unwrap(), vec![5]);
    assert!(store.top_n(6, 2).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn happy_concurrent_increments_are_atomic() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let store = Arc::new(store(&redis_url(&redis), "atomic:").await);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                store.increment(42, 2.0).await.unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let top = store.top_n_with_scores(0, 1).await.unwrap();
    assert_eq!(top[0].item_id, 42);
    assert_eq!(top[0].score, 800.0);
}

#[tokio::test]
#[ignore]
async fn happy_decay_script_multiplies_and_removes() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let store = store(&redis_url(&redis), "decay:").await;

    store.increment(1, 10.0).await.unwrap();
    store.increment(2, 5.0).await.unwrap();
    store.increment(3, 2.0).await.unwrap();

    let outcome = store.apply_decay(0.97, 1.0).await.unwrap();
    assert_eq!((outcome.retained, outcome.removed), (3, 0));

    store.increment(4, 1.03).await.unwrap();
    let outcome = store.apply_decay(0.97, 1.0).await.unwrap();
    assert_eq!((outcome.retained, outcome.removed), (3, 1));

    let top = store.top_n_with_scores(0, 10).await.unwrap();
    let ids: Vec<i64> = top.iter().map(|e| e.item_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!((top[0].score - 10.0 * 0.97 * 0.97).abs() < 1e-9);
}

#[tokio::test]
#[ignore]
async fn happy_remove_many() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let store = store(&redis_url(&redis), "remove:").await;

    for id in 1..=5 {
        store.increment(id, id as f64).await.unwrap();
    }
    store.remove_many(&[2, 4, 99]).await.unwrap();
    store.remove(5).await.unwrap();
    store.remove(5).await.unwrap();

    assert_eq!(store.top_n(0, 10).await.unwrap(), vec![3, 1]);
}

#[tokio::test]
#[ignore]
async fn happy_view_dedup_set_nx() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let store = store(&redis_url(&redis), "dedup:").await;
    let dedup = RedisViewDedup::new(store.connection(), Some("dedup:"));

    let ttl = Duration::from_secs(2);
    assert!(dedup.mark_if_absent("view:42:ip:1.2.3.4", ttl).await.unwrap());
    assert!(!dedup.mark_if_absent("view:42:ip:1.2.3.4", ttl).await.unwrap());

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(dedup.mark_if_absent("view:42:ip:1.2.3.4", ttl).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn happy_engine_lifecycle_with_redis_and_sqlite() {
    let docker = Cli::default();
    let redis = redis_container(&docker);

    let config = TrendingConfig {
        redis_url: Some(redis_url(&redis)),
        redis_prefix: Some("engine:".into()),
        sql_url: Some("sqlite::memory:".into()),
        ..TrendingConfig::default()
    };
    let mut engine = TrendingEngine::new(config).unwrap();
    engine.start().await.expect("Failed to start");
    assert_eq!(engine.state(), EngineState::Running);

    engine.record(1, ScoreEvent::Like).await.unwrap();
    engine.record(2, ScoreEvent::Comment).await.unwrap();
    assert!(engine.record_view(2, "ip:10.0.0.1").await.unwrap());
    assert!(!engine.record_view(2, "ip:10.0.0.1").await.unwrap());

    // Comment 3 + two views 2+2
    assert_eq!(engine.top_n_with_scores(5).await.unwrap()[0].score, 7.0);
    assert_eq!(engine.trending().await.unwrap(), vec![2, 1]);

    let health = engine.health().await;
    assert!(health.healthy);
    assert_eq!(health.primary_backend, "redis");
    assert_eq!(health.redis_connected, Some(true));
    assert_eq!(health.sql_connected, Some(true));

    engine.flush_views().await.unwrap();
    engine.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn happy_cold_start_seeds_fallback_from_sql() {
    let docker = Cli::default();
    let redis = redis_container(&docker);

    let sql = Arc::new(SqlViewStore::new("sqlite::memory:").await.unwrap());
    let counts = [(7, 90u64), (8, 40), (9, 10)].into_iter().collect();
    trending_engine::ViewCountSink::flush(sql.as_ref(), &counts).await.unwrap();

    let config = TrendingConfig {
        redis_url: Some(redis_url(&redis)),
        redis_prefix: Some("seed:".into()),
        ..TrendingConfig::default()
    };
    let mut engine = TrendingEngine::new(config).unwrap().with_seed(sql);
    engine.start().await.unwrap();

    assert_eq!(engine.fallback().get_top_n(0, 5), vec![7, 8, 9]);
    engine.shutdown().await;
}

// =============================================================================
// Failure Scenarios
// =============================================================================

#[tokio::test]
#[ignore]
async fn failure_malformed_members_are_skipped() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let store = store(&redis_url(&redis), "bad:").await;

    store.increment(1, 5.0).await.unwrap();
    let mut conn = store.connection();
    let _: i64 = redis::cmd("ZADD")
        .arg(store.key())
        .arg(9.0)
        .arg("not-a-number")
        .query_async(&mut conn)
        .await
        .unwrap();

    assert_eq!(store.top_n(0, 10).await.unwrap(), vec![1]);
}

#[tokio::test]
#[ignore]
async fn failure_redis_death_falls_back() {
    let docker = Cli::default();
    let redis = redis_container(&docker);

    let config = TrendingConfig {
        redis_url: Some(redis_url(&redis)),
        redis_prefix: Some("death:".into()),
        call_timeout_ms: 200,
        ..TrendingConfig::default()
    };
    let mut engine = TrendingEngine::new(config).unwrap();
    engine.start().await.unwrap();
    engine.record(5, ScoreEvent::Like).await.unwrap();
    engine.run_warm_up().await.unwrap();

    redis.stop();

    for _ in 0..10 {
        engine.record(5, ScoreEvent::Comment).await.expect("no errors during outage");
    }
    assert_eq!(engine.circuit_state(), CircuitState::Open);
    assert_eq!(engine.trending().await.unwrap(), vec![5]);

    engine.shutdown().await;
}
