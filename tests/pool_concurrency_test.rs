//! Pool behaviour under concurrent load.

use async_trait::async_trait;
use mssql_flow_bridge::config::{PoolConfig, PoolSettings};
use mssql_flow_bridge::db::{Connection, Connector, PoolManager, QueryExecutor};
use mssql_flow_bridge::error::{DriverError, ErrorCategory, codes};
use mssql_flow_bridge::models::{EventSink, ExecutionRequest, ExecutionResult, RawResult};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

/// Tracks how many queries run at the same time.
#[derive(Default)]
struct Gauge {
    opened: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct GaugeConnector {
    gauge: Arc<Gauge>,
}

struct GaugeConnection {
    gauge: Arc<Gauge>,
}

#[async_trait]
impl Connector for GaugeConnector {
    async fn connect(&self, _config: &PoolConfig) -> Result<Box<dyn Connection>, DriverError> {
        self.gauge.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(GaugeConnection {
            gauge: Arc::clone(&self.gauge),
        }))
    }
}

#[async_trait]
impl Connection for GaugeConnection {
    async fn query(&mut self, sql: &str) -> Result<RawResult, DriverError> {
        let now = self.gauge.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);

        let jitter = rand::thread_rng().gen_range(1..8u64);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        self.gauge.in_flight.fetch_sub(1, Ordering::SeqCst);
        if sql.contains("missing_table") {
            return Err(DriverError::request(
                codes::EREQUEST,
                "Invalid object name 'missing_table'.",
            )
            .with_number(208));
        }
        let row = json!({"x": 1}).as_object().cloned().unwrap_or_default();
        Ok(RawResult::new(vec![vec![row]]))
    }
}

fn pool(max: u32, gauge: &Arc<Gauge>) -> Arc<PoolManager> {
    let config = PoolConfig::from_settings(PoolSettings {
        server: Some("db1".to_string()),
        database: Some("sales".to_string()),
        username: Some("sa".to_string()),
        pool: Some(max.to_string()),
        ..PoolSettings::default()
    })
    .unwrap();
    PoolManager::initialize(
        config,
        Arc::new(GaugeConnector {
            gauge: Arc::clone(gauge),
        }),
    )
    .unwrap()
}

async fn run_concurrently(pool: &Arc<PoolManager>, count: usize) {
    let (events, _rx) = EventSink::channel();
    let executor = QueryExecutor::new(events);

    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let pool = Arc::clone(pool);
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            executor.run(&pool, &format!("SELECT {}", i)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_connection_serializes() {
    let gauge = Arc::new(Gauge::default());
    let pool = pool(1, &gauge);

    run_concurrently(&pool, 10).await;

    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    assert_eq!(gauge.opened.load(Ordering::SeqCst), 1);
    assert_eq!(pool.status().leased, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_never_exceeds_max() {
    let gauge = Arc::new(Gauge::default());
    let pool = pool(3, &gauge);

    run_concurrently(&pool, 40).await;

    assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
    assert!(gauge.opened.load(Ordering::SeqCst) <= 3);
    let status = pool.status();
    assert!(status.size <= 3);
    assert_eq!(status.leased, 0);
    assert_eq!(status.idle, status.size);
}

#[tokio::test]
async fn test_double_release_returns_one_slot() {
    let gauge = Arc::new(Gauge::default());
    let pool = pool(2, &gauge);

    let mut lease = pool.acquire().await.unwrap();
    pool.release(&mut lease);
    pool.release(&mut lease);
    lease.release();

    let status = pool.status();
    assert_eq!(status.leased, 0);
    assert_eq!(status.idle, 1);
    assert_eq!(status.size, 1);
}

#[tokio::test]
async fn test_shutdown_twice() {
    let gauge = Arc::new(Gauge::default());
    let pool = pool(2, &gauge);
    run_concurrently(&pool, 4).await;

    assert_ok!(pool.shutdown().await);
    assert_ok!(pool.shutdown().await);

    assert!(pool.is_closed());
    assert_eq!(pool.status().size, 0);
    assert_err!(pool.acquire().await);
}

#[tokio::test]
async fn test_pools_are_independent() {
    let gauge = Arc::new(Gauge::default());
    let first = pool(2, &gauge);
    let second = pool(2, &gauge);

    run_concurrently(&first, 2).await;
    run_concurrently(&second, 2).await;
    first.shutdown().await.unwrap();

    assert!(first.is_closed());
    assert!(!second.is_closed());
    run_concurrently(&second, 4).await;
    assert!(second.status().size >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_queries_do_not_affect_concurrent_ones() {
    let gauge = Arc::new(Gauge::default());
    let pool = pool(3, &gauge);
    let (events, _rx) = EventSink::channel();
    let executor = QueryExecutor::new(events);

    let mut handles = Vec::new();
    for i in 0..30 {
        let pool = Arc::clone(&pool);
        let executor = executor.clone();
        let failing = i % 3 == 0;
        let sql = if failing {
            "SELECT * FROM missing_table"
        } else {
            "SELECT 1 AS x"
        };
        handles.push(tokio::spawn(async move {
            (failing, executor.execute(&pool, &ExecutionRequest::new(sql)).await)
        }));
    }

    for handle in handles {
        match handle.await.unwrap() {
            (false, result) => assert_eq!(result, ExecutionResult::Success(json!([{"x": 1}]))),
            (true, ExecutionResult::Failure(record)) => {
                assert_eq!(record.category, ErrorCategory::Query);
                assert_eq!(record.code.as_deref(), Some("EREQUEST"));
                assert_eq!(record.number, Some(208));
            }
            (true, other) => panic!("expected failure, got {:?}", other),
        }
    }

    assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
    let status = pool.status();
    assert_eq!(status.leased, 0);
    assert_eq!(status.idle, status.size);
    // Server errors keep connections usable, so none were replaced
    assert_eq!(gauge.opened.load(Ordering::SeqCst), status.size);
}
