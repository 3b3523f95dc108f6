//! Gateway Performance Benchmark
//!
//! Measures throughput and latency for:
//! 1. Transcoded calls - JSON over the HTTP router, through the internal client
//! 2. Native calls - gRPC straight to the RPC server
//! 3. Rejected calls - malformed JSON answered before any RPC

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use hdrhistogram::Histogram;
use tokio::sync::Mutex;
use tonic::Status;
use tower::ServiceExt;

use transcode_gateway::client::InternalClient;
use transcode_gateway::config::Config;
use transcode_gateway::gateway::{AppState, app};
use transcode_gateway::registry::{
    HttpBinding, MethodDescriptor, Registry, ServiceDescriptor,
};
use transcode_gateway::rpc::{CallContext, Implementations, RpcServer, RpcServerHandle};
use transcode_gateway::schema::{FieldDescriptor, FieldKind, Message, MessageSchema, Value};

const TOTAL_REQUESTS: usize = 20_000;
const CONCURRENCY: usize = 64;

// ============================================================================
// Benchmark Result
// ============================================================================

struct BenchmarkResult {
    scenario: String,
    total_requests: usize,
    successful: usize,
    failed: usize,
    duration: Duration,
    latency_histogram: Histogram<u64>,
}

impl BenchmarkResult {
    fn throughput(&self) -> f64 {
        self.successful as f64 / self.duration.as_secs_f64()
    }

    fn quantile(&self, q: f64) -> Duration {
        Duration::from_micros(self.latency_histogram.value_at_quantile(q))
    }

    fn print(&self) {
        println!("Scenario: {}", self.scenario);
        println!("  Total requests:  {:>12}", format_num(self.total_requests));
        println!("  Successful:      {:>12}", format_num(self.successful));
        println!("  Failed:          {:>12}", format_num(self.failed));
        println!("  Duration:        {:>12.2}s", self.duration.as_secs_f64());
        println!("  Throughput:      {:>12.0} req/s", self.throughput());
        for (label, q) in [("p50", 0.50), ("p95", 0.95), ("p99", 0.99)] {
            println!(
                "  Latency {}:     {:>12.2}ms",
                label,
                self.quantile(q).as_secs_f64() * 1000.0
            );
        }
        println!(
            "  Latency max:     {:>12.2}ms",
            Duration::from_micros(self.latency_histogram.max()).as_secs_f64() * 1000.0
        );
        println!();
    }
}

fn format_num(n: usize) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

// ============================================================================
// Test Infrastructure
// ============================================================================

struct Bench {
    registry: Arc<Registry>,
    client: InternalClient,
    router: Router,
    _rpc: RpcServerHandle,
}

fn registry() -> Registry {
    let request = Arc::new(
        MessageSchema::new("bench.EchoRequest")
            .with_field(FieldDescriptor::new("name", 1, FieldKind::String))
            .with_field(FieldDescriptor::new("count", 2, FieldKind::Int64))
            .with_field(FieldDescriptor::new("tags", 3, FieldKind::String).repeated()),
    );
    Registry::new()
        .with_service(
            ServiceDescriptor::new("bench.Echo").with_method(
                MethodDescriptor::new("Echo", Arc::clone(&request), request)
                    .with_http(HttpBinding::post("/v1/echo").with_body("*")),
            ),
        )
        .expect("bench registry is valid")
}

async fn start() -> Bench {
    let registry = Arc::new(registry());
    let implementations = Implementations::new().with(
        "bench.Echo",
        "Echo",
        |_ctx: CallContext, request: Message| async move { Ok::<_, Status>(request) },
    );
    let rpc = RpcServer::new(Arc::clone(&registry), implementations)
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .expect("RPC server failed to start");
    let config = Config::default();
    let client = InternalClient::connect(rpc.local_addr(), &config.client)
        .await
        .expect("Failed to connect to RPC server");
    registry.seal();
    let router = app(AppState::new(Arc::clone(&registry), client.clone()).with_config(config));
    Bench {
        registry,
        client,
        router,
        _rpc: rpc,
    }
}

async fn make_request(router: Router, body: &'static str) -> (StatusCode, Duration) {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/echo")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();

    let start = Instant::now();
    let response = router.oneshot(request).await.unwrap();
    let latency = start.elapsed();

    (response.status(), latency)
}

/// Runs `TOTAL_REQUESTS` calls of `op` across `CONCURRENCY` workers.
async fn run<F, Fut>(scenario: &str, op: F) -> BenchmarkResult
where
    F: Fn() -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = (bool, Duration)> + Send + 'static,
{
    let requests_per_worker = TOTAL_REQUESTS / CONCURRENCY;
    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3).unwrap()));
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    println!(
        "  Starting {} workers with {} requests each...",
        CONCURRENCY, requests_per_worker
    );

    let start = Instant::now();
    let handles: Vec<_> = (0..CONCURRENCY)
        .map(|_| {
            let op = op.clone();
            let histogram = Arc::clone(&histogram);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);

            tokio::spawn(async move {
                let mut local_histogram = Histogram::<u64>::new(3).unwrap();
                for _ in 0..requests_per_worker {
                    let (ok, latency) = op().await;
                    if ok {
                        successful.fetch_add(1, Ordering::Relaxed);
                        local_histogram.record(latency.as_micros() as u64).ok();
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                histogram.lock().await.add(&local_histogram).ok();
            })
        })
        .collect();

    futures::future::join_all(handles).await;
    let duration = start.elapsed();

    BenchmarkResult {
        scenario: scenario.to_string(),
        total_requests: requests_per_worker * CONCURRENCY,
        successful: successful.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        duration,
        latency_histogram: Arc::try_unwrap(histogram).unwrap().into_inner(),
    }
}

// ============================================================================
// Benchmark Scenarios
// ============================================================================

async fn run_transcoded_benchmark(bench: &Bench) -> BenchmarkResult {
    let router = bench.router.clone();
    run("Transcoded JSON/HTTP", move || {
        let router = router.clone();
        async move {
            let (status, latency) =
                make_request(router, r#"{"name":"bench","count":"42","tags":["a","b"]}"#).await;
            (status == StatusCode::OK, latency)
        }
    })
    .await
}

async fn run_native_benchmark(bench: &Bench) -> BenchmarkResult {
    let client = bench.client.clone();
    let method = bench
        .registry
        .lookup("bench.Echo", "Echo")
        .expect("echo method registered");
    run("Native gRPC", move || {
        let client = client.clone();
        let method = Arc::clone(&method);
        async move {
            let request = Message::new()
                .with("name", "bench")
                .with("count", 42i64)
                .with("tags", vec!["a", "b"]);
            let start = Instant::now();
            let result = client.call(&method, request, &CallContext::new()).await;
            let ok = result
                .map(|r| r.get_ref().get("count").and_then(Value::as_i64) == Some(42))
                .unwrap_or(false);
            (ok, start.elapsed())
        }
    })
    .await
}

async fn run_rejected_benchmark(bench: &Bench) -> BenchmarkResult {
    let router = bench.router.clone();
    run("Rejected (malformed JSON)", move || {
        let router = router.clone();
        async move {
            let (status, latency) = make_request(router, r#"{"name":"#).await;
            (status == StatusCode::BAD_REQUEST, latency)
        }
    })
    .await
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let bench = start().await;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              Transcoding Gateway Benchmark                   ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Scenario 1: Transcoded
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Running: Transcoded Benchmark");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    run_transcoded_benchmark(&bench).await.print();

    // Scenario 2: Native
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Running: Native Benchmark");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    run_native_benchmark(&bench).await.print();

    // Scenario 3: Rejected
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Running: Rejected Benchmark");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    run_rejected_benchmark(&bench).await.print();

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Benchmark Complete!");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}
