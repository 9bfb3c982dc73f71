//! Prometheus metrics for the read/write split proxy
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::OnceLock;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Router metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Session metrics
    /// Total router sessions opened
    pub sessions_total: IntCounter,
    /// Current open router sessions
    pub sessions_active: IntGauge,
    /// Sessions that could not be opened
    pub session_open_failures: IntCounter,

    // Routing metrics
    /// Statements routed by target (primary/replica/named)
    pub queries_routed_total: IntCounterVec,
    /// Session commands appended to session logs
    pub session_commands_total: IntCounter,
    /// Session commands replayed to backends
    pub replays_total: IntCounter,

    // Failover metrics
    /// Backend failovers by result (replaced/degraded/failed)
    pub failovers_total: IntCounterVec,

    // Relay metrics
    /// Bytes spliced from backends to clients
    pub relayed_bytes_total: IntCounter,
    /// Pipe acquisitions that had to wait for a free pipe
    pub pipe_waits_total: IntCounter,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        // Session metrics
        let sessions_total = IntCounter::new(
            "athena_rwsplit_sessions_total",
            "Total number of router sessions opened",
        )
        .expect("valid metric");

        let sessions_active = IntGauge::new(
            "athena_rwsplit_sessions_active",
            "Current number of open router sessions",
        )
        .expect("valid metric");

        let session_open_failures = IntCounter::new(
            "athena_rwsplit_session_open_failures_total",
            "Total number of sessions that could not be opened",
        )
        .expect("valid metric");

        // Routing metrics
        let queries_routed_total = IntCounterVec::new(
            Opts::new(
                "athena_rwsplit_queries_routed_total",
                "Total number of statements routed by target",
            ),
            &["target"], // primary/replica/named
        )
        .expect("valid metric");

        let session_commands_total = IntCounter::new(
            "athena_rwsplit_session_commands_total",
            "Total number of session commands logged",
        )
        .expect("valid metric");

        let replays_total = IntCounter::new(
            "athena_rwsplit_replays_total",
            "Total number of session commands replayed to backends",
        )
        .expect("valid metric");

        // Failover metrics
        let failovers_total = IntCounterVec::new(
            Opts::new(
                "athena_rwsplit_failovers_total",
                "Total number of backend failovers by result",
            ),
            &["result"], // replaced, degraded, failed
        )
        .expect("valid metric");

        // Relay metrics
        let relayed_bytes_total = IntCounter::new(
            "athena_rwsplit_relayed_bytes_total",
            "Total bytes spliced from backends to clients",
        )
        .expect("valid metric");

        let pipe_waits_total = IntCounter::new(
            "athena_rwsplit_pipe_waits_total",
            "Total number of pipe acquisitions that waited for a free pipe",
        )
        .expect("valid metric");

        // Register all metrics
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(sessions_total.clone()),
            Box::new(sessions_active.clone()),
            Box::new(session_open_failures.clone()),
            Box::new(queries_routed_total.clone()),
            Box::new(session_commands_total.clone()),
            Box::new(replays_total.clone()),
            Box::new(failovers_total.clone()),
            Box::new(relayed_bytes_total.clone()),
            Box::new(pipe_waits_total.clone()),
        ];
        for collector in collectors {
            registry.register(collector).expect("metric registered once");
        }

        Self {
            registry,
            sessions_total,
            sessions_active,
            session_open_failures,
            queries_routed_total,
            session_commands_total,
            replays_total,
            failovers_total,
            relayed_bytes_total,
            pipe_waits_total,
        }
    }

    /// Record a session opened
    pub fn record_session_opened(&self) {
        self.sessions_total.inc();
        self.sessions_active.inc();
    }

    /// Record a session closed
    pub fn record_session_closed(&self) {
        self.sessions_active.dec();
    }

    /// Record route decision
    pub fn record_route(&self, target: &str) {
        self.queries_routed_total.with_label_values(&[target]).inc();
    }

    /// Record a failover outcome
    pub fn record_failover(&self, result: &str) {
        self.failovers_total.with_label_values(&[result]).inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(match req.uri().path() {
        "/metrics" => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            metrics().gather(),
        ),
        "/health" => respond(StatusCode::OK, "text/plain", "OK".into()),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found".into()),
    })
}

/// Serve `/metrics` and `/health` until `shutdown` is cancelled
pub async fn start_metrics_server(addr: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(addr = %addr, "Metrics server stopped");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
