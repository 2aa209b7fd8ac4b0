use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::flow::stats::StatKind;
use crate::flow::table::Occupancy;
use crate::source::parse::ParseError;

const NAMESPACE: &str = "tcpflowspy";

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "tcpflowspy" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total events handed to the tracker.
    pub events_received: Counter,
    /// Events that did not touch any record, by reason (filtered/untracked).
    pub events_ignored: CounterVec,
    /// Total flow records created.
    pub flows_created: Counter,
    /// Flows moved to the finished queue, by cause (fin/rst/idle).
    pub flows_finished: CounterVec,
    /// New-flow SYNs dropped because the pool was full.
    pub events_dropped: Counter,
    /// Records written to the sink, by kind (finished/live).
    pub records_drained: CounterVec,
    /// Event source decode and read errors by error_type.
    pub event_parse_errors: CounterVec,
    /// Pool slots currently holding an active or finished record.
    pub pool_slots_in_use: Gauge,
    /// Finished records waiting to be drained.
    pub finished_queue_length: Gauge,
    /// Total pool slots.
    pub pool_capacity: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new("events_received_total", "Total events handed to the tracker.")
                .namespace(NAMESPACE),
        )?;
        let events_ignored = CounterVec::new(
            Opts::new(
                "events_ignored_total",
                "Events that did not match a tracked flow, by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let flows_created = Counter::with_opts(
            Opts::new("flows_created_total", "Total flow records created.").namespace(NAMESPACE),
        )?;
        let flows_finished = CounterVec::new(
            Opts::new(
                "flows_finished_total",
                "Flows moved to the finished queue, by cause.",
            )
            .namespace(NAMESPACE),
            &["cause"],
        )?;
        let events_dropped = Counter::with_opts(
            Opts::new(
                "events_dropped_total",
                "New-flow events dropped because the flow pool was full.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_drained = CounterVec::new(
            Opts::new("records_drained_total", "Records written to the sink, by kind.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let event_parse_errors = CounterVec::new(
            Opts::new(
                "event_parse_errors_total",
                "Total event source errors by error type.",
            )
            .namespace(NAMESPACE),
            &["error_type"],
        )?;
        let pool_slots_in_use = Gauge::with_opts(
            Opts::new(
                "pool_slots_in_use",
                "Pool slots holding an active or finished record.",
            )
            .namespace(NAMESPACE),
        )?;
        let finished_queue_length = Gauge::with_opts(
            Opts::new(
                "finished_queue_length",
                "Finished records waiting to be drained.",
            )
            .namespace(NAMESPACE),
        )?;
        let pool_capacity = Gauge::with_opts(
            Opts::new("pool_capacity", "Total flow pool slots.").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_ignored.clone()))?;
        registry.register(Box::new(flows_created.clone()))?;
        registry.register(Box::new(flows_finished.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(records_drained.clone()))?;
        registry.register(Box::new(event_parse_errors.clone()))?;
        registry.register(Box::new(pool_slots_in_use.clone()))?;
        registry.register(Box::new(finished_queue_length.clone()))?;
        registry.register(Box::new(pool_capacity.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_ignored,
            flows_created,
            flows_finished,
            events_dropped,
            records_drained,
            event_parse_errors,
            pool_slots_in_use,
            finished_queue_length,
            pool_capacity,
        })
    }

    /// Adds a tracker counter snapshot to the exported counters.
    pub fn publish_stats(&self, snapshot: &[(StatKind, u64)]) {
        for &(kind, n) in snapshot {
            let n = n as f64;
            match kind {
                StatKind::EventsReceived => self.events_received.inc_by(n),
                StatKind::EventsFiltered => {
                    self.events_ignored.with_label_values(&["filtered"]).inc_by(n)
                }
                StatKind::EventsUntracked => {
                    self.events_ignored.with_label_values(&["untracked"]).inc_by(n)
                }
                StatKind::PoolExhausted => self.events_dropped.inc_by(n),
                StatKind::FlowsCreated => self.flows_created.inc_by(n),
                StatKind::FinishedFin => self.flows_finished.with_label_values(&["fin"]).inc_by(n),
                StatKind::FinishedRst => self.flows_finished.with_label_values(&["rst"]).inc_by(n),
                StatKind::FinishedIdle => {
                    self.flows_finished.with_label_values(&["idle"]).inc_by(n)
                }
                StatKind::DrainedFinished => {
                    self.records_drained.with_label_values(&["finished"]).inc_by(n)
                }
                StatKind::DrainedLive => {
                    self.records_drained.with_label_values(&["live"]).inc_by(n)
                }
            }
        }
    }

    /// Sets the pool gauges.
    pub fn publish_occupancy(&self, occupancy: &Occupancy) {
        self.pool_capacity.set(occupancy.capacity as f64);
        self.pool_slots_in_use
            .set((occupancy.active + occupancy.finished) as f64);
        self.finished_queue_length.set(occupancy.finished as f64);
    }

    /// Counts one event source error.
    pub fn record_source_error(&self, err: &anyhow::Error) {
        let error_type = match err.downcast_ref::<ParseError>() {
            Some(ParseError::Truncated { .. }) => "truncated",
            Some(ParseError::InvalidDirection { .. }) => "invalid_direction",
            None => "io",
        };
        self.event_parse_errors
            .with_label_values(&[error_type])
            .inc();
    }

    /// Starts the HTTP server. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    fn render(registry: &Registry) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match HealthMetrics::render(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
