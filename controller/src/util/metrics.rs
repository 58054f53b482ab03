//! Prometheus metrics, gated behind the `metrics` feature like the rest of the operator
//! stack. Names and labels match spec §6's `*Metrics` surface exactly.

use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref ELIGIBLE_NODES: IntGaugeVec = register_int_gauge_vec_with_registry!(
        Opts::new("eligible_nodes", "Candidates eligible for a disruption reason this tick."),
        &["reason"],
        REGISTRY
    )
    .unwrap();
    pub static ref NODE_POOL_ALLOWED_DISRUPTIONS: IntGaugeVec = register_int_gauge_vec_with_registry!(
        Opts::new(
            "node_pool_allowed_disruptions",
            "Remaining disruption allowance for a pool and reason this tick."
        ),
        &["nodepool", "reason"],
        REGISTRY
    )
    .unwrap();
    pub static ref DECISIONS_PERFORMED_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        Opts::new("decisions_performed_total", "Commands enqueued per disruption reason."),
        &["reason"],
        REGISTRY
    )
    .unwrap();
    pub static ref FAILED_VALIDATIONS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        Opts::new("failed_validations_total", "Commands abandoned at the TTL re-check."),
        &["consolidation_type"],
        REGISTRY
    )
    .unwrap();
    pub static ref CONSOLIDATION_TIMEOUTS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        Opts::new(
            "consolidation_timeouts_total",
            "Consolidation searches that hit their deadline before converging."
        ),
        &["consolidation_type"],
        REGISTRY
    )
    .unwrap();
    pub static ref EVALUATION_DURATION_SECONDS: HistogramVec = register_histogram_vec_with_registry!(
        HistogramOpts::new(
            "evaluation_duration_seconds",
            "Wall time spent evaluating one disruption method."
        ),
        &["reason", "consolidation_type"],
        REGISTRY
    )
    .unwrap();
}

/// Thin, cloneable handle so call sites don't reach for the statics directly; mirrors the
/// teacher's `ControllerMetrics::new(name)` constructor shape.
#[derive(Clone, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        // Force the lazy statics to register on first use.
        lazy_static::initialize(&REGISTRY);
        Metrics
    }

    pub fn eligible_nodes(&self, reason: &str, n: i64) {
        ELIGIBLE_NODES.with_label_values(&[reason]).set(n);
    }

    pub fn node_pool_allowed_disruptions(&self, pool: &str, reason: &str, n: i64) {
        NODE_POOL_ALLOWED_DISRUPTIONS
            .with_label_values(&[pool, reason])
            .set(n);
    }

    pub fn decision_performed(&self, reason: &str) {
        DECISIONS_PERFORMED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn failed_validation(&self, consolidation_type: &str) {
        FAILED_VALIDATIONS_TOTAL
            .with_label_values(&[consolidation_type])
            .inc();
    }

    pub fn consolidation_timeout(&self, consolidation_type: &str) {
        CONSOLIDATION_TIMEOUTS_TOTAL
            .with_label_values(&[consolidation_type])
            .inc();
    }

    pub fn evaluation_timer(&self, reason: &str, consolidation_type: &str) -> prometheus::HistogramTimer {
        EVALUATION_DURATION_SECONDS
            .with_label_values(&[reason, consolidation_type])
            .start_timer()
    }

    pub fn render(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&REGISTRY.gather(), &mut buf).unwrap();
        String::from_utf8(buf).unwrap_or_default()
    }
}

/// Serves the scrape endpoint on `0.0.0.0:{port}`. Every request, regardless of path,
/// gets the current registry snapshot back.
pub async fn run_server(port: u16) {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server};
    use std::convert::Infallible;
    use std::net::SocketAddr;

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, Infallible>(service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::from(Metrics::new().render())))
        }))
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    if let Err(e) = Server::bind(&addr).serve(make_svc).await {
        eprintln!("metrics server error: {e}");
    }
}
