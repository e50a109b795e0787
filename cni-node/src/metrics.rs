use std::sync::{LazyLock, PoisonError, RwLock};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

use crate::Error;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("cni_node")));

pub static CNI_METRICS: LazyLock<CniMetrics> = LazyLock::new(CniMetrics::new);

pub static HEALTH_CHECK_METRICS: LazyLock<HealthCheckMetrics> =
    LazyLock::new(HealthCheckMetrics::new);

/// Renders the registry in the text exposition format.
pub fn encode() -> String {
    let mut buffer = String::new();
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    match prometheus_client::encoding::text::encode(&mut buffer, &registry) {
        Ok(_) => buffer,
        Err(_) => "".into(),
    }
}

#[derive(Clone)]
pub struct CniMetrics {
    pub requests: Family<RequestLabels, Counter>,
    pub duration: Histogram,
}

impl CniMetrics {
    fn new() -> Self {
        let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
        let requests = Family::<RequestLabels, Counter>::default();
        let duration = Histogram::new([0.01, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0].into_iter());

        registry.register(
            "cni_requests",
            "Number of CNI requests by command and result",
            requests.clone(),
        );
        registry.register_with_unit(
            "cni_request_duration",
            "CNI request duration",
            Unit::Seconds,
            duration.clone(),
        );
        Self { requests, duration }
    }

    pub fn measure(&self) -> RequestMeasurer {
        RequestMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }

    pub fn count(&self, command: &str, error: Option<&Error>) {
        let result = match error {
            Some(e) => e.metric_label(),
            None => "success".into(),
        };
        self.requests
            .get_or_create(&RequestLabels {
                command: command.to_lowercase(),
                result,
            })
            .inc();
    }
}

pub struct RequestMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for RequestMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}

#[derive(Clone)]
pub struct HealthCheckMetrics {
    pub syncs: Family<SyncLabels, Counter>,
    pub services: Gauge,
}

impl HealthCheckMetrics {
    fn new() -> Self {
        let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
        let syncs = Family::<SyncLabels, Counter>::default();
        let services = Gauge::default();

        registry.register(
            "health_check_syncs",
            "Number of health check table pushes",
            syncs.clone(),
        );
        registry.register(
            "health_check_services",
            "Number of services with a node local health check",
            services.clone(),
        );
        Self { syncs, services }
    }

    pub fn count_sync(&self, table: &'static str, error: Option<&Error>) {
        let result = match error {
            Some(e) => e.metric_label(),
            None => "success".into(),
        };
        self.syncs
            .get_or_create(&SyncLabels {
                table: table.into(),
                result,
            })
            .inc();
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub command: String,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncLabels {
    pub table: String,
    pub result: String,
}
