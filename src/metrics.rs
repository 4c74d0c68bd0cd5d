use std::time::Duration;

use prometheus::{
    core::Collector, opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    inflight_requests: IntGauge,
    upstream_errors_total: IntCounterVec,
    stream_events_total: IntCounterVec,
}

pub struct InflightGuard<'a> {
    metrics: &'a AppMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self::build().expect("static metric definitions register cleanly")
    }

    fn build() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str, labels: &[&str]| {
            register(&registry, IntCounterVec::new(opts!(name, help), labels)?)
        };

        Ok(Self {
            request_total: counter(
                "novel_assistant_http_requests_total",
                "HTTP requests by route, method and status",
                &["path", "method", "status"],
            )?,
            upstream_errors_total: counter(
                "novel_assistant_upstream_errors_total",
                "Upstream LLM failures by stage",
                &["stage"],
            )?,
            stream_events_total: counter(
                "novel_assistant_stream_events_total",
                "Events relayed to streaming clients by kind",
                &["kind"],
            )?,
            request_duration_seconds: register(
                &registry,
                HistogramVec::new(
                    HistogramOpts::new(
                        "novel_assistant_http_request_duration_seconds",
                        "Time until the response head is ready, in seconds",
                    ),
                    &["path", "method"],
                )?,
            )?,
            inflight_requests: register(
                &registry,
                IntGauge::new(
                    "novel_assistant_inflight_requests",
                    "Generation and extraction requests in progress",
                )?,
            )?,
            registry,
        })
    }

    pub fn inflight_guard(&self) -> InflightGuard<'_> {
        self.inflight_requests.inc();
        InflightGuard { metrics: self }
    }

    pub fn observe_request(&self, path: &str, method: &str, status: u16, duration: Duration) {
        let status_label = status.to_string();
        self.request_total
            .with_label_values(&[path, method, &status_label])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[path, method])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_upstream_error(&self, stage: &str) {
        self.upstream_errors_total.with_label_values(&[stage]).inc();
    }

    pub fn observe_stream_event(&self, kind: &str) {
        self.stream_events_total.with_label_values(&[kind]).inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn register<M>(registry: &Registry, metric: M) -> prometheus::Result<M>
where
    M: Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.inflight_requests.dec();
    }
}
