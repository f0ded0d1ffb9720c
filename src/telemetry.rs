use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;

pub struct Metrics {
    request_counter: Counter<u64>,
    prediction_duration: Histogram<u64>,
    open_sessions: Gauge<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("mask_tracking");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let prediction_duration = meter
            .u64_histogram("prediction_duration_ms")
            .with_boundaries(generate_boundaries(25, 2.0, 9))
            .with_description("Duration of predict calls in milliseconds")
            .build();

        let open_sessions = meter
            .u64_gauge("open_sessions")
            .with_description("Number of tracking sessions held in memory")
            .build();

        Ok(Metrics {
            request_counter,
            prediction_duration,
            open_sessions,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_prediction_duration(&self, duration_ms: u64, encoding: &str) {
        let attributes = vec![KeyValue::new("encoding", encoding.to_string())];
        self.prediction_duration.record(duration_ms, &attributes);
    }

    pub fn record_open_sessions(&self, count: usize) {
        self.open_sessions.record(count as u64, &[]);
    }
}

/// Geometric bucket boundaries: `start, start * factor, ...`, `count` values.
fn generate_boundaries(start: u64, factor: f64, count: usize) -> Vec<f64> {
    std::iter::successors(Some(start as f64), |prev| Some((prev * factor).round()))
        .take(count)
        .collect()
}
