use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub assignments_total: IntCounterVec,
    pub status_transitions_total: IntCounterVec,
    pub dispatch_latency_seconds: HistogramVec,
    pub dispatch_queue_depth: IntGauge,
    pub events_published_total: IntCounterVec,
    pub events_dropped_total: IntCounter,
    pub ws_connections_active: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let assignments_total = IntCounterVec::new(
            Opts::new("assignments_total", "Driver assignments by mode and outcome"),
            &["mode", "outcome"],
        )
        .expect("valid assignments_total metric");

        let status_transitions_total = IntCounterVec::new(
            Opts::new(
                "status_transitions_total",
                "Accepted order status transitions by target status",
            ),
            &["status"],
        )
        .expect("valid status_transitions_total metric");

        let dispatch_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "dispatch_latency_seconds",
                "Latency of automatic dispatch in seconds",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_latency_seconds metric");

        let dispatch_queue_depth = IntGauge::new(
            "dispatch_queue_depth",
            "Orders waiting for background dispatch",
        )
        .expect("valid dispatch_queue_depth metric");

        let events_published_total = IntCounterVec::new(
            Opts::new("events_published_total", "Events published by kind"),
            &["kind"],
        )
        .expect("valid events_published_total metric");

        let events_dropped_total = IntCounter::new(
            "events_dropped_total",
            "Events dropped because a subscriber buffer was full",
        )
        .expect("valid events_dropped_total metric");

        let ws_connections_active =
            IntGauge::new("ws_connections_active", "Open real-time connections")
                .expect("valid ws_connections_active metric");

        registry
            .register(Box::new(assignments_total.clone()))
            .expect("register assignments_total");
        registry
            .register(Box::new(status_transitions_total.clone()))
            .expect("register status_transitions_total");
        registry
            .register(Box::new(dispatch_latency_seconds.clone()))
            .expect("register dispatch_latency_seconds");
        registry
            .register(Box::new(dispatch_queue_depth.clone()))
            .expect("register dispatch_queue_depth");
        registry
            .register(Box::new(events_published_total.clone()))
            .expect("register events_published_total");
        registry
            .register(Box::new(events_dropped_total.clone()))
            .expect("register events_dropped_total");
        registry
            .register(Box::new(ws_connections_active.clone()))
            .expect("register ws_connections_active");

        Self {
            registry,
            assignments_total,
            status_transitions_total,
            dispatch_latency_seconds,
            dispatch_queue_depth,
            events_published_total,
            events_dropped_total,
            ws_connections_active,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
