use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static LINES_READ: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("fareflow_lines_read_total", "Raw lines read from the event source")
        .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static PARSE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("fareflow_parse_errors_total", "Lines dropped because they did not parse"),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static EVENTS_BATCHED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "fareflow_events_batched_total",
        "Parsed events handed to the batch accumulator",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static BATCHES_EMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("fareflow_batches_total", "Micro-batches processed and written"),
        &["operator"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static LATE_CONTRIBUTIONS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "fareflow_late_contributions_total",
        "Window contributions rejected because the window was behind the watermark",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static ROWS_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("fareflow_rows_written_total", "Result rows written by sink"),
        &["sink"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static BYTES_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("fareflow_bytes_written_total", "Total bytes written by sink"),
        &["sink"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static WATERMARK_MS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "fareflow_watermark_ms",
        "Current event-time watermark of the window aggregation (unix ms)",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub static STATE_SIZE: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("fareflow_state_size", "Keys held in aggregation state per operator"),
        &["operator"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub static BATCH_PROC_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new(
            "fareflow_batch_process_latency_ms",
            "Time to aggregate and write one micro-batch (ms)",
        )
        .buckets(vec![
            0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0,
        ]),
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

pub fn render_prometheus() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}
