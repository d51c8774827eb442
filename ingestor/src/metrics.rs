use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref DECODED_FRAMES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("ingestor_decoded_frames_total", "Frames decoded, by kind"),
        &["kind"]
    )
    .unwrap();
    pub static ref UNRECOGNIZED_FRAMES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_unrecognized_frames_total",
        "Frames with an unknown shape or topic"
    ))
    .unwrap();
    pub static ref DECODE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_decode_failures_total",
        "Truncated frames and protocol violations"
    ))
    .unwrap();
    pub static ref LOST_PACKETS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_lost_packets_total",
        "Streaming packets missing from the sequence"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total database insert failures"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time taken to write a batch into the DB"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_batch_size",
        "Streaming events waiting in the current batch"
    ))
    .unwrap();
    pub static ref FFT_COMPUTATIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_fft_computations_total",
        "Spectra computed for subscribed clients"
    ))
    .unwrap();
    pub static ref PUSH_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_push_messages_total",
        "Messages queued to dashboard connections"
    ))
    .unwrap();
    pub static ref CONNECTED_CLIENTS: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_connected_clients",
        "Open dashboard WebSocket connections"
    ))
    .unwrap();
    pub static ref ACTIVE_SENSORS: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_active_sensors",
        "Sensors seen within the idle threshold"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DECODED_FRAMES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UNRECOGNIZED_FRAMES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DECODE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LOST_PACKETS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(BATCH_SIZE.clone()))?;
    REGISTRY.register(Box::new(FFT_COMPUTATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PUSH_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONNECTED_CLIENTS.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_SENSORS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
