//! Prometheus metrics for the media engine.
//!
//! One `MetricsContext` per process. The receiver mirrors its statistics
//! deltas into the counters; the sender only reports what it sent.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9100`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
///
/// Counters mirror the engine statistics so a scrape shows the same
/// loss/duplicate/late accounting the receiver logs.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Network counters
    pub packets_sent_total: IntCounter,
    pub packets_received_total: IntCounter,
    pub bytes_sent_total: IntCounter,
    pub bytes_received_total: IntCounter,

    // Jitter buffer accounting
    pub packets_rejected_total: IntCounter,
    pub packets_duplicate_total: IntCounter,
    pub packets_old_total: IntCounter,
    pub packets_lost_total: IntCounter,
    pub packets_dropped_total: IntCounter,
    pub frames_concealed_total: IntCounter,

    // Gauges
    pub jitter_buffer_ms: IntGauge,
    pub mixer_active_channels: IntGauge,
    pub jitter_seconds: Gauge,
    pub estimated_mos: Gauge,

    // Latency histograms (seconds)
    pub encode_seconds: Histogram,
    pub decode_seconds: Histogram,
}

fn counter(name: &str, help: &str) -> Result<IntCounter> {
    // ---
    Ok(IntCounter::with_opts(Opts::new(name, help))?)
}

fn int_gauge(name: &str, help: &str) -> Result<IntGauge> {
    // ---
    Ok(IntGauge::with_opts(Opts::new(name, help))?)
}

fn gauge(name: &str, help: &str) -> Result<Gauge> {
    // ---
    Ok(Gauge::with_opts(Opts::new(name, help))?)
}

fn histogram(name: &str, help: &str) -> Result<Histogram> {
    // ---
    Ok(Histogram::with_opts(HistogramOpts::new(name, help))?)
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("rtp_media_engine".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let ctx = Self {
            registry,
            packets_sent_total: counter("rtp_packets_sent_total", "Total RTP packets sent")?,
            packets_received_total: counter(
                "rtp_packets_received_total",
                "Total RTP packets received",
            )?,
            bytes_sent_total: counter("rtp_bytes_sent_total", "Total RTP payload bytes sent")?,
            bytes_received_total: counter(
                "rtp_bytes_received_total",
                "Total RTP payload bytes received",
            )?,
            packets_rejected_total: counter(
                "rtp_packets_rejected_total",
                "RTP packets rejected for unknown payload type or degenerate duration",
            )?,
            packets_duplicate_total: counter(
                "jitter_packets_duplicate_total",
                "Packets discarded as duplicates of a buffered sequence number",
            )?,
            packets_old_total: counter(
                "jitter_packets_old_total",
                "Packets discarded as too old for a full buffer",
            )?,
            packets_lost_total: counter(
                "jitter_packets_lost_total",
                "Packets never received (sequence gaps and underruns)",
            )?,
            packets_dropped_total: counter(
                "jitter_packets_dropped_total",
                "Packets trimmed from the front of an overfull buffer",
            )?,
            frames_concealed_total: counter(
                "receiver_frames_concealed_total",
                "Playout ticks filled by PLC or comfort noise",
            )?,
            jitter_buffer_ms: int_gauge(
                "jitter_buffer_ms",
                "Audio currently held in the jitter buffer (milliseconds)",
            )?,
            mixer_active_channels: int_gauge(
                "mixer_active_channels",
                "Mixer slots currently in use",
            )?,
            jitter_seconds: gauge("rtp_jitter_seconds", "RFC 3550 interarrival jitter")?,
            estimated_mos: gauge("receiver_estimated_mos", "Network MOS estimate")?,
            encode_seconds: histogram("codec_encode_seconds", "Encode duration in seconds")?,
            decode_seconds: histogram("codec_decode_seconds", "Decode duration in seconds")?,
        };

        ctx.registry.register(Box::new(ctx.packets_sent_total.clone()))?;
        ctx.registry.register(Box::new(ctx.packets_received_total.clone()))?;
        ctx.registry.register(Box::new(ctx.bytes_sent_total.clone()))?;
        ctx.registry.register(Box::new(ctx.bytes_received_total.clone()))?;
        ctx.registry.register(Box::new(ctx.packets_rejected_total.clone()))?;
        ctx.registry.register(Box::new(ctx.packets_duplicate_total.clone()))?;
        ctx.registry.register(Box::new(ctx.packets_old_total.clone()))?;
        ctx.registry.register(Box::new(ctx.packets_lost_total.clone()))?;
        ctx.registry.register(Box::new(ctx.packets_dropped_total.clone()))?;
        ctx.registry.register(Box::new(ctx.frames_concealed_total.clone()))?;
        ctx.registry.register(Box::new(ctx.jitter_buffer_ms.clone()))?;
        ctx.registry.register(Box::new(ctx.mixer_active_channels.clone()))?;
        ctx.registry.register(Box::new(ctx.jitter_seconds.clone()))?;
        ctx.registry.register(Box::new(ctx.estimated_mos.clone()))?;
        ctx.registry.register(Box::new(ctx.encode_seconds.clone()))?;
        ctx.registry.register(Box::new(ctx.decode_seconds.clone()))?;

        Ok(ctx)
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// This is intentionally explicit (callers decide whether to run it).
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            let server = Server::bind(&cfg.bind).serve(make_svc);
            server.await.map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(resp);
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}
