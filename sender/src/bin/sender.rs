//! RTP media sender - CLI binary.
//!
//! Reads a WAV file, encodes it with the selected codec, packetizes it
//! into RTP and transmits it via UDP to a receiver.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use media_common::codec::OpusSettings;
use media_common::{
    init_tracing, CodecList, CodecSettings, ColorWhen, MetricsContext, MetricsServerConfig,
};
use sender::{stream_audio, RtpSender, StreamConfig};

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

impl From<ColorArg> for ColorWhen {
    fn from(v: ColorArg) -> Self {
        match v {
            ColorArg::Auto => ColorWhen::Auto,
            ColorArg::Always => ColorWhen::Always,
            ColorArg::Never => ColorWhen::Never,
        }
    }
}

/// RTP media sender - stream audio files over RTP
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Input audio file (WAV format)
    #[arg(short, long)]
    input: String,

    /// Remote address (IP:port) to send to
    #[arg(short, long, default_value = "127.0.0.1:5004")]
    remote: String,

    /// Codec name: pcmu, pcma, l16 or opus
    #[arg(short, long, default_value = "opus")]
    codec: String,

    /// Packetization time for PCMU/PCMA in milliseconds
    #[arg(long, default_value = "20")]
    g711_ptime_ms: u32,

    /// Dynamic payload type used for Opus
    #[arg(long, default_value = "106")]
    opus_payload_type: u8,

    /// Opus bitrate in bits per second
    #[arg(long, default_value = "48000")]
    opus_bitrate: i32,

    /// Packet transmission interval in milliseconds
    ///
    /// Controls pacing of packet transmission. Default 20ms matches
    /// the frame duration for real-time streaming.
    #[arg(short = 't', long, default_value = "20")]
    interval_ms: u64,

    /// Send comfort-noise packets for frames quieter than this peak (G.711)
    #[arg(long)]
    silence_threshold: Option<i16>,

    /// Replay input audio continuously (default). Use `--no-loop` to play once and exit.
    #[arg(long = "no-loop", default_value_t = true, action = clap::ArgAction::SetFalse)]
    loop_audio: bool,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9100")]
    metrics_bind: String,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorArg,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();

    init_tracing(args.color.into())?;

    info!("Starting RTP media sender v{VERSION}");
    info!("Input file: {}", args.input);
    info!("Remote address: {}", args.remote);
    info!("Codec: {}", args.codec);
    info!("Transmission interval: {}ms", args.interval_ms);
    info!("Loop audio: {}", args.loop_audio);
    info!("Metrics bind: {}", args.metrics_bind);

    let metrics = MetricsContext::new("sender")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let codecs = CodecList::new(&CodecSettings {
        g711_ptime_ms: args.g711_ptime_ms,
        opus: vec![OpusSettings {
            payload_type: args.opus_payload_type,
            bitrate: args.opus_bitrate,
            ..OpusSettings::default()
        }],
        ..CodecSettings::default()
    });
    let descriptor = codecs
        .find_codec(&args.codec)
        .with_context(|| format!("unknown codec: {}", args.codec))?;
    let mut codec = descriptor.create().context("failed to create encoder")?;

    // Read audio in blocking task
    info!("Reading audio file...");
    let input_path = args.input.clone();
    let audio = tokio::task::spawn_blocking(move || sender::read_wav(input_path))
        .await
        .context("audio reading task failed")??;

    info!(
        "Loaded {:.2}s of {} audio",
        audio.duration_secs(),
        audio.format
    );

    let mut sender = RtpSender::new(&args.remote)
        .await
        .context("failed to create sender")?;

    // Generate random SSRC for this session
    let ssrc = rand::random::<u32>();
    info!("Session SSRC: 0x{:08X}", ssrc);

    let config = StreamConfig {
        interval_ms: args.interval_ms,
        loop_audio: args.loop_audio,
        silence_threshold: args.silence_threshold,
        ..StreamConfig::new(descriptor.payload_type, ssrc)
    };

    info!("Starting transmission...");
    stream_audio(&audio, codec.as_mut(), &mut sender, &metrics, config).await?;

    let stats = sender.stats();
    info!(
        "Transmission complete: {} packets, {} bytes",
        stats.packets_sent, stats.bytes_sent
    );

    Ok(())
}
