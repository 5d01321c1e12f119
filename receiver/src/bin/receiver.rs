//! RTP media receiver - CLI binary.
//!
//! Receives RTP packets via UDP, decodes them through the jitter buffer
//! and plays the mixed result through the system audio device.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use media_common::codec::OpusSettings;
use media_common::{init_tracing, CodecSettings, ColorWhen, MetricsContext, MetricsServerConfig};
use receiver::device::{
    CpalInputDevice, CpalOutputDevice, DataConnection, DevicePair, NullInputDevice,
    NullOutputDevice,
};
use receiver::{
    receive_loop, AudioManager, AudioReceiver, DecodeOptions, JitterConfig, Mixer,
    ReceiverOptions, RtpReceiver, RuntimeConfig, Statistics,
};

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

/// RTP media receiver - receive, de-jitter and play audio streams
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Port to listen on
    #[arg(short, long, default_value = "5004")]
    port: u16,

    /// Use timer-driven null devices instead of the sound card
    #[arg(long)]
    null_audio: bool,

    /// Jitter buffer low watermark in milliseconds
    #[arg(long, default_value = "10")]
    low_ms: u32,

    /// Jitter buffer high watermark in milliseconds
    #[arg(long, default_value = "24480")]
    high_ms: u32,

    /// Audio buffered before the first packet is played
    #[arg(short = 'b', long, default_value = "80")]
    prebuffer_ms: u32,

    /// Decode packets on arrival instead of at playout
    #[arg(long)]
    early_decode: bool,

    /// Emit decoded audio at the codec rate (no resampling)
    #[arg(long)]
    dont_resample: bool,

    /// Play silence instead of comfort noise between SID packets
    #[arg(long)]
    no_cng_fill: bool,

    /// Packetization time for PCMU/PCMA in milliseconds
    #[arg(long, default_value = "20")]
    g711_ptime_ms: u32,

    /// Dynamic payload type of the Opus stream
    #[arg(long, default_value = "106")]
    opus_payload_type: u8,

    /// Opus stream rate in Hz
    #[arg(long, default_value = "48000")]
    opus_rate: u32,

    /// Opus stream channel count
    #[arg(long, default_value = "2")]
    opus_channels: u16,

    /// Write decoded audio to this WAV file
    #[arg(long)]
    dump: Option<PathBuf>,

    /// WAV file to play once at startup
    #[arg(long)]
    prompt: Option<PathBuf>,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9200")]
    metrics_bind: String,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorArg,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Usage id of the receive loop itself.
const USAGE_STREAM: i32 = 1;

/// Usage id of the startup prompt.
const USAGE_PROMPT: i32 = 2;

fn device_pair(null_audio: bool, mixer: Arc<Mixer>) -> DevicePair {
    // ---
    let mut pair = DevicePair::new();

    if null_audio {
        pair.set_output(Some(Box::new(NullOutputDevice::default())));
        pair.set_input(Some(Box::new(NullInputDevice::default())));
    } else {
        match CpalOutputDevice::new() {
            Ok(output) => pair.set_output(Some(Box::new(output))),
            Err(e) => {
                warn!("{:#}; falling back to null output", e);
                pair.set_output(Some(Box::new(NullOutputDevice::default())));
            }
        }
        match CpalInputDevice::new() {
            Ok(input) => pair.set_input(Some(Box::new(input))),
            Err(e) => warn!("{:#}; capture disabled", e),
        }
    }

    let delegate: Arc<dyn DataConnection> = mixer;
    pair.set_delegate(Some(delegate));
    pair
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color.into())?;
    info!("Starting RTP media receiver v{VERSION}");
    info!("Listening on port: {}", args.port);
    info!(
        "Jitter buffer: low {}ms, high {}ms, prebuffer {}ms",
        args.low_ms, args.high_ms, args.prebuffer_ms
    );
    info!("Metrics bind: {}", args.metrics_bind);

    let metrics = MetricsContext::new("receiver")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let options = ReceiverOptions {
        codecs: CodecSettings {
            g711_ptime_ms: args.g711_ptime_ms,
            opus: vec![OpusSettings {
                payload_type: args.opus_payload_type,
                rate: args.opus_rate,
                channels: args.opus_channels,
                ..OpusSettings::default()
            }],
            ..CodecSettings::default()
        },
        jitter: JitterConfig {
            low_ms: args.low_ms,
            high_ms: args.high_ms,
            prebuffer_ms: args.prebuffer_ms,
        },
        early_decode: args.early_decode,
        dump_decoded: args.dump.clone(),
    };

    let mut receiver = AudioReceiver::new(&options, Statistics::shared())
        .context("failed to create audio receiver")?;
    let mut network = RtpReceiver::new(args.port)
        .await
        .context("failed to create network receiver")?;

    let mixer = Arc::new(Mixer::new());
    let mut manager = AudioManager::new();
    manager.init(device_pair(args.null_audio, Arc::clone(&mixer)));
    manager
        .start(USAGE_STREAM)
        .context("failed to start audio devices")?;

    if let Some(prompt) = args.prompt.as_ref() {
        if let Err(e) = manager.start_play_file(USAGE_PROMPT, prompt, false, 0) {
            warn!("{:#}", e);
        }
    }

    let config = RuntimeConfig {
        decode: DecodeOptions {
            dont_resample: args.dont_resample,
            fill_cng_gap: !args.no_cng_fill,
            ..DecodeOptions::playout()
        },
        ..RuntimeConfig::default()
    };

    info!("Ready to receive audio...");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    receive_loop(
        &mut network,
        &mut receiver,
        &mixer,
        &mut manager,
        &metrics,
        config,
        shutdown,
    )
    .await?;

    manager.stop(USAGE_STREAM);
    manager.shutdown();
    receiver.stats().lock().log();

    Ok(())
}
