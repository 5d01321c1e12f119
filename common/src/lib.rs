//! Shared building blocks for the RTP media engine.
//!
//! Both the receiver engine and the test sender use the RTP wire codec,
//! the PCM format helpers, the codec capability with its concrete
//! variants, the resamplers, and the observability setup from here.

pub mod codec;
pub mod format;
pub mod observability;
pub mod resampler;
pub mod rtp;

pub use codec::{Codec, CodecList, CodecMap, CodecSettings, CodecStats};
pub use format::{Format, ENGINE_CHANNELS, ENGINE_RATE};
pub use observability::{init_tracing, ColorWhen, MetricsContext, MetricsServerConfig};
pub use resampler::{ChannelConverter, Resampler, ResamplerSet, UniversalResampler};
pub use rtp::{RtpPacket, SequenceExtender};
