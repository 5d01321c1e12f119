//! Recoverable engine error conditions.
//!
//! Network anomalies are never errors (they are statistics); what remains
//! are resource and configuration failures the immediate caller handles.

use thiserror::Error;

/// Mixer failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MixerError {
    /// Every mixer slot is taken by another stream.
    #[error("mixer overflow: all {0} channels in use")]
    Overflow(usize),

    /// Input rate has no fixed resampler.
    #[error("unsupported mixer input rate: {0}Hz")]
    UnsupportedRate(u32),
}

/// Result type for mixer operations.
pub type MixerResult<T> = Result<T, MixerError>;
