//! Audio device capability and its implementations.
//!
//! Devices never call into the engine. An output device drains a ring
//! buffer from its hardware callback and an input device fills one; the
//! [`DevicePair`] moves engine audio in and out of those rings on a
//! regular task. The hardware callback therefore never decodes, mixes or
//! takes an engine lock.

mod null;
mod pair;
mod system;

pub use self::null::{NullInputDevice, NullOutputDevice, NullTimer};
pub use self::pair::DevicePair;
pub use self::system::{CpalInputDevice, CpalOutputDevice};

use anyhow::Result;
use media_common::Format;
use ringbuf::{HeapCons, HeapProd};

/// Receives engine-format audio from the device pair.
pub trait DataConnection: Send + Sync {
    // ---
    /// Captured audio, one block at a time.
    fn on_mic_data(&self, format: &Format, samples: &[i16]);

    /// Fills `samples` with audio to play.
    fn on_spk_data(&self, format: &Format, samples: &mut [i16]);
}

/// Playback device fed through a ring buffer.
pub trait OutputDevice {
    // ---
    /// Starts playback from `source`.
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened or started.
    fn open(&mut self, source: HeapCons<i16>) -> Result<()>;

    /// Stops playback. Safe to call when already closed.
    fn close(&mut self);

    /// Native interleaved format of the ring samples.
    fn format(&self) -> Format;

    fn is_open(&self) -> bool;
}

/// Capture device filling a ring buffer.
pub trait InputDevice {
    // ---
    /// Starts capture into `sink`.
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened or started.
    fn open(&mut self, sink: HeapProd<i16>) -> Result<()>;

    /// Stops capture. Safe to call when already closed.
    fn close(&mut self);

    fn format(&self) -> Format;

    fn is_open(&self) -> bool;
}
