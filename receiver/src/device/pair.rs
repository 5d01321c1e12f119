//! Engine-side bridge between a data connection and a pair of devices.

use super::{DataConnection, InputDevice, OutputDevice};
use crate::config::{AUDIO_MIC_BUFFER_LENGTH, AUDIO_SPK_BUFFER_COUNT, AUDIO_SPK_BUFFER_LENGTH};
use crate::player::Player;
use anyhow::{Context, Result};
use media_common::{ChannelConverter, Format, UniversalResampler};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;
use tracing::{debug, info};

/// Converts interleaved audio between channel counts.
fn convert_channels(input: &[i16], from: u16, to: u16, output: &mut Vec<i16>) {
    // ---
    match (from, to) {
        (f, t) if f <= 2 && t <= 2 => ChannelConverter::convert(input, f, t, output),
        (1, t) => {
            for &s in input {
                output.extend(std::iter::repeat(s).take(t as usize));
            }
        }
        (f, 1) => output.extend(input.chunks_exact(f as usize).map(|frame| {
            (frame.iter().map(|&s| s as i32).sum::<i32>() / f as i32) as i16
        })),
        _ => output.extend_from_slice(input),
    }
}

/// Moves audio between the engine and an input/output device pair.
///
/// The speaker side asks the delegate for 10ms engine-format blocks,
/// lets the player overwrite them while a file is playing, converts them
/// to the output device's native format and pushes them into the device
/// ring until it is half full. The microphone side pops native 10ms
/// blocks from the input ring, converts them to the engine format and
/// hands them to the delegate.
///
/// [`DevicePair::pump`] does all of this and must be called more often
/// than the half-ring duration (80ms by default).
pub struct DevicePair {
    // ---
    input: Option<Box<dyn InputDevice>>,
    output: Option<Box<dyn OutputDevice>>,
    delegate: Option<Arc<dyn DataConnection>>,
    player: Option<Arc<Player>>,

    speaker: Option<HeapProd<i16>>,
    microphone: Option<HeapCons<i16>>,

    speaker_resampler: UniversalResampler,
    mic_resampler: UniversalResampler,
    engine_block: Vec<i16>,
    native_block: Vec<i16>,
    converted: Vec<i16>,

    /// Engine-format speaker audio produced since start
    produced_ms: u64,
}

impl Default for DevicePair {
    fn default() -> Self {
        // ---
        Self::new()
    }
}

impl DevicePair {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            input: None,
            output: None,
            delegate: None,
            player: None,
            speaker: None,
            microphone: None,
            speaker_resampler: UniversalResampler::new(),
            mic_resampler: UniversalResampler::new(),
            engine_block: Vec::new(),
            native_block: Vec::new(),
            converted: Vec::new(),
            produced_ms: 0,
        }
    }

    /// Replaces the input device; takes effect on the next start.
    pub fn set_input(&mut self, input: Option<Box<dyn InputDevice>>) {
        // ---
        if let Some(old) = self.input.as_mut() {
            old.close();
        }
        self.microphone = None;
        self.input = input;
    }

    /// Replaces the output device; takes effect on the next start.
    pub fn set_output(&mut self, output: Option<Box<dyn OutputDevice>>) {
        // ---
        if let Some(old) = self.output.as_mut() {
            old.close();
        }
        self.speaker = None;
        self.output = output;
    }

    pub fn set_delegate(&mut self, delegate: Option<Arc<dyn DataConnection>>) {
        // ---
        self.delegate = delegate;
    }

    pub fn set_player(&mut self, player: Option<Arc<Player>>) {
        // ---
        self.player = player;
    }

    pub fn player(&self) -> Option<&Arc<Player>> {
        // ---
        self.player.as_ref()
    }

    /// Opens both devices with fresh rings.
    ///
    /// # Errors
    ///
    /// Returns error if a device fails to open. The output device is
    /// closed again when the input device fails.
    pub fn start(&mut self) -> Result<()> {
        // ---
        if self.is_started() {
            return Ok(());
        }

        if let Some(output) = self.output.as_mut() {
            let format = output.format();
            let capacity = format.samples_from_time(AUDIO_SPK_BUFFER_LENGTH) * AUDIO_SPK_BUFFER_COUNT;
            let (producer, consumer) = HeapRb::<i16>::new(capacity).split();
            output
                .open(consumer)
                .context("failed to open output device")?;
            self.speaker = Some(producer);
        }

        if let Some(input) = self.input.as_mut() {
            let format = input.format();
            let capacity = format.samples_from_time(AUDIO_MIC_BUFFER_LENGTH) * AUDIO_SPK_BUFFER_COUNT;
            let (producer, consumer) = HeapRb::<i16>::new(capacity).split();
            if let Err(e) = input.open(producer) {
                self.stop();
                return Err(e.context("failed to open input device"));
            }
            self.microphone = Some(consumer);
        }

        self.produced_ms = 0;
        info!("Device pair started");
        Ok(())
    }

    /// Closes both devices. Safe to call when stopped.
    pub fn stop(&mut self) {
        // ---
        if let Some(output) = self.output.as_mut() {
            output.close();
        }
        if let Some(input) = self.input.as_mut() {
            input.close();
        }
        let had_speaker = self.speaker.take().is_some();
        let had_microphone = self.microphone.take().is_some();
        if had_speaker || had_microphone {
            info!("Device pair stopped after {}ms", self.produced_ms);
        }
    }

    pub fn is_started(&self) -> bool {
        // ---
        self.speaker.is_some() || self.microphone.is_some()
    }

    /// Engine audio pushed to the output device since start.
    pub fn produced_ms(&self) -> u64 {
        // ---
        self.produced_ms
    }

    /// Samples currently queued for the output device.
    pub fn speaker_queued(&self) -> usize {
        // ---
        self.speaker.as_ref().map_or(0, |p| p.occupied_len())
    }

    /// Services both rings once.
    pub fn pump(&mut self) {
        // ---
        self.pump_speaker();
        self.pump_microphone();
    }

    fn pump_speaker(&mut self) {
        // ---
        let (Some(output), Some(speaker)) = (self.output.as_ref(), self.speaker.as_mut()) else {
            return;
        };

        let engine = Format::engine();
        let native = output.format();
        let target = speaker.capacity().get() / 2;

        while speaker.occupied_len() < target {
            self.engine_block.clear();
            self.engine_block
                .resize(engine.samples_from_time(AUDIO_SPK_BUFFER_LENGTH), 0);

            if let Some(delegate) = self.delegate.as_ref() {
                delegate.on_spk_data(&engine, &mut self.engine_block);
            }
            if let Some(player) = self.player.as_ref() {
                player.on_spk_data(&engine, &mut self.engine_block);
            }

            self.converted.clear();
            convert_channels(&self.engine_block, engine.channels, native.channels, &mut self.converted);

            self.native_block.clear();
            self.speaker_resampler.resample(
                engine.rate,
                &self.converted,
                native.rate,
                native.channels,
                &mut self.native_block,
            );

            let pushed = speaker.push_slice(&self.native_block);
            if pushed < self.native_block.len() {
                debug!("Speaker ring full, dropped {} samples", self.native_block.len() - pushed);
            }
            self.produced_ms += AUDIO_SPK_BUFFER_LENGTH as u64;

            if self.native_block.is_empty() {
                break;
            }
        }
    }

    fn pump_microphone(&mut self) {
        // ---
        let (Some(input), Some(microphone)) = (self.input.as_ref(), self.microphone.as_mut()) else {
            return;
        };

        let engine = Format::engine();
        let native = input.format();
        let block_len = native.samples_from_time(AUDIO_MIC_BUFFER_LENGTH);
        if block_len == 0 {
            return;
        }

        while microphone.occupied_len() >= block_len {
            self.native_block.resize(block_len, 0);
            let read = microphone.pop_slice(&mut self.native_block);
            self.native_block.truncate(read);

            self.converted.clear();
            convert_channels(&self.native_block, native.channels, engine.channels, &mut self.converted);

            self.engine_block.clear();
            self.mic_resampler.resample(
                native.rate,
                &self.converted,
                engine.rate,
                engine.channels,
                &mut self.engine_block,
            );

            if let Some(delegate) = self.delegate.as_ref() {
                delegate.on_mic_data(&engine, &self.engine_block);
            }
        }
    }
}

impl Drop for DevicePair {
    fn drop(&mut self) {
        // ---
        self.stop();
    }
}
