//! Hardware devices using cpal.
//!
//! Both devices open the host's default device at its default
//! configuration and exchange interleaved i16 samples with the engine
//! through a ring buffer. The callbacks only pop or push; underruns are
//! filled with silence and overruns drop the newest capture.

use super::{InputDevice, OutputDevice};
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, SupportedStreamConfig};
use media_common::Format;
use ringbuf::traits::{Consumer, Producer};
use ringbuf::{HeapCons, HeapProd};
use tracing::{debug, info, warn};

fn stream_format(config: &SupportedStreamConfig) -> Format {
    // ---
    Format::new(config.sample_rate().0, config.channels())
}

/// Audio output through the system's default playback device.
///
/// # Thread Safety
///
/// The cpal stream is not `Send`, so the device stays on the thread that
/// created it. Only the ring consumer moves into the audio callback.
pub struct CpalOutputDevice {
    // ---
    device: Device,
    config: SupportedStreamConfig,
    stream: Option<Stream>,
}

impl CpalOutputDevice {
    // ---
    /// Selects the default output device and its default configuration.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - No audio output device is available
    /// - The device reports no usable configuration
    pub fn new() -> Result<Self> {
        // ---
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("no output device available")?;
        let config = device
            .default_output_config()
            .context("failed to query output configuration")?;

        info!(
            "Using output device: {} ({})",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            stream_format(&config)
        );

        Ok(Self {
            device,
            config,
            stream: None,
        })
    }

    fn build_stream(&self, mut source: HeapCons<i16>) -> Result<Stream> {
        // ---
        let stream_config = self.config.config();
        let err_fn = |err| warn!("Audio output stream error: {}", err);

        let stream = match self.config.sample_format() {
            SampleFormat::I16 => self.device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let read = source.pop_slice(data);
                    data[read..].fill(0);
                },
                err_fn,
                None,
            ),
            SampleFormat::F32 => {
                let mut scratch: Vec<i16> = Vec::new();
                self.device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0);
                        let read = source.pop_slice(&mut scratch);
                        scratch[read..].fill(0);
                        for (out, sample) in data.iter_mut().zip(scratch.iter()) {
                            *out = f32::from(*sample) / 32768.0;
                        }
                    },
                    err_fn,
                    None,
                )
            }
            other => return Err(anyhow!("unsupported output sample format {:?}", other)),
        }
        .context("failed to build output stream")?;

        stream.play().context("failed to start output stream")?;
        Ok(stream)
    }
}

impl OutputDevice for CpalOutputDevice {
    fn open(&mut self, source: HeapCons<i16>) -> Result<()> {
        // ---
        self.close();
        self.stream = Some(self.build_stream(source)?);
        info!("Output stream started ({})", self.format());
        Ok(())
    }

    fn close(&mut self) {
        // ---
        if self.stream.take().is_some() {
            debug!("Output stream closed");
        }
    }

    fn format(&self) -> Format {
        // ---
        stream_format(&self.config)
    }

    fn is_open(&self) -> bool {
        // ---
        self.stream.is_some()
    }
}

/// Audio capture through the system's default recording device.
pub struct CpalInputDevice {
    // ---
    device: Device,
    config: SupportedStreamConfig,
    stream: Option<Stream>,
}

impl CpalInputDevice {
    // ---
    /// Selects the default input device and its default configuration.
    ///
    /// # Errors
    ///
    /// Returns error if no input device or configuration is available.
    pub fn new() -> Result<Self> {
        // ---
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .context("no input device available")?;
        let config = device
            .default_input_config()
            .context("failed to query input configuration")?;

        info!(
            "Using input device: {} ({})",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            stream_format(&config)
        );

        Ok(Self {
            device,
            config,
            stream: None,
        })
    }

    fn build_stream(&self, mut sink: HeapProd<i16>) -> Result<Stream> {
        // ---
        let stream_config = self.config.config();
        let err_fn = |err| warn!("Audio input stream error: {}", err);

        let stream = match self.config.sample_format() {
            SampleFormat::I16 => self.device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    sink.push_slice(data);
                },
                err_fn,
                None,
            ),
            SampleFormat::F32 => {
                let mut scratch: Vec<i16> = Vec::new();
                self.device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        scratch.clear();
                        scratch.extend(
                            data.iter()
                                .map(|s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16),
                        );
                        sink.push_slice(&scratch);
                    },
                    err_fn,
                    None,
                )
            }
            other => return Err(anyhow!("unsupported input sample format {:?}", other)),
        }
        .context("failed to build input stream")?;

        stream.play().context("failed to start input stream")?;
        Ok(stream)
    }
}

impl InputDevice for CpalInputDevice {
    fn open(&mut self, sink: HeapProd<i16>) -> Result<()> {
        // ---
        self.close();
        self.stream = Some(self.build_stream(sink)?);
        info!("Input stream started ({})", self.format());
        Ok(())
    }

    fn close(&mut self) {
        // ---
        if self.stream.take().is_some() {
            debug!("Input stream closed");
        }
    }

    fn format(&self) -> Format {
        // ---
        stream_format(&self.config)
    }

    fn is_open(&self) -> bool {
        // ---
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use ringbuf::traits::Split;
    use ringbuf::HeapRb;

    #[test]
    fn test_output_device_open_close() {
        // ---
        // Requires an audio device; CI and containers have none
        let Ok(mut device) = CpalOutputDevice::new() else {
            println!("Skipping: no audio device available (expected in CI)");
            return;
        };

        let (_producer, consumer) = HeapRb::<i16>::new(4096).split();
        if device.open(consumer).is_ok() {
            assert!(device.is_open());
            device.close();
        }
        assert!(!device.is_open());
        assert!(device.format().rate > 0);
    }

    #[test]
    fn test_input_device_open_close() {
        // ---
        let Ok(mut device) = CpalInputDevice::new() else {
            println!("Skipping: no audio device available (expected in CI)");
            return;
        };

        let (producer, _consumer) = HeapRb::<i16>::new(4096).split();
        if device.open(producer).is_ok() {
            assert!(device.is_open());
            device.close();
        }
        assert!(!device.is_open());
    }
}
