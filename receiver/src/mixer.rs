//! Conference mixer.
//!
//! Each stream, identified by its owner context and SSRC, gets a slot
//! from a fixed pool. Streams are combined by picking the loudest sample
//! at each position rather than summing, which needs no clipping logic.
//! Streams are not clock-synchronized; mixing works purely on buffered
//! sample counts.

use crate::config::{AUDIO_MIX_CHANNEL_COUNT, MIXER_CAPACITY, MIXER_CHANNEL_CAPACITY, MIX_CHUNK_SAMPLES};
use crate::device::DataConnection;
use crate::error::{MixerError, MixerResult};
use crate::pcm_window::PcmWindow;
use media_common::{Format, ResamplerSet, ENGINE_CHANNELS, ENGINE_RATE};
use parking_lot::Mutex;
use std::fmt;
use tracing::{debug, warn};

/// Opaque identity of whoever owns a mixer stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        write!(f, "ctx#{}", self.0)
    }
}

struct MixerStream {
    // ---
    window: PcmWindow,
    resamplers: ResamplerSet,
    active: bool,
    context: ContextId,
    ssrc: u32,
}

impl MixerStream {
    // ---
    fn new() -> Self {
        // ---
        Self {
            window: PcmWindow::new(MIXER_CHANNEL_CAPACITY),
            resamplers: ResamplerSet::new(ENGINE_RATE, ENGINE_CHANNELS),
            active: false,
            context: ContextId(0),
            ssrc: 0,
        }
    }

    fn is(&self, context: ContextId, ssrc: u32) -> bool {
        // ---
        self.active && self.context == context && self.ssrc == ssrc
    }

    fn deactivate(&mut self) {
        // ---
        self.active = false;
        self.window.clear();
        self.resamplers.reset();
    }
}

struct MixerInner {
    // ---
    streams: Vec<MixerStream>,
    output: PcmWindow,
    scratch: Vec<i16>,
}

impl MixerInner {
    // ---
    fn active_indices(&self) -> Vec<usize> {
        // ---
        self.streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.active)
            .map(|(i, _)| i)
            .collect()
    }

    fn mix(&mut self) {
        // ---
        let active = self.active_indices();

        match active.as_slice() {
            [] => {}
            [only] => {
                let stream = &mut self.streams[*only];
                let n = stream.window.filled().min(self.output.free());
                self.scratch.resize(n, 0);
                stream.window.read(&mut self.scratch);
                self.output.add(&self.scratch);
            }
            [first, second] => {
                let (a, b) = (&self.streams[*first].window, &self.streams[*second].window);
                let n = a.filled().max(b.filled()).min(self.output.free());

                self.scratch.clear();
                self.scratch.extend((0..n).map(|i| {
                    let sa = a.sample_at(i).unwrap_or(0);
                    let sb = b.sample_at(i).unwrap_or(0);
                    if sa.unsigned_abs() > sb.unsigned_abs() {
                        sa
                    } else {
                        sb
                    }
                }));

                self.output.add(&self.scratch);
                self.streams[*first].window.erase(n);
                self.streams[*second].window.erase(n);
            }
            many => {
                let n = many
                    .iter()
                    .map(|&i| self.streams[i].window.filled())
                    .min()
                    .unwrap_or(0)
                    .min(self.output.free());

                let mut done = 0;
                while done < n {
                    let chunk = (n - done).min(MIX_CHUNK_SAMPLES);
                    self.scratch.clear();
                    for i in 0..chunk {
                        let loudest = many
                            .iter()
                            .filter_map(|&s| self.streams[s].window.sample_at(i))
                            .max_by_key(|s| s.unsigned_abs())
                            .unwrap_or(0);
                        self.scratch.push(loudest);
                    }

                    self.output.add(&self.scratch);
                    for &s in many {
                        self.streams[s].window.erase(chunk);
                    }
                    done += chunk;
                }
            }
        }
    }
}

/// Mixer for concurrent decoded streams.
///
/// # Example
///
/// ```
/// use receiver::mixer::{ContextId, Mixer};
///
/// let mixer = Mixer::new();
/// mixer.add_pcm(ContextId(1), 100, &[100, -50], 16000, false).unwrap();
/// mixer.add_pcm(ContextId(2), 200, &[10, 200], 16000, false).unwrap();
///
/// let mut out = [0i16; 2];
/// mixer.get_pcm(&mut out);
/// assert_eq!(out, [100, 200]);
/// ```
pub struct Mixer {
    // ---
    inner: Mutex<MixerInner>,
}

impl Default for Mixer {
    fn default() -> Self {
        // ---
        Self::new()
    }
}

impl Mixer {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            inner: Mutex::new(MixerInner {
                streams: (0..AUDIO_MIX_CHANNEL_COUNT).map(|_| MixerStream::new()).collect(),
                output: PcmWindow::new(MIXER_CAPACITY),
                scratch: Vec::with_capacity(MIX_CHUNK_SAMPLES),
            }),
        }
    }

    /// Queues PCM for the stream `(context, ssrc)`.
    ///
    /// The block is resampled to the engine rate on arrival. A new stream
    /// takes the first free slot.
    ///
    /// # Arguments
    ///
    /// * `data` - Mono PCM at `rate`
    /// * `rate` - One of 8, 16, 32 or 48 kHz
    /// * `fade_out` - Ramp this block linearly down to silence
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `rate` has no fixed resampler
    /// - All slots are taken by other streams
    pub fn add_pcm(
        &self,
        context: ContextId,
        ssrc: u32,
        data: &[i16],
        rate: u32,
        fade_out: bool,
    ) -> MixerResult<()> {
        // ---
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let index = match inner.streams.iter().position(|s| s.is(context, ssrc)) {
            Some(index) => index,
            None => {
                let index = inner
                    .streams
                    .iter()
                    .position(|s| !s.active)
                    .ok_or(MixerError::Overflow(AUDIO_MIX_CHANNEL_COUNT))?;
                debug!("Mixer slot {} allocated for {} ssrc={}", index, context, ssrc);
                index
            }
        };

        let stream = &mut inner.streams[index];
        let resampler = stream
            .resamplers
            .get_mut(rate)
            .ok_or(MixerError::UnsupportedRate(rate))?;

        if !stream.active {
            stream.window.clear();
            stream.context = context;
            stream.ssrc = ssrc;
            stream.active = true;
        }

        inner.scratch.clear();
        resampler.resample(data, &mut inner.scratch);

        if fade_out {
            let len = inner.scratch.len();
            for (i, sample) in inner.scratch.iter_mut().enumerate() {
                let gain = (len - i) as i32;
                *sample = (*sample as i32 * gain / len as i32) as i16;
            }
        }

        stream.window.add(&inner.scratch);
        Ok(())
    }

    /// Moves buffered stream audio into the output window.
    pub fn mix(&self) {
        // ---
        self.inner.lock().mix();
    }

    /// Fills `out` with mixed audio, mixing first if the output window
    /// cannot cover it.
    ///
    /// Positions without audio are zero. Returns the number of mixed
    /// samples written.
    pub fn get_pcm(&self, out: &mut [i16]) -> usize {
        // ---
        let mut inner = self.inner.lock();
        if inner.output.filled() < out.len() {
            inner.mix();
        }

        out.fill(0);
        inner.output.read(out)
    }

    /// Mixes and drains everything available into `output`.
    pub fn mix_and_get_pcm(&self, output: &mut Vec<i16>) -> usize {
        // ---
        let mut inner = self.inner.lock();
        inner.mix();

        let start = output.len();
        let n = inner.output.filled();
        output.resize(start + n, 0);
        inner.output.read(&mut output[start..])
    }

    /// Mixed samples waiting in the output window.
    pub fn available(&self) -> usize {
        // ---
        self.inner.lock().output.filled()
    }

    pub fn active_channels(&self) -> usize {
        // ---
        self.inner.lock().streams.iter().filter(|s| s.active).count()
    }

    /// Releases every stream owned by `context`. No-op if there is none.
    pub fn unregister_channel(&self, context: ContextId) {
        // ---
        let mut inner = self.inner.lock();
        for stream in inner
            .streams
            .iter_mut()
            .filter(|s| s.active && s.context == context)
        {
            debug!("Mixer stream {} ssrc={} unregistered", context, stream.ssrc);
            stream.deactivate();
        }
    }

    /// Releases the stream `(context, ssrc)`. No-op if there is none.
    pub fn clear(&self, context: ContextId, ssrc: u32) {
        // ---
        let mut inner = self.inner.lock();
        if let Some(stream) = inner.streams.iter_mut().find(|s| s.is(context, ssrc)) {
            stream.deactivate();
        }
    }
}

impl DataConnection for Mixer {
    fn on_mic_data(&self, _format: &Format, _samples: &[i16]) {
        // ---
    }

    fn on_spk_data(&self, format: &Format, samples: &mut [i16]) {
        // ---
        if *format != Format::engine() {
            warn!("Mixer asked for {} audio, only {} is produced", format, Format::engine());
            samples.fill(0);
            return;
        }
        self.get_pcm(samples);
    }
}
