//! Prerecorded audio playback into the speaker path.
//!
//! The player keeps a playlist of PCM sources. On every speaker block it
//! overwrites the block with audio from the head of the playlist, moving
//! to the next item when one ends or hits its time limit. Looped items
//! rewind instead of ending. Finished items are remembered by usage id so
//! the [`crate::AudioManager`] can release their device usage from its
//! regular processing step.

use crate::device::DataConnection;
use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavReader};
use media_common::{ChannelConverter, Format, Resampler};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Engine-format PCM that can be read sequentially and restarted.
pub trait PcmSource: Send {
    // ---
    /// Copies up to `out.len()` samples; returns the number copied.
    fn read(&mut self, out: &mut [i16]) -> usize;

    /// Restarts from the first sample.
    fn rewind(&mut self);
}

/// In-memory PCM source.
#[derive(Debug, Clone)]
pub struct MemorySource {
    // ---
    samples: Arc<[i16]>,
    position: usize,
}

impl MemorySource {
    // ---
    pub fn new(samples: impl Into<Arc<[i16]>>) -> Self {
        // ---
        Self {
            samples: samples.into(),
            position: 0,
        }
    }

    pub fn len(&self) -> usize {
        // ---
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.samples.is_empty()
    }
}

impl PcmSource for MemorySource {
    fn read(&mut self, out: &mut [i16]) -> usize {
        // ---
        let remaining = &self.samples[self.position..];
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        n
    }

    fn rewind(&mut self) {
        // ---
        self.position = 0;
    }
}

/// WAV file decoded up front and converted to the engine format.
#[derive(Debug, Clone)]
pub struct WavSource {
    // ---
    inner: MemorySource,
    original: Format,
}

impl WavSource {
    // ---
    /// Loads a 16-bit integer or 32-bit float WAV file.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be opened
    /// - WAV format is invalid
    /// - Sample format is unsupported
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        // ---
        let path = path.as_ref();
        let mut reader = WavReader::open(path)
            .with_context(|| format!("failed to open WAV file: {}", path.display()))?;
        let spec = reader.spec();

        let raw: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 16) => reader
                .samples::<i16>()
                .collect::<Result<Vec<_>, _>>()
                .context("failed to read 16-bit PCM WAV samples")?,
            (SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .map(|s| s.map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
                .collect::<Result<Vec<_>, _>>()
                .context("failed to read 32-bit float WAV samples")?,
            (format, bits) => bail!("unsupported WAV format: {:?} {}-bit", format, bits),
        };

        let original = Format::new(spec.sample_rate, spec.channels);
        let samples = Self::to_engine(&raw, original);
        info!(
            "Loaded {} ({}, {}ms)",
            path.display(),
            original,
            Format::engine().time_from_samples(samples.len())
        );

        Ok(Self {
            inner: MemorySource::new(samples),
            original,
        })
    }

    fn to_engine(raw: &[i16], original: Format) -> Vec<i16> {
        // ---
        let mut mono = Vec::with_capacity(raw.len() / original.channels as usize);
        if original.channels > 2 {
            let ch = original.channels as usize;
            mono.extend(raw.chunks_exact(ch).map(|frame| {
                (frame.iter().map(|&s| s as i32).sum::<i32>() / ch as i32) as i16
            }));
        } else {
            ChannelConverter::convert(raw, original.channels, 1, &mut mono);
        }

        let engine = Format::engine();
        if original.rate == engine.rate {
            return mono;
        }
        let mut out = Vec::new();
        Resampler::new(original.rate, engine.rate, 1).resample(&mono, &mut out);
        out
    }

    /// Format of the file before conversion.
    pub fn original_format(&self) -> Format {
        // ---
        self.original
    }

    pub fn len(&self) -> usize {
        // ---
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.inner.is_empty()
    }
}

impl PcmSource for WavSource {
    fn read(&mut self, out: &mut [i16]) -> usize {
        // ---
        self.inner.read(out)
    }

    fn rewind(&mut self) {
        // ---
        self.inner.rewind();
    }
}

/// Notified when a playlist item finishes.
pub trait EndOfAudioDelegate: Send + Sync {
    // ---
    fn on_file_played(&self, usage_id: i32);
}

struct PlaylistItem {
    // ---
    source: Box<dyn PcmSource>,
    looped: bool,

    /// Stop after this many milliseconds; 0 plays to the end
    time_limit_ms: u32,
    usage_id: i32,
}

#[derive(Default)]
struct PlayerInner {
    // ---
    playlist: VecDeque<PlaylistItem>,
    finished: Vec<i32>,

    /// Milliseconds played of the current item
    played_ms: f64,
}

impl PlayerInner {
    // ---
    fn finish_front(&mut self, just_finished: &mut Vec<i32>) {
        // ---
        if let Some(item) = self.playlist.pop_front() {
            debug!("Playlist item finished (usage {})", item.usage_id);
            self.finished.push(item.usage_id);
            just_finished.push(item.usage_id);
        }
        self.played_ms = 0.0;
    }

    fn fill(&mut self, format: &Format, out: &mut [i16], just_finished: &mut Vec<i32>) {
        // ---
        let ms_per_sample = 1000.0 / (format.rate as f64 * format.channels as f64);
        let mut produced = 0;

        while produced < out.len() {
            let Some(item) = self.playlist.front_mut() else {
                break;
            };
            if item.time_limit_ms > 0 && self.played_ms >= item.time_limit_ms as f64 {
                self.finish_front(just_finished);
                continue;
            }

            let mut read = item.source.read(&mut out[produced..]);
            if read == 0 && item.looped {
                item.source.rewind();
                read = item.source.read(&mut out[produced..]);
            }
            if read == 0 {
                self.finish_front(just_finished);
                continue;
            }

            produced += read;
            self.played_ms += read as f64 * ms_per_sample;
        }
    }
}

/// Time-multiplexed file playback.
///
/// # Example
///
/// ```
/// use media_common::Format;
/// use receiver::device::DataConnection;
/// use receiver::player::{MemorySource, Player};
///
/// let player = Player::new();
/// player.add(7, Box::new(MemorySource::new(vec![500i16; 100])), false, 0);
///
/// let mut block = vec![0i16; 160];
/// player.on_spk_data(&Format::engine(), &mut block);
///
/// assert_eq!(block[99], 500);
/// assert_eq!(block[100], 0);
/// assert_eq!(player.release_played(), vec![7]);
/// ```
#[derive(Default)]
pub struct Player {
    // ---
    inner: Mutex<PlayerInner>,
    delegate: Mutex<Option<Arc<dyn EndOfAudioDelegate>>>,
}

impl Player {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn EndOfAudioDelegate>>) {
        // ---
        *self.delegate.lock() = delegate;
    }

    /// Appends a source to the playlist.
    ///
    /// # Arguments
    ///
    /// * `usage_id` - Caller's handle for this playback
    /// * `source` - Engine-format PCM
    /// * `looped` - Rewind at the end instead of finishing
    /// * `time_limit_ms` - Finish after this long; 0 means no limit
    pub fn add(&self, usage_id: i32, source: Box<dyn PcmSource>, looped: bool, time_limit_ms: u32) {
        // ---
        self.inner.lock().playlist.push_back(PlaylistItem {
            source,
            looped,
            time_limit_ms,
            usage_id,
        });
        debug!("Queued playback for usage {}", usage_id);
    }

    /// Removes every playlist item with `usage_id` without notifying.
    pub fn release(&self, usage_id: i32) {
        // ---
        let mut inner = self.inner.lock();
        let head_removed = inner
            .playlist
            .front()
            .is_some_and(|item| item.usage_id == usage_id);
        inner.playlist.retain(|item| item.usage_id != usage_id);
        if head_removed {
            inner.played_ms = 0.0;
        }
    }

    /// Finishes every item, notifying the delegate for each.
    pub fn clear(&self) {
        // ---
        let mut just_finished = Vec::new();
        {
            let mut inner = self.inner.lock();
            while !inner.playlist.is_empty() {
                inner.finish_front(&mut just_finished);
            }
        }
        self.notify(&just_finished);
    }

    /// Drains finished usage ids, dropping any queued items they still own.
    pub fn release_played(&self) -> Vec<i32> {
        // ---
        let mut inner = self.inner.lock();
        let finished = std::mem::take(&mut inner.finished);
        inner
            .playlist
            .retain(|item| !finished.contains(&item.usage_id));
        finished
    }

    /// Drains finished usage ids and leaves the playlist untouched.
    pub fn retrieve_usage_ids(&self) -> Vec<i32> {
        // ---
        std::mem::take(&mut self.inner.lock().finished)
    }

    pub fn is_playing(&self) -> bool {
        // ---
        !self.inner.lock().playlist.is_empty()
    }

    fn notify(&self, usage_ids: &[i32]) {
        // ---
        if usage_ids.is_empty() {
            return;
        }
        let delegate = self.delegate.lock().clone();
        if let Some(delegate) = delegate {
            for &usage_id in usage_ids {
                delegate.on_file_played(usage_id);
            }
        }
    }
}

impl DataConnection for Player {
    fn on_mic_data(&self, _format: &Format, _samples: &[i16]) {}

    fn on_spk_data(&self, format: &Format, samples: &mut [i16]) {
        // ---
        let mut just_finished = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.playlist.is_empty() {
                return;
            }
            samples.fill(0);
            inner.fill(format, samples, &mut just_finished);
        }
        self.notify(&just_finished);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDelegate(AtomicUsize);

    impl EndOfAudioDelegate for CountingDelegate {
        fn on_file_played(&self, _usage_id: i32) {
            // ---
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn block() -> Vec<i16> {
        // ---
        vec![-1i16; 160]
    }

    #[test]
    fn test_empty_player_leaves_block() {
        // ---
        let player = Player::new();
        let mut samples = block();

        player.on_spk_data(&Format::engine(), &mut samples);

        assert!(samples.iter().all(|&s| s == -1));
        assert!(!player.is_playing());
    }

    #[test]
    fn test_items_play_in_order() {
        // ---
        let player = Player::new();
        player.add(1, Box::new(MemorySource::new(vec![1i16; 100])), false, 0);
        player.add(2, Box::new(MemorySource::new(vec![2i16; 100])), false, 0);

        let mut samples = block();
        player.on_spk_data(&Format::engine(), &mut samples);

        assert!(samples[..100].iter().all(|&s| s == 1));
        assert!(samples[100..].iter().all(|&s| s == 2));
        assert_eq!(player.retrieve_usage_ids(), vec![1]);
        assert!(player.is_playing());
    }

    #[test]
    fn test_looped_item_rewinds() {
        // ---
        let player = Player::new();
        player.add(3, Box::new(MemorySource::new(vec![9i16; 60])), true, 0);

        let mut samples = block();
        player.on_spk_data(&Format::engine(), &mut samples);

        assert!(samples.iter().all(|&s| s == 9));
        assert!(player.is_playing());
        assert!(player.retrieve_usage_ids().is_empty());
    }

    #[test]
    fn test_time_limit_ends_looped_item() {
        // ---
        let player = Player::new();
        let delegate = Arc::new(CountingDelegate(AtomicUsize::new(0)));
        player.set_delegate(Some(delegate.clone()));
        player.add(4, Box::new(MemorySource::new(vec![5i16; 160])), true, 20);

        let mut samples = block();
        player.on_spk_data(&Format::engine(), &mut samples);
        player.on_spk_data(&Format::engine(), &mut samples);
        assert!(player.is_playing());

        player.on_spk_data(&Format::engine(), &mut samples);

        assert!(samples.iter().all(|&s| s == 0));
        assert!(!player.is_playing());
        assert_eq!(delegate.0.load(Ordering::Relaxed), 1);
        assert_eq!(player.release_played(), vec![4]);
    }

    #[test]
    fn test_release_removes_usage() {
        // ---
        let player = Player::new();
        player.add(1, Box::new(MemorySource::new(vec![1i16; 1000])), false, 0);
        player.add(2, Box::new(MemorySource::new(vec![2i16; 1000])), false, 0);

        player.release(1);
        let mut samples = block();
        player.on_spk_data(&Format::engine(), &mut samples);

        assert!(samples.iter().all(|&s| s == 2));
    }

    #[test]
    fn test_clear_finishes_everything() {
        // ---
        let player = Player::new();
        let delegate = Arc::new(CountingDelegate(AtomicUsize::new(0)));
        player.set_delegate(Some(delegate.clone()));
        player.add(1, Box::new(MemorySource::new(vec![1i16; 1000])), false, 0);
        player.add(2, Box::new(MemorySource::new(vec![2i16; 1000])), true, 0);

        player.clear();

        assert!(!player.is_playing());
        assert_eq!(delegate.0.load(Ordering::Relaxed), 2);
        assert_eq!(player.release_played(), vec![1, 2]);
        assert!(player.release_played().is_empty());
    }

    #[test]
    fn test_wav_source_converts_to_engine() {
        // ---
        let path = std::env::temp_dir().join(format!("player_wav_{}.wav", std::process::id()));
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).expect("create wav");
        for _ in 0..800 {
            writer.write_sample(1000i16).expect("write");
            writer.write_sample(3000i16).expect("write");
        }
        writer.finalize().expect("finalize");

        let mut source = WavSource::open(&path).expect("open wav");
        std::fs::remove_file(&path).ok();

        assert_eq!(source.original_format(), Format::new(8000, 2));
        assert_eq!(source.len(), 1600);

        let mut out = vec![0i16; 100];
        assert_eq!(source.read(&mut out), 100);
        assert_eq!(out[50], 2000);
    }

    #[test]
    fn test_wav_source_missing_file() {
        // ---
        assert!(WavSource::open("/nonexistent/prompt.wav").is_err());
    }
}
