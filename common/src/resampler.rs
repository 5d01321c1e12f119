//! Sample-rate and channel conversion.
//!
//! [`Resampler`] is a stateful linear-interpolation converter: the last
//! input frame and the fractional read position carry over between calls,
//! so a stream fed in 10ms or 20ms blocks resamples without seams. The
//! position is kept as an exact rational (numerator over the destination
//! rate), so integral rate ratios produce exact block sizes.
//!
//! One resampler must only ever see one stream. [`ResamplerSet`] holds the
//! four fixed-rate converters a stream needs; [`UniversalResampler`] caches
//! one converter per (source, destination) pair for callers that see
//! arbitrary rates.

use std::collections::HashMap;
use tracing::debug;

/// Rates that get a dedicated converter in a [`ResamplerSet`].
pub const FIXED_RATES: [u32; 4] = [8_000, 16_000, 32_000, 48_000];

/// Stateful linear resampler for interleaved 16-bit PCM.
#[derive(Debug, Clone)]
pub struct Resampler {
    // ---
    src_rate: u32,
    dst_rate: u32,
    channels: usize,

    /// Last consumed input frame, the left neighbour of the next output
    history: Vec<i16>,

    /// Read position relative to `history`, in units of 1/dst_rate input frames
    position: u64,
}

impl Resampler {
    // ---
    /// Creates a resampler for one stream.
    pub fn new(src_rate: u32, dst_rate: u32, channels: u16) -> Self {
        // ---
        let channels = channels.max(1) as usize;
        Self {
            src_rate: src_rate.max(1),
            dst_rate: dst_rate.max(1),
            channels,
            history: vec![0; channels],
            position: 0,
        }
    }

    pub fn src_rate(&self) -> u32 {
        // ---
        self.src_rate
    }

    pub fn dst_rate(&self) -> u32 {
        // ---
        self.dst_rate
    }

    /// Upper bound of interleaved output samples for `src_len` input samples.
    pub fn dest_len(&self, src_len: usize) -> usize {
        // ---
        let frames = (src_len / self.channels) as u64;
        let out = (frames * self.dst_rate as u64).div_ceil(self.src_rate as u64);
        out as usize * self.channels
    }

    /// Resamples as much of `input` as fits into `output`.
    ///
    /// Returns `(consumed, produced)` in interleaved samples. Same-rate
    /// conversion is a plain copy.
    pub fn process(&mut self, input: &[i16], output: &mut [i16]) -> (usize, usize) {
        // ---
        let ch = self.channels;

        if self.src_rate == self.dst_rate {
            let n = input.len().min(output.len()) / ch * ch;
            output[..n].copy_from_slice(&input[..n]);
            return (n, n);
        }

        let frames_in = input.len() / ch;
        let capacity = output.len() / ch;
        let src = self.src_rate as u64;
        let dst = self.dst_rate as u64;

        let mut produced = 0;
        while produced < capacity {
            let idx = (self.position / dst) as usize;
            if idx >= frames_in {
                break;
            }

            let frac = (self.position % dst) as i64;
            for c in 0..ch {
                let left = i64::from(if idx == 0 {
                    self.history[c]
                } else {
                    input[(idx - 1) * ch + c]
                });
                let right = input[idx * ch + c] as i64;
                output[produced * ch + c] = (left + (right - left) * frac / dst as i64) as i16;
            }

            produced += 1;
            self.position += src;
        }

        let consumed = ((self.position / dst) as usize).min(frames_in);
        if consumed > 0 {
            self.history
                .copy_from_slice(&input[(consumed - 1) * ch..consumed * ch]);
            self.position -= consumed as u64 * dst;
        }

        (consumed * ch, produced * ch)
    }

    /// Resamples all of `input`, appending to `output`.
    ///
    /// Returns the number of samples appended.
    pub fn resample(&mut self, input: &[i16], output: &mut Vec<i16>) -> usize {
        // ---
        let start = output.len();
        output.resize(start + self.dest_len(input.len()) + self.channels, 0);

        let (_, produced) = self.process(input, &mut output[start..]);
        output.truncate(start + produced);
        produced
    }

    /// Drops filter history (new stream through the same converter).
    pub fn reset(&mut self) {
        // ---
        self.history.iter_mut().for_each(|s| *s = 0);
        self.position = 0;
    }
}

/// Converters from each of [`FIXED_RATES`] to a single destination rate.
#[derive(Debug, Clone)]
pub struct ResamplerSet {
    // ---
    resamplers: Vec<Resampler>,
}

impl ResamplerSet {
    // ---
    pub fn new(dst_rate: u32, channels: u16) -> Self {
        // ---
        Self {
            resamplers: FIXED_RATES
                .iter()
                .map(|&rate| Resampler::new(rate, dst_rate, channels))
                .collect(),
        }
    }

    /// Converter for `src_rate`, or `None` for a non-standard rate.
    pub fn get_mut(&mut self, src_rate: u32) -> Option<&mut Resampler> {
        // ---
        self.resamplers.iter_mut().find(|r| r.src_rate() == src_rate)
    }

    pub fn reset(&mut self) {
        // ---
        self.resamplers.iter_mut().for_each(Resampler::reset);
    }
}

/// Lazily created converter per (source, destination, channels).
#[derive(Debug, Default)]
pub struct UniversalResampler {
    // ---
    resamplers: HashMap<(u32, u32, u16), Resampler>,
}

impl UniversalResampler {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    fn converter(&mut self, src_rate: u32, dst_rate: u32, channels: u16) -> &mut Resampler {
        // ---
        self.resamplers
            .entry((src_rate, dst_rate, channels))
            .or_insert_with(|| {
                debug!("Creating resampler {}Hz -> {}Hz ({}ch)", src_rate, dst_rate, channels);
                Resampler::new(src_rate, dst_rate, channels)
            })
    }

    /// Bounded conversion; returns `(consumed, produced)`.
    pub fn process(
        &mut self,
        src_rate: u32,
        input: &[i16],
        dst_rate: u32,
        channels: u16,
        output: &mut [i16],
    ) -> (usize, usize) {
        // ---
        self.converter(src_rate, dst_rate, channels)
            .process(input, output)
    }

    /// Converts all of `input`, appending to `output`.
    pub fn resample(
        &mut self,
        src_rate: u32,
        input: &[i16],
        dst_rate: u32,
        channels: u16,
        output: &mut Vec<i16>,
    ) -> usize {
        // ---
        if src_rate == dst_rate {
            output.extend_from_slice(input);
            return input.len();
        }
        self.converter(src_rate, dst_rate, channels)
            .resample(input, output)
    }

    /// Number of cached converters.
    pub fn len(&self) -> usize {
        // ---
        self.resamplers.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.resamplers.is_empty()
    }
}

/// Interleaved channel-count conversion.
pub struct ChannelConverter;

impl ChannelConverter {
    // ---
    /// Averages each L/R pair.
    pub fn stereo_to_mono(input: &[i16], output: &mut Vec<i16>) {
        // ---
        output.extend(
            input
                .chunks_exact(2)
                .map(|pair| ((pair[0] as i32 + pair[1] as i32) >> 1) as i16),
        );
    }

    /// Duplicates each sample into both channels.
    pub fn mono_to_stereo(input: &[i16], output: &mut Vec<i16>) {
        // ---
        output.reserve(input.len() * 2);
        for &s in input {
            output.push(s);
            output.push(s);
        }
    }

    /// Converts between mono and stereo; any other combination is copied.
    pub fn convert(input: &[i16], from: u16, to: u16, output: &mut Vec<i16>) {
        // ---
        match (from, to) {
            (2, 1) => Self::stereo_to_mono(input, output),
            (1, 2) => Self::mono_to_stereo(input, output),
            _ => output.extend_from_slice(input),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_same_rate_passthrough() {
        // ---
        let mut resampler = Resampler::new(8000, 8000, 1);
        let input = [1i16, -2, 3, -4, 5];
        let mut output = [0i16; 8];

        let (consumed, produced) = resampler.process(&input, &mut output);

        assert_eq!(consumed, input.len());
        assert_eq!(produced, input.len());
        assert_eq!(&output[..5], &input);
    }

    #[test]
    fn test_upsample_exact_block() {
        // ---
        let mut resampler = Resampler::new(8000, 16000, 1);
        let input: Vec<i16> = (0..160).map(|i| i * 10).collect();
        let mut output = Vec::new();

        let produced = resampler.resample(&input, &mut output);

        assert_eq!(produced, 320);
        assert_eq!(output.len(), 320);
        // Interpolated midpoint between input[0] and input[1]
        assert_eq!(output[3], 5);
    }

    #[test]
    fn test_downsample_exact_block() {
        // ---
        let mut resampler = Resampler::new(48000, 16000, 1);
        let mut output = Vec::new();

        for _ in 0..3 {
            let produced = resampler.resample(&[1000i16; 960], &mut output);
            assert_eq!(produced, 320);
        }
        assert!(output[320..].iter().all(|&s| s == 1000));
    }

    #[test]
    fn test_bounded_output_reports_partial_consumption() {
        // ---
        let mut resampler = Resampler::new(8000, 16000, 1);
        let input = [100i16; 160];
        let mut output = [0i16; 100];

        let (consumed, produced) = resampler.process(&input, &mut output);

        assert_eq!(produced, 100);
        assert_eq!(consumed, 50);

        let mut rest = Vec::new();
        resampler.resample(&input[consumed..], &mut rest);
        assert_eq!(produced + rest.len(), 320);
    }

    #[test]
    fn test_non_integral_ratio_continuity() {
        // ---
        let mut resampler = Resampler::new(44_100, 16_000, 1);
        let mut output = Vec::new();

        let produced = resampler.resample(&[0i16; 882], &mut output);
        assert_eq!(produced, 320);
    }

    #[test]
    fn test_stereo_resample_keeps_channels_apart() {
        // ---
        let mut resampler = Resampler::new(8000, 16000, 2);
        let input: Vec<i16> = (0..160).flat_map(|_| [500i16, -500]).collect();
        let mut output = Vec::new();

        resampler.resample(&input, &mut output);

        assert_eq!(output.len(), 640);
        assert!(output[4..].chunks(2).all(|f| f[0] == 500 && f[1] == -500));
    }

    #[test]
    fn test_resampler_set_lookup() {
        // ---
        let mut set = ResamplerSet::new(16000, 1);

        assert!(set.get_mut(8000).is_some());
        assert!(set.get_mut(48000).is_some());
        assert!(set.get_mut(44100).is_none());
    }

    #[test]
    fn test_universal_caches_per_pair() {
        // ---
        let mut universal = UniversalResampler::new();
        let mut out = Vec::new();

        universal.resample(8000, &[0; 80], 16000, 1, &mut out);
        universal.resample(8000, &[0; 80], 16000, 1, &mut out);
        universal.resample(48000, &[0; 480], 16000, 1, &mut out);
        universal.resample(16000, &[0; 160], 16000, 1, &mut out);

        assert_eq!(universal.len(), 2);
        assert_eq!(out.len(), 160 + 160 + 160 + 160);
    }

    #[test]
    fn test_channel_conversion() {
        // ---
        let mut mono = Vec::new();
        ChannelConverter::stereo_to_mono(&[100, 200, -3, -4], &mut mono);
        assert_eq!(mono, vec![150, -4]);

        let mut stereo = Vec::new();
        ChannelConverter::mono_to_stereo(&[7, 8], &mut stereo);
        assert_eq!(stereo, vec![7, 7, 8, 8]);
    }
}
