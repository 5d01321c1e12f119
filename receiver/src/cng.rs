//! Comfort-noise synthesis from RFC 3389 silence descriptors.
//!
//! A SID payload carries the background noise level (byte 0, in -dBov)
//! and optionally a set of quantized reflection coefficients describing
//! its spectral envelope. The decoder turns the coefficients into an
//! all-pole filter and drives it with white noise scaled to the level.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

/// Highest filter order a SID may describe.
const MAX_ORDER: usize = 12;

/// Lowest level (-dBov) that still produces audible noise.
const MAX_LEVEL: u8 = 127;

/// Largest reflection coefficient magnitude accepted for a stable filter.
const MAX_REFLECTION: f64 = 0.99;

/// Comfort-noise decoder and generator.
#[derive(Debug, Clone)]
pub struct CngDecoder {
    // ---
    rng: StdRng,

    /// Whether any SID has been decoded since the last reset
    have_sid: bool,

    /// Level of the most recent SID, in -dBov
    target_level: f64,

    /// Level currently synthesized; moves toward the target per period
    current_level: f64,

    /// Direct-form LPC coefficients a[1..=order]
    lpc: Vec<f64>,

    /// Prediction error gain of the filter, sqrt(prod(1 - k^2))
    gain: f64,

    /// Filter memory, most recent output first
    memory: [f64; MAX_ORDER],
}

impl Default for CngDecoder {
    fn default() -> Self {
        // ---
        Self::new()
    }
}

impl CngDecoder {
    // ---
    pub fn new() -> Self {
        // ---
        Self::with_rng(StdRng::from_entropy())
    }

    /// Creates a decoder with a deterministic noise source.
    pub fn with_seed(seed: u64) -> Self {
        // ---
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        // ---
        Self {
            rng,
            have_sid: false,
            target_level: 0.0,
            current_level: 0.0,
            lpc: Vec::new(),
            gain: 1.0,
            memory: [0.0; MAX_ORDER],
        }
    }

    /// Parses a SID payload.
    ///
    /// Returns `false` for an empty payload, which leaves the state as is.
    pub fn decode_sid(&mut self, payload: &[u8]) -> bool {
        // ---
        let Some((&level, coefficients)) = payload.split_first() else {
            return false;
        };

        let reflection: Vec<f64> = coefficients
            .iter()
            .take(MAX_ORDER)
            .map(|&b| ((b as f64 - 127.0) / 128.0).clamp(-MAX_REFLECTION, MAX_REFLECTION))
            .collect();

        self.lpc = reflection_to_lpc(&reflection);
        self.gain = reflection
            .iter()
            .map(|k| 1.0 - k * k)
            .product::<f64>()
            .sqrt();
        self.target_level = (level & MAX_LEVEL) as f64;
        self.have_sid = true;

        trace!(
            "SID: level=-{}dBov, order={}",
            self.target_level,
            self.lpc.len()
        );
        true
    }

    /// Whether a SID has been decoded.
    pub fn has_sid(&self) -> bool {
        // ---
        self.have_sid
    }

    /// Synthesizes `ms` milliseconds of noise at `rate`.
    ///
    /// Always returns exactly `ms * rate / 1000` samples; they are silent
    /// until a SID has been decoded. `new_period` moves the output level
    /// halfway toward the latest SID level (or straight to it on the first
    /// period).
    pub fn produce(&mut self, rate: u32, ms: u32, new_period: bool) -> Vec<i16> {
        // ---
        let count = (ms as u64 * rate as u64 / 1000) as usize;
        if !self.have_sid {
            return vec![0; count];
        }

        if new_period {
            self.current_level = if self.current_level == 0.0 {
                self.target_level
            } else {
                (self.current_level + self.target_level) / 2.0
            };
        }

        // Uniform noise on [-1, 1) has RMS 1/sqrt(3)
        let rms = 32768.0 * 10f64.powf(-self.current_level / 20.0);
        let excitation_scale = rms * 3f64.sqrt() * self.gain;
        let order = self.lpc.len();

        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let mut sample = self.rng.gen_range(-1.0..1.0) * excitation_scale;
            for i in 0..order {
                sample -= self.lpc[i] * self.memory[i];
            }

            if order > 0 {
                self.memory.copy_within(0..order - 1, 1);
                self.memory[0] = sample;
            }
            out.push(sample.clamp(i16::MIN as f64, i16::MAX as f64) as i16);
        }

        out
    }

    /// Forgets the current noise description.
    pub fn reset(&mut self) {
        // ---
        if self.have_sid {
            debug!("Comfort noise reset");
        }
        self.have_sid = false;
        self.target_level = 0.0;
        self.current_level = 0.0;
        self.lpc.clear();
        self.gain = 1.0;
        self.memory = [0.0; MAX_ORDER];
    }
}

/// Step-up recursion: reflection coefficients to direct-form LPC.
///
/// Returns `a[1..=p]` for `A(z) = 1 + sum a[i] z^-i`.
fn reflection_to_lpc(reflection: &[f64]) -> Vec<f64> {
    // ---
    let mut a: Vec<f64> = Vec::with_capacity(reflection.len());

    for (m, &k) in reflection.iter().enumerate() {
        let previous = a.clone();
        for i in 0..m {
            a[i] = previous[i] + k * previous[m - 1 - i];
        }
        a.push(k);
    }

    a
}
