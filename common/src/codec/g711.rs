//! G.711 µ-law (PCMU) and A-law (PCMA).
//!
//! Companding follows the classic CCITT tables: µ-law with a 0x84 bias
//! and 8 segments, A-law on the 13-bit magnitude with segment ends at
//! powers of two. Concealment repeats the last good frame at a halving
//! gain and goes silent after three consecutive losses.

use super::Codec;
use anyhow::{bail, Result};

/// Static payload type for PCMU.
pub const PCMU_PAYLOAD_TYPE: u8 = 0;

/// Static payload type for PCMA.
pub const PCMA_PAYLOAD_TYPE: u8 = 8;

const G711_RATE: u32 = 8000;
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;
const ALAW_SEG_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

/// Frames of concealment before PLC falls silent.
const MAX_CONCEALED_FRAMES: u32 = 3;

/// Companding law.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711Law {
    MuLaw,
    ALaw,
}

/// G.711 codec with configurable packetization time.
pub struct G711Codec {
    // ---
    law: G711Law,
    ptime_ms: u32,

    /// Last decoded frame, replayed by PLC
    last_frame: Vec<i16>,

    /// Consecutive concealed frames since the last good decode
    concealed_run: u32,
}

impl G711Codec {
    // ---
    /// Creates a codec packing `ptime_ms` of audio per RTP payload.
    ///
    /// # Errors
    ///
    /// Returns error if `ptime_ms` is not a positive multiple of 10.
    pub fn new(law: G711Law, ptime_ms: u32) -> Result<Self> {
        // ---
        if ptime_ms == 0 || ptime_ms % 10 != 0 {
            bail!("unsupported G.711 ptime: {}ms", ptime_ms);
        }

        Ok(Self {
            law,
            ptime_ms,
            last_frame: Vec::new(),
            concealed_run: 0,
        })
    }

    /// µ-law codec.
    pub fn pcmu(ptime_ms: u32) -> Result<Self> {
        // ---
        Self::new(G711Law::MuLaw, ptime_ms)
    }

    /// A-law codec.
    pub fn pcma(ptime_ms: u32) -> Result<Self> {
        // ---
        Self::new(G711Law::ALaw, ptime_ms)
    }

    fn samples_per_frame(&self) -> usize {
        // ---
        (G711_RATE * self.ptime_ms / 1000) as usize
    }

    /// Byte value that decodes to silence.
    pub fn silence_byte(&self) -> u8 {
        // ---
        match self.law {
            G711Law::MuLaw => linear_to_ulaw(0),
            G711Law::ALaw => linear_to_alaw(0),
        }
    }
}

impl Codec for G711Codec {
    fn name(&self) -> &str {
        // ---
        match self.law {
            G711Law::MuLaw => "PCMU",
            G711Law::ALaw => "PCMA",
        }
    }

    fn pcm_length(&self) -> usize {
        // ---
        self.samples_per_frame() * 2
    }

    fn rtp_length(&self) -> usize {
        // ---
        self.samples_per_frame()
    }

    fn frame_time(&self) -> u32 {
        // ---
        self.ptime_ms
    }

    fn sample_rate(&self) -> u32 {
        // ---
        G711_RATE
    }

    fn encode(&mut self, pcm: &[i16], output: &mut Vec<u8>) -> Result<usize> {
        // ---
        output.reserve(pcm.len());
        match self.law {
            G711Law::MuLaw => output.extend(pcm.iter().map(|&s| linear_to_ulaw(s))),
            G711Law::ALaw => output.extend(pcm.iter().map(|&s| linear_to_alaw(s))),
        }
        Ok(pcm.len())
    }

    fn decode(&mut self, payload: &[u8], output: &mut Vec<i16>) -> Result<usize> {
        // ---
        let start = output.len();
        match self.law {
            G711Law::MuLaw => output.extend(payload.iter().map(|&b| ulaw_to_linear(b))),
            G711Law::ALaw => output.extend(payload.iter().map(|&b| alaw_to_linear(b))),
        }

        self.last_frame.clear();
        self.last_frame.extend_from_slice(&output[start..]);
        self.concealed_run = 0;

        Ok(payload.len())
    }

    fn plc(&mut self, lost_frames: usize, output: &mut Vec<i16>) -> Result<usize> {
        // ---
        if self.last_frame.is_empty() {
            return Ok(0);
        }

        let frame_len = self.samples_per_frame();
        let mut produced = 0;
        for _ in 0..lost_frames {
            self.concealed_run += 1;
            if self.concealed_run > MAX_CONCEALED_FRAMES {
                output.extend(std::iter::repeat(0).take(frame_len));
            } else {
                let shift = self.concealed_run;
                output.extend(
                    self.last_frame
                        .iter()
                        .cycle()
                        .take(frame_len)
                        .map(|&s| s >> shift),
                );
            }
            produced += frame_len;
        }

        Ok(produced)
    }
}

/// Encodes one linear sample to µ-law.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    // ---
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let top = ((pcm >> 7) & 0xFF) as u8;
    let exponent = if top == 0 { 0 } else { 7 - top.leading_zeros() as i32 };
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !(sign | (exponent << 4) | mantissa) as u8
}

/// Decodes one µ-law byte.
pub fn ulaw_to_linear(byte: u8) -> i16 {
    // ---
    let u = !byte;
    let exponent = ((u >> 4) & 0x07) as i32;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;

    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encodes one linear sample to A-law.
pub fn linear_to_alaw(sample: i16) -> u8 {
    // ---
    let mut pcm = (sample as i32) >> 3;
    let mask = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let Some(seg) = ALAW_SEG_END.iter().position(|&end| pcm <= end) else {
        return (0x7F ^ mask) as u8;
    };

    let mantissa = if seg < 2 { (pcm >> 1) & 0x0F } else { (pcm >> seg) & 0x0F };
    ((((seg as i32) << 4) | mantissa) ^ mask) as u8
}

/// Decodes one A-law byte.
pub fn alaw_to_linear(byte: u8) -> i16 {
    // ---
    let a = byte ^ 0x55;
    let mut t = ((a & 0x0F) as i32) << 4;
    let seg = ((a & 0x70) >> 4) as i32;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }

    if a & 0x80 != 0 {
        t as i16
    } else {
        -t as i16
    }
}
