//! Per-stream receive pipeline: codec resolution, jitter buffering,
//! decode, concealment and conversion to the engine format.

use crate::cng::CngDecoder;
use crate::config::{DecodeOptions, ReceiverOptions, CNG_DEFAULT_TIME_LENGTH, CNG_MAX_CHUNK_MS};
use crate::jitter_buffer::{AddResult, BufferedPacket, FetchResult, JitterBuffer};
use crate::stats::{JitterStatistics, SharedStatistics};
use anyhow::{Context, Result};
use media_common::codec::{PCMA_PAYLOAD_TYPE, PCMU_PAYLOAD_TYPE};
use media_common::rtp::RTP_HEADER_LEN;
use media_common::{
    ChannelConverter, Codec, CodecList, CodecMap, ResamplerSet, RtpPacket, ENGINE_CHANNELS,
    ENGINE_RATE,
};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, info, trace, warn};

type DumpWriter = hound::WavWriter<BufWriter<File>>;

/// Outcome of one [`AudioReceiver::get_audio`] tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeResult {
    /// A packet was played (decoded audio or comfort noise)
    Decoded,

    /// Missing audio was replaced by PLC or comfort noise
    Concealed,

    /// Audio is missing and nothing could conceal it
    SilentGap,

    /// Nothing to play yet
    NoPacket,

    /// The packet's payload does not match the codec frame size
    BadPacket,
}

impl DecodeResult {
    // ---
    /// Whether this tick produced audio the caller should play.
    pub fn has_audio(self) -> bool {
        // ---
        matches!(self, DecodeResult::Decoded | DecodeResult::Concealed)
    }
}

/// Comfort noise rides on PCMU/PCMA as a 1..=6 byte SID payload.
pub fn is_cng_packet(packet: &RtpPacket) -> bool {
    // ---
    (packet.payload_type == PCMU_PAYLOAD_TYPE || packet.payload_type == PCMA_PAYLOAD_TYPE)
        && (1..=6).contains(&packet.payload.len())
}

/// Looks up the codec for `payload_type`, creating it on first use.
///
/// Returns `None` for unknown payload types and for codecs that fail to
/// initialize.
fn resolve_codec<'a>(
    list: &CodecList,
    map: &'a mut CodecMap,
    payload_type: u8,
) -> Option<&'a mut (dyn Codec + 'static)> {
    // ---
    let slot = map.get_mut(&payload_type)?;

    if slot.is_none() {
        match list.create(payload_type) {
            Ok(codec) => {
                debug!("Created {} codec for payload type {}", codec.name(), payload_type);
                *slot = Some(codec);
            }
            Err(e) => {
                warn!("{:#}", e);
                return None;
            }
        }
    }

    slot.as_deref_mut()
}

/// Playout duration of `packet` in milliseconds, ignoring comfort noise.
fn regular_timelength(codec: &dyn Codec, packet: &RtpPacket) -> u32 {
    // ---
    if codec.is_vbr() {
        codec.frame_time()
    } else {
        (packet.payload.len() as f64 / codec.rtp_length() as f64 * codec.frame_time() as f64)
            .round() as u32
    }
}

/// Receive pipeline for one RTP stream.
///
/// Packets go in through [`add`](Self::add) as they arrive; the playout
/// cadence pulls engine-rate PCM out through [`get_audio`](Self::get_audio).
/// Codecs and resamplers are owned here, so a receiver must be driven by a
/// single task. The jitter buffer is shared-state safe and may be reached
/// through [`jitter_buffer`](Self::jitter_buffer) to adjust watermarks.
pub struct AudioReceiver {
    // ---
    codec_list: CodecList,
    codec_map: CodecMap,

    /// Payload type of the last played packet
    current_payload_type: Option<u8>,

    /// Frames in the last regular packet; drives PLC
    frame_count: usize,

    buffer: JitterBuffer,
    stats: SharedStatistics,

    /// SSRC of the stream currently being played
    ssrc: Option<u32>,
    jitter: JitterStatistics,

    /// Most recent comfort-noise packet, cleared by the next regular packet
    cng_packet: Option<Arc<RtpPacket>>,
    cng: CngDecoder,

    /// Duration of the last regular packet in milliseconds
    last_packet_time_length: Option<u32>,

    resamplers: ResamplerSet,
    early_decode: bool,
    dump: Option<DumpWriter>,

    last_decode: Option<Instant>,
    last_request: Option<Instant>,
    last_rate: u32,

    fetched: Vec<BufferedPacket>,
    decoded: Vec<i16>,
    converted: Vec<i16>,
}

impl AudioReceiver {
    // ---
    /// Creates a receiver accounting into `stats`.
    ///
    /// # Errors
    ///
    /// Returns error if the decoded-audio dump file cannot be created.
    pub fn new(options: &ReceiverOptions, stats: SharedStatistics) -> Result<Self> {
        // ---
        let codec_list = CodecList::new(&options.codecs);
        let codec_map = codec_list.fill_codec_map();

        let dump = options
            .dump_decoded
            .as_deref()
            .map(Self::create_dump)
            .transpose()?;

        info!(
            "Audio receiver: {} payload type(s), watermarks {}/{}/{}ms{}",
            codec_map.len(),
            options.jitter.low_ms,
            options.jitter.high_ms,
            options.jitter.prebuffer_ms,
            if options.early_decode { ", early decode" } else { "" }
        );

        Ok(Self {
            codec_list,
            codec_map,
            current_payload_type: None,
            frame_count: 0,
            buffer: JitterBuffer::new(options.jitter, Arc::clone(&stats)),
            stats,
            ssrc: None,
            jitter: JitterStatistics::new(),
            cng_packet: None,
            cng: CngDecoder::new(),
            last_packet_time_length: None,
            resamplers: ResamplerSet::new(ENGINE_RATE, ENGINE_CHANNELS),
            early_decode: options.early_decode,
            dump,
            last_decode: None,
            last_request: None,
            last_rate: ENGINE_RATE,
            fetched: Vec::new(),
            decoded: Vec::new(),
            converted: Vec::new(),
        })
    }

    fn create_dump(path: &Path) -> Result<DumpWriter> {
        // ---
        let spec = hound::WavSpec {
            channels: ENGINE_CHANNELS,
            sample_rate: ENGINE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        info!("Dumping decoded audio to {}", path.display());
        hound::WavWriter::create(path, spec)
            .with_context(|| format!("failed to create dump file {}", path.display()))
    }

    /// Accepts a packet from the network.
    ///
    /// Returns `false` if the packet was rejected: unknown payload type,
    /// duplicate, too old, or shorter than 2ms. Degenerate packets are
    /// still buffered so loss accounting stays continuous.
    pub fn add(&mut self, packet: Arc<RtpPacket>) -> bool {
        // ---
        {
            let mut stats = self.stats.lock();
            stats.record_codec(packet.payload_type);
            stats.received_rtp += 1;
            stats.received += (RTP_HEADER_LEN + packet.payload.len()) as u64;
            if stats.first_rtp_time.is_none() {
                stats.first_rtp_time = Some(SystemTime::now());
            }
        }

        if self.ssrc.is_some_and(|ssrc| ssrc != packet.ssrc) {
            self.restart_stream(packet.ssrc);
        }
        self.ssrc = Some(packet.ssrc);

        let Some(codec) = resolve_codec(&self.codec_list, &mut self.codec_map, packet.payload_type)
        else {
            self.stats.lock().illegal_rtp += 1;
            debug!("Rejecting packet with unknown payload type {}", packet.payload_type);
            return false;
        };

        let rate = codec.sample_rate();
        let cng = is_cng_packet(&packet);
        let timelength = if cng {
            self.last_packet_time_length.unwrap_or(CNG_DEFAULT_TIME_LENGTH)
        } else {
            regular_timelength(codec, &packet)
        };

        {
            let mut stats = self.stats.lock();
            if stats.codec_name.is_empty() {
                stats.codec_name = codec.name().to_string();
            }
        }

        self.jitter.process(&packet, rate);
        {
            let mut stats = self.stats.lock();
            stats.jitter = self.jitter.jitter();
            stats.max_delta = self.jitter.max_delta();
        }

        if !cng && timelength < 2 {
            self.stats.lock().illegal_rtp += 1;
            debug!(
                "Degenerate packet seq={} ({} bytes, {}ms)",
                packet.extended_sequence,
                packet.payload.len(),
                timelength
            );
            self.buffer.add(packet, timelength, rate);
            return false;
        }

        let mut buffered = BufferedPacket::new(Arc::clone(&packet), timelength, rate);
        if self.early_decode && !cng {
            if let Some(pcm) = Self::decode_frames(codec, &packet) {
                buffered = buffered.with_pcm(pcm.into());
            }
        }

        trace!(
            "RTP pt={} seq={} ts={} {}ms",
            packet.payload_type,
            packet.extended_sequence,
            packet.timestamp,
            timelength
        );

        self.buffer.add_buffered(buffered) == AddResult::Accepted
    }

    /// Drops the playout state of the previous stream. The new SSRC brings
    /// its own sequence and timestamp space.
    fn restart_stream(&mut self, ssrc: u32) {
        // ---
        info!(
            "Stream restarted: SSRC {:#010x} -> {:#010x}",
            self.ssrc.unwrap_or_default(),
            ssrc
        );
        self.buffer.reset();
        self.jitter = JitterStatistics::new();
        self.cng_packet = None;
        self.cng.reset();
        self.frame_count = 0;
        self.last_packet_time_length = None;
    }

    /// Decodes every frame of `packet` at codec rate (early-decode mode).
    fn decode_frames(codec: &mut dyn Codec, packet: &RtpPacket) -> Option<Vec<i16>> {
        // ---
        let frame_len = if codec.is_vbr() {
            packet.payload.len()
        } else {
            codec.rtp_length()
        };
        if frame_len == 0 || packet.payload.len() % frame_len != 0 {
            return None;
        }

        let mut pcm = Vec::new();
        for frame in packet.payload.chunks(frame_len) {
            if let Err(e) = codec.decode(frame, &mut pcm) {
                warn!("Early decode failed for seq={}: {:#}", packet.extended_sequence, e);
                return None;
            }
        }
        Some(pcm)
    }

    /// Produces the next block of audio for playout.
    ///
    /// Audio is appended to `output` in the engine format, or at the codec
    /// rate when `options.dont_resample` is set (see [`last_rate`](Self::last_rate)).
    pub fn get_audio(&mut self, output: &mut Vec<i16>, options: DecodeOptions) -> DecodeResult {
        // ---
        let now = Instant::now();
        if let Some(previous) = self.last_request.replace(now) {
            let ms = now.saturating_duration_since(previous).as_secs_f64() * 1000.0;
            self.stats.lock().decode_requested.process(ms);
        }

        let mut fetched = std::mem::take(&mut self.fetched);
        let result = match self.buffer.fetch(&mut fetched) {
            FetchResult::NoPacket => {
                trace!("No packet available in jitter buffer");
                DecodeResult::NoPacket
            }
            FetchResult::Gap => self.conceal(output, options),
            FetchResult::RegularPacket => {
                let mut result = DecodeResult::Decoded;
                for packet in fetched.drain(..) {
                    result = self.play_packet(&packet, output, options);
                }
                result
            }
        };
        self.fetched = fetched;

        result
    }

    /// Fills a sequence gap with comfort noise or codec PLC.
    fn conceal(&mut self, output: &mut Vec<i16>, options: DecodeOptions) -> DecodeResult {
        // ---
        let Some(payload_type) = self.current_payload_type else {
            return DecodeResult::SilentGap;
        };
        if options.skip_decode {
            return DecodeResult::SilentGap;
        }

        let start = output.len();
        if self.cng_packet.is_some() {
            // Continue the noise directly in the output format
            let rate = if options.dont_resample {
                self.last_rate
            } else {
                ENGINE_RATE
            };
            let ms = self.last_packet_time_length.unwrap_or(CNG_DEFAULT_TIME_LENGTH);
            let noise = self.cng.produce(rate, ms, false);
            self.write_output(rate, &noise, output);
        } else if self.frame_count > 0 {
            let Some(codec) = resolve_codec(&self.codec_list, &mut self.codec_map, payload_type)
            else {
                return DecodeResult::SilentGap;
            };
            let (rate, channels) = (codec.sample_rate(), codec.channels());

            let mut decoded = std::mem::take(&mut self.decoded);
            decoded.clear();
            if let Err(e) = codec.plc(self.frame_count, &mut decoded) {
                warn!("PLC failed: {:#}", e);
                decoded.clear();
            }
            if !decoded.is_empty() {
                self.emit(rate, channels, &decoded, output, options);
            }
            self.decoded = decoded;
        }

        if output.len() > start {
            debug!("Concealed gap with {} samples", output.len() - start);
            self.mark_decode();
            DecodeResult::Concealed
        } else {
            debug!("Gap detected, nothing to conceal with");
            DecodeResult::SilentGap
        }
    }

    /// Plays one fetched packet: comfort noise or regular frames.
    fn play_packet(
        &mut self,
        packet: &BufferedPacket,
        output: &mut Vec<i16>,
        options: DecodeOptions,
    ) -> DecodeResult {
        // ---
        let rtp = Arc::clone(&packet.rtp);

        if options.fill_cng_gap && !options.skip_decode {
            self.fill_cng_gap(&rtp, output, options);
        }

        let Some(codec) = resolve_codec(&self.codec_list, &mut self.codec_map, rtp.payload_type)
        else {
            return DecodeResult::BadPacket;
        };
        let (rate, channels) = (codec.sample_rate(), codec.channels());
        self.last_rate = rate;
        self.current_payload_type = Some(rtp.payload_type);

        if is_cng_packet(&rtp) {
            if !options.skip_decode {
                self.cng.decode_sid(&rtp.payload);
                let ms = self.last_packet_time_length.unwrap_or(CNG_DEFAULT_TIME_LENGTH);
                let noise = self.cng.produce(rate, ms, true);
                self.emit(rate, channels, &noise, output, options);
                self.mark_decode();
            }
            self.cng_packet = Some(rtp);
            return DecodeResult::Decoded;
        }

        if self.cng_packet.take().is_some() {
            self.cng.reset();
        }

        let rtp_length = codec.rtp_length();
        if rtp_length > 0 && rtp.payload.len() % rtp_length != 0 {
            debug!(
                "RTP packet with tail: seq={} {} bytes, frame {} bytes",
                rtp.extended_sequence,
                rtp.payload.len(),
                rtp_length
            );
            return DecodeResult::BadPacket;
        }

        self.frame_count = if rtp_length > 0 {
            rtp.payload.len() / rtp_length
        } else {
            1
        };
        self.last_packet_time_length = Some(self.frame_count as u32 * codec.frame_time());

        if options.skip_decode {
            return DecodeResult::Decoded;
        }

        let mut decoded = std::mem::take(&mut self.decoded);
        decoded.clear();

        if let Some(pcm) = &packet.pcm {
            decoded.extend_from_slice(pcm);
        } else {
            let frame_len = if rtp_length > 0 {
                rtp_length
            } else {
                rtp.payload.len()
            };
            for frame in rtp.payload.chunks(frame_len.max(1)) {
                if let Err(e) = codec.decode(frame, &mut decoded) {
                    warn!("Failed to decode packet seq={}: {:#}", rtp.extended_sequence, e);
                }
            }
        }
        let codec_stats = codec.stats();

        if !decoded.is_empty() {
            self.stats.lock().decoded_size += (decoded.len() * 2) as u64;
            self.emit(rate, channels, &decoded, output, options);
            self.mark_decode();
        }
        self.decoded = decoded;

        if let Some(codec_stats) = codec_stats {
            self.stats.lock().bitrate_switch_counter = codec_stats.bitrate_switches;
        }

        DecodeResult::Decoded
    }

    /// Synthesizes noise covering the timestamp distance from the last
    /// comfort-noise packet to `next`, in chunks of at most 100ms.
    fn fill_cng_gap(&mut self, next: &RtpPacket, output: &mut Vec<i16>, options: DecodeOptions) {
        // ---
        let (Some(cng_packet), Some(payload_type)) = (&self.cng_packet, self.current_payload_type)
        else {
            return;
        };
        let Some(codec) = resolve_codec(&self.codec_list, &mut self.codec_map, payload_type) else {
            return;
        };
        let (rate, channels) = (codec.sample_rate(), codec.channels());

        let units = next.timestamp.wrapping_sub(cng_packet.timestamp);
        if units > i32::MAX as u32 || rate < 1000 {
            return;
        }

        let ms = units / (rate / 1000);
        let last = self.last_packet_time_length.unwrap_or(CNG_DEFAULT_TIME_LENGTH);
        if ms <= last {
            return;
        }

        trace!("Filling {}ms comfort-noise gap", ms);
        let mut remaining = ms;
        while remaining > 0 {
            let chunk = remaining.min(CNG_MAX_CHUNK_MS);
            let noise = self.cng.produce(rate, chunk, false);
            self.emit(rate, channels, &noise, output, options);
            remaining -= chunk;
        }
    }

    /// Converts a decoded frame to the engine format and appends it.
    fn emit(
        &mut self,
        rate: u32,
        channels: u16,
        frame: &[i16],
        output: &mut Vec<i16>,
        options: DecodeOptions,
    ) {
        // ---
        let start = output.len();

        let input: &[i16] = if channels != ENGINE_CHANNELS {
            self.converted.clear();
            ChannelConverter::convert(frame, channels, ENGINE_CHANNELS, &mut self.converted);
            &self.converted
        } else {
            frame
        };

        let output_rate = match self.resamplers.get_mut(rate) {
            Some(resampler) if !options.dont_resample => {
                resampler.resample(input, output);
                ENGINE_RATE
            }
            // Non-standard rates bypass resampling
            _ => {
                output.extend_from_slice(input);
                rate
            }
        };

        let emitted = output.len() - start;
        self.stats.lock().audio_time += (emitted as u64 * 1000) / output_rate.max(1) as u64;
        self.dump_samples(&output[start..]);
    }

    fn write_output(&mut self, rate: u32, samples: &[i16], output: &mut Vec<i16>) {
        // ---
        output.extend_from_slice(samples);
        self.stats.lock().audio_time += (samples.len() as u64 * 1000) / rate.max(1) as u64;
        self.dump_samples(samples);
    }

    fn dump_samples(&mut self, samples: &[i16]) {
        // ---
        let Some(writer) = self.dump.as_mut() else {
            return;
        };

        for &sample in samples {
            if let Err(e) = writer.write_sample(sample) {
                warn!("Stopping decoded audio dump: {}", e);
                self.dump = None;
                return;
            }
        }
    }

    fn mark_decode(&mut self) {
        // ---
        let now = Instant::now();
        if let Some(previous) = self.last_decode.replace(now) {
            let ms = now.saturating_duration_since(previous).as_secs_f64() * 1000.0;
            self.stats.lock().decoding_interval.process(ms);
        }
    }

    /// Finalizes the decoded-audio dump, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the WAV header cannot be written.
    pub fn finish_dump(&mut self) -> Result<()> {
        // ---
        if let Some(writer) = self.dump.take() {
            writer.finalize().context("failed to finalize dump file")?;
        }
        Ok(())
    }

    /// Playout duration `add` would assign to `packet`.
    pub fn timelength_for(&mut self, packet: &RtpPacket) -> Option<u32> {
        // ---
        if is_cng_packet(packet) {
            return Some(self.last_packet_time_length.unwrap_or(CNG_DEFAULT_TIME_LENGTH));
        }
        let codec = resolve_codec(&self.codec_list, &mut self.codec_map, packet.payload_type)?;
        Some(regular_timelength(codec, packet))
    }

    /// Native sample rate of the codec for `packet`.
    pub fn samplerate_for(&mut self, packet: &RtpPacket) -> Option<u32> {
        // ---
        resolve_codec(&self.codec_list, &mut self.codec_map, packet.payload_type)
            .map(|codec| codec.sample_rate())
    }

    /// Codec instance for `payload_type`, if one has been created.
    pub fn codec(&self, payload_type: u8) -> Option<&dyn Codec> {
        // ---
        self.codec_map.get(&payload_type)?.as_deref()
    }

    /// Native rate of the most recently played codec.
    pub fn last_rate(&self) -> u32 {
        // ---
        self.last_rate
    }

    /// Rate of audio returned by `get_audio` with `options`.
    ///
    /// Equals the engine rate unless resampling is off or the codec runs at
    /// a non-standard rate.
    pub fn output_rate(&self, options: DecodeOptions) -> u32 {
        // ---
        let resampled = !options.dont_resample
            && media_common::resampler::FIXED_RATES.contains(&self.last_rate);
        if resampled {
            ENGINE_RATE
        } else {
            self.last_rate
        }
    }

    pub fn jitter_buffer(&self) -> &JitterBuffer {
        // ---
        &self.buffer
    }

    pub fn stats(&self) -> &SharedStatistics {
        // ---
        &self.stats
    }
}
