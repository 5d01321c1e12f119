//! Integration tests for the core pipeline.
//!
//! Tests the end-to-end flow: encoding → RTP packetization → (UDP) →
//! jitter buffer → decoding → mixing → device playout.

use std::sync::Arc;
use std::time::Duration;

use media_common::codec::{G711Codec, OpusCodec, OPUS_DEFAULT_PAYLOAD_TYPE, PCMU_PAYLOAD_TYPE};
use media_common::{Codec, Format, MetricsContext, RtpPacket};
use receiver::device::{DataConnection, DevicePair, NullOutputDevice};
use receiver::{
    receive_loop, AudioManager, AudioReceiver, DecodeOptions, DecodeResult, Mixer,
    ReceiverOptions, RtpReceiver, RuntimeConfig, Statistics,
};
use sender::{stream_audio, AudioData, RtpSender, StreamConfig};

/// `frames` samples of a 440Hz tone, interleaved over `channels`.
fn tone(rate: u32, channels: u16, frames: usize) -> Vec<i16> {
    // ---
    (0..frames)
        .flat_map(|i| {
            let t = i as f32 / rate as f32;
            let s = ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16;
            std::iter::repeat(s).take(channels as usize)
        })
        .collect()
}

fn encode_stream(codec: &mut dyn Codec, payload_type: u8, packets: usize) -> Vec<RtpPacket> {
    // ---
    let format = codec.format();
    let frame_samples = codec.pcm_length() / 2;
    let frame_units = (frame_samples / format.channels as usize) as u32;
    let pcm = tone(format.rate, format.channels, frame_units as usize * packets);

    pcm.chunks(frame_samples)
        .enumerate()
        .map(|(i, frame)| {
            let mut payload = Vec::new();
            codec.encode(frame, &mut payload).expect("encode");
            RtpPacket::new(payload_type, i as u16, i as u32 * frame_units, 0xC0FFEE, payload)
        })
        .collect()
}

#[test]
fn test_g711_pipeline_with_single_loss() {
    // ---
    let mut encoder = G711Codec::pcmu(20).expect("codec");
    let packets = encode_stream(&mut encoder, PCMU_PAYLOAD_TYPE, 50);

    let mut receiver =
        AudioReceiver::new(&ReceiverOptions::default(), Statistics::shared()).expect("receiver");
    for (i, packet) in packets.into_iter().enumerate() {
        if i != 25 {
            assert!(receiver.add(Arc::new(packet)));
        }
    }

    let mut audio = Vec::new();
    let mut decoded = 0;
    while receiver.get_audio(&mut audio, DecodeOptions::playout()) != DecodeResult::NoPacket {
        decoded += 1;
    }

    assert_eq!(decoded, 49);
    assert_eq!(audio.len(), 49 * 320);

    let stats = receiver.stats().lock();
    assert_eq!(stats.packet_loss, 1);
    assert_eq!(stats.loss[1], 1);
    assert!(stats.audio_time >= 980);
    assert_eq!(stats.codec_name, "PCMU");
    assert!(audio.iter().any(|&s| s.abs() > 4000));
}

#[test]
fn test_opus_pipeline_resamples_to_engine_rate() {
    // ---
    let mut encoder = OpusCodec::new(48000, 2, 20, 48000).expect("encoder");
    let packets = encode_stream(&mut encoder, OPUS_DEFAULT_PAYLOAD_TYPE, 10);

    let mut receiver =
        AudioReceiver::new(&ReceiverOptions::default(), Statistics::shared()).expect("receiver");
    for packet in packets {
        assert!(receiver.add(Arc::new(packet)));
    }

    let mut audio = Vec::new();
    let mut decoded = 0;
    while receiver.get_audio(&mut audio, DecodeOptions::playout()) == DecodeResult::Decoded {
        decoded += 1;
    }

    // 20ms at 16kHz mono per packet
    assert_eq!(decoded, 10);
    assert_eq!(audio.len(), 10 * 320);
    assert_eq!(receiver.stats().lock().codec_name, "OPUS");
}

#[test]
fn test_dont_resample_keeps_codec_rate() {
    // ---
    let mut encoder = G711Codec::pcmu(20).expect("codec");
    let packets = encode_stream(&mut encoder, PCMU_PAYLOAD_TYPE, 5);

    let mut receiver =
        AudioReceiver::new(&ReceiverOptions::default(), Statistics::shared()).expect("receiver");
    for packet in packets {
        receiver.add(Arc::new(packet));
    }

    let options = DecodeOptions {
        dont_resample: true,
        ..DecodeOptions::playout()
    };
    let mut audio = Vec::new();
    assert_eq!(receiver.get_audio(&mut audio, options), DecodeResult::Decoded);
    assert_eq!(audio.len(), 160);
    assert_eq!(receiver.output_rate(options), 8000);
}

#[tokio::test]
async fn test_udp_loopback_through_receive_loop() {
    // ---
    let mut network = RtpReceiver::bind(([127, 0, 0, 1], 0).into())
        .await
        .expect("bind");
    let target = network.local_addr().expect("addr").to_string();

    let mut receiver =
        AudioReceiver::new(&ReceiverOptions::default(), Statistics::shared()).expect("receiver");
    let mixer = Arc::new(Mixer::new());
    let metrics = MetricsContext::new("loopback-test").expect("metrics");

    let mut pair = DevicePair::new();
    pair.set_output(Some(Box::new(NullOutputDevice::default())));
    let delegate: Arc<dyn DataConnection> = Arc::clone(&mixer) as Arc<dyn DataConnection>;
    pair.set_delegate(Some(delegate));

    let mut manager = AudioManager::new();
    manager.init(pair);
    manager.start(1).expect("start devices");

    // 200ms of tone at 16kHz becomes ten 20ms PCMU packets
    let audio = AudioData::new(tone(16000, 1, 3200), Format::new(16000, 1));
    let mut codec = G711Codec::pcmu(20).expect("codec");
    let mut sender = RtpSender::new(&target).await.expect("sender");

    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
    let shutdown = async move {
        let _ = done_rx.await;
        tokio::time::sleep(Duration::from_millis(400)).await;
    };

    let send = async {
        let config = StreamConfig::new(PCMU_PAYLOAD_TYPE, 0xBEEF);
        let result = stream_audio(&audio, &mut codec, &mut sender, &metrics, config).await;
        let _ = done_tx.send(());
        result
    };
    let run = receive_loop(
        &mut network,
        &mut receiver,
        &mixer,
        &mut manager,
        &metrics,
        RuntimeConfig::default(),
        shutdown,
    );

    let (sent, received) = tokio::join!(send, run);
    sent.expect("stream");
    received.expect("receive loop");

    assert_eq!(network.stats().packets_received, 10);
    assert_eq!(metrics.packets_sent_total.get(), 10);
    assert_eq!(metrics.packets_received_total.get(), 10);
    assert_eq!(receiver.stats().lock().received_rtp, 10);
    assert!(manager.pair().expect("pair").produced_ms() > 0);

    manager.stop(1);
    assert!(!manager.is_active());
}
