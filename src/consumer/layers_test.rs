use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde_json::json;

use crate::channel::{Channel, PayloadChannel, Shared};
use crate::consumer::{Consumer, ConsumerType};
use crate::message::{ChannelRequest, Method};
use crate::producer::{PacketInfo, Producer};
use crate::rtp_parameters::{
    MediaKind, RtcpFeedback, RtpCodecParameters, RtpEncodingParameters, RtpParameters,
    MIME_TYPE_VP8,
};
use crate::settings::WorkerSettings;

fn shared() -> Arc<Shared> {
    let (control_writer, _keep1) = tokio::io::duplex(4096);
    let (payload_writer, _keep2) = tokio::io::duplex(4096);
    // The read halves are dropped: emitted notifications go nowhere, which
    // is fine for exercising the state machine.
    let channel = Channel::new(control_writer);
    let payload_channel = PayloadChannel::new(payload_writer);
    Shared::new(&channel, &payload_channel, WorkerSettings::default())
}

fn vp8_codec(payload_type: u8) -> RtpCodecParameters {
    RtpCodecParameters {
        mime_type: MIME_TYPE_VP8.to_string(),
        payload_type,
        clock_rate: 90000,
        channels: None,
        parameters: Default::default(),
        rtcp_feedback: vec![
            RtcpFeedback {
                r#type: "nack".into(),
                parameter: String::new(),
            },
            RtcpFeedback {
                r#type: "nack".into(),
                parameter: "pli".into(),
            },
        ],
    }
}

fn simulcast_producer_params() -> RtpParameters {
    RtpParameters {
        mid: None,
        codecs: vec![vp8_codec(101)],
        header_extensions: vec![],
        encodings: vec![
            RtpEncodingParameters {
                ssrc: Some(111),
                scalability_mode: Some("L1T3".into()),
                ..Default::default()
            },
            RtpEncodingParameters {
                ssrc: Some(222),
                scalability_mode: Some("L1T3".into()),
                ..Default::default()
            },
            RtpEncodingParameters {
                ssrc: Some(333),
                scalability_mode: Some("L1T3".into()),
                ..Default::default()
            },
        ],
        rtcp: Default::default(),
    }
}

fn consumer_params() -> RtpParameters {
    RtpParameters {
        mid: None,
        codecs: vec![vp8_codec(96)],
        header_extensions: vec![],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(999),
            ..Default::default()
        }],
        rtcp: Default::default(),
    }
}

fn vp8_packet(ssrc: u32, seq: u16, timestamp: u32, key_frame: bool) -> rtp::packet::Packet {
    let mut packet = rtp::packet::Packet::default();
    packet.header.version = 2;
    packet.header.payload_type = 101;
    packet.header.ssrc = ssrc;
    packet.header.sequence_number = seq;
    packet.header.timestamp = timestamp;
    // VP8 descriptor with S=1, PID=0; frame tag P bit encodes key frame.
    packet.payload = Bytes::from(vec![0x10, if key_frame { 0x00 } else { 0x01 }, 0x00, 0x00]);
    packet
}

fn info(spatial_index: u8, key_frame: bool) -> PacketInfo {
    PacketInfo {
        spatial_index,
        payload: crate::codecs::PayloadInfo {
            is_key_frame: key_frame,
            temporal_layer: Some(0),
            spatial_layer: None,
            is_dtx: false,
        },
        audio_level: None,
    }
}

async fn build() -> (Arc<Shared>, Arc<Producer>, Arc<Consumer>) {
    let shared = shared();

    let producer = Producer::new(
        "P1".into(),
        MediaKind::Video,
        simulcast_producer_params(),
        false,
        None,
        false,
        Arc::clone(&shared),
        Weak::new(),
    )
    .unwrap();

    // Make all three streams known and active.
    for (index, ssrc) in [111u32, 222, 333].iter().enumerate() {
        for seq in 0..3u16 {
            producer
                .receive_rtp_packet(
                    vp8_packet(*ssrc, seq, u32::from(seq) * 3000, seq == 0),
                    200,
                )
                .await;
        }
        assert_eq!(producer.active_spatial_indexes(std::time::Instant::now()).len(), index + 1);
    }

    let consumer = Consumer::new(
        "C1".into(),
        "P1".into(),
        MediaKind::Video,
        ConsumerType::Simulcast,
        consumer_params(),
        simulcast_producer_params().encodings,
        false,
        false,
        None,
        Arc::clone(&shared),
        Weak::new(),
        Arc::downgrade(&producer),
    )
    .unwrap();

    (shared, producer, consumer)
}

#[tokio::test]
async fn consumer_commits_on_target_key_frame() {
    let (_shared, _producer, consumer) = build().await;

    // An inter frame on the highest stream must not commit.
    consumer
        .send_rtp_packet(&vp8_packet(333, 10, 1000, false), &info(2, false))
        .await;
    assert_eq!(consumer.current_layers(), None);

    // The key frame commits current = target = the preferred maximum.
    consumer
        .send_rtp_packet(&vp8_packet(333, 11, 2000, true), &info(2, true))
        .await;
    let layers = consumer.current_layers().expect("layers committed");
    assert_eq!(layers.spatial_layer, 2);
    assert_eq!(layers.temporal_layer, Some(2));
}

#[tokio::test]
async fn packets_from_other_streams_are_dropped() {
    let (_shared, _producer, consumer) = build().await;

    consumer
        .send_rtp_packet(&vp8_packet(333, 11, 2000, true), &info(2, true))
        .await;
    let before = consumer.current_layers();

    // Stream s=0 packets must not disturb the committed layers.
    consumer
        .send_rtp_packet(&vp8_packet(111, 50, 9000, false), &info(0, false))
        .await;
    assert_eq!(consumer.current_layers(), before);
}

#[tokio::test]
async fn set_preferred_layers_switches_down_after_key_frame() {
    let (_shared, _producer, consumer) = build().await;

    consumer
        .send_rtp_packet(&vp8_packet(333, 11, 2000, true), &info(2, true))
        .await;
    assert_eq!(consumer.current_layers().unwrap().spatial_layer, 2);

    let request = ChannelRequest {
        id: 1,
        method: Method::ConsumerSetPreferredLayers,
        handler_id: "C1".into(),
        data: json!({ "spatialLayer": 0, "temporalLayer": 0 }),
    };
    use crate::channel::registrator::ChannelRequestHandler;
    consumer.handle_channel_request(&request).await.unwrap();

    // Still on the old stream until its key frame arrives.
    assert_eq!(consumer.current_layers().unwrap().spatial_layer, 2);

    consumer
        .send_rtp_packet(&vp8_packet(111, 51, 9100, true), &info(0, true))
        .await;
    let layers = consumer.current_layers().unwrap();
    assert_eq!(layers.spatial_layer, 0);
    assert_eq!(layers.temporal_layer, Some(0));
}

#[tokio::test]
async fn paused_consumer_forwards_nothing() {
    let (_shared, _producer, consumer) = build().await;

    let request = ChannelRequest {
        id: 1,
        method: Method::ConsumerPause,
        handler_id: "C1".into(),
        data: serde_json::Value::Null,
    };
    use crate::channel::registrator::ChannelRequestHandler;
    consumer.handle_channel_request(&request).await.unwrap();

    consumer
        .send_rtp_packet(&vp8_packet(333, 11, 2000, true), &info(2, true))
        .await;
    assert_eq!(consumer.current_layers(), None);
}

#[tokio::test]
async fn producer_pause_gates_forwarding() {
    let (_shared, _producer, consumer) = build().await;

    consumer.producer_pause_changed(true).await;
    assert!(!consumer.is_active());

    consumer
        .send_rtp_packet(&vp8_packet(333, 11, 2000, true), &info(2, true))
        .await;
    assert_eq!(consumer.current_layers(), None);

    consumer.producer_pause_changed(false).await;
    assert!(consumer.is_active());
}
