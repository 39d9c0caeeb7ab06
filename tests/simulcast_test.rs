mod common;

use bytes::{Bytes, BytesMut};
use serde_json::json;

use sfu::message::Method;

use common::TestClient;

const SSRC_LOW: u32 = 111;
const SSRC_MID: u32 = 222;
const SSRC_HIGH: u32 = 333;

fn simulcast_producer_params() -> serde_json::Value {
    json!({
        "codecs": [{
            "mimeType": "video/VP8",
            "payloadType": 101,
            "clockRate": 90000,
            "rtcpFeedback": [
                { "type": "nack" },
                { "type": "nack", "parameter": "pli" },
                { "type": "ccm", "parameter": "fir" }
            ],
        }],
        "encodings": [
            { "ssrc": SSRC_LOW, "scalabilityMode": "L1T3" },
            { "ssrc": SSRC_MID, "scalabilityMode": "L1T3" },
            { "ssrc": SSRC_HIGH, "scalabilityMode": "L1T3" }
        ],
        "rtcp": { "cname": "cam1" },
    })
}

fn simulcast_consumer_params() -> serde_json::Value {
    json!({
        "codecs": [{
            "mimeType": "video/VP8",
            "payloadType": 101,
            "clockRate": 90000,
            "rtcpFeedback": [
                { "type": "nack" },
                { "type": "nack", "parameter": "pli" }
            ],
        }],
        "encodings": [{ "ssrc": 9999 }],
        "rtcp": { "cname": "view1" },
    })
}

/// A VP8 RTP packet; `key_frame` drives the P bit of the frame tag.
fn vp8_packet(ssrc: u32, seq: u16, timestamp: u32, key_frame: bool) -> Bytes {
    let mut packet = BytesMut::new();
    packet.extend_from_slice(&[0x80, 101, 0, 0]);
    packet[2..4].copy_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&timestamp.to_be_bytes());
    packet.extend_from_slice(&ssrc.to_be_bytes());
    // VP8 payload descriptor (S=1, PID=0) + frame tag.
    packet.extend_from_slice(&[0x10, if key_frame { 0x00 } else { 0x01 }, 0x9d, 0x01, 0x2a]);
    packet.extend_from_slice(&[0xEE; 64]);
    packet.freeze()
}

async fn setup(client: &TestClient) {
    client
        .request_ok(Method::WorkerCreateRouter, "", json!({ "routerId": "R1" }))
        .await;
    client
        .request_ok(
            Method::RouterCreateDirectTransport,
            "R1",
            json!({ "transportId": "T1" }),
        )
        .await;
    client
        .request_ok(
            Method::RouterCreateDirectTransport,
            "R1",
            json!({ "transportId": "T2" }),
        )
        .await;

    let produce = client
        .request_ok(
            Method::TransportProduce,
            "T1",
            json!({
                "producerId": "P1",
                "kind": "video",
                "rtpParameters": simulcast_producer_params(),
            }),
        )
        .await
        .expect("produce body");
    assert_eq!(produce["type"], "simulcast");

    // Make all three spatial streams known before consuming.
    for (index, ssrc) in [SSRC_LOW, SSRC_MID, SSRC_HIGH].iter().enumerate() {
        for seq in 0..3u16 {
            let base = (index as u16) * 100;
            client
                .notify_payload(
                    "P1",
                    "producer.send",
                    serde_json::Value::Null,
                    vp8_packet(*ssrc, base + seq, u32::from(base + seq) * 3000, seq == 0),
                )
                .await;
        }
    }
    client.payload_sync().await;

    client
        .request_ok(
            Method::TransportConsume,
            "T2",
            json!({
                "consumerId": "C1",
                "producerId": "P1",
                "kind": "video",
                "rtpParameters": simulcast_consumer_params(),
                "type": "simulcast",
                "consumableRtpEncodings": simulcast_producer_params()["encodings"],
                "preferredLayers": { "spatialLayer": 0, "temporalLayer": 0 },
            }),
        )
        .await;

    // A fresh video consumer asks upstream for a key frame right away;
    // drain that request so each test starts clean.
    client
        .wait_payload_notification(|n| n.target_id == "T1" && n.event == "rtcp")
        .await;
}

#[tokio::test]
async fn layer_promotion_on_key_frame() {
    let client = TestClient::start().await;
    setup(&client).await;

    // Commit the initial low layer with its key frame.
    client
        .notify_payload(
            "P1",
            "producer.send",
            serde_json::Value::Null,
            vp8_packet(SSRC_LOW, 10, 30000, true),
        )
        .await;
    let change = client
        .wait_notification(|n| n.target_id == "C1" && n.event == "layerschange")
        .await;
    assert_eq!(change.data["spatialLayer"], 0);
    let low_forwarded = client
        .wait_payload_notification(|n| n.target_id == "C1" && n.event == "rtp")
        .await;
    let low_seq = u16::from_be_bytes([low_forwarded.payload[2], low_forwarded.payload[3]]);

    // Ask for the top layer: a key frame request must go upstream for the
    // high stream's SSRC before anything switches.
    let preferred = client
        .request_ok(
            Method::ConsumerSetPreferredLayers,
            "C1",
            json!({ "spatialLayer": 2, "temporalLayer": 2 }),
        )
        .await
        .expect("preferred layers body");
    assert_eq!(preferred["spatialLayer"], 2);

    let upstream = client
        .wait_payload_notification(|n| n.target_id == "T1" && n.event == "rtcp")
        .await;
    // PLI: PT 206, FMT 1, media SSRC at bytes 8..12.
    assert_eq!(upstream.payload[1], 206);
    let media_ssrc = u32::from_be_bytes([
        upstream.payload[8],
        upstream.payload[9],
        upstream.payload[10],
        upstream.payload[11],
    ]);
    assert_eq!(media_ssrc, SSRC_HIGH);

    // Mid-stream inter frames of the high layer must not commit anything.
    client
        .notify_payload(
            "P1",
            "producer.send",
            serde_json::Value::Null,
            vp8_packet(SSRC_HIGH, 210, 91000, false),
        )
        .await;

    // The key frame commits the switch and emits exactly one layerschange.
    client
        .notify_payload(
            "P1",
            "producer.send",
            serde_json::Value::Null,
            vp8_packet(SSRC_HIGH, 211, 92000, true),
        )
        .await;

    let change = client
        .wait_notification(|n| n.target_id == "C1" && n.event == "layerschange")
        .await;
    assert_eq!(change.data["spatialLayer"], 2);
    assert_eq!(change.data["temporalLayer"], 2);

    // The first packet of the new stream continues the rewritten sequence
    // space with no gap.
    let high_forwarded = client
        .wait_payload_notification(|n| n.target_id == "C1" && n.event == "rtp")
        .await;
    let high_seq = u16::from_be_bytes([high_forwarded.payload[2], high_forwarded.payload[3]]);
    assert_eq!(high_seq, low_seq.wrapping_add(1));

    // Rewritten SSRC is the consumer's.
    let out_ssrc = u32::from_be_bytes([
        high_forwarded.payload[8],
        high_forwarded.payload[9],
        high_forwarded.payload[10],
        high_forwarded.payload[11],
    ]);
    assert_eq!(out_ssrc, 9999);
}

#[tokio::test]
async fn packets_from_non_current_layers_not_forwarded() {
    let client = TestClient::start().await;
    setup(&client).await;

    client
        .notify_payload(
            "P1",
            "producer.send",
            serde_json::Value::Null,
            vp8_packet(SSRC_LOW, 10, 30000, true),
        )
        .await;
    client
        .wait_payload_notification(|n| n.target_id == "C1" && n.event == "rtp")
        .await;

    // High-layer traffic while preferring the low layer: dropped.
    client
        .notify_payload(
            "P1",
            "producer.send",
            serde_json::Value::Null,
            vp8_packet(SSRC_HIGH, 300, 95000, false),
        )
        .await;
    assert!(
        client
            .expect_no_payload_notification(
                |n| n.target_id == "C1" && n.event == "rtp",
                std::time::Duration::from_millis(300),
            )
            .await
    );
}

#[tokio::test]
async fn consumer_request_key_frame_reaches_producer() {
    let client = TestClient::start().await;
    setup(&client).await;

    // Deliver the pending key frame first; a new request while one is in
    // flight for the same SSRC is deduplicated away.
    client
        .notify_payload(
            "P1",
            "producer.send",
            serde_json::Value::Null,
            vp8_packet(SSRC_LOW, 10, 30000, true),
        )
        .await;
    client
        .wait_payload_notification(|n| n.target_id == "C1" && n.event == "rtp")
        .await;

    client
        .request_ok(Method::ConsumerRequestKeyFrame, "C1", serde_json::Value::Null)
        .await;

    let upstream = client
        .wait_payload_notification(|n| n.target_id == "T1" && n.event == "rtcp")
        .await;
    assert_eq!(upstream.payload[1], 206);
    let media_ssrc = u32::from_be_bytes([
        upstream.payload[8],
        upstream.payload[9],
        upstream.payload[10],
        upstream.payload[11],
    ]);
    assert_eq!(media_ssrc, SSRC_LOW);
}
