mod common;

use bytes::{Bytes, BytesMut};
use serde_json::json;

use sfu::error::WireErrorKind;
use sfu::message::{Method, ResponseResult};

use common::TestClient;

async fn setup_router(client: &TestClient) {
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
}

fn audio_producer_params() -> serde_json::Value {
    json!({
        "codecs": [{
            "mimeType": "audio/opus",
            "payloadType": 100,
            "clockRate": 48000,
            "channels": 2,
        }],
        "encodings": [{ "ssrc": 1111 }],
        "rtcp": { "cname": "producer-cname" },
    })
}

fn audio_consumer_params() -> serde_json::Value {
    // Same SSRC and payload type: the rewrite is the identity and bytes
    // cross the worker untouched.
    json!({
        "codecs": [{
            "mimeType": "audio/opus",
            "payloadType": 100,
            "clockRate": 48000,
            "channels": 2,
        }],
        "encodings": [{ "ssrc": 1111 }],
        "rtcp": { "cname": "consumer-cname" },
    })
}

/// A valid RTP packet with the given total size.
fn rtp_packet(ssrc: u32, seq: u16, timestamp: u32, total_len: usize) -> Bytes {
    let mut packet = BytesMut::with_capacity(total_len);
    packet.extend_from_slice(&[0x80, 100, 0, 0]);
    packet[2..4].copy_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&timestamp.to_be_bytes());
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet.resize(total_len, 0xAB);
    packet.freeze()
}

#[tokio::test]
async fn consume_of_absent_producer_rejected() {
    let client = TestClient::start().await;
    setup_router(&client).await;

    match client
        .request(
            Method::TransportConsume,
            "T1",
            json!({
                "consumerId": "C1",
                "producerId": "P-missing",
                "kind": "audio",
                "rtpParameters": audio_consumer_params(),
                "type": "simple",
            }),
        )
        .await
    {
        ResponseResult::Rejected { kind, reason } => {
            assert_eq!(kind, WireErrorKind::Error);
            assert_eq!(reason, "Producer not found");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn direct_rtp_pass_through() {
    let client = TestClient::start().await;
    setup_router(&client).await;

    let produce = client
        .request_ok(
            Method::TransportProduce,
            "T1",
            json!({
                "producerId": "P1",
                "kind": "audio",
                "rtpParameters": audio_producer_params(),
            }),
        )
        .await
        .expect("produce body");
    assert_eq!(produce["type"], "simple");

    client
        .request_ok(
            Method::TransportConsume,
            "T2",
            json!({
                "consumerId": "C1",
                "producerId": "P1",
                "kind": "audio",
                "rtpParameters": audio_consumer_params(),
                "type": "simple",
            }),
        )
        .await;

    let packet = rtp_packet(1111, 7, 160, 200);
    client
        .notify_payload("P1", "producer.send", serde_json::Value::Null, packet.clone())
        .await;

    let forwarded = client
        .wait_payload_notification(|n| n.target_id == "C1" && n.event == "rtp")
        .await;
    assert_eq!(forwarded.payload, packet, "bytes must cross unmodified");

    // DataSent on the consuming transport grew by exactly the packet size.
    let stats = client
        .request_ok(Method::TransportGetStats, "T2", serde_json::Value::Null)
        .await
        .expect("stats body");
    assert_eq!(stats[0]["bytesSent"], 200);

    let stats = client
        .request_ok(Method::TransportGetStats, "T1", serde_json::Value::Null)
        .await
        .expect("stats body");
    assert_eq!(stats[0]["bytesReceived"], 200);
}

#[tokio::test]
async fn paused_producer_forwards_nothing() {
    let client = TestClient::start().await;
    setup_router(&client).await;

    client
        .request_ok(
            Method::TransportProduce,
            "T1",
            json!({
                "producerId": "P1",
                "kind": "audio",
                "rtpParameters": audio_producer_params(),
            }),
        )
        .await;
    client
        .request_ok(
            Method::TransportConsume,
            "T2",
            json!({
                "consumerId": "C1",
                "producerId": "P1",
                "kind": "audio",
                "rtpParameters": audio_consumer_params(),
                "type": "simple",
            }),
        )
        .await;

    client
        .request_ok(Method::ProducerPause, "P1", serde_json::Value::Null)
        .await;
    client
        .wait_notification(|n| n.target_id == "C1" && n.event == "producerpause")
        .await;

    client
        .notify_payload(
            "P1",
            "producer.send",
            serde_json::Value::Null,
            rtp_packet(1111, 8, 320, 200),
        )
        .await;
    assert!(
        client
            .expect_no_payload_notification(
                |n| n.target_id == "C1" && n.event == "rtp",
                std::time::Duration::from_millis(300),
            )
            .await,
        "paused producer must not forward"
    );

    // Resume and verify forwarding returns.
    client
        .request_ok(Method::ProducerResume, "P1", serde_json::Value::Null)
        .await;
    client
        .wait_notification(|n| n.target_id == "C1" && n.event == "producerresume")
        .await;

    client
        .notify_payload(
            "P1",
            "producer.send",
            serde_json::Value::Null,
            rtp_packet(1111, 9, 480, 200),
        )
        .await;
    client
        .wait_payload_notification(|n| n.target_id == "C1" && n.event == "rtp")
        .await;
}

#[tokio::test]
async fn oversized_rtcp_dropped_silently() {
    let client = TestClient::start().await;
    setup_router(&client).await;

    // MtuSize + 100 is the acceptance bound; go past it.
    let oversized = Bytes::from(vec![0x80u8; 1700]);
    client
        .notify_payload("T1", "transport.sendRtcp", serde_json::Value::Null, oversized)
        .await;

    // Notifications have no response; the worker just keeps serving.
    let dump = client
        .request_ok(Method::TransportDump, "T1", serde_json::Value::Null)
        .await
        .expect("dump body");
    assert_eq!(dump["id"], "T1");
}

#[tokio::test]
async fn producer_close_closes_consumers() {
    let client = TestClient::start().await;
    setup_router(&client).await;

    client
        .request_ok(
            Method::TransportProduce,
            "T1",
            json!({
                "producerId": "P1",
                "kind": "audio",
                "rtpParameters": audio_producer_params(),
            }),
        )
        .await;
    client
        .request_ok(
            Method::TransportConsume,
            "T2",
            json!({
                "consumerId": "C1",
                "producerId": "P1",
                "kind": "audio",
                "rtpParameters": audio_consumer_params(),
                "type": "simple",
            }),
        )
        .await;

    client
        .request_ok(
            Method::TransportCloseProducer,
            "T1",
            json!({ "producerId": "P1" }),
        )
        .await;

    client
        .wait_notification(|n| n.target_id == "C1" && n.event == "producerclose")
        .await;

    // The consumer's handler id is gone.
    match client
        .request(Method::ConsumerDump, "C1", serde_json::Value::Null)
        .await
    {
        ResponseResult::Rejected { kind, .. } => assert_eq!(kind, WireErrorKind::NotFound),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn direct_data_message_pass_through() {
    let client = TestClient::start().await;
    setup_router(&client).await;

    client
        .request_ok(
            Method::TransportProduceData,
            "T1",
            json!({
                "dataProducerId": "DP1",
                "type": "direct",
                "label": "chat",
                "protocol": "",
            }),
        )
        .await;
    client
        .request_ok(
            Method::TransportConsumeData,
            "T2",
            json!({
                "dataConsumerId": "DC1",
                "dataProducerId": "DP1",
                "type": "direct",
                "label": "chat",
                "protocol": "",
            }),
        )
        .await;

    let message = Bytes::from_static(b"hello there");
    client
        .notify_payload("DP1", "dataProducer.send", json!({ "ppid": 51 }), message.clone())
        .await;

    let forwarded = client
        .wait_payload_notification(|n| n.target_id == "DC1" && n.event == "message")
        .await;
    assert_eq!(forwarded.payload, message);
    assert_eq!(forwarded.data["ppid"], 51);
}
