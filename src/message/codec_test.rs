use bytes::Bytes;
use serde_json::{json, Value};

use crate::error::WireErrorKind;

use super::codec::*;
use super::*;

#[test]
fn request_round_trip() {
    let request = ChannelRequest {
        id: 42,
        method: Method::WorkerCreateRouter,
        handler_id: String::new(),
        data: json!({ "routerId": "R1" }),
    };

    let encoded = encode_request(&request).freeze();
    let decoded = decode_channel_frame(encoded).unwrap();

    assert_eq!(decoded, ChannelFrame::Request(request));
}

#[test]
fn rejected_response_round_trip() {
    let response = ChannelResponse {
        id: 7,
        result: ResponseResult::Rejected {
            kind: WireErrorKind::NotFound,
            reason: "handler with ID abc not found".into(),
        },
    };

    let encoded = encode_response(&response).freeze();
    let decoded = decode_channel_frame(encoded).unwrap();

    assert_eq!(decoded, ChannelFrame::Response(response));
}

#[test]
fn legacy_textual_request() {
    let raw = Bytes::from_static(b"r3:worker.createRouter:undefined:{\"routerId\":\"R9\"}");
    let decoded = decode_channel_frame(raw).unwrap();

    match decoded {
        ChannelFrame::Request(request) => {
            assert_eq!(request.id, 3);
            assert_eq!(request.method, Method::WorkerCreateRouter);
            assert!(request.handler_id.is_empty());
            assert_eq!(request.data["routerId"], "R9");
        }
        other => panic!("expected request, got {other:?}"),
    }
}

#[test]
fn legacy_unknown_method_rejected() {
    let raw = Bytes::from_static(b"r3:worker.fly:undefined:null");
    assert!(decode_channel_frame(raw).is_err());
}

#[test]
fn payload_notification_round_trip() {
    let notification = PayloadNotification {
        target_id: "P1".into(),
        event: "rtp".into(),
        data: Value::Null,
        payload: Bytes::from_static(&[0x80, 0x60, 0x00, 0x01]),
    };

    let encoded = encode_payload_notification(&notification).freeze();
    let decoded = decode_payload_frame(encoded).unwrap();

    assert_eq!(decoded, PayloadFrame::Notification(notification));
}

#[test]
fn method_table_is_bijective() {
    for id in 0x0101u16..0x0A00 {
        if let Some(method) = Method::from_id(id) {
            assert_eq!(method.id(), id);
            assert_eq!(Method::from_name(method.as_str()), Some(method));
        }
    }
}

#[test]
fn worker_methods_classified() {
    assert!(Method::WorkerDump.is_worker_method());
    assert!(!Method::TransportProduce.is_worker_method());
}

#[test]
fn truncated_frame_is_error() {
    let mut encoded = encode_request(&ChannelRequest {
        id: 1,
        method: Method::WorkerDump,
        handler_id: String::new(),
        data: Value::Null,
    });
    encoded.truncate(encoded.len() - 2);
    assert!(decode_channel_frame(encoded.freeze()).is_err());
}
