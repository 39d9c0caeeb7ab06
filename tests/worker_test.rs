mod common;

use serde_json::json;

use sfu::error::WireErrorKind;
use sfu::message::{Method, ResponseResult};

use common::TestClient;

#[tokio::test]
async fn router_lifecycle() {
    let client = TestClient::start().await;

    client
        .request_ok(Method::WorkerCreateRouter, "", json!({ "routerId": "R1" }))
        .await;

    let dump = client
        .request_ok(Method::WorkerDump, "", serde_json::Value::Null)
        .await
        .expect("dump body");
    assert_eq!(dump["routerIds"], json!(["R1"]));

    client
        .request_ok(Method::WorkerCloseRouter, "", json!({ "routerId": "R1" }))
        .await;

    let dump = client
        .request_ok(Method::WorkerDump, "", serde_json::Value::Null)
        .await
        .expect("dump body");
    assert_eq!(dump["routerIds"], json!([]));
}

#[tokio::test]
async fn duplicate_router_id_rejected() {
    let client = TestClient::start().await;

    client
        .request_ok(Method::WorkerCreateRouter, "", json!({ "routerId": "R1" }))
        .await;

    match client
        .request(Method::WorkerCreateRouter, "", json!({ "routerId": "R1" }))
        .await
    {
        ResponseResult::Rejected { kind, reason } => {
            assert_eq!(kind, WireErrorKind::Error);
            assert_eq!(reason, "a Router with same routerId already exists");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn dump_lists_registered_handlers() {
    let client = TestClient::start().await;

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

    let dump = client
        .request_ok(Method::WorkerDump, "", serde_json::Value::Null)
        .await
        .expect("dump body");
    let handlers = dump["channelMessageHandlers"]["channelRequestHandlers"]
        .as_array()
        .expect("handler list");
    assert!(handlers.contains(&json!("R1")));
    assert!(handlers.contains(&json!("T1")));

    // Closing the router must leave no dangling registration behind.
    client
        .request_ok(Method::WorkerCloseRouter, "", json!({ "routerId": "R1" }))
        .await;
    let dump = client
        .request_ok(Method::WorkerDump, "", serde_json::Value::Null)
        .await
        .expect("dump body");
    let handlers = dump["channelMessageHandlers"]["channelRequestHandlers"]
        .as_array()
        .expect("handler list");
    assert!(handlers.is_empty());
}

#[tokio::test]
async fn unknown_handler_id_rejected_not_found() {
    let client = TestClient::start().await;

    match client
        .request(Method::TransportDump, "nope", serde_json::Value::Null)
        .await
    {
        ResponseResult::Rejected { kind, .. } => {
            assert_eq!(kind, WireErrorKind::NotFound);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn update_settings() {
    let client = TestClient::start().await;

    client
        .request_ok(
            Method::WorkerUpdateSettings,
            "",
            json!({ "logLevel": "warn", "logTags": ["ice", "rtp"] }),
        )
        .await;

    match client
        .request(
            Method::WorkerUpdateSettings,
            "",
            json!({ "logLevel": "chicken" }),
        )
        .await
    {
        ResponseResult::Rejected { kind, .. } => assert_eq!(kind, WireErrorKind::Type),
        other => panic!("expected TypeError, got {other:?}"),
    }
}

#[tokio::test]
async fn resource_usage_reports_counters() {
    let client = TestClient::start().await;

    let usage = client
        .request_ok(Method::WorkerGetResourceUsage, "", serde_json::Value::Null)
        .await
        .expect("resource usage body");
    assert!(usage.get("ru_utime").is_some());
    assert!(usage.get("ru_maxrss").is_some());
    assert!(usage.get("ru_nvcsw").is_some());
}

#[tokio::test]
async fn legacy_textual_request_accepted() {
    let client = TestClient::start().await;

    // Older control planes send `r{id}:{method}:{handlerId}:{json}`.
    let raw = b"r77:worker.createRouter:undefined:{\"routerId\":\"RL\"}";
    let mut frame = Vec::with_capacity(4 + raw.len());
    frame.extend_from_slice(&(raw.len() as u32).to_le_bytes());
    frame.extend_from_slice(raw);
    {
        use tokio::io::AsyncWriteExt;
        let mut writer = client.control_writer.lock().await;
        writer.write_all(&frame).await.unwrap();
    }

    let dump = client
        .request_ok(Method::WorkerDump, "", serde_json::Value::Null)
        .await
        .expect("dump body");
    assert_eq!(dump["routerIds"], json!(["RL"]));
}

#[tokio::test]
async fn graceful_shutdown() {
    let client = TestClient::start().await;

    client
        .request_ok(Method::WorkerCreateRouter, "", json!({ "routerId": "R1" }))
        .await;

    // The close request is answered, then the channels shut down.
    client
        .request_ok(Method::WorkerClose, "", serde_json::Value::Null)
        .await;

    client.wait_control_eof().await;
    assert!(client.worker().closed());

    // Writes on the control channel now fail (possibly after the buffered
    // bytes are discarded by the closed peer).
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let mut failed = false;
    for _ in 0..64 {
        if client
            .try_send_request(Method::WorkerDump, "")
            .await
            .is_err()
        {
            failed = true;
            break;
        }
    }
    assert!(failed, "writes should fail after shutdown");
}
