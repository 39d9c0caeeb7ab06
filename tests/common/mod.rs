//! Test-side control plane: drives a worker over in-memory duplex channels
//! the way the real supervisor drives it over pipes.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};

use sfu::message::codec::{
    self, TAG_LOG_DEBUG, TAG_LOG_ERROR, TAG_LOG_WARN, TAG_NOTIFICATION, TAG_RESPONSE,
};
use sfu::message::{
    ChannelFrame, ChannelNotification, ChannelRequest, ChannelResponse, Method, PayloadFrame,
    PayloadNotification, ResponseResult,
};
use sfu::settings::WorkerSettings;
use sfu::worker::Worker;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestClient {
    worker: Arc<Worker>,
    pub control_writer: Mutex<WriteHalf<DuplexStream>>,
    payload_writer: Mutex<WriteHalf<DuplexStream>>,
    responses: Mutex<mpsc::UnboundedReceiver<ChannelResponse>>,
    notifications: Mutex<mpsc::UnboundedReceiver<ChannelNotification>>,
    payload_responses: Mutex<mpsc::UnboundedReceiver<ChannelResponse>>,
    payload_notifications: Mutex<mpsc::UnboundedReceiver<PayloadNotification>>,
    next_id: AtomicU32,
}

impl TestClient {
    pub async fn start() -> Arc<TestClient> {
        TestClient::start_with_settings(WorkerSettings::default()).await
    }

    pub async fn start_with_settings(settings: WorkerSettings) -> Arc<TestClient> {
        let _ = env_logger::builder().is_test(true).try_init();

        let (control_worker, control_client) = tokio::io::duplex(1024 * 1024);
        let (payload_worker, payload_client) = tokio::io::duplex(1024 * 1024);

        let (control_worker_read, control_worker_write) = tokio::io::split(control_worker);
        let (payload_worker_read, payload_worker_write) = tokio::io::split(payload_worker);

        let worker =
            Worker::new(settings, control_worker_write, payload_worker_write).expect("worker");
        {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                let _ = worker.run(control_worker_read, payload_worker_read).await;
            });
        }

        let (control_client_read, control_client_write) = tokio::io::split(control_client);
        let (payload_client_read, payload_client_write) = tokio::io::split(payload_client);

        let (response_tx, responses) = mpsc::unbounded_channel();
        let (notification_tx, notifications) = mpsc::unbounded_channel();
        tokio::spawn(control_read_loop(
            control_client_read,
            response_tx,
            notification_tx,
        ));

        let (payload_response_tx, payload_responses) = mpsc::unbounded_channel();
        let (payload_notification_tx, payload_notifications) = mpsc::unbounded_channel();
        tokio::spawn(payload_read_loop(
            payload_client_read,
            payload_response_tx,
            payload_notification_tx,
        ));

        Arc::new(TestClient {
            worker,
            control_writer: Mutex::new(control_client_write),
            payload_writer: Mutex::new(payload_client_write),
            responses: Mutex::new(responses),
            notifications: Mutex::new(notifications),
            payload_responses: Mutex::new(payload_responses),
            payload_notifications: Mutex::new(payload_notifications),
            next_id: AtomicU32::new(1),
        })
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Send one request and await its response.
    pub async fn request(&self, method: Method, handler_id: &str, data: Value) -> ResponseResult {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = ChannelRequest {
            id,
            method,
            handler_id: handler_id.to_string(),
            data,
        };
        let frame = codec::frame(codec::encode_request(&request)).expect("encode");
        self.control_writer
            .lock()
            .await
            .write_all(&frame)
            .await
            .expect("write request");

        let response = tokio::time::timeout(TIMEOUT, async {
            loop {
                let response = self
                    .responses
                    .lock()
                    .await
                    .recv()
                    .await
                    .expect("response channel alive");
                if response.id == id {
                    return response;
                }
            }
        })
        .await
        .expect("response in time");

        response.result
    }

    /// Send a request expected to be accepted; returns its body.
    pub async fn request_ok(&self, method: Method, handler_id: &str, data: Value) -> Option<Value> {
        match self.request(method, handler_id, data).await {
            ResponseResult::Accepted(body) => body,
            ResponseResult::Rejected { kind, reason } => {
                panic!("request {method} rejected: [{}] {reason}", kind.as_str())
            }
        }
    }

    /// Try to send a request after shutdown; Err when the channel is gone.
    pub async fn try_send_request(&self, method: Method, handler_id: &str) -> std::io::Result<()> {
        let request = ChannelRequest {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            method,
            handler_id: handler_id.to_string(),
            data: Value::Null,
        };
        let frame = codec::frame(codec::encode_request(&request)).expect("encode");
        self.control_writer.lock().await.write_all(&frame).await
    }

    /// Emit a payload channel notification towards the worker.
    pub async fn notify_payload(&self, target_id: &str, event: &str, data: Value, payload: Bytes) {
        let notification = PayloadNotification {
            target_id: target_id.to_string(),
            event: event.to_string(),
            data,
            payload,
        };
        let frame =
            codec::frame(codec::encode_payload_notification(&notification)).expect("encode");
        self.payload_writer
            .lock()
            .await
            .write_all(&frame)
            .await
            .expect("write payload notification");
    }

    /// Round-trip a payload request so everything previously written to the
    /// payload channel has been processed. The request targets a handler
    /// that does not exist; the rejection is the synchronization point.
    pub async fn payload_sync(&self) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = sfu::message::PayloadRequest {
            request: ChannelRequest {
                id,
                method: Method::TransportDump,
                handler_id: "payload-sync".to_string(),
                data: Value::Null,
            },
            payload: Bytes::new(),
        };
        let frame = codec::frame(codec::encode_payload_request(&request)).expect("encode");
        self.payload_writer
            .lock()
            .await
            .write_all(&frame)
            .await
            .expect("write payload request");

        tokio::time::timeout(TIMEOUT, async {
            loop {
                let response = self
                    .payload_responses
                    .lock()
                    .await
                    .recv()
                    .await
                    .expect("payload response channel alive");
                if response.id == id {
                    return;
                }
            }
        })
        .await
        .expect("payload sync in time");
    }

    /// Await the next control notification matching the filter.
    pub async fn wait_notification<F>(&self, mut filter: F) -> ChannelNotification
    where
        F: FnMut(&ChannelNotification) -> bool,
    {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                let notification = self
                    .notifications
                    .lock()
                    .await
                    .recv()
                    .await
                    .expect("notification channel alive");
                if filter(&notification) {
                    return notification;
                }
            }
        })
        .await
        .expect("notification in time")
    }

    /// Await the next payload notification matching the filter.
    pub async fn wait_payload_notification<F>(&self, mut filter: F) -> PayloadNotification
    where
        F: FnMut(&PayloadNotification) -> bool,
    {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                let notification = self
                    .payload_notifications
                    .lock()
                    .await
                    .recv()
                    .await
                    .expect("payload notification channel alive");
                if filter(&notification) {
                    return notification;
                }
            }
        })
        .await
        .expect("payload notification in time")
    }

    /// True when no payload notification matching the filter shows up within
    /// the given window.
    pub async fn expect_no_payload_notification<F>(&self, mut filter: F, window: Duration) -> bool
    where
        F: FnMut(&PayloadNotification) -> bool,
    {
        let result = tokio::time::timeout(window, async {
            loop {
                let notification = self
                    .payload_notifications
                    .lock()
                    .await
                    .recv()
                    .await
                    .expect("payload notification channel alive");
                if filter(&notification) {
                    return notification;
                }
            }
        })
        .await;
        result.is_err()
    }

    /// Await the control channel reaching EOF (worker closed its writer).
    pub async fn wait_control_eof(&self) {
        tokio::time::timeout(TIMEOUT, async {
            let mut responses = self.responses.lock().await;
            while responses.recv().await.is_some() {}
        })
        .await
        .expect("control channel EOF in time");
    }
}

async fn control_read_loop(
    mut reader: ReadHalf<DuplexStream>,
    responses: mpsc::UnboundedSender<ChannelResponse>,
    notifications: mpsc::UnboundedSender<ChannelNotification>,
) {
    while let Some(frame) = read_frame(&mut reader).await {
        match frame.first() {
            Some(&TAG_RESPONSE) => {
                if let Ok(ChannelFrame::Response(response)) = codec::decode_channel_frame(frame) {
                    let _ = responses.send(response);
                }
            }
            Some(&TAG_NOTIFICATION) => {
                if let Ok(ChannelFrame::Notification(notification)) =
                    codec::decode_channel_frame(frame)
                {
                    let _ = notifications.send(notification);
                }
            }
            Some(&TAG_LOG_DEBUG) | Some(&TAG_LOG_WARN) | Some(&TAG_LOG_ERROR) => {}
            _ => {}
        }
    }
}

async fn payload_read_loop(
    mut reader: ReadHalf<DuplexStream>,
    responses: mpsc::UnboundedSender<ChannelResponse>,
    notifications: mpsc::UnboundedSender<PayloadNotification>,
) {
    while let Some(frame) = read_frame(&mut reader).await {
        match frame.first() {
            Some(&TAG_RESPONSE) => {
                if let Ok(ChannelFrame::Response(response)) = codec::decode_channel_frame(frame) {
                    let _ = responses.send(response);
                }
            }
            Some(&TAG_NOTIFICATION) => {
                if let Ok(PayloadFrame::Notification(notification)) =
                    codec::decode_payload_frame(frame)
                {
                    let _ = notifications.send(notification);
                }
            }
            _ => {}
        }
    }
}

async fn read_frame(reader: &mut ReadHalf<DuplexStream>) -> Option<Bytes> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.ok()?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = BytesMut::with_capacity(len);
    body.resize(len, 0);
    reader.read_exact(&mut body).await.ok()?;
    Some(body.freeze())
}
