use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::message::codec;
use crate::message::{ChannelNotification, PayloadNotification};

/// One-way emission of typed events to the control plane, keyed by the
/// target object's handler id. Emission after channel close is silently
/// dropped: notifications have no response and the worker is already on its
/// way down.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Notifier {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Bytes>) -> Notifier {
        Notifier { tx }
    }

    pub fn emit(&self, target_id: &str, event: &str) {
        self.emit_with_data(target_id, event, Value::Null);
    }

    pub fn emit_with_data(&self, target_id: &str, event: &str, data: Value) {
        let notification = ChannelNotification {
            target_id: target_id.to_string(),
            event: event.to_string(),
            data,
        };
        match codec::frame(codec::encode_notification(&notification)) {
            Ok(frame) => {
                if self.tx.send(frame).is_err() {
                    log::debug!("notifier: channel closed, dropping \"{event}\"");
                }
            }
            Err(err) => {
                log::warn!("notifier: cannot encode \"{event}\": {err}");
            }
        }
    }
}

/// One-way emission of events carrying a raw binary payload.
#[derive(Clone)]
pub struct PayloadNotifier {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl PayloadNotifier {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Bytes>) -> PayloadNotifier {
        PayloadNotifier { tx }
    }

    pub fn emit(&self, target_id: &str, event: &str, data: Value, payload: Bytes) {
        let notification = PayloadNotification {
            target_id: target_id.to_string(),
            event: event.to_string(),
            data,
            payload,
        };
        match codec::frame(codec::encode_payload_notification(&notification)) {
            Ok(frame) => {
                if self.tx.send(frame).is_err() {
                    log::debug!("payload notifier: channel closed, dropping \"{event}\"");
                }
            }
            Err(err) => {
                log::warn!("payload notifier: cannot encode \"{event}\": {err}");
            }
        }
    }
}
