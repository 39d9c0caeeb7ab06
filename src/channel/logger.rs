//! `log` sink that forwards worker records to the control plane.
//!
//! Records travel on the control channel as length-delimited frames whose
//! first byte is a log tag (`D`, `W`, `E`) followed by the utf-8 message,
//! the same framing the channel uses for structured messages.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use log::{Level, Log, Metadata, Record};
use tokio::sync::mpsc;

use crate::message::codec::{TAG_LOG_DEBUG, TAG_LOG_ERROR, TAG_LOG_WARN};
use crate::settings::LogLevel;

use super::Shared;

pub struct ChannelLogger {
    tx: mpsc::UnboundedSender<Bytes>,
    shared: Arc<Shared>,
}

impl ChannelLogger {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>, shared: Arc<Shared>) -> ChannelLogger {
        ChannelLogger { tx, shared }
    }

    fn active_level(&self) -> LogLevel {
        self.shared.settings.lock().unwrap().log_level
    }
}

impl Log for ChannelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        let level = self.active_level();
        match metadata.level() {
            Level::Error => level >= LogLevel::Error,
            Level::Warn => level >= LogLevel::Warn,
            _ => level >= LogLevel::Debug,
        }
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let tag = match record.level() {
            Level::Error => TAG_LOG_ERROR,
            Level::Warn => TAG_LOG_WARN,
            _ => TAG_LOG_DEBUG,
        };

        let text = format!("{}", record.args());
        let mut frame = BytesMut::with_capacity(5 + text.len());
        frame.put_u32_le((1 + text.len()) as u32);
        frame.put_u8(tag);
        frame.put_slice(text.as_bytes());

        let _ = self.tx.send(frame.freeze());
    }

    fn flush(&self) {}
}
