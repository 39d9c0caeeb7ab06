pub mod logger;
pub mod notifier;
pub mod registrator;

#[cfg(test)]
mod registrator_test;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::message::codec;
use crate::message::{ChannelNotification, ChannelResponse, PayloadNotification};
use crate::settings::WorkerSettings;

use notifier::{Notifier, PayloadNotifier};
use registrator::MessageRegistrator;

/// Facilities shared by every object in the worker graph.
pub struct Shared {
    pub registrator: MessageRegistrator,
    pub notifier: Notifier,
    pub payload_notifier: PayloadNotifier,
    pub settings: std::sync::Mutex<WorkerSettings>,
}

impl Shared {
    pub fn new(
        channel: &Channel,
        payload_channel: &PayloadChannel,
        settings: WorkerSettings,
    ) -> Arc<Shared> {
        Arc::new(Shared {
            registrator: MessageRegistrator::new(),
            notifier: Notifier::new(channel.sender()),
            payload_notifier: PayloadNotifier::new(payload_channel.sender()),
            settings: std::sync::Mutex::new(settings),
        })
    }
}

/// Write half of the control channel. Frames are queued on an unbounded
/// sender and flushed by a dedicated task so that per-packet paths never
/// block on channel backpressure.
pub struct Channel {
    tx: mpsc::UnboundedSender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl Channel {
    pub fn new<W>(writer: W) -> Channel
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_loop(writer, rx, Arc::clone(&closed)));

        Channel { tx, closed }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Bytes> {
        self.tx.clone()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue a response frame. Responses are encoded in handling order, which
    /// preserves the request order on the wire.
    pub fn respond(&self, response: &ChannelResponse) -> Result<()> {
        let frame = codec::frame(codec::encode_response(response))?;
        self.send(frame)
    }

    pub fn notify(&self, notification: &ChannelNotification) -> Result<()> {
        let frame = codec::frame(codec::encode_notification(notification))?;
        self.send(frame)
    }

    fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed() {
            return Err(Error::ErrChannelClosed);
        }
        self.tx.send(frame).map_err(|_| Error::ErrChannelClosed)
    }

    /// Stop accepting frames and let the writer drain what is queued, then
    /// shut the stream down.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Bytes::new());
        }
    }
}

/// Write half of the payload channel.
pub struct PayloadChannel {
    tx: mpsc::UnboundedSender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl PayloadChannel {
    pub fn new<W>(writer: W) -> PayloadChannel
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_loop(writer, rx, Arc::clone(&closed)));

        PayloadChannel { tx, closed }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Bytes> {
        self.tx.clone()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn respond(&self, response: &ChannelResponse) -> Result<()> {
        let frame = codec::frame(codec::encode_response(response))?;
        self.send(frame)
    }

    pub fn notify(&self, notification: &PayloadNotification) -> Result<()> {
        let frame = codec::frame(codec::encode_payload_notification(notification))?;
        self.send(frame)
    }

    fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed() {
            return Err(Error::ErrChannelClosed);
        }
        self.tx.send(frame).map_err(|_| Error::ErrChannelClosed)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Bytes::new());
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(frame) = rx.recv().await {
        // Empty frame: drain sentinel queued by close().
        if frame.is_empty() {
            break;
        }
        if let Err(err) = writer.write_all(&frame).await {
            log::debug!("channel writer ended: {err}");
            break;
        }
    }

    closed.store(true, Ordering::SeqCst);
    let _ = writer.shutdown().await;
}

/// Read one length-delimited frame body. `Ok(None)` signals a clean EOF.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    codec::check_frame_len(len)?;

    let mut body = BytesMut::with_capacity(len);
    body.resize(len, 0);
    reader.read_exact(&mut body).await?;

    Ok(Some(body.freeze()))
}
