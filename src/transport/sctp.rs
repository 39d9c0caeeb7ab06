//! SCTP association lifecycle for data channels.
//!
//! The association runs over the carrying transport's DTLS connection.
//! Streams are opened on demand per data consumer and accepted as they
//! appear for data producers; the DCEP negotiation itself happens out of
//! band through the control plane.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use sctp::association::{Association, Config};
use sctp::chunk::chunk_payload_data::PayloadProtocolIdentifier;
use sctp::stream::{ReliabilityType, Stream};
use tokio::sync::Mutex;
use util::conn::Conn;

use crate::error::{Error, Result};
use crate::rtp_parameters::{SctpParameters, SctpStreamParameters};

use super::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SctpState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl SctpState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SctpState::New => "new",
            SctpState::Connecting => "connecting",
            SctpState::Connected => "connected",
            SctpState::Failed => "failed",
            SctpState::Closed => "closed",
        }
    }
}

pub struct SctpAssociation {
    parameters: SctpParameters,
    association: Mutex<Option<Arc<Association>>>,
    streams: Mutex<HashMap<u16, Arc<Stream>>>,
    state: std::sync::Mutex<SctpState>,
    closed: AtomicBool,
}

impl SctpAssociation {
    pub(crate) fn new(parameters: SctpParameters) -> Arc<SctpAssociation> {
        Arc::new(SctpAssociation {
            parameters,
            association: Mutex::new(None),
            streams: Mutex::new(HashMap::new()),
            state: std::sync::Mutex::new(SctpState::New),
            closed: AtomicBool::new(false),
        })
    }

    pub fn parameters(&self) -> SctpParameters {
        self.parameters
    }

    pub fn state(&self) -> SctpState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, transport: &Transport, state: SctpState) {
        {
            let mut current = self.state.lock().unwrap();
            if *current == state {
                return;
            }
            *current = state;
        }
        transport.shared.notifier.emit_with_data(
            transport.id(),
            "sctpstatechange",
            serde_json::json!({ "sctpState": state.as_str() }),
        );
    }

    /// Run the server side of the association over the given connection and
    /// start accepting inbound streams. Called once the carrying transport
    /// is connected.
    pub(crate) async fn run(
        self: Arc<Self>,
        conn: Arc<dyn Conn + Send + Sync>,
        transport: &Arc<Transport>,
    ) {
        self.set_state(transport, SctpState::Connecting);

        let association = match Association::server(Config {
            net_conn: conn,
            max_receive_buffer_size: 0,
            max_message_size: self.parameters.max_message_size,
            name: String::new(),
        })
        .await
        {
            Ok(association) => Arc::new(association),
            Err(err) => {
                log::warn!("SCTP association failed: {err}");
                self.set_state(transport, SctpState::Failed);
                return;
            }
        };

        *self.association.lock().await = Some(Arc::clone(&association));
        self.set_state(transport, SctpState::Connected);

        // Accept inbound streams and feed their messages to the matching
        // data producers.
        let weak_transport = Arc::downgrade(transport);
        let weak_self = Arc::downgrade(&self);
        tokio::spawn(async move {
            while let Some(stream) = association.accept_stream().await {
                let Some(sctp) = weak_self.upgrade() else {
                    return;
                };
                let stream_id = stream.stream_identifier();
                sctp.streams.lock().await.insert(stream_id, Arc::clone(&stream));

                let weak_transport = weak_transport.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 65536];
                    loop {
                        let (n, ppid) = match stream.read_sctp(&mut buf).await {
                            Ok((0, _)) => return,
                            Ok(result) => result,
                            Err(_) => return,
                        };
                        let Some(transport) = weak_transport.upgrade() else {
                            return;
                        };
                        transport.add_data_received(n);

                        let data_producer = transport.data_producer_by_stream_id(stream_id);
                        if let Some(data_producer) = data_producer {
                            data_producer
                                .receive_message(ppid as u32, Bytes::copy_from_slice(&buf[..n]))
                                .await;
                        }
                    }
                });
            }
        });
    }

    /// Send one message on the given outgoing stream, opening it on first
    /// use with the consumer's partial-reliability parameters.
    pub(crate) async fn send(&self, stream_id: u16, ppid: u32, payload: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrClosed("SctpAssociation"));
        }

        let stream = self.get_or_open_stream(stream_id, None).await?;
        stream
            .write_sctp(&payload, ppid_of(ppid))
            .await
            .map_err(Error::Sctp)?;
        Ok(())
    }

    pub(crate) async fn open_stream_for(
        &self,
        params: &SctpStreamParameters,
    ) -> Result<()> {
        self.get_or_open_stream(params.stream_id, Some(params)).await?;
        Ok(())
    }

    async fn get_or_open_stream(
        &self,
        stream_id: u16,
        params: Option<&SctpStreamParameters>,
    ) -> Result<Arc<Stream>> {
        if let Some(stream) = self.streams.lock().await.get(&stream_id) {
            return Ok(Arc::clone(stream));
        }

        let association = self.association.lock().await.clone();
        let Some(association) = association else {
            return Err(Error::other("SCTP association not established"));
        };

        let stream = association
            .open_stream(stream_id, PayloadProtocolIdentifier::Binary)
            .await
            .map_err(Error::Sctp)?;

        if let Some(params) = params {
            let (rel_type, rel_val) = match (params.max_retransmits, params.max_packet_life_time) {
                (Some(rexmit), _) => (ReliabilityType::Rexmit, u32::from(rexmit)),
                (None, Some(lifetime)) => (ReliabilityType::Timed, u32::from(lifetime)),
                (None, None) => (ReliabilityType::Reliable, 0),
            };
            stream.set_reliability_params(!params.ordered, rel_type, rel_val);
        }

        self.streams
            .lock()
            .await
            .insert(stream_id, Arc::clone(&stream));
        Ok(stream)
    }

    /// Arm the buffered-amount-low watermark on an outgoing stream; the
    /// notification goes straight to the data consumer's handler id.
    pub(crate) async fn watch_buffered_amount_low(
        &self,
        stream_id: u16,
        threshold: usize,
        notifier: crate::channel::notifier::Notifier,
        target_id: String,
    ) {
        let stream = self.streams.lock().await.get(&stream_id).cloned();
        let Some(stream) = stream else {
            return;
        };
        stream.set_buffered_amount_low_threshold(threshold);
        stream.on_buffered_amount_low(Box::new(move || {
            notifier.emit(&target_id, "bufferedamountlow");
            Box::pin(async {})
        }));
    }

    pub(crate) fn buffered_amount(&self, stream_id: u16) -> u64 {
        // Sync accessor used by dataConsumer.getBufferedAmount; a missing
        // stream simply reports zero.
        match self.streams.try_lock() {
            Ok(streams) => streams
                .get(&stream_id)
                .map(|s| s.buffered_amount() as u64)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let association = self.association.lock().await.take();
        if let Some(association) = association {
            let _ = association.close().await;
        }
        self.streams.lock().await.clear();
        *self.state.lock().unwrap() = SctpState::Closed;
    }
}

fn ppid_of(ppid: u32) -> PayloadProtocolIdentifier {
    match ppid {
        50 => PayloadProtocolIdentifier::Dcep,
        51 => PayloadProtocolIdentifier::String,
        53 => PayloadProtocolIdentifier::Binary,
        56 => PayloadProtocolIdentifier::StringEmpty,
        57 => PayloadProtocolIdentifier::BinaryEmpty,
        _ => PayloadProtocolIdentifier::Binary,
    }
}
