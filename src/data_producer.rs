//! DataProducer: inbound message stream with PPID preservation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::channel::registrator::{
    ChannelRequestHandler, PayloadNotificationHandler, PayloadRequestHandler,
};
use crate::channel::Shared;
use crate::error::{Error, Result};
use crate::message::{ChannelRequest, Method, PayloadNotification, PayloadRequest};
use crate::rtp_parameters::SctpStreamParameters;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataProducerType {
    Sctp,
    Direct,
}

pub struct DataProducer {
    id: String,
    data_type: DataProducerType,
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: String,
    protocol: String,
    paused: AtomicBool,
    closed: AtomicBool,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    shared: Arc<Shared>,
    pub(crate) transport: Weak<Transport>,
}

impl DataProducer {
    pub(crate) fn new(
        id: String,
        data_type: DataProducerType,
        sctp_stream_parameters: Option<SctpStreamParameters>,
        label: String,
        protocol: String,
        shared: Arc<Shared>,
        transport: Weak<Transport>,
    ) -> Result<Arc<DataProducer>> {
        if data_type == DataProducerType::Sctp {
            let params = sctp_stream_parameters
                .ok_or_else(|| Error::type_error("missing sctpStreamParameters"))?;
            if params.max_packet_life_time.is_some() && params.max_retransmits.is_some() {
                return Err(Error::type_error(
                    "cannot provide both maxPacketLifeTime and maxRetransmits",
                ));
            }
        }

        let data_producer = Arc::new(DataProducer {
            id: id.clone(),
            data_type,
            sctp_stream_parameters,
            label,
            protocol,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            shared: Arc::clone(&shared),
            transport,
        });

        shared.registrator.register(
            &id,
            Arc::downgrade(&data_producer) as Weak<dyn ChannelRequestHandler>,
            Some(Arc::downgrade(&data_producer) as Weak<dyn PayloadRequestHandler>),
            Some(Arc::downgrade(&data_producer) as Weak<dyn PayloadNotificationHandler>),
        )?;

        Ok(data_producer)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data_type(&self) -> DataProducerType {
        self.data_type
    }

    pub fn sctp_stream_parameters(&self) -> Option<SctpStreamParameters> {
        self.sctp_stream_parameters
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn stream_id(&self) -> Option<u16> {
        self.sctp_stream_parameters.map(|p| p.stream_id)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// One message from the network (SCTP) or payload channel (direct).
    pub(crate) async fn receive_message(&self, ppid: u32, payload: bytes::Bytes) {
        if self.closed() || self.paused() {
            return;
        }

        self.messages_received.fetch_add(1, Ordering::SeqCst);
        self.bytes_received
            .fetch_add(payload.len() as u64, Ordering::SeqCst);

        let router = self.transport.upgrade().and_then(|t| t.router.upgrade());
        if let Some(router) = router {
            router.route_data_message(&self.id, ppid, payload).await;
        }
    }

    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.registrator.unregister(&self.id);
    }

    pub(crate) async fn transport_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.registrator.unregister(&self.id);
        let router = self.transport.upgrade().and_then(|t| t.router.upgrade());
        if let Some(router) = router {
            router.data_producer_closed(&self.id).await;
        }
    }

    fn dump(&self) -> Value {
        json!({
            "id": self.id,
            "type": self.data_type,
            "sctpStreamParameters": self.sctp_stream_parameters,
            "label": self.label,
            "protocol": self.protocol,
            "paused": self.paused(),
        })
    }

    fn get_stats(&self) -> Value {
        json!([{
            "type": "data-producer",
            "label": self.label,
            "protocol": self.protocol,
            "messagesReceived": self.messages_received.load(Ordering::SeqCst),
            "bytesReceived": self.bytes_received.load(Ordering::SeqCst),
        }])
    }
}

#[async_trait]
impl ChannelRequestHandler for DataProducer {
    async fn handle_channel_request(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        if self.closed() {
            return Err(Error::ErrClosed("DataProducer"));
        }

        match request.method {
            Method::DataProducerDump => Ok(Some(self.dump())),
            Method::DataProducerGetStats => Ok(Some(self.get_stats())),
            Method::DataProducerPause => {
                self.paused.store(true, Ordering::SeqCst);
                Ok(None)
            }
            Method::DataProducerResume => {
                self.paused.store(false, Ordering::SeqCst);
                Ok(None)
            }
            _ => Err(Error::type_error(format!(
                "unknown method \"{}\" for a DataProducer",
                request.method
            ))),
        }
    }
}

#[async_trait]
impl PayloadRequestHandler for DataProducer {
    async fn handle_payload_request(&self, request: &PayloadRequest) -> Result<Option<Value>> {
        Err(Error::type_error(format!(
            "unknown payload method \"{}\" for a DataProducer",
            request.request.method
        )))
    }
}

#[async_trait]
impl PayloadNotificationHandler for DataProducer {
    async fn handle_payload_notification(&self, notification: PayloadNotification) -> Result<()> {
        match notification.event.as_str() {
            // Direct transport message injection: `{ ppid }` + raw payload.
            "dataProducer.send" => {
                let ppid = notification
                    .data
                    .get("ppid")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(53) as u32;

                if let Some(transport) = self.transport.upgrade() {
                    transport.add_data_received(notification.payload.len());
                }
                self.receive_message(ppid, notification.payload).await;
                Ok(())
            }
            event => {
                log::warn!("unknown payload notification event \"{event}\" for a DataProducer");
                Ok(())
            }
        }
    }
}
