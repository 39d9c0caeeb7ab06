//! DataConsumer: outbound message stream with PPID preservation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::channel::registrator::{ChannelRequestHandler, PayloadRequestHandler};
use crate::channel::Shared;
use crate::data_producer::DataProducerType;
use crate::error::{Error, Result};
use crate::message::{ChannelRequest, Method, PayloadRequest};
use crate::rtp_parameters::SctpStreamParameters;
use crate::transport::Transport;

pub struct DataConsumer {
    id: String,
    data_producer_id: String,
    data_type: DataProducerType,
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: String,
    protocol: String,
    paused: AtomicBool,
    closed: AtomicBool,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    buffered_amount_low_threshold: AtomicU64,
    shared: Arc<Shared>,
    pub(crate) transport: Weak<Transport>,
}

impl DataConsumer {
    pub(crate) fn new(
        id: String,
        data_producer_id: String,
        data_type: DataProducerType,
        sctp_stream_parameters: Option<SctpStreamParameters>,
        label: String,
        protocol: String,
        shared: Arc<Shared>,
        transport: Weak<Transport>,
    ) -> Result<Arc<DataConsumer>> {
        if data_type == DataProducerType::Sctp && sctp_stream_parameters.is_none() {
            return Err(Error::type_error("missing sctpStreamParameters"));
        }

        let data_consumer = Arc::new(DataConsumer {
            id: id.clone(),
            data_producer_id,
            data_type,
            sctp_stream_parameters,
            label,
            protocol,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            buffered_amount_low_threshold: AtomicU64::new(0),
            shared: Arc::clone(&shared),
            transport,
        });

        shared.registrator.register(
            &id,
            Arc::downgrade(&data_consumer) as Weak<dyn ChannelRequestHandler>,
            Some(Arc::downgrade(&data_consumer) as Weak<dyn PayloadRequestHandler>),
            None,
        )?;

        Ok(data_consumer)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data_producer_id(&self) -> &str {
        &self.data_producer_id
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

    pub fn stream_id(&self) -> u16 {
        self.sctp_stream_parameters
            .map(|p| p.stream_id)
            .unwrap_or(0)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Forward one message from the linked data producer.
    pub(crate) async fn send_message(&self, ppid: u32, payload: bytes::Bytes) {
        if self.closed() || self.paused() {
            return;
        }

        let Some(transport) = self.transport.upgrade() else {
            return;
        };

        let len = payload.len();
        match transport.send_data_message(self, ppid, payload).await {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::SeqCst);
                self.bytes_sent.fetch_add(len as u64, Ordering::SeqCst);
            }
            Err(err) => {
                log::debug!("cannot send message [dataConsumerId:{}]: {err}", self.id);
            }
        }
    }

    /// The linked data producer is gone.
    pub(crate) async fn data_producer_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.registrator.unregister(&self.id);
        self.shared.notifier.emit(&self.id, "dataproducerclose");
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_data_consumer(&self.id);
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
            router
                .unlink_data_consumer(&self.data_producer_id, &self.id)
                .await;
        }
    }

    fn dump(&self) -> Value {
        json!({
            "id": self.id,
            "dataProducerId": self.data_producer_id,
            "type": self.data_type,
            "sctpStreamParameters": self.sctp_stream_parameters,
            "label": self.label,
            "protocol": self.protocol,
            "paused": self.paused(),
            "bufferedAmountLowThreshold": self.buffered_amount_low_threshold.load(Ordering::SeqCst),
        })
    }

    fn get_stats(&self) -> Value {
        json!([{
            "type": "data-consumer",
            "label": self.label,
            "protocol": self.protocol,
            "messagesSent": self.messages_sent.load(Ordering::SeqCst),
            "bytesSent": self.bytes_sent.load(Ordering::SeqCst),
        }])
    }

    fn buffered_amount(&self) -> u64 {
        let transport = self.transport.upgrade();
        match (transport, &self.sctp_stream_parameters) {
            (Some(transport), Some(params)) => transport
                .sctp
                .as_ref()
                .map(|sctp| sctp.buffered_amount(params.stream_id))
                .unwrap_or(0),
            _ => 0,
        }
    }
}

#[async_trait]
impl ChannelRequestHandler for DataConsumer {
    async fn handle_channel_request(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        if self.closed() {
            return Err(Error::ErrClosed("DataConsumer"));
        }

        match request.method {
            Method::DataConsumerDump => Ok(Some(self.dump())),
            Method::DataConsumerGetStats => Ok(Some(self.get_stats())),
            Method::DataConsumerPause => {
                self.paused.store(true, Ordering::SeqCst);
                Ok(None)
            }
            Method::DataConsumerResume => {
                self.paused.store(false, Ordering::SeqCst);
                Ok(None)
            }
            Method::DataConsumerGetBufferedAmount => {
                Ok(Some(json!({ "bufferedAmount": self.buffered_amount() })))
            }
            Method::DataConsumerSetBufferedAmountLowThreshold => {
                let threshold = request
                    .data
                    .get("threshold")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| Error::type_error("missing threshold"))?;
                self.buffered_amount_low_threshold
                    .store(threshold, Ordering::SeqCst);

                if let (Some(transport), Some(params)) =
                    (self.transport.upgrade(), self.sctp_stream_parameters)
                {
                    if let Some(sctp) = &transport.sctp {
                        sctp.watch_buffered_amount_low(
                            params.stream_id,
                            threshold as usize,
                            self.shared.notifier.clone(),
                            self.id.clone(),
                        )
                        .await;
                    }
                }
                Ok(None)
            }
            _ => Err(Error::type_error(format!(
                "unknown method \"{}\" for a DataConsumer",
                request.method
            ))),
        }
    }
}

#[async_trait]
impl PayloadRequestHandler for DataConsumer {
    async fn handle_payload_request(&self, request: &PayloadRequest) -> Result<Option<Value>> {
        Err(Error::type_error(format!(
            "unknown payload method \"{}\" for a DataConsumer",
            request.request.method
        )))
    }
}
