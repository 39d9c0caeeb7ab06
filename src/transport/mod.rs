pub mod direct;
pub mod ice_server;
pub mod pipe;
pub mod plain;
pub mod sctp;
pub mod webrtc;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use util::marshal::{Marshal, Unmarshal};

use crate::bwe::TransportBwe;
use crate::channel::registrator::{
    ChannelRequestHandler, PayloadNotificationHandler, PayloadRequestHandler,
};
use crate::channel::Shared;
use crate::consumer::{Consumer, ConsumerLayers, ConsumerType};
use crate::data_consumer::DataConsumer;
use crate::data_producer::{DataProducer, DataProducerType};
use crate::error::{Error, Result};
use crate::message::{ChannelRequest, Method, PayloadNotification, PayloadRequest};
use crate::producer::Producer;
use crate::router::Router;
use crate::rtp_parameters::{MediaKind, RtpEncodingParameters, RtpParameters, SctpStreamParameters};
use crate::MAX_RTCP_LEN;

pub use sctp::SctpAssociation;

/// Named trace event classes a transport can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceEventType {
    Probation,
    Bwe,
    Keyframe,
    Rtp,
    Pli,
    Fir,
}

/// Maps inbound RTP to producers by SSRC, MID and RID.
#[derive(Default)]
pub(crate) struct RtpListener {
    ssrc_table: HashMap<u32, String>,
    mid_table: HashMap<String, String>,
    rid_table: HashMap<String, String>,
}

impl RtpListener {
    /// Claim the producer's routing keys, failing on any conflict without
    /// mutating the tables.
    pub(crate) fn add_producer(&mut self, producer: &Producer) -> Result<()> {
        let params = producer.rtp_parameters();

        let mut ssrcs = Vec::new();
        for encoding in &params.encodings {
            if let Some(ssrc) = encoding.ssrc {
                ssrcs.push(ssrc);
            }
            if let Some(rtx) = &encoding.rtx {
                ssrcs.push(rtx.ssrc);
            }
        }

        for ssrc in &ssrcs {
            if self.ssrc_table.contains_key(ssrc) {
                return Err(Error::other(format!("ssrc {ssrc} already exists in RTP listener")));
            }
        }
        if let Some(mid) = &params.mid {
            if self.mid_table.contains_key(mid) {
                return Err(Error::other(format!("mid \"{mid}\" already exists in RTP listener")));
            }
        }
        for encoding in &params.encodings {
            if let Some(rid) = &encoding.rid {
                if self.rid_table.contains_key(rid) {
                    return Err(Error::other(format!(
                        "rid \"{rid}\" already exists in RTP listener"
                    )));
                }
            }
        }

        for ssrc in ssrcs {
            self.ssrc_table.insert(ssrc, producer.id().to_string());
        }
        if let Some(mid) = &params.mid {
            self.mid_table.insert(mid.clone(), producer.id().to_string());
        }
        for encoding in &params.encodings {
            if let Some(rid) = &encoding.rid {
                self.rid_table.insert(rid.clone(), producer.id().to_string());
            }
        }
        Ok(())
    }

    pub(crate) fn remove_producer(&mut self, producer_id: &str) {
        self.ssrc_table.retain(|_, id| id != producer_id);
        self.mid_table.retain(|_, id| id != producer_id);
        self.rid_table.retain(|_, id| id != producer_id);
    }

    /// Learn an SSRC → producer mapping discovered through RID routing.
    pub(crate) fn learn_ssrc(&mut self, ssrc: u32, producer_id: &str) {
        self.ssrc_table.entry(ssrc).or_insert_with(|| producer_id.to_string());
    }

    pub(crate) fn producer_id_for(
        &self,
        ssrc: u32,
        mid: Option<&str>,
        rid: Option<&str>,
    ) -> Option<&String> {
        if let Some(id) = self.ssrc_table.get(&ssrc) {
            return Some(id);
        }
        if let Some(rid) = rid {
            if let Some(id) = self.rid_table.get(rid) {
                return Some(id);
            }
        }
        if let Some(mid) = mid {
            if let Some(id) = self.mid_table.get(mid) {
                return Some(id);
            }
        }
        None
    }
}

/// Collapses duplicate key frame requests per SSRC within a configurable
/// window before they reach the producer's upstream.
pub(crate) struct KeyFrameRequestManager {
    delay_ms: u32,
    last_request: Mutex<HashMap<u32, Instant>>,
}

impl KeyFrameRequestManager {
    pub(crate) fn new(delay_ms: u32) -> KeyFrameRequestManager {
        KeyFrameRequestManager {
            delay_ms,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    /// True when a request for this SSRC should go upstream now.
    pub(crate) fn request(&self, ssrc: u32, now: Instant) -> bool {
        let mut last_request = self.last_request.lock().unwrap();
        if let Some(at) = last_request.get(&ssrc) {
            if now.saturating_duration_since(*at).as_millis() < u128::from(self.delay_ms.max(1)) {
                return false;
            }
        }
        last_request.insert(ssrc, now);
        true
    }

    pub(crate) fn key_frame_received(&self, ssrc: u32) {
        self.last_request.lock().unwrap().remove(&ssrc);
    }
}

/// The transport's network personality: a closed set of four kinds.
pub(crate) enum TransportKind {
    WebRtc(webrtc::WebRtcTransport),
    Plain(plain::PlainTransport),
    Pipe(pipe::PipeTransport),
    Direct(direct::DirectTransport),
}

impl TransportKind {
    pub(crate) fn type_str(&self) -> &'static str {
        match self {
            TransportKind::WebRtc(_) => "webrtc-transport",
            TransportKind::Plain(_) => "plain-transport",
            TransportKind::Pipe(_) => "pipe-transport",
            TransportKind::Direct(_) => "direct-transport",
        }
    }

    fn is_direct(&self) -> bool {
        matches!(self, TransportKind::Direct(_))
    }

    pub(crate) fn is_pipe(&self) -> bool {
        matches!(self, TransportKind::Pipe(_))
    }
}

/// Common contract for any transport: produce, consume, dataProduce,
/// dataConsume, bitrate accounting, key frame request coalescing and
/// feedback dispatch. The network side is delegated to [`TransportKind`].
pub struct Transport {
    id: String,
    pub(crate) shared: Arc<Shared>,
    pub(crate) router: Weak<Router>,
    pub(crate) weak_self: Weak<Transport>,
    pub(crate) kind: TransportKind,
    closed: AtomicBool,

    producers: Mutex<HashMap<String, Arc<Producer>>>,
    consumers: Mutex<HashMap<String, Arc<Consumer>>>,
    data_producers: Mutex<HashMap<String, Arc<DataProducer>>>,
    data_consumers: Mutex<HashMap<String, Arc<DataConsumer>>>,
    pub(crate) rtp_listener: Mutex<RtpListener>,
    pub(crate) sctp: Option<Arc<SctpAssociation>>,

    data_sent: AtomicU64,
    data_received: AtomicU64,
    max_incoming_bitrate: AtomicU32,
    max_outgoing_bitrate: AtomicU32,
    min_outgoing_bitrate: AtomicU32,
    trace_event_types: Mutex<HashSet<TraceEventType>>,
    pub(crate) keyframe_manager: KeyFrameRequestManager,
    pub(crate) bwe: TransportBwe,
}

impl Transport {
    pub(crate) fn new(
        id: String,
        shared: Arc<Shared>,
        router: Weak<Router>,
        kind: TransportKind,
        sctp: Option<Arc<SctpAssociation>>,
    ) -> Result<Arc<Transport>> {
        let (key_frame_request_delay, alpha) = {
            let settings = shared.settings.lock().unwrap();
            (
                settings.key_frame_request_delay,
                settings.available_bitrate_smoothing_factor,
            )
        };

        let transport = Arc::new_cyclic(|weak_self| Transport {
            id: id.clone(),
            shared: Arc::clone(&shared),
            router,
            weak_self: weak_self.clone(),
            kind,
            closed: AtomicBool::new(false),
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            data_producers: Mutex::new(HashMap::new()),
            data_consumers: Mutex::new(HashMap::new()),
            rtp_listener: Mutex::new(RtpListener::default()),
            sctp,
            data_sent: AtomicU64::new(0),
            data_received: AtomicU64::new(0),
            max_incoming_bitrate: AtomicU32::new(0),
            max_outgoing_bitrate: AtomicU32::new(0),
            min_outgoing_bitrate: AtomicU32::new(0),
            trace_event_types: Mutex::new(HashSet::new()),
            keyframe_manager: KeyFrameRequestManager::new(key_frame_request_delay),
            bwe: TransportBwe::new(alpha),
        });

        let channel_handler: Weak<dyn ChannelRequestHandler> =
            Arc::downgrade(&transport) as Weak<dyn ChannelRequestHandler>;
        let payload_request: Weak<dyn PayloadRequestHandler> =
            Arc::downgrade(&transport) as Weak<dyn PayloadRequestHandler>;
        let payload_notification: Weak<dyn PayloadNotificationHandler> =
            Arc::downgrade(&transport) as Weak<dyn PayloadNotificationHandler>;

        shared.registrator.register(
            &id,
            channel_handler,
            Some(payload_request),
            Some(payload_notification),
        )?;

        Ok(transport)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn data_sent(&self) -> u64 {
        self.data_sent.load(Ordering::SeqCst)
    }

    pub fn data_received(&self) -> u64 {
        self.data_received.load(Ordering::SeqCst)
    }

    pub(crate) fn add_data_sent(&self, len: usize) {
        self.data_sent.fetch_add(len as u64, Ordering::SeqCst);
    }

    pub(crate) fn add_data_received(&self, len: usize) {
        self.data_received.fetch_add(len as u64, Ordering::SeqCst);
    }

    pub(crate) fn trace_enabled(&self, event: TraceEventType) -> bool {
        self.trace_event_types.lock().unwrap().contains(&event)
    }

    pub(crate) fn emit_trace(&self, event: TraceEventType, direction: &str, info: Value) {
        if !self.trace_enabled(event) {
            return;
        }
        let event_name = match event {
            TraceEventType::Probation => "probation",
            TraceEventType::Bwe => "bwe",
            TraceEventType::Keyframe => "keyframe",
            TraceEventType::Rtp => "rtp",
            TraceEventType::Pli => "pli",
            TraceEventType::Fir => "fir",
        };
        self.shared.notifier.emit_with_data(
            &self.id,
            "trace",
            json!({ "type": event_name, "direction": direction, "info": info }),
        );
    }

    /// Whether the network side can carry packets right now.
    pub(crate) fn is_connected(&self) -> bool {
        match &self.kind {
            TransportKind::WebRtc(t) => t.is_connected(),
            TransportKind::Plain(t) => t.is_connected(),
            TransportKind::Pipe(t) => t.is_connected(),
            TransportKind::Direct(_) => true,
        }
    }

    /// Orderly close: children first, then the network side, then the
    /// handler registration. Safe to call more than once.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let producers: Vec<Arc<Producer>> =
            self.producers.lock().unwrap().drain().map(|(_, p)| p).collect();
        for producer in producers {
            producer.transport_closed().await;
        }

        let consumers: Vec<Arc<Consumer>> =
            self.consumers.lock().unwrap().drain().map(|(_, c)| c).collect();
        for consumer in consumers {
            consumer.transport_closed().await;
        }

        let data_producers: Vec<Arc<DataProducer>> =
            self.data_producers.lock().unwrap().drain().map(|(_, p)| p).collect();
        for data_producer in data_producers {
            data_producer.transport_closed().await;
        }

        let data_consumers: Vec<Arc<DataConsumer>> =
            self.data_consumers.lock().unwrap().drain().map(|(_, c)| c).collect();
        for data_consumer in data_consumers {
            data_consumer.transport_closed().await;
        }

        if let Some(sctp) = &self.sctp {
            sctp.close().await;
        }

        match &self.kind {
            TransportKind::WebRtc(t) => t.close().await,
            TransportKind::Plain(t) => t.close().await,
            TransportKind::Pipe(t) => t.close().await,
            TransportKind::Direct(_) => {}
        }

        self.shared.registrator.unregister(&self.id);
        log::debug!("Transport closed [id:{}]", self.id);
    }

    pub(crate) fn get_producer(&self, id: &str) -> Option<Arc<Producer>> {
        self.producers.lock().unwrap().get(id).cloned()
    }

    pub(crate) fn get_consumer(&self, id: &str) -> Option<Arc<Consumer>> {
        self.consumers.lock().unwrap().get(id).cloned()
    }

    pub(crate) fn consumers_snapshot(&self) -> Vec<Arc<Consumer>> {
        self.consumers.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn remove_producer(&self, id: &str) {
        self.producers.lock().unwrap().remove(id);
        self.rtp_listener.lock().unwrap().remove_producer(id);
    }

    pub(crate) fn remove_consumer(&self, id: &str) {
        self.consumers.lock().unwrap().remove(id);
    }

    pub(crate) fn data_producer_by_stream_id(&self, stream_id: u16) -> Option<Arc<DataProducer>> {
        self.data_producers
            .lock()
            .unwrap()
            .values()
            .find(|p| p.stream_id() == Some(stream_id))
            .cloned()
    }

    pub(crate) fn remove_data_producer(&self, id: &str) {
        self.data_producers.lock().unwrap().remove(id);
    }

    pub(crate) fn remove_data_consumer(&self, id: &str) {
        self.data_consumers.lock().unwrap().remove(id);
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Bytes from the network side, already decrypted and deframed.
    pub(crate) async fn receive_rtp_packet(&self, data: &[u8]) {
        self.add_data_received(data.len());

        let mut buf = data;
        let packet = match rtp::packet::Packet::unmarshal(&mut buf) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("received data is not a valid RTP packet: {err}");
                return;
            }
        };

        let producer = {
            let listener = self.rtp_listener.lock().unwrap();
            // MID/RID live in header extensions whose ids are defined by the
            // producer's own parameters; resolution by SSRC is the fast path.
            let producer_id = listener
                .producer_id_for(packet.header.ssrc, None, None)
                .cloned();
            drop(listener);
            match producer_id {
                Some(id) => self.get_producer(&id),
                None => self.find_producer_by_extensions(&packet),
            }
        };

        let Some(producer) = producer else {
            log::warn!(
                "no Producer found for received RTP packet [ssrc:{}]",
                packet.header.ssrc
            );
            return;
        };

        {
            let mut listener = self.rtp_listener.lock().unwrap();
            listener.learn_ssrc(packet.header.ssrc, producer.id());
        }

        producer.receive_rtp_packet(packet, data.len()).await;
    }

    fn find_producer_by_extensions(&self, packet: &rtp::packet::Packet) -> Option<Arc<Producer>> {
        let producers: Vec<Arc<Producer>> =
            self.producers.lock().unwrap().values().cloned().collect();

        for producer in producers {
            let params = producer.rtp_parameters();
            let mid = params
                .header_extension_id(crate::rtp_parameters::EXT_URI_MID)
                .and_then(|id| packet.header.get_extension(id))
                .and_then(|raw| String::from_utf8(raw.to_vec()).ok());
            let rid = params
                .header_extension_id(crate::rtp_parameters::EXT_URI_RID)
                .and_then(|id| packet.header.get_extension(id))
                .and_then(|raw| String::from_utf8(raw.to_vec()).ok());

            let listener = self.rtp_listener.lock().unwrap();
            if let Some(id) = listener.producer_id_for(0, mid.as_deref(), rid.as_deref()) {
                if id == producer.id() {
                    return Some(Arc::clone(&producer));
                }
            }
        }
        None
    }

    /// RTCP from the network side: compound parse, then dispatch per packet.
    pub(crate) async fn receive_rtcp_packet(&self, data: &[u8]) {
        let mut buf = data;
        let packets = match rtcp::packet::unmarshal(&mut buf) {
            Ok(packets) => packets,
            Err(err) => {
                log::warn!("received data is not a valid RTCP compound or single packet: {err}");
                return;
            }
        };

        let now = Instant::now();
        for packet in packets {
            self.handle_rtcp(packet.as_ref(), now).await;
        }
    }

    async fn handle_rtcp(&self, packet: &(dyn rtcp::packet::Packet + Send + Sync), now: Instant) {
        use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
        use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
        use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
        use rtcp::receiver_report::ReceiverReport;
        use rtcp::sender_report::SenderReport;
        use rtcp::transport_feedbacks::transport_layer_cc::TransportLayerCc;
        use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;

        let any = packet.as_any();

        if let Some(pli) = any.downcast_ref::<PictureLossIndication>() {
            if let Some(consumer) = self.find_consumer_by_media_ssrc(pli.media_ssrc) {
                self.emit_trace(TraceEventType::Pli, "in", json!({ "ssrc": pli.media_ssrc }));
                consumer.receive_key_frame_request(now).await;
            }
        } else if let Some(fir) = any.downcast_ref::<FullIntraRequest>() {
            for entry in &fir.fir {
                if let Some(consumer) = self.find_consumer_by_media_ssrc(entry.ssrc) {
                    self.emit_trace(TraceEventType::Fir, "in", json!({ "ssrc": entry.ssrc }));
                    consumer.receive_key_frame_request(now).await;
                }
            }
        } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
            if let Some(available) = self.bwe.on_remb(remb.bitrate, now) {
                self.emit_trace(
                    TraceEventType::Bwe,
                    "in",
                    json!({ "availableBitrate": available, "source": "remb" }),
                );
                self.recompute_outgoing_allocation(now).await;
            }
        } else if let Some(tcc) = any.downcast_ref::<TransportLayerCc>() {
            let send_bitrate = self.current_send_bitrate(now);
            if let Some(available) = self.bwe.on_transport_feedback(tcc, send_bitrate, now) {
                self.emit_trace(
                    TraceEventType::Bwe,
                    "in",
                    json!({ "availableBitrate": available, "source": "tcc" }),
                );
                self.recompute_outgoing_allocation(now).await;
            }
        } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
            if let Some(consumer) = self.find_consumer_by_media_ssrc(nack.media_ssrc) {
                consumer.receive_nack(nack, now).await;
            }
        } else if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
            for report in &rr.reports {
                if let Some(consumer) = self.find_consumer_by_media_ssrc(report.ssrc) {
                    consumer.receive_reception_report(report).await;
                }
            }
        } else if let Some(sr) = any.downcast_ref::<SenderReport>() {
            let producer = {
                let listener = self.rtp_listener.lock().unwrap();
                listener.producer_id_for(sr.ssrc, None, None).cloned()
            }
            .and_then(|id| self.get_producer(&id));
            if let Some(producer) = producer {
                producer.receive_sender_report(sr, now);
            }
        }
    }

    fn find_consumer_by_media_ssrc(&self, ssrc: u32) -> Option<Arc<Consumer>> {
        self.consumers
            .lock()
            .unwrap()
            .values()
            .find(|c| c.has_ssrc(ssrc))
            .cloned()
    }

    fn current_send_bitrate(&self, now: Instant) -> u32 {
        let consumers = self.consumers_snapshot();
        let mut total = 0u32;
        for consumer in consumers {
            total = total.saturating_add(consumer.current_bitrate(now));
        }
        total
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Serialize and ship one rewritten packet on behalf of a consumer.
    pub(crate) async fn send_rtp_from_consumer(
        &self,
        consumer: &Consumer,
        packet: &rtp::packet::Packet,
    ) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }

        let raw = packet.marshal()?;
        let len = raw.len();

        match &self.kind {
            TransportKind::Direct(_) => {
                self.shared.payload_notifier.emit(
                    consumer.id(),
                    "rtp",
                    Value::Null,
                    raw.clone(),
                );
            }
            TransportKind::WebRtc(t) => t.send_rtp(raw.clone()).await?,
            TransportKind::Plain(t) => t.send_rtp(raw.clone()).await?,
            TransportKind::Pipe(t) => t.send_rtp(raw.clone()).await?,
        }

        self.add_data_sent(len);
        consumer.packet_sent(raw, packet.header.sequence_number, packet.header.timestamp);
        Ok(())
    }

    /// Re-send an already serialized packet (retransmission path).
    pub(crate) async fn send_raw_rtp(&self, raw: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let len = raw.len();
        match &self.kind {
            TransportKind::Direct(_) => return Ok(()),
            TransportKind::WebRtc(t) => t.send_rtp(raw).await?,
            TransportKind::Plain(t) => t.send_rtp(raw).await?,
            TransportKind::Pipe(t) => t.send_rtp(raw).await?,
        }
        self.add_data_sent(len);
        Ok(())
    }

    /// Ship an RTCP packet towards the remote side of this transport.
    pub(crate) async fn send_rtcp(&self, raw: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let len = raw.len();
        match &self.kind {
            TransportKind::Direct(_) => {
                self.shared
                    .payload_notifier
                    .emit(&self.id, "rtcp", Value::Null, raw);
            }
            TransportKind::WebRtc(t) => t.send_rtcp(raw).await?,
            TransportKind::Plain(t) => t.send_rtcp(raw).await?,
            TransportKind::Pipe(t) => t.send_rtcp(raw).await?,
        }
        self.add_data_sent(len);
        Ok(())
    }

    /// Ship one data message on behalf of a data consumer.
    pub(crate) async fn send_data_message(
        &self,
        data_consumer: &DataConsumer,
        ppid: u32,
        payload: Bytes,
    ) -> Result<()> {
        let len = payload.len();
        match &self.kind {
            TransportKind::Direct(_) => {
                self.shared.payload_notifier.emit(
                    data_consumer.id(),
                    "message",
                    json!({ "ppid": ppid }),
                    payload,
                );
            }
            _ => {
                let Some(sctp) = &self.sctp else {
                    return Err(Error::other("transport has no SCTP association"));
                };
                sctp.send(data_consumer.stream_id(), ppid, payload).await?;
            }
        }
        self.add_data_sent(len);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outgoing bitrate allocation
    // ------------------------------------------------------------------

    /// Distribute the available outgoing bitrate to consumers by priority
    /// and desired bitrate.
    pub(crate) async fn recompute_outgoing_allocation(&self, now: Instant) {
        let mut available = self.bwe.available_bitrate();
        if available == 0 {
            return;
        }

        let max = self.max_outgoing_bitrate.load(Ordering::SeqCst);
        if max != 0 {
            available = available.min(max);
        }
        let min = self.min_outgoing_bitrate.load(Ordering::SeqCst);
        if min != 0 {
            available = available.max(min);
        }

        let mut consumers = self.consumers_snapshot();
        consumers.sort_by_key(|c| std::cmp::Reverse(c.priority()));

        let mut remaining = available;
        for consumer in consumers {
            let desired = consumer.desired_bitrate(now);
            let granted = desired.min(remaining);
            remaining -= granted;
            consumer.apply_bitrate_allocation(granted, now).await;
        }

        self.emit_trace(
            TraceEventType::Bwe,
            "out",
            json!({ "availableBitrate": available, "remaining": remaining }),
        );
    }

    // ------------------------------------------------------------------
    // Channel request handling
    // ------------------------------------------------------------------

    async fn handle_produce(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ProduceBody {
            producer_id: String,
            kind: MediaKind,
            rtp_parameters: RtpParameters,
            #[serde(default)]
            paused: bool,
            #[serde(default)]
            key_frame_request_delay: Option<u32>,
        }

        let body: ProduceBody = parse_body(&request.data)?;

        if self.get_producer(&body.producer_id).is_some() {
            return Err(Error::other(format!(
                "a Producer with same producerId already exists [producerId:{}]",
                body.producer_id
            )));
        }

        let router = self
            .router
            .upgrade()
            .ok_or(Error::ErrClosed("Router"))?;

        let producer = Producer::new(
            body.producer_id.clone(),
            body.kind,
            body.rtp_parameters,
            body.paused,
            body.key_frame_request_delay,
            self.kind.is_pipe(),
            Arc::clone(&self.shared),
            self.weak_self.clone(),
        )?;

        let add_result = self.rtp_listener.lock().unwrap().add_producer(&producer);
        if let Err(err) = add_result {
            producer.close().await;
            return Err(err);
        }

        self.producers
            .lock()
            .unwrap()
            .insert(body.producer_id.clone(), Arc::clone(&producer));
        router.add_producer(Arc::clone(&producer)).await;

        log::debug!(
            "Producer created [producerId:{}, kind:{}]",
            body.producer_id,
            producer.kind()
        );

        Ok(Some(json!({ "type": producer.producer_type() })))
    }

    async fn handle_consume(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ConsumeBody {
            consumer_id: String,
            producer_id: String,
            kind: MediaKind,
            rtp_parameters: RtpParameters,
            r#type: ConsumerType,
            #[serde(default)]
            consumable_rtp_encodings: Vec<RtpEncodingParameters>,
            #[serde(default)]
            paused: bool,
            #[serde(default)]
            ignore_dtx: bool,
            #[serde(default)]
            preferred_layers: Option<ConsumerLayers>,
        }

        let body: ConsumeBody = parse_body(&request.data)?;

        if self.get_consumer(&body.consumer_id).is_some() {
            return Err(Error::other(format!(
                "a Consumer with same consumerId already exists [consumerId:{}]",
                body.consumer_id
            )));
        }

        let router = self
            .router
            .upgrade()
            .ok_or(Error::ErrClosed("Router"))?;
        let producer = router
            .get_producer(&body.producer_id)
            .ok_or_else(|| Error::other("Producer not found"))?;

        let consumer = Consumer::new(
            body.consumer_id.clone(),
            body.producer_id.clone(),
            body.kind,
            body.r#type,
            body.rtp_parameters,
            body.consumable_rtp_encodings,
            body.paused,
            body.ignore_dtx,
            body.preferred_layers,
            Arc::clone(&self.shared),
            self.weak_self.clone(),
            Arc::downgrade(&producer),
        )?;

        self.consumers
            .lock()
            .unwrap()
            .insert(body.consumer_id.clone(), Arc::clone(&consumer));
        router.link_consumer(&body.producer_id, Arc::clone(&consumer)).await;

        // A freshly linked video consumer needs a key frame to start.
        if body.kind == MediaKind::Video {
            consumer.request_key_frame_upstream(Instant::now()).await;
        }

        let score = consumer.score();
        log::debug!(
            "Consumer created [consumerId:{}, producerId:{}]",
            body.consumer_id,
            body.producer_id
        );

        Ok(Some(json!({
            "paused": consumer.paused(),
            "producerPaused": producer.paused(),
            "score": score,
        })))
    }

    async fn handle_produce_data(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ProduceDataBody {
            data_producer_id: String,
            r#type: DataProducerType,
            #[serde(default)]
            sctp_stream_parameters: Option<SctpStreamParameters>,
            #[serde(default)]
            label: String,
            #[serde(default)]
            protocol: String,
        }

        let body: ProduceDataBody = parse_body(&request.data)?;

        if self
            .data_producers
            .lock()
            .unwrap()
            .contains_key(&body.data_producer_id)
        {
            return Err(Error::other(format!(
                "a DataProducer with same dataProducerId already exists [dataProducerId:{}]",
                body.data_producer_id
            )));
        }

        if body.r#type == DataProducerType::Sctp && self.kind.is_direct() {
            return Err(Error::type_error(
                "a direct transport cannot use sctp dataProducers",
            ));
        }

        let router = self
            .router
            .upgrade()
            .ok_or(Error::ErrClosed("Router"))?;

        let data_producer = DataProducer::new(
            body.data_producer_id.clone(),
            body.r#type,
            body.sctp_stream_parameters,
            body.label,
            body.protocol,
            Arc::clone(&self.shared),
            self.weak_self.clone(),
        )?;

        self.data_producers
            .lock()
            .unwrap()
            .insert(body.data_producer_id.clone(), Arc::clone(&data_producer));
        router.add_data_producer(Arc::clone(&data_producer)).await;

        Ok(Some(json!({
            "type": data_producer.data_type(),
            "sctpStreamParameters": data_producer.sctp_stream_parameters(),
            "label": data_producer.label(),
            "protocol": data_producer.protocol(),
        })))
    }

    async fn handle_consume_data(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ConsumeDataBody {
            data_consumer_id: String,
            data_producer_id: String,
            r#type: DataProducerType,
            #[serde(default)]
            sctp_stream_parameters: Option<SctpStreamParameters>,
            #[serde(default)]
            label: String,
            #[serde(default)]
            protocol: String,
        }

        let body: ConsumeDataBody = parse_body(&request.data)?;

        if self
            .data_consumers
            .lock()
            .unwrap()
            .contains_key(&body.data_consumer_id)
        {
            return Err(Error::other(format!(
                "a DataConsumer with same dataConsumerId already exists [dataConsumerId:{}]",
                body.data_consumer_id
            )));
        }

        let router = self
            .router
            .upgrade()
            .ok_or(Error::ErrClosed("Router"))?;
        let data_producer = router
            .get_data_producer(&body.data_producer_id)
            .ok_or_else(|| Error::other("DataProducer not found"))?;

        let data_consumer = DataConsumer::new(
            body.data_consumer_id.clone(),
            body.data_producer_id.clone(),
            body.r#type,
            body.sctp_stream_parameters,
            body.label,
            body.protocol,
            Arc::clone(&self.shared),
            self.weak_self.clone(),
        )?;

        self.data_consumers
            .lock()
            .unwrap()
            .insert(body.data_consumer_id.clone(), Arc::clone(&data_consumer));
        router
            .link_data_consumer(&body.data_producer_id, Arc::clone(&data_consumer))
            .await;
        drop(data_producer);

        // Open the outgoing SCTP stream eagerly when the association is up;
        // otherwise the first message opens it.
        if let (Some(sctp), Some(params)) = (&self.sctp, data_consumer.sctp_stream_parameters()) {
            if let Err(err) = sctp.open_stream_for(&params).await {
                log::debug!("cannot open SCTP stream yet: {err}");
            }
        }

        Ok(Some(json!({
            "type": data_consumer.data_type(),
            "sctpStreamParameters": data_consumer.sctp_stream_parameters(),
            "label": data_consumer.label(),
            "protocol": data_consumer.protocol(),
        })))
    }

    fn handle_enable_trace_event(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        #[derive(Deserialize)]
        struct EnableTraceEventBody {
            types: Vec<TraceEventType>,
        }

        let body: EnableTraceEventBody = parse_body(&request.data)?;
        let mut trace_event_types = self.trace_event_types.lock().unwrap();
        trace_event_types.clear();
        trace_event_types.extend(body.types);
        Ok(None)
    }

    fn dump(&self) -> Value {
        let producer_ids: Vec<String> =
            self.producers.lock().unwrap().keys().cloned().collect();
        let consumer_ids: Vec<String> =
            self.consumers.lock().unwrap().keys().cloned().collect();
        let data_producer_ids: Vec<String> =
            self.data_producers.lock().unwrap().keys().cloned().collect();
        let data_consumer_ids: Vec<String> =
            self.data_consumers.lock().unwrap().keys().cloned().collect();

        json!({
            "id": self.id,
            "type": self.kind.type_str(),
            "producerIds": producer_ids,
            "consumerIds": consumer_ids,
            "dataProducerIds": data_producer_ids,
            "dataConsumerIds": data_consumer_ids,
            "maxIncomingBitrate": self.max_incoming_bitrate.load(Ordering::SeqCst),
            "maxOutgoingBitrate": self.max_outgoing_bitrate.load(Ordering::SeqCst),
            "minOutgoingBitrate": self.min_outgoing_bitrate.load(Ordering::SeqCst),
        })
    }

    fn get_stats(&self) -> Value {
        let mut stats = json!({
            "transportId": self.id,
            "type": self.kind.type_str(),
            "bytesSent": self.data_sent(),
            "bytesReceived": self.data_received(),
            "availableOutgoingBitrate": self.bwe.available_bitrate(),
        });

        if let Some(extra) = match &self.kind {
            TransportKind::WebRtc(t) => Some(t.fill_stats()),
            TransportKind::Plain(t) => Some(t.fill_stats()),
            TransportKind::Pipe(t) => Some(t.fill_stats()),
            TransportKind::Direct(_) => None,
        } {
            if let (Some(obj), Some(extra_obj)) = (stats.as_object_mut(), extra.as_object()) {
                for (k, v) in extra_obj {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }

        json!([stats])
    }
}

#[async_trait]
impl ChannelRequestHandler for Transport {
    async fn handle_channel_request(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        if self.closed() {
            return Err(Error::ErrClosed("Transport"));
        }

        match request.method {
            Method::TransportDump => Ok(Some(self.dump())),
            Method::TransportGetStats => Ok(Some(self.get_stats())),
            Method::TransportConnect => match &self.kind {
                TransportKind::WebRtc(t) => {
                    let response = t.connect(&request.data).await?;
                    // DTLS may start immediately when ICE already completed.
                    if let Some(this) = self.weak_self.upgrade() {
                        t.maybe_connected(&this).await;
                    }
                    Ok(Some(response))
                }
                TransportKind::Plain(t) => t.connect(&request.data).await.map(Some),
                TransportKind::Pipe(t) => t.connect(&request.data).await.map(Some),
                TransportKind::Direct(_) => {
                    Err(Error::type_error("connect() not supported on direct transports"))
                }
            },
            Method::TransportRestartIce => match &self.kind {
                TransportKind::WebRtc(t) => t.restart_ice().map(Some),
                _ => Err(Error::type_error("restartIce() not supported")),
            },
            Method::TransportSetMaxIncomingBitrate => {
                let bitrate = parse_bitrate(&request.data)?;
                self.max_incoming_bitrate.store(bitrate, Ordering::SeqCst);
                Ok(None)
            }
            Method::TransportSetMaxOutgoingBitrate => {
                let bitrate = parse_bitrate(&request.data)?;
                self.max_outgoing_bitrate.store(bitrate, Ordering::SeqCst);
                self.recompute_outgoing_allocation(Instant::now()).await;
                Ok(None)
            }
            Method::TransportSetMinOutgoingBitrate => {
                let bitrate = parse_bitrate(&request.data)?;
                self.min_outgoing_bitrate.store(bitrate, Ordering::SeqCst);
                self.recompute_outgoing_allocation(Instant::now()).await;
                Ok(None)
            }
            Method::TransportProduce => self.handle_produce(request).await,
            Method::TransportConsume => self.handle_consume(request).await,
            Method::TransportProduceData => self.handle_produce_data(request).await,
            Method::TransportConsumeData => self.handle_consume_data(request).await,
            Method::TransportEnableTraceEvent => self.handle_enable_trace_event(request),
            Method::TransportCloseProducer => {
                let id = parse_id_field(&request.data, "producerId")?;
                let producer = self
                    .get_producer(&id)
                    .ok_or_else(|| Error::other("Producer not found"))?;
                self.remove_producer(&id);
                producer.close().await;
                if let Some(router) = self.router.upgrade() {
                    router.producer_closed(&id).await;
                }
                log::debug!("Producer closed [producerId:{id}]");
                Ok(None)
            }
            Method::TransportCloseConsumer => {
                let id = parse_id_field(&request.data, "consumerId")?;
                let consumer = self
                    .get_consumer(&id)
                    .ok_or_else(|| Error::other("Consumer not found"))?;
                self.remove_consumer(&id);
                consumer.close().await;
                if let Some(router) = self.router.upgrade() {
                    router.unlink_consumer(consumer.producer_id(), &id).await;
                }
                log::debug!("Consumer closed [consumerId:{id}]");
                Ok(None)
            }
            Method::TransportCloseDataProducer => {
                let id = parse_id_field(&request.data, "dataProducerId")?;
                let data_producer = self
                    .data_producers
                    .lock()
                    .unwrap()
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| Error::other("DataProducer not found"))?;
                self.remove_data_producer(&id);
                data_producer.close().await;
                if let Some(router) = self.router.upgrade() {
                    router.data_producer_closed(&id).await;
                }
                Ok(None)
            }
            Method::TransportCloseDataConsumer => {
                let id = parse_id_field(&request.data, "dataConsumerId")?;
                let data_consumer = self
                    .data_consumers
                    .lock()
                    .unwrap()
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| Error::other("DataConsumer not found"))?;
                self.remove_data_consumer(&id);
                data_consumer.close().await;
                if let Some(router) = self.router.upgrade() {
                    router
                        .unlink_data_consumer(data_consumer.data_producer_id(), &id)
                        .await;
                }
                Ok(None)
            }
            _ => Err(Error::type_error(format!(
                "unknown method \"{}\" for a Transport",
                request.method
            ))),
        }
    }
}

#[async_trait]
impl PayloadRequestHandler for Transport {
    async fn handle_payload_request(&self, request: &PayloadRequest) -> Result<Option<Value>> {
        Err(Error::type_error(format!(
            "unknown payload method \"{}\" for a Transport",
            request.request.method
        )))
    }
}

#[async_trait]
impl PayloadNotificationHandler for Transport {
    async fn handle_payload_notification(&self, notification: PayloadNotification) -> Result<()> {
        match notification.event.as_str() {
            // Direct transport RTCP pass-through.
            "transport.sendRtcp" => {
                let len = notification.payload.len();
                self.add_data_received(len);

                if len > MAX_RTCP_LEN {
                    log::warn!("given RTCP packet exceeds maximum size [len:{len}]");
                    return Ok(());
                }

                self.receive_rtcp_packet(&notification.payload).await;
                Ok(())
            }
            event => {
                log::warn!("unknown payload notification event \"{event}\" for a Transport");
                Ok(())
            }
        }
    }
}

pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T> {
    serde_json::from_value(data.clone()).map_err(|err| Error::type_error(err.to_string()))
}

pub(crate) fn parse_id_field(data: &Value, field: &str) -> Result<String> {
    data.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::type_error(format!("missing {field}")))
}

fn parse_bitrate(data: &Value) -> Result<u32> {
    #[derive(Deserialize)]
    struct BitrateBody {
        bitrate: u32,
    }
    let body: BitrateBody = parse_body(data)?;
    Ok(body.bitrate)
}

// Packet demultiplexing per RFC 7983.

pub(crate) fn match_stun(buf: &[u8]) -> bool {
    !buf.is_empty() && buf[0] <= 3
}

pub(crate) fn match_dtls(buf: &[u8]) -> bool {
    !buf.is_empty() && (20..=63).contains(&buf[0])
}

pub(crate) fn match_srtp_or_srtcp(buf: &[u8]) -> bool {
    !buf.is_empty() && (128..=191).contains(&buf[0])
}

pub(crate) fn is_rtcp(buf: &[u8]) -> bool {
    if buf.len() < 4 {
        return false;
    }
    (192..=223).contains(&buf[1])
}

/// Bind a UDP socket on the given IP, on a fixed port or the next free one
/// from the worker's RTC port range.
pub(crate) async fn bind_udp(
    ip: std::net::IpAddr,
    port: Option<u16>,
    range: (u16, u16),
) -> Result<tokio::net::UdpSocket> {
    use std::sync::atomic::AtomicU16;

    if let Some(port) = port {
        return Ok(tokio::net::UdpSocket::bind((ip, port)).await?);
    }

    static NEXT_PORT_OFFSET: AtomicU16 = AtomicU16::new(0);
    let (min, max) = range;
    let span = max.saturating_sub(min).saturating_add(1);

    for _ in 0..span {
        let offset = NEXT_PORT_OFFSET.fetch_add(1, Ordering::Relaxed) % span;
        let candidate = min + offset;
        match tokio::net::UdpSocket::bind((ip, candidate)).await {
            Ok(socket) => return Ok(socket),
            Err(_) => continue,
        }
    }

    Err(Error::other("no available port in the RTC port range"))
}

/// Build a PLI for the given media SSRC, ready to ship upstream.
pub(crate) fn build_pli(media_ssrc: u32) -> Result<Bytes> {
    let pli = rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication {
        sender_ssrc: 0,
        media_ssrc,
    };
    Ok(pli.marshal()?)
}
