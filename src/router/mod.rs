//! Router: owns transports and maps producer → consumer fan-out.

pub mod rtp_observer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::channel::registrator::ChannelRequestHandler;
use crate::channel::Shared;
use crate::consumer::Consumer;
use crate::data_consumer::DataConsumer;
use crate::data_producer::DataProducer;
use crate::error::{Error, Result};
use crate::message::{ChannelRequest, Method};
use crate::producer::{PacketInfo, Producer};
use crate::rtp_parameters::{RtpCapabilities, SctpParameters};
use crate::transport::{
    direct::DirectTransport, pipe::PipeTransport, plain::PlainTransport, webrtc::WebRtcTransport,
    SctpAssociation, Transport, TransportKind,
};
use crate::worker::Worker;

use rtp_observer::{RtpObserver, RtpObserverKind};

pub struct Router {
    id: String,
    shared: Arc<Shared>,
    worker: Weak<Worker>,
    weak_self: Weak<Router>,
    closed: AtomicBool,

    transports: Mutex<HashMap<String, Arc<Transport>>>,
    rtp_observers: Mutex<HashMap<String, Arc<RtpObserver>>>,

    /// Router-wide indexes; values are weak so the indexes never own.
    producers: Mutex<HashMap<String, Weak<Producer>>>,
    data_producers: Mutex<HashMap<String, Weak<DataProducer>>>,

    /// Fan-out: producer id → consumer id → consumer.
    map_producer_consumers: Mutex<HashMap<String, HashMap<String, Weak<Consumer>>>>,
    map_data_producer_consumers: Mutex<HashMap<String, HashMap<String, Weak<DataConsumer>>>>,
}

impl Router {
    pub(crate) fn new(
        id: String,
        shared: Arc<Shared>,
        worker: Weak<Worker>,
    ) -> Result<Arc<Router>> {
        let router = Arc::new_cyclic(|weak_self| Router {
            id: id.clone(),
            shared: Arc::clone(&shared),
            worker,
            weak_self: weak_self.clone(),
            closed: AtomicBool::new(false),
            transports: Mutex::new(HashMap::new()),
            rtp_observers: Mutex::new(HashMap::new()),
            producers: Mutex::new(HashMap::new()),
            data_producers: Mutex::new(HashMap::new()),
            map_producer_consumers: Mutex::new(HashMap::new()),
            map_data_producer_consumers: Mutex::new(HashMap::new()),
        });

        shared.registrator.register(
            &id,
            Arc::downgrade(&router) as Weak<dyn ChannelRequestHandler>,
            None,
            None,
        )?;

        Ok(router)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close all owned transports and observers, then unregister. Children
    /// unregister before this returns, so no handler id dangles.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let transports: Vec<Arc<Transport>> =
            self.transports.lock().unwrap().drain().map(|(_, t)| t).collect();
        for transport in transports {
            transport.close().await;
        }

        let observers: Vec<Arc<RtpObserver>> =
            self.rtp_observers.lock().unwrap().drain().map(|(_, o)| o).collect();
        for observer in observers {
            observer.close().await;
        }

        self.producers.lock().unwrap().clear();
        self.data_producers.lock().unwrap().clear();
        self.map_producer_consumers.lock().unwrap().clear();
        self.map_data_producer_consumers.lock().unwrap().clear();

        self.shared.registrator.unregister(&self.id);
        log::debug!("Router closed [id:{}]", self.id);
    }

    // ------------------------------------------------------------------
    // Indexes and fan-out maintenance
    // ------------------------------------------------------------------

    pub(crate) fn get_producer(&self, id: &str) -> Option<Arc<Producer>> {
        self.producers.lock().unwrap().get(id).and_then(|w| w.upgrade())
    }

    pub(crate) fn get_data_producer(&self, id: &str) -> Option<Arc<DataProducer>> {
        self.data_producers
            .lock()
            .unwrap()
            .get(id)
            .and_then(|w| w.upgrade())
    }

    pub(crate) async fn add_producer(&self, producer: Arc<Producer>) {
        self.producers
            .lock()
            .unwrap()
            .insert(producer.id().to_string(), Arc::downgrade(&producer));
        self.map_producer_consumers
            .lock()
            .unwrap()
            .entry(producer.id().to_string())
            .or_default();
    }

    pub(crate) async fn add_data_producer(&self, data_producer: Arc<DataProducer>) {
        self.data_producers
            .lock()
            .unwrap()
            .insert(data_producer.id().to_string(), Arc::downgrade(&data_producer));
        self.map_data_producer_consumers
            .lock()
            .unwrap()
            .entry(data_producer.id().to_string())
            .or_default();
    }

    pub(crate) async fn link_consumer(&self, producer_id: &str, consumer: Arc<Consumer>) {
        self.map_producer_consumers
            .lock()
            .unwrap()
            .entry(producer_id.to_string())
            .or_default()
            .insert(consumer.id().to_string(), Arc::downgrade(&consumer));
    }

    pub(crate) async fn unlink_consumer(&self, producer_id: &str, consumer_id: &str) {
        if let Some(consumers) = self
            .map_producer_consumers
            .lock()
            .unwrap()
            .get_mut(producer_id)
        {
            consumers.remove(consumer_id);
        }
    }

    pub(crate) async fn link_data_consumer(
        &self,
        data_producer_id: &str,
        data_consumer: Arc<DataConsumer>,
    ) {
        self.map_data_producer_consumers
            .lock()
            .unwrap()
            .entry(data_producer_id.to_string())
            .or_default()
            .insert(data_consumer.id().to_string(), Arc::downgrade(&data_consumer));
    }

    pub(crate) async fn unlink_data_consumer(&self, data_producer_id: &str, data_consumer_id: &str) {
        if let Some(consumers) = self
            .map_data_producer_consumers
            .lock()
            .unwrap()
            .get_mut(data_producer_id)
        {
            consumers.remove(data_consumer_id);
        }
    }

    fn consumers_of(&self, producer_id: &str) -> Vec<Arc<Consumer>> {
        let mut map = self.map_producer_consumers.lock().unwrap();
        let Some(consumers) = map.get_mut(producer_id) else {
            return Vec::new();
        };
        // Opportunistic pruning of dead back-edges.
        consumers.retain(|_, weak| weak.strong_count() > 0);
        consumers.values().filter_map(|w| w.upgrade()).collect()
    }

    fn data_consumers_of(&self, data_producer_id: &str) -> Vec<Arc<DataConsumer>> {
        let mut map = self.map_data_producer_consumers.lock().unwrap();
        let Some(consumers) = map.get_mut(data_producer_id) else {
            return Vec::new();
        };
        consumers.retain(|_, weak| weak.strong_count() > 0);
        consumers.values().filter_map(|w| w.upgrade()).collect()
    }

    // ------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------

    /// Offer one producer packet to every linked consumer and observer.
    pub(crate) async fn route_rtp_packet(
        &self,
        producer_id: &str,
        packet: &rtp::packet::Packet,
        info: &PacketInfo,
    ) {
        if let Some(dbov) = info.audio_level {
            let observers: Vec<Arc<RtpObserver>> = self
                .rtp_observers
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect();
            for observer in observers {
                observer.receive_audio_level(producer_id, dbov);
            }
        }

        for consumer in self.consumers_of(producer_id) {
            consumer.send_rtp_packet(packet, info).await;
        }
    }

    pub(crate) async fn route_data_message(
        &self,
        data_producer_id: &str,
        ppid: u32,
        payload: Bytes,
    ) {
        for data_consumer in self.data_consumers_of(data_producer_id) {
            data_consumer.send_message(ppid, payload.clone()).await;
        }
    }

    // ------------------------------------------------------------------
    // Producer events
    // ------------------------------------------------------------------

    pub(crate) async fn producer_pause_changed(&self, producer_id: &str, paused: bool) {
        for consumer in self.consumers_of(producer_id) {
            consumer.producer_pause_changed(paused).await;
        }
    }

    pub(crate) async fn producer_score_changed(&self, producer_id: &str) {
        for consumer in self.consumers_of(producer_id) {
            consumer.producer_score_changed();
        }
    }

    pub(crate) async fn producer_streams_changed(&self, producer_id: &str) {
        for consumer in self.consumers_of(producer_id) {
            consumer.producer_streams_changed().await;
        }
    }

    /// Dissolve all links of a closed producer, closing its consumers.
    pub(crate) async fn producer_closed(&self, producer_id: &str) {
        self.producers.lock().unwrap().remove(producer_id);
        let consumers = {
            let mut map = self.map_producer_consumers.lock().unwrap();
            map.remove(producer_id).unwrap_or_default()
        };
        for (_, weak) in consumers {
            if let Some(consumer) = weak.upgrade() {
                consumer.producer_closed().await;
            }
        }
        for observer in self.rtp_observers.lock().unwrap().values() {
            observer.producer_removed(producer_id);
        }
    }

    pub(crate) async fn data_producer_closed(&self, data_producer_id: &str) {
        self.data_producers.lock().unwrap().remove(data_producer_id);
        let consumers = {
            let mut map = self.map_data_producer_consumers.lock().unwrap();
            map.remove(data_producer_id).unwrap_or_default()
        };
        for (_, weak) in consumers {
            if let Some(data_consumer) = weak.upgrade() {
                data_consumer.data_producer_closed().await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Public API mirrored on the wire
    // ------------------------------------------------------------------

    /// True iff at least one of the producer's media codecs matches the
    /// given capabilities.
    pub fn can_consume(&self, producer_id: &str, capabilities: &RtpCapabilities) -> bool {
        match self.get_producer(producer_id) {
            Some(producer) => crate::ortc::can_consume(producer.rtp_parameters(), capabilities),
            None => false,
        }
    }

    /// Create a linked pipe transport pair between this router and another
    /// one in the same worker. Producing/consuming over the pair stays with
    /// the control plane.
    pub async fn pipe_to_router(
        self: Arc<Self>,
        other: &Arc<Router>,
        local_transport_id: String,
        remote_transport_id: String,
    ) -> Result<(Arc<Transport>, Arc<Transport>)> {
        if Arc::ptr_eq(&self, other) {
            return Err(Error::other("cannot pipe a Router to itself"));
        }

        let local = Transport::new(
            local_transport_id,
            Arc::clone(&self.shared),
            Arc::downgrade(&self),
            TransportKind::Pipe(PipeTransport::new_local()),
            None,
        )?;
        let remote = match Transport::new(
            remote_transport_id,
            Arc::clone(&other.shared),
            Arc::downgrade(other),
            TransportKind::Pipe(PipeTransport::new_local()),
            None,
        ) {
            Ok(remote) => remote,
            Err(err) => {
                local.close().await;
                return Err(err);
            }
        };

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();

        if let (TransportKind::Pipe(local_pipe), TransportKind::Pipe(remote_pipe)) =
            (&local.kind, &remote.kind)
        {
            local_pipe.link_local(remote_tx, local_rx, &local);
            remote_pipe.link_local(local_tx, remote_rx, &remote);
        }

        self.transports
            .lock()
            .unwrap()
            .insert(local.id().to_string(), Arc::clone(&local));
        other
            .transports
            .lock()
            .unwrap()
            .insert(remote.id().to_string(), Arc::clone(&remote));

        Ok((local, remote))
    }

    // ------------------------------------------------------------------
    // Transport creation
    // ------------------------------------------------------------------

    fn check_new_transport_id(&self, id: &str) -> Result<()> {
        if self.transports.lock().unwrap().contains_key(id) {
            return Err(Error::other(format!(
                "a Transport with same transportId already exists [transportId:{id}]"
            )));
        }
        Ok(())
    }

    fn port_range(&self) -> (u16, u16) {
        let settings = self.shared.settings.lock().unwrap();
        (settings.rtc_min_port, settings.rtc_max_port)
    }

    fn sctp_of(enable: bool, num_streams: Option<(u16, u16)>, max_message_size: u32) -> Option<Arc<SctpAssociation>> {
        enable.then(|| {
            let (os, mis) = num_streams.unwrap_or((1024, 1024));
            SctpAssociation::new(SctpParameters {
                port: 5000,
                os,
                mis,
                max_message_size,
            })
        })
    }

    async fn create_webrtc_transport(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ListenIp {
            ip: std::net::IpAddr,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct NumSctpStreams {
            os: u16,
            mis: u16,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Body {
            transport_id: String,
            #[serde(default)]
            listen_ip: Option<ListenIp>,
            #[serde(default)]
            port: Option<u16>,
            #[serde(default)]
            web_rtc_server_id: Option<String>,
            #[serde(default)]
            enable_sctp: bool,
            #[serde(default)]
            num_sctp_streams: Option<NumSctpStreams>,
            #[serde(default)]
            max_sctp_message_size: Option<u32>,
        }

        let body: Body = crate::transport::parse_body(&request.data)?;
        self.check_new_transport_id(&body.transport_id)?;

        if body.listen_ip.is_none() && body.web_rtc_server_id.is_none() {
            return Err(Error::type_error("missing listenIp or webRtcServerId"));
        }

        let webrtc = WebRtcTransport::new(
            body.listen_ip.as_ref().map(|l| l.ip),
            body.port,
            self.port_range(),
        )
        .await?;
        let creation_response = webrtc.fill_creation_response();

        let sctp = Self::sctp_of(
            body.enable_sctp,
            body.num_sctp_streams.map(|n| (n.os, n.mis)),
            body.max_sctp_message_size.unwrap_or(262144),
        );
        let sctp_parameters = sctp.as_ref().map(|s| s.parameters());

        let transport = Transport::new(
            body.transport_id.clone(),
            Arc::clone(&self.shared),
            self.weak_self.clone(),
            TransportKind::WebRtc(webrtc),
            sctp,
        )?;

        if let Some(server_id) = &body.web_rtc_server_id {
            let server = self
                .worker
                .upgrade()
                .and_then(|worker| worker.get_webrtc_server(server_id));
            match server {
                Some(server) => server.register_transport(&transport),
                None => {
                    transport.close().await;
                    return Err(Error::other("WebRtcServer not found"));
                }
            }
        } else {
            WebRtcTransport::start(&transport);
        }

        self.transports
            .lock()
            .unwrap()
            .insert(body.transport_id.clone(), Arc::clone(&transport));
        log::debug!("WebRtcTransport created [transportId:{}]", body.transport_id);

        let mut response = creation_response;
        if let (Some(obj), Some(sctp_parameters)) = (response.as_object_mut(), sctp_parameters) {
            obj.insert("sctpParameters".into(), json!(sctp_parameters));
        }
        Ok(Some(response))
    }

    async fn create_plain_transport(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ListenIp {
            ip: std::net::IpAddr,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Body {
            transport_id: String,
            listen_ip: ListenIp,
            #[serde(default)]
            port: Option<u16>,
            #[serde(default = "default_true")]
            rtcp_mux: bool,
            #[serde(default)]
            comedia: bool,
            #[serde(default)]
            enable_srtp: bool,
            #[serde(default)]
            srtp_crypto_suite: Option<String>,
        }

        let body: Body = crate::transport::parse_body(&request.data)?;
        self.check_new_transport_id(&body.transport_id)?;

        let plain = PlainTransport::bind(
            body.listen_ip.ip,
            body.port,
            body.rtcp_mux,
            body.comedia,
            body.enable_srtp,
            body.srtp_crypto_suite,
            self.port_range(),
        )
        .await?;

        let transport = Transport::new(
            body.transport_id.clone(),
            Arc::clone(&self.shared),
            self.weak_self.clone(),
            TransportKind::Plain(plain),
            None,
        )?;
        PlainTransport::start(&transport);

        self.transports
            .lock()
            .unwrap()
            .insert(body.transport_id.clone(), Arc::clone(&transport));
        log::debug!("PlainTransport created [transportId:{}]", body.transport_id);

        let stats = match &transport.kind {
            TransportKind::Plain(p) => p.fill_stats(),
            _ => Value::Null,
        };
        Ok(Some(stats))
    }

    async fn create_pipe_transport(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ListenIp {
            ip: std::net::IpAddr,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Body {
            transport_id: String,
            listen_ip: ListenIp,
            #[serde(default)]
            port: Option<u16>,
        }

        let body: Body = crate::transport::parse_body(&request.data)?;
        self.check_new_transport_id(&body.transport_id)?;

        let pipe = PipeTransport::bind(body.listen_ip.ip, body.port, self.port_range()).await?;
        let transport = Transport::new(
            body.transport_id.clone(),
            Arc::clone(&self.shared),
            self.weak_self.clone(),
            TransportKind::Pipe(pipe),
            None,
        )?;
        PipeTransport::start(&transport);

        self.transports
            .lock()
            .unwrap()
            .insert(body.transport_id.clone(), Arc::clone(&transport));
        log::debug!("PipeTransport created [transportId:{}]", body.transport_id);

        let stats = match &transport.kind {
            TransportKind::Pipe(p) => p.fill_stats(),
            _ => Value::Null,
        };
        Ok(Some(stats))
    }

    async fn create_direct_transport(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Body {
            transport_id: String,
            #[serde(default = "default_direct_max_message_size")]
            max_message_size: u32,
        }

        let body: Body = crate::transport::parse_body(&request.data)?;
        self.check_new_transport_id(&body.transport_id)?;

        let transport = Transport::new(
            body.transport_id.clone(),
            Arc::clone(&self.shared),
            self.weak_self.clone(),
            TransportKind::Direct(DirectTransport::new(body.max_message_size)),
            None,
        )?;

        self.transports
            .lock()
            .unwrap()
            .insert(body.transport_id.clone(), Arc::clone(&transport));
        log::debug!("DirectTransport created [transportId:{}]", body.transport_id);

        Ok(Some(json!({ "maxMessageSize": body.max_message_size })))
    }

    fn dump(&self) -> Value {
        let transport_ids: Vec<String> =
            self.transports.lock().unwrap().keys().cloned().collect();
        let observer_ids: Vec<String> =
            self.rtp_observers.lock().unwrap().keys().cloned().collect();
        let map: HashMap<String, Vec<String>> = self
            .map_producer_consumers
            .lock()
            .unwrap()
            .iter()
            .map(|(producer_id, consumers)| {
                (producer_id.clone(), consumers.keys().cloned().collect())
            })
            .collect();

        json!({
            "id": self.id,
            "transportIds": transport_ids,
            "rtpObserverIds": observer_ids,
            "mapProducerIdConsumerIds": map,
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_direct_max_message_size() -> u32 {
    262144
}

#[async_trait]
impl ChannelRequestHandler for Router {
    async fn handle_channel_request(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        if self.closed() {
            return Err(Error::ErrClosed("Router"));
        }

        match request.method {
            Method::RouterDump => Ok(Some(self.dump())),
            Method::RouterCreateWebRtcTransport => self.create_webrtc_transport(request).await,
            Method::RouterCreatePlainTransport => self.create_plain_transport(request).await,
            Method::RouterCreatePipeTransport => self.create_pipe_transport(request).await,
            Method::RouterCreateDirectTransport => self.create_direct_transport(request).await,
            Method::RouterCloseTransport => {
                let id = crate::transport::parse_id_field(&request.data, "transportId")?;
                let transport = self
                    .transports
                    .lock()
                    .unwrap()
                    .remove(&id)
                    .ok_or_else(|| Error::other("Transport not found"))?;
                transport.close().await;
                Ok(None)
            }
            Method::RouterCreateActiveSpeakerObserver => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Body {
                    rtp_observer_id: String,
                    #[serde(default = "default_active_speaker_interval")]
                    interval: u64,
                }
                let body: Body = crate::transport::parse_body(&request.data)?;
                let observer = RtpObserver::new(
                    body.rtp_observer_id.clone(),
                    RtpObserverKind::ActiveSpeaker {
                        interval: Duration::from_millis(body.interval),
                    },
                    Arc::clone(&self.shared),
                )?;
                self.rtp_observers
                    .lock()
                    .unwrap()
                    .insert(body.rtp_observer_id, observer);
                Ok(None)
            }
            Method::RouterCreateAudioLevelObserver => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Body {
                    rtp_observer_id: String,
                    #[serde(default = "default_max_entries")]
                    max_entries: usize,
                    #[serde(default = "default_threshold")]
                    threshold: i8,
                    #[serde(default = "default_audio_level_interval")]
                    interval: u64,
                }
                let body: Body = crate::transport::parse_body(&request.data)?;
                let observer = RtpObserver::new(
                    body.rtp_observer_id.clone(),
                    RtpObserverKind::AudioLevel {
                        max_entries: body.max_entries,
                        threshold: body.threshold,
                        interval: Duration::from_millis(body.interval),
                    },
                    Arc::clone(&self.shared),
                )?;
                self.rtp_observers
                    .lock()
                    .unwrap()
                    .insert(body.rtp_observer_id, observer);
                Ok(None)
            }
            Method::RouterCloseRtpObserver => {
                let id = crate::transport::parse_id_field(&request.data, "rtpObserverId")?;
                let observer = self
                    .rtp_observers
                    .lock()
                    .unwrap()
                    .remove(&id)
                    .ok_or_else(|| Error::other("RtpObserver not found"))?;
                observer.close().await;
                Ok(None)
            }
            Method::RouterCanConsume => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Body {
                    producer_id: String,
                    rtp_capabilities: RtpCapabilities,
                }
                let body: Body = crate::transport::parse_body(&request.data)?;
                Ok(Some(json!({
                    "canConsume": self.can_consume(&body.producer_id, &body.rtp_capabilities)
                })))
            }
            Method::RouterPipeToRouter => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Body {
                    router_id: String,
                    local_transport_id: String,
                    remote_transport_id: String,
                }
                let body: Body = crate::transport::parse_body(&request.data)?;
                let worker = self.worker.upgrade().ok_or(Error::ErrClosed("Worker"))?;
                let other = worker
                    .get_router(&body.router_id)
                    .ok_or_else(|| Error::other("Router not found"))?;
                let this = self
                    .weak_self
                    .upgrade()
                    .ok_or(Error::ErrClosed("Router"))?;
                this.pipe_to_router(&other, body.local_transport_id, body.remote_transport_id)
                    .await?;
                Ok(None)
            }
            _ => Err(Error::type_error(format!(
                "unknown method \"{}\" for a Router",
                request.method
            ))),
        }
    }
}

fn default_active_speaker_interval() -> u64 {
    300
}

fn default_max_entries() -> usize {
    1
}

fn default_threshold() -> i8 {
    -80
}

fn default_audio_level_interval() -> u64 {
    1000
}
