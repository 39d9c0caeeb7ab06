//! Producer: per-incoming-stream state, stream scoring, simulcast stream
//! tracking and key frame request deduplication.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::channel::registrator::{
    ChannelRequestHandler, PayloadNotificationHandler, PayloadRequestHandler,
};
use crate::channel::Shared;
use crate::codecs::{self, PayloadInfo};
use crate::error::{Error, Result};
use crate::message::{ChannelRequest, Method, PayloadNotification, PayloadRequest};
use crate::rtp_parameters::{
    MediaKind, RtpParameters, EXT_URI_AUDIO_LEVEL, EXT_URI_VIDEO_ORIENTATION,
};
use crate::rtp_stream::recv::{RtpStreamRecv, SCORE_TICK_INTERVAL_MS};
use crate::rtp_stream::RtpStreamParams;
use crate::transport::{build_pli, KeyFrameRequestManager, TraceEventType, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerType {
    Simple,
    Simulcast,
    Svc,
    Pipe,
}

/// Everything the router needs to know about one forwarded packet besides
/// the packet itself.
#[derive(Debug, Clone, Copy)]
pub struct PacketInfo {
    /// Index of the producing encoding: the spatial stream for simulcast.
    pub spatial_index: u8,
    pub payload: PayloadInfo,
    /// dBov value from the audio level extension, 0..=127.
    pub audio_level: Option<u8>,
}

/// One stream score entry of the `score` notification.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProducerScore {
    pub ssrc: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    pub score: u8,
}

pub struct Producer {
    id: String,
    kind: MediaKind,
    producer_type: ProducerType,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    shared: Arc<Shared>,
    pub(crate) transport: Weak<Transport>,

    /// Media streams by SSRC; the value carries its encoding index.
    streams: Mutex<HashMap<u32, (u8, RtpStreamRecv)>>,
    /// RTX SSRC → (media SSRC, media payload type).
    rtx_map: HashMap<u32, (u32, u8)>,
    keyframe_manager: KeyFrameRequestManager,
    trace_event_types: Mutex<HashSet<TraceEventType>>,
    /// Camera orientation from the video-orientation extension.
    video_orientation: Mutex<Option<u8>>,
}

impl Producer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
        key_frame_request_delay: Option<u32>,
        on_pipe_transport: bool,
        shared: Arc<Shared>,
        transport: Weak<Transport>,
    ) -> Result<Arc<Producer>> {
        crate::ortc::validate_rtp_parameters(&rtp_parameters)?;

        let producer_type = if on_pipe_transport {
            ProducerType::Pipe
        } else if rtp_parameters.encodings.len() > 1 {
            ProducerType::Simulcast
        } else if rtp_parameters
            .encodings
            .first()
            .map(|e| e.scalability().spatial_layers > 1)
            .unwrap_or(false)
        {
            ProducerType::Svc
        } else {
            ProducerType::Simple
        };

        let mut rtx_map = HashMap::new();
        for encoding in &rtp_parameters.encodings {
            if let (Some(ssrc), Some(rtx)) = (encoding.ssrc, &encoding.rtx) {
                let media_pt = rtp_parameters
                    .media_codec()
                    .map(|c| c.payload_type)
                    .unwrap_or_default();
                rtx_map.insert(rtx.ssrc, (ssrc, media_pt));
            }
        }

        let delay = key_frame_request_delay
            .unwrap_or_else(|| shared.settings.lock().unwrap().key_frame_request_delay);

        let producer = Arc::new(Producer {
            id: id.clone(),
            kind,
            producer_type,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            shared: Arc::clone(&shared),
            transport,
            streams: Mutex::new(HashMap::new()),
            rtx_map,
            keyframe_manager: KeyFrameRequestManager::new(delay),
            trace_event_types: Mutex::new(HashSet::new()),
            video_orientation: Mutex::new(None),
        });

        shared.registrator.register(
            &id,
            Arc::downgrade(&producer) as Weak<dyn ChannelRequestHandler>,
            Some(Arc::downgrade(&producer) as Weak<dyn PayloadRequestHandler>),
            Some(Arc::downgrade(&producer) as Weak<dyn PayloadNotificationHandler>),
        )?;

        tokio::spawn(score_tick(Arc::downgrade(&producer)));

        Ok(producer)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn producer_type(&self) -> ProducerType {
        self.producer_type
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current per-stream scores, ordered by encoding index.
    pub fn scores(&self) -> Vec<ProducerScore> {
        let streams = self.streams.lock().unwrap();
        let mut entries: Vec<(u8, ProducerScore)> = streams
            .iter()
            .map(|(ssrc, (index, stream))| {
                (
                    *index,
                    ProducerScore {
                        ssrc: *ssrc,
                        rid: stream.stream.params.rid.clone(),
                        score: stream.stream.score(),
                    },
                )
            })
            .collect();
        entries.sort_by_key(|(index, _)| *index);
        entries.into_iter().map(|(_, score)| score).collect()
    }

    /// Highest score among this producer's streams.
    pub fn best_score(&self) -> u8 {
        self.streams
            .lock()
            .unwrap()
            .values()
            .map(|(_, stream)| stream.stream.score())
            .max()
            .unwrap_or(0)
    }

    /// Score of the stream at the given encoding index.
    pub fn stream_score(&self, spatial_index: u8) -> u8 {
        self.streams
            .lock()
            .unwrap()
            .values()
            .find(|(index, _)| *index == spatial_index)
            .map(|(_, stream)| stream.stream.score())
            .unwrap_or(0)
    }

    /// Encoding indexes with a recently active stream, sorted ascending.
    pub fn active_spatial_indexes(&self, now: Instant) -> Vec<u8> {
        let mut indexes: Vec<u8> = self
            .streams
            .lock()
            .unwrap()
            .values()
            .filter(|(_, stream)| stream.is_active(now) && stream.stream.score() > 0)
            .map(|(index, _)| *index)
            .collect();
        indexes.sort_unstable();
        indexes.dedup();
        indexes
    }

    /// SSRC of the media stream at the given encoding index.
    pub fn spatial_ssrc(&self, spatial_index: u8) -> Option<u32> {
        self.rtp_parameters
            .encodings
            .get(usize::from(spatial_index))
            .and_then(|e| e.ssrc)
            .or_else(|| {
                self.streams
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|(_, (index, _))| *index == spatial_index)
                    .map(|(ssrc, _)| *ssrc)
            })
    }

    pub fn measured_bitrate(&self, spatial_index: u8, now: Instant) -> u32 {
        let mut streams = self.streams.lock().unwrap();
        streams
            .values_mut()
            .find(|(index, _)| *index == spatial_index)
            .map(|(_, stream)| stream.bitrate(now))
            .unwrap_or(0)
    }

    fn encoding_index_for(&self, ssrc: u32, rid: Option<&str>) -> u8 {
        for (index, encoding) in self.rtp_parameters.encodings.iter().enumerate() {
            if encoding.ssrc == Some(ssrc) {
                return index as u8;
            }
            if let (Some(rid), Some(enc_rid)) = (rid, encoding.rid.as_deref()) {
                if rid == enc_rid {
                    return index as u8;
                }
            }
        }
        0
    }

    /// Feed one RTP packet from the transport. The producer keeps parsing
    /// while paused so stream stats stay fresh; only forwarding stops.
    pub(crate) async fn receive_rtp_packet(&self, mut packet: rtp::packet::Packet, wire_len: usize) {
        if self.closed() {
            return;
        }

        let now = Instant::now();
        let mut is_rtx = false;

        // RTX decapsulation: restore the original media stream identity.
        if let Some((media_ssrc, media_pt)) = self.rtx_map.get(&packet.header.ssrc) {
            if packet.payload.len() < 2 {
                return;
            }
            let orig_seq = u16::from_be_bytes([packet.payload[0], packet.payload[1]]);
            packet.header.ssrc = *media_ssrc;
            packet.header.payload_type = *media_pt;
            packet.header.sequence_number = orig_seq;
            packet.payload = packet.payload.slice(2..);
            is_rtx = true;
        }

        let rid = self
            .rtp_parameters
            .header_extension_id(crate::rtp_parameters::EXT_URI_RID)
            .and_then(|id| packet.header.get_extension(id))
            .and_then(|raw| String::from_utf8(raw.to_vec()).ok());

        let ssrc = packet.header.ssrc;
        let spatial_index = self.encoding_index_for(ssrc, rid.as_deref());

        let mime_type = self
            .rtp_parameters
            .media_codec()
            .map(|c| c.mime_type.clone())
            .unwrap_or_default();

        let mut new_stream = false;
        let accepted = {
            let mut streams = self.streams.lock().unwrap();
            let (_, stream) = streams.entry(ssrc).or_insert_with(|| {
                new_stream = true;
                let encoding = self.rtp_parameters.encodings.get(usize::from(spatial_index));
                let params = RtpStreamParams {
                    ssrc,
                    payload_type: packet.header.payload_type,
                    mime_type: mime_type.clone(),
                    clock_rate: self
                        .rtp_parameters
                        .media_codec()
                        .map(|c| c.clock_rate)
                        .unwrap_or(90000),
                    rid: rid.clone(),
                    cname: self.rtp_parameters.rtcp.cname.clone(),
                    rtx_ssrc: encoding.and_then(|e| e.rtx.map(|r| r.ssrc)),
                    rtx_payload_type: None,
                    use_nack: self.negotiated_feedback("nack", ""),
                    use_pli: self.negotiated_feedback("nack", "pli"),
                    use_fir: self.negotiated_feedback("ccm", "fir"),
                    spatial_layers: encoding.map(|e| e.scalability().spatial_layers).unwrap_or(1),
                    temporal_layers: encoding
                        .map(|e| e.scalability().temporal_layers)
                        .unwrap_or(1),
                };
                (spatial_index, RtpStreamRecv::new(params))
            });

            if is_rtx {
                stream.receive_rtx_packet(&packet, wire_len, now)
            } else {
                stream.receive_packet(&packet, wire_len, now)
            }
        };

        if !accepted {
            return;
        }

        let payload_info = codecs::inspect(&mime_type, &packet.payload);

        // Per-packet trace is costly; never build the info when disabled.
        if self.trace_event_types.lock().unwrap().contains(&TraceEventType::Rtp) {
            self.emit_trace(
                TraceEventType::Rtp,
                "in",
                json!({
                    "ssrc": ssrc,
                    "sequenceNumber": packet.header.sequence_number,
                    "timestamp": packet.header.timestamp,
                    "isKeyFrame": payload_info.is_key_frame,
                }),
            );
        }

        if payload_info.is_key_frame {
            self.keyframe_manager.key_frame_received(ssrc);
            {
                let mut streams = self.streams.lock().unwrap();
                if let Some((_, stream)) = streams.get_mut(&ssrc) {
                    stream.key_frame_request_pending = false;
                }
            }
            self.emit_trace(
                TraceEventType::Keyframe,
                "in",
                json!({ "ssrc": ssrc, "isKeyFrame": true }),
            );
        }

        let audio_level = (self.kind == MediaKind::Audio)
            .then(|| {
                self.rtp_parameters
                    .header_extension_id(EXT_URI_AUDIO_LEVEL)
                    .and_then(|id| packet.header.get_extension(id))
                    .and_then(|raw| raw.first().map(|b| b & 0x7F))
            })
            .flatten();

        self.check_video_orientation(&packet);

        let info = PacketInfo {
            spatial_index,
            payload: payload_info,
            audio_level,
        };

        let router = self.transport.upgrade().and_then(|t| t.router.upgrade());
        let Some(router) = router else {
            return;
        };

        if new_stream {
            router.producer_streams_changed(&self.id).await;
        }

        // Paused producers parse for stats but forward nothing.
        if self.paused() {
            return;
        }

        router.route_rtp_packet(&self.id, &packet, &info).await;
    }

    fn negotiated_feedback(&self, r#type: &str, parameter: &str) -> bool {
        self.rtp_parameters
            .media_codec()
            .map(|c| {
                c.rtcp_feedback
                    .iter()
                    .any(|fb| fb.r#type == r#type && fb.parameter == parameter)
            })
            .unwrap_or(false)
    }

    fn check_video_orientation(&self, packet: &rtp::packet::Packet) {
        if self.kind != MediaKind::Video {
            return;
        }
        let Some(raw) = self
            .rtp_parameters
            .header_extension_id(EXT_URI_VIDEO_ORIENTATION)
            .and_then(|id| packet.header.get_extension(id))
        else {
            return;
        };
        let Some(value) = raw.first().copied() else {
            return;
        };

        let mut orientation = self.video_orientation.lock().unwrap();
        if *orientation == Some(value) {
            return;
        }
        *orientation = Some(value);

        let camera = value & 0x08 != 0;
        let flip = value & 0x04 != 0;
        let rotation = match value & 0x03 {
            0 => 0,
            1 => 90,
            2 => 180,
            _ => 270,
        };
        self.shared.notifier.emit_with_data(
            &self.id,
            "videoorientationchange",
            json!({ "camera": camera, "flip": flip, "rotation": rotation }),
        );
    }

    /// A consumer asks for a key frame on the stream at `spatial_index`.
    /// Deduplicates per SSRC: at most one request in flight, plus the
    /// configured coalescing window.
    pub(crate) async fn request_key_frame(&self, spatial_index: u8, now: Instant) {
        if self.kind != MediaKind::Video || self.closed() {
            return;
        }

        let Some(ssrc) = self.spatial_ssrc(spatial_index) else {
            return;
        };

        {
            let mut streams = self.streams.lock().unwrap();
            if let Some((_, stream)) = streams.get_mut(&ssrc) {
                if !stream.stream.params.use_pli && !stream.stream.params.use_fir {
                    return;
                }
                if stream.key_frame_request_pending {
                    return;
                }
                stream.key_frame_request_pending = true;
            }
        }

        let Some(transport) = self.transport.upgrade() else {
            return;
        };
        if !transport.keyframe_manager.request(ssrc, now) {
            return;
        }

        match build_pli(ssrc) {
            Ok(raw) => {
                self.emit_trace(TraceEventType::Pli, "out", json!({ "ssrc": ssrc }));
                if let Err(err) = transport.send_rtcp(raw).await {
                    log::debug!("cannot send PLI upstream: {err}");
                }
            }
            Err(err) => log::warn!("cannot build PLI: {err}"),
        }
    }

    pub(crate) fn receive_sender_report(&self, sr: &rtcp::sender_report::SenderReport, now: Instant) {
        let mut streams = self.streams.lock().unwrap();
        if let Some((_, stream)) = streams.get_mut(&sr.ssrc) {
            let ntp_middle = ((sr.ntp_time >> 16) & 0xFFFF_FFFF) as u32;
            stream.record_sender_report(ntp_middle, now);
        }
    }

    fn emit_trace(&self, event: TraceEventType, direction: &str, info: Value) {
        if !self.trace_event_types.lock().unwrap().contains(&event) {
            return;
        }
        let event_name = match event {
            TraceEventType::Keyframe => "keyframe",
            TraceEventType::Pli => "pli",
            TraceEventType::Fir => "fir",
            TraceEventType::Rtp => "rtp",
            TraceEventType::Probation => "probation",
            TraceEventType::Bwe => "bwe",
        };
        self.shared.notifier.emit_with_data(
            &self.id,
            "trace",
            json!({ "type": event_name, "direction": direction, "info": info }),
        );
    }

    async fn set_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::SeqCst) == paused {
            return;
        }
        let router = self.transport.upgrade().and_then(|t| t.router.upgrade());
        if let Some(router) = router {
            router.producer_pause_changed(&self.id, paused).await;
        }
    }

    /// Close initiated by this producer's own lifecycle (request or listener
    /// conflict). The owning transport and router unlink separately.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.registrator.unregister(&self.id);
    }

    /// The owning transport is going away.
    pub(crate) async fn transport_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.registrator.unregister(&self.id);
        let router = self.transport.upgrade().and_then(|t| t.router.upgrade());
        if let Some(router) = router {
            router.producer_closed(&self.id).await;
        }
    }

    fn dump(&self) -> Value {
        json!({
            "id": self.id,
            "kind": self.kind,
            "type": self.producer_type,
            "paused": self.paused(),
            "rtpParameters": self.rtp_parameters,
            "scores": self.scores(),
        })
    }

    fn get_stats(&self) -> Value {
        let now = Instant::now();
        let mut streams = self.streams.lock().unwrap();
        let stats: Vec<Value> = streams
            .values_mut()
            .map(|(index, stream)| {
                json!({
                    "type": "inbound-rtp",
                    "ssrc": stream.stream.params.ssrc,
                    "rid": stream.stream.params.rid,
                    "encodingIndex": index,
                    "score": stream.stream.score(),
                    "packetCount": stream.stream.packets_count,
                    "byteCount": stream.stream.bytes_count,
                    "bitrate": stream.bitrate(now),
                    "jitter": stream.jitter(),
                })
            })
            .collect();
        json!(stats)
    }
}

#[async_trait]
impl ChannelRequestHandler for Producer {
    async fn handle_channel_request(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        if self.closed() {
            return Err(Error::ErrClosed("Producer"));
        }

        match request.method {
            Method::ProducerDump => Ok(Some(self.dump())),
            Method::ProducerGetStats => Ok(Some(self.get_stats())),
            Method::ProducerPause => {
                self.set_paused(true).await;
                Ok(None)
            }
            Method::ProducerResume => {
                self.set_paused(false).await;
                Ok(None)
            }
            Method::ProducerEnableTraceEvent => {
                #[derive(Deserialize)]
                struct Body {
                    types: Vec<TraceEventType>,
                }
                let body: Body = crate::transport::parse_body(&request.data)?;
                let mut trace_event_types = self.trace_event_types.lock().unwrap();
                trace_event_types.clear();
                trace_event_types.extend(body.types);
                Ok(None)
            }
            _ => Err(Error::type_error(format!(
                "unknown method \"{}\" for a Producer",
                request.method
            ))),
        }
    }
}

#[async_trait]
impl PayloadRequestHandler for Producer {
    async fn handle_payload_request(&self, request: &PayloadRequest) -> Result<Option<Value>> {
        Err(Error::type_error(format!(
            "unknown payload method \"{}\" for a Producer",
            request.request.method
        )))
    }
}

#[async_trait]
impl PayloadNotificationHandler for Producer {
    async fn handle_payload_notification(&self, notification: PayloadNotification) -> Result<()> {
        match notification.event.as_str() {
            // Direct transport RTP injection.
            "producer.send" => {
                let len = notification.payload.len();
                if let Some(transport) = self.transport.upgrade() {
                    transport.add_data_received(len);
                }

                let mut buf = &notification.payload[..];
                use util::marshal::Unmarshal;
                match rtp::packet::Packet::unmarshal(&mut buf) {
                    Ok(packet) => self.receive_rtp_packet(packet, len).await,
                    Err(err) => {
                        log::warn!("received data is not a valid RTP packet: {err}");
                    }
                }
                Ok(())
            }
            event => {
                log::warn!("unknown payload notification event \"{event}\" for a Producer");
                Ok(())
            }
        }
    }
}

/// Periodic stream score update; ends when the producer is dropped.
async fn score_tick(producer: Weak<Producer>) {
    let mut interval = tokio::time::interval(Duration::from_millis(SCORE_TICK_INTERVAL_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let Some(producer) = producer.upgrade() else {
            return;
        };
        if producer.closed() {
            return;
        }

        let now = Instant::now();
        let mut changed = false;
        {
            let mut streams = producer.streams.lock().unwrap();
            for (_, stream) in streams.values_mut() {
                if stream.update_score(now).is_some() {
                    changed = true;
                }
            }
        }

        if changed {
            let scores = producer.scores();
            producer
                .shared
                .notifier
                .emit_with_data(&producer.id, "score", json!(scores));

            let router = producer.transport.upgrade().and_then(|t| t.router.upgrade());
            if let Some(router) = router {
                router.producer_score_changed(&producer.id).await;
            }
        }
    }
}
