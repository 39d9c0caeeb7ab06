//! Consumer: per-outgoing-stream forwarding policy.
//!
//! Four variants share one chassis. `simple` and `pipe` forward everything;
//! `simulcast` hops between the producer's spatial streams and `svc` filters
//! layers inside a single stream. Layer selection runs a four-state machine
//! (preferred / target / current / effective) where every spatial move waits
//! for a key frame on the target stream before committing.

#[cfg(test)]
mod layers_test;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::channel::registrator::{ChannelRequestHandler, PayloadRequestHandler};
use crate::channel::Shared;
use crate::error::{Error, Result};
use crate::message::{ChannelRequest, Method, PayloadRequest};
use crate::producer::{PacketInfo, Producer};
use crate::rtp_parameters::{MediaKind, RtpEncodingParameters, RtpParameters};
use crate::rtp_stream::send::RtpStreamSend;
use crate::rtp_stream::RtpStreamParams;
use crate::seq_manager::SeqManager;
use crate::transport::{TraceEventType, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    Simple,
    Simulcast,
    Svc,
    Pipe,
}

/// A spatial/temporal layer pair as exchanged with the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    #[serde(default)]
    pub temporal_layer: Option<u8>,
}

/// Internal, fully resolved layer pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Layers {
    pub spatial: u8,
    pub temporal: u8,
}

impl Layers {
    fn to_consumer_layers(self) -> ConsumerLayers {
        ConsumerLayers {
            spatial_layer: self.spatial,
            temporal_layer: Some(self.temporal),
        }
    }
}

/// Consumer score as reported to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerScore {
    /// min(outgoing stream score, selected incoming stream score).
    pub score: u8,
    /// Score of the currently selected incoming stream.
    pub producer_score: u8,
    /// Scores of all producer streams, by encoding index.
    pub producer_scores: Vec<u8>,
}

#[derive(Debug)]
struct LayerState {
    preferred: Layers,
    current: Option<Layers>,
    target: Option<Layers>,
    /// Mirrors `current` once a key frame has been observed on it.
    effective: Option<Layers>,
    /// input_ts − output_ts, re-based on every spatial switch.
    ts_offset: u32,
    last_sent_input_ts: Option<u32>,
    last_sent_at: Option<Instant>,
}

pub struct Consumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    consumer_type: ConsumerType,
    rtp_parameters: RtpParameters,
    /// Feedback surviving the producer ∩ consumer codec intersection.
    negotiated_feedback: Vec<crate::rtp_parameters::RtcpFeedback>,
    consumable_encodings: Vec<RtpEncodingParameters>,
    paused: AtomicBool,
    producer_paused: AtomicBool,
    closed: AtomicBool,
    priority: AtomicU8,
    ignore_dtx: bool,
    allocated_bitrate: AtomicU32,

    shared: Arc<Shared>,
    transport: Weak<Transport>,
    producer: Weak<Producer>,

    state: Mutex<LayerState>,
    seq_manager: Mutex<SeqManager>,
    /// Outgoing stream; not observable before the first forwarded packet.
    rtp_stream: Mutex<Option<RtpStreamSend>>,
    score_state: Mutex<ConsumerScore>,
    trace_event_types: Mutex<HashSet<TraceEventType>>,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        producer_id: String,
        kind: MediaKind,
        consumer_type: ConsumerType,
        rtp_parameters: RtpParameters,
        consumable_encodings: Vec<RtpEncodingParameters>,
        paused: bool,
        ignore_dtx: bool,
        preferred_layers: Option<ConsumerLayers>,
        shared: Arc<Shared>,
        transport: Weak<Transport>,
        producer: Weak<Producer>,
    ) -> Result<Arc<Consumer>> {
        crate::ortc::validate_rtp_parameters(&rtp_parameters)?;
        let negotiated_feedback = match producer.upgrade() {
            Some(producer) => {
                crate::ortc::get_consumer_feedback(producer.rtp_parameters(), &rtp_parameters)?
            }
            None => Vec::new(),
        };

        let max_layers = max_layers_of(consumer_type, &consumable_encodings);
        let preferred = match preferred_layers {
            Some(layers) => Layers {
                spatial: layers.spatial_layer.min(max_layers.spatial),
                temporal: layers
                    .temporal_layer
                    .unwrap_or(max_layers.temporal)
                    .min(max_layers.temporal),
            },
            // Consume the best the producer offers until told otherwise.
            None => max_layers,
        };

        let producer_paused = producer
            .upgrade()
            .map(|p| p.paused())
            .unwrap_or(false);
        let initial_producer_score = producer.upgrade().map(|p| p.best_score()).unwrap_or(0);
        let producer_scores: Vec<u8> = producer
            .upgrade()
            .map(|p| p.scores().iter().map(|s| s.score).collect())
            .unwrap_or_default();

        let consumer = Arc::new(Consumer {
            id: id.clone(),
            producer_id,
            kind,
            consumer_type,
            rtp_parameters,
            negotiated_feedback,
            consumable_encodings,
            paused: AtomicBool::new(paused),
            producer_paused: AtomicBool::new(producer_paused),
            closed: AtomicBool::new(false),
            priority: AtomicU8::new(1),
            ignore_dtx,
            allocated_bitrate: AtomicU32::new(0),
            shared: Arc::clone(&shared),
            transport,
            producer,
            state: Mutex::new(LayerState {
                preferred,
                current: None,
                target: None,
                effective: None,
                ts_offset: 0,
                last_sent_input_ts: None,
                last_sent_at: None,
            }),
            seq_manager: Mutex::new(SeqManager::new()),
            rtp_stream: Mutex::new(None),
            score_state: Mutex::new(ConsumerScore {
                // The outgoing stream has seen no loss yet; the consumer
                // starts at its producer's best stream score.
                score: initial_producer_score,
                producer_score: initial_producer_score,
                producer_scores,
            }),
            trace_event_types: Mutex::new(HashSet::new()),
        });

        shared.registrator.register(
            &id,
            Arc::downgrade(&consumer) as Weak<dyn ChannelRequestHandler>,
            Some(Arc::downgrade(&consumer) as Weak<dyn PayloadRequestHandler>),
            None,
        )?;

        Ok(consumer)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn consumer_type(&self) -> ConsumerType {
        self.consumer_type
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn producer_paused(&self) -> bool {
        self.producer_paused.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::SeqCst)
    }

    /// Forwarding iff not paused on either side.
    pub fn is_active(&self) -> bool {
        !self.paused() && !self.producer_paused() && !self.closed()
    }

    pub fn score(&self) -> ConsumerScore {
        self.score_state.lock().unwrap().clone()
    }

    pub fn current_layers(&self) -> Option<ConsumerLayers> {
        self.state
            .lock()
            .unwrap()
            .current
            .map(Layers::to_consumer_layers)
    }

    pub fn preferred_layers(&self) -> ConsumerLayers {
        self.state.lock().unwrap().preferred.to_consumer_layers()
    }

    /// The media SSRC this consumer sends with.
    fn outgoing_ssrc(&self) -> Option<u32> {
        self.rtp_parameters.encodings.first().and_then(|e| e.ssrc)
    }

    pub(crate) fn has_ssrc(&self, ssrc: u32) -> bool {
        self.rtp_parameters.encodings.iter().any(|e| {
            e.ssrc == Some(ssrc) || e.rtx.map(|r| r.ssrc == ssrc).unwrap_or(false)
        })
    }

    // ------------------------------------------------------------------
    // Forwarding
    // ------------------------------------------------------------------

    /// Offer one of the producer's packets to this consumer. The consumer
    /// decides to forward, drop or defer, and performs the rewrite.
    pub(crate) async fn send_rtp_packet(&self, packet: &rtp::packet::Packet, info: &PacketInfo) {
        if !self.is_active() {
            return;
        }

        let rewritten = {
            let mut state = self.state.lock().unwrap();
            match self.consumer_type {
                ConsumerType::Pipe => self.rewrite(&mut state, packet, false),
                ConsumerType::Simple => {
                    if self.ignore_dtx && info.payload.is_dtx {
                        self.seq_manager
                            .lock()
                            .unwrap()
                            .drop_input(packet.header.sequence_number);
                        None
                    } else {
                        self.rewrite(&mut state, packet, false)
                    }
                }
                ConsumerType::Simulcast => self.select_simulcast(&mut state, packet, info),
                ConsumerType::Svc => self.select_svc(&mut state, packet, info),
            }
        };

        let Some(rewritten) = rewritten else {
            return;
        };

        let Some(transport) = self.transport.upgrade() else {
            return;
        };
        if let Err(err) = transport.send_rtp_from_consumer(self, &rewritten).await {
            log::debug!("cannot send RTP packet [consumerId:{}]: {err}", self.id);
        }
    }

    /// Simulcast selection: spatial stream hopping with key-frame gates.
    fn select_simulcast(
        &self,
        state: &mut LayerState,
        packet: &rtp::packet::Packet,
        info: &PacketInfo,
    ) -> Option<rtp::packet::Packet> {
        if state.target.is_none() {
            let _ = self.recompute_target_locked(state, Instant::now());
        }

        // Commit a pending switch when the target stream delivers its key
        // frame.
        if let Some(target) = state.target {
            let switching = state.current.map(|c| c.spatial != target.spatial).unwrap_or(true);
            if switching && info.spatial_index == target.spatial && info.payload.is_key_frame {
                self.commit_layers(state, target, packet);
            }
        }

        let current = state.current?;
        if info.spatial_index != current.spatial {
            return None;
        }

        // Temporal filtering within the current stream.
        if let Some(tid) = info.payload.temporal_layer {
            if tid > current.temporal {
                self.seq_manager
                    .lock()
                    .unwrap()
                    .drop_input(packet.header.sequence_number);
                return None;
            }
        }

        if self.ignore_dtx && info.payload.is_dtx {
            self.seq_manager
                .lock()
                .unwrap()
                .drop_input(packet.header.sequence_number);
            return None;
        }

        self.rewrite(state, packet, true)
    }

    /// SVC selection: one stream, layers filtered by the payload descriptor.
    fn select_svc(
        &self,
        state: &mut LayerState,
        packet: &rtp::packet::Packet,
        info: &PacketInfo,
    ) -> Option<rtp::packet::Packet> {
        if state.target.is_none() {
            let _ = self.recompute_target_locked(state, Instant::now());
        }

        if let Some(target) = state.target {
            if state.current != Some(target) && info.payload.is_key_frame {
                self.commit_layers(state, target, packet);
            }
        }

        let current = state.current?;

        if let Some(sid) = info.payload.spatial_layer {
            if sid > current.spatial {
                self.seq_manager
                    .lock()
                    .unwrap()
                    .drop_input(packet.header.sequence_number);
                return None;
            }
        }
        if let Some(tid) = info.payload.temporal_layer {
            if tid > current.temporal {
                self.seq_manager
                    .lock()
                    .unwrap()
                    .drop_input(packet.header.sequence_number);
                return None;
            }
        }

        self.rewrite(state, packet, false)
    }

    /// `currentLayers ← targetLayers`, with timestamp continuity across the
    /// stream switch.
    fn commit_layers(&self, state: &mut LayerState, target: Layers, packet: &rtp::packet::Packet) {
        let is_spatial_switch = state
            .current
            .map(|c| c.spatial != target.spatial)
            .unwrap_or(false);

        if is_spatial_switch || state.current.is_none() {
            if let (Some(last_input_ts), Some(last_sent_at)) =
                (state.last_sent_input_ts, state.last_sent_at)
            {
                // Make the new stream's timestamps continue where the old
                // stream left off, advanced by the elapsed wall clock.
                let clock_rate = self
                    .rtp_parameters
                    .media_codec()
                    .map(|c| c.clock_rate)
                    .unwrap_or(90000);
                let elapsed_ts = (Instant::now()
                    .saturating_duration_since(last_sent_at)
                    .as_secs_f64()
                    * f64::from(clock_rate)) as u32;
                let last_output_ts = last_input_ts.wrapping_sub(state.ts_offset);
                let next_output_ts = last_output_ts.wrapping_add(elapsed_ts.max(1));
                state.ts_offset = packet.header.timestamp.wrapping_sub(next_output_ts);
            }
            if state.last_sent_input_ts.is_some() {
                self.seq_manager.lock().unwrap().sync();
            }
        }

        state.current = Some(target);
        state.effective = Some(target);

        self.shared.notifier.emit_with_data(
            &self.id,
            "layerschange",
            json!({
                "spatialLayer": target.spatial,
                "temporalLayer": target.temporal,
            }),
        );
        log::debug!(
            "Consumer layers changed [consumerId:{}, spatial:{}, temporal:{}]",
            self.id,
            target.spatial,
            target.temporal
        );
    }

    /// Rewrite a packet into the consumer's negotiated space: SSRC, payload
    /// type, sequence number, timestamp and header extension ids. The marker
    /// bit and payload (RED/ULPFEC included) pass through untouched.
    fn rewrite(
        &self,
        state: &mut LayerState,
        packet: &rtp::packet::Packet,
        rewrite_timestamp: bool,
    ) -> Option<rtp::packet::Packet> {
        let mut out = packet.clone();

        if let Some(ssrc) = self.outgoing_ssrc() {
            out.header.ssrc = ssrc;
        }
        if let Some(codec) = self.rtp_parameters.media_codec() {
            out.header.payload_type = codec.payload_type;
        }

        out.header.sequence_number = self
            .seq_manager
            .lock()
            .unwrap()
            .input(packet.header.sequence_number);

        if rewrite_timestamp {
            out.header.timestamp = packet.header.timestamp.wrapping_sub(state.ts_offset);
        }

        self.remap_extensions(&mut out);

        state.last_sent_input_ts = Some(packet.header.timestamp);
        state.last_sent_at = Some(Instant::now());

        Some(out)
    }

    /// Re-id header extensions into the consumer's negotiated set; unmapped
    /// extensions are dropped.
    fn remap_extensions(&self, packet: &mut rtp::packet::Packet) {
        if packet.header.extensions.is_empty() {
            return;
        }

        let Some(producer) = self.producer.upgrade() else {
            return;
        };
        let producer_params = producer.rtp_parameters();

        let mut kept: Vec<rtp::header::Extension> = Vec::new();
        for extension in &packet.header.extensions {
            let uri = producer_params
                .header_extensions
                .iter()
                .find(|e| e.id == extension.id)
                .map(|e| e.uri.as_str());
            let Some(uri) = uri else {
                continue;
            };
            if let Some(new_id) = self.rtp_parameters.header_extension_id(uri) {
                kept.push(rtp::header::Extension {
                    id: new_id,
                    payload: extension.payload.clone(),
                });
            }
        }

        if kept.is_empty() {
            packet.header.extension = false;
            packet.header.extension_profile = 0;
        }
        packet.header.extensions = kept;
    }

    /// Called by the transport after the packet left, to keep the outgoing
    /// stream stats and the retransmission buffer in sync.
    pub(crate) fn packet_sent(&self, raw: Bytes, seq: u16, timestamp: u32) {
        let mut rtp_stream = self.rtp_stream.lock().unwrap();
        let stream = rtp_stream.get_or_insert_with(|| {
            let use_nack = self
                .negotiated_feedback
                .iter()
                .any(|fb| fb.r#type == "nack" && fb.parameter.is_empty());
            RtpStreamSend::new(RtpStreamParams {
                ssrc: self.outgoing_ssrc().unwrap_or(0),
                payload_type: self
                    .rtp_parameters
                    .media_codec()
                    .map(|c| c.payload_type)
                    .unwrap_or(0),
                mime_type: self
                    .rtp_parameters
                    .media_codec()
                    .map(|c| c.mime_type.clone())
                    .unwrap_or_default(),
                clock_rate: self
                    .rtp_parameters
                    .media_codec()
                    .map(|c| c.clock_rate)
                    .unwrap_or(90000),
                use_nack,
                ..Default::default()
            })
        });
        stream.send_packet(seq, timestamp, raw, Instant::now());
    }

    // ------------------------------------------------------------------
    // Layer targeting
    // ------------------------------------------------------------------

    /// Recompute `targetLayers` from preference, stream availability and the
    /// allocated bitrate; request a key frame when a spatial move is needed.
    fn recompute_target_locked(&self, state: &mut LayerState, now: Instant) -> Option<Layers> {
        if !matches!(self.consumer_type, ConsumerType::Simulcast | ConsumerType::Svc) {
            return None;
        }

        let Some(producer) = self.producer.upgrade() else {
            return None;
        };

        let max_layers = max_layers_of(self.consumer_type, &self.consumable_encodings);

        let spatial = if self.consumer_type == ConsumerType::Svc {
            state.preferred.spatial.min(max_layers.spatial)
        } else {
            let available = producer.active_spatial_indexes(now);
            if available.is_empty() {
                return None;
            }
            // Highest available healthy layer at or below the preference,
            // else the lowest available one.
            let healthy: Vec<u8> = available
                .iter()
                .copied()
                .filter(|index| producer.stream_score(*index) >= crate::rtp_stream::recv::HEALTHY_SCORE
                    || available.len() == 1)
                .collect();
            let candidates = if healthy.is_empty() { &available } else { &healthy };
            let mut chosen = *candidates.first()?;
            for index in candidates {
                if *index <= state.preferred.spatial && *index > chosen {
                    chosen = *index;
                } else if chosen > state.preferred.spatial && *index < chosen {
                    chosen = *index;
                }
            }

            // Bitrate bound: step down while the allocation cannot carry the
            // chosen stream.
            let allocated = self.allocated_bitrate.load(Ordering::SeqCst);
            if allocated > 0 {
                let mut affordable = chosen;
                while affordable > *candidates.first()? {
                    let needed = producer.measured_bitrate(affordable, now);
                    if needed == 0 || needed <= allocated {
                        break;
                    }
                    let lower = candidates
                        .iter()
                        .copied()
                        .filter(|i| *i < affordable)
                        .max();
                    match lower {
                        Some(lower) => affordable = lower,
                        None => break,
                    }
                }
                chosen = affordable;
            }
            chosen
        };

        let temporal = state.preferred.temporal.min(max_layers.temporal);
        let target = Layers { spatial, temporal };

        let previous_target = state.target;
        state.target = Some(target);

        match state.current {
            Some(current) if current.spatial == target.spatial => {
                // Temporal-only move commits immediately.
                if current.temporal != target.temporal {
                    state.current = Some(target);
                    state.effective = Some(target);
                    self.shared.notifier.emit_with_data(
                        &self.id,
                        "layerschange",
                        json!({
                            "spatialLayer": target.spatial,
                            "temporalLayer": target.temporal,
                        }),
                    );
                }
            }
            _ => {
                if previous_target != Some(target) {
                    return Some(target);
                }
            }
        }
        None
    }

    async fn recompute_target(&self, now: Instant) {
        let needs_key_frame = {
            let mut state = self.state.lock().unwrap();
            self.recompute_target_locked(&mut state, now)
        };
        if let Some(target) = needs_key_frame {
            if let Some(producer) = self.producer.upgrade() {
                producer.request_key_frame(target.spatial, now).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Feedback and allocation input
    // ------------------------------------------------------------------

    /// PLI/FIR from this consumer's endpoint: deduplicated upstream by the
    /// producer and the transport coalescer.
    pub(crate) async fn receive_key_frame_request(&self, now: Instant) {
        if self.kind != MediaKind::Video {
            return;
        }
        self.request_key_frame_upstream(now).await;
    }

    pub(crate) async fn request_key_frame_upstream(&self, now: Instant) {
        let spatial = {
            let state = self.state.lock().unwrap();
            state
                .target
                .or(state.current)
                .map(|l| l.spatial)
                .unwrap_or(0)
        };
        if let Some(producer) = self.producer.upgrade() {
            producer.request_key_frame(spatial, now).await;
        }
    }

    pub(crate) async fn receive_nack(
        &self,
        nack: &rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack,
        now: Instant,
    ) {
        let retransmissions = {
            let mut rtp_stream = self.rtp_stream.lock().unwrap();
            let Some(stream) = rtp_stream.as_mut() else {
                return;
            };
            let lost: Vec<u16> = nack.nacks.iter().flat_map(|pair| pair.packet_list()).collect();
            stream.get_retransmissions(lost.into_iter(), now)
        };

        let Some(transport) = self.transport.upgrade() else {
            return;
        };
        for raw in retransmissions {
            if let Err(err) = transport.send_raw_rtp(raw).await {
                log::debug!("cannot retransmit packet [consumerId:{}]: {err}", self.id);
                break;
            }
        }
    }

    pub(crate) async fn receive_reception_report(
        &self,
        report: &rtcp::reception_report::ReceptionReport,
    ) {
        let changed = {
            let mut rtp_stream = self.rtp_stream.lock().unwrap();
            rtp_stream
                .as_mut()
                .and_then(|stream| stream.receive_reception_report(report))
        };
        if changed.is_some() {
            self.update_score();
        }
    }

    /// The producer's stream scores moved; refresh the consumer score.
    pub(crate) fn producer_score_changed(&self) {
        self.update_score();
    }

    fn update_score(&self) {
        let Some(producer) = self.producer.upgrade() else {
            return;
        };

        let selected_spatial = {
            let state = self.state.lock().unwrap();
            state.current.map(|c| c.spatial).unwrap_or(0)
        };
        let producer_score = match self.consumer_type {
            ConsumerType::Simulcast | ConsumerType::Svc => producer.stream_score(selected_spatial),
            _ => producer.best_score(),
        };
        let own_score = {
            let rtp_stream = self.rtp_stream.lock().unwrap();
            rtp_stream.as_ref().map(|s| s.stream.score()).unwrap_or(10)
        };
        let producer_scores: Vec<u8> = producer.scores().iter().map(|s| s.score).collect();

        let new_score = ConsumerScore {
            score: own_score.min(producer_score),
            producer_score,
            producer_scores,
        };

        // Score notifications are change-debounced.
        let changed = {
            let mut score_state = self.score_state.lock().unwrap();
            if *score_state != new_score {
                *score_state = new_score.clone();
                true
            } else {
                false
            }
        };
        if changed {
            self.shared
                .notifier
                .emit_with_data(&self.id, "score", json!(new_score));
        }
    }

    pub(crate) fn current_bitrate(&self, now: Instant) -> u32 {
        let mut rtp_stream = self.rtp_stream.lock().unwrap();
        rtp_stream.as_mut().map(|s| s.bitrate(now)).unwrap_or(0)
    }

    /// The bitrate this consumer would like to be allocated.
    pub(crate) fn desired_bitrate(&self, now: Instant) -> u32 {
        let preferred_spatial = {
            let state = self.state.lock().unwrap();
            state.preferred.spatial
        };

        let declared = self
            .consumable_encodings
            .get(usize::from(preferred_spatial))
            .and_then(|e| e.max_bitrate);
        if let Some(declared) = declared {
            return declared;
        }

        self.producer
            .upgrade()
            .map(|p| p.measured_bitrate(preferred_spatial, now))
            .filter(|bitrate| *bitrate > 0)
            .unwrap_or(150_000)
    }

    /// Allocation result from the transport's outgoing allocator.
    pub(crate) async fn apply_bitrate_allocation(&self, bitrate: u32, now: Instant) {
        self.allocated_bitrate.store(bitrate, Ordering::SeqCst);
        self.recompute_target(now).await;
    }

    // ------------------------------------------------------------------
    // Producer events (router fan-out)
    // ------------------------------------------------------------------

    pub(crate) async fn producer_pause_changed(&self, paused: bool) {
        if self.producer_paused.swap(paused, Ordering::SeqCst) == paused {
            return;
        }
        let event = if paused { "producerpause" } else { "producerresume" };
        self.shared.notifier.emit(&self.id, event);
    }

    pub(crate) async fn producer_streams_changed(&self) {
        self.recompute_target(Instant::now()).await;
    }

    /// The producer is gone: close synchronously and tell the control plane.
    pub(crate) async fn producer_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.registrator.unregister(&self.id);
        self.shared.notifier.emit(&self.id, "producerclose");
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_consumer(&self.id);
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
            router.unlink_consumer(&self.producer_id, &self.id).await;
        }
    }

    fn dump(&self) -> Value {
        let state = self.state.lock().unwrap();
        json!({
            "id": self.id,
            "producerId": self.producer_id,
            "kind": self.kind,
            "type": self.consumer_type,
            "paused": self.paused(),
            "producerPaused": self.producer_paused(),
            "priority": self.priority(),
            "rtpParameters": self.rtp_parameters,
            "preferredLayers": state.preferred.to_consumer_layers(),
            "currentLayers": state.current.map(Layers::to_consumer_layers),
            "targetLayers": state.target.map(Layers::to_consumer_layers),
        })
    }

    fn get_stats(&self) -> Value {
        let now = Instant::now();
        let mut rtp_stream = self.rtp_stream.lock().unwrap();
        match rtp_stream.as_mut() {
            Some(stream) => json!([{
                "type": "outbound-rtp",
                "ssrc": stream.stream.params.ssrc,
                "score": stream.stream.score(),
                "packetCount": stream.stream.packets_count,
                "byteCount": stream.stream.bytes_count,
                "bitrate": stream.bitrate(now),
                "fractionLost": stream.fraction_lost,
                "packetsRetransmitted": stream.packets_retransmitted(),
            }]),
            None => json!([]),
        }
    }
}

#[async_trait]
impl ChannelRequestHandler for Consumer {
    async fn handle_channel_request(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        if self.closed() {
            return Err(Error::ErrClosed("Consumer"));
        }

        match request.method {
            Method::ConsumerDump => Ok(Some(self.dump())),
            Method::ConsumerGetStats => Ok(Some(self.get_stats())),
            Method::ConsumerPause => {
                if !self.paused.swap(true, Ordering::SeqCst) {
                    log::debug!("Consumer paused [consumerId:{}]", self.id);
                }
                Ok(None)
            }
            Method::ConsumerResume => {
                if self.paused.swap(false, Ordering::SeqCst) {
                    // Resuming a video consumer needs a fresh key frame.
                    if self.kind == MediaKind::Video {
                        self.request_key_frame_upstream(Instant::now()).await;
                    }
                }
                Ok(None)
            }
            Method::ConsumerSetPreferredLayers => {
                let layers: ConsumerLayers = crate::transport::parse_body(&request.data)?;
                let max_layers = max_layers_of(self.consumer_type, &self.consumable_encodings);
                {
                    let mut state = self.state.lock().unwrap();
                    state.preferred = Layers {
                        spatial: layers.spatial_layer.min(max_layers.spatial),
                        temporal: layers
                            .temporal_layer
                            .unwrap_or(max_layers.temporal)
                            .min(max_layers.temporal),
                    };
                }
                self.recompute_target(Instant::now()).await;
                Ok(Some(json!(self.preferred_layers())))
            }
            Method::ConsumerSetPriority => {
                #[derive(Deserialize)]
                struct Body {
                    priority: u8,
                }
                let body: Body = crate::transport::parse_body(&request.data)?;
                if body.priority < 1 {
                    return Err(Error::type_error("priority must be 1 or higher"));
                }
                self.priority.store(body.priority, Ordering::SeqCst);
                Ok(Some(json!({ "priority": body.priority })))
            }
            Method::ConsumerRequestKeyFrame => {
                self.request_key_frame_upstream(Instant::now()).await;
                Ok(None)
            }
            Method::ConsumerEnableTraceEvent => {
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
                "unknown method \"{}\" for a Consumer",
                request.method
            ))),
        }
    }
}

#[async_trait]
impl PayloadRequestHandler for Consumer {
    async fn handle_payload_request(&self, request: &PayloadRequest) -> Result<Option<Value>> {
        Err(Error::type_error(format!(
            "unknown payload method \"{}\" for a Consumer",
            request.request.method
        )))
    }
}

/// The highest layers the consumable encodings can provide.
fn max_layers_of(consumer_type: ConsumerType, encodings: &[RtpEncodingParameters]) -> Layers {
    match consumer_type {
        ConsumerType::Svc => {
            let scalability = encodings
                .first()
                .map(|e| e.scalability())
                .unwrap_or_default();
            Layers {
                spatial: scalability.spatial_layers.saturating_sub(1),
                temporal: scalability.temporal_layers.saturating_sub(1),
            }
        }
        ConsumerType::Simulcast => {
            let temporal = encodings
                .iter()
                .map(|e| e.scalability().temporal_layers)
                .max()
                .unwrap_or(1)
                .saturating_sub(1);
            Layers {
                spatial: (encodings.len().max(1) - 1) as u8,
                temporal,
            }
        }
        _ => Layers {
            spatial: 0,
            temporal: 0,
        },
    }
}
