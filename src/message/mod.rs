pub mod codec;

#[cfg(test)]
mod codec_test;

use bytes::Bytes;
use serde_json::Value;

use crate::error::WireErrorKind;

/// Binary length for a 4 MiB payload plus the frame header.
pub const MESSAGE_MAX_LEN: usize = PAYLOAD_MAX_LEN + 4;
pub const PAYLOAD_MAX_LEN: usize = 4 * 1024 * 1024;

/// Every request method the worker dispatches, with its stable numeric id.
///
/// Ids are part of the schema shared with the control plane; the textual
/// names exist for the legacy request form and for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Method {
    WorkerClose = 0x0101,
    WorkerDump = 0x0102,
    WorkerGetResourceUsage = 0x0103,
    WorkerUpdateSettings = 0x0104,
    WorkerCreateWebRtcServer = 0x0105,
    WorkerCloseWebRtcServer = 0x0106,
    WorkerCreateRouter = 0x0107,
    WorkerCloseRouter = 0x0108,

    WebRtcServerDump = 0x0201,

    RouterDump = 0x0301,
    RouterCreateWebRtcTransport = 0x0302,
    RouterCreatePlainTransport = 0x0303,
    RouterCreatePipeTransport = 0x0304,
    RouterCreateDirectTransport = 0x0305,
    RouterCloseTransport = 0x0306,
    RouterCreateActiveSpeakerObserver = 0x0307,
    RouterCreateAudioLevelObserver = 0x0308,
    RouterCloseRtpObserver = 0x0309,
    RouterCanConsume = 0x030A,
    RouterPipeToRouter = 0x030B,

    TransportDump = 0x0401,
    TransportGetStats = 0x0402,
    TransportConnect = 0x0403,
    TransportSetMaxIncomingBitrate = 0x0404,
    TransportSetMaxOutgoingBitrate = 0x0405,
    TransportSetMinOutgoingBitrate = 0x0406,
    TransportRestartIce = 0x0407,
    TransportProduce = 0x0408,
    TransportConsume = 0x0409,
    TransportProduceData = 0x040A,
    TransportConsumeData = 0x040B,
    TransportEnableTraceEvent = 0x040C,
    TransportCloseProducer = 0x040D,
    TransportCloseConsumer = 0x040E,
    TransportCloseDataProducer = 0x040F,
    TransportCloseDataConsumer = 0x0410,

    ProducerDump = 0x0501,
    ProducerGetStats = 0x0502,
    ProducerPause = 0x0503,
    ProducerResume = 0x0504,
    ProducerEnableTraceEvent = 0x0505,

    ConsumerDump = 0x0601,
    ConsumerGetStats = 0x0602,
    ConsumerPause = 0x0603,
    ConsumerResume = 0x0604,
    ConsumerSetPreferredLayers = 0x0605,
    ConsumerSetPriority = 0x0606,
    ConsumerRequestKeyFrame = 0x0607,
    ConsumerEnableTraceEvent = 0x0608,

    DataProducerDump = 0x0701,
    DataProducerGetStats = 0x0702,
    DataProducerPause = 0x0703,
    DataProducerResume = 0x0704,

    DataConsumerDump = 0x0801,
    DataConsumerGetStats = 0x0802,
    DataConsumerPause = 0x0803,
    DataConsumerResume = 0x0804,
    DataConsumerGetBufferedAmount = 0x0805,
    DataConsumerSetBufferedAmountLowThreshold = 0x0806,

    RtpObserverPause = 0x0901,
    RtpObserverResume = 0x0902,
    RtpObserverAddProducer = 0x0903,
    RtpObserverRemoveProducer = 0x0904,
}

static METHOD_TABLE: &[(Method, &str)] = &[
    (Method::WorkerClose, "worker.close"),
    (Method::WorkerDump, "worker.dump"),
    (Method::WorkerGetResourceUsage, "worker.getResourceUsage"),
    (Method::WorkerUpdateSettings, "worker.updateSettings"),
    (Method::WorkerCreateWebRtcServer, "worker.createWebRtcServer"),
    (Method::WorkerCloseWebRtcServer, "worker.closeWebRtcServer"),
    (Method::WorkerCreateRouter, "worker.createRouter"),
    (Method::WorkerCloseRouter, "worker.closeRouter"),
    (Method::WebRtcServerDump, "webRtcServer.dump"),
    (Method::RouterDump, "router.dump"),
    (
        Method::RouterCreateWebRtcTransport,
        "router.createWebRtcTransport",
    ),
    (
        Method::RouterCreatePlainTransport,
        "router.createPlainTransport",
    ),
    (
        Method::RouterCreatePipeTransport,
        "router.createPipeTransport",
    ),
    (
        Method::RouterCreateDirectTransport,
        "router.createDirectTransport",
    ),
    (Method::RouterCloseTransport, "router.closeTransport"),
    (
        Method::RouterCreateActiveSpeakerObserver,
        "router.createActiveSpeakerObserver",
    ),
    (
        Method::RouterCreateAudioLevelObserver,
        "router.createAudioLevelObserver",
    ),
    (Method::RouterCloseRtpObserver, "router.closeRtpObserver"),
    (Method::RouterCanConsume, "router.canConsume"),
    (Method::RouterPipeToRouter, "router.pipeToRouter"),
    (Method::TransportDump, "transport.dump"),
    (Method::TransportGetStats, "transport.getStats"),
    (Method::TransportConnect, "transport.connect"),
    (
        Method::TransportSetMaxIncomingBitrate,
        "transport.setMaxIncomingBitrate",
    ),
    (
        Method::TransportSetMaxOutgoingBitrate,
        "transport.setMaxOutgoingBitrate",
    ),
    (
        Method::TransportSetMinOutgoingBitrate,
        "transport.setMinOutgoingBitrate",
    ),
    (Method::TransportRestartIce, "transport.restartIce"),
    (Method::TransportProduce, "transport.produce"),
    (Method::TransportConsume, "transport.consume"),
    (Method::TransportProduceData, "transport.produceData"),
    (Method::TransportConsumeData, "transport.consumeData"),
    (
        Method::TransportEnableTraceEvent,
        "transport.enableTraceEvent",
    ),
    (Method::TransportCloseProducer, "transport.closeProducer"),
    (Method::TransportCloseConsumer, "transport.closeConsumer"),
    (
        Method::TransportCloseDataProducer,
        "transport.closeDataProducer",
    ),
    (
        Method::TransportCloseDataConsumer,
        "transport.closeDataConsumer",
    ),
    (Method::ProducerDump, "producer.dump"),
    (Method::ProducerGetStats, "producer.getStats"),
    (Method::ProducerPause, "producer.pause"),
    (Method::ProducerResume, "producer.resume"),
    (Method::ProducerEnableTraceEvent, "producer.enableTraceEvent"),
    (Method::ConsumerDump, "consumer.dump"),
    (Method::ConsumerGetStats, "consumer.getStats"),
    (Method::ConsumerPause, "consumer.pause"),
    (Method::ConsumerResume, "consumer.resume"),
    (
        Method::ConsumerSetPreferredLayers,
        "consumer.setPreferredLayers",
    ),
    (Method::ConsumerSetPriority, "consumer.setPriority"),
    (Method::ConsumerRequestKeyFrame, "consumer.requestKeyFrame"),
    (Method::ConsumerEnableTraceEvent, "consumer.enableTraceEvent"),
    (Method::DataProducerDump, "dataProducer.dump"),
    (Method::DataProducerGetStats, "dataProducer.getStats"),
    (Method::DataProducerPause, "dataProducer.pause"),
    (Method::DataProducerResume, "dataProducer.resume"),
    (Method::DataConsumerDump, "dataConsumer.dump"),
    (Method::DataConsumerGetStats, "dataConsumer.getStats"),
    (Method::DataConsumerPause, "dataConsumer.pause"),
    (Method::DataConsumerResume, "dataConsumer.resume"),
    (
        Method::DataConsumerGetBufferedAmount,
        "dataConsumer.getBufferedAmount",
    ),
    (
        Method::DataConsumerSetBufferedAmountLowThreshold,
        "dataConsumer.setBufferedAmountLowThreshold",
    ),
    (Method::RtpObserverPause, "rtpObserver.pause"),
    (Method::RtpObserverResume, "rtpObserver.resume"),
    (Method::RtpObserverAddProducer, "rtpObserver.addProducer"),
    (
        Method::RtpObserverRemoveProducer,
        "rtpObserver.removeProducer",
    ),
];

impl Method {
    pub fn id(&self) -> u16 {
        *self as u16
    }

    pub fn as_str(&self) -> &'static str {
        METHOD_TABLE
            .iter()
            .find(|(m, _)| m == self)
            .map(|(_, s)| *s)
            .unwrap_or("unknown")
    }

    pub fn from_id(id: u16) -> Option<Method> {
        METHOD_TABLE.iter().find(|(m, _)| m.id() == id).map(|(m, _)| *m)
    }

    pub fn from_name(name: &str) -> Option<Method> {
        METHOD_TABLE.iter().find(|(_, s)| *s == name).map(|(m, _)| *m)
    }

    /// Worker-targeted methods skip the registrator lookup.
    pub fn is_worker_method(&self) -> bool {
        (self.id() >> 8) == 0x01
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A control channel request as received from the control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    pub id: u32,
    pub method: Method,
    pub handler_id: String,
    pub data: Value,
}

/// The worker's answer to a single request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseResult {
    Accepted(Option<Value>),
    Rejected { kind: WireErrorKind, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelResponse {
    pub id: u32,
    pub result: ResponseResult,
}

/// A one-way event emitted by the worker on the control channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelNotification {
    pub target_id: String,
    pub event: String,
    pub data: Value,
}

/// A payload channel request: a request plus a raw binary tail.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadRequest {
    pub request: ChannelRequest,
    pub payload: Bytes,
}

/// A payload channel notification with its raw binary tail. Inbound these
/// carry RTP/RTCP/data messages into Direct transports; outbound they carry
/// packets back to the control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadNotification {
    pub target_id: String,
    pub event: String,
    pub data: Value,
    pub payload: Bytes,
}

/// Frames decoded from the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    Request(ChannelRequest),
    Response(ChannelResponse),
    Notification(ChannelNotification),
}

/// Frames decoded from the payload channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadFrame {
    Request(PayloadRequest),
    Notification(PayloadNotification),
}
