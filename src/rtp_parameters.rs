//! The RTP parameters data model exchanged with the control plane.
//!
//! These mirror the schema registry: producers describe what they send,
//! consumers describe what their endpoint negotiated, and the router matches
//! the two through [`crate::ortc`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MIME_TYPE_OPUS: &str = "audio/opus";
pub const MIME_TYPE_VP8: &str = "video/VP8";
pub const MIME_TYPE_VP9: &str = "video/VP9";
pub const MIME_TYPE_H264: &str = "video/H264";
pub const MIME_TYPE_RTX: &str = "video/rtx";

pub const EXT_URI_MID: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
pub const EXT_URI_RID: &str = "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id";
pub const EXT_URI_RRID: &str = "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id";
pub const EXT_URI_AUDIO_LEVEL: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
pub const EXT_URI_VIDEO_ORIENTATION: &str = "urn:3gpp:video-orientation";
pub const EXT_URI_ABS_SEND_TIME: &str =
    "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
pub const EXT_URI_TRANSPORT_CC: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// A codec's fmtp-style parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Number(u32),
    Text(String),
}

/// One entry of the `rtcpFeedback` list of a codec.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtcpFeedback {
    pub r#type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ParameterValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    pub fn kind(&self) -> Option<MediaKind> {
        match self.mime_type.split('/').next() {
            Some("audio") => Some(MediaKind::Audio),
            Some("video") => Some(MediaKind::Video),
            _ => None,
        }
    }

    pub fn is_rtx(&self) -> bool {
        self.mime_type.to_lowercase().ends_with("/rtx")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u8,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub encrypt: bool,
}

/// RTX retransmission SSRC associated with an encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtxParameters {
    pub ssrc: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpEncodingParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtxParameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtx: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
}

impl RtpEncodingParameters {
    pub fn scalability(&self) -> ScalabilityMode {
        self.scalability_mode
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtcpParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    pub reduced_size: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub encodings: Vec<RtpEncodingParameters>,
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    /// The first media codec (non-RTX); every valid parameter set has one.
    pub fn media_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.iter().find(|c| !c.is_rtx())
    }

    /// Negotiated id for a header extension uri, if any.
    pub fn header_extension_id(&self, uri: &str) -> Option<u8> {
        self.header_extensions
            .iter()
            .find(|ext| ext.uri == uri)
            .map(|ext| ext.id)
    }
}

/// Remote capabilities handed to `router.canConsume` / `transport.consume`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
}

/// Association-level SCTP parameters of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SctpParameters {
    pub port: u16,
    /// Initially requested number of outgoing SCTP streams.
    pub os: u16,
    /// Maximum number of incoming SCTP streams.
    pub mis: u16,
    pub max_message_size: u32,
}

impl Default for SctpParameters {
    fn default() -> Self {
        SctpParameters {
            port: 5000,
            os: 1024,
            mis: 1024,
            max_message_size: 262144,
        }
    }
}

/// Per-stream SCTP parameters of a data producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SctpStreamParameters {
    pub stream_id: u16,
    pub ordered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_packet_life_time: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retransmits: Option<u16>,
}

/// Parsed `LxTy[_KEY]` scalability mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalabilityMode {
    pub spatial_layers: u8,
    pub temporal_layers: u8,
    pub ksvc: bool,
}

impl Default for ScalabilityMode {
    fn default() -> Self {
        ScalabilityMode {
            spatial_layers: 1,
            temporal_layers: 1,
            ksvc: false,
        }
    }
}

impl std::str::FromStr for ScalabilityMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (base, ksvc) = match s.strip_suffix("_KEY") {
            Some(base) => (base, true),
            None => (s, false),
        };

        let rest = base
            .strip_prefix('L')
            .or_else(|| base.strip_prefix('S'))
            .ok_or_else(|| Error::type_error(format!("invalid scalabilityMode \"{s}\"")))?;
        let (spatial, temporal) = rest
            .split_once('T')
            .ok_or_else(|| Error::type_error(format!("invalid scalabilityMode \"{s}\"")))?;

        let spatial_layers: u8 = spatial
            .parse()
            .map_err(|_| Error::type_error(format!("invalid scalabilityMode \"{s}\"")))?;
        let temporal_layers: u8 = temporal
            .parse()
            .map_err(|_| Error::type_error(format!("invalid scalabilityMode \"{s}\"")))?;

        if spatial_layers == 0 || temporal_layers == 0 {
            return Err(Error::type_error(format!("invalid scalabilityMode \"{s}\"")));
        }

        Ok(ScalabilityMode {
            spatial_layers,
            temporal_layers,
            ksvc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalability_mode_parsing() {
        let mode: ScalabilityMode = "L3T2".parse().unwrap();
        assert_eq!(mode.spatial_layers, 3);
        assert_eq!(mode.temporal_layers, 2);
        assert!(!mode.ksvc);

        let mode: ScalabilityMode = "L1T3_KEY".parse().unwrap();
        assert_eq!(mode.spatial_layers, 1);
        assert_eq!(mode.temporal_layers, 3);
        assert!(mode.ksvc);

        let mode: ScalabilityMode = "S2T1".parse().unwrap();
        assert_eq!(mode.spatial_layers, 2);

        assert!("T3".parse::<ScalabilityMode>().is_err());
        assert!("L0T1".parse::<ScalabilityMode>().is_err());
    }

    #[test]
    fn rtp_parameters_deserialize_camel_case() {
        let params: RtpParameters = serde_json::from_value(serde_json::json!({
            "mid": "0",
            "codecs": [{
                "mimeType": "video/VP8",
                "payloadType": 101,
                "clockRate": 90000,
                "rtcpFeedback": [
                    { "type": "nack" },
                    { "type": "ccm", "parameter": "fir" }
                ]
            }],
            "headerExtensions": [
                { "uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "id": 1 }
            ],
            "encodings": [
                { "ssrc": 1111, "rtx": { "ssrc": 1112 } }
            ],
            "rtcp": { "cname": "cname1", "reducedSize": true }
        }))
        .unwrap();

        assert_eq!(params.mid.as_deref(), Some("0"));
        assert_eq!(params.codecs[0].payload_type, 101);
        assert_eq!(params.codecs[0].rtcp_feedback.len(), 2);
        assert_eq!(params.header_extension_id(EXT_URI_MID), Some(1));
        assert_eq!(params.encodings[0].rtx.unwrap().ssrc, 1112);
        assert!(params.rtcp.reduced_size);
    }
}
