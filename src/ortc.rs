//! Matching between producer parameters and consumer capabilities.
//!
//! The router never negotiates: the control plane supplies both sides and
//! the worker only has to decide whether they are compatible and, for a new
//! consumer, which feedback entries survive the intersection.

use crate::error::{Error, Result};
use crate::rtp_parameters::{
    ParameterValue, RtcpFeedback, RtpCapabilities, RtpCodecParameters, RtpParameters,
};

/// How closely two codec descriptions match.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd)]
pub(crate) enum CodecMatch {
    None,
    Partial,
    Exact,
}

/// Codec parameters that are distinguishing: two codecs whose values differ
/// are different codecs even under the same mime type.
const DISTINGUISHING_PARAMETERS: &[&str] = &["packetization-mode", "profile-level-id", "profile-id"];

fn match_parameters(a: &RtpCodecParameters, b: &RtpCodecParameters) -> bool {
    for name in DISTINGUISHING_PARAMETERS {
        let left = a.parameters.get(*name);
        let right = b.parameters.get(*name);
        let equal = match (left, right) {
            (None, None) => true,
            (Some(ParameterValue::Number(l)), Some(ParameterValue::Number(r))) => l == r,
            (Some(ParameterValue::Text(l)), Some(ParameterValue::Text(r))) => l == r,
            // packetization-mode defaults to 0 when absent.
            (None, Some(ParameterValue::Number(0))) | (Some(ParameterValue::Number(0)), None)
                if *name == "packetization-mode" =>
            {
                true
            }
            _ => false,
        };
        if !equal {
            return false;
        }
    }
    true
}

/// Fuzzy codec lookup: exact on mime type + clock rate + channels +
/// distinguishing parameters, partial on mime type + clock rate alone.
pub(crate) fn codec_fuzzy_search<'a>(
    needle: &RtpCodecParameters,
    haystack: &'a [RtpCodecParameters],
) -> (Option<&'a RtpCodecParameters>, CodecMatch) {
    let needle_mime = needle.mime_type.to_lowercase();

    for codec in haystack {
        if codec.mime_type.to_lowercase() == needle_mime
            && codec.clock_rate == needle.clock_rate
            && codec.channels.unwrap_or(1) == needle.channels.unwrap_or(1)
            && match_parameters(needle, codec)
        {
            return (Some(codec), CodecMatch::Exact);
        }
    }

    for codec in haystack {
        if codec.mime_type.to_lowercase() == needle_mime && codec.clock_rate == needle.clock_rate {
            return (Some(codec), CodecMatch::Partial);
        }
    }

    (None, CodecMatch::None)
}

/// Intersection of the feedback lists of two matched codecs.
pub(crate) fn reduce_rtcp_feedback(
    producer_codec: &RtpCodecParameters,
    consumer_codec: &RtpCodecParameters,
) -> Vec<RtcpFeedback> {
    consumer_codec
        .rtcp_feedback
        .iter()
        .filter(|fb| {
            producer_codec
                .rtcp_feedback
                .iter()
                .any(|other| other.r#type == fb.r#type && other.parameter == fb.parameter)
        })
        .cloned()
        .collect()
}

/// Whether the given capabilities can consume the producer's parameters:
/// true iff at least one producer media codec matches a capability codec.
pub fn can_consume(producer_params: &RtpParameters, capabilities: &RtpCapabilities) -> bool {
    producer_params
        .codecs
        .iter()
        .filter(|codec| !codec.is_rtx())
        .any(|codec| {
            let (_, matched) = codec_fuzzy_search(codec, &capabilities.codecs);
            matched != CodecMatch::None
        })
}

/// Validate consumer parameters against their producer and compute the
/// feedback intersection the consumer will operate with.
pub(crate) fn get_consumer_feedback(
    producer_params: &RtpParameters,
    consumer_params: &RtpParameters,
) -> Result<Vec<RtcpFeedback>> {
    let producer_codec = producer_params
        .media_codec()
        .ok_or_else(|| Error::type_error("producer rtpParameters have no media codec"))?;
    let consumer_codec = consumer_params
        .media_codec()
        .ok_or_else(|| Error::type_error("consumer rtpParameters have no media codec"))?;

    let (_, matched) = codec_fuzzy_search(consumer_codec, std::slice::from_ref(producer_codec));
    if matched == CodecMatch::None {
        return Err(Error::other("consumer codec does not match producer codec"));
    }

    Ok(reduce_rtcp_feedback(producer_codec, consumer_codec))
}

/// Validate producer parameters before creating the producer.
pub(crate) fn validate_rtp_parameters(params: &RtpParameters) -> Result<()> {
    if params.codecs.is_empty() {
        return Err(Error::type_error("rtpParameters have no codecs"));
    }
    if params.media_codec().is_none() {
        return Err(Error::type_error("rtpParameters have no media codec"));
    }
    for codec in &params.codecs {
        if codec.kind().is_none() {
            return Err(Error::type_error(format!(
                "invalid codec mimeType \"{}\"",
                codec.mime_type
            )));
        }
        if codec.clock_rate == 0 {
            return Err(Error::type_error("codec clockRate is zero"));
        }
    }
    let mut seen_ids = std::collections::HashSet::new();
    for ext in &params.header_extensions {
        if !seen_ids.insert(ext.id) {
            return Err(Error::type_error(format!(
                "duplicated header extension id {}",
                ext.id
            )));
        }
    }
    for encoding in &params.encodings {
        if let Some(mode) = encoding.scalability_mode.as_deref() {
            mode.parse::<crate::rtp_parameters::ScalabilityMode>()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp_parameters::{RtcpParameters, MIME_TYPE_H264, MIME_TYPE_VP8};

    fn vp8_codec(payload_type: u8) -> RtpCodecParameters {
        RtpCodecParameters {
            mime_type: MIME_TYPE_VP8.to_string(),
            payload_type,
            clock_rate: 90000,
            channels: None,
            parameters: Default::default(),
            rtcp_feedback: vec![
                RtcpFeedback {
                    r#type: "nack".into(),
                    parameter: String::new(),
                },
                RtcpFeedback {
                    r#type: "nack".into(),
                    parameter: "pli".into(),
                },
            ],
        }
    }

    fn vp8_params() -> RtpParameters {
        RtpParameters {
            mid: None,
            codecs: vec![vp8_codec(101)],
            header_extensions: vec![],
            encodings: vec![Default::default()],
            rtcp: RtcpParameters::default(),
        }
    }

    #[test]
    fn can_consume_matching_codec() {
        let capabilities = RtpCapabilities {
            codecs: vec![vp8_codec(96)],
            header_extensions: vec![],
        };
        assert!(can_consume(&vp8_params(), &capabilities));
    }

    #[test]
    fn cannot_consume_different_codec() {
        let mut h264 = vp8_codec(97);
        h264.mime_type = MIME_TYPE_H264.to_string();
        let capabilities = RtpCapabilities {
            codecs: vec![h264],
            header_extensions: vec![],
        };
        assert!(!can_consume(&vp8_params(), &capabilities));
    }

    #[test]
    fn h264_packetization_mode_is_distinguishing() {
        let mut mode1 = vp8_codec(97);
        mode1.mime_type = MIME_TYPE_H264.to_string();
        mode1
            .parameters
            .insert("packetization-mode".into(), ParameterValue::Number(1));

        let mut mode0 = mode1.clone();
        mode0
            .parameters
            .insert("packetization-mode".into(), ParameterValue::Number(0));

        let (_, matched) = codec_fuzzy_search(&mode1, std::slice::from_ref(&mode0));
        assert_eq!(matched, CodecMatch::Partial);
    }

    #[test]
    fn feedback_intersection() {
        let producer = vp8_codec(101);
        let mut consumer = vp8_codec(96);
        consumer.rtcp_feedback.push(RtcpFeedback {
            r#type: "goog-remb".into(),
            parameter: String::new(),
        });

        let reduced = reduce_rtcp_feedback(&producer, &consumer);
        assert_eq!(reduced.len(), 2);
        assert!(reduced.iter().all(|fb| fb.r#type == "nack"));
    }
}
