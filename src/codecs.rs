//! Per-codec payload inspection: key frame detection, temporal layer ids
//! and DTX detection. The worker never decodes media; it only reads the
//! payload descriptors that simulcast/SVC forwarding depends on.

use bytes::Bytes;
use rtp::codecs::vp8::Vp8Packet;
use rtp::packetizer::Depacketizer;

/// Per-packet metadata extracted from the codec payload descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadInfo {
    pub is_key_frame: bool,
    pub temporal_layer: Option<u8>,
    /// SVC spatial layer id, when the codec carries one (VP9).
    pub spatial_layer: Option<u8>,
    pub is_dtx: bool,
}

pub fn inspect(mime_type: &str, payload: &Bytes) -> PayloadInfo {
    let mime = mime_type.to_lowercase();
    match mime.as_str() {
        "video/vp8" => inspect_vp8(payload),
        "video/vp9" => inspect_vp9(payload),
        "video/h264" => inspect_h264(payload),
        "audio/opus" => PayloadInfo {
            // An Opus DTX frame is a 1..2 byte packet kept alive to signal
            // comfort noise.
            is_dtx: payload.len() <= 2,
            ..PayloadInfo::default()
        },
        _ => PayloadInfo::default(),
    }
}

fn inspect_vp8(payload: &Bytes) -> PayloadInfo {
    let mut depacketizer = Vp8Packet::default();
    let Ok(frame) = depacketizer.depacketize(payload) else {
        return PayloadInfo::default();
    };

    // Key frame iff the P bit of the VP8 frame tag is 0, observable only at
    // the start of partition 0.
    let is_key_frame =
        depacketizer.s == 1 && depacketizer.pid == 0 && !frame.is_empty() && frame[0] & 0x01 == 0;

    PayloadInfo {
        is_key_frame,
        temporal_layer: (depacketizer.t == 1).then_some(depacketizer.tid),
        spatial_layer: None,
        is_dtx: false,
    }
}

fn inspect_vp9(payload: &Bytes) -> PayloadInfo {
    if payload.len() < 2 {
        return PayloadInfo::default();
    }

    // VP9 payload descriptor, RFC draft-ietf-payload-vp9:
    // |I|P|L|F|B|E|V|Z|
    let b0 = payload[0];
    let i = b0 & 0x80 != 0;
    let p = b0 & 0x40 != 0;
    let l = b0 & 0x20 != 0;
    let b = b0 & 0x08 != 0;

    let mut offset = 1;
    if i {
        // picture id, 7 or 15 bits
        if payload.len() <= offset {
            return PayloadInfo::default();
        }
        offset += if payload[offset] & 0x80 != 0 { 2 } else { 1 };
    }

    // Layer indices byte: |TID(3)|U(1)|SID(3)|D(1)|.
    let (temporal_layer, spatial_layer) = if l && payload.len() > offset {
        (Some(payload[offset] >> 5), Some((payload[offset] >> 1) & 0x07))
    } else {
        (None, None)
    };

    PayloadInfo {
        is_key_frame: !p && b,
        temporal_layer,
        spatial_layer,
        is_dtx: false,
    }
}

fn inspect_h264(payload: &Bytes) -> PayloadInfo {
    if payload.is_empty() {
        return PayloadInfo::default();
    }

    let nalu_type = payload[0] & 0x1F;
    let is_key_frame = match nalu_type {
        // IDR slice or SPS.
        5 | 7 => true,
        // STAP-A: scan the aggregated NAL units.
        24 => {
            let mut offset = 1;
            let mut found = false;
            while offset + 2 < payload.len() {
                let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                let nalu_offset = offset + 2;
                if nalu_offset >= payload.len() {
                    break;
                }
                let t = payload[nalu_offset] & 0x1F;
                if t == 5 || t == 7 {
                    found = true;
                    break;
                }
                offset = nalu_offset + size;
            }
            found
        }
        // FU-A: start fragment carries the original NAL type.
        28 => {
            payload.len() > 1 && payload[1] & 0x80 != 0 && matches!(payload[1] & 0x1F, 5 | 7)
        }
        _ => false,
    };

    PayloadInfo {
        is_key_frame,
        ..PayloadInfo::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp8_packet(s: u8, pid: u8, p_bit: u8) -> Bytes {
        // Minimal descriptor: no extensions, S and PID in the first byte,
        // then the frame tag whose low bit is the P (inter-frame) flag.
        let b0 = (s << 4) | pid;
        Bytes::from(vec![b0, p_bit, 0x00, 0x00])
    }

    #[test]
    fn vp8_key_frame_detected() {
        let info = inspect("video/VP8", &vp8_packet(1, 0, 0x00));
        assert!(info.is_key_frame);

        let info = inspect("video/VP8", &vp8_packet(1, 0, 0x01));
        assert!(!info.is_key_frame);

        // Not a partition start: cannot be a key frame boundary.
        let info = inspect("video/VP8", &vp8_packet(0, 0, 0x00));
        assert!(!info.is_key_frame);
    }

    #[test]
    fn h264_idr_detected() {
        let idr = Bytes::from_static(&[0x65, 0x88, 0x84]);
        assert!(inspect("video/H264", &idr).is_key_frame);

        let non_idr = Bytes::from_static(&[0x41, 0x9a, 0x00]);
        assert!(!inspect("video/H264", &non_idr).is_key_frame);
    }

    #[test]
    fn opus_dtx_detected() {
        assert!(inspect("audio/opus", &Bytes::from_static(&[0xF8])).is_dtx);
        assert!(!inspect("audio/opus", &Bytes::from_static(&[0xF8, 1, 2, 3])).is_dtx);
    }

    #[test]
    fn vp9_key_frame_detected() {
        // No picture id, P=0, B=1: start of a key frame.
        let key = Bytes::from_static(&[0x08, 0x00, 0x00]);
        assert!(inspect("video/VP9", &key).is_key_frame);

        // P=1: inter frame.
        let inter = Bytes::from_static(&[0x48, 0x00, 0x00]);
        assert!(!inspect("video/VP9", &inter).is_key_frame);
    }
}
