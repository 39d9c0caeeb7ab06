//! Encoding and decoding of length-delimited channel frames.
//!
//! Every frame on the wire is a `u32` little-endian length prefix followed by
//! a tagged body. The binary layout is normative; the textual request form
//! (`r{id}:{method}:{handlerId}:{json}`) is accepted on decode for older
//! control planes and never emitted.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::{Error, Result, WireErrorKind};

use super::{
    ChannelFrame, ChannelNotification, ChannelRequest, ChannelResponse, Method, PayloadFrame,
    PayloadNotification, PayloadRequest, ResponseResult, MESSAGE_MAX_LEN, PAYLOAD_MAX_LEN,
};

pub const TAG_REQUEST: u8 = b'R';
pub const TAG_RESPONSE: u8 = b'S';
pub const TAG_NOTIFICATION: u8 = b'N';
/// First byte of a legacy textual request.
pub const TAG_LEGACY_REQUEST: u8 = b'r';

/// Tags for log records forwarded over the control channel.
pub const TAG_LOG_DEBUG: u8 = b'D';
pub const TAG_LOG_WARN: u8 = b'W';
pub const TAG_LOG_ERROR: u8 = b'E';

fn put_short_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_body(buf: &mut BytesMut, data: &Value) {
    if data.is_null() {
        buf.put_u32_le(0);
    } else {
        let body = serde_json::to_vec(data).unwrap_or_default();
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
    }
}

fn get_short_str(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(Error::ErrInvalidFrame("truncated string length".into()));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(Error::ErrInvalidFrame("truncated string".into()));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::ErrInvalidFrame("non-utf8 string".into()))
}

fn get_body(buf: &mut Bytes) -> Result<Value> {
    if buf.remaining() < 4 {
        return Err(Error::ErrInvalidFrame("truncated body length".into()));
    }
    let len = buf.get_u32_le() as usize;
    if len == 0 {
        return Ok(Value::Null);
    }
    if buf.remaining() < len {
        return Err(Error::ErrInvalidFrame("truncated body".into()));
    }
    let raw = buf.split_to(len);
    serde_json::from_slice(&raw).map_err(|err| Error::ErrInvalidFrame(err.to_string()))
}

fn get_payload(buf: &mut Bytes) -> Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(Error::ErrInvalidFrame("truncated payload length".into()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(Error::ErrInvalidFrame("truncated payload".into()));
    }
    Ok(buf.split_to(len))
}

pub fn encode_request(request: &ChannelRequest) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(TAG_REQUEST);
    buf.put_u32_le(request.id);
    buf.put_u16_le(request.method.id());
    put_short_str(&mut buf, &request.handler_id);
    put_body(&mut buf, &request.data);
    buf
}

pub fn encode_response(response: &ChannelResponse) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(TAG_RESPONSE);
    buf.put_u32_le(response.id);
    match &response.result {
        ResponseResult::Accepted(data) => {
            buf.put_u8(1);
            put_body(&mut buf, data.as_ref().unwrap_or(&Value::Null));
        }
        ResponseResult::Rejected { kind, reason } => {
            buf.put_u8(0);
            put_short_str(&mut buf, kind.as_str());
            put_body(&mut buf, &Value::String(reason.clone()));
        }
    }
    buf
}

pub fn encode_notification(notification: &ChannelNotification) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(TAG_NOTIFICATION);
    put_short_str(&mut buf, &notification.target_id);
    put_short_str(&mut buf, &notification.event);
    put_body(&mut buf, &notification.data);
    buf
}

pub fn encode_payload_notification(notification: &PayloadNotification) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64 + notification.payload.len());
    buf.put_u8(TAG_NOTIFICATION);
    put_short_str(&mut buf, &notification.target_id);
    put_short_str(&mut buf, &notification.event);
    put_body(&mut buf, &notification.data);
    buf.put_u32_le(notification.payload.len() as u32);
    buf.put_slice(&notification.payload);
    buf
}

pub fn encode_payload_request(request: &PayloadRequest) -> BytesMut {
    let mut buf = encode_request(&request.request);
    buf.put_u32_le(request.payload.len() as u32);
    buf.put_slice(&request.payload);
    buf
}

fn decode_request_fields(buf: &mut Bytes) -> Result<ChannelRequest> {
    if buf.remaining() < 6 {
        return Err(Error::ErrInvalidFrame("truncated request".into()));
    }
    let id = buf.get_u32_le();
    let method_id = buf.get_u16_le();
    let method = Method::from_id(method_id)
        .ok_or_else(|| Error::ErrInvalidFrame(format!("unknown method id {method_id:#06x}")))?;
    let handler_id = get_short_str(buf)?;
    let data = get_body(buf)?;

    Ok(ChannelRequest {
        id,
        method,
        handler_id,
        data,
    })
}

fn decode_response_fields(buf: &mut Bytes) -> Result<ChannelResponse> {
    if buf.remaining() < 5 {
        return Err(Error::ErrInvalidFrame("truncated response".into()));
    }
    let id = buf.get_u32_le();
    let accepted = buf.get_u8() == 1;
    let result = if accepted {
        let data = get_body(buf)?;
        ResponseResult::Accepted(if data.is_null() { None } else { Some(data) })
    } else {
        let kind = WireErrorKind::from_name(&get_short_str(buf)?);
        let reason = match get_body(buf)? {
            Value::String(s) => s,
            other => other.to_string(),
        };
        ResponseResult::Rejected { kind, reason }
    };

    Ok(ChannelResponse { id, result })
}

fn decode_notification_fields(buf: &mut Bytes) -> Result<ChannelNotification> {
    let target_id = get_short_str(buf)?;
    let event = get_short_str(buf)?;
    let data = get_body(buf)?;

    Ok(ChannelNotification {
        target_id,
        event,
        data,
    })
}

/// Parse the legacy textual request form `r{id}:{method}:{handlerId}:{json}`.
fn decode_legacy_request(raw: &[u8]) -> Result<ChannelRequest> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::ErrInvalidFrame("non-utf8 legacy request".into()))?;
    let rest = text
        .strip_prefix('r')
        .ok_or_else(|| Error::ErrInvalidFrame("legacy request does not start with 'r'".into()))?;

    let mut parts = rest.splitn(4, ':');
    let id = parts
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| Error::ErrInvalidFrame("legacy request id".into()))?;
    let method_name = parts
        .next()
        .ok_or_else(|| Error::ErrInvalidFrame("legacy request method".into()))?;
    let method = Method::from_name(method_name)
        .ok_or_else(|| Error::ErrInvalidFrame(format!("unknown method \"{method_name}\"")))?;
    let handler_id = parts
        .next()
        .ok_or_else(|| Error::ErrInvalidFrame("legacy request handlerId".into()))?
        .to_string();
    let data = match parts.next() {
        None | Some("") | Some("undefined") => Value::Null,
        Some(json) => serde_json::from_str(json)
            .map_err(|err| Error::ErrInvalidFrame(err.to_string()))?,
    };

    Ok(ChannelRequest {
        id,
        method,
        handler_id: if handler_id == "undefined" {
            String::new()
        } else {
            handler_id
        },
        data,
    })
}

/// Decode one control channel frame body (without the length prefix).
pub fn decode_channel_frame(mut buf: Bytes) -> Result<ChannelFrame> {
    if buf.is_empty() {
        return Err(Error::ErrInvalidFrame("empty frame".into()));
    }
    match buf[0] {
        TAG_REQUEST => {
            buf.advance(1);
            Ok(ChannelFrame::Request(decode_request_fields(&mut buf)?))
        }
        TAG_RESPONSE => {
            buf.advance(1);
            Ok(ChannelFrame::Response(decode_response_fields(&mut buf)?))
        }
        TAG_NOTIFICATION => {
            buf.advance(1);
            Ok(ChannelFrame::Notification(decode_notification_fields(
                &mut buf,
            )?))
        }
        TAG_LEGACY_REQUEST => Ok(ChannelFrame::Request(decode_legacy_request(&buf)?)),
        tag => Err(Error::ErrInvalidFrame(format!("unknown frame tag {tag:#04x}"))),
    }
}

/// Decode one payload channel frame body (without the length prefix).
pub fn decode_payload_frame(mut buf: Bytes) -> Result<PayloadFrame> {
    if buf.is_empty() {
        return Err(Error::ErrInvalidFrame("empty frame".into()));
    }
    match buf[0] {
        TAG_REQUEST => {
            buf.advance(1);
            let request = decode_request_fields(&mut buf)?;
            let payload = get_payload(&mut buf)?;
            Ok(PayloadFrame::Request(PayloadRequest { request, payload }))
        }
        TAG_NOTIFICATION => {
            buf.advance(1);
            let notification = decode_notification_fields(&mut buf)?;
            let payload = get_payload(&mut buf)?;
            Ok(PayloadFrame::Notification(PayloadNotification {
                target_id: notification.target_id,
                event: notification.event,
                data: notification.data,
                payload,
            }))
        }
        tag => Err(Error::ErrInvalidFrame(format!("unknown frame tag {tag:#04x}"))),
    }
}

/// Prefix a frame body with its `u32` little-endian length.
pub fn frame(body: BytesMut) -> Result<Bytes> {
    if body.len() > MESSAGE_MAX_LEN {
        return Err(Error::ErrMessageTooBig);
    }
    let mut out = BytesMut::with_capacity(4 + body.len());
    out.put_u32_le(body.len() as u32);
    out.put_slice(&body);
    Ok(out.freeze())
}

/// Validate an inbound frame length read from the length prefix.
pub fn check_frame_len(len: usize) -> Result<()> {
    if len == 0 || len > PAYLOAD_MAX_LEN + 4 {
        return Err(Error::ErrInvalidFrame(format!("frame length {len}")));
    }
    Ok(())
}
