//! Plain transport: unencrypted or pre-keyed RTP over UDP.
//!
//! With comedia enabled the remote address is learned from the first packet
//! seen on the socket; otherwise `transport.connect` pins it. SRTP, when
//! requested, uses keys exchanged out of band through the control plane.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use srtp::context::Context;
use srtp::protection_profile::ProtectionProfile;
use tokio::net::UdpSocket;

use crate::error::{Error, Result};

use super::{is_rtcp, parse_body, Transport};

/// SRTP keying exchanged with the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SrtpParameters {
    pub crypto_suite: String,
    pub key_base64: String,
}

fn profile_of(crypto_suite: &str) -> Result<(ProtectionProfile, usize, usize)> {
    match crypto_suite {
        "AES_CM_128_HMAC_SHA1_80" => Ok((ProtectionProfile::Aes128CmHmacSha1_80, 16, 14)),
        "AEAD_AES_128_GCM" => Ok((ProtectionProfile::AeadAes128Gcm, 16, 12)),
        "AEAD_AES_256_GCM" => Ok((ProtectionProfile::AeadAes256Gcm, 32, 12)),
        other => Err(Error::type_error(format!("invalid cryptoSuite \"{other}\""))),
    }
}

fn context_of(params: &SrtpParameters) -> Result<Context> {
    let (profile, key_len, salt_len) = profile_of(&params.crypto_suite)?;
    let keying = BASE64
        .decode(&params.key_base64)
        .map_err(|_| Error::type_error("invalid keyBase64"))?;
    if keying.len() != key_len + salt_len {
        return Err(Error::type_error("invalid SRTP key length"));
    }
    Ok(Context::new(
        &keying[..key_len],
        &keying[key_len..],
        profile,
        None,
        None,
    )?)
}

fn generate_srtp_parameters(crypto_suite: &str) -> Result<SrtpParameters> {
    let (_, key_len, salt_len) = profile_of(crypto_suite)?;
    let mut keying = vec![0u8; key_len + salt_len];
    rand::thread_rng().fill_bytes(&mut keying);
    Ok(SrtpParameters {
        crypto_suite: crypto_suite.to_string(),
        key_base64: BASE64.encode(keying),
    })
}

pub struct PlainTransport {
    socket: Arc<UdpSocket>,
    rtcp_socket: Option<Arc<UdpSocket>>,
    tuple: Mutex<Option<SocketAddr>>,
    rtcp_tuple: Mutex<Option<SocketAddr>>,
    comedia: bool,
    rtcp_mux: bool,
    /// Local half of the SRTP keying, advertised on connect.
    local_srtp_parameters: Option<SrtpParameters>,
    srtp_send: Mutex<Option<Context>>,
    srtp_recv: Mutex<Option<Context>>,
    connected: AtomicBool,
}

impl PlainTransport {
    pub(crate) async fn bind(
        listen_ip: std::net::IpAddr,
        port: Option<u16>,
        rtcp_mux: bool,
        comedia: bool,
        enable_srtp: bool,
        srtp_crypto_suite: Option<String>,
        port_range: (u16, u16),
    ) -> Result<PlainTransport> {
        let socket = Arc::new(super::bind_udp(listen_ip, port, port_range).await?);
        let rtcp_socket = if rtcp_mux {
            None
        } else {
            Some(Arc::new(super::bind_udp(listen_ip, None, port_range).await?))
        };

        let local_srtp_parameters = if enable_srtp {
            let suite = srtp_crypto_suite.as_deref().unwrap_or("AES_CM_128_HMAC_SHA1_80");
            Some(generate_srtp_parameters(suite)?)
        } else {
            None
        };

        let srtp_send = match &local_srtp_parameters {
            Some(params) => Some(context_of(params)?),
            None => None,
        };

        Ok(PlainTransport {
            socket,
            rtcp_socket,
            tuple: Mutex::new(None),
            rtcp_tuple: Mutex::new(None),
            comedia,
            rtcp_mux,
            local_srtp_parameters,
            srtp_send: Mutex::new(srtp_send),
            srtp_recv: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    pub(crate) fn start(transport: &Arc<Transport>) {
        let super::TransportKind::Plain(plain) = &transport.kind else {
            return;
        };

        spawn_read_loop(Arc::clone(&plain.socket), Arc::downgrade(transport), false);
        if let Some(rtcp_socket) = &plain.rtcp_socket {
            spawn_read_loop(Arc::clone(rtcp_socket), Arc::downgrade(transport), true);
        }
    }

    pub(crate) async fn connect(&self, data: &Value) -> Result<Value> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ConnectBody {
            #[serde(default)]
            ip: Option<std::net::IpAddr>,
            #[serde(default)]
            port: Option<u16>,
            #[serde(default)]
            rtcp_port: Option<u16>,
            #[serde(default)]
            srtp_parameters: Option<SrtpParameters>,
        }

        let body: ConnectBody = parse_body(data)?;

        if let Some(params) = &body.srtp_parameters {
            if self.local_srtp_parameters.is_none() {
                return Err(Error::type_error("srtpParameters given but SRTP not enabled"));
            }
            *self.srtp_recv.lock().unwrap() = Some(context_of(params)?);
        } else if self.local_srtp_parameters.is_some() {
            return Err(Error::type_error("missing srtpParameters"));
        }

        if self.comedia {
            if body.ip.is_some() || body.port.is_some() {
                return Err(Error::type_error(
                    "cannot provide ip/port in comedia mode",
                ));
            }
        } else {
            let ip = body.ip.ok_or_else(|| Error::type_error("missing ip"))?;
            let port = body.port.ok_or_else(|| Error::type_error("missing port"))?;
            *self.tuple.lock().unwrap() = Some(SocketAddr::new(ip, port));
            if !self.rtcp_mux {
                let rtcp_port = body
                    .rtcp_port
                    .ok_or_else(|| Error::type_error("missing rtcpPort"))?;
                *self.rtcp_tuple.lock().unwrap() = Some(SocketAddr::new(ip, rtcp_port));
            }
            self.connected.store(true, Ordering::SeqCst);
        }

        let local = self.socket.local_addr()?;
        Ok(json!({
            "tuple": {
                "localIp": local.ip(),
                "localPort": local.port(),
                "remoteIp": self.tuple.lock().unwrap().map(|a| a.ip()),
                "remotePort": self.tuple.lock().unwrap().map(|a| a.port()),
                "protocol": "udp",
            },
            "srtpParameters": self.local_srtp_parameters,
        }))
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) async fn send_rtp(&self, raw: Bytes) -> Result<()> {
        let Some(tuple) = *self.tuple.lock().unwrap() else {
            return Ok(());
        };
        let out = {
            let mut srtp_send = self.srtp_send.lock().unwrap();
            match srtp_send.as_mut() {
                Some(context) => context.encrypt_rtp(&raw)?,
                None => raw,
            }
        };
        self.socket.send_to(&out, tuple).await?;
        Ok(())
    }

    pub(crate) async fn send_rtcp(&self, raw: Bytes) -> Result<()> {
        let (socket, tuple) = if self.rtcp_mux {
            (Arc::clone(&self.socket), *self.tuple.lock().unwrap())
        } else {
            let Some(rtcp_socket) = &self.rtcp_socket else {
                return Ok(());
            };
            (Arc::clone(rtcp_socket), *self.rtcp_tuple.lock().unwrap())
        };
        let Some(tuple) = tuple else {
            return Ok(());
        };

        let out = {
            let mut srtp_send = self.srtp_send.lock().unwrap();
            match srtp_send.as_mut() {
                Some(context) => Bytes::from(context.encrypt_rtcp(&raw)?),
                None => raw,
            }
        };
        socket.send_to(&out, tuple).await?;
        Ok(())
    }

    pub(crate) async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub(crate) fn fill_stats(&self) -> Value {
        let local = self.socket.local_addr().ok();
        json!({
            "comedia": self.comedia,
            "rtcpMux": self.rtcp_mux,
            "tuple": {
                "localIp": local.map(|a| a.ip().to_string()),
                "localPort": local.map(|a| a.port()),
                "remoteIp": self.tuple.lock().unwrap().map(|a| a.ip().to_string()),
                "remotePort": self.tuple.lock().unwrap().map(|a| a.port()),
                "protocol": "udp",
            },
        })
    }
}

fn spawn_read_loop(
    socket: Arc<UdpSocket>,
    weak: std::sync::Weak<Transport>,
    rtcp_only: bool,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; crate::MTU_SIZE];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(result) => result,
                Err(err) => {
                    log::debug!("plain socket recv ended: {err}");
                    return;
                }
            };
            let Some(transport) = weak.upgrade() else {
                return;
            };
            if transport.closed() {
                return;
            }
            let super::TransportKind::Plain(plain) = &transport.kind else {
                return;
            };

            let tuple_store = if rtcp_only { &plain.rtcp_tuple } else { &plain.tuple };
            let known = *tuple_store.lock().unwrap();
            match known {
                Some(tuple) if tuple == from => {}
                Some(_) => continue,
                None if plain.comedia => {
                    // comedia: learn the remote address from the first packet.
                    *tuple_store.lock().unwrap() = Some(from);
                    let event = if rtcp_only {
                        "rtcptuple"
                    } else {
                        plain.connected.store(true, Ordering::SeqCst);
                        "tuple"
                    };
                    transport.shared.notifier.emit_with_data(
                        transport.id(),
                        event,
                        json!({
                            "remoteIp": from.ip(),
                            "remotePort": from.port(),
                            "protocol": "udp",
                        }),
                    );
                }
                None => continue,
            }

            let data = &buf[..len];
            let treat_as_rtcp = rtcp_only || (plain.rtcp_mux && is_rtcp(data));

            if treat_as_rtcp {
                let decrypted = {
                    let mut srtp_recv = plain.srtp_recv.lock().unwrap();
                    match srtp_recv.as_mut() {
                        Some(context) => match context.decrypt_rtcp(data) {
                            Ok(out) => Some(Bytes::from(out)),
                            Err(err) => {
                                log::debug!("SRTCP decrypt failed: {err}");
                                None
                            }
                        },
                        None => Some(Bytes::copy_from_slice(data)),
                    }
                };
                if let Some(decrypted) = decrypted {
                    transport.add_data_received(len);
                    transport.receive_rtcp_packet(&decrypted).await;
                }
            } else {
                let decrypted = {
                    let mut srtp_recv = plain.srtp_recv.lock().unwrap();
                    match srtp_recv.as_mut() {
                        Some(context) => match context.decrypt_rtp(data) {
                            Ok(out) => Some(out),
                            Err(err) => {
                                log::debug!("SRTP decrypt failed: {err}");
                                None
                            }
                        },
                        None => Some(Bytes::copy_from_slice(data)),
                    }
                };
                if let Some(decrypted) = decrypted {
                    transport.receive_rtp_packet(&decrypted).await;
                }
            }
        }
    });
}
