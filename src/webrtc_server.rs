//! WebRtcServer: shared UDP/TCP listen endpoints demultiplexed by ICE
//! username fragment across many WebRTC transports.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use serde_json::{json, Value};
use stun::attributes::ATTR_USERNAME;
use stun::message::{Getter, Message};
use stun::textattrs::Username;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

use crate::channel::registrator::ChannelRequestHandler;
use crate::channel::Shared;
use crate::error::{Error, Result};
use crate::message::{ChannelRequest, Method};
use crate::transport::webrtc::{MediaSink, WebRtcTransport};
use crate::transport::{match_stun, Transport, TransportKind};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenInfo {
    pub protocol: String,
    pub ip: std::net::IpAddr,
    #[serde(default)]
    pub port: Option<u16>,
}

pub struct WebRtcServer {
    id: String,
    shared: Arc<Shared>,
    closed: AtomicBool,
    local_addrs: Vec<(String, SocketAddr)>,
    /// ICE ufrag → transport.
    transports: Mutex<HashMap<String, Weak<Transport>>>,
    /// Remote tuple → transport, learned from STUN.
    addr_map: Mutex<HashMap<SocketAddr, Weak<Transport>>>,
}

impl WebRtcServer {
    pub(crate) async fn new(
        id: String,
        listen_infos: Vec<ListenInfo>,
        shared: Arc<Shared>,
    ) -> Result<Arc<WebRtcServer>> {
        if listen_infos.is_empty() {
            return Err(Error::type_error("missing listenInfos"));
        }

        let port_range = {
            let settings = shared.settings.lock().unwrap();
            (settings.rtc_min_port, settings.rtc_max_port)
        };

        let mut udp_sockets = Vec::new();
        let mut tcp_listeners = Vec::new();
        let mut local_addrs = Vec::new();

        for info in &listen_infos {
            match info.protocol.as_str() {
                "udp" => {
                    let socket =
                        crate::transport::bind_udp(info.ip, info.port, port_range).await?;
                    local_addrs.push(("udp".to_string(), socket.local_addr()?));
                    udp_sockets.push(Arc::new(socket));
                }
                "tcp" => {
                    let port = info.port.unwrap_or(0);
                    let listener = TcpListener::bind((info.ip, port)).await?;
                    local_addrs.push(("tcp".to_string(), listener.local_addr()?));
                    tcp_listeners.push(listener);
                }
                other => {
                    return Err(Error::type_error(format!("invalid protocol \"{other}\"")));
                }
            }
        }

        let server = Arc::new(WebRtcServer {
            id: id.clone(),
            shared: Arc::clone(&shared),
            closed: AtomicBool::new(false),
            local_addrs,
            transports: Mutex::new(HashMap::new()),
            addr_map: Mutex::new(HashMap::new()),
        });

        shared.registrator.register(
            &id,
            Arc::downgrade(&server) as Weak<dyn ChannelRequestHandler>,
            None,
            None,
        )?;

        for socket in udp_sockets {
            tokio::spawn(udp_loop(socket, Arc::downgrade(&server)));
        }
        for listener in tcp_listeners {
            tokio::spawn(tcp_accept_loop(listener, Arc::downgrade(&server)));
        }

        Ok(server)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Claim a transport's ufrag on this server's shared sockets.
    pub(crate) fn register_transport(&self, transport: &Arc<Transport>) {
        if let TransportKind::WebRtc(webrtc) = &transport.kind {
            self.transports
                .lock()
                .unwrap()
                .insert(webrtc.ice.ufrag(), Arc::downgrade(transport));
        }
    }

    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transports.lock().unwrap().clear();
        self.addr_map.lock().unwrap().clear();
        self.shared.registrator.unregister(&self.id);
        log::debug!("WebRtcServer closed [id:{}]", self.id);
    }

    fn transport_for(&self, data: &[u8], from: SocketAddr) -> Option<Arc<Transport>> {
        if match_stun(data) {
            // Route by the local half of the USERNAME attribute, then pin
            // the remote tuple for non-STUN traffic.
            let mut message = Message {
                raw: vec![],
                ..Message::default()
            };
            message.raw.extend_from_slice(data);
            message.decode().ok()?;

            let mut username = Username::new(ATTR_USERNAME, String::new());
            username.get_from(&message).ok()?;
            let value = username.to_string();
            let local_ufrag = value.split(':').next()?;

            let transport = self
                .transports
                .lock()
                .unwrap()
                .get(local_ufrag)
                .and_then(|w| w.upgrade())?;
            self.addr_map
                .lock()
                .unwrap()
                .insert(from, Arc::downgrade(&transport));
            Some(transport)
        } else {
            self.addr_map
                .lock()
                .unwrap()
                .get(&from)
                .and_then(|w| w.upgrade())
        }
    }

    pub(crate) fn dump(&self) -> Value {
        let ufrags: Vec<String> = self.transports.lock().unwrap().keys().cloned().collect();
        let listen_infos: Vec<Value> = self
            .local_addrs
            .iter()
            .map(|(protocol, addr)| {
                json!({ "protocol": protocol, "ip": addr.ip(), "port": addr.port() })
            })
            .collect();
        json!({
            "id": self.id,
            "listenInfos": listen_infos,
            "iceUsernameFragments": ufrags,
        })
    }
}

#[async_trait]
impl ChannelRequestHandler for WebRtcServer {
    async fn handle_channel_request(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        if self.closed() {
            return Err(Error::ErrClosed("WebRtcServer"));
        }
        match request.method {
            Method::WebRtcServerDump => Ok(Some(self.dump())),
            _ => Err(Error::type_error(format!(
                "unknown method \"{}\" for a WebRtcServer",
                request.method
            ))),
        }
    }
}

async fn udp_loop(socket: Arc<UdpSocket>, server: Weak<WebRtcServer>) {
    let mut buf = vec![0u8; crate::MTU_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(err) => {
                log::debug!("webrtc server udp recv ended: {err}");
                return;
            }
        };
        let Some(server) = server.upgrade() else {
            return;
        };
        if server.closed() {
            return;
        }

        let data = &buf[..len];
        let Some(transport) = server.transport_for(data, from) else {
            log::trace!("no WebRtcTransport for packet from {from}");
            continue;
        };
        WebRtcTransport::on_packet(
            &transport,
            MediaSink::Udp(Arc::clone(&socket), from),
            from,
            data,
        )
        .await;
    }
}

async fn tcp_accept_loop(listener: TcpListener, server: Weak<WebRtcServer>) {
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(result) => result,
            Err(err) => {
                log::debug!("webrtc server tcp accept ended: {err}");
                return;
            }
        };
        if server.upgrade().map(|s| s.closed()).unwrap_or(true) {
            return;
        }

        let (mut read_half, mut write_half) = stream.into_split();

        // Writer task applying RFC 4571 framing.
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let mut out = BytesMut::with_capacity(2 + frame.len());
                out.extend_from_slice(&(frame.len() as u16).to_be_bytes());
                out.extend_from_slice(&frame);
                if write_half.write_all(&out).await.is_err() {
                    return;
                }
            }
        });

        let server = server.clone();
        tokio::spawn(async move {
            let mut len_buf = [0u8; 2];
            let mut buf = vec![0u8; 65536];
            loop {
                if read_half.read_exact(&mut len_buf).await.is_err() {
                    return;
                }
                let len = u16::from_be_bytes(len_buf) as usize;
                if read_half.read_exact(&mut buf[..len]).await.is_err() {
                    return;
                }
                let Some(server) = server.upgrade() else {
                    return;
                };
                if server.closed() {
                    return;
                }

                let data = &buf[..len];
                let Some(transport) = server.transport_for(data, from) else {
                    continue;
                };
                WebRtcTransport::on_packet(&transport, MediaSink::Tcp(tx.clone()), from, data)
                    .await;
            }
        });
    }
}
