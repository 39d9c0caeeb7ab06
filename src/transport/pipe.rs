//! Pipe transport: trusted peer, minimal rewriting.
//!
//! Between workers the link is a UDP socket; inside one worker
//! (`router.pipeToRouter`) the two halves exchange packets over an
//! in-process channel. The pipe consumer type disables layer selection, so
//! packets cross with their original layer structure intact.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

use super::{is_rtcp, parse_body, Transport};

pub(crate) enum PipeMessage {
    Rtp(Bytes),
    Rtcp(Bytes),
}

pub(crate) enum PipeLink {
    Socket {
        socket: Arc<UdpSocket>,
        remote: Mutex<Option<SocketAddr>>,
    },
    Local {
        peer: Mutex<Option<mpsc::UnboundedSender<PipeMessage>>>,
    },
}

pub struct PipeTransport {
    link: PipeLink,
    connected: AtomicBool,
}

impl PipeTransport {
    /// Socket-backed pipe towards another worker.
    pub(crate) async fn bind(
        listen_ip: std::net::IpAddr,
        port: Option<u16>,
        port_range: (u16, u16),
    ) -> Result<PipeTransport> {
        let socket = super::bind_udp(listen_ip, port, port_range).await?;
        Ok(PipeTransport {
            link: PipeLink::Socket {
                socket: Arc::new(socket),
                remote: Mutex::new(None),
            },
            connected: AtomicBool::new(false),
        })
    }

    /// In-process pipe half for `router.pipeToRouter`.
    pub(crate) fn new_local() -> PipeTransport {
        PipeTransport {
            link: PipeLink::Local {
                peer: Mutex::new(None),
            },
            connected: AtomicBool::new(false),
        }
    }

    /// Wire this local half to its sibling and start receiving from it.
    pub(crate) fn link_local(
        &self,
        peer_tx: mpsc::UnboundedSender<PipeMessage>,
        mut rx: mpsc::UnboundedReceiver<PipeMessage>,
        transport: &Arc<Transport>,
    ) {
        if let PipeLink::Local { peer } = &self.link {
            *peer.lock().unwrap() = Some(peer_tx);
        }
        self.connected.store(true, Ordering::SeqCst);

        let weak = Arc::downgrade(transport);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                match message {
                    PipeMessage::Rtp(raw) => transport.receive_rtp_packet(&raw).await,
                    PipeMessage::Rtcp(raw) => {
                        transport.add_data_received(raw.len());
                        transport.receive_rtcp_packet(&raw).await;
                    }
                }
            }
        });
    }

    /// Start the socket read loop; no-op for local pipes.
    pub(crate) fn start(transport: &Arc<Transport>) {
        let super::TransportKind::Pipe(pipe) = &transport.kind else {
            return;
        };
        let PipeLink::Socket { socket, .. } = &pipe.link else {
            return;
        };

        let socket = Arc::clone(socket);
        let weak = Arc::downgrade(transport);
        tokio::spawn(async move {
            let mut buf = vec![0u8; crate::MTU_SIZE];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(result) => result,
                    Err(err) => {
                        log::debug!("pipe socket recv ended: {err}");
                        return;
                    }
                };
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                if transport.closed() {
                    return;
                }

                // A trusted peer: accept only the connected tuple.
                if let super::TransportKind::Pipe(pipe) = &transport.kind {
                    let allowed = match &pipe.link {
                        PipeLink::Socket { remote, .. } => {
                            remote.lock().unwrap().map(|r| r == from).unwrap_or(false)
                        }
                        PipeLink::Local { .. } => false,
                    };
                    if !allowed {
                        continue;
                    }
                }

                let data = &buf[..len];
                if is_rtcp(data) {
                    transport.add_data_received(len);
                    transport.receive_rtcp_packet(data).await;
                } else {
                    transport.receive_rtp_packet(data).await;
                }
            }
        });
    }

    pub(crate) async fn connect(&self, data: &Value) -> Result<Value> {
        #[derive(Deserialize)]
        struct ConnectBody {
            ip: std::net::IpAddr,
            port: u16,
        }

        match &self.link {
            PipeLink::Socket { socket, remote } => {
                let body: ConnectBody = parse_body(data)?;
                {
                    let mut remote = remote.lock().unwrap();
                    if remote.is_some() {
                        return Err(Error::other("connect() already called"));
                    }
                    *remote = Some(SocketAddr::new(body.ip, body.port));
                }
                self.connected.store(true, Ordering::SeqCst);

                let local = socket.local_addr()?;
                Ok(json!({
                    "tuple": {
                        "localIp": local.ip(),
                        "localPort": local.port(),
                        "remoteIp": body.ip,
                        "remotePort": body.port,
                        "protocol": "udp",
                    }
                }))
            }
            PipeLink::Local { .. } => Err(Error::other(
                "connect() not supported on an in-process pipe",
            )),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) async fn send_rtp(&self, raw: Bytes) -> Result<()> {
        match &self.link {
            PipeLink::Socket { socket, remote } => {
                let Some(remote) = *remote.lock().unwrap() else {
                    return Ok(());
                };
                socket.send_to(&raw, remote).await?;
                Ok(())
            }
            PipeLink::Local { peer } => {
                let tx = peer.lock().unwrap().clone();
                if let Some(tx) = tx {
                    let _ = tx.send(PipeMessage::Rtp(raw));
                }
                Ok(())
            }
        }
    }

    pub(crate) async fn send_rtcp(&self, raw: Bytes) -> Result<()> {
        match &self.link {
            PipeLink::Socket { socket, remote } => {
                let Some(remote) = *remote.lock().unwrap() else {
                    return Ok(());
                };
                socket.send_to(&raw, remote).await?;
                Ok(())
            }
            PipeLink::Local { peer } => {
                let tx = peer.lock().unwrap().clone();
                if let Some(tx) = tx {
                    let _ = tx.send(PipeMessage::Rtcp(raw));
                }
                Ok(())
            }
        }
    }

    pub(crate) async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let PipeLink::Local { peer } = &self.link {
            peer.lock().unwrap().take();
        }
    }

    pub(crate) fn fill_stats(&self) -> Value {
        match &self.link {
            PipeLink::Socket { socket, remote } => {
                let local = socket.local_addr().ok();
                json!({
                    "tuple": {
                        "localIp": local.map(|a| a.ip().to_string()),
                        "localPort": local.map(|a| a.port()),
                        "remoteIp": remote.lock().unwrap().map(|a| a.ip().to_string()),
                        "remotePort": remote.lock().unwrap().map(|a| a.port()),
                        "protocol": "udp",
                    }
                })
            }
            PipeLink::Local { .. } => json!({ "tuple": Value::Null }),
        }
    }
}
