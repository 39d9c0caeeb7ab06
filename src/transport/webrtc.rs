//! WebRTC transport: ICE-Lite + DTLS + SRTP over UDP/TCP.
//!
//! The transport either owns its sockets or shares the listeners of a
//! WebRtcServer (demultiplexed by ICE username fragment). DTLS records are
//! bridged into `dtls::conn::DTLSConn`; on handshake completion the SRTP
//! keys are extracted per RFC 5764 and packets are protected with
//! `srtp::context::Context`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use srtp::context::Context;
use srtp::protection_profile::ProtectionProfile;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use util::conn::Conn;

use crate::error::{Error, Result};

use super::ice_server::{IceServer, IceState};
use super::{is_rtcp, match_dtls, match_srtp_or_srtcp, match_stun, parse_body, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl DtlsState {
    fn as_str(&self) -> &'static str {
        match self {
            DtlsState::New => "new",
            DtlsState::Connecting => "connecting",
            DtlsState::Connected => "connected",
            DtlsState::Failed => "failed",
            DtlsState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

/// Where outgoing media bytes go: a UDP tuple or a framed TCP connection.
#[derive(Clone)]
pub(crate) enum MediaSink {
    Udp(Arc<UdpSocket>, SocketAddr),
    /// RFC 4571 framing is applied by the connection's writer task.
    Tcp(mpsc::UnboundedSender<Bytes>),
}

impl MediaSink {
    async fn send(&self, raw: &[u8]) -> Result<()> {
        match self {
            MediaSink::Udp(socket, addr) => {
                socket.send_to(raw, *addr).await?;
                Ok(())
            }
            MediaSink::Tcp(tx) => {
                tx.send(Bytes::copy_from_slice(raw))
                    .map_err(|_| Error::other("tcp connection gone"))?;
                Ok(())
            }
        }
    }
}

pub struct WebRtcTransport {
    pub(crate) ice: IceServer,
    certificate: dtls::crypto::Certificate,
    local_fingerprint: String,
    /// Socket owned by this transport; `None` when a WebRtcServer carries it.
    own_socket: Option<Arc<UdpSocket>>,
    selected: Mutex<Option<MediaSink>>,
    dtls_role: Mutex<DtlsRole>,
    dtls_state: Mutex<DtlsState>,
    /// sha-256 fingerprint announced by the remote in `transport.connect`.
    remote_fingerprint: Mutex<Option<String>>,
    /// Inbound DTLS records are pushed here and drained by the DTLSConn.
    dtls_bridge: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    srtp_local: Mutex<Option<Context>>,
    srtp_remote: Mutex<Option<Context>>,
    /// Kept alive for the lifetime of the transport so DTLS keeps draining
    /// the bridge (alerts, renegotiation, SCTP).
    dtls_conn: tokio::sync::Mutex<Option<Arc<dtls::conn::DTLSConn>>>,
    connected: AtomicBool,
}

impl WebRtcTransport {
    pub(crate) async fn new(
        listen_ip: Option<std::net::IpAddr>,
        port: Option<u16>,
        port_range: (u16, u16),
    ) -> Result<WebRtcTransport> {
        let own_socket = match listen_ip {
            Some(ip) => Some(Arc::new(super::bind_udp(ip, port, port_range).await?)),
            None => None,
        };

        let certificate =
            dtls::crypto::Certificate::generate_self_signed(["sfu-worker".to_owned()])?;
        let local_fingerprint = fingerprint_of(&certificate);

        Ok(WebRtcTransport {
            ice: IceServer::new(),
            certificate,
            local_fingerprint,
            own_socket,
            selected: Mutex::new(None),
            dtls_role: Mutex::new(DtlsRole::Auto),
            dtls_state: Mutex::new(DtlsState::New),
            remote_fingerprint: Mutex::new(None),
            dtls_bridge: Mutex::new(None),
            srtp_local: Mutex::new(None),
            srtp_remote: Mutex::new(None),
            dtls_conn: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    /// Parameters advertised to the control plane at creation.
    pub(crate) fn fill_creation_response(&self) -> Value {
        let local = self
            .own_socket
            .as_ref()
            .and_then(|s| s.local_addr().ok());
        json!({
            "iceParameters": {
                "usernameFragment": self.ice.ufrag(),
                "password": self.ice.pwd(),
                "iceLite": true,
            },
            "iceCandidates": local.map(|addr| json!([{
                "foundation": "udpcandidate",
                "ip": addr.ip(),
                "port": addr.port(),
                "protocol": "udp",
                "priority": 1076302079u32,
                "type": "host",
            }])),
            "dtlsParameters": {
                "role": "auto",
                "fingerprints": [
                    { "algorithm": "sha-256", "value": self.local_fingerprint }
                ],
            },
        })
    }

    /// Start the owned-socket read loop; server-carried transports receive
    /// packets through [`WebRtcTransport::on_packet`] instead.
    pub(crate) fn start(transport: &Arc<Transport>) {
        let super::TransportKind::WebRtc(webrtc) = &transport.kind else {
            return;
        };
        let Some(socket) = &webrtc.own_socket else {
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
                        log::debug!("webrtc socket recv ended: {err}");
                        return;
                    }
                };
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                if transport.closed() {
                    return;
                }
                WebRtcTransport::on_packet(
                    &transport,
                    MediaSink::Udp(Arc::clone(&socket), from),
                    from,
                    &buf[..len],
                )
                .await;
            }
        });
    }

    /// One packet from the network, whatever carried it.
    pub(crate) async fn on_packet(
        transport: &Arc<Transport>,
        sink: MediaSink,
        from: SocketAddr,
        data: &[u8],
    ) {
        let super::TransportKind::WebRtc(webrtc) = &transport.kind else {
            return;
        };

        if match_stun(data) {
            let previous_tuple = webrtc.ice.selected_tuple();
            match webrtc.ice.handle_stun(data, from) {
                Ok(result) => {
                    *webrtc.selected.lock().unwrap() = Some(sink.clone());
                    if let Err(err) = sink.send(&result.response).await {
                        log::debug!("cannot send STUN response: {err}");
                    }
                    if webrtc.ice.selected_tuple() != previous_tuple {
                        transport.shared.notifier.emit_with_data(
                            transport.id(),
                            "iceselectedtuplechange",
                            json!({
                                "remoteIp": from.ip(),
                                "remotePort": from.port(),
                            }),
                        );
                    }
                    if let Some(state) = result.state_changed {
                        transport.shared.notifier.emit_with_data(
                            transport.id(),
                            "icestatechange",
                            json!({ "iceState": ice_state_str(state) }),
                        );
                        webrtc.maybe_connected(transport).await;
                    }
                }
                Err(err) => {
                    log::debug!("invalid STUN request: {err}");
                }
            }
            return;
        }

        if match_dtls(data) {
            let tx = webrtc.dtls_bridge.lock().unwrap().clone();
            if let Some(tx) = tx {
                let _ = tx.send(data.to_vec());
            }
            return;
        }

        if match_srtp_or_srtcp(data) {
            if is_rtcp(data) {
                let decrypted = {
                    let mut srtp_remote = webrtc.srtp_remote.lock().unwrap();
                    match srtp_remote.as_mut() {
                        Some(context) => match context.decrypt_rtcp(data) {
                            Ok(out) => Some(Bytes::from(out)),
                            Err(err) => {
                                log::debug!("SRTCP decrypt failed: {err}");
                                None
                            }
                        },
                        None => None,
                    }
                };
                if let Some(decrypted) = decrypted {
                    transport.add_data_received(data.len());
                    transport.receive_rtcp_packet(&decrypted).await;
                }
            } else {
                let decrypted = {
                    let mut srtp_remote = webrtc.srtp_remote.lock().unwrap();
                    match srtp_remote.as_mut() {
                        Some(context) => match context.decrypt_rtp(data) {
                            Ok(out) => Some(out),
                            Err(err) => {
                                log::debug!("SRTP decrypt failed: {err}");
                                None
                            }
                        },
                        None => None,
                    }
                };
                if let Some(decrypted) = decrypted {
                    transport.receive_rtp_packet(&decrypted).await;
                }
            }
        }
    }

    pub(crate) fn maybe_connected<'a>(
        &'a self,
        transport: &'a Arc<Transport>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let ice_done = matches!(self.ice.state(), IceState::Connected | IceState::Completed);
        let dtls_done = *self.dtls_state.lock().unwrap() == DtlsState::Connected;
        if ice_done && dtls_done {
            self.connected.store(true, Ordering::SeqCst);
        }

        // DTLS can only make progress once ICE selected a tuple.
        if ice_done && *self.dtls_state.lock().unwrap() == DtlsState::New {
            let role = *self.dtls_role.lock().unwrap();
            if role != DtlsRole::Auto {
                self.start_dtls(transport, role).await;
            }
        }
        })
    }

    fn set_dtls_state(&self, transport: &Transport, state: DtlsState) {
        {
            let mut current = self.dtls_state.lock().unwrap();
            if *current == state {
                return;
            }
            *current = state;
        }
        transport.shared.notifier.emit_with_data(
            transport.id(),
            "dtlsstatechange",
            json!({ "dtlsState": state.as_str() }),
        );
    }

    pub(crate) async fn connect(&self, data: &Value) -> Result<Value> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Fingerprint {
            algorithm: String,
            value: String,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct DtlsParameters {
            #[serde(default)]
            role: Option<String>,
            fingerprints: Vec<Fingerprint>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ConnectBody {
            dtls_parameters: DtlsParameters,
        }

        let body: ConnectBody = parse_body(data)?;
        if body.dtls_parameters.fingerprints.is_empty() {
            return Err(Error::type_error("missing dtlsParameters.fingerprints"));
        }

        let expected = body
            .dtls_parameters
            .fingerprints
            .iter()
            .find(|f| f.algorithm.eq_ignore_ascii_case("sha-256"))
            .map(|f| f.value.to_uppercase())
            .ok_or_else(|| Error::type_error("no sha-256 fingerprint given"))?;
        *self.remote_fingerprint.lock().unwrap() = Some(expected);

        // Take the complementary role; a remote "auto" makes us the client,
        // matching an ICE-Lite endpoint that never initiates.
        let local_role = match body.dtls_parameters.role.as_deref() {
            Some("server") => DtlsRole::Client,
            Some("client") => DtlsRole::Server,
            Some("auto") | None => DtlsRole::Client,
            Some(other) => {
                return Err(Error::type_error(format!("invalid DTLS role \"{other}\"")));
            }
        };

        {
            let mut dtls_role = self.dtls_role.lock().unwrap();
            if *dtls_role != DtlsRole::Auto {
                return Err(Error::other("connect() already called"));
            }
            *dtls_role = local_role;
        }

        Ok(json!({
            "dtlsLocalRole": match local_role {
                DtlsRole::Client => "client",
                DtlsRole::Server => "server",
                DtlsRole::Auto => "auto",
            }
        }))
    }

    /// Spawn the DTLS handshake over the packet bridge.
    async fn start_dtls(&self, transport: &Arc<Transport>, role: DtlsRole) {
        self.set_dtls_state(transport, DtlsState::Connecting);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.dtls_bridge.lock().unwrap() = Some(tx);

        let bridge: Arc<dyn Conn + Send + Sync> = Arc::new(PacketBridge {
            rx: tokio::sync::Mutex::new(rx),
            transport: transport.weak_self.clone(),
        });

        let dtls_config = dtls::config::Config {
            certificates: vec![self.certificate.clone()],
            srtp_protection_profiles: vec![
                dtls::extension::extension_use_srtp::SrtpProtectionProfile::Srtp_Aead_Aes_128_Gcm,
                dtls::extension::extension_use_srtp::SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80,
            ],
            client_auth: dtls::config::ClientAuthType::RequireAnyClientCert,
            insecure_skip_verify: true,
            ..Default::default()
        };

        let weak = transport.weak_self.clone();
        let is_client = role == DtlsRole::Client;
        tokio::spawn(async move {
            let result = dtls::conn::DTLSConn::new(bridge, dtls_config, is_client, None).await;

            let Some(transport) = weak.upgrade() else {
                return;
            };
            let super::TransportKind::WebRtc(webrtc) = &transport.kind else {
                return;
            };

            let dtls_conn = match result {
                Ok(conn) => Arc::new(conn),
                Err(err) => {
                    log::warn!("DTLS handshake failed: {err}");
                    webrtc.set_dtls_state(&transport, DtlsState::Failed);
                    return;
                }
            };

            let profile = match dtls_conn.selected_srtpprotection_profile() {
                dtls::extension::extension_use_srtp::SrtpProtectionProfile::Srtp_Aead_Aes_128_Gcm => {
                    ProtectionProfile::AeadAes128Gcm
                }
                dtls::extension::extension_use_srtp::SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80 => {
                    ProtectionProfile::Aes128CmHmacSha1_80
                }
                _ => {
                    log::warn!("no negotiated SRTP protection profile");
                    webrtc.set_dtls_state(&transport, DtlsState::Failed);
                    return;
                }
            };

            // The remote certificate must carry the announced fingerprint.
            {
                let peer_certificates = dtls_conn.connection_state().await.peer_certificates;
                let Some(peer_cert) = peer_certificates.first() else {
                    log::warn!("no remote certificate exchanged");
                    webrtc.set_dtls_state(&transport, DtlsState::Failed);
                    return;
                };
                let mut hasher = Sha256::new();
                hasher.update(peer_cert);
                let actual = hasher
                    .finalize()
                    .iter()
                    .map(|b| format!("{b:02X}"))
                    .collect::<Vec<_>>()
                    .join(":");
                let expected = webrtc.remote_fingerprint.lock().unwrap().clone();
                if let Some(expected) = expected {
                    if expected != actual {
                        log::warn!("remote DTLS certificate fingerprint mismatch");
                        webrtc.set_dtls_state(&transport, DtlsState::Failed);
                        return;
                    }
                }
            }

            let mut srtp_config = srtp::config::Config {
                profile,
                ..Default::default()
            };
            let conn_state = dtls_conn.connection_state().await;
            if let Err(err) = srtp_config
                .extract_session_keys_from_dtls(conn_state, is_client)
                .await
            {
                log::warn!("cannot extract SRTP keys: {err}");
                webrtc.set_dtls_state(&transport, DtlsState::Failed);
                return;
            }

            let local = Context::new(
                &srtp_config.keys.local_master_key,
                &srtp_config.keys.local_master_salt,
                profile,
                None,
                None,
            );
            let remote = Context::new(
                &srtp_config.keys.remote_master_key,
                &srtp_config.keys.remote_master_salt,
                profile,
                None,
                None,
            );
            match (local, remote) {
                (Ok(local), Ok(remote)) => {
                    *webrtc.srtp_local.lock().unwrap() = Some(local);
                    *webrtc.srtp_remote.lock().unwrap() = Some(remote);
                }
                _ => {
                    log::warn!("cannot create SRTP contexts");
                    webrtc.set_dtls_state(&transport, DtlsState::Failed);
                    return;
                }
            }

            *webrtc.dtls_conn.lock().await = Some(Arc::clone(&dtls_conn));
            webrtc.set_dtls_state(&transport, DtlsState::Connected);
            let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> =
                Box::pin(webrtc.maybe_connected(&transport));
            fut.await;

            // Data channels ride on the established DTLS connection.
            if let Some(sctp) = &transport.sctp {
                Arc::clone(sctp)
                    .run(dtls_conn as Arc<dyn Conn + Send + Sync>, &transport)
                    .await;
            }
        });
    }

    pub(crate) fn restart_ice(&self) -> Result<Value> {
        let (ufrag, pwd) = self.ice.restart();
        Ok(json!({
            "iceParameters": {
                "usernameFragment": ufrag,
                "password": pwd,
                "iceLite": true,
            }
        }))
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) async fn send_rtp(&self, raw: Bytes) -> Result<()> {
        let sink = self.selected.lock().unwrap().clone();
        let Some(sink) = sink else {
            return Ok(());
        };
        let out = {
            let mut srtp_local = self.srtp_local.lock().unwrap();
            match srtp_local.as_mut() {
                Some(context) => context.encrypt_rtp(&raw)?,
                None => return Ok(()),
            }
        };
        sink.send(&out).await
    }

    pub(crate) async fn send_rtcp(&self, raw: Bytes) -> Result<()> {
        let sink = self.selected.lock().unwrap().clone();
        let Some(sink) = sink else {
            return Ok(());
        };
        let out = {
            let mut srtp_local = self.srtp_local.lock().unwrap();
            match srtp_local.as_mut() {
                Some(context) => Bytes::from(context.encrypt_rtcp(&raw)?),
                None => return Ok(()),
            }
        };
        sink.send(&out).await
    }

    pub(crate) async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.ice.set_closed();
        *self.dtls_state.lock().unwrap() = DtlsState::Closed;
        self.dtls_bridge.lock().unwrap().take();
    }

    pub(crate) fn fill_stats(&self) -> Value {
        json!({
            "iceState": ice_state_str(self.ice.state()),
            "dtlsState": self.dtls_state.lock().unwrap().as_str(),
            "iceSelectedTuple": self.ice.selected_tuple().map(|addr| json!({
                "remoteIp": addr.ip(),
                "remotePort": addr.port(),
                "protocol": "udp",
            })),
        })
    }
}

fn ice_state_str(state: IceState) -> &'static str {
    match state {
        IceState::New => "new",
        IceState::Connected => "connected",
        IceState::Completed => "completed",
        IceState::Disconnected => "disconnected",
        IceState::Closed => "closed",
    }
}

fn fingerprint_of(certificate: &dtls::crypto::Certificate) -> String {
    let mut hasher = Sha256::new();
    if let Some(der) = certificate.certificate.first() {
        hasher.update(der.as_ref());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// `util::Conn` that feeds inbound DTLS records from the demultiplexer and
/// writes outbound records to the selected media sink.
struct PacketBridge {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    transport: Weak<Transport>,
}

#[async_trait]
impl Conn for PacketBridge {
    async fn connect(&self, _addr: SocketAddr) -> std::result::Result<(), util::Error> {
        Err(util::Error::Other("not supported".to_owned()))
    }

    async fn recv(&self, buf: &mut [u8]) -> std::result::Result<usize, util::Error> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(data) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            None => Err(util::Error::Other("bridge closed".to_owned())),
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::result::Result<(usize, SocketAddr), util::Error> {
        let n = self.recv(buf).await?;
        Ok((n, SocketAddr::from(([0, 0, 0, 0], 0))))
    }

    async fn send(&self, buf: &[u8]) -> std::result::Result<usize, util::Error> {
        let Some(transport) = self.transport.upgrade() else {
            return Err(util::Error::Other("transport gone".to_owned()));
        };
        let super::TransportKind::WebRtc(webrtc) = &transport.kind else {
            return Err(util::Error::Other("not a webrtc transport".to_owned()));
        };
        let sink = webrtc.selected.lock().unwrap().clone();
        let Some(sink) = sink else {
            return Err(util::Error::Other("no selected tuple".to_owned()));
        };
        sink.send(buf)
            .await
            .map_err(|err| util::Error::Other(err.to_string()))?;
        Ok(buf.len())
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> std::result::Result<usize, util::Error> {
        self.send(buf).await
    }

    fn local_addr(&self) -> std::result::Result<SocketAddr, util::Error> {
        Ok(SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn close(&self) -> std::result::Result<(), util::Error> {
        Ok(())
    }
}

impl PacketBridge {
    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
        self
    }
}
