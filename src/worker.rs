//! Worker: top-level object owning routers and WebRTC servers, dispatching
//! control channel requests and driving orderly shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::{json, Value};
use tokio::io::AsyncRead;
use tokio::sync::Notify;

use crate::channel::{read_frame, Channel, PayloadChannel, Shared};
use crate::error::{Error, Result};
use crate::message::{
    ChannelFrame, ChannelRequest, ChannelResponse, Method, PayloadFrame, ResponseResult,
};
use crate::message::codec::{decode_channel_frame, decode_payload_frame};
use crate::router::Router;
use crate::settings::WorkerSettings;
use crate::webrtc_server::{ListenInfo, WebRtcServer};

pub struct Worker {
    pid: u32,
    closed: AtomicBool,
    shared: Arc<Shared>,
    channel: Channel,
    payload_channel: PayloadChannel,
    weak_self: Weak<Worker>,
    routers: Mutex<HashMap<String, Arc<Router>>>,
    webrtc_servers: Mutex<HashMap<String, Arc<WebRtcServer>>>,
    close_notify: Notify,
}

impl Worker {
    /// Build a worker around the write halves of its two channels. The read
    /// halves are handed to [`Worker::run`].
    pub fn new<W1, W2>(
        settings: WorkerSettings,
        control_writer: W1,
        payload_writer: W2,
    ) -> Result<Arc<Worker>>
    where
        W1: tokio::io::AsyncWrite + Send + Unpin + 'static,
        W2: tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        settings.validate()?;

        let channel = Channel::new(control_writer);
        let payload_channel = PayloadChannel::new(payload_writer);
        let shared = Shared::new(&channel, &payload_channel, settings);

        Ok(Arc::new_cyclic(|weak_self| Worker {
            pid: std::process::id(),
            closed: AtomicBool::new(false),
            shared,
            channel,
            payload_channel,
            weak_self: weak_self.clone(),
            routers: Mutex::new(HashMap::new()),
            webrtc_servers: Mutex::new(HashMap::new()),
            close_notify: Notify::new(),
        }))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// A `log::Log` sink forwarding records to the control plane, honoring
    /// the worker's dynamic log level.
    pub fn logger(&self) -> crate::channel::logger::ChannelLogger {
        crate::channel::logger::ChannelLogger::new(self.channel.sender(), Arc::clone(&self.shared))
    }

    pub(crate) fn get_router(&self, id: &str) -> Option<Arc<Router>> {
        self.routers.lock().unwrap().get(id).cloned()
    }

    pub(crate) fn get_webrtc_server(&self, id: &str) -> Option<Arc<WebRtcServer>> {
        self.webrtc_servers.lock().unwrap().get(id).cloned()
    }

    /// Drive both channels until close. Each channel runs its own strictly
    /// sequential loop, which keeps responses ordered on the wire; a frame
    /// read is never abandoned halfway.
    pub async fn run<R1, R2>(
        self: Arc<Self>,
        mut control_reader: R1,
        mut payload_reader: R2,
    ) -> Result<()>
    where
        R1: AsyncRead + Send + Unpin,
        R2: AsyncRead + Send + Unpin + 'static,
    {
        self.shared.notifier.emit(&self.pid.to_string(), "running");
        log::debug!("Worker running [pid:{}]", self.pid);

        {
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                loop {
                    match read_frame(&mut payload_reader).await {
                        Ok(Some(buf)) => worker.handle_payload_frame(buf).await,
                        Ok(None) => {
                            if !worker.closed() {
                                log::error!("payload channel remotely closed, closing myself");
                                worker.close().await;
                            }
                            return;
                        }
                        Err(err) => {
                            log::error!("payload channel read error, closing myself: {err}");
                            worker.close().await;
                            return;
                        }
                    }
                }
            });
        }

        let shutdown = self.close_notify.notified();
        tokio::pin!(shutdown);

        while !self.closed() {
            tokio::select! {
                biased;

                _ = shutdown.as_mut() => {
                    break;
                }

                frame = read_frame(&mut control_reader) => {
                    match frame {
                        Ok(Some(buf)) => self.handle_control_frame(buf).await,
                        Ok(None) => {
                            // If the pipe is remotely closed the supervisor
                            // is gone, so we must die.
                            if !self.closed() {
                                log::error!("channel remotely closed, closing myself");
                                self.close().await;
                            }
                            break;
                        }
                        Err(err) => {
                            log::error!("channel read error, closing myself: {err}");
                            self.close().await;
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_control_frame(&self, buf: bytes::Bytes) {
        let request = match decode_channel_frame(buf) {
            Ok(ChannelFrame::Request(request)) => request,
            Ok(other) => {
                log::warn!("unexpected inbound control frame: {other:?}");
                return;
            }
            Err(err) => {
                log::error!("invalid control frame, closing myself: {err}");
                self.close().await;
                return;
            }
        };

        log::debug!(
            "Channel request received [method:{}, id:{}]",
            request.method,
            request.id
        );

        let result = self.dispatch_request(&request).await;
        let response = ChannelResponse {
            id: request.id,
            result: match result {
                Ok(data) => ResponseResult::Accepted(data),
                Err(err) => {
                    log::warn!(
                        "request failed [method:{}, id:{}]: {err}",
                        request.method,
                        request.id
                    );
                    ResponseResult::Rejected {
                        kind: err.wire_kind(),
                        reason: err.to_string(),
                    }
                }
            },
        };

        if let Err(err) = self.channel.respond(&response) {
            log::debug!("cannot send response: {err}");
        }
    }

    async fn dispatch_request(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        if request.method.is_worker_method() {
            return self.handle_request(request).await;
        }

        let handler = self
            .shared
            .registrator
            .lookup_channel(&request.handler_id)
            .ok_or_else(|| Error::ErrHandlerNotFound(request.handler_id.clone()))?;
        handler.handle_channel_request(request).await
    }

    async fn handle_payload_frame(&self, buf: bytes::Bytes) {
        match decode_payload_frame(buf) {
            Ok(PayloadFrame::Request(request)) => {
                let result = match self
                    .shared
                    .registrator
                    .lookup_payload_request(&request.request.handler_id)
                {
                    Some(handler) => handler.handle_payload_request(&request).await,
                    None => Err(Error::ErrHandlerNotFound(request.request.handler_id.clone())),
                };
                let response = ChannelResponse {
                    id: request.request.id,
                    result: match result {
                        Ok(data) => ResponseResult::Accepted(data),
                        Err(err) => ResponseResult::Rejected {
                            kind: err.wire_kind(),
                            reason: err.to_string(),
                        },
                    },
                };
                if let Err(err) = self.payload_channel.respond(&response) {
                    log::debug!("cannot send payload response: {err}");
                }
            }
            Ok(PayloadFrame::Notification(notification)) => {
                // Notifications have no response; failures are logged only.
                match self
                    .shared
                    .registrator
                    .lookup_payload_notification(&notification.target_id)
                {
                    Some(handler) => {
                        if let Err(err) = handler.handle_payload_notification(notification).await {
                            log::warn!("payload notification failed: {err}");
                        }
                    }
                    None => {
                        log::warn!(
                            "no payload notification handler [targetId:{}]",
                            notification.target_id
                        );
                    }
                }
            }
            Err(err) => {
                log::error!("invalid payload frame, closing myself: {err}");
                self.close().await;
            }
        }
    }

    /// WORKER_* methods, handled without consulting the registrator.
    async fn handle_request(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        if self.closed() {
            return Err(Error::ErrClosed("Worker"));
        }

        match request.method {
            Method::WorkerClose => {
                log::debug!("Worker close request, stopping");
                // The response goes out first; close() queues the writer
                // drain sentinel behind it.
                let this = self.weak_self.upgrade();
                tokio::spawn(async move {
                    if let Some(worker) = this {
                        worker.close().await;
                    }
                });
                Ok(None)
            }
            Method::WorkerDump => Ok(Some(self.dump())),
            Method::WorkerGetResourceUsage => Ok(Some(resource_usage()?)),
            Method::WorkerUpdateSettings => {
                let update: crate::settings::UpdateableSettings =
                    crate::transport::parse_body(&request.data)?;
                let mut settings = self.shared.settings.lock().unwrap();
                if let Some(log_level) = update.log_level {
                    settings.log_level = log_level;
                }
                if let Some(log_tags) = update.log_tags {
                    for tag in &log_tags {
                        if !crate::settings::LOG_TAGS.contains(&tag.as_str()) {
                            return Err(Error::type_error(format!("invalid logTag \"{tag}\"")));
                        }
                    }
                    settings.log_tags = log_tags.into_iter().collect();
                }
                Ok(None)
            }
            Method::WorkerCreateRouter => {
                let router_id = crate::transport::parse_id_field(&request.data, "routerId")?;
                if self.routers.lock().unwrap().contains_key(&router_id) {
                    return Err(Error::other(
                        "a Router with same routerId already exists",
                    ));
                }
                let router = Router::new(
                    router_id.clone(),
                    Arc::clone(&self.shared),
                    self.weak_self.clone(),
                )?;
                self.routers.lock().unwrap().insert(router_id.clone(), router);
                log::debug!("Router created [routerId:{router_id}]");
                Ok(None)
            }
            Method::WorkerCloseRouter => {
                let router_id = crate::transport::parse_id_field(&request.data, "routerId")?;
                let router = self
                    .routers
                    .lock()
                    .unwrap()
                    .remove(&router_id)
                    .ok_or_else(|| Error::other("Router not found"))?;
                router.close().await;
                Ok(None)
            }
            Method::WorkerCreateWebRtcServer => {
                let server_id =
                    crate::transport::parse_id_field(&request.data, "webRtcServerId")?;
                if self.webrtc_servers.lock().unwrap().contains_key(&server_id) {
                    return Err(Error::other(
                        "a WebRtcServer with same webRtcServerId already exists",
                    ));
                }
                let listen_infos: Vec<ListenInfo> = request
                    .data
                    .get("listenInfos")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|err| Error::type_error(err.to_string()))?
                    .ok_or_else(|| Error::type_error("missing listenInfos"))?;

                let server =
                    WebRtcServer::new(server_id.clone(), listen_infos, Arc::clone(&self.shared))
                        .await?;
                self.webrtc_servers
                    .lock()
                    .unwrap()
                    .insert(server_id.clone(), server);
                log::debug!("WebRtcServer created [webRtcServerId:{server_id}]");
                Ok(None)
            }
            Method::WorkerCloseWebRtcServer => {
                let server_id =
                    crate::transport::parse_id_field(&request.data, "webRtcServerId")?;
                let server = self
                    .webrtc_servers
                    .lock()
                    .unwrap()
                    .remove(&server_id)
                    .ok_or_else(|| Error::other("WebRtcServer not found"))?;
                server.close().await;
                Ok(None)
            }
            _ => Err(Error::type_error(format!(
                "unknown method \"{}\" for the Worker",
                request.method
            ))),
        }
    }

    /// Orderly shutdown: routers first, then servers, then the channels.
    /// Deletion order is unobservable externally, but every handler id is
    /// unregistered before the channels close.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let routers: Vec<Arc<Router>> =
            self.routers.lock().unwrap().drain().map(|(_, r)| r).collect();
        for router in routers {
            router.close().await;
        }

        let servers: Vec<Arc<WebRtcServer>> = self
            .webrtc_servers
            .lock()
            .unwrap()
            .drain()
            .map(|(_, s)| s)
            .collect();
        for server in servers {
            server.close().await;
        }

        self.channel.close();
        self.payload_channel.close();
        self.close_notify.notify_waiters();
        log::debug!("Worker closed [pid:{}]", self.pid);
    }

    fn dump(&self) -> Value {
        let router_ids: Vec<String> = self.routers.lock().unwrap().keys().cloned().collect();
        let server_ids: Vec<String> =
            self.webrtc_servers.lock().unwrap().keys().cloned().collect();

        json!({
            "pid": self.pid,
            "webRtcServerIds": server_ids,
            "routerIds": router_ids,
            "channelMessageHandlers": {
                "channelRequestHandlers": self.shared.registrator.handler_ids(),
            },
        })
    }
}

/// OS-level counters via getrusage(2), converted the way the control plane
/// expects them (CPU times in ms).
fn resource_usage() -> Result<Value> {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let err = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if err != 0 {
        return Err(Error::other(format!(
            "getrusage() failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    fn to_ms(tv: libc::timeval) -> u64 {
        (tv.tv_sec as u64) * 1000 + (tv.tv_usec as u64) / 1000
    }

    Ok(json!({
        "ru_utime": to_ms(usage.ru_utime),
        "ru_stime": to_ms(usage.ru_stime),
        "ru_maxrss": usage.ru_maxrss,
        "ru_ixrss": usage.ru_ixrss,
        "ru_idrss": usage.ru_idrss,
        "ru_isrss": usage.ru_isrss,
        "ru_minflt": usage.ru_minflt,
        "ru_majflt": usage.ru_majflt,
        "ru_nswap": usage.ru_nswap,
        "ru_inblock": usage.ru_inblock,
        "ru_oublock": usage.ru_oublock,
        "ru_msgsnd": usage.ru_msgsnd,
        "ru_msgrcv": usage.ru_msgrcv,
        "ru_nsignals": usage.ru_nsignals,
        "ru_nvcsw": usage.ru_nvcsw,
        "ru_nivcsw": usage.ru_nivcsw,
    }))
}
