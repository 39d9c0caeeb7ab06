use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::{ChannelRequest, PayloadNotification, PayloadRequest};

/// Receives control channel requests addressed to one handler id.
#[async_trait]
pub trait ChannelRequestHandler: Send + Sync {
    async fn handle_channel_request(&self, request: &ChannelRequest) -> Result<Option<Value>>;
}

/// Receives payload channel requests addressed to one handler id.
#[async_trait]
pub trait PayloadRequestHandler: Send + Sync {
    async fn handle_payload_request(&self, request: &PayloadRequest) -> Result<Option<Value>>;
}

/// Receives payload channel notifications addressed to one handler id.
#[async_trait]
pub trait PayloadNotificationHandler: Send + Sync {
    async fn handle_payload_notification(&self, notification: PayloadNotification) -> Result<()>;
}

struct RegisteredHandler {
    channel: Weak<dyn ChannelRequestHandler>,
    payload_request: Option<Weak<dyn PayloadRequestHandler>>,
    payload_notification: Option<Weak<dyn PayloadNotificationHandler>>,
}

/// Process-wide map from handler id to the object currently responsible for
/// its requests and notifications.
///
/// Handlers are held weakly: a registration never extends the lifetime of
/// the object behind it, and objects unregister before dropping so that the
/// map is in bijection with live objects.
pub struct MessageRegistrator {
    handlers: Mutex<HashMap<String, RegisteredHandler>>,
}

impl MessageRegistrator {
    pub fn new() -> MessageRegistrator {
        MessageRegistrator {
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        handler_id: &str,
        channel: Weak<dyn ChannelRequestHandler>,
        payload_request: Option<Weak<dyn PayloadRequestHandler>>,
        payload_notification: Option<Weak<dyn PayloadNotificationHandler>>,
    ) -> Result<()> {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(handler_id) {
            return Err(Error::ErrHandlerAlreadyRegistered(handler_id.to_string()));
        }
        handlers.insert(
            handler_id.to_string(),
            RegisteredHandler {
                channel,
                payload_request,
                payload_notification,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, handler_id: &str) {
        self.handlers.lock().unwrap().remove(handler_id);
    }

    pub fn lookup_channel(&self, handler_id: &str) -> Option<Arc<dyn ChannelRequestHandler>> {
        self.handlers
            .lock()
            .unwrap()
            .get(handler_id)
            .and_then(|h| h.channel.upgrade())
    }

    pub fn lookup_payload_request(
        &self,
        handler_id: &str,
    ) -> Option<Arc<dyn PayloadRequestHandler>> {
        self.handlers
            .lock()
            .unwrap()
            .get(handler_id)
            .and_then(|h| h.payload_request.as_ref())
            .and_then(|w| w.upgrade())
    }

    pub fn lookup_payload_notification(
        &self,
        handler_id: &str,
    ) -> Option<Arc<dyn PayloadNotificationHandler>> {
        self.handlers
            .lock()
            .unwrap()
            .get(handler_id)
            .and_then(|h| h.payload_notification.as_ref())
            .and_then(|w| w.upgrade())
    }

    /// Registered handler ids, for `worker.dump`.
    pub fn handler_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().unwrap().is_empty()
    }
}

impl Default for MessageRegistrator {
    fn default() -> Self {
        MessageRegistrator::new()
    }
}
