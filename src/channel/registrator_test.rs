use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::message::ChannelRequest;

use super::registrator::{ChannelRequestHandler, MessageRegistrator};

struct DummyHandler;

#[async_trait]
impl ChannelRequestHandler for DummyHandler {
    async fn handle_channel_request(&self, _request: &ChannelRequest) -> Result<Option<Value>> {
        Ok(None)
    }
}

#[test]
fn register_and_lookup() {
    let registrator = MessageRegistrator::new();
    let handler: Arc<dyn ChannelRequestHandler> = Arc::new(DummyHandler);

    registrator
        .register("T1", Arc::downgrade(&handler), None, None)
        .unwrap();

    assert!(registrator.lookup_channel("T1").is_some());
    assert!(registrator.lookup_channel("T2").is_none());
    assert!(registrator.lookup_payload_request("T1").is_none());
}

#[test]
fn duplicate_registration_conflicts() {
    let registrator = MessageRegistrator::new();
    let handler: Arc<dyn ChannelRequestHandler> = Arc::new(DummyHandler);

    registrator
        .register("T1", Arc::downgrade(&handler), None, None)
        .unwrap();

    assert!(registrator
        .register("T1", Arc::downgrade(&handler), None, None)
        .is_err());
}

#[test]
fn unregister_empties_map() {
    let registrator = MessageRegistrator::new();
    let handler: Arc<dyn ChannelRequestHandler> = Arc::new(DummyHandler);

    registrator
        .register("T1", Arc::downgrade(&handler), None, None)
        .unwrap();
    registrator.unregister("T1");

    assert!(registrator.is_empty());
}

#[test]
fn registration_does_not_extend_lifetime() {
    let registrator = MessageRegistrator::new();
    let handler: Arc<dyn ChannelRequestHandler> = Arc::new(DummyHandler);

    registrator
        .register("T1", Arc::downgrade(&handler), None, None)
        .unwrap();
    drop(handler);

    assert!(registrator.lookup_channel("T1").is_none());
}
