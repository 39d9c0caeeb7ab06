//! ICE-Lite server side: answer binding requests with short-term
//! credentials, follow the selected tuple, never gather candidates.

use std::net::SocketAddr;
use std::sync::Mutex;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use stun::attributes::{ATTR_ICE_CONTROLLING, ATTR_USERNAME, ATTR_USE_CANDIDATE};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::{Getter, Message, BINDING_SUCCESS, CLASS_REQUEST, METHOD_BINDING};
use stun::textattrs::Username;
use stun::xoraddr::XorMappedAddress;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    New,
    Connected,
    Completed,
    Disconnected,
    Closed,
}

/// What the caller should do with a successfully handled binding request.
pub(crate) struct BindingResult {
    pub response: Vec<u8>,
    pub use_candidate: bool,
    pub state_changed: Option<IceState>,
}

pub struct IceServer {
    ufrag: Mutex<String>,
    pwd: Mutex<String>,
    state: Mutex<IceState>,
    selected_tuple: Mutex<Option<SocketAddr>>,
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl IceServer {
    pub fn new() -> IceServer {
        IceServer {
            ufrag: Mutex::new(random_string(16)),
            pwd: Mutex::new(random_string(32)),
            state: Mutex::new(IceState::New),
            selected_tuple: Mutex::new(None),
        }
    }

    pub fn ufrag(&self) -> String {
        self.ufrag.lock().unwrap().clone()
    }

    pub fn pwd(&self) -> String {
        self.pwd.lock().unwrap().clone()
    }

    pub fn state(&self) -> IceState {
        *self.state.lock().unwrap()
    }

    pub fn selected_tuple(&self) -> Option<SocketAddr> {
        *self.selected_tuple.lock().unwrap()
    }

    /// Re-key on ICE restart; the transport keeps its sockets. Returns the
    /// new local parameters.
    pub(crate) fn restart(&self) -> (String, String) {
        let new_ufrag = random_string(16);
        let new_pwd = random_string(32);
        *self.ufrag.lock().unwrap() = new_ufrag.clone();
        *self.pwd.lock().unwrap() = new_pwd.clone();
        *self.state.lock().unwrap() = IceState::New;
        self.selected_tuple.lock().unwrap().take();
        (new_ufrag, new_pwd)
    }

    pub(crate) fn set_closed(&self) {
        *self.state.lock().unwrap() = IceState::Closed;
    }

    /// Handle one inbound STUN message. Only binding requests with our
    /// username and a valid short-term integrity are answered.
    pub(crate) fn handle_stun(&self, data: &[u8], from: SocketAddr) -> Result<BindingResult> {
        let mut message = Message {
            raw: vec![],
            ..Message::default()
        };
        message.raw.extend_from_slice(data);
        message.decode().map_err(Error::Stun)?;

        if message.typ.method != METHOD_BINDING || message.typ.class != CLASS_REQUEST {
            return Err(Error::other("unhandled STUN message class/method"));
        }

        // The lite agent is always controlled.
        if !message.contains(ATTR_ICE_CONTROLLING) {
            return Err(Error::other("binding request without ICE-CONTROLLING"));
        }

        let mut username = Username::new(ATTR_USERNAME, String::new());
        username.get_from(&message).map_err(Error::Stun)?;
        let value = username.to_string();
        let local_ufrag = value.split(':').next().unwrap_or_default();
        let expected_ufrag = self.ufrag();
        if local_ufrag != expected_ufrag {
            return Err(Error::other(format!(
                "wrong STUN username [expected:{expected_ufrag}, got:{local_ufrag}]"
            )));
        }

        let pwd = self.pwd();
        MessageIntegrity(pwd.as_bytes().to_vec())
            .check(&mut message)
            .map_err(Error::Stun)?;

        let use_candidate = message.contains(ATTR_USE_CANDIDATE);

        let mut response = Message::new();
        response
            .build(&[
                Box::new(message.clone()),
                Box::new(BINDING_SUCCESS),
                Box::new(XorMappedAddress {
                    ip: from.ip(),
                    port: from.port(),
                }),
                Box::new(MessageIntegrity::new_short_term_integrity(pwd)),
                Box::new(FINGERPRINT),
            ])
            .map_err(Error::Stun)?;

        let state_changed = {
            let mut state = self.state.lock().unwrap();
            match (*state, use_candidate) {
                (IceState::New, false) | (IceState::Disconnected, false) => {
                    *state = IceState::Connected;
                    *self.selected_tuple.lock().unwrap() = Some(from);
                    Some(IceState::Connected)
                }
                (IceState::New, true)
                | (IceState::Connected, true)
                | (IceState::Disconnected, true) => {
                    *state = IceState::Completed;
                    *self.selected_tuple.lock().unwrap() = Some(from);
                    Some(IceState::Completed)
                }
                _ => {
                    // Keep following the nominated pair.
                    *self.selected_tuple.lock().unwrap() = Some(from);
                    None
                }
            }
        };

        Ok(BindingResult {
            response: response.raw,
            use_candidate,
            state_changed,
        })
    }
}

impl Default for IceServer {
    fn default() -> Self {
        IceServer::new()
    }
}

