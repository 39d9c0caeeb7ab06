#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! A selective forwarding unit (SFU) media worker.
//!
//! The worker is driven by a remote control plane over two message channels
//! (a control channel and a payload channel) and owns an object graph of
//! [`worker::Worker`] → [`router::Router`] → [`transport::Transport`] →
//! [`producer::Producer`] / [`consumer::Consumer`]. RTP received from
//! producers is scored, filtered per consumer (simulcast / SVC layer
//! selection, pause state, DTX) and forwarded with per-consumer sequence
//! number and timestamp rewriting. No media is ever decoded.

pub mod bwe;
pub mod channel;
pub mod codecs;
pub mod consumer;
pub mod data_consumer;
pub mod data_producer;
pub mod error;
pub mod message;
pub mod ortc;
pub mod producer;
pub mod router;
pub mod rtp_parameters;
pub mod rtp_stream;
pub mod seq_manager;
pub mod settings;
pub mod transport;
pub mod webrtc_server;
pub mod worker;

pub use error::Error;

/// Equal to UDP MTU.
pub(crate) const MTU_SIZE: usize = 1500;

/// Largest RTCP packet accepted from the payload channel.
pub(crate) const MAX_RTCP_LEN: usize = MTU_SIZE + 100;
