//! Direct transport: no network side. Packets enter through payload channel
//! notifications (`producer.send`, `transport.sendRtcp`, `dataProducer.send`)
//! and leave as payload channel notifications (`rtp`, `rtcp`, `message`),
//! with the byte counters kept for accounting parity with real transports.

/// All the state a direct transport needs is in the [`super::Transport`]
/// base; the payload channel is the wire.
pub struct DirectTransport {
    /// Messages above this size are refused at creation time by the control
    /// plane contract; the worker only logs and drops.
    pub max_message_size: u32,
}

impl DirectTransport {
    pub fn new(max_message_size: u32) -> DirectTransport {
        DirectTransport { max_message_size }
    }
}
