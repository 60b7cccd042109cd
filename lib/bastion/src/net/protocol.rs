use crate::net::connection::Connection;
use crate::net::message::{InputMessage, OutputMessage};
use std::sync::Arc;

/// Per-connection protocol handler plugged in by the application.
///
/// `on_first_message`, `on_receive_message` and `on_send_message` run on
/// reactor threads with the connection lock released, so a handler is free to
/// call back into [`Connection::send`] or [`Connection::resume_work`].
/// `on_connect` and `release` are deferred onto the game dispatcher.
pub trait Protocol: Send + Sync {
    /// Invoked once after the connection is accepted with a known protocol.
    fn on_connect(&self) {}

    /// The first inbound frame, cursor past the checksum and identifier.
    fn on_first_message(&self, msg: &mut InputMessage);

    /// A subsequent inbound frame. Returning true pauses the read loop until
    /// the handler calls [`Connection::resume_work`].
    fn on_receive_message(&self, msg: &mut InputMessage) -> bool;

    /// Pre-write hook; may stamp headers or transform the outbound buffer.
    fn on_send_message(&self, msg: &mut OutputMessage) {
        let _ = msg;
    }

    /// Lifecycle end; the connection schedules this exactly once.
    fn release(&self) {}
}

/// Factory for a protocol, registered on a listening port.
pub trait Service: Send + Sync {
    /// First body byte that selects this protocol on multi-socket ports.
    fn protocol_identifier(&self) -> u8;

    /// True when the protocol's identity is known at accept time; such a
    /// factory must be the sole service on its port.
    fn is_single_socket(&self) -> bool;

    /// True when first frames carry an Adler-32 prefix.
    fn is_checksummed(&self) -> bool;

    fn protocol_name(&self) -> &'static str;

    fn make_protocol(&self, connection: &Arc<Connection>) -> Arc<dyn Protocol>;
}
