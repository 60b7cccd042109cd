//! A minimal single-socket service that echoes frame payloads back, mostly
//! useful for smoke-testing a deployment with netcat.

use bastion::net::connection::Connection;
use bastion::net::message::{InputMessage, OutputMessage};
use bastion::net::protocol::{Protocol, Service};
use flint::logging::{self, Logger};
use std::sync::{Arc, Weak};

pub struct EchoService {
    log: Logger,
}

impl EchoService {
    pub fn new(log: &Logger) -> Arc<EchoService> {
        Arc::new(EchoService {
            log: log.new(logging::o!("service" => "echo")),
        })
    }
}

impl Service for EchoService {
    fn protocol_identifier(&self) -> u8 {
        0x00
    }

    fn is_single_socket(&self) -> bool {
        true
    }

    fn is_checksummed(&self) -> bool {
        false
    }

    fn protocol_name(&self) -> &'static str {
        "echo"
    }

    fn make_protocol(&self, connection: &Arc<Connection>) -> Arc<dyn Protocol> {
        Arc::new(EchoProtocol {
            connection: Arc::downgrade(connection),
            log: self.log.new(logging::o!("connection_id" => connection.id())),
        })
    }
}

struct EchoProtocol {
    connection: Weak<Connection>,
    log: Logger,
}

impl EchoProtocol {
    fn echo(&self, msg: &mut InputMessage) {
        let connection = match self.connection.upgrade() {
            Some(connection) => connection,
            None => return,
        };

        let mut reply = OutputMessage::new();
        reply.add_bytes(msg.remaining_slice());
        connection.send(reply);
    }
}

impl Protocol for EchoProtocol {
    fn on_connect(&self) {
        logging::debug!(self.log, "echo session ready");
    }

    fn on_first_message(&self, msg: &mut InputMessage) {
        self.echo(msg);
    }

    fn on_receive_message(&self, msg: &mut InputMessage) -> bool {
        self.echo(msg);
        false
    }

    fn on_send_message(&self, msg: &mut OutputMessage) {
        // Frame the reply the same way requests arrive.
        msg.prepend_u16(msg.body_len() as u16);
    }

    fn release(&self) {
        logging::debug!(self.log, "echo session released");
    }
}
