//! The networking core: reactor, acceptor, connection pipeline and the
//! service lifecycle around them.

pub mod acceptor;
pub mod buffer;
pub mod connection;
pub mod message;
pub mod protocol;
pub mod reactor;
pub mod service;
pub mod support;

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::net::acceptor::Admission;
use crate::net::connection::ConnectionRegistry;
use crate::net::reactor::Reactor;
use flint::logging::Logger;
use std::sync::Arc;

/// Shared handles threaded from the service manager down through acceptors to
/// individual connections.
pub struct NetContext {
    pub reactor: Arc<Reactor>,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<ConnectionRegistry>,
    pub config: Arc<ServerConfig>,
    pub admission: Arc<dyn Admission>,
    pub log: Logger,
}
