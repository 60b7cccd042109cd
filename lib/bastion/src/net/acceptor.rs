use crate::net::connection::{Connection, READ_TIMEOUT};
use crate::net::message::InputMessage;
use crate::net::protocol::{Protocol, Service};
use crate::net::reactor::EventHandler;
use crate::net::NetContext;
use flint::logging::{self, Logger};
use mio::net::{TcpListener, TcpStream};
use mio::{Ready, Token};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Delay before a failed bind is retried.
pub const BIND_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Admission decision made at accept time, before any protocol work.
/// The production implementation is the ban service; the default admits
/// everyone.
pub trait Admission: Send + Sync {
    fn accept_connection(&self, ip: Ipv4Addr) -> bool;
}

pub struct AcceptAll;

impl Admission for AcceptAll {
    #[inline]
    fn accept_connection(&self, _ip: Ipv4Addr) -> bool {
        true
    }
}

struct PortState {
    listener: Option<TcpListener>,
    token: Option<Token>,
    services: Vec<Arc<dyn Service>>,
    pending_rebind: bool,
    port: u16,
}

/// One listening port: owns the acceptor socket, keeps the accept loop hot
/// and self-heals on bind failures through a retry timer.
pub struct ServicePort {
    ctx: Arc<NetContext>,
    state: Mutex<PortState>,
    log: Logger,
}

impl ServicePort {
    pub fn new(ctx: &Arc<NetContext>, port: u16) -> Arc<ServicePort> {
        let log = ctx.log.new(logging::o!("component" => "acceptor", "port" => port));

        Arc::new(ServicePort {
            ctx: Arc::clone(ctx),
            state: Mutex::new(PortState {
                listener: None,
                token: None,
                services: Vec::new(),
                pending_rebind: false,
                port,
            }),
            log,
        })
    }

    /// Binds and starts accepting on `port`, closing any prior acceptor
    /// first. A bind failure arms the rebind timer instead of failing the
    /// service.
    pub fn open(self: &Arc<Self>, port: u16) {
        let mut state = self.state.lock().expect("Acceptor state poisoned");

        self.close_with_state(&mut state);
        state.port = port;
        state.pending_rebind = false;

        let bind_address = if self.ctx.config.bind_only_global_address {
            format!("{}:{}", self.ctx.config.ip, port)
        } else {
            format!("0.0.0.0:{}", port)
        };

        let listener = bind_address
            .parse::<SocketAddr>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid bind address"))
            .and_then(|address| TcpListener::bind(&address));

        let listener = match listener {
            Ok(listener) => listener,
            Err(err) => {
                logging::warn!(self.log, "failed to bind acceptor"; "address" => bind_address, "error" => %err);
                self.schedule_reopen(&mut state, BIND_RETRY_DELAY);
                return;
            }
        };

        match self.ctx.reactor.register(&listener, Ready::readable(), self) {
            Ok(token) => {
                logging::info!(self.log, "listening"; "address" => %bind_address);
                state.listener = Some(listener);
                state.token = Some(token);
                drop(state);

                // Drain anything that raced in before registration.
                self.accept();
            }
            Err(err) => {
                logging::warn!(self.log, "failed to register acceptor"; "error" => %err);
                self.schedule_reopen(&mut state, BIND_RETRY_DELAY);
            }
        }
    }

    fn schedule_reopen(self: &Arc<Self>, state: &mut PortState, delay: Duration) {
        state.pending_rebind = true;

        let port = state.port;
        let weak = Arc::downgrade(self);
        self.ctx.reactor.schedule(delay, move || {
            if let Some(service_port) = weak.upgrade() {
                service_port.open(port);
            }
        });
    }

    /// Appends a protocol factory. A single-socket factory must be the sole
    /// service on the port, so mixing is rejected in both directions.
    pub fn add_service(&self, service: Arc<dyn Service>) -> bool {
        let mut state = self.state.lock().expect("Acceptor state poisoned");

        if state.services.iter().any(|svc| svc.is_single_socket()) {
            return false;
        }
        if service.is_single_socket() && !state.services.is_empty() {
            return false;
        }

        state.services.push(service);
        true
    }

    /// True when the port's sole service knows its protocol at accept time.
    pub fn is_single_socket(&self) -> bool {
        let state = self.state.lock().expect("Acceptor state poisoned");
        state.services.first().map_or(false, |svc| svc.is_single_socket())
    }

    /// Comma-separated names of the registered services.
    pub fn protocol_names(&self) -> String {
        let state = self.state.lock().expect("Acceptor state poisoned");
        let names: Vec<&'static str> = state.services.iter().map(|svc| svc.protocol_name()).collect();
        names.join(", ")
    }

    /// The actual bound port, once listening.
    pub fn local_port(&self) -> Option<u16> {
        let state = self.state.lock().expect("Acceptor state poisoned");
        state
            .listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|address| address.port())
    }

    #[cfg(test)]
    fn pending_rebind(&self) -> bool {
        self.state.lock().expect("Acceptor state poisoned").pending_rebind
    }

    /// Closes the acceptor socket, ignoring errors.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("Acceptor state poisoned");
        self.close_with_state(&mut state);
    }

    fn close_with_state(&self, state: &mut PortState) {
        if let Some(listener) = state.listener.take() {
            if let Some(token) = state.token.take() {
                self.ctx.reactor.deregister(token, &listener);
            }
        }
    }

    pub fn on_stop(&self) {
        self.close();
    }

    /// Drains the accept queue. Each accepted socket becomes a registered
    /// connection; the loop always continues so the listener stays hot.
    fn accept(self: &Arc<Self>) {
        loop {
            let accepted = {
                let state = self.state.lock().expect("Acceptor state poisoned");
                match state.listener.as_ref() {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };

            match accepted {
                Ok((stream, address)) => self.on_accept(stream, address),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    self.on_accept_error(err);
                    return;
                }
            }
        }
    }

    fn on_accept(self: &Arc<Self>, stream: TcpStream, address: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            logging::debug!(self.log, "failed to set TCP_NODELAY"; "error" => %err);
        }

        let service = {
            let state = self.state.lock().expect("Acceptor state poisoned");
            state.services.first().cloned()
        };
        let service = match service {
            Some(service) => service,
            None => {
                logging::debug!(self.log, "no services registered, dropping connection"; "peer" => %address);
                return;
            }
        };

        let connection = self.ctx.registry.create_connection(stream, &self.ctx, self);

        let ip = connection.ip();
        if ip != 0 && self.ctx.admission.accept_connection(Ipv4Addr::from(ip)) {
            logging::debug!(self.log, "connection accepted"; "peer" => %address);
            if service.is_single_socket() {
                let protocol = service.make_protocol(&connection);
                connection.accept(Some(protocol));
            } else {
                connection.accept(None);
            }
        } else {
            logging::debug!(self.log, "connection rejected"; "peer" => %address);
            connection.close(true);
        }
    }

    /// A broken listener is closed and reopened on the same port after a
    /// grace period, unless a rebind is already pending.
    fn on_accept_error(self: &Arc<Self>, err: io::Error) {
        logging::warn!(self.log, "accept failed"; "error" => %err);

        let mut state = self.state.lock().expect("Acceptor state poisoned");
        if state.pending_rebind {
            return;
        }

        self.close_with_state(&mut state);
        self.schedule_reopen(&mut state, READ_TIMEOUT);
    }

    /// Picks a protocol factory for the first frame of a multi-socket
    /// connection. The identifier byte is consumed from the message;
    /// checksummed services additionally require the checksum to have
    /// matched.
    pub fn make_protocol(
        &self,
        checksum_ok: bool,
        msg: &mut InputMessage,
        connection: &Arc<Connection>,
    ) -> Option<Arc<dyn Protocol>> {
        let identifier = msg.get_u8().ok()?;

        let matched = {
            let state = self.state.lock().expect("Acceptor state poisoned");
            state
                .services
                .iter()
                .find(|service| {
                    identifier == service.protocol_identifier()
                        && ((checksum_ok && service.is_checksummed()) || !service.is_checksummed())
                })
                .cloned()
        };

        matched.map(|service| service.make_protocol(connection))
    }
}

impl EventHandler for ServicePort {
    fn ready(self: Arc<Self>, readiness: Ready) {
        if readiness.is_readable() {
            self.accept();
        }
    }
}
