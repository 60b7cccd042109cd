use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::net::acceptor::{AcceptAll, Admission, ServicePort};
use crate::net::connection::ConnectionRegistry;
use crate::net::protocol::Service;
use crate::net::reactor::Reactor;
use crate::net::NetContext;
use flint::logging::{self, Logger};
use indexmap::IndexMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Grace period between stopping the acceptors and tearing the reactor down,
/// so in-flight completions can finish or observe the shutdown.
pub const DEATH_DELAY: Duration = Duration::from_secs(3);

/// Lifecycle root: owns the reactor, the registry and the per-port
/// acceptors. `run` drives everything until `stop`.
pub struct ServiceManager {
    ctx: Arc<NetContext>,
    acceptors: Mutex<IndexMap<u16, Arc<ServicePort>>>,
    running: AtomicBool,
    log: Logger,
}

impl ServiceManager {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: ServerConfig,
        dispatcher: Arc<Dispatcher>,
        admission: Arc<dyn Admission>,
        log: L,
    ) -> io::Result<Arc<ServiceManager>> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "service_manager")),
            _ => logging::discard(),
        };

        let ctx = Arc::new(NetContext {
            reactor: Reactor::new(&log)?,
            dispatcher,
            registry: ConnectionRegistry::new(&log),
            config: Arc::new(config),
            admission,
            log: log.clone(),
        });

        Ok(Arc::new(ServiceManager {
            ctx,
            acceptors: Mutex::new(IndexMap::new()),
            running: AtomicBool::new(false),
            log,
        }))
    }

    /// Convenience constructor with the allow-all admission service.
    pub fn open<'a, L: Into<Option<&'a Logger>>>(
        config: ServerConfig,
        dispatcher: Arc<Dispatcher>,
        log: L,
    ) -> io::Result<Arc<ServiceManager>> {
        Self::new(config, dispatcher, Arc::new(AcceptAll), log)
    }

    #[inline]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ctx.registry
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Registers a protocol factory on `port`, opening the acceptor on first
    /// use. Returns false when the factory cannot share the port.
    pub fn add_service(&self, service: Arc<dyn Service>, port: u16) -> bool {
        let service_port = {
            let mut acceptors = self.acceptors.lock().expect("Acceptor map poisoned");
            Arc::clone(acceptors.entry(port).or_insert_with(|| {
                let service_port = ServicePort::new(&self.ctx, port);
                service_port.open(port);
                service_port
            }))
        };

        let name = service.protocol_name();
        if !service_port.add_service(service) {
            logging::error!(self.log, "service cannot share the port";
                            "service" => name,
                            "port" => port,
                            "registered" => service_port.protocol_names());
            return false;
        }

        true
    }

    /// The actual bound port of the acceptor registered under `port`; useful
    /// with ephemeral binds.
    pub fn local_port(&self, port: u16) -> Option<u16> {
        let acceptors = self.acceptors.lock().expect("Acceptor map poisoned");
        acceptors.get(&port).and_then(|service_port| service_port.local_port())
    }

    /// Starts the reactor and blocks until [`ServiceManager::stop`] has run
    /// its course, then reaps the reactor threads. Refuses a second start.
    pub fn run(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            logging::error!(self.log, "service manager is already running");
            return;
        }

        logging::info!(self.log, "starting services"; "workers" => self.ctx.config.effective_workers());
        self.ctx.reactor.start(self.ctx.config.effective_workers());
        self.ctx.reactor.join();
    }

    /// Two-phase shutdown: stop the acceptors now, then let the death timer
    /// drop the reactor's work flag once in-flight completions had their
    /// grace period.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        logging::info!(self.log, "stopping services");

        let stopped: Vec<Arc<ServicePort>> = {
            let mut acceptors = self.acceptors.lock().expect("Acceptor map poisoned");
            acceptors.drain(..).map(|(_, service_port)| service_port).collect()
        };

        for service_port in stopped {
            self.ctx.reactor.post(move || service_port.on_stop());
        }

        let reactor = Arc::clone(&self.ctx.reactor);
        self.ctx.reactor.schedule(DEATH_DELAY, move || reactor.shutdown());
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::Connection;
    use crate::net::message::{InputMessage, OutputMessage};
    use crate::net::protocol::Protocol;

    struct StubProtocol;

    impl Protocol for StubProtocol {
        fn on_first_message(&self, _msg: &mut InputMessage) {}
        fn on_receive_message(&self, _msg: &mut InputMessage) -> bool {
            false
        }
        fn on_send_message(&self, _msg: &mut OutputMessage) {}
    }

    struct StubService;

    impl Service for StubService {
        fn protocol_identifier(&self) -> u8 {
            0x01
        }
        fn is_single_socket(&self) -> bool {
            false
        }
        fn is_checksummed(&self) -> bool {
            false
        }
        fn protocol_name(&self) -> &'static str {
            "stub"
        }
        fn make_protocol(&self, _connection: &Arc<Connection>) -> Arc<dyn Protocol> {
            Arc::new(StubProtocol)
        }
    }

    struct SingleStub;

    impl Service for SingleStub {
        fn protocol_identifier(&self) -> u8 {
            0x02
        }
        fn is_single_socket(&self) -> bool {
            true
        }
        fn is_checksummed(&self) -> bool {
            false
        }
        fn protocol_name(&self) -> &'static str {
            "single-stub"
        }
        fn make_protocol(&self, _connection: &Arc<Connection>) -> Arc<dyn Protocol> {
            Arc::new(StubProtocol)
        }
    }

    fn test_manager() -> Arc<ServiceManager> {
        let mut config = ServerConfig::default();
        config.worker_threads = 2;
        ServiceManager::open(config, Dispatcher::new(None), None).unwrap()
    }

    #[test]
    fn test_add_service_opens_acceptor() {
        let manager = test_manager();

        assert!(manager.add_service(Arc::new(StubService), 0));
        let bound = manager.local_port(0).expect("Acceptor must be bound");
        assert_ne!(bound, 0);
    }

    #[test]
    fn test_add_service_shares_port() {
        let manager = test_manager();

        assert!(manager.add_service(Arc::new(StubService), 0));
        // A single-socket factory cannot join an occupied port.
        assert!(!manager.add_service(Arc::new(SingleStub), 0));
    }

    #[test]
    fn test_stop_without_run_is_harmless() {
        let manager = test_manager();
        assert!(!manager.is_running());
        manager.stop();
        assert!(!manager.is_running());
    }

    #[test]
    fn test_run_and_stop_joins() {
        let manager = test_manager();
        manager.add_service(Arc::new(StubService), 0);

        let runner = Arc::clone(&manager);
        let handle = std::thread::spawn(move || runner.run());

        // Wait until the run thread flipped the flag.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !manager.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(manager.is_running());

        manager.stop();
        handle.join().expect("Run thread must exit after stop");
        assert!(!manager.is_running());
    }
}
