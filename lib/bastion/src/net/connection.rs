use crate::net::acceptor::ServicePort;
use crate::net::buffer::Buffer;
use crate::net::message::{
    InputMessage, OutputMessage, CHECKSUM_LENGTH, HEADER_LENGTH, MAX_BODY_LENGTH,
};
use crate::net::protocol::Protocol;
use crate::net::reactor::{EventHandler, TimerId};
use crate::net::NetContext;
use byteorder::{ByteOrder, LittleEndian};
use flint::checksum::adler32;
use flint::logging::{self, Logger};
use flint::time::timestamp_secs;
use hashbrown::HashMap;
use mio::net::TcpStream;
use mio::{Ready, Token};
use std::collections::VecDeque;
use std::io;
use std::io::Write;
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Idle limit on a pending frame read.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Stall limit on an in-flight write; also the drain budget granted to a
/// closing connection before `release` runs.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

const READ_BUFFER_SIZE: usize = 65536;

pub type ConnectionId = usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Waiting to see whether the first bytes are a proxy preamble.
    Identifying = 0,
    /// Preamble matched so far; reading the rest of the server name.
    ReadingProxyRemainder = 1,
    Open = 2,
    Closed = 3,
}

impl ConnectionState {
    #[inline]
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::Identifying,
            1 => ConnectionState::ReadingProxyRemainder,
            2 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// What the read pipeline is waiting for next.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ReadPhase {
    /// First two bytes of a possible proxy preamble.
    PreambleFirst,
    /// The remaining `n` bytes of the server name.
    PreambleRemainder(usize),
    /// A two-byte frame length.
    Header,
    /// A frame body of the given length.
    Body(usize),
    /// The protocol asked the read loop to hold off until `resume_work`.
    Paused,
    /// No reads outstanding (pre-accept or closed).
    Idle,
}

impl ReadPhase {
    /// Bytes required before the phase can complete; None when the pipeline
    /// is not waiting for the socket.
    #[inline]
    fn wanted(&self) -> Option<usize> {
        match *self {
            ReadPhase::PreambleFirst | ReadPhase::Header => Some(HEADER_LENGTH),
            ReadPhase::PreambleRemainder(count) => Some(count),
            ReadPhase::Body(count) => Some(count),
            ReadPhase::Paused | ReadPhase::Idle => None,
        }
    }
}

/// Verdict on the first two inbound bytes of an identifying connection.
#[derive(Debug, Eq, PartialEq)]
enum PreambleCheck {
    /// Not a preamble; the two bytes are a frame header.
    Header,
    /// Preamble so far; `n` more bytes of the server name follow.
    Remainder(usize),
    /// The full preamble was just two bytes and matched.
    Done,
}

fn check_preamble(first: &[u8], preamble: &[u8]) -> PreambleCheck {
    if preamble.len() < HEADER_LENGTH
        || first[1] == 0
        || !first[..HEADER_LENGTH].eq_ignore_ascii_case(&preamble[..HEADER_LENGTH])
    {
        PreambleCheck::Header
    } else if preamble.len() > HEADER_LENGTH {
        PreambleCheck::Remainder(preamble.len() - HEADER_LENGTH)
    } else {
        PreambleCheck::Done
    }
}

/// Inbound packet budget, measured in whole seconds from the epoch.
struct RateWindow {
    time_connected: u64,
    packets: u32,
}

impl RateWindow {
    #[inline]
    fn new(now: u64) -> RateWindow {
        RateWindow {
            time_connected: now,
            packets: 0,
        }
    }

    /// Accounts one inbound frame; returns true when the source exceeded
    /// `limit` packets per second.
    fn tick(&mut self, now: u64, limit: u32) -> bool {
        let elapsed = std::cmp::max(1, now.saturating_sub(self.time_connected) + 1);

        self.packets += 1;
        if u64::from(self.packets) / elapsed > u64::from(limit) {
            return true;
        }

        if now.saturating_sub(self.time_connected) > 2 {
            self.time_connected = now;
            self.packets = 0;
        }

        false
    }
}

#[derive(Debug, Copy, Clone)]
enum TimerKind {
    Read,
    Write,
}

struct Inner {
    stream: Option<TcpStream>,
    token: Option<Token>,

    buffer: Buffer,
    msg: InputMessage,
    phase: ReadPhase,
    processing: bool,
    resume_requested: bool,
    peer_closed: bool,
    received_first: bool,
    rate: RateWindow,

    queue: VecDeque<OutputMessage>,
    current_write: Option<(OutputMessage, usize)>,
    writing: bool,

    read_timer: Option<TimerId>,
    read_generation: u64,
    write_timer: Option<TimerId>,
    write_generation: u64,
}

/// One accepted TCP socket: the per-connection state machine, the frame read
/// pipeline and the ordered write queue.
pub struct Connection {
    id: ConnectionId,
    ctx: Arc<NetContext>,
    service_port: Arc<ServicePort>,

    state: AtomicU8,
    // 1 = not yet resolved, 0 = unknown or closed, anything else is the
    // remote IPv4 address.
    ip: AtomicU32,
    released: AtomicBool,

    protocol: Mutex<Option<Arc<dyn Protocol>>>,
    inner: Mutex<Inner>,
    log: Logger,
}

impl Connection {
    fn new(
        id: ConnectionId,
        stream: TcpStream,
        ctx: &Arc<NetContext>,
        service_port: &Arc<ServicePort>,
    ) -> Arc<Connection> {
        let log = ctx.log.new(logging::o!("connection_id" => id));

        Arc::new(Connection {
            id,
            ctx: Arc::clone(ctx),
            service_port: Arc::clone(service_port),
            state: AtomicU8::new(ConnectionState::Open as u8),
            ip: AtomicU32::new(1),
            released: AtomicBool::new(false),
            protocol: Mutex::new(None),
            inner: Mutex::new(Inner {
                stream: Some(stream),
                token: None,
                buffer: Buffer::new(READ_BUFFER_SIZE),
                msg: InputMessage::new(),
                phase: ReadPhase::Idle,
                processing: false,
                resume_requested: false,
                peer_closed: false,
                received_first: false,
                rate: RateWindow::new(timestamp_secs()),
                queue: VecDeque::new(),
                current_write: None,
                writing: false,
                read_timer: None,
                read_generation: 0,
                write_timer: None,
                write_generation: 0,
            }),
            log,
        })
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The remote IPv4 address, resolved lazily and cached.
    pub fn ip(&self) -> u32 {
        if self.ip.load(Ordering::Acquire) == 1 {
            let resolved = {
                let inner = self.inner.lock().expect("Connection state poisoned");
                inner.stream.as_ref().and_then(|stream| stream.peer_addr().ok())
            };

            let value = match resolved {
                Some(SocketAddr::V4(address)) => u32::from(*address.ip()),
                _ => 0,
            };
            self.ip.store(value, Ordering::Release);
        }

        self.ip.load(Ordering::Acquire)
    }

    #[inline]
    fn display_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip.load(Ordering::Acquire))
    }

    /// Starts the read pipeline. With a protocol the connection enters the
    /// identifying state and watches for the optional proxy preamble; the
    /// protocol is otherwise chosen from the first frame.
    pub fn accept(self: &Arc<Self>, protocol: Option<Arc<dyn Protocol>>) {
        let mut inner = self.inner.lock().expect("Connection state poisoned");

        match protocol {
            Some(protocol) => {
                self.set_state(ConnectionState::Identifying);
                *self.protocol.lock().expect("Protocol slot poisoned") = Some(Arc::clone(&protocol));

                let hook = Arc::clone(&protocol);
                self.ctx.dispatcher.add_event(move || hook.on_connect(), WRITE_TIMEOUT);

                inner.phase = ReadPhase::PreambleFirst;
            }
            None => {
                inner.phase = ReadPhase::Header;
            }
        }

        let registered = {
            let inner_ref = &mut *inner;
            let stream = inner_ref.stream.as_ref().expect("Connection must have valid stream");
            self.ctx
                .reactor
                .register(stream, Ready::readable() | Ready::writable(), self)
        };

        match registered {
            Ok(token) => {
                inner.token = Some(token);
                self.arm_read_timer(&mut inner);
            }
            Err(err) => {
                logging::error!(self.log, "failed to register connection"; "error" => %err);
                self.close_locked(&mut inner, true);
            }
        }
    }

    /// Queues an outbound message. Messages are written strictly in `send`
    /// order; a send on a closed connection is dropped silently.
    pub fn send(self: &Arc<Self>, msg: OutputMessage) {
        if self.state() == ConnectionState::Closed {
            return;
        }

        let mut inner = self.inner.lock().expect("Connection state poisoned");
        let pending = inner.writing;
        inner.queue.push_back(msg);

        if !pending {
            if inner.stream.is_some() {
                inner.writing = true;
                let connection = Arc::clone(self);
                self.ctx.reactor.post(move || connection.internal_worker());
            } else {
                logging::error!(self.log, "socket is not open for writing");
                inner.queue.clear();
                self.close_locked(&mut inner, true);
            }
        }
    }

    /// Restarts the read loop after a protocol handler paused it.
    pub fn resume_work(self: &Arc<Self>) {
        let connection = Arc::clone(self);
        self.ctx.reactor.post(move || connection.handle_resume());
    }

    /// Idempotent close. Deregisters from the registry, schedules the
    /// protocol release and either closes the socket now (`force`, or nothing
    /// queued) or lets the write pipeline drain first.
    pub fn close(self: &Arc<Self>, force: bool) {
        let mut inner = self.inner.lock().expect("Connection state poisoned");
        self.close_locked(&mut inner, force);
    }

    fn close_locked(self: &Arc<Self>, inner: &mut Inner, force: bool) {
        self.ctx.registry.release(self.id);
        self.ip.store(0, Ordering::Release);

        if self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel)
            == ConnectionState::Closed as u8
        {
            return;
        }

        logging::debug!(self.log, "closing connection";
                        "force" => force,
                        "queued_writes" => inner.queue.len());

        self.schedule_release();

        if force || (inner.queue.is_empty() && inner.current_write.is_none()) {
            self.close_socket(inner);
        }
    }

    /// Defers `Protocol::release` onto the dispatcher, once, with a drain
    /// budget of `WRITE_TIMEOUT`.
    fn schedule_release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(protocol) = self.protocol.lock().expect("Protocol slot poisoned").clone() {
            self.ctx
                .dispatcher
                .add_event(move || protocol.release(), WRITE_TIMEOUT);
        }
    }

    fn close_socket(&self, inner: &mut Inner) {
        self.cancel_read_timer(inner);
        self.cancel_write_timer(inner);
        inner.phase = ReadPhase::Idle;

        if let Some(stream) = inner.stream.take() {
            if let Some(token) = inner.token.take() {
                self.ctx.reactor.deregister(token, &stream);
            }

            if let Err(err) = stream.shutdown(Shutdown::Both) {
                if err.kind() != io::ErrorKind::NotConnected {
                    logging::error!(self.log, "failed to shutdown socket"; "error" => %err);
                }
            }
        }
    }

    /// Shuts the raw socket without running the close protocol; used by the
    /// registry's bulk shutdown. The connection then observes the shutdown
    /// through its pending I/O and closes itself.
    pub(crate) fn shutdown_socket(&self) {
        let inner = self.inner.lock().expect("Connection state poisoned");
        if let Some(stream) = inner.stream.as_ref() {
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                if err.kind() != io::ErrorKind::NotConnected {
                    logging::error!(self.log, "failed to shutdown socket"; "error" => %err);
                }
            }
        }
    }

    fn arm_read_timer(self: &Arc<Self>, inner: &mut Inner) {
        if let Some(id) = inner.read_timer.take() {
            self.ctx.reactor.cancel(id);
        }
        inner.read_generation += 1;

        let generation = inner.read_generation;
        let weak = Arc::downgrade(self);
        let id = self.ctx.reactor.schedule(READ_TIMEOUT, move || {
            if let Some(connection) = weak.upgrade() {
                connection.handle_timeout(TimerKind::Read, generation);
            }
        });
        inner.read_timer = Some(id);
    }

    fn cancel_read_timer(&self, inner: &mut Inner) {
        if let Some(id) = inner.read_timer.take() {
            self.ctx.reactor.cancel(id);
        }
        inner.read_generation += 1;
    }

    fn arm_write_timer(self: &Arc<Self>, inner: &mut Inner) {
        if let Some(id) = inner.write_timer.take() {
            self.ctx.reactor.cancel(id);
        }
        inner.write_generation += 1;

        let generation = inner.write_generation;
        let weak = Arc::downgrade(self);
        let id = self.ctx.reactor.schedule(WRITE_TIMEOUT, move || {
            if let Some(connection) = weak.upgrade() {
                connection.handle_timeout(TimerKind::Write, generation);
            }
        });
        inner.write_timer = Some(id);
    }

    fn cancel_write_timer(&self, inner: &mut Inner) {
        if let Some(id) = inner.write_timer.take() {
            self.ctx.reactor.cancel(id);
        }
        inner.write_generation += 1;
    }

    /// A fired timer re-validates that it is still the armed one; a stale
    /// fire raced a completion and is ignored, like an aborted wait.
    fn handle_timeout(self: &Arc<Self>, kind: TimerKind, generation: u64) {
        let mut inner = self.inner.lock().expect("Connection state poisoned");

        let genuine = match kind {
            TimerKind::Read => inner.read_timer.is_some() && inner.read_generation == generation,
            TimerKind::Write => inner.write_timer.is_some() && inner.write_generation == generation,
        };
        if !genuine {
            return;
        }

        logging::debug!(self.log, "connection timeout"; "ip" => %self.display_ip());
        self.close_locked(&mut inner, true);
    }

    fn handle_read(self: &Arc<Self>) {
        let inner = self.inner.lock().expect("Connection state poisoned");

        if self.state() == ConnectionState::Closed || inner.stream.is_none() {
            return;
        }

        self.process_frames(inner);
    }

    /// Drains the socket into the inbound buffer. Returns whether any bytes
    /// arrived; end-of-stream is latched in `peer_closed`.
    fn fill_buffer(&self, inner: &mut Inner) -> io::Result<bool> {
        let inner_ref = &mut *inner;
        let stream = match inner_ref.stream.as_ref() {
            Some(stream) => stream,
            None => return Ok(false),
        };

        let ingress = inner_ref.buffer.ingress(stream)?;
        if ingress.closed {
            inner_ref.peer_closed = true;
        }

        Ok(ingress.received > 0)
    }

    fn handle_resume(self: &Arc<Self>) {
        let mut inner = self.inner.lock().expect("Connection state poisoned");

        if self.state() == ConnectionState::Closed {
            return;
        }

        if inner.processing {
            inner.resume_requested = true;
            return;
        }

        if inner.phase == ReadPhase::Paused {
            inner.phase = ReadPhase::Header;
            self.process_frames(inner);
        }
    }

    /// The read pipeline: assembles preamble bytes, headers and bodies from
    /// the inbound buffer, strictly in order. The `processing` latch keeps a
    /// single logical read outstanding even though hooks run unlocked.
    fn process_frames<'a>(self: &'a Arc<Self>, mut inner: MutexGuard<'a, Inner>) {
        if inner.processing {
            return;
        }
        inner.processing = true;

        loop {
            if self.state() == ConnectionState::Closed {
                break;
            }

            let wanted = match inner.phase.wanted() {
                Some(wanted) => wanted,
                None => break,
            };

            if inner.buffer.len() < wanted {
                // The readiness edge may have fired while the pipeline was
                // busy; pull whatever the socket already holds.
                match self.fill_buffer(&mut inner) {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(err) => {
                        match err.kind() {
                            io::ErrorKind::ConnectionReset => {
                                logging::debug!(self.log, "read error"; "error" => %err)
                            }
                            _ => logging::error!(self.log, "read error"; "error" => %err),
                        }
                        self.close_locked(&mut inner, true);
                        break;
                    }
                }

                if inner.peer_closed {
                    logging::debug!(self.log, "peer closed connection");
                    self.close_locked(&mut inner, true);
                } else if inner.read_timer.is_none() {
                    // A partial delivery does not extend the deadline; the
                    // timer covers the whole pending read.
                    self.arm_read_timer(&mut inner);
                }
                break;
            }

            // The pending read just completed.
            self.cancel_read_timer(&mut inner);

            match inner.phase {
                ReadPhase::PreambleFirst => {
                    let mut first = [0u8; HEADER_LENGTH];
                    first.copy_from_slice(&inner.buffer.read_slice()[..HEADER_LENGTH]);

                    let preamble = self.ctx.config.proxy_preamble();
                    match check_preamble(&first, preamble.as_bytes()) {
                        PreambleCheck::Header => {
                            // Not a preamble after all; reparse as a header.
                            self.set_state(ConnectionState::Open);
                            inner.phase = ReadPhase::Header;
                        }
                        PreambleCheck::Remainder(count) => {
                            inner.buffer.consume(HEADER_LENGTH);
                            self.set_state(ConnectionState::ReadingProxyRemainder);
                            inner.phase = ReadPhase::PreambleRemainder(count);
                        }
                        PreambleCheck::Done => {
                            inner.buffer.consume(HEADER_LENGTH);
                            self.set_state(ConnectionState::Open);
                            inner.phase = ReadPhase::Header;
                        }
                    }
                }
                ReadPhase::PreambleRemainder(count) => {
                    let preamble = self.ctx.config.proxy_preamble();
                    let matched = inner.buffer.read_slice()[..count]
                        .eq_ignore_ascii_case(&preamble.as_bytes()[HEADER_LENGTH..]);
                    inner.buffer.consume(count);

                    if !matched {
                        logging::error!(self.log, "invalid client login, server name mismatch");
                        self.close_locked(&mut inner, true);
                        break;
                    }

                    self.set_state(ConnectionState::Open);
                    inner.phase = ReadPhase::Header;
                }
                ReadPhase::Header => {
                    let body_len =
                        LittleEndian::read_u16(&inner.buffer.read_slice()[..HEADER_LENGTH]) as usize;
                    inner.buffer.consume(HEADER_LENGTH);

                    let limit = self.ctx.config.max_packets_per_second;
                    if inner.rate.tick(timestamp_secs(), limit) {
                        logging::warn!(self.log, "disconnected for exceeding the packet per second limit";
                                       "ip" => %self.display_ip());
                        self.close_locked(&mut inner, false);
                        break;
                    }

                    if body_len == 0 || body_len > MAX_BODY_LENGTH {
                        self.close_locked(&mut inner, true);
                        break;
                    }

                    inner.phase = ReadPhase::Body(body_len);
                }
                ReadPhase::Body(count) => {
                    let mut msg = std::mem::take(&mut inner.msg);
                    msg.reset_from(&inner.buffer.read_slice()[..count]);
                    inner.buffer.consume(count);
                    inner.phase = ReadPhase::Header;

                    let first = !inner.received_first;
                    inner.received_first = true;

                    // Protocol hooks run with the connection lock released so
                    // they can call back into send/resume_work.
                    drop(inner);
                    let paused = self.dispatch_frame(first, &mut msg);
                    inner = self.inner.lock().expect("Connection state poisoned");
                    inner.msg = msg;

                    if paused == Some(true) {
                        if inner.resume_requested {
                            inner.resume_requested = false;
                        } else {
                            inner.phase = ReadPhase::Paused;
                        }
                    }
                }
                ReadPhase::Paused | ReadPhase::Idle => break,
            }
        }

        inner.processing = false;
    }

    /// Hands one frame to the protocol. On the first frame of a multi-socket
    /// port this is where the checksum probe and factory dispatch happen.
    /// Returns None when the connection closed during dispatch, otherwise
    /// whether the protocol asked to pause the read loop.
    fn dispatch_frame(self: &Arc<Self>, first: bool, msg: &mut InputMessage) -> Option<bool> {
        if !first {
            let protocol = self.protocol.lock().expect("Protocol slot poisoned").clone();
            return match protocol {
                Some(protocol) => Some(protocol.on_receive_message(msg)),
                None => {
                    self.close(true);
                    None
                }
            };
        }

        let existing = self.protocol.lock().expect("Protocol slot poisoned").clone();
        match existing {
            None => {
                // Multi-socket port: probe the checksum, then pick a factory
                // by the identifier byte.
                let computed = {
                    let tail = msg.remaining_slice();
                    if tail.len() > CHECKSUM_LENGTH {
                        adler32(&tail[CHECKSUM_LENGTH..])
                    } else {
                        0
                    }
                };

                // A body shorter than the checksum cannot carry one; both
                // sums are then 0 and the frame passes as checksummed.
                let received = if msg.remaining() >= CHECKSUM_LENGTH {
                    msg.get_u32().unwrap_or(0)
                } else {
                    0
                };

                let checksum_ok = received == computed;
                if !checksum_ok {
                    // Not a checksum after all; the client speaks the
                    // checksum-less dialect. Step back.
                    if msg.skip_bytes(-(CHECKSUM_LENGTH as isize)).is_err() {
                        self.close(true);
                        return None;
                    }
                }

                let protocol = match self.service_port.make_protocol(checksum_ok, msg, self) {
                    Some(protocol) => protocol,
                    None => {
                        logging::debug!(self.log, "no service for the requested protocol");
                        self.close(true);
                        return None;
                    }
                };

                *self.protocol.lock().expect("Protocol slot poisoned") = Some(Arc::clone(&protocol));
                if self.state() == ConnectionState::Closed {
                    // Raced a close that saw no protocol; release ours.
                    self.schedule_release();
                    return None;
                }

                protocol.on_first_message(msg);
            }
            Some(protocol) => {
                // Single-socket port: four ambiguous bytes (sequence or
                // checksum), then the protocol identifier. A short body
                // simply has nothing to skip.
                let _ = msg.get_u32();
                let _ = msg.skip_bytes(1);
                protocol.on_first_message(msg);
            }
        }

        Some(false)
    }

    fn internal_worker(self: &Arc<Self>) {
        let inner = self.inner.lock().expect("Connection state poisoned");
        self.pump_writes(inner);
    }

    fn continue_write(self: &Arc<Self>) {
        let inner = self.inner.lock().expect("Connection state poisoned");
        if inner.current_write.is_some() {
            self.pump_writes(inner);
        }
    }

    /// Drives the write queue: pops the head, runs `on_send_message` with the
    /// lock released, then writes until the socket blocks. Messages complete
    /// strictly in submission order.
    fn pump_writes<'a>(self: &'a Arc<Self>, mut inner: MutexGuard<'a, Inner>) {
        loop {
            if inner.current_write.is_none() {
                let msg = match inner.queue.pop_front() {
                    Some(msg) => msg,
                    None => {
                        inner.writing = false;
                        if self.state() == ConnectionState::Closed {
                            self.close_socket(&mut inner);
                        }
                        return;
                    }
                };

                let protocol = self.protocol.lock().expect("Protocol slot poisoned").clone();

                drop(inner);
                let mut msg = msg;
                if let Some(protocol) = &protocol {
                    protocol.on_send_message(&mut msg);
                }
                inner = self.inner.lock().expect("Connection state poisoned");

                if inner.stream.is_none() {
                    inner.writing = false;
                    return;
                }

                self.arm_write_timer(&mut inner);
                inner.current_write = Some((msg, 0));
            }

            let mut failure: Option<io::Error> = None;
            let mut complete = false;
            {
                let inner_ref = &mut *inner;
                let mut stream = match inner_ref.stream.as_ref() {
                    Some(stream) => stream,
                    None => {
                        inner_ref.writing = false;
                        inner_ref.current_write = None;
                        return;
                    }
                };
                let (msg, written) = inner_ref
                    .current_write
                    .as_mut()
                    .expect("In-flight write must exist");

                loop {
                    let output = msg.output();
                    if *written >= output.len() {
                        complete = true;
                        break;
                    }
                    match stream.write(&output[*written..]) {
                        Ok(0) => {
                            failure = Some(io::ErrorKind::WriteZero.into());
                            break;
                        }
                        Ok(count) => *written += count,
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
            }

            if let Some(err) = failure {
                logging::error!(self.log, "write error"; "error" => %err);
                self.cancel_write_timer(&mut inner);
                inner.current_write = None;
                inner.queue.clear();
                inner.writing = false;
                self.close_locked(&mut inner, true);
                return;
            }

            if !complete {
                // Socket is full; the writable event resumes the flush.
                return;
            }

            self.cancel_write_timer(&mut inner);
            inner.current_write = None;
        }
    }
}

impl EventHandler for Connection {
    fn ready(self: Arc<Self>, readiness: Ready) {
        if readiness.is_writable() {
            self.continue_write();
        }
        if readiness.is_readable() {
            self.handle_read();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut() {
            if let Some(stream) = inner.stream.take() {
                if let Some(token) = inner.token.take() {
                    self.ctx.reactor.deregister(token, &stream);
                }
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

/// Tracks live connections; supports bulk shutdown.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicUsize,
    log: Logger,
}

impl ConnectionRegistry {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Arc<ConnectionRegistry> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "registry")),
            _ => logging::discard(),
        };

        Arc::new(ConnectionRegistry {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            log,
        })
    }

    /// Builds a connection around an accepted socket and tracks it.
    pub fn create_connection(
        &self,
        stream: TcpStream,
        ctx: &Arc<NetContext>,
        service_port: &Arc<ServicePort>,
    ) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, stream, ctx, service_port);

        let mut connections = self.connections.lock().expect("Registry poisoned");
        connections.insert(id, Arc::clone(&connection));
        logging::debug!(self.log, "connection created"; "live" => connections.len());

        connection
    }

    /// Stops tracking a connection. Idempotent; closing connections race
    /// bulk shutdown here.
    pub fn release(&self, id: ConnectionId) {
        self.connections.lock().expect("Registry poisoned").remove(&id);
    }

    pub fn len(&self) -> usize {
        self.connections.lock().expect("Registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shuts every live socket both ways and clears the registry. Each
    /// connection observes the shutdown through its pending I/O and runs its
    /// own close.
    pub fn close_all(&self) {
        let live: Vec<Arc<Connection>> = {
            let connections = self.connections.lock().expect("Registry poisoned");
            connections.values().cloned().collect()
        };

        logging::debug!(self.log, "closing all connections"; "live" => live.len());
        for connection in &live {
            connection.shutdown_socket();
        }

        let drained: Vec<Arc<Connection>> = {
            let mut connections = self.connections.lock().expect("Registry poisoned");
            connections.drain().map(|(_, connection)| connection).collect()
        };
        drop(drained);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_window_allows_up_to_limit() {
        let mut rate = RateWindow::new(1000);

        for _ in 0..10 {
            assert!(!rate.tick(1000, 10));
        }
        // The eleventh packet in the same second goes over.
        assert!(rate.tick(1000, 10));
    }

    #[test]
    fn test_rate_window_resets_after_two_seconds() {
        let mut rate = RateWindow::new(1000);

        for _ in 0..10 {
            assert!(!rate.tick(1000, 10));
        }

        // Three seconds later the window restarts and the budget is fresh.
        assert!(!rate.tick(1003, 10));
        for _ in 0..20 {
            assert!(!rate.tick(1004, 10));
        }
    }

    #[test]
    fn test_rate_window_spread_over_time() {
        let mut rate = RateWindow::new(1000);

        // 15 packets in the first second trips a limit of 10 ...
        for i in 0..11 {
            let exceeded = rate.tick(1000, 10);
            assert_eq!(exceeded, i == 10, "packet {}", i);
        }

        // ... but 15 packets over two seconds does not.
        let mut slow = RateWindow::new(2000);
        for _ in 0..8 {
            assert!(!slow.tick(2000, 10));
        }
        for _ in 0..7 {
            assert!(!slow.tick(2001, 10));
        }
    }

    #[test]
    fn test_preamble_nul_second_byte_is_header() {
        assert_eq!(check_preamble(&[0x05, 0x00], b"OT\n"), PreambleCheck::Header);
    }

    #[test]
    fn test_preamble_mismatch_is_header() {
        assert_eq!(check_preamble(&[b'X', b'Y'], b"OT\n"), PreambleCheck::Header);
    }

    #[test]
    fn test_preamble_match_case_insensitive() {
        assert_eq!(check_preamble(&[b'o', b't'], b"OT\n"), PreambleCheck::Remainder(1));
        assert_eq!(check_preamble(&[b'O', b'T'], b"ot\n"), PreambleCheck::Remainder(1));
    }

    #[test]
    fn test_preamble_two_byte_name_completes() {
        // A one-character server name plus the newline is exactly two bytes.
        assert_eq!(check_preamble(&[b'Q', b'\n'], b"Q\n"), PreambleCheck::Done);
    }

    #[test]
    fn test_preamble_short_name_is_header() {
        assert_eq!(check_preamble(&[b'A', b'B'], b"\n"), PreambleCheck::Header);
    }

    #[test]
    fn test_connection_state_round_trip() {
        for state in [
            ConnectionState::Identifying,
            ConnectionState::ReadingProxyRemainder,
            ConnectionState::Open,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_read_phase_wanted() {
        assert_eq!(ReadPhase::PreambleFirst.wanted(), Some(HEADER_LENGTH));
        assert_eq!(ReadPhase::PreambleRemainder(5).wanted(), Some(5));
        assert_eq!(ReadPhase::Header.wanted(), Some(2));
        assert_eq!(ReadPhase::Body(100).wanted(), Some(100));
        assert_eq!(ReadPhase::Paused.wanted(), None);
        assert_eq!(ReadPhase::Idle.wanted(), None);
    }
}
