use flint::logging::{self, Logger};
use hashbrown::HashMap;
use mio::event::Evented;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

pub type TimerId = u64;

type Task = Box<dyn FnOnce() + Send>;

/// Token 0 belongs to the internal waker; I/O handles start above it.
const WAKER_TOKEN: Token = Token(0);
const FIRST_TOKEN: usize = 1;

const EVENT_CAPACITY: usize = 8192;

/// An object owning a registered I/O handle. Readiness is delivered on a
/// worker thread; the reactor holds the handler weakly, so a stale event for
/// a dropped handler is discarded silently.
pub trait EventHandler: Send + Sync {
    fn ready(self: Arc<Self>, readiness: Ready);
}

struct Timers {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    // A timer is armed while its callback is present; cancelling removes the
    // callback and leaves the heap entry to be skipped lazily.
    callbacks: HashMap<TimerId, Task>,
}

/// The shared event engine: one poll thread owning the `mio::Poll`, N worker
/// threads running completions, a timer queue swept by the poll thread and a
/// task queue for deferred work.
pub struct Reactor {
    poll: Poll,
    handlers: Mutex<HashMap<usize, Weak<dyn EventHandler>>>,
    next_token: AtomicUsize,

    timers: Mutex<Timers>,
    next_timer: AtomicU64,

    tasks: Mutex<VecDeque<Task>>,
    task_available: Condvar,

    running: AtomicBool,
    waker: SetReadiness,
    _waker_registration: Registration,

    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    log: Logger,
}

impl Reactor {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> io::Result<Arc<Reactor>> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "reactor")),
            _ => logging::discard(),
        };

        let poll = Poll::new()?;
        let (registration, waker) = Registration::new2();
        poll.register(&registration, WAKER_TOKEN, Ready::readable(), PollOpt::edge())?;

        Ok(Arc::new(Reactor {
            poll,
            handlers: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(FIRST_TOKEN),
            timers: Mutex::new(Timers {
                heap: BinaryHeap::new(),
                callbacks: HashMap::new(),
            }),
            next_timer: AtomicU64::new(1),
            tasks: Mutex::new(VecDeque::new()),
            task_available: Condvar::new(),
            running: AtomicBool::new(true),
            waker,
            _waker_registration: registration,
            threads: Mutex::new(Vec::new()),
            log,
        }))
    }

    /// Spawns the poll thread and `workers` completion threads. Invoked once
    /// by the service manager.
    pub fn start(self: &Arc<Self>, workers: usize) {
        let mut threads = self.threads.lock().expect("Reactor thread list poisoned");
        if !threads.is_empty() {
            logging::debug!(self.log, "reactor already started");
            return;
        }

        logging::info!(self.log, "starting reactor"; "workers" => workers);

        let reactor = Arc::clone(self);
        threads.push(
            thread::Builder::new()
                .name("reactor-poll".to_string())
                .spawn(move || reactor.poll_loop())
                .expect("Error spawning reactor poll thread"),
        );

        for index in 0..workers.max(1) {
            let reactor = Arc::clone(self);
            threads.push(
                thread::Builder::new()
                    .name(format!("reactor-worker-{}", index))
                    .spawn(move || reactor.worker_loop())
                    .expect("Error spawning reactor worker thread"),
            );
        }
    }

    /// Drops the work flag and wakes every thread. Safe to call from a
    /// reactor thread; the actual reaping happens in [`Reactor::join`].
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            logging::debug!(self.log, "reactor shutting down");
        }
        let _ = self.waker.set_readiness(Ready::readable());
        self.task_available.notify_all();
    }

    /// Joins all reactor threads. Must not be called from a reactor thread.
    pub fn join(&self) {
        let handles: Vec<_> = {
            let mut threads = self.threads.lock().expect("Reactor thread list poisoned");
            threads.drain(..).collect()
        };

        for handle in handles {
            if handle.join().is_err() {
                logging::error!(self.log, "reactor thread panicked");
            }
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Registers an I/O handle and its handler; readiness for `handle` will
    /// be delivered to `handler.ready()` on a worker thread.
    pub fn register<H: EventHandler + 'static>(
        &self,
        handle: &dyn Evented,
        interest: Ready,
        handler: &Arc<H>,
    ) -> io::Result<Token> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));

        self.handlers
            .lock()
            .expect("Reactor handler map poisoned")
            .insert(token.0, Arc::downgrade(handler) as Weak<dyn EventHandler>);

        if let Err(err) = self.poll.register(handle, token, interest, PollOpt::edge()) {
            self.handlers
                .lock()
                .expect("Reactor handler map poisoned")
                .remove(&token.0);
            return Err(err);
        }

        Ok(token)
    }

    /// Removes a handle from the poll. Pending events for the token become
    /// stale and are dropped when they surface.
    pub fn deregister(&self, token: Token, handle: &dyn Evented) {
        self.handlers
            .lock()
            .expect("Reactor handler map poisoned")
            .remove(&token.0);

        // The handle may already be gone from the poll when the peer raced a
        // close; nothing to do about it either way.
        let _ = self.poll.deregister(handle);
    }

    /// Defers a task onto the worker pool.
    pub fn post<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.post_boxed(Box::new(task));
    }

    fn post_boxed(&self, task: Task) {
        let mut tasks = self.tasks.lock().expect("Reactor task queue poisoned");
        tasks.push_back(task);
        drop(tasks);
        self.task_available.notify_one();
    }

    /// Arms a one-shot timer. The callback runs on a worker thread unless the
    /// timer is cancelled first; a cancelled timer never runs.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, delay: Duration, callback: F) -> TimerId {
        let id = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;

        {
            let mut timers = self.timers.lock().expect("Reactor timer queue poisoned");
            timers.heap.push(Reverse((deadline, id)));
            timers.callbacks.insert(id, Box::new(callback));
        }

        // Nudge the poll thread so it recomputes its timeout.
        let _ = self.waker.set_readiness(Ready::readable());
        id
    }

    /// Disarms a timer. A no-op when the timer already fired.
    pub fn cancel(&self, id: TimerId) {
        self.timers
            .lock()
            .expect("Reactor timer queue poisoned")
            .callbacks
            .remove(&id);
    }

    fn poll_loop(self: Arc<Self>) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        while self.running.load(Ordering::Acquire) {
            let timeout = self.next_timer_timeout();

            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                logging::error!(self.log, "poll failed"; "error" => %err);
                break;
            }

            for event in &events {
                let token = event.token();
                if token == WAKER_TOKEN {
                    let _ = self.waker.set_readiness(Ready::empty());
                    continue;
                }

                let handler = self
                    .handlers
                    .lock()
                    .expect("Reactor handler map poisoned")
                    .get(&token.0)
                    .cloned();

                if let Some(weak) = handler {
                    let readiness = event.readiness();
                    self.post_boxed(Box::new(move || {
                        if let Some(handler) = weak.upgrade() {
                            handler.ready(readiness);
                        }
                    }));
                }
            }

            self.fire_expired_timers();
        }
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let task = {
                let mut tasks = self.tasks.lock().expect("Reactor task queue poisoned");
                loop {
                    if let Some(task) = tasks.pop_front() {
                        break Some(task);
                    }
                    if !self.running.load(Ordering::Acquire) {
                        break None;
                    }
                    tasks = self
                        .task_available
                        .wait(tasks)
                        .expect("Reactor task queue poisoned");
                }
            };

            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }

    fn fire_expired_timers(&self) {
        let now = Instant::now();

        loop {
            let callback = {
                let mut timers = self.timers.lock().expect("Reactor timer queue poisoned");
                match timers.heap.peek() {
                    Some(&Reverse((deadline, id))) if deadline <= now => {
                        timers.heap.pop();
                        timers.callbacks.remove(&id)
                    }
                    _ => return,
                }
            };

            if let Some(callback) = callback {
                self.post_boxed(callback);
            }
        }
    }

    fn next_timer_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut timers = self.timers.lock().expect("Reactor timer queue poisoned");

        while let Some(&Reverse((deadline, id))) = timers.heap.peek() {
            if !timers.callbacks.contains_key(&id) {
                // Cancelled; discard lazily.
                timers.heap.pop();
                continue;
            }
            return Some(deadline.saturating_duration_since(now));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn running_reactor() -> Arc<Reactor> {
        let reactor = Reactor::new(None).unwrap();
        reactor.start(2);
        reactor
    }

    #[test]
    fn test_post_runs_on_worker() {
        let reactor = running_reactor();
        let (tx, rx) = mpsc::channel();

        reactor.post(move || tx.send(thread::current().name().map(String::from)).unwrap());

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(name.unwrap().starts_with("reactor-worker"));

        reactor.shutdown();
        reactor.join();
    }

    #[test]
    fn test_timer_fires() {
        let reactor = running_reactor();
        let (tx, rx) = mpsc::channel();

        let armed = Instant::now();
        reactor.schedule(Duration::from_millis(30), move || tx.send(()).unwrap());

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(armed.elapsed() >= Duration::from_millis(30));

        reactor.shutdown();
        reactor.join();
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let reactor = running_reactor();
        let (tx, rx) = mpsc::channel::<()>();

        let id = reactor.schedule(Duration::from_millis(50), move || tx.send(()).unwrap());
        reactor.cancel(id);

        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        reactor.shutdown();
        reactor.join();
    }

    #[test]
    fn test_shutdown_drains_queued_tasks() {
        let reactor = running_reactor();
        let (tx, rx) = mpsc::channel();

        for i in 0..16 {
            let tx = tx.clone();
            reactor.post(move || tx.send(i).unwrap());
        }

        reactor.shutdown();
        reactor.join();

        let mut seen: Vec<i32> = rx.try_iter().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }
}
