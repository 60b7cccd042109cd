//! The game-side dispatcher: a single thread draining a deadline-ordered
//! event queue. The networking core defers exactly two hooks onto it,
//! `Protocol::on_connect` and `Protocol::release`, so protocol handlers never
//! need to be re-entrant with respect to I/O threads.

use flint::logging::{self, Logger};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send>;

struct Event {
    deadline: Instant,
    sequence: u64,
    task: Task,
}

impl Eq for Event {}

impl PartialEq for Event {
    fn eq(&self, other: &Event) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Event) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline is on
        // top, with submission order breaking ties.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Event) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Queue {
    events: BinaryHeap<Event>,
    next_sequence: u64,
    running: bool,
}

pub struct Dispatcher {
    queue: Arc<(Mutex<Queue>, Condvar)>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    log: Logger,
}

impl Dispatcher {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Arc<Dispatcher> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("thread" => "dispatcher")),
            _ => logging::discard(),
        };

        let queue = Arc::new((
            Mutex::new(Queue {
                events: BinaryHeap::new(),
                next_sequence: 0,
                running: true,
            }),
            Condvar::new(),
        ));

        let worker_queue = Arc::clone(&queue);
        let thread = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || Self::run(worker_queue))
            .expect("Error spawning dispatcher thread");

        Arc::new(Dispatcher {
            queue,
            thread: Mutex::new(Some(thread)),
            log,
        })
    }

    /// Enqueues `task` to run on the dispatcher thread after `delay`.
    pub fn add_event<F: FnOnce() + Send + 'static>(&self, task: F, delay: Duration) {
        let (lock, condvar) = &*self.queue;
        let mut queue = lock.lock().expect("Dispatcher queue poisoned");

        if !queue.running {
            logging::debug!(self.log, "event dropped, dispatcher stopped");
            return;
        }

        let sequence = queue.next_sequence;
        queue.next_sequence += 1;
        queue.events.push(Event {
            deadline: Instant::now() + delay,
            sequence,
            task: Box::new(task),
        });
        condvar.notify_one();
    }

    /// Stops the dispatcher thread. Events not yet due are discarded.
    pub fn stop(&self) {
        let (lock, condvar) = &*self.queue;
        {
            let mut queue = lock.lock().expect("Dispatcher queue poisoned");
            if !queue.running {
                return;
            }
            queue.running = false;
            queue.events.clear();
        }
        condvar.notify_all();

        if let Some(handle) = self.thread.lock().expect("Dispatcher handle poisoned").take() {
            if handle.join().is_err() {
                logging::error!(self.log, "dispatcher thread panicked");
            }
        }
    }

    fn run(queue: Arc<(Mutex<Queue>, Condvar)>) {
        let (lock, condvar) = &*queue;
        let mut guard = lock.lock().expect("Dispatcher queue poisoned");

        loop {
            if !guard.running {
                return;
            }

            let now = Instant::now();
            match guard.events.peek() {
                Some(event) if event.deadline <= now => {
                    let event = guard.events.pop().expect("Peeked event must pop");
                    drop(guard);
                    (event.task)();
                    guard = lock.lock().expect("Dispatcher queue poisoned");
                }
                Some(event) => {
                    let wait = event.deadline - now;
                    guard = condvar
                        .wait_timeout(guard, wait)
                        .expect("Dispatcher queue poisoned")
                        .0;
                }
                None => {
                    guard = condvar.wait(guard).expect("Dispatcher queue poisoned");
                }
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::mpsc;

    #[test]
    fn test_immediate_events_run_in_order() {
        let dispatcher = Dispatcher::new(None);
        let (tx, rx) = mpsc::channel();

        for i in 0..4 {
            let tx = tx.clone();
            dispatcher.add_event(move || tx.send(i).unwrap(), Duration::from_millis(0));
        }

        let received: Vec<i32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, vec![0, 1, 2, 3]);

        dispatcher.stop();
    }

    #[test]
    fn test_delayed_event_waits() {
        let dispatcher = Dispatcher::new(None);
        let (tx, rx) = mpsc::channel();

        let started = Instant::now();
        dispatcher.add_event(move || tx.send(()).unwrap(), Duration::from_millis(50));

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));

        dispatcher.stop();
    }

    #[test]
    fn test_stop_discards_pending() {
        let dispatcher = Dispatcher::new(None);
        let fired = Arc::new(AtomicUsize::new(0));

        let marker = Arc::clone(&fired);
        dispatcher.add_event(
            move || {
                marker.fetch_add(1, AtomicOrdering::SeqCst);
            },
            Duration::from_secs(60),
        );

        dispatcher.stop();
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);

        // Events after stop are dropped silently.
        dispatcher.add_event(|| {}, Duration::from_millis(0));
    }
}
