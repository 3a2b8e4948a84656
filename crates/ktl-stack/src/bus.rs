use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::runtime::Clock;
use crate::types::{NodeId, RunEvent};

/// Read-only consumer of the run event stream.
///
/// Observers are dispatched serially, in registration order, off the
/// publishing path. They must not reach back into the scheduler.
pub trait Observer: Send {
    fn observe_run_event(&mut self, event: &RunEvent);
}

/// Totally-ordered event stream for one run.
///
/// Publishing stamps a monotonically increasing `seq` and appends the
/// event to the durable JSONL log *before* any observer sees it. A bounded
/// in-memory queue decouples observers from publishers: when a slow
/// observer lets the queue fill up, the oldest queued event is dropped and
/// counted, never blocking the run.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    state: Mutex<BusState>,
    cond: Condvar,
    clock: Arc<dyn Clock>,
}

struct BusState {
    next_seq: u64,
    writer: Option<Box<dyn Write + Send>>,
    write_error: Option<String>,
    queue: VecDeque<RunEvent>,
    capacity: usize,
    dropped: u64,
    closed: bool,
}

/// Owns the dispatch thread; joined once at the end of a run.
pub struct BusDispatcher {
    handle: JoinHandle<()>,
    bus: EventBus,
}

/// Default bound on the observer queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

impl EventBus {
    /// Build a bus writing the durable log to `writer` and fanning out to
    /// `observers` on a dedicated dispatch thread.
    ///
    /// `seq_base` is the last sequence number already present in the
    /// durable log (0 for a fresh run), so a resumed run keeps the log
    /// totally ordered instead of restarting at 1.
    pub fn start(
        writer: Option<Box<dyn Write + Send>>,
        observers: Vec<Box<dyn Observer>>,
        capacity: usize,
        clock: Arc<dyn Clock>,
        seq_base: u64,
    ) -> (EventBus, BusDispatcher) {
        let bus = EventBus {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState {
                    next_seq: seq_base,
                    writer,
                    write_error: None,
                    queue: VecDeque::new(),
                    capacity: capacity.max(1),
                    dropped: 0,
                    closed: false,
                }),
                cond: Condvar::new(),
                clock,
            }),
        };

        let dispatch_bus = bus.clone();
        let handle = std::thread::spawn(move || dispatch_loop(dispatch_bus, observers));

        let dispatcher = BusDispatcher {
            handle,
            bus: bus.clone(),
        };
        (bus, dispatcher)
    }

    /// Stamp, persist, and enqueue an event. Returns the stamped event so
    /// callers can observe the assigned `seq`.
    pub fn publish(&self, mut event: RunEvent) -> RunEvent {
        let mut state = self.inner.state.lock().expect("bus state poisoned");

        state.next_seq += 1;
        event.seq = state.next_seq;
        event.ts = self.inner.clock.now();

        if let Some(writer) = state.writer.as_mut() {
            let line = serde_json::to_string(&event).expect("run event serializes");
            let result = writer
                .write_all(line.as_bytes())
                .and_then(|_| writer.write_all(b"\n"))
                .and_then(|_| writer.flush());
            if let Err(err) = result {
                if state.write_error.is_none() {
                    state.write_error = Some(err.to_string());
                }
            }
        }

        if state.queue.len() >= state.capacity {
            state.queue.pop_front();
            state.dropped += 1;
        }
        state.queue.push_back(event.clone());
        drop(state);
        self.inner.cond.notify_one();

        event
    }

    /// First durable-log write failure, if any. The scheduler treats this
    /// as unrecoverable run-store I/O and aborts.
    pub fn take_write_error(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .expect("bus state poisoned")
            .write_error
            .take()
    }

    /// Events dropped because the observer queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.state.lock().expect("bus state poisoned").dropped
    }

    fn close(&self) {
        let mut state = self.inner.state.lock().expect("bus state poisoned");
        state.closed = true;
        drop(state);
        self.inner.cond.notify_all();
    }
}

impl BusDispatcher {
    /// Drain remaining events and stop the dispatch thread.
    pub fn finish(self) {
        self.bus.close();
        let _ = self.handle.join();
    }
}

fn dispatch_loop(bus: EventBus, mut observers: Vec<Box<dyn Observer>>) {
    loop {
        let event = {
            let mut state = bus.inner.state.lock().expect("bus state poisoned");
            loop {
                if let Some(event) = state.queue.pop_front() {
                    break Some(event);
                }
                if state.closed {
                    break None;
                }
                state = bus
                    .inner
                    .cond
                    .wait(state)
                    .expect("bus state poisoned");
            }
        };

        match event {
            Some(event) => {
                for observer in observers.iter_mut() {
                    observer.observe_run_event(&event);
                }
            }
            None => return,
        }
    }
}

/// Convenience wrapper that scopes published events to one node attempt.
#[derive(Clone)]
pub struct NodeSink {
    bus: EventBus,
    run_id: String,
    node_id: NodeId,
    attempt: u32,
}

impl NodeSink {
    pub fn new(bus: EventBus, run_id: String, node_id: NodeId, attempt: u32) -> Self {
        Self {
            bus,
            run_id,
            node_id,
            attempt,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Publish with run id, node id, and attempt filled in.
    pub fn publish(&self, mut event: RunEvent) -> RunEvent {
        event.run_id = Some(self.run_id.clone());
        event.node_id = Some(self.node_id.clone());
        event.attempt = Some(self.attempt);
        self.bus.publish(event)
    }
}
