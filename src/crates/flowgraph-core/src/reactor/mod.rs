//! Single-threaded I/O reactor with an embedded timer heap and task queue.
//!
//! The thread that calls [`Reactor::new`] becomes the owner: only it runs
//! callbacks and mutates the active-event set directly. Every other thread
//! talks to the reactor through a mutex-guarded operation queue paired with
//! an eventfd notifier that interrupts a blocking poll. Operations issued on
//! the owner thread apply immediately; queued operations from other threads
//! apply in FIFO order once per loop turn.
//!
//! Event identifiers are monotone and never reused, which makes removal
//! idempotent by construction: removing an id that already left the table
//! is a no-op.

mod demux;

use crate::device::{Device, Notifier};
use crate::error::{CoreError, Result};
use crate::promise::{Completer, Promise};
use demux::{Demux, Ready};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Verdict returned by event and stream callbacks.
///
/// The reactor honors `Default` and `Remove`. `Close` exists for stream
/// callbacks, where it tears down only the direction the callback was
/// invoked for (draining buffered output first); at the reactor layer it is
/// equivalent to `Remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Signal {
    #[default]
    Default,
    Remove,
    Close,
}

/// Identifier of one event registration. Never reused within a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

const NOTIFIER_ID: EventId = EventId(0);

/// Longest interval the demultiplexer may block without waking.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Callback attached to an event registration.
pub type EventCallback = Box<dyn FnMut(&Reactor, EventId) -> Signal + Send>;

enum RegKind {
    Read(Arc<Device>),
    Write(Arc<Device>),
    Periodic(Duration),
}

struct Registration {
    kind: RegKind,
    // Taken out of the table while its callback runs, so the callback may
    // freely call back into the reactor.
    callback: Option<EventCallback>,
    frozen: bool,
}

enum Op {
    Insert(EventId, RegKind, EventCallback, bool, Completer<Result<EventId>>),
    Remove(EventId, Completer<()>),
    Freeze(EventId),
    Thaw(EventId),
    Task(Box<dyn FnOnce(&Reactor) + Send>),
}

struct Owner {
    demux: Demux,
    table: HashMap<EventId, Registration>,
    timers: BinaryHeap<Reverse<(Instant, EventId)>>,
    // Unfrozen user registrations; the loop exits when this reaches zero
    // with nothing queued. Frozen events do not hold the loop open: nothing
    // left inside the reactor could ever thaw them.
    active: usize,
}

struct Shared {
    owner: ThreadId,
    queue: Mutex<VecDeque<Op>>,
    notifier: Notifier,
    shutdown: AtomicBool,
    next_id: AtomicU64,
}

/// Single-threaded event loop. See the module docs for the threading model.
pub struct Reactor {
    shared: Shared,
    state: Mutex<Owner>,
}

impl Reactor {
    /// Build a reactor owned by the calling thread.
    pub fn new() -> Result<Arc<Reactor>> {
        let notifier = Notifier::new()?;
        let mut demux = Demux::new()?;
        demux.insert(notifier.device().fd(), NOTIFIER_ID, Ready::Read, false)?;

        Ok(Arc::new(Reactor {
            shared: Shared {
                owner: std::thread::current().id(),
                queue: Mutex::new(VecDeque::new()),
                notifier,
                shutdown: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            },
            state: Mutex::new(Owner {
                demux,
                table: HashMap::new(),
                timers: BinaryHeap::new(),
                active: 0,
            }),
        }))
    }

    /// Whether the calling thread constructed this reactor.
    pub fn is_owner(&self) -> bool {
        std::thread::current().id() == self.shared.owner
    }

    /// Wake the loop out of a blocking poll.
    pub fn notify(&self) {
        self.shared.notifier.notify();
    }

    /// Ask the loop to exit once pending operations drain.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.notify();
    }

    /// Number of user event registrations. Test and introspection aid.
    pub fn num_events(&self) -> usize {
        self.state.lock().table.len()
    }

    fn allocate_id(&self) -> EventId {
        EventId(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a read event on `device`.
    pub fn insert_read(
        &self,
        device: Arc<Device>,
        callback: impl FnMut(&Reactor, EventId) -> Signal + Send + 'static,
    ) -> Promise<Result<EventId>> {
        self.submit_insert(RegKind::Read(device), Box::new(callback), false)
    }

    /// Register a write event on `device`.
    ///
    /// Write events start frozen: interest is armed on demand through
    /// [`thaw`](Reactor::thaw) when there are bytes to deliver.
    pub fn insert_write(
        &self,
        device: Arc<Device>,
        callback: impl FnMut(&Reactor, EventId) -> Signal + Send + 'static,
    ) -> Promise<Result<EventId>> {
        self.submit_insert(RegKind::Write(device), Box::new(callback), true)
    }

    /// Register a periodic event first firing one `period` from now.
    ///
    /// A zero period fires on every loop tick. Fire times are monotone
    /// non-decreasing; each next deadline is the previous fire time plus the
    /// period, with no drift correction.
    pub fn insert_periodic(
        &self,
        period: Duration,
        callback: impl FnMut(&Reactor, EventId) -> Signal + Send + 'static,
    ) -> Promise<Result<EventId>> {
        self.submit_insert(RegKind::Periodic(period), Box::new(callback), false)
    }

    fn submit_insert(
        &self,
        kind: RegKind,
        callback: EventCallback,
        frozen: bool,
    ) -> Promise<Result<EventId>> {
        let id = self.allocate_id();
        let (completer, promise) = Promise::pair();
        if self.is_owner() {
            let mut state = self.state.lock();
            completer.complete(apply_insert(&mut state, id, kind, callback, frozen));
        } else {
            self.shared
                .queue
                .lock()
                .push_back(Op::Insert(id, kind, callback, frozen, completer));
            self.notify();
        }
        promise
    }

    /// Deregister an event. Idempotent; resolves once the event is gone.
    pub fn remove(&self, id: EventId) -> Promise<()> {
        let (completer, promise) = Promise::pair();
        if self.is_owner() {
            let mut state = self.state.lock();
            apply_remove(&mut state, id);
            completer.complete(());
        } else {
            self.shared.queue.lock().push_back(Op::Remove(id, completer));
            self.notify();
        }
        promise
    }

    /// Temporarily disable I/O interest for a read/write event.
    pub fn freeze(&self, id: EventId) {
        if self.is_owner() {
            apply_set_frozen(&mut self.state.lock(), id, true);
        } else {
            self.shared.queue.lock().push_back(Op::Freeze(id));
            self.notify();
        }
    }

    /// Re-enable I/O interest for a frozen read/write event.
    pub fn thaw(&self, id: EventId) {
        if self.is_owner() {
            apply_set_frozen(&mut self.state.lock(), id, false);
        } else {
            self.shared.queue.lock().push_back(Op::Thaw(id));
            self.notify();
        }
    }

    /// Run a closure on the reactor thread, resolving with its result.
    ///
    /// Closures posted from one thread run in FIFO order, and always before
    /// any removal the same thread issues afterwards.
    pub fn dispatch<R, F>(&self, f: F) -> Promise<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (completer, promise) = Promise::pair();
        self.dispatch_with(move |_| completer.complete(f()));
        promise
    }

    /// Crate-internal dispatch variant handing the closure the reactor.
    pub(crate) fn dispatch_with(&self, f: impl FnOnce(&Reactor) + Send + 'static) {
        self.shared.queue.lock().push_back(Op::Task(Box::new(f)));
        self.notify();
    }

    // ---- loop ----------------------------------------------------------

    /// Run the loop until shutdown or quiescence.
    ///
    /// Quiescence means no unfrozen events remain and nothing is queued; an
    /// executor over an empty graph therefore returns immediately.
    pub fn run(&self) -> Result<()> {
        if !self.is_owner() {
            return Err(CoreError::NotOwner);
        }

        let mut ready: Vec<(EventId, Ready)> = Vec::new();
        loop {
            self.drain_queue();

            if self.shared.shutdown.load(Ordering::SeqCst) {
                break;
            }
            {
                let state = self.state.lock();
                if state.active == 0 && self.shared.queue.lock().is_empty() {
                    break;
                }
            }

            let timeout = self.next_deadline();
            {
                let mut state = self.state.lock();
                state.demux.poll(Some(timeout), &mut ready)?;
            }

            for (id, _) in ready.drain(..) {
                if id == NOTIFIER_ID {
                    self.shared.notifier.drain();
                } else {
                    self.fire_io(id);
                }
            }

            self.fire_due_timers();
        }
        Ok(())
    }

    /// Earliest pending timer, capped at the maximum poll interval.
    fn next_deadline(&self) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        while let Some(Reverse((when, id))) = state.timers.peek().copied() {
            if state.table.contains_key(&id) {
                let wait = when.saturating_duration_since(now);
                return wait.min(MAX_POLL_INTERVAL);
            }
            // Stale entry left behind by a removal.
            state.timers.pop();
        }
        MAX_POLL_INTERVAL
    }

    fn fire_io(&self, id: EventId) {
        let callback = {
            let mut state = self.state.lock();
            match state.table.get_mut(&id) {
                Some(reg) => reg.callback.take(),
                None => return,
            }
        };
        let Some(mut callback) = callback else {
            return;
        };
        let signal = callback(self, id);

        let mut state = self.state.lock();
        let still_registered = match state.table.get_mut(&id) {
            Some(reg) => {
                reg.callback = Some(callback);
                true
            }
            None => false,
        };
        if still_registered && matches!(signal, Signal::Remove | Signal::Close) {
            apply_remove(&mut state, id);
        }
    }

    fn fire_due_timers(&self) {
        // Snapshot what is due now; entries rescheduled by the callbacks
        // wait for the next loop turn, so a zero-period event fires once
        // per tick instead of starving the poll.
        let cutoff = Instant::now();
        let mut due = Vec::new();
        {
            let mut state = self.state.lock();
            while let Some(Reverse((when, id))) = state.timers.peek().copied() {
                if when > cutoff {
                    break;
                }
                state.timers.pop();
                if state.table.contains_key(&id) {
                    due.push(id);
                }
            }
        }
        for id in due {
            self.fire_periodic(id, Instant::now());
        }
    }

    fn fire_periodic(&self, id: EventId, fired_at: Instant) {
        let (callback, period) = {
            let mut state = self.state.lock();
            match state.table.get_mut(&id) {
                Some(reg) => {
                    let period = match reg.kind {
                        RegKind::Periodic(p) => p,
                        _ => return,
                    };
                    (reg.callback.take(), period)
                }
                None => return,
            }
        };
        let Some(mut callback) = callback else {
            return;
        };
        let signal = callback(self, id);

        let mut state = self.state.lock();
        let still_registered = match state.table.get_mut(&id) {
            Some(reg) => {
                reg.callback = Some(callback);
                true
            }
            None => false,
        };
        if still_registered {
            if matches!(signal, Signal::Remove | Signal::Close) {
                apply_remove(&mut state, id);
            } else {
                state.timers.push(Reverse((fired_at + period, id)));
            }
        }
    }

    fn drain_queue(&self) {
        loop {
            let op = self.shared.queue.lock().pop_front();
            let Some(op) = op else { break };
            match op {
                Op::Insert(id, kind, callback, frozen, completer) => {
                    let mut state = self.state.lock();
                    completer.complete(apply_insert(&mut state, id, kind, callback, frozen));
                }
                Op::Remove(id, completer) => {
                    let mut state = self.state.lock();
                    apply_remove(&mut state, id);
                    completer.complete(());
                }
                Op::Freeze(id) => apply_set_frozen(&mut self.state.lock(), id, true),
                Op::Thaw(id) => apply_set_frozen(&mut self.state.lock(), id, false),
                Op::Task(task) => task(self),
            }
        }
    }
}

fn apply_insert(
    state: &mut Owner,
    id: EventId,
    kind: RegKind,
    callback: EventCallback,
    frozen: bool,
) -> Result<EventId> {
    match &kind {
        RegKind::Read(device) => {
            state.demux.insert(device.fd(), id, Ready::Read, frozen)?;
        }
        RegKind::Write(device) => {
            state.demux.insert(device.fd(), id, Ready::Write, frozen)?;
        }
        RegKind::Periodic(period) => {
            state.timers.push(Reverse((Instant::now() + *period, id)));
        }
    }
    if !frozen {
        state.active += 1;
    }
    state.table.insert(
        id,
        Registration {
            kind,
            callback: Some(callback),
            frozen,
        },
    );
    Ok(id)
}

fn apply_remove(state: &mut Owner, id: EventId) {
    let Some(reg) = state.table.remove(&id) else {
        return;
    };
    match &reg.kind {
        RegKind::Read(device) | RegKind::Write(device) => {
            let _ = state.demux.remove(device.fd(), id);
        }
        RegKind::Periodic(_) => {}
    }
    if !reg.frozen {
        state.active -= 1;
    }
}

fn apply_set_frozen(state: &mut Owner, id: EventId, frozen: bool) {
    let Some(reg) = state.table.get_mut(&id) else {
        return;
    };
    if reg.frozen == frozen {
        return;
    }
    match &reg.kind {
        RegKind::Read(device) | RegKind::Write(device) => {
            let fd = device.fd();
            if state.demux.set_frozen(fd, id, frozen).is_err() {
                return;
            }
        }
        // Periodic events have no interest to disable.
        RegKind::Periodic(_) => return,
    }
    reg.frozen = frozen;
    if frozen {
        state.active -= 1;
    } else {
        state.active += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn empty_reactor_runs_to_quiescence() {
        let reactor = Reactor::new().unwrap();
        reactor.run().unwrap();
        assert_eq!(reactor.num_events(), 0);
    }

    #[test]
    fn insert_then_remove_restores_event_set_and_closes_device() {
        let reactor = Reactor::new().unwrap();
        let (read_end, _write_end) = Device::pipe().unwrap();
        let device = Arc::new(read_end);

        let id = reactor
            .insert_read(device.clone(), |_, _| Signal::Default)
            .wait()
            .unwrap()
            .unwrap();
        assert_eq!(reactor.num_events(), 1);

        reactor.remove(id).wait().unwrap();
        assert_eq!(reactor.num_events(), 0);

        // Only our local handle keeps the device alive now.
        assert_eq!(Arc::strong_count(&device), 1);
    }

    #[test]
    fn removing_a_dead_id_is_a_no_op() {
        let reactor = Reactor::new().unwrap();
        let (read_end, _write_end) = Device::pipe().unwrap();
        let id = reactor
            .insert_read(Arc::new(read_end), |_, _| Signal::Default)
            .wait()
            .unwrap()
            .unwrap();
        reactor.remove(id).wait().unwrap();
        reactor.remove(id).wait().unwrap();
        assert_eq!(reactor.num_events(), 0);
    }

    #[test]
    fn read_event_fires_and_self_removes() {
        let reactor = Reactor::new().unwrap();
        let (read_end, write_end) = Device::pipe().unwrap();
        let device = Arc::new(read_end);
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_in_cb = hits.clone();
        let cb_device = device.clone();
        reactor
            .insert_read(device, move |_, _| {
                let mut buf = [0u8; 16];
                let _ = cb_device.read(&mut buf);
                hits_in_cb.fetch_add(1, Ordering::SeqCst);
                Signal::Remove
            })
            .wait()
            .unwrap()
            .unwrap();

        write_end.write(b"x").unwrap();
        reactor.run().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.num_events(), 0);
    }

    #[test]
    fn periodic_fire_times_are_monotone() {
        let reactor = Reactor::new().unwrap();
        let stamps: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let stamps_in_cb = stamps.clone();
        reactor
            .insert_periodic(Duration::from_millis(5), move |_, _| {
                let mut stamps = stamps_in_cb.lock();
                stamps.push(Instant::now());
                if stamps.len() >= 4 {
                    Signal::Remove
                } else {
                    Signal::Default
                }
            })
            .wait()
            .unwrap()
            .unwrap();
        reactor.run().unwrap();

        let stamps = stamps.lock();
        assert_eq!(stamps.len(), 4);
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn zero_period_fires_every_tick() {
        let reactor = Reactor::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_cb = hits.clone();
        reactor
            .insert_periodic(Duration::ZERO, move |_, _| {
                if hits_in_cb.fetch_add(1, Ordering::SeqCst) >= 9 {
                    Signal::Remove
                } else {
                    Signal::Default
                }
            })
            .wait()
            .unwrap()
            .unwrap();
        reactor.run().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn frozen_events_neither_fire_nor_hold_the_loop() {
        let reactor = Reactor::new().unwrap();
        let (read_end, write_end) = Device::pipe().unwrap();
        let device = Arc::new(read_end);
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_in_cb = hits.clone();
        let cb_device = device.clone();
        let id = reactor
            .insert_read(device, move |_, _| {
                let mut buf = [0u8; 8];
                let _ = cb_device.read(&mut buf);
                hits_in_cb.fetch_add(1, Ordering::SeqCst);
                Signal::Remove
            })
            .wait()
            .unwrap()
            .unwrap();

        write_end.write(b"x").unwrap();
        reactor.freeze(id);
        // Nothing unfrozen remains, so the loop exits without firing.
        reactor.run().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        reactor.thaw(id);
        reactor.run().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.num_events(), 0);
    }

    #[test]
    fn dispatched_closures_run_in_fifo_order() {
        let reactor = Reactor::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            reactor.dispatch(move || order.lock().push(i));
        }
        reactor.run().unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cross_thread_insert_wakes_a_blocked_loop() {
        let reactor = Reactor::new().unwrap();
        // Keep the loop alive while the other thread gets ready.
        let gate = Arc::new(AtomicBool::new(false));
        let gate_in_cb = gate.clone();
        reactor
            .insert_periodic(Duration::from_millis(1), move |_, _| {
                if gate_in_cb.load(Ordering::SeqCst) {
                    Signal::Remove
                } else {
                    Signal::Default
                }
            })
            .wait()
            .unwrap()
            .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let handle = {
            let reactor = reactor.clone();
            let hits = hits.clone();
            let gate = gate.clone();
            std::thread::spawn(move || {
                let hits_in_cb = hits.clone();
                let gate_in_cb = gate.clone();
                reactor
                    .dispatch(move || {
                        hits_in_cb.fetch_add(1, Ordering::SeqCst);
                        gate_in_cb.store(true, Ordering::SeqCst);
                    })
                    .wait()
                    .unwrap();
            })
        };

        reactor.run().unwrap();
        handle.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_drains_pending_tasks() {
        let reactor = Reactor::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_cb = hits.clone();
        reactor.dispatch(move || {
            hits_in_cb.fetch_add(1, Ordering::SeqCst);
        });
        reactor.shutdown();
        reactor.run().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
