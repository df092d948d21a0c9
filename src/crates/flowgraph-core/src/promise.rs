//! One-shot promise/future pair used by reactor registration calls.
//!
//! Reactor mutations posted from non-owner threads complete asynchronously;
//! the caller gets a [`Promise`] it may block on from any thread that is not
//! the reactor owner. Backed by a `futures` oneshot channel.

use crate::error::{CoreError, Result};
use futures::channel::oneshot;

/// Sending half, held by the reactor.
pub struct Completer<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Completer<T> {
    /// Resolve the paired promise. Dropped receivers are ignored.
    pub fn complete(self, value: T) {
        let _ = self.tx.send(value);
    }
}

/// Receiving half, returned to the caller.
pub struct Promise<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Promise<T> {
    /// Create a connected promise/completer pair.
    pub fn pair() -> (Completer<T>, Promise<T>) {
        let (tx, rx) = oneshot::channel();
        (Completer { tx }, Promise { rx })
    }

    /// Create an already-resolved promise.
    pub fn ready(value: T) -> Promise<T> {
        let (completer, promise) = Promise::pair();
        completer.complete(value);
        promise
    }

    /// Block until the promise resolves.
    ///
    /// Never call this on the reactor owner thread for an operation that the
    /// reactor itself must complete; it would wait on itself.
    pub fn wait(self) -> Result<T> {
        futures::executor::block_on(self.rx).map_err(|_| CoreError::Terminated)
    }

    /// Non-blocking check; resolves to `Some` once completed.
    pub fn try_take(&mut self) -> Option<T> {
        self.rx.try_recv().ok().flatten()
    }
}

/// Run a blocking closure on a helper thread, resolving when it finishes.
///
/// Reactor callbacks may never block on I/O; work that must is pushed out
/// here and its result collected through the promise (or dropped for
/// fire-and-forget jobs).
pub fn spawn_async<R, F>(f: F) -> Promise<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let (completer, promise) = Promise::pair();
    std::thread::spawn(move || completer.complete(f()));
    promise
}
