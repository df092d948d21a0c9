//! Framed, back-pressure-aware streams over a device.
//!
//! An [`InputStream`] pairs a read event with a growable ingest buffer; an
//! [`OutputStream`] pairs a write event with a mutex-protected egress buffer
//! so producers on any thread can push records. Records are self-delimiting
//! frames of the protocol codec; a reader pulls one complete record at a
//! time and short-reads cleanly.
//!
//! Write interest is armed on demand: the egress buffer keeps a `notified`
//! latch that is set by the first push after a flush and cleared by the
//! write event once the buffer drains, at which point the event freezes
//! itself again.

use crate::device::Device;
use crate::error::Result;
use crate::reactor::{EventId, Reactor, Signal};
use flowgraph_protocol::codec::{decode_frame, encode_frame, FRAME_HEADER_LEN};
use flowgraph_protocol::{BrokenIo, Direction};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::sync::{Arc, OnceLock, Weak};

/// What a stream callback is being invoked for.
#[derive(Debug, Clone, Copy)]
pub enum StreamEvent {
    /// New bytes were ingested (input) or the channel is writable (output).
    Ready,
    /// This direction broke; the stream deregisters after the callback.
    Broken(BrokenIo),
}

/// Callback attached to an input stream.
pub type InputHandler = Box<dyn FnMut(&InputStream, StreamEvent) -> Signal + Send>;
/// Callback attached to an output stream.
pub type OutputHandler = Box<dyn FnMut(&OutputStream, StreamEvent) -> Signal + Send>;

const EPIPE: i32 = 32;

// ------------------------------------------------------------------------

/// Growable ingest buffer. Touched only by the reactor thread.
#[derive(Default)]
pub struct InputStreamBuffer {
    data: Vec<u8>,
    start: usize,
}

/// Result of one [`InputStreamBuffer::sync`] pass.
#[derive(Debug, Clone, Copy)]
pub struct SyncStatus {
    pub received: usize,
    pub eof: bool,
}

impl InputStreamBuffer {
    const CHUNK: usize = 16 * 1024;

    /// Drain as much as possible from `device` into the buffer.
    ///
    /// End-of-file is reported in the status so already-buffered records can
    /// still be delivered; only genuine I/O failures come back as errors.
    pub fn sync(&mut self, device: &Device) -> std::result::Result<SyncStatus, BrokenIo> {
        let mut status = SyncStatus {
            received: 0,
            eof: false,
        };
        loop {
            let len = self.data.len();
            self.data.resize(len + Self::CHUNK, 0);
            match device.read(&mut self.data[len..]) {
                Ok(0) => {
                    self.data.truncate(len);
                    status.eof = true;
                    return Ok(status);
                }
                Ok(n) => {
                    self.data.truncate(len + n);
                    status.received += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.data.truncate(len);
                    return Ok(status);
                }
                Err(err) => {
                    self.data.truncate(len);
                    return Err(BrokenIo::new(
                        Direction::In,
                        err.raw_os_error().unwrap_or(EPIPE),
                    ));
                }
            }
        }
    }

    /// Bytes available but not yet extracted.
    pub fn readable(&self) -> usize {
        self.data.len() - self.start
    }

    /// Whether a complete frame is waiting.
    pub fn has_frame(&self) -> bool {
        let bytes = &self.data[self.start..];
        if bytes.len() < FRAME_HEADER_LEN {
            return false;
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&bytes[..FRAME_HEADER_LEN]);
        bytes.len() >= FRAME_HEADER_LEN + u32::from_le_bytes(header) as usize
    }

    /// Pull one complete record, or `None` on a short read.
    pub fn extract<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match decode_frame(&self.data[self.start..])? {
            Some((value, used)) => {
                self.start += used;
                self.compact();
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn compact(&mut self) {
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        } else if self.start > 64 * 1024 {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }
}

// ------------------------------------------------------------------------

#[derive(Default)]
struct OutBuf {
    data: Vec<u8>,
    start: usize,
    notified: bool,
    disabled: bool,
}

impl OutBuf {
    fn pending(&self) -> usize {
        self.data.len() - self.start
    }

    fn compact(&mut self) {
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        }
    }
}

/// Mutex-protected egress buffer shared by producers and the reactor.
#[derive(Default)]
pub struct OutputStreamBuffer {
    inner: Mutex<OutBuf>,
}

impl OutputStreamBuffer {
    /// Flush as much as possible; `Ok` reports the bytes still pending.
    pub fn flush(&self, device: &Device) -> std::result::Result<usize, BrokenIo> {
        let mut inner = self.inner.lock();
        while inner.pending() > 0 {
            let start = inner.start;
            match device.write(&inner.data[start..]) {
                Ok(n) => {
                    inner.start += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    return Err(BrokenIo::new(
                        Direction::Out,
                        err.raw_os_error().unwrap_or(EPIPE),
                    ));
                }
            }
        }
        inner.compact();
        Ok(inner.pending())
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending()
    }
}

// ------------------------------------------------------------------------

/// Read half of a framed channel: a read event plus an ingest buffer.
pub struct InputStream {
    device: Arc<Device>,
    buf: Mutex<InputStreamBuffer>,
    reactor: Weak<Reactor>,
    event: OnceLock<EventId>,
}

impl InputStream {
    /// Create the stream and register its read event with `reactor`.
    ///
    /// `handler` runs on the reactor thread after each ingest pass. While it
    /// keeps returning [`Signal::Default`] and complete records remain, it
    /// is re-invoked, so a handler consuming one record per call never
    /// strands buffered records. EOF and I/O errors arrive as
    /// [`StreamEvent::Broken`] before the stream deregisters.
    pub fn insert(
        reactor: &Arc<Reactor>,
        device: Arc<Device>,
        handler: impl FnMut(&InputStream, StreamEvent) -> Signal + Send + 'static,
    ) -> Result<Arc<InputStream>> {
        let stream = Arc::new(InputStream {
            device: device.clone(),
            buf: Mutex::new(InputStreamBuffer::default()),
            reactor: Arc::downgrade(reactor),
            event: OnceLock::new(),
        });

        let inner = stream.clone();
        let mut handler: InputHandler = Box::new(handler);
        let id = reactor
            .insert_read(device, move |_, _| inner.on_readable(&mut handler))
            .wait()??;
        let _ = stream.event.set(id);
        Ok(stream)
    }

    fn on_readable(&self, handler: &mut InputHandler) -> Signal {
        let status = match self.buf.lock().sync(&self.device) {
            Ok(status) => status,
            Err(broken) => {
                let _ = handler(self, StreamEvent::Broken(broken));
                return Signal::Remove;
            }
        };

        let mut verdict = Signal::Default;
        loop {
            let before = {
                let buf = self.buf.lock();
                if !buf.has_frame() {
                    break;
                }
                buf.readable()
            };
            verdict = handler(self, StreamEvent::Ready);
            if verdict != Signal::Default || self.buf.lock().readable() == before {
                break;
            }
        }

        if verdict == Signal::Default && status.eof {
            let _ = handler(self, StreamEvent::Broken(BrokenIo::new(Direction::In, EPIPE)));
            return Signal::Remove;
        }
        verdict
    }

    /// Pull one complete record; `None` when no full frame has arrived.
    pub fn recv<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.buf.lock().extract()
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn event_id(&self) -> Option<EventId> {
        self.event.get().copied()
    }

    /// Deregister from the reactor. Idempotent.
    pub fn deregister(&self) {
        if let (Some(reactor), Some(id)) = (self.reactor.upgrade(), self.event_id()) {
            let _ = reactor.remove(id);
        }
    }
}

// ------------------------------------------------------------------------

/// Write half of a framed channel: a write event plus an egress buffer.
pub struct OutputStream {
    device: Arc<Device>,
    buf: OutputStreamBuffer,
    reactor: Weak<Reactor>,
    event: OnceLock<EventId>,
    handler: Mutex<Option<OutputHandler>>,
}

impl OutputStream {
    /// Create the stream and register its (initially parked) write event.
    pub fn insert(
        reactor: &Arc<Reactor>,
        device: Arc<Device>,
        handler: Option<OutputHandler>,
    ) -> Result<Arc<OutputStream>> {
        let stream = Arc::new(OutputStream {
            device: device.clone(),
            buf: OutputStreamBuffer::default(),
            reactor: Arc::downgrade(reactor),
            event: OnceLock::new(),
            handler: Mutex::new(handler),
        });

        let inner = stream.clone();
        let id = reactor
            .insert_write(device, move |reactor, id| inner.on_writable(reactor, id))
            .wait()??;
        let _ = stream.event.set(id);
        Ok(stream)
    }

    fn on_writable(&self, reactor: &Reactor, id: EventId) -> Signal {
        if let Err(broken) = self.buf.flush(&self.device) {
            if let Some(handler) = self.handler.lock().as_mut() {
                let _ = handler(self, StreamEvent::Broken(broken));
            }
            return Signal::Remove;
        }

        let mut disabled = self.buf.inner.lock().disabled;
        if !disabled {
            let verdict = match self.handler.lock().as_mut() {
                Some(handler) => handler(self, StreamEvent::Ready),
                None => Signal::Default,
            };
            match verdict {
                Signal::Remove => return Signal::Remove,
                Signal::Close => {
                    self.buf.inner.lock().disabled = true;
                    disabled = true;
                }
                Signal::Default => {}
            }
            // The handler may have produced more output.
            if self.buf.flush(&self.device).is_err() {
                return Signal::Remove;
            }
        }

        let mut inner = self.buf.inner.lock();
        inner.notified = false;
        if inner.pending() > 0 {
            // Stay armed until the device accepts the rest.
            inner.notified = true;
            Signal::Default
        } else if disabled {
            Signal::Remove
        } else {
            drop(inner);
            reactor.freeze(id);
            Signal::Default
        }
    }

    /// Serialize one record into the egress buffer. Never blocks on I/O:
    /// the buffer grows as needed and write interest is re-armed.
    pub fn send<T: Serialize>(&self, value: &T) -> Result<()> {
        let frame = encode_frame(value)?;
        let rearm = {
            let mut inner = self.buf.inner.lock();
            inner.data.extend_from_slice(&frame);
            if inner.notified {
                false
            } else {
                inner.notified = true;
                true
            }
        };
        if rearm {
            if let (Some(reactor), Some(id)) = (self.reactor.upgrade(), self.event_id()) {
                reactor.thaw(id);
            }
        }
        Ok(())
    }

    /// Deregister once every buffered byte has been delivered.
    pub fn remove_on_flush(&self) {
        let (reactor, id) = match (self.reactor.upgrade(), self.event_id()) {
            (Some(reactor), Some(id)) => (reactor, id),
            _ => return,
        };
        let drain = {
            let mut inner = self.buf.inner.lock();
            if inner.disabled {
                return;
            }
            inner.disabled = true;
            if inner.pending() > 0 {
                inner.notified = true;
                true
            } else {
                false
            }
        };
        if drain {
            reactor.thaw(id);
        } else {
            let _ = reactor.remove(id);
        }
    }

    /// Deregister immediately; buffered bytes are dropped.
    pub fn deregister(&self) {
        if let (Some(reactor), Some(id)) = (self.reactor.upgrade(), self.event_id()) {
            let _ = reactor.remove(id);
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.pending()
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn event_id(&self) -> Option<EventId> {
        self.event.get().copied()
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        // Last-chance flush; a dead reactor cannot drain the buffer anymore.
        let _ = self.buf.flush(&self.device);
        let remaining = self.buf.pending();
        if remaining > 0 {
            tracing::warn!(bytes = remaining, "output stream dropped undelivered bytes");
        }
    }
}
