//! I/O demultiplexer over `mio::Poll`.
//!
//! Epoll watches descriptors, not events, so read and write registrations
//! that share an fd merge into one poll entry whose interest set is the
//! union of the unfrozen halves. Freezing a half drops its interest without
//! forgetting the registration.

use super::EventId;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Which half of an fd registration became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ready {
    Read,
    Write,
}

#[derive(Default)]
struct FdEntry {
    read: Option<EventId>,
    write: Option<EventId>,
    read_frozen: bool,
    write_frozen: bool,
    registered: bool,
}

impl FdEntry {
    fn interest(&self) -> Option<Interest> {
        let mut interest = None;
        if self.read.is_some() && !self.read_frozen {
            interest = Some(Interest::READABLE);
        }
        if self.write.is_some() && !self.write_frozen {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interest
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

pub(crate) struct Demux {
    poll: Poll,
    events: Events,
    entries: HashMap<RawFd, FdEntry>,
}

impl Demux {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            entries: HashMap::new(),
        })
    }

    /// Register `id` as the read or write handler of `fd`.
    pub fn insert(&mut self, fd: RawFd, id: EventId, kind: Ready, frozen: bool) -> io::Result<()> {
        let entry = self.entries.entry(fd).or_default();
        match kind {
            Ready::Read => {
                entry.read = Some(id);
                entry.read_frozen = frozen;
            }
            Ready::Write => {
                entry.write = Some(id);
                entry.write_frozen = frozen;
            }
        }
        Self::sync_registration(&self.poll, fd, entry)
    }

    /// Drop `id` from `fd`'s registration if it still holds that slot.
    pub fn remove(&mut self, fd: RawFd, id: EventId) -> io::Result<()> {
        let Some(entry) = self.entries.get_mut(&fd) else {
            return Ok(());
        };
        if entry.read == Some(id) {
            entry.read = None;
            entry.read_frozen = false;
        }
        if entry.write == Some(id) {
            entry.write = None;
            entry.write_frozen = false;
        }
        if entry.is_empty() {
            if entry.registered {
                // The fd may already be closed; deregistration is advisory.
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            }
            self.entries.remove(&fd);
            Ok(())
        } else {
            Self::sync_registration(&self.poll, fd, entry)
        }
    }

    /// Disable or enable interest for `id` without unregistering it.
    pub fn set_frozen(&mut self, fd: RawFd, id: EventId, frozen: bool) -> io::Result<()> {
        let Some(entry) = self.entries.get_mut(&fd) else {
            return Ok(());
        };
        if entry.read == Some(id) {
            entry.read_frozen = frozen;
        }
        if entry.write == Some(id) {
            entry.write_frozen = frozen;
        }
        Self::sync_registration(&self.poll, fd, entry)
    }

    fn sync_registration(poll: &Poll, fd: RawFd, entry: &mut FdEntry) -> io::Result<()> {
        match (entry.interest(), entry.registered) {
            (Some(interest), true) => {
                poll.registry()
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
            }
            (Some(interest), false) => {
                entry.registered = true;
                poll.registry()
                    .register(&mut SourceFd(&fd), Token(fd as usize), interest)
            }
            (None, true) => {
                entry.registered = false;
                poll.registry().deregister(&mut SourceFd(&fd))
            }
            (None, false) => Ok(()),
        }
    }

    /// Block until readiness or timeout, appending `(event, half)` pairs.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<(EventId, Ready)>,
    ) -> io::Result<()> {
        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            let Some(entry) = self.entries.get(&fd) else {
                continue;
            };
            // Closed or errored peers must reach the handlers so EOF is
            // observed through an ordinary read/write attempt.
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed() || event.is_error();
            if readable {
                if let Some(id) = entry.read {
                    if !entry.read_frozen {
                        ready.push((id, Ready::Read));
                    }
                }
            }
            if writable {
                if let Some(id) = entry.write {
                    if !entry.write_frozen {
                        ready.push((id, Ready::Write));
                    }
                }
            }
        }
        Ok(())
    }
}
