//! Owning wrappers around file descriptors.
//!
//! Every descriptor the runtime touches lives inside a [`Device`]:
//! nonblocking and close-on-exec from birth, closed exactly once when the
//! last holder drops it. The reactor registers devices for readiness, the
//! stream buffers read and write through them, and the executor briefly
//! flips them blocking/inheritable around an `exec`.

use crate::error::{CoreError, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::socket::{accept4, SockFlag};
use std::io;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;

/// Owning wrapper around one file descriptor.
#[derive(Debug)]
pub struct Device {
    fd: OwnedFd,
}

impl Device {
    /// Take ownership of `fd`, forcing nonblocking + close-on-exec.
    pub fn new(fd: OwnedFd) -> Result<Self> {
        let device = Self { fd };
        device.set_blocking(false)?;
        device.set_open_on_exec(false)?;
        Ok(device)
    }

    /// Wrap an fd that is already nonblocking and close-on-exec.
    pub fn from_configured(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// One nonblocking read. `Ok(0)` is end-of-file; `WouldBlock` surfaces
    /// as an error of that kind; EINTR is retried.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(self.fd(), buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => return Err(io::Error::from_raw_os_error(errno as i32)),
            }
        }
    }

    /// One nonblocking write; EINTR is retried.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(self.fd(), buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => return Err(io::Error::from_raw_os_error(errno as i32)),
            }
        }
    }

    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        let bits = fcntl(self.fd(), FcntlArg::F_GETFL).map_err(errno_to_core)?;
        let mut flags = OFlag::from_bits_truncate(bits);
        flags.set(OFlag::O_NONBLOCK, !blocking);
        fcntl(self.fd(), FcntlArg::F_SETFL(flags)).map_err(errno_to_core)?;
        Ok(())
    }

    /// Allow (`true`) or forbid (`false`) inheritance across `exec`.
    pub fn set_open_on_exec(&self, open: bool) -> Result<()> {
        let bits = fcntl(self.fd(), FcntlArg::F_GETFD).map_err(errno_to_core)?;
        let mut flags = FdFlag::from_bits_truncate(bits);
        flags.set(FdFlag::FD_CLOEXEC, !open);
        fcntl(self.fd(), FcntlArg::F_SETFD(flags)).map_err(errno_to_core)?;
        Ok(())
    }

    /// Anonymous pipe: `(reader, writer)`.
    pub fn pipe() -> Result<(Device, Device)> {
        let (read_end, write_end) =
            nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(errno_to_core)?;
        let read_end = unsafe { OwnedFd::from_raw_fd(read_end) };
        let write_end = unsafe { OwnedFd::from_raw_fd(write_end) };
        Ok((
            Device::from_configured(read_end),
            Device::from_configured(write_end),
        ))
    }

    /// Connected stream socket pair (both ends in this process).
    pub fn socket_pair() -> Result<(Device, Device)> {
        let (a, b) = UnixStream::pair()?;
        a.set_nonblocking(true)?;
        b.set_nonblocking(true)?;
        Ok((
            Device::from_configured(OwnedFd::from(a)),
            Device::from_configured(OwnedFd::from(b)),
        ))
    }
}

fn errno_to_core(errno: nix::errno::Errno) -> CoreError {
    CoreError::Io(io::Error::from_raw_os_error(errno as i32))
}

// ------------------------------------------------------------------------

/// TCP socket device: listener or connected stream.
#[derive(Debug)]
pub struct Socket {
    device: Arc<Device>,
    endpoint: Option<String>,
}

impl Socket {
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn into_device(self) -> Arc<Device> {
        self.device
    }

    /// Bind and listen. Use port 0 to let the kernel choose.
    pub fn listen(addr: impl ToSocketAddrs) -> Result<Socket> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let endpoint = listener.local_addr().map(|a| a.to_string()).ok();
        Ok(Socket {
            device: Arc::new(Device::from_configured(OwnedFd::from(listener))),
            endpoint,
        })
    }

    /// Blocking connect, then switch the stream nonblocking.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Socket> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let endpoint = stream.local_addr().map(|a| a.to_string()).ok();
        Ok(Socket {
            device: Arc::new(Device::from_configured(OwnedFd::from(stream))),
            endpoint,
        })
    }

    /// Accept one pending connection; `None` when none is queued.
    pub fn accept(&self) -> Result<Option<Socket>> {
        match accept4(
            self.device.fd(),
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        ) {
            Ok(fd) => {
                // accept4 hands us a fresh descriptor we are responsible for.
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                Ok(Some(Socket {
                    device: Arc::new(Device::from_configured(owned)),
                    endpoint: None,
                }))
            }
            Err(nix::errno::Errno::EAGAIN) => Ok(None),
            Err(errno) => Err(errno_to_core(errno)),
        }
    }

    /// Local `host:port` this socket was bound or connected with.
    pub fn local_endpoint(&self) -> Result<&str> {
        self.endpoint
            .as_deref()
            .ok_or_else(|| CoreError::Context("socket endpoint unknown".to_string()))
    }
}

// ------------------------------------------------------------------------

/// Eventfd-style wake-up device.
///
/// Any thread may [`notify`](Notifier::notify); the owning reactor registers
/// the device for read and [`drain`](Notifier::drain)s it on wake-up.
#[derive(Debug)]
pub struct Notifier {
    device: Arc<Device>,
}

impl Notifier {
    pub fn new() -> Result<Notifier> {
        let fd = nix::sys::eventfd::eventfd(
            0,
            nix::sys::eventfd::EfdFlags::EFD_NONBLOCK | nix::sys::eventfd::EfdFlags::EFD_CLOEXEC,
        )
        .map_err(errno_to_core)?;
        Ok(Notifier {
            device: Arc::new(Device::from_configured(fd)),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Wake the reactor. Safe from any thread; a saturated counter still
    /// leaves the fd readable, so the wake-up is never lost.
    pub fn notify(&self) {
        let one = 1u64.to_ne_bytes();
        let _ = self.device.write(&one);
    }

    /// Clear pending wake-ups.
    pub fn drain(&self) {
        let mut buf = [0u8; 8];
        while matches!(self.device.read(&mut buf), Ok(n) if n > 0) {}
    }
}

// ------------------------------------------------------------------------

/// Regular-file device for record spooling.
#[derive(Debug)]
pub struct BlockFile {
    device: Arc<Device>,
}

impl BlockFile {
    pub fn create(path: impl AsRef<Path>) -> Result<BlockFile> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(BlockFile {
            device: Arc::new(Device::from_configured(OwnedFd::from(file))),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

// ------------------------------------------------------------------------

/// Marks a device inheritable for the lifetime of the guard, restoring
/// close-on-exec on drop. Used around vertex-program spawns.
pub struct ScopedOpenOnExec {
    device: Arc<Device>,
}

impl ScopedOpenOnExec {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        device.set_open_on_exec(true)?;
        device.set_blocking(true)?;
        Ok(Self { device })
    }
}

impl Drop for ScopedOpenOnExec {
    fn drop(&mut self) {
        let _ = self.device.set_open_on_exec(false);
        let _ = self.device.set_blocking(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_moves_bytes() {
        let (reader, writer) = Device::pipe().unwrap();
        assert_eq!(writer.write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn empty_pipe_would_block() {
        let (reader, _writer) = Device::pipe().unwrap();
        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn closed_writer_reads_as_eof() {
        let (reader, writer) = Device::pipe().unwrap();
        drop(writer);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn notifier_is_readable_after_notify() {
        let notifier = Notifier::new().unwrap();
        notifier.notify();
        notifier.notify();
        let mut buf = [0u8; 8];
        let n = notifier.device().read(&mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(u64::from_ne_bytes(buf), 2);
    }

    #[test]
    fn listener_accepts_connection() {
        let listener = Socket::listen("127.0.0.1:0").unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        assert!(listener.accept().unwrap().is_none());

        let _client = Socket::connect(&endpoint).unwrap();
        // Connection establishment may lag the connect call briefly.
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(peer) = listener.accept().unwrap() {
                accepted = Some(peer);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(accepted.is_some());
    }

    #[test]
    fn block_file_accepts_writes() {
        let dir = tempfile::tempdir().unwrap();
        let spool = BlockFile::create(dir.path().join("records.bin")).unwrap();
        assert_eq!(spool.device().write(b"abc").unwrap(), 3);
        let on_disk = std::fs::read(dir.path().join("records.bin")).unwrap();
        assert_eq!(on_disk, b"abc");
    }

    #[test]
    fn open_on_exec_guard_restores_cloexec() {
        let (reader, _writer) = Device::pipe().unwrap();
        let reader = Arc::new(reader);
        {
            let _guard = ScopedOpenOnExec::new(reader.clone()).unwrap();
            let bits = fcntl(reader.fd(), FcntlArg::F_GETFD).unwrap();
            assert!(!FdFlag::from_bits_truncate(bits).contains(FdFlag::FD_CLOEXEC));
        }
        let bits = fcntl(reader.fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(bits).contains(FdFlag::FD_CLOEXEC));
    }
}
