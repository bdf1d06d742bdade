//! Byte-stream transport over a socketpair or a pair of pipes.
//!
//! Blocking reads and writes are retried when a signal interrupts them.
//! End of stream, broken pipes and connection resets are reported as
//! [`Error::ConnectionLost`]; anything else is an IO error.

use crate::error::{Error, Result};
use rustix::io::Errno;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// One endpoint of a duplex byte stream: a read half and a write half.
#[derive(Debug)]
pub struct Transport {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl Transport {
    /// Wrap an already connected read half and write half.
    pub fn new(read: OwnedFd, write: OwnedFd) -> Self {
        Self {
            read: Some(read),
            write: Some(write),
        }
    }

    /// A transport that is already closed.
    pub fn closed() -> Self {
        Self {
            read: None,
            write: None,
        }
    }

    /// Wrap a connected unix stream, duplicating it into two halves.
    pub fn from_stream(stream: UnixStream) -> Result<Self> {
        let write = stream.try_clone()?;
        Ok(Self::new(OwnedFd::from(stream), OwnedFd::from(write)))
    }

    /// Two cross-linked transports backed by a socketpair.
    ///
    /// Both sockets are close-on-exec; the exec strategy re-enables
    /// inheritance for the child's end only.
    pub fn pair() -> Result<(Transport, Transport)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a)?, Self::from_stream(b)?))
    }

    /// Adopt descriptors inherited across exec.
    ///
    /// # Safety
    ///
    /// `read` and `write` must be open, distinct, and not owned by anything
    /// else in this process.
    pub unsafe fn from_raw_fds(read: RawFd, write: RawFd) -> Self {
        // SAFETY: ownership is transferred by the caller's contract.
        unsafe { Self::new(OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) }
    }

    /// Raw descriptor numbers (read, write), if still open.
    pub fn raw_fds(&self) -> Option<(RawFd, RawFd)> {
        match (&self.read, &self.write) {
            (Some(r), Some(w)) => Some((r.as_raw_fd(), w.as_raw_fd())),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    /// Fill `buf` completely.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let fd = self
            .read
            .as_ref()
            .ok_or_else(|| Error::connection_lost("read on closed transport"))?;

        let mut filled = 0;
        while filled < buf.len() {
            match rustix::io::read(fd, &mut buf[filled..]) {
                Ok(0) => {
                    return Err(Error::connection_lost(format!(
                        "end of stream after {filled} of {} bytes",
                        buf.len()
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if e == Errno::INTR => continue,
                Err(e) if e == Errno::CONNRESET => {
                    return Err(Error::connection_lost("read: connection reset"));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Read exactly `n` bytes.
    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    /// Write all of `buf`.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let fd = self
            .write
            .as_ref()
            .ok_or_else(|| Error::connection_lost("write on closed transport"))?;

        let mut written = 0;
        while written < buf.len() {
            match rustix::io::write(fd, &buf[written..]) {
                Ok(0) => return Err(Error::connection_lost("write: peer accepted no data")),
                Ok(n) => written += n,
                Err(e) if e == Errno::INTR => continue,
                Err(e) if e == Errno::PIPE || e == Errno::CONNRESET => {
                    return Err(Error::connection_lost("write: broken pipe"));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Release both halves. Safe to call more than once.
    pub fn close(&mut self) {
        self.read.take();
        self.write.take();
    }
}

fn fcntl_flag(
    fd: RawFd,
    get: libc::c_int,
    set: libc::c_int,
    flag: libc::c_int,
    on: bool,
) -> io::Result<()> {
    // SAFETY: fcntl with GETFD/GETFL/SETFD/SETFL does not touch memory.
    let current = unsafe { libc::fcntl(fd, get) };
    if current == -1 {
        return Err(io::Error::last_os_error());
    }
    let updated = if on { current | flag } else { current & !flag };
    if updated != current && unsafe { libc::fcntl(fd, set, updated) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set or clear close-on-exec on a raw descriptor.
pub(crate) fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    fcntl_flag(fd, libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC, on)
}

/// Set or clear `O_NONBLOCK` on a raw descriptor.
pub(crate) fn set_nonblocking(fd: RawFd, on: bool) -> io::Result<()> {
    fcntl_flag(fd, libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK, on)
}

/// Whether `fd` refers to an open descriptor.
pub(crate) fn is_open(fd: RawFd) -> bool {
    // SAFETY: F_GETFD only inspects the descriptor table.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

/// Close a descriptor this process holds a stale copy of (after fork).
pub(crate) fn close_raw(fd: RawFd) {
    // SAFETY: only called in a freshly forked child on descriptors whose
    // owning objects are never dropped there.
    unsafe {
        libc::close(fd);
    }
}
