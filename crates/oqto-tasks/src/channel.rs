//! Framed value channel on top of [`Transport`].
//!
//! Wire format: every `send` writes exactly one frame, a 4-byte big-endian
//! payload length followed by the JSON encoding of the value.

use crate::error::{Error, Result};
use crate::transport::{self, Transport};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::os::fd::RawFd;

/// Largest payload a frame may carry.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// One endpoint of a duplex, ordered, message-framed channel.
///
/// Not internally synchronized: callers sharing a channel between threads
/// must serialize `send`/`recv` themselves.
#[derive(Debug)]
pub struct Channel {
    transport: Transport,
}

/// Two connected channel endpoints (socketpair).
pub fn channel_pair() -> Result<(Channel, Channel)> {
    let (a, b) = Transport::pair()?;
    Ok((Channel::new(a), Channel::new(b)))
}

impl Channel {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// A channel that is already closed; every operation reports `ConnectionLost`.
    pub fn closed() -> Self {
        Self::new(Transport::closed())
    }

    /// Adopt descriptors handed over by a parent across exec.
    ///
    /// Both descriptors are checked to be open and are marked close-on-exec
    /// again so they do not leak into this process's own workers.
    pub(crate) fn from_inherited_fds(read: RawFd, write: RawFd) -> Result<Self> {
        if read == write {
            return Err(Error::Spawn(format!("read and write fd are both {read}")));
        }
        for fd in [read, write] {
            if !transport::is_open(fd) {
                return Err(Error::Spawn(format!("inherited fd {fd} is not open")));
            }
            transport::set_cloexec(fd, true)?;
        }
        // SAFETY: both fds are open, distinct, and were handed to this
        // process for exclusive use by the parent.
        Ok(Self::new(unsafe { Transport::from_raw_fds(read, write) }))
    }

    /// Raw descriptor numbers (read, write), if still open.
    pub fn raw_fds(&self) -> Option<(RawFd, RawFd)> {
        self.transport.raw_fds()
    }

    /// Serialize `value` and send it as one frame.
    pub fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.send_bytes(&payload)
    }

    /// Send a raw payload as one frame.
    pub fn send_bytes(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(payload.len()));
        }
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        self.transport.write_all(&frame)
    }

    /// Block until a full frame arrives and return its raw payload.
    pub fn recv_bytes(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; HEADER_LEN];
        self.transport.read_into(&mut header)?;
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(len));
        }
        self.transport.read_exact(len)
    }

    /// Block until a full frame arrives and deserialize it.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        let payload = self.recv_bytes()?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Close both halves. Idempotent.
    pub fn close(&mut self) {
        self.transport.close();
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }
}
