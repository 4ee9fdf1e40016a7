//! Transport Abstraction
//!
//! The engine never talks to an SSH library directly. It drives a
//! non-blocking session through the [`Transport`] trait: every primitive may
//! answer [`Attempt::WouldBlock`] instead of a result, and the session tells
//! us which I/O direction it is waiting on so callers can wait for readiness
//! on the one shared socket.
//!
//! ```text
//!            ┌──────────────── Transport (one TCP socket) ────────────────┐
//!            │  channel #1 (direct-tcpip)   channel #2   forwarded #3 ...   │
//!            └────────────────────────────────────────────────────────────┘
//!                 ▲ BlockingCall / ChunkStream serialize every attempt
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::SshError;
use super::readiness::SocketRef;

/// Outcome of a single non-blocking attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The operation completed
    Ready(T),
    /// EAGAIN: retry once the transport socket is ready
    WouldBlock,
}

impl<T> Attempt<T> {
    pub fn is_would_block(&self) -> bool {
        matches!(self, Attempt::WouldBlock)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Attempt<U> {
        match self {
            Attempt::Ready(value) => Attempt::Ready(f(value)),
            Attempt::WouldBlock => Attempt::WouldBlock,
        }
    }

    /// Fold an `io::Result` from a non-blocking socket into an attempt
    pub fn from_io(result: std::io::Result<T>) -> Result<Attempt<T>, SshError> {
        match result {
            Ok(value) => Ok(Attempt::Ready(value)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(Attempt::WouldBlock),
            Err(e) => Err(SshError::IoError(e)),
        }
    }
}

/// Direction the transport is blocked on after a would-block result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoDirection {
    #[default]
    None,
    Read,
    Write,
    Both,
}

impl IoDirection {
    pub fn wants_read(self) -> bool {
        matches!(self, IoDirection::Read | IoDirection::Both)
    }

    pub fn wants_write(self) -> bool {
        matches!(self, IoDirection::Write | IoDirection::Both)
    }
}

/// A logical duplex byte stream multiplexed over the transport
pub trait Channel: Send + 'static {
    /// Read into `buf`; `Ready(0)` is end-of-stream only when [`Channel::eof`] agrees
    fn read(&mut self, buf: &mut [u8]) -> Result<Attempt<usize>, SshError>;

    /// Write from `buf`, possibly partially
    fn write(&mut self, buf: &[u8]) -> Result<Attempt<usize>, SshError>;

    /// Remote side has sent EOF
    fn eof(&self) -> bool;

    /// Close the channel
    fn close(&mut self) -> Result<Attempt<()>, SshError>;
}

/// Remote-side listener created by a `tcpip-forward` request
pub trait ForwardListener: Send + 'static {
    type Channel: Channel;

    /// Accept the next `forwarded-tcpip` channel
    fn accept(&mut self) -> Result<Attempt<Self::Channel>, SshError>;
}

/// One established, authenticated, non-blocking SSH session
pub trait Transport: Send + Sync + 'static {
    type Channel: Channel;
    type Listener: ForwardListener<Channel = Self::Channel>;

    /// Open a `direct-tcpip` channel to `host:port` on the remote side
    fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: Option<SocketAddr>,
    ) -> Result<Attempt<Self::Channel>, SshError>;

    /// Ask the remote peer to listen on `bind_addr:port`; returns the listener
    /// and the port actually bound on the peer
    fn request_remote_forward(
        &self,
        bind_addr: &str,
        port: u16,
    ) -> Result<Attempt<(Self::Listener, u16)>, SshError>;

    /// Direction the last would-block attempt is waiting on
    fn pending_io(&self) -> IoDirection;

    /// Underlying socket for readiness waits. `None` makes waits fall back to
    /// sleeping for the wait granularity.
    fn socket(&self) -> Option<SocketRef<'_>> {
        None
    }

    /// Send a keepalive; returns the time until the next one is due
    fn keepalive(&self) -> Result<Attempt<Duration>, SshError> {
        Ok(Attempt::Ready(Duration::ZERO))
    }

    /// Tear the session down. Called once, after every tunnel is joined.
    fn disconnect(&self) {}
}
