//! libssh2-backed transport
//!
//! Enabled with the `libssh2` feature. The session is switched to
//! non-blocking mode right after authentication; from then on every libssh2
//! call that would block surfaces as [`Attempt::WouldBlock`] and
//! `block_directions` tells the engine what to wait for.
//!
//! Dropping a [`Libssh2Channel`] frees it and dropping a [`Libssh2Listener`]
//! cancels the forward. Drop them through [`SharedTransport::release`] so the
//! call runs under the transport mutex. libssh2 may answer EAGAIN to either
//! call in non-blocking mode; `ssh2` ignores that result, so the peer can keep
//! a half-closed channel until the session disconnects.
//!
//! [`SharedTransport::release`]: super::SharedTransport::release

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use ssh2::{BlockDirections, ErrorCode, Session};
use tracing::{debug, info, warn};

use super::error::SshError;
use super::readiness::{stream_socket, SocketRef};
use super::transport::{Attempt, Channel, ForwardListener, IoDirection, Transport};

/// `LIBSSH2_ERROR_EAGAIN`
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

fn is_eagain(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

fn attempt<T>(result: Result<T, ssh2::Error>) -> Result<Attempt<T>, SshError> {
    match result {
        Ok(value) => Ok(Attempt::Ready(value)),
        Err(e) if is_eagain(&e) => Ok(Attempt::WouldBlock),
        Err(e) => Err(e.into()),
    }
}

/// An authenticated libssh2 session in non-blocking mode
pub struct Libssh2Transport {
    session: Session,
    // Same socket libssh2 reads from; kept for readiness waits
    socket: TcpStream,
}

impl Libssh2Transport {
    /// Connect, handshake and authenticate.
    ///
    /// `authenticate` runs while the session is still blocking. A
    /// `keepalive_secs` of 0 leaves libssh2 keepalive disabled.
    pub fn connect<A, F>(
        addr: A,
        connect_timeout: Duration,
        keepalive_secs: u32,
        authenticate: F,
    ) -> Result<Self, SshError>
    where
        A: ToSocketAddrs,
        F: FnOnce(&Session) -> Result<(), ssh2::Error>,
    {
        let target = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("address resolved to nothing".into()))?;

        let tcp = TcpStream::connect_timeout(&target, connect_timeout).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => SshError::Timeout(format!("Connection to {} timed out", target)),
            _ => SshError::ConnectionFailed(format!("Failed to connect to {}: {}", target, e)),
        })?;
        let socket = tcp.try_clone()?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(connect_timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake()?;
        authenticate(&session)?;
        if !session.authenticated() {
            return Err(SshError::ConnectionFailed("Authentication rejected".into()));
        }

        if keepalive_secs > 0 {
            session.set_keepalive(false, keepalive_secs);
        }
        session.set_timeout(0);
        session.set_blocking(false);
        info!("SSH session established with {}", target);

        Ok(Self { session, socket })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Transport for Libssh2Transport {
    type Channel = Libssh2Channel;
    type Listener = Libssh2Listener;

    fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: Option<SocketAddr>,
    ) -> Result<Attempt<Libssh2Channel>, SshError> {
        let origin_host = originator.map(|addr| addr.ip().to_string());
        let origin = origin_host
            .as_deref()
            .zip(originator.map(|addr| addr.port()));
        let opened = attempt(self.session.channel_direct_tcpip(host, port, origin))?;
        Ok(opened.map(|inner| Libssh2Channel { inner }))
    }

    fn request_remote_forward(
        &self,
        bind_addr: &str,
        port: u16,
    ) -> Result<Attempt<(Libssh2Listener, u16)>, SshError> {
        let requested = attempt(self.session.channel_forward_listen(port, Some(bind_addr), None))?;
        Ok(requested.map(|(inner, bound)| (Libssh2Listener { inner }, bound)))
    }

    fn pending_io(&self) -> IoDirection {
        match self.session.block_directions() {
            BlockDirections::None => IoDirection::None,
            BlockDirections::Inbound => IoDirection::Read,
            BlockDirections::Outbound => IoDirection::Write,
            BlockDirections::Both => IoDirection::Both,
        }
    }

    fn socket(&self) -> Option<SocketRef<'_>> {
        Some(stream_socket(&self.socket))
    }

    fn keepalive(&self) -> Result<Attempt<Duration>, SshError> {
        let next = attempt(self.session.keepalive_send())?;
        Ok(next.map(|secs| Duration::from_secs(u64::from(secs))))
    }

    fn disconnect(&self) {
        // Best effort: the peer may already be gone
        self.session.set_blocking(true);
        self.session.set_timeout(1000);
        if let Err(e) = self.session.disconnect(None, "session closed", None) {
            debug!("SSH disconnect failed: {}", e);
        }
        if let Err(e) = self.socket.shutdown(std::net::Shutdown::Both) {
            warn!("Failed to shut down SSH socket: {}", e);
        }
    }
}

pub struct Libssh2Channel {
    inner: ssh2::Channel,
}

impl Channel for Libssh2Channel {
    fn read(&mut self, buf: &mut [u8]) -> Result<Attempt<usize>, SshError> {
        Attempt::from_io(self.inner.read(buf))
    }

    fn write(&mut self, buf: &[u8]) -> Result<Attempt<usize>, SshError> {
        Attempt::from_io(self.inner.write(buf))
    }

    fn eof(&self) -> bool {
        self.inner.eof()
    }

    fn close(&mut self) -> Result<Attempt<()>, SshError> {
        attempt(self.inner.close())
    }
}

pub struct Libssh2Listener {
    inner: ssh2::Listener,
}

impl ForwardListener for Libssh2Listener {
    type Channel = Libssh2Channel;

    fn accept(&mut self) -> Result<Attempt<Libssh2Channel>, SshError> {
        let accepted = attempt(self.inner.accept())?;
        Ok(accepted.map(|inner| Libssh2Channel { inner }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = Libssh2Transport::connect(addr, Duration::from_secs(2), 0, |_| Ok(()));
        assert!(matches!(result, Err(SshError::ConnectionFailed(_)) | Err(SshError::Timeout(_))));
    }
}
