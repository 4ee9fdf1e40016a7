//! SOCKS5 handshake for dynamic tunnels
//!
//! Server side of the RFC 1928 subset we support: no authentication,
//! CONNECT only, IPv4 and domain-name targets.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use super::context::ConnectionContext;
use super::pump::ForwardingPump;
use crate::ssh::{SshError, StopSignal, Transport};

/// SOCKS5 protocol constants
pub mod consts {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    /// Every failure is reported with this status
    pub const REP_FAILURE: u8 = 0x05;
}

use consts::*;

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    #[error("Client offered no authentication methods")]
    NoMethods,

    #[error("Invalid SOCKS5 version in request: {0}")]
    InvalidRequestVersion(u8),

    #[error("Unsupported SOCKS5 command: {0}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("Domain name is not valid UTF-8")]
    InvalidDomain,

    #[error("Handshake I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Destination requested by a SOCKS5 client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksTarget {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for SocksTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Run the handshake up to (not including) the final reply.
///
/// Failures after method selection get a best-effort failure reply here;
/// failures before it close without a reply. On success the caller owes
/// either [`REP_SUCCESS`] or [`REP_FAILURE`] once it knows whether the
/// target is reachable.
pub fn negotiate<S: Read + Write>(stream: &mut S) -> Result<SocksTarget, Socks5Error> {
    // Phase 1: method negotiation
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting)?;
    let [version, nmethods] = greeting;
    if version != VERSION {
        return Err(Socks5Error::UnsupportedVersion(version));
    }
    if nmethods == 0 {
        return Err(Socks5Error::NoMethods);
    }
    let mut methods = [0u8; 255];
    stream.read_exact(&mut methods[..nmethods as usize])?;
    stream.write_all(&[VERSION, AUTH_NONE])?;

    // Phase 2: connection request
    read_request(stream).inspect_err(|_| {
        let _ = send_reply(stream, REP_FAILURE);
    })
}

fn read_request<S: Read>(stream: &mut S) -> Result<SocksTarget, Socks5Error> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let [version, command, _reserved, atyp] = header;
    if version != VERSION {
        return Err(Socks5Error::InvalidRequestVersion(version));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets)?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name)?;
            String::from_utf8(name).map_err(|_| Socks5Error::InvalidDomain)?
        }
        other => return Err(Socks5Error::UnsupportedAddressType(other)),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port)?;

    if command != CMD_CONNECT {
        return Err(Socks5Error::UnsupportedCommand(command));
    }

    Ok(SocksTarget {
        host,
        port: u16::from_be_bytes(port),
    })
}

/// VER | REP | RSV | ATYP | BND.ADDR | BND.PORT, always bound to 0.0.0.0:0
pub fn send_reply<W: Write>(stream: &mut W, status: u8) -> io::Result<()> {
    let reply = [VERSION, status, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply)
}

/// Blocking reads that give up when the tunnel stops or the deadline passes.
/// The socket's read timeout sets how often the signals are checked.
struct StopAwareStream<'a> {
    stream: &'a TcpStream,
    stop: &'a StopSignal,
    session: &'a StopSignal,
    deadline: Instant,
}

impl<'a> StopAwareStream<'a> {
    fn new(stream: &'a TcpStream, stop: &'a StopSignal, session: &'a StopSignal, timeout: Duration) -> Self {
        Self {
            stream,
            stop,
            session,
            deadline: Instant::now() + timeout,
        }
    }
}

impl Read for StopAwareStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut stream = self.stream;
            match stream.read(buf) {
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    if self.stop.is_set() || self.session.is_set() {
                        return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "tunnel stopping"));
                    }
                    if Instant::now() >= self.deadline {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "SOCKS5 handshake timed out"));
                    }
                }
                other => return other,
            }
        }
    }
}

impl Write for StopAwareStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self.stream;
        stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut stream = self.stream;
        stream.flush()
    }
}

/// Serve one dynamic-tunnel client: handshake, open the channel, pump
pub(crate) fn serve<T: Transport>(
    ctx: &ConnectionContext<T>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), SshError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(ctx.config().accept_timeout()))?;

    let negotiated = {
        let mut handshake = StopAwareStream::new(
            &stream,
            &ctx.stop,
            ctx.shared.shutdown_signal(),
            ctx.config().socks_handshake_timeout(),
        );
        negotiate(&mut handshake)
    };
    let target = match negotiated {
        Ok(target) => target,
        Err(_) if ctx.should_stop() => return Err(SshError::Cancelled),
        Err(e) => {
            return Err(SshError::ConnectionFailed(format!(
                "SOCKS5 handshake with {} failed: {}",
                peer, e
            )))
        }
    };
    stream.set_read_timeout(None)?;

    debug!("SOCKS5: Connecting to {}", target);
    let mut channel = match ctx.open_channel(&target.host, target.port, Some(peer)) {
        Ok(channel) => channel,
        Err(e) => {
            let _ = send_reply(&mut &stream, REP_FAILURE);
            return Err(e);
        }
    };
    if let Err(e) = send_reply(&mut &stream, REP_SUCCESS) {
        ctx.shared.close_channel(&mut channel);
        ctx.shared.release(channel);
        return Err(SshError::ConnectionFailed(format!("Failed to send SOCKS5 reply: {}", e)));
    }

    ForwardingPump::new(&ctx.shared, &ctx.stop)
        .with_stats(&ctx.stats)
        .run(channel, stream)
        .into_result()
}
