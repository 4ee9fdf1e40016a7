//! Local Tunnel Listener
//!
//! Accepts local TCP clients for local and dynamic tunnels. Each accepted
//! connection gets its own thread: local tunnels open a channel straight to
//! the fixed target, dynamic tunnels run the SOCKS5 handshake first.
//! Example: 127.0.0.1:8888 -> SSH -> remote_jupyter:8888

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use super::context::ConnectionContext;
use super::pump::ForwardingPump;
use super::socks5;
use crate::ssh::readiness::{self, listener_socket};
use crate::ssh::{IoDirection, SshError, Transport};

/// Bind the local listening socket, turning the common failures into
/// actionable messages
pub(crate) fn bind_listener(bind_addr: &str, port: u16) -> Result<TcpListener, SshError> {
    let local_addr = format!("{}:{}", bind_addr, port);
    TcpListener::bind((bind_addr, port)).map_err(|e| match e.kind() {
        io::ErrorKind::AddrInUse => SshError::ConnectionFailed(format!(
            "Port already in use: {}. Another application may be using this port.",
            local_addr
        )),
        io::ErrorKind::PermissionDenied => SshError::ConnectionFailed(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            local_addr
        )),
        io::ErrorKind::AddrNotAvailable => SshError::ConnectionFailed(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            local_addr
        )),
        _ => SshError::ConnectionFailed(format!("Failed to bind to {}: {}", local_addr, e)),
    })
}

/// Acceptance loop of a local or dynamic tunnel
pub struct TunnelListener<T: Transport> {
    ctx: Arc<ConnectionContext<T>>,
    listener: TcpListener,
}

impl<T: Transport> TunnelListener<T> {
    pub fn new(ctx: Arc<ConnectionContext<T>>, listener: TcpListener) -> Self {
        Self { ctx, listener }
    }

    /// Run the acceptance loop on a thread named after the tunnel
    pub fn spawn(self) -> Result<JoinHandle<()>, SshError> {
        let name = self.ctx.key.to_string();
        thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to start tunnel thread: {}", e)))
    }

    fn run(self) {
        let ctx = self.ctx;
        let listener = self.listener;
        if let Err(e) = listener.set_nonblocking(true) {
            ctx.report("Listener setup failed", &e.into());
            return;
        }

        let poll = ctx.config().accept_timeout();
        let mut connections: Vec<JoinHandle<()>> = Vec::new();

        while !ctx.should_stop() {
            match readiness::wait_one(Some(listener_socket(&listener)), IoDirection::Read, poll) {
                Ok(true) => {}
                Ok(false) => {
                    connections.retain(|c| !c.is_finished());
                    continue;
                }
                Err(e) => {
                    ctx.report("Listener wait failed", &e.into());
                    thread::sleep(poll);
                    continue;
                }
            }

            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {} for {}", peer, ctx.key);
                    let conn_ctx = ctx.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("{}<-{}", ctx.key, peer))
                        .spawn(move || handle_connection(conn_ctx, stream, peer));
                    match spawned {
                        Ok(handle) => connections.push(handle),
                        Err(e) => ctx.report("Failed to start connection thread", &e.into()),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    ctx.report("Accept failed", &e.into());
                    thread::sleep(poll);
                }
            }
            connections.retain(|c| !c.is_finished());
        }

        // Refuse new clients before draining the old ones
        drop(listener);
        // 等待所有活跃连接关闭
        for connection in connections {
            if connection.join().is_err() {
                error!("Connection thread of {} panicked", ctx.key);
            }
        }
        info!("Tunnel {} listener stopped", ctx.key);
    }
}

fn handle_connection<T: Transport>(ctx: Arc<ConnectionContext<T>>, stream: TcpStream, peer: SocketAddr) {
    ctx.stats.connection_opened();
    ctx.apply_socket_options(&stream);

    let result = match ctx.key.target() {
        Some((host, port)) => forward_direct(&ctx, stream, peer, host, port),
        None => socks5::serve(&ctx, stream, peer),
    };

    ctx.stats.connection_closed();
    if let Err(e) = result {
        ctx.report(&format!("Connection from {}", peer), &e);
    }
}

fn forward_direct<T: Transport>(
    ctx: &ConnectionContext<T>,
    stream: TcpStream,
    peer: SocketAddr,
    host: &str,
    port: u16,
) -> Result<(), SshError> {
    // On failure the local socket is dropped, which closes it
    let channel = ctx.open_channel(host, port, Some(peer))?;
    ForwardingPump::new(&ctx.shared, &ctx.stop)
        .with_stats(&ctx.stats)
        .run(channel, stream)
        .into_result()
}
