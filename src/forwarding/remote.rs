//! Remote Tunnel Worker
//!
//! Forwards connections from a port on the remote peer back to a host:port
//! reachable from this side.
//! Example: Remote server:9000 -> local:3000 (expose local service to remote)
//!
//! ## Architecture
//!
//! The `tcpip-forward` request is made by the registry before the worker
//! starts, so a rejected request fails the open call. The worker then only
//! accepts `forwarded-tcpip` channels, each accept bounded by the accept
//! timeout so the loop keeps observing its stop signal:
//!
//! ```text
//! remote client ─► peer:9000 ─► forwarded-tcpip channel ─► worker ─► TcpStream::connect(local:3000)
//!                                                                    └─► ForwardingPump (own thread)
//! ```

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use super::context::ConnectionContext;
use super::pump::ForwardingPump;
use crate::ssh::{ForwardListener, SshError, Transport};

/// Upper bound for reaching the local target of a forwarded connection
const TARGET_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Acceptance loop of a remote tunnel
pub struct RemoteTunnelWorker<T: Transport> {
    ctx: Arc<ConnectionContext<T>>,
    listener: T::Listener,
}

impl<T: Transport> RemoteTunnelWorker<T> {
    pub fn new(ctx: Arc<ConnectionContext<T>>, listener: T::Listener) -> Self {
        Self { ctx, listener }
    }

    pub fn spawn(self) -> Result<JoinHandle<()>, SshError> {
        let name = self.ctx.key.to_string();
        thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to start tunnel thread: {}", e)))
    }

    fn run(self) {
        let ctx = self.ctx;
        let mut listener = self.listener;
        let mut connections: Vec<JoinHandle<()>> = Vec::new();

        while !ctx.should_stop() {
            let accepted = ctx
                .shared
                .blocking()
                .timeout(ctx.config().accept_timeout())
                .cancel_on(&ctx.stop)
                .try_run(|_| listener.accept());

            match accepted {
                Ok(Some(channel)) => {
                    debug!("Forwarded channel accepted for {}", ctx.key);
                    let conn_ctx = ctx.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("{}<-forwarded", ctx.key))
                        .spawn(move || handle_forwarded(conn_ctx, channel));
                    match spawned {
                        Ok(handle) => connections.push(handle),
                        Err(e) => ctx.report("Failed to start connection thread", &e.into()),
                    }
                }
                // Accept timed out or we are stopping
                Ok(None) => {}
                Err(e) if e.is_session_fatal() => {
                    error!("Remote tunnel {} lost its session: {}", ctx.key, e);
                    ctx.stop.set();
                }
                Err(e) => {
                    ctx.report("Accepting forwarded channel failed", &e);
                    ctx.stop.wait_timeout(ctx.config().accept_timeout());
                }
            }
            connections.retain(|c| !c.is_finished());
        }

        // Cancels the forward on the peer
        ctx.shared.release(listener);
        // 等待所有活跃连接关闭
        for connection in connections {
            if connection.join().is_err() {
                error!("Connection thread of {} panicked", ctx.key);
            }
        }
        info!("Remote tunnel {} stopped", ctx.key);
    }
}

fn handle_forwarded<T: Transport>(ctx: Arc<ConnectionContext<T>>, mut channel: T::Channel) {
    let Some((host, port)) = ctx.key.target() else {
        ctx.shared.close_channel(&mut channel);
        ctx.shared.release(channel);
        return;
    };

    ctx.stats.connection_opened();
    let result = match connect_target(host, port) {
        Ok(stream) => {
            ctx.apply_socket_options(&stream);
            ForwardingPump::new(&ctx.shared, &ctx.stop)
                .with_stats(&ctx.stats)
                .run(channel, stream)
                .into_result()
        }
        Err(e) => {
            ctx.shared.close_channel(&mut channel);
            ctx.shared.release(channel);
            Err(e)
        }
    };
    ctx.stats.connection_closed();

    if let Err(e) = result {
        ctx.report(&format!("Forwarded connection to {}:{}", host, port), &e);
    }
}

/// Connect to the first reachable address of `host:port`
fn connect_target(host: &str, port: u16) -> Result<TcpStream, SshError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve {}:{}: {}", host, port, e)))?
        .collect();

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, TARGET_CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(SshError::ConnectionFailed(match last_err {
        Some(e) => format!("Failed to connect to {}:{}: {}", host, port, e),
        None => format!("No addresses found for {}:{}", host, port),
    }))
}
