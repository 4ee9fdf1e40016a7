//! SSH Session
//!
//! Owns the shared transport, the tunnel registry and the keepalive worker
//! of one established session. Dropping the session (or calling
//! [`SshSession::exit`]) stops and joins every tunnel before the transport
//! is disconnected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::blocking::SharedTransport;
use super::config::SessionConfig;
use super::error::SshError;
use super::signal::StopSignal;
use super::transport::Transport;
use crate::forwarding::{ErrorVerbosity, ForwardStats, TunnelInfo, TunnelKey, TunnelRegistry, DEFAULT_BIND_ADDR};

/// Per-tunnel options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOptions {
    pub bind_addr: String,
    pub verbosity: ErrorVerbosity,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.into(),
            verbosity: ErrorVerbosity::default(),
        }
    }
}

impl TunnelOptions {
    pub fn bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    pub fn verbosity(mut self, verbosity: ErrorVerbosity) -> Self {
        self.verbosity = verbosity;
        self
    }
}

struct Keepalive {
    stop: StopSignal,
    thread: JoinHandle<()>,
}

/// An established session and everything running over it
pub struct SshSession<T: Transport> {
    shared: Arc<SharedTransport<T>>,
    tunnels: TunnelRegistry<T>,
    keepalive: Mutex<Option<Keepalive>>,
    closed: AtomicBool,
}

impl<T: Transport> SshSession<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let shared = Arc::new(SharedTransport::new(transport, config));
        let keepalive = shared
            .config()
            .keepalive_interval()
            .and_then(|interval| spawn_keepalive(shared.clone(), interval));

        Self {
            tunnels: TunnelRegistry::new(shared.clone()),
            shared,
            keepalive: Mutex::new(keepalive),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        self.shared.config()
    }

    pub fn shared(&self) -> &Arc<SharedTransport<T>> {
        &self.shared
    }

    /// Forward `bind_addr:local_port` to `remote_host:remote_port` as seen from
    /// the remote peer (-L). Port 0 picks a free port; the bound port is returned.
    pub fn local_tunnel(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        options: TunnelOptions,
    ) -> Result<u16, SshError> {
        self.tunnels
            .open_local(&options.bind_addr, local_port, remote_host, remote_port, options.verbosity)
    }

    /// Have the remote peer listen on `bind_addr:local_port` and forward its
    /// connections to `remote_host:remote_port` as seen from here (-R)
    pub fn remote_tunnel(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        options: TunnelOptions,
    ) -> Result<(), SshError> {
        self.tunnels
            .open_remote(&options.bind_addr, local_port, remote_host, remote_port, options.verbosity)
    }

    /// SOCKS5 proxy on `bind_addr:local_port` (-D)
    pub fn dynamic_tunnel(&self, local_port: u16, options: TunnelOptions) -> Result<u16, SshError> {
        self.tunnels
            .open_dynamic(&options.bind_addr, local_port, options.verbosity)
    }

    pub fn tunnel_is_alive(&self, key: &TunnelKey) -> bool {
        self.tunnels.is_alive(key)
    }

    /// Stop one tunnel and wait for it; no-op for unknown keys
    pub fn shutdown_tunnel(&self, key: &TunnelKey) {
        if !self.tunnels.shutdown(key) {
            debug!("No tunnel {} to shut down", key);
        }
    }

    pub fn close_tunnels(&self) {
        self.tunnels.close_all();
    }

    pub fn tunnel_stats(&self, key: &TunnelKey) -> Option<ForwardStats> {
        self.tunnels.stats(key)
    }

    pub fn list_tunnels(&self) -> Vec<TunnelInfo> {
        self.tunnels.list()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the session down: abandon pending transport calls, stop and join
    /// every tunnel and the keepalive worker, then disconnect. Idempotent.
    pub fn exit(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing SSH session");
        self.shared.shutdown_signal().set();
        self.tunnels.close_all();

        if let Some(keepalive) = self.keepalive.lock().take() {
            keepalive.stop.set();
            if keepalive.thread.join().is_err() {
                error!("Keepalive thread panicked");
            }
        }

        self.shared.transport().disconnect();
        info!("SSH session closed");
    }
}

impl<T: Transport> Drop for SshSession<T> {
    fn drop(&mut self) {
        self.exit();
    }
}

fn spawn_keepalive<T: Transport>(shared: Arc<SharedTransport<T>>, interval: Duration) -> Option<Keepalive> {
    let stop = StopSignal::new();
    let thread_stop = stop.clone();
    let spawned = thread::Builder::new()
        .name("ssh-keepalive".into())
        .spawn(move || run_keepalive(&shared, &thread_stop, interval));

    match spawned {
        Ok(thread) => Some(Keepalive { stop, thread }),
        Err(e) => {
            warn!("Failed to start keepalive thread: {}", e);
            None
        }
    }
}

fn run_keepalive<T: Transport>(shared: &SharedTransport<T>, stop: &StopSignal, interval: Duration) {
    debug!("Keepalive every {:?}", interval);
    loop {
        let wait = match shared.blocking().cancel_on(stop).try_run(|t| t.keepalive()) {
            Ok(Some(next)) if !next.is_zero() => next.min(interval),
            Ok(Some(_)) => interval,
            Ok(None) => break,
            Err(e) => {
                warn!("Keepalive failed: {}", e);
                interval
            }
        };
        if stop.wait_timeout(wait) || shared.is_shutdown() {
            break;
        }
    }
    debug!("Keepalive stopped");
}
