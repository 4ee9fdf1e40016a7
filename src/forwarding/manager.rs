//! Tunnel Registry
//!
//! Keeps every tunnel of one session keyed by its configuration, so opening
//! the same tunnel twice returns the existing one. Provides lifecycle
//! management (stop + join), liveness and statistics.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::context::ConnectionContext;
use super::local::{bind_listener, TunnelListener};
use super::remote::RemoteTunnelWorker;
use crate::ssh::{SharedTransport, SshError, StopSignal, Transport};

/// Address local and dynamic tunnels bind to unless told otherwise
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";

/// Forward statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Total connection count
    pub connection_count: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Total bytes sent (local -> remote)
    pub bytes_sent: u64,
    /// Total bytes received (remote -> local)
    pub bytes_received: u64,
}

/// Live counters of one tunnel, updated from its connection threads
#[derive(Debug, Default)]
pub struct TunnelStats {
    connection_count: AtomicU64,
    active_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TunnelStats {
    pub fn connection_opened(&self) {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn add_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn to_stats(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Type of tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    /// Local port forwarding (-L)
    Local,
    /// Remote port forwarding (-R)
    Remote,
    /// Dynamic SOCKS proxy (-D)
    Dynamic,
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelKind::Local => "local",
            TunnelKind::Remote => "remote",
            TunnelKind::Dynamic => "dynamic",
        };
        f.write_str(name)
    }
}

/// What a tunnel does with connection-handling errors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorVerbosity {
    /// Drop the error
    Silent,
    /// One-line warning
    #[default]
    Warn,
    /// Warning with full error detail
    Debug,
    /// Error log, then terminate the tunnel
    Fatal,
}

impl ErrorVerbosity {
    pub fn terminates(self) -> bool {
        self == ErrorVerbosity::Fatal
    }
}

/// Identity of a tunnel.
///
/// `local_port` is the listening port: on this host for local and dynamic
/// tunnels, on the remote peer for remote tunnels. `remote_host` and
/// `remote_port` name the target (absent for dynamic tunnels).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelKey {
    pub kind: TunnelKind,
    pub bind_addr: String,
    pub local_port: u16,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
}

impl TunnelKey {
    pub fn local(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            kind: TunnelKind::Local,
            bind_addr: DEFAULT_BIND_ADDR.into(),
            local_port,
            remote_host: Some(remote_host.into()),
            remote_port: Some(remote_port),
        }
    }

    /// Remote peer listens on `local_port`; connections go to `remote_host:remote_port` on this side
    pub fn remote(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            kind: TunnelKind::Remote,
            ..Self::local(local_port, remote_host, remote_port)
        }
    }

    pub fn dynamic(local_port: u16) -> Self {
        Self {
            kind: TunnelKind::Dynamic,
            bind_addr: DEFAULT_BIND_ADDR.into(),
            local_port,
            remote_host: None,
            remote_port: None,
        }
    }

    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    fn with_local_port(mut self, local_port: u16) -> Self {
        self.local_port = local_port;
        self
    }

    /// Connection target, absent for dynamic tunnels
    pub fn target(&self) -> Option<(&str, u16)> {
        self.remote_host.as_deref().zip(self.remote_port)
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.bind_addr, self.local_port)?;
        if let Some((host, port)) = self.target() {
            write!(f, ":{}:{}", host, port)?;
        }
        Ok(())
    }
}

/// Status of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    /// Accepting connections
    Active,
    /// Listener thread has exited
    Stopped,
}

/// Snapshot of one tunnel (for listing)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub id: Uuid,
    pub key: TunnelKey,
    /// Local listening address (local and dynamic tunnels)
    pub listen_addr: Option<SocketAddr>,
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
    pub stats: ForwardStats,
}

/// Handle to a running tunnel
pub struct TunnelHandle {
    id: Uuid,
    key: TunnelKey,
    listen_addr: Option<SocketAddr>,
    stop: StopSignal,
    thread: JoinHandle<()>,
    stats: Arc<TunnelStats>,
    created_at: DateTime<Utc>,
}

impl TunnelHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &TunnelKey {
        &self.key
    }

    /// Port actually listening (resolved when 0 was requested)
    pub fn bound_port(&self) -> u16 {
        self.key.local_port
    }

    pub fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Signal the tunnel to stop; returns immediately
    pub fn stop(&self) {
        self.stop.set();
    }

    /// Wait for the listener thread, which joins its connection threads first
    pub fn join(self) {
        if self.thread.join().is_err() {
            error!("Tunnel {} thread panicked", self.key);
        }
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id,
            key: self.key.clone(),
            listen_addr: self.listen_addr,
            status: if self.is_alive() {
                TunnelStatus::Active
            } else {
                TunnelStatus::Stopped
            },
            created_at: self.created_at,
            stats: self.stats.to_stats(),
        }
    }
}

/// Registry of all tunnels of one session
pub struct TunnelRegistry<T: Transport> {
    shared: Arc<SharedTransport<T>>,
    tunnels: DashMap<TunnelKey, TunnelHandle>,
    /// Serializes open and shutdown so a key is never started twice
    gate: Mutex<()>,
}

impl<T: Transport> TunnelRegistry<T> {
    pub fn new(shared: Arc<SharedTransport<T>>) -> Self {
        Self {
            shared,
            tunnels: DashMap::new(),
            gate: Mutex::new(()),
        }
    }

    /// Forward `bind_addr:local_port` here to `remote_host:remote_port` via the
    /// remote peer. Returns the bound local port.
    pub fn open_local(
        &self,
        bind_addr: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        verbosity: ErrorVerbosity,
    ) -> Result<u16, SshError> {
        let key = TunnelKey::local(local_port, remote_host, remote_port).with_bind_addr(bind_addr);
        self.open(key, verbosity)
    }

    /// Have the remote peer listen on `bind_addr:remote_listen_port` and send
    /// connections to `local_host:local_port` on this side. The peer-side
    /// port is visible through [`TunnelRegistry::list`].
    pub fn open_remote(
        &self,
        bind_addr: &str,
        remote_listen_port: u16,
        local_host: &str,
        local_port: u16,
        verbosity: ErrorVerbosity,
    ) -> Result<(), SshError> {
        let key = TunnelKey::remote(remote_listen_port, local_host, local_port).with_bind_addr(bind_addr);
        self.open(key, verbosity).map(|_| ())
    }

    /// SOCKS5 proxy on `bind_addr:local_port`. Returns the bound local port.
    pub fn open_dynamic(&self, bind_addr: &str, local_port: u16, verbosity: ErrorVerbosity) -> Result<u16, SshError> {
        let key = TunnelKey::dynamic(local_port).with_bind_addr(bind_addr);
        self.open(key, verbosity)
    }

    fn open(&self, requested: TunnelKey, verbosity: ErrorVerbosity) -> Result<u16, SshError> {
        if self.shared.is_shutdown() {
            return Err(SshError::Disconnected);
        }
        let _gate = self.gate.lock();
        // close_all may have drained the registry while we waited for the gate
        if self.shared.is_shutdown() {
            return Err(SshError::Disconnected);
        }

        if let Some(port) = self.reuse(&requested) {
            debug!("Tunnel {} already open", requested);
            return Ok(port);
        }

        let stop = StopSignal::new();
        let stats = Arc::new(TunnelStats::default());
        let context = |key: &TunnelKey| {
            Arc::new(ConnectionContext::new(
                self.shared.clone(),
                key.clone(),
                stop.clone(),
                verbosity,
                stats.clone(),
            ))
        };

        let (key, listen_addr, thread) = match requested.kind {
            TunnelKind::Local | TunnelKind::Dynamic => {
                let listener = bind_listener(&requested.bind_addr, requested.local_port)?;
                let addr = listener.local_addr()?;
                let key = requested.with_local_port(addr.port());
                let thread = TunnelListener::new(context(&key), listener).spawn()?;
                (key, Some(addr), thread)
            }
            TunnelKind::Remote => {
                let (listener, bound) = self
                    .shared
                    .blocking()
                    .run(|t| t.request_remote_forward(&requested.bind_addr, requested.local_port))
                    .map_err(|e| match e {
                        SshError::ProtocolError(msg) | SshError::ChannelError(msg) => SshError::ConnectionFailed(
                            format!("Remote forward request for {}:{} rejected: {}", requested.bind_addr, requested.local_port, msg),
                        ),
                        other => other,
                    })?;
                let key = requested.with_local_port(bound);
                let thread = RemoteTunnelWorker::new(context(&key), listener).spawn()?;
                (key, None, thread)
            }
        };

        info!("Tunnel {} started", key);
        let port = key.local_port;
        self.tunnels.insert(
            key.clone(),
            TunnelHandle {
                id: Uuid::new_v4(),
                key,
                listen_addr,
                stop,
                thread,
                stats,
                created_at: Utc::now(),
            },
        );
        Ok(port)
    }

    /// Port of a live tunnel under `key`. A dead one is cleared out so the
    /// caller can start it again.
    fn reuse(&self, key: &TunnelKey) -> Option<u16> {
        let alive = self.tunnels.get(key).map(|handle| handle.is_alive())?;
        if alive {
            return Some(key.local_port);
        }
        if let Some((_, handle)) = self.tunnels.remove(key) {
            debug!("Replacing stopped tunnel {}", key);
            handle.join();
        }
        None
    }

    pub fn is_alive(&self, key: &TunnelKey) -> bool {
        self.tunnels.get(key).is_some_and(|handle| handle.is_alive())
    }

    /// Stop one tunnel and wait for all of its threads. Returns false if no
    /// such tunnel exists.
    pub fn shutdown(&self, key: &TunnelKey) -> bool {
        let _gate = self.gate.lock();
        let Some((_, handle)) = self.tunnels.remove(key) else {
            return false;
        };
        info!("Stopping tunnel {}", key);
        handle.stop();
        handle.join();
        true
    }

    /// Stop every tunnel, then wait for all of them
    pub fn close_all(&self) {
        let _gate = self.gate.lock();
        let keys: Vec<TunnelKey> = self.tunnels.iter().map(|entry| entry.key().clone()).collect();
        let handles: Vec<TunnelHandle> = keys
            .iter()
            .filter_map(|key| self.tunnels.remove(key).map(|(_, handle)| handle))
            .collect();

        if !handles.is_empty() {
            info!("Stopping {} tunnels", handles.len());
        }
        for handle in &handles {
            handle.stop();
        }
        for handle in handles {
            handle.join();
        }
    }

    pub fn stats(&self, key: &TunnelKey) -> Option<ForwardStats> {
        self.tunnels.get(key).map(|handle| handle.stats.to_stats())
    }

    pub fn list(&self) -> Vec<TunnelInfo> {
        let mut tunnels: Vec<TunnelInfo> = self.tunnels.iter().map(|entry| entry.value().info()).collect();
        tunnels.sort_by_key(|info| info.created_at);
        tunnels
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}
