//! Per-tunnel connection context
//!
//! Everything a connection thread needs, fixed at tunnel creation and shared
//! read-only by the acceptance loop and every connection it spawns.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::manager::{ErrorVerbosity, TunnelKey, TunnelStats};
use crate::ssh::{SessionConfig, SharedTransport, SshError, StopSignal, Transport};

pub struct ConnectionContext<T: Transport> {
    pub shared: Arc<SharedTransport<T>>,
    pub key: TunnelKey,
    pub stop: StopSignal,
    pub verbosity: ErrorVerbosity,
    pub stats: Arc<TunnelStats>,
}

impl<T: Transport> ConnectionContext<T> {
    pub fn new(
        shared: Arc<SharedTransport<T>>,
        key: TunnelKey,
        stop: StopSignal,
        verbosity: ErrorVerbosity,
        stats: Arc<TunnelStats>,
    ) -> Self {
        Self {
            shared,
            key,
            stop,
            verbosity,
            stats,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        self.shared.config()
    }

    /// Tunnel stopped or session going away
    pub fn should_stop(&self) -> bool {
        self.stop.is_set() || self.shared.is_shutdown()
    }

    /// Open a `direct-tcpip` channel to `host:port`, giving up when the
    /// tunnel stops
    pub fn open_channel(&self, host: &str, port: u16, originator: Option<SocketAddr>) -> Result<T::Channel, SshError> {
        self.shared
            .blocking()
            .cancel_on(&self.stop)
            .run(|t| t.open_direct_tcpip(host, port, originator))
            .map_err(|e| match e {
                SshError::Cancelled | SshError::Disconnected => e,
                other => SshError::ChannelError(format!("Failed to open channel to {}:{}: {}", host, port, other)),
            })
    }

    pub fn apply_socket_options(&self, stream: &TcpStream) {
        if self.config().tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }
        }
    }

    /// Report a connection or listener error according to the tunnel's
    /// verbosity, terminating the tunnel when the policy asks for it.
    pub fn report(&self, what: &str, err: &SshError) {
        if matches!(err, SshError::Cancelled | SshError::Disconnected) {
            debug!(tunnel = %self.key, "{}: {}", what, err);
            return;
        }

        match self.verbosity {
            ErrorVerbosity::Silent => {}
            ErrorVerbosity::Warn => warn!(tunnel = %self.key, "{}: {}", what, err),
            ErrorVerbosity::Debug => warn!(tunnel = %self.key, error = ?err, "{}: {}", what, err),
            ErrorVerbosity::Fatal => error!(tunnel = %self.key, "{}: {}", what, err),
        }

        if self.verbosity.terminates() || self.config().auto_terminate_tunnels {
            if !self.stop.is_set() {
                info!("Terminating tunnel {} after error", self.key);
            }
            self.stop.set();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::test_support::LoopbackTransport;

    fn context(verbosity: ErrorVerbosity, config: SessionConfig) -> ConnectionContext<LoopbackTransport> {
        ConnectionContext::new(
            Arc::new(SharedTransport::new(LoopbackTransport::new(), config)),
            TunnelKey::dynamic(1080),
            StopSignal::new(),
            verbosity,
            Arc::new(TunnelStats::default()),
        )
    }

    #[test]
    fn test_warn_keeps_tunnel_running() {
        let ctx = context(ErrorVerbosity::Warn, SessionConfig::default());
        ctx.report("connection", &SshError::ChannelError("refused".into()));
        assert!(!ctx.stop.is_set());
    }

    #[test]
    fn test_fatal_stops_tunnel() {
        let ctx = context(ErrorVerbosity::Fatal, SessionConfig::default());
        ctx.report("connection", &SshError::ChannelError("refused".into()));
        assert!(ctx.stop.is_set());
        assert!(ctx.should_stop());
    }

    #[test]
    fn test_auto_terminate_overrides_silent() {
        let ctx = context(
            ErrorVerbosity::Silent,
            SessionConfig::default().with_auto_terminate_tunnels(true),
        );
        ctx.report("connection", &SshError::ChannelError("refused".into()));
        assert!(ctx.stop.is_set());
    }

    #[test]
    fn test_cancellation_is_not_an_error() {
        let ctx = context(ErrorVerbosity::Fatal, SessionConfig::default());
        ctx.report("connection", &SshError::Cancelled);
        assert!(!ctx.stop.is_set());
    }
}
