//! OxideForward - SSH channel multiplexing and port forwarding
//!
//! Runs local (-L), remote (-R) and dynamic SOCKS5 (-D) tunnels over a single
//! non-blocking SSH transport shared by many threads.
//!
//! ```no_run
//! # fn demo<T: oxideforward::ssh::Transport>(transport: T) -> Result<(), oxideforward::ssh::SshError> {
//! use oxideforward::ssh::{SessionConfig, SshSession, TunnelOptions};
//!
//! let session = SshSession::new(transport, SessionConfig::default());
//! let port = session.local_tunnel(0, "db.internal", 5432, TunnelOptions::default())?;
//! println!("postgres reachable on 127.0.0.1:{}", port);
//! session.exit();
//! # Ok(())
//! # }
//! ```

pub mod forwarding;
pub mod ssh;

pub use forwarding::{ErrorVerbosity, ForwardStats, TunnelInfo, TunnelKey, TunnelKind, TunnelRegistry};
pub use ssh::{SessionConfig, SharedTransport, SshError, SshSession, Transport, TunnelOptions};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
