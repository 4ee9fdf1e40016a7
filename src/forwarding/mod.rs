//! Port Forwarding Module
//!
//! Local, remote and dynamic (SOCKS5) tunnels over one shared SSH transport.
//! Every tunnel owns an acceptance thread plus one thread per live
//! connection; all transport access goes through the session's
//! [`SharedTransport`](crate::ssh::SharedTransport).

mod context;
pub mod local;
pub mod manager;
pub mod pump;
pub mod remote;
pub mod socks5;

pub use context::ConnectionContext;
pub use local::TunnelListener;
pub use manager::{
    ErrorVerbosity, ForwardStats, TunnelHandle, TunnelInfo, TunnelKey, TunnelKind, TunnelRegistry,
    TunnelStats, TunnelStatus, DEFAULT_BIND_ADDR,
};
pub use pump::{ForwardingPump, PumpExit, PumpReport};
pub use remote::RemoteTunnelWorker;
pub use socks5::{negotiate as socks5_negotiate, Socks5Error, SocksTarget};
