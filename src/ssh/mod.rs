//! SSH module - shared session transport and everything built on it
//!
//! The engine drives a single non-blocking SSH transport from many threads.
//!
//! # Features
//! - Serialized, retrying transport calls (`SharedTransport`, `BlockingCall`)
//! - Chunked channel reads (`ChunkStream`)
//! - Session lifecycle with keepalive and orderly tunnel teardown (`SshSession`)
//! - Optional libssh2 transport (`libssh2` feature)

mod blocking;
mod chunks;
mod config;
mod error;
#[cfg(feature = "libssh2")]
mod libssh2;
pub mod readiness;
mod session;
mod signal;
mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use blocking::{BlockingCall, SharedTransport};
pub use chunks::{ChunkStream, ReadMode};
pub use config::SessionConfig;
pub use error::SshError;
#[cfg(feature = "libssh2")]
pub use libssh2::{Libssh2Channel, Libssh2Listener, Libssh2Transport};
pub use session::{SshSession, TunnelOptions};
pub use signal::StopSignal;
pub use transport::{Attempt, Channel, ForwardListener, IoDirection, Transport};
