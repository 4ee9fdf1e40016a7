//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// The session-wide shutdown signal is set; no further transport I/O
    #[error("Disconnected")]
    Disconnected,

    /// The tunnel's termination signal fired while the call was waiting
    #[error("Cancelled")]
    Cancelled,
}

impl SshError {
    /// Errors that mean the session itself is gone rather than one connection
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, SshError::Disconnected | SshError::ProtocolError(_))
    }
}

#[cfg(feature = "libssh2")]
impl From<ssh2::Error> for SshError {
    fn from(err: ssh2::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}
