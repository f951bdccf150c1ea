//! The transport error taxonomy.
//!
//! Every driver operation that can fail returns one of these kinds; the
//! display text is also retained on the owning handle as its last error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("cannot resolve hostname {0}")]
    ResolveHostname(String),
    #[error("no reserved port available in {lo}..={hi}")]
    ReservedPortUnavailable { lo: u16, hi: u16 },
    #[error("peer not authenticated: {0}")]
    PeerUnauthenticated(String),
    #[error("peer hostname mismatch: {0}")]
    PeerHostnameMismatch(String),
    #[error("peer certificate fingerprint not on the allow-list ({0})")]
    FingerprintRejected(String),
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),
    #[error("malformed packet header: {0}")]
    MalformedHeader(String),
    #[error("frame payload of {0} bytes outside the permitted range")]
    FrameOversize(usize),
    #[error("peer closed the connection")]
    PeerEof,
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("timed out waiting for ACK")]
    AckTimeout,
    #[error("timed out waiting for reply")]
    ReplyTimeout,
    #[error("could not spawn service: {0}")]
    ChildSpawnFailed(String),
    #[error("service pid {pid} exited with code {code}")]
    ChildExitedNonZero { pid: u32, code: i32 },
    #[error("service pid {pid} killed by signal {signal}")]
    ChildSignalled { pid: u32, signal: i32 },
    #[error("write failed: {0}")]
    WriteError(String),
    #[error("read failed: {0}")]
    ReadError(String),
    #[error("operation not supported by the {0} driver")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, SecurityError>;

impl SecurityError {
    pub(crate) fn read(err: impl std::fmt::Display) -> SecurityError {
        SecurityError::ReadError(err.to_string())
    }

    pub(crate) fn write(err: impl std::fmt::Display) -> SecurityError {
        SecurityError::WriteError(err.to_string())
    }
}

impl From<bh_protocol::ProtocolError> for SecurityError {
    fn from(err: bh_protocol::ProtocolError) -> SecurityError {
        SecurityError::MalformedHeader(err.to_string())
    }
}

impl From<bh_protocol::FrameError> for SecurityError {
    fn from(err: bh_protocol::FrameError) -> SecurityError {
        match err {
            bh_protocol::FrameError::Oversize(n) => SecurityError::FrameOversize(n),
            bh_protocol::FrameError::Io(e) => SecurityError::ReadError(e.to_string()),
        }
    }
}
