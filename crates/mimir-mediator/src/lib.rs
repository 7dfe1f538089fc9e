//! # mimir-mediator
//!
//! The mediator client (Section 4.6, C6) and mediator manager (Section
//! 4.7, C7): a single persistent multiplexed request/response session to
//! one mediator, and a keyed pool of such sessions with reconnect,
//! resubscribe-and-backfill, and push routing.

mod client;
mod manager;
mod wire;

pub use client::{MediatorClient, PROOF_OF_WORK_PREFIX_ZERO_BYTES};
pub use manager::MediatorManager;

/// Errors raised by the mediator client and manager. Recovery policy
/// matches Section 7.
#[derive(Debug, thiserror::Error)]
pub enum MediatorError {
    /// A payload failed to decode.
    #[error("malformed mediator payload: {0}")]
    Malformed(&'static str),

    /// The underlying connection failed.
    #[error("mediator connection error: {0}")]
    Io(String),

    /// The mediator replied with an `ERR` status.
    #[error("mediator rejected request: {0}")]
    Rejected(String),

    /// The 10s request deadline elapsed, or the session disconnected
    /// while the request was in flight.
    #[error("mediator request timed out or connection closed")]
    Timeout,

    /// The session is not currently connected.
    #[error("mediator client not running")]
    NotRunning,

    /// The authentication handshake failed.
    #[error("mediator authentication failed")]
    AuthFail,

    /// A Storage collaborator call failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A chat was referenced that Storage has no record of.
    #[error("unknown chat: {0}")]
    UnknownChat(u64),

    /// An assembler call failed while applying an inbound message.
    #[error("assembler error: {0}")]
    Assembler(String),
}

impl From<mimir_codec::FrameError> for MediatorError {
    fn from(e: mimir_codec::FrameError) -> Self {
        match e {
            mimir_codec::FrameError::Io(io) => MediatorError::Io(io.to_string()),
            other => MediatorError::Io(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MediatorError>;
