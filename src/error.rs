//! Crate-wide error type.
//!
//! Every fallible boundary in `nascorefuzz` returns `Result<T, Error>`. The
//! variants mirror the fault taxonomy the fuzz driver classifies errors
//! into before deciding whether to retry, abandon a round, or propagate.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("socket error talking to {peer}: {source}")]
    Socket { peer: String, source: io::Error },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("alignment failed at step {step}: {reason}")]
    Alignment { step: usize, reason: String },

    #[error("control-plane error: {0}")]
    Ctrl(String),

    #[error("corpus error: {0}")]
    Corpus(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn socket(peer: impl Into<String>, source: io::Error) -> Self {
        Error::Socket {
            peer: peer.into(),
            source,
        }
    }

    pub fn alignment(step: usize, reason: impl Into<String>) -> Self {
        Error::Alignment {
            step,
            reason: reason.into(),
        }
    }

    /// True for errors the fuzz driver should treat as transient and retry
    /// rather than abandon the round over.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ),
            Error::Socket { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            Error::Protocol(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
