//! Error taxonomy for the bridge.
//!
//! Would-block is deliberately absent: it is an outcome of a pipe operation
//! (see [`crate::bridge::chunk::FillOutcome`] and
//! [`crate::bridge::chunk::WriteOutcome`]), never a failure.

use std::fmt;

/// Which of the two pipes an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    /// Bridge → filter stdin.
    ToLambda,
    /// Filter stdout → bridge.
    FromLambda,
}

impl fmt::Display for PipeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeDirection::ToLambda => f.write_str("filter stdin"),
            PipeDirection::FromLambda => f.write_str("filter stdout"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Pipe or process creation failed. Aborts bridge construction.
    #[error("failed to spawn filter `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A pipe operation failed with something other than would-block.
    #[error("I/O error on {pipe}: {source}")]
    Io {
        pipe: PipeDirection,
        #[source]
        source: std::io::Error,
    },

    /// Zero-length read after the descriptor was reported readable: the
    /// filter closed its stdout or died.
    #[error("{pipe} closed after readiness was signalled (filter exited?)")]
    ProtocolViolation { pipe: PipeDirection },

    /// PipeWire (or one of its endpoints) is unavailable.
    #[error("PipeWire connection failed: {0}")]
    DeviceConnection(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn io(pipe: PipeDirection, source: std::io::Error) -> Self {
        BridgeError::Io { pipe, source }
    }

    /// The pipe this error is attributed to, if any.
    pub fn pipe(&self) -> Option<PipeDirection> {
        match self {
            BridgeError::Io { pipe, .. } | BridgeError::ProtocolViolation { pipe } => Some(*pipe),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_attribution() {
        let err = BridgeError::ProtocolViolation {
            pipe: PipeDirection::FromLambda,
        };
        assert_eq!(err.pipe(), Some(PipeDirection::FromLambda));
        assert!(err.to_string().contains("filter stdout"));

        let err = BridgeError::io(
            PipeDirection::ToLambda,
            std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        );
        assert_eq!(err.pipe(), Some(PipeDirection::ToLambda));
        assert!(err.to_string().contains("filter stdin"));

        assert_eq!(BridgeError::Config("x".into()).pipe(), None);
    }
}
