//! Error types for the socket shim and its stack engines.

use crate::config::ShimConfig;
use crate::connection::{ConnectionId, ConnectionState};
use thiserror::Error;

/// Errors reported by a stack engine.
///
/// The shim passes these through untouched; it never retries or
/// reinterprets them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine socket table exhausted")]
    Exhausted,

    #[error("unknown engine socket")]
    UnknownSocket,

    #[error("operation not supported for this socket type")]
    Unsupported,

    #[error("socket is not connected")]
    NotConnected,

    #[error("socket is closed")]
    Closed,

    #[error("engine rejected the request: {0}")]
    Rejected(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Shim errors.
#[derive(Debug, Error)]
pub enum ShimError {
    #[error("no stack engine available")]
    EngineUnavailable,

    #[error("invalid connection: {0}")]
    InvalidConnection(ConnectionId),

    #[error("{op} not allowed on {id} in state {state}")]
    InvalidState {
        id: ConnectionId,
        state: ConnectionState,
        op: &'static str,
    },

    #[error("malformed Ethernet frame ({len} bytes)")]
    MalformedFrame { len: usize },

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn interface thread: {0}")]
    Spawn(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ShimError {
    /// Integer code for callers that speak BSD-style return values.
    ///
    /// Every failure collapses onto the configured general failure code;
    /// engine errors are not interpreted at this layer.
    pub fn code(&self, config: &ShimConfig) -> i32 {
        config.general_failure_code
    }

    /// True if the error means no engine is configured.
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(self, ShimError::EngineUnavailable)
    }
}

pub type Result<T> = std::result::Result<T, ShimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_passthrough() {
        let err: ShimError = EngineError::Rejected("port in use".to_string()).into();
        match err {
            ShimError::Engine(EngineError::Rejected(msg)) => assert_eq!(msg, "port in use"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_error_code_uses_config() {
        let config = ShimConfig {
            general_failure_code: -88,
            ..ShimConfig::default()
        };
        assert_eq!(ShimError::EngineUnavailable.code(&config), -88);
        assert_eq!(
            ShimError::MalformedFrame { len: 3 }.code(&config),
            -88
        );
        assert!(ShimError::EngineUnavailable.is_engine_unavailable());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = ShimError::InvalidState {
            id: ConnectionId::new(3, 1),
            state: ConnectionState::Unbound,
            op: "listen",
        };
        assert_eq!(
            err.to_string(),
            "listen not allowed on conn#3.1 in state UNBOUND"
        );
    }
}
