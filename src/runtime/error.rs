//! Error types for the request-processing runtime
//!
//! Domain errors use thiserror; binaries and config loading convert them to
//! anyhow at the boundary.

use std::io;
use thiserror::Error;

use crate::interpreter::CompileError;

use super::state::{BackendState, FrontendState};

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The policy failed to compile
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// A state machine attempted a transition its table forbids
    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    /// A compiled subroutine failed while executing
    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),

    /// Writing to or reading from a transport failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Illegal phase changes. These indicate a table or compiler bug and abort
/// the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// Frontend phase change not present in the legal-transition table
    #[error("illegal frontend transition {from:?} -> {to:?}")]
    Frontend {
        /// Phase being left
        from: FrontendState,
        /// Phase requested
        to: FrontendState,
    },

    /// Backend phase change not present in the legal-transition table
    #[error("illegal backend transition {from:?} -> {to:?}")]
    Backend {
        /// Phase being left
        from: BackendState,
        /// Phase requested
        to: BackendState,
    },

    /// A hook returned an action that names no phase on this side
    #[error("hook {hook} returned {action}, which is not a valid {side} phase")]
    UnmappedAction {
        /// Hook that produced the action
        hook: &'static str,
        /// DSL name of the returned action
        action: &'static str,
        /// "frontend" or "backend"
        side: &'static str,
    },
}

/// Failures raised while executing compiled subroutine code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// Integer division or modulo by zero
    #[error("division by zero")]
    DivisionByZero,

    /// Integer arithmetic overflowed
    #[error("arithmetic overflow")]
    Overflow,

    /// A string could not be parsed as an IP address for an ACL match
    #[error("'{0}' is not a valid IP address")]
    InvalidAddress(String),

    /// Assignment to an object that does not exist in the current phase
    #[error("{0} is not available in this phase")]
    Unavailable(&'static str),

    /// A value had an unexpected runtime type
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Expected type name
        expected: &'static str,
        /// Actual type name
        found: &'static str,
    },

    /// Call to a subroutine index that the program does not contain
    #[error("subroutine #{0} does not exist")]
    MissingSubroutine(usize),

    /// Nested `call` statements exceeded the recursion limit
    #[error("call depth exceeded {0}")]
    CallDepth(usize),
}

/// Convenience result alias for evaluation
pub type EvalResult<T> = std::result::Result<T, EvalError>;

/// Transport-level failures (outbound fetches, probe requests, response writes)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connecting to the backend failed or timed out
    #[error("connect to {backend} failed: {detail}")]
    Connect {
        /// Backend name
        backend: String,
        /// Error details
        detail: String,
    },

    /// A timeout expired while waiting for the response
    #[error("{phase} timeout after {millis}ms")]
    Timeout {
        /// Which timeout fired ("first byte", "between bytes", "probe")
        phase: &'static str,
        /// Configured duration
        millis: u128,
    },

    /// The request could not be built
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Any other HTTP-level failure
    #[error("http error: {0}")]
    Http(String),

    /// Writing the response back to the client failed
    #[error("response write failed: {0}")]
    Write(String),
}

/// Convenience result alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
