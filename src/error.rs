//! Error taxonomy and fatal escape hatches
//!
//! Design: recoverable failures are `BridgeError` values returned through
//! `Result`. Unrecoverable ones (a broken engine, a violated toggle
//! invariant) go through a `Terminator` owned by the context so embedders
//! decide how the process ends.

use crate::interop::{LoadError, SymbolError};
use tracing::error;

/// Errors surfaced at the invocation boundary
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Fewer script arguments than the callable needs
    #[error("Too few arguments to {function}: expected {expected}, got {got}")]
    Arity {
        function: String,
        expected: usize,
        got: usize,
    },

    /// A single value failed conversion
    #[error("{0}")]
    Type(String),

    /// The descriptor uses a construct the bridge cannot express
    #[error("{0}")]
    Unsupported(String),

    /// The callee reported failure through its own error channel
    #[error("{message}")]
    Native {
        domain: u32,
        code: i32,
        message: String,
    },

    /// Exception thrown by script code
    #[error("{0}")]
    Thrown(String),

    /// Nothing is pending to report; the engine cannot continue
    #[error("uncatchable exception (exit code {exit_code:?})")]
    Uncatchable { exit_code: Option<i32> },

    #[error("unable to resolve native symbol {0}")]
    Unresolved(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Symbol(#[from] SymbolError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// False only when the engine itself is compromised
    #[inline]
    pub fn is_catchable(&self) -> bool {
        !matches!(self, Self::Uncatchable { .. })
    }

    /// Whether the callee's error channel produced this error
    #[inline]
    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native { .. })
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Ends the process on unrecoverable conditions
///
/// Implementations normally never return. When one does (recording
/// terminators in tests, embedders that unwind elsewhere), the caller
/// continues with a safe no-op.
pub trait Terminator: Send + Sync {
    /// Engine can no longer report errors, or script requested exit
    fn exit(&self, code: i32);

    /// Toggle consistency violation
    fn abort(&self, reason: &str);
}

/// Default terminator: log, then end the process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn exit(&self, code: i32) {
        error!(event = "terminate", code, "Exiting after uncatchable exception");
        std::process::exit(code);
    }

    fn abort(&self, reason: &str) {
        error!(event = "abort", reason, "Toggle consistency violation");
        std::process::abort();
    }
}

/// Records termination requests instead of acting on them
///
/// For tests, and for embedders that unwind the engine elsewhere.
#[derive(Debug, Default)]
pub struct RecordingTerminator {
    exits: parking_lot::Mutex<Vec<i32>>,
    aborts: parking_lot::Mutex<Vec<String>>,
}

impl RecordingTerminator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exits(&self) -> Vec<i32> {
        self.exits.lock().clone()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.aborts.lock().clone()
    }
}

impl Terminator for RecordingTerminator {
    fn exit(&self, code: i32) {
        self.exits.lock().push(code);
    }

    fn abort(&self, reason: &str) {
        self.aborts.lock().push(reason.to_string());
    }
}
