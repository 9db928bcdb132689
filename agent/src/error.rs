use std::fmt;

use disruptor_netfilter::error::{AddrError, CleanupErrors, IpTablesError};

use crate::signal::Signal;

/// Every error the core can produce, matching the taxonomy in the error
/// handling design: validation, setup, runtime, lifecycle and cleanup
/// errors are each represented so callers (and test drivers) can
/// discriminate on them with `matches!`.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Configuration inconsistent; reported at construction, no side effects.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// A kernel rule add, address add, or listen failed.
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("setup failed: {0}")]
    IpTablesSetup(#[from] IpTablesError),

    #[error("setup failed: {0}")]
    AddrSetup(#[from] AddrError),

    /// Proxy transport error, queue read error, etc.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Another agent already holds the single-instance lock.
    #[error("agent already running (held by pid {0})")]
    LockContention(i32),

    /// A handled signal aborted the disruption window.
    #[error("received {0}")]
    SignalReceived(Signal),

    /// The caller's context was cancelled before the duration elapsed.
    #[error("context cancelled")]
    ContextCancelled,

    /// The disruption window elapsed without the proxy seeing any traffic.
    #[error("duration elapsed with zero requests received")]
    NoRequestsReceived,

    /// Rule removal or address deletion failed during teardown. Aggregated,
    /// never masked.
    #[error("cleanup error(s): {0}")]
    Cleanup(#[from] TeardownErrors),

    #[error("cleanup error(s): {0}")]
    RuleCleanup(#[from] CleanupErrors),
}

impl AgentError {
    /// True for the lifecycle family of errors (lock contention, signal,
    /// cancellation, zero-request timeout) a driver needs to discriminate
    /// from setup/runtime failures.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            AgentError::LockContention(_)
                | AgentError::SignalReceived(_)
                | AgentError::ContextCancelled
                | AgentError::NoRequestsReceived
        )
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Aggregates heterogeneous teardown failures (rule removal across
/// multiple rule sets, address removal, ...). Every step is attempted
/// regardless of earlier failures; nothing is masked.
#[derive(Debug, Default)]
pub struct TeardownErrors(pub Vec<String>);

impl TeardownErrors {
    pub fn push(&mut self, error: impl fmt::Display) {
        self.0.push(error.to_string());
    }

    pub fn into_result(self) -> Result<(), Self> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for TeardownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) during teardown: {}", self.0.len(), self.0.join("; "))
    }
}

impl std::error::Error for TeardownErrors {}
