//! Signal handling as control flow: an async event source yielding the
//! signal value, meant to be raced in the same `select!` that waits on a
//! duration timer and a cancellation token.

use std::fmt;

use tokio::signal::unix::{signal, SignalKind};

use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Hangup,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Hangup => "SIGHUP",
        };
        write!(f, "{name}")
    }
}

/// Registers a notification channel for `SIGINT`, `SIGTERM` and `SIGHUP`.
pub struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

impl Signals {
    pub fn register() -> AgentResult<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())
                .map_err(|error| AgentError::Setup(format!("registering SIGINT handler: {error}")))?,
            terminate: signal(SignalKind::terminate())
                .map_err(|error| AgentError::Setup(format!("registering SIGTERM handler: {error}")))?,
            hangup: signal(SignalKind::hangup())
                .map_err(|error| AgentError::Setup(format!("registering SIGHUP handler: {error}")))?,
        })
    }

    /// Resolves to whichever registered signal arrives first.
    pub async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.interrupt.recv() => Signal::Interrupt,
            _ = self.terminate.recv() => Signal::Terminate,
            _ = self.hangup.recv() => Signal::Hangup,
        }
    }
}
