use std::fmt;

use crate::Rule;

/// Errors raised by a single packet-filter CLI invocation.
#[derive(Debug, thiserror::Error)]
pub enum IpTablesError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Errors raised by `ip addr add`/`ip addr del`.
#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Every rule a [`crate::RuleSet`] failed to remove during teardown.
///
/// Teardown never short-circuits on the first failure, so this aggregates
/// all of them; the caller still sees the first one via [`fmt::Display`].
#[derive(Debug)]
pub struct CleanupErrors(pub Vec<(Rule, IpTablesError)>);

impl fmt::Display for CleanupErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some((rule, first)) = self.0.first() else {
            return write!(f, "no cleanup errors");
        };

        write!(
            f,
            "{} error(s) during rule cleanup, first: removing {rule:?}: {first}",
            self.0.len()
        )
    }
}

impl std::error::Error for CleanupErrors {}
