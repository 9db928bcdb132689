use std::{fmt::Debug, process::Stdio};

use tracing::Level;

use crate::error::IpTablesError;

/// Abstraction over the host packet-filter CLI (`iptables`/`ip6tables`).
///
/// Kept as a trait, mockable in tests, so [`crate::RuleSet`] and its callers
/// never shell out directly.
#[cfg_attr(test, mockall::automock)]
pub trait IpTablesCli: Debug + Send + Sync {
    /// Runs `<bin> -t <table> -A <chain> <args>`.
    fn add(&self, table: &str, chain: &str, args: &str) -> Result<(), IpTablesError>;

    /// Runs `<bin> -t <table> -D <chain> <args>`.
    fn remove(&self, table: &str, chain: &str, args: &str) -> Result<(), IpTablesError>;
}

/// Shells out to the real `iptables` binary (or `iptables-legacy` /
/// `ip6tables`, depending on construction).
#[derive(Debug, Clone)]
pub struct ShellIpTables {
    binary: &'static str,
}

impl ShellIpTables {
    pub const fn new(binary: &'static str) -> Self {
        Self { binary }
    }

    pub fn ipv4() -> Self {
        Self::new("iptables")
    }

    pub fn ipv6() -> Self {
        Self::new("ip6tables")
    }

    #[tracing::instrument(level = Level::TRACE, ret, err)]
    fn run(&self, table: &str, action: &str, chain: &str, args: &str) -> Result<(), IpTablesError> {
        let mut argv = vec!["-t", table, action, chain];
        argv.extend(args.split_whitespace());

        let command_repr = format!("{} {}", self.binary, argv.join(" "));

        let output = std::process::Command::new(self.binary)
            .args(&argv)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| IpTablesError::Spawn {
                command: command_repr.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(IpTablesError::CommandFailed {
                command: command_repr,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(())
    }
}

impl IpTablesCli for ShellIpTables {
    fn add(&self, table: &str, chain: &str, args: &str) -> Result<(), IpTablesError> {
        self.run(table, "-A", chain, args)
    }

    fn remove(&self, table: &str, chain: &str, args: &str) -> Result<(), IpTablesError> {
        self.run(table, "-D", chain, args)
    }
}

