//! Adding/removing the `local_address/32` that the interceptor needs on its
//! interface so the proxy can dial the target by its external IP.

use std::{fmt::Debug, process::Stdio};

use tracing::Level;

use crate::error::AddrError;

/// Abstraction over `ip addr add`/`ip addr del`, mockable in tests.
#[cfg_attr(test, mockall::automock)]
pub trait AddrCli: Debug + Send + Sync {
    fn add(&self, address: &str, interface: &str) -> Result<(), AddrError>;
    fn remove(&self, address: &str, interface: &str) -> Result<(), AddrError>;
}

/// Shells out to `ip addr add <address>/32 dev <interface>`.
#[derive(Debug, Clone, Default)]
pub struct ShellAddr;

impl ShellAddr {
    #[tracing::instrument(level = Level::TRACE, ret, err)]
    fn run(&self, action: &str, address: &str, interface: &str) -> Result<(), AddrError> {
        let argv = ["addr", action, &format!("{address}/32"), "dev", interface];
        let command_repr = format!("ip {}", argv.join(" "));

        let output = std::process::Command::new("ip")
            .args(argv)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| AddrError::Spawn {
                command: command_repr.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(AddrError::CommandFailed {
                command: command_repr,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(())
    }
}

impl AddrCli for ShellAddr {
    fn add(&self, address: &str, interface: &str) -> Result<(), AddrError> {
        self.run("add", address, interface)
    }

    fn remove(&self, address: &str, interface: &str) -> Result<(), AddrError> {
        self.run("del", address, interface)
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;

    #[test]
    fn mock_add_and_remove_are_exact_inverses() {
        let mut mock = MockAddrCli::new();
        mock.expect_add()
            .with(eq("10.0.0.5"), eq("eth0"))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_remove()
            .with(eq("10.0.0.5"), eq("eth0"))
            .times(1)
            .returning(|_, _| Ok(()));

        mock.add("10.0.0.5", "eth0").unwrap();
        mock.remove("10.0.0.5", "eth0").unwrap();
    }
}
