//! The process-wide single-instance lock. Expressed as an explicit
//! capability trait (not a singleton) so tests can supply a fake.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use nix::{
    sys::signal::kill,
    unistd::Pid,
};

use crate::error::{AgentError, AgentResult};

/// A process-wide single-instance lock: at most one holder at a time,
/// reentrant for the owning pid.
pub trait Lock: Send + Sync {
    fn acquire(&self) -> AgentResult<()>;

    /// Removes the lock only if the caller is the owner.
    fn release(&self) -> AgentResult<()>;
}

/// Filesystem-backed lock: a path under `$XDG_RUNTIME_DIR` (falling back
/// to the OS temp directory), holding the acquirer's pid in ASCII.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Resolves the canonical lock path for `binary_name`.
    pub fn for_binary(binary_name: &str) -> Self {
        let dir = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Self {
            path: dir.join(format!("{binary_name}.lock")),
        }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The owning pid, if the lock file exists. Used by `cleanup` to find
    /// the currently-running agent without itself acquiring the lock.
    pub fn owner_pid(&self) -> AgentResult<Option<i32>> {
        match self.read_owner() {
            Ok(pid) => Ok(Some(pid)),
            Err(_) if !self.path.exists() => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn read_owner(&self) -> AgentResult<i32> {
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|error| AgentError::Setup(format!("reading lock file {}: {error}", self.path.display())))?;
        contents
            .trim()
            .parse::<i32>()
            .map_err(|error| AgentError::Setup(format!("lock file {} has malformed pid: {error}", self.path.display())))
    }

    fn is_alive(pid: i32) -> bool {
        kill(Pid::from_raw(pid), None).is_ok()
    }
}

impl Lock for FileLock {
    fn acquire(&self) -> AgentResult<()> {
        let own_pid = std::process::id() as i32;

        loop {
            let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
            let mut temp = tempfile::NamedTempFile::new_in(parent)
                .map_err(|error| AgentError::Setup(format!("creating temp lock file: {error}")))?;
            write!(temp, "{own_pid}")
                .map_err(|error| AgentError::Setup(format!("writing temp lock file: {error}")))?;
            temp.flush()
                .map_err(|error| AgentError::Setup(format!("flushing temp lock file: {error}")))?;

            match std::fs::hard_link(temp.path(), &self.path) {
                Ok(()) => return Ok(()),
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                    let owner = self.read_owner()?;

                    if owner == own_pid {
                        return Ok(());
                    }

                    if Self::is_alive(owner) {
                        return Err(AgentError::LockContention(owner));
                    }

                    // Stale lock: owner is dead, remove and retry.
                    let _ = std::fs::remove_file(&self.path);
                }
                Err(error) => {
                    return Err(AgentError::Setup(format!(
                        "linking lock file {}: {error}",
                        self.path.display()
                    )))
                }
            }
        }
    }

    fn release(&self) -> AgentResult<()> {
        let own_pid = std::process::id() as i32;

        match self.read_owner() {
            Ok(owner) if owner == own_pid => std::fs::remove_file(&self.path)
                .map_err(|error| AgentError::Setup(format!("removing lock file {}: {error}", self.path.display()))),
            Ok(_) => Ok(()), // not the owner: nothing to do
            Err(_) => Ok(()), // already gone
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_reentrant_for_the_same_process() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::at_path(dir.path().join("agent.lock"));

        lock.acquire().unwrap();
        lock.acquire().unwrap();
        lock.release().unwrap();

        assert!(!dir.path().join("agent.lock").exists());
    }

    #[test]
    fn acquire_fails_against_a_live_foreign_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.lock");

        // pid 1 (init) is always alive on a running system.
        std::fs::write(&path, b"1").unwrap();

        let lock = FileLock::at_path(path);
        let error = lock.acquire().unwrap_err();
        assert!(matches!(error, AgentError::LockContention(1)));
    }

    #[test]
    fn acquire_reclaims_a_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.lock");

        // A pid that is very unlikely to be alive.
        std::fs::write(&path, b"999999").unwrap();

        let lock = FileLock::at_path(path.clone());
        lock.acquire().unwrap();

        let owner: i32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(owner, std::process::id() as i32);
    }

    #[test]
    fn owner_pid_is_none_before_acquire_and_some_after() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::at_path(dir.path().join("agent.lock"));

        assert_eq!(lock.owner_pid().unwrap(), None);

        lock.acquire().unwrap();
        assert_eq!(lock.owner_pid().unwrap(), Some(std::process::id() as i32));
    }

    #[test]
    fn release_from_idle_or_non_owner_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::at_path(dir.path().join("agent.lock"));
        lock.release().unwrap();
    }
}
