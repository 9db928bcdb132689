//! Idempotent add/remove of kernel packet-filter rules as an atomic ruleset.
//!
//! A [`Rule`] is a `(table, chain, args)` triple; [`RuleSet`] commits a group
//! of rules and guarantees that tearing it down attempts every rule it added,
//! regardless of individual failures, so no rule is ever silently orphaned.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use tracing::Level;

pub mod addr;
pub mod cli;
pub mod error;

pub use addr::{AddrCli, ShellAddr};
pub use cli::{IpTablesCli, ShellIpTables};

use error::{CleanupErrors, IpTablesError};

/// A single packet-filter rule: a kernel hook location (`table`, `chain`)
/// plus the match+verdict clause (`args`).
///
/// Rules are value-equal. The same [`Rule`] value used for `Add` produces
/// the exact inverse `-D` command when used for `Remove`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub table: String,
    pub chain: String,
    pub args: String,
}

impl Rule {
    pub fn new(table: impl Into<String>, chain: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            chain: chain.into(),
            args: args.into(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} <A|D> {} {}", self.table, self.chain, self.args)
    }
}

/// An ordered sequence of currently-installed [`Rule`]s, backed by a shared
/// [`IpTablesCli`].
///
/// Invariant: every rule added through this `RuleSet` is either still
/// installed or was removed by [`RuleSet::remove_all`] — there are no
/// orphans. A `RuleSet` can be reused (added to again) after a full removal.
#[derive(Debug)]
pub struct RuleSet<C> {
    cli: Arc<C>,
    installed: Mutex<Vec<Rule>>,
}

impl<C> RuleSet<C>
where
    C: IpTablesCli + 'static,
{
    pub fn new(cli: Arc<C>) -> Self {
        Self {
            cli,
            installed: Mutex::new(Vec::new()),
        }
    }

    /// Adds `rule`, on a blocking thread so callers never park a tokio
    /// worker on the underlying fork+exec. On success the rule is tracked
    /// for later removal.
    #[tracing::instrument(level = Level::DEBUG, skip(self), fields(rule = %rule), err)]
    pub async fn add(&self, rule: Rule) -> Result<(), IpTablesError> {
        let cli = self.cli.clone();
        let call = rule.clone();
        run_blocking(move || cli.add(&call.table, &call.chain, &call.args)).await?;
        self.installed.lock().unwrap().push(rule);

        Ok(())
    }

    /// Attempts to remove every installed rule, regardless of individual
    /// failures, each on a blocking thread. Never short-circuits. Returns
    /// the aggregate of every failure (empty iff every removal succeeded)
    /// and retains no rules afterward, so the `RuleSet` can be reused.
    #[tracing::instrument(level = Level::DEBUG, skip(self))]
    pub async fn remove_all(&self) -> Result<(), CleanupErrors> {
        let rules = std::mem::take(&mut *self.installed.lock().unwrap());

        let mut failures = Vec::new();
        for rule in rules {
            let cli = self.cli.clone();
            let call = rule.clone();
            if let Err(error) = run_blocking(move || cli.remove(&call.table, &call.chain, &call.args)).await {
                failures.push((rule, error));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupErrors(failures))
        }
    }

    /// Number of rules currently tracked as installed.
    pub fn len(&self) -> usize {
        self.installed.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run_blocking<F>(f: F) -> Result<(), IpTablesError>
where
    F: FnOnce() -> Result<(), IpTablesError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(join_error) => Err(IpTablesError::Spawn {
            command: "<blocking task>".to_string(),
            source: std::io::Error::other(join_error),
        }),
    }
}

#[cfg(test)]
mod tests {
    use cli::MockIpTablesCli;
    use mockall::predicate::eq;

    use super::*;

    #[tokio::test]
    async fn add_tracks_rule_for_removal() {
        let mut mock = MockIpTablesCli::new();
        mock.expect_add()
            .with(eq("nat"), eq("OUTPUT"), eq("-p tcp --dport 80 -j REDIRECT"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_remove()
            .with(eq("nat"), eq("OUTPUT"), eq("-p tcp --dport 80 -j REDIRECT"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let rule_set = RuleSet::new(Arc::new(mock));
        rule_set
            .add(Rule::new("nat", "OUTPUT", "-p tcp --dport 80 -j REDIRECT"))
            .await
            .unwrap();
        assert_eq!(rule_set.len(), 1);

        rule_set.remove_all().await.unwrap();
        assert!(rule_set.is_empty());
    }

    #[tokio::test]
    async fn remove_all_tries_every_rule_and_aggregates_failures() {
        let mut mock = MockIpTablesCli::new();
        mock.expect_add().times(2).returning(|_, _, _| Ok(()));
        mock.expect_remove()
            .with(eq("nat"), eq("OUTPUT"), eq("-A"))
            .returning(|_, _, _| {
                Err(IpTablesError::CommandFailed {
                    command: "iptables -t nat -D OUTPUT -A".into(),
                    status: std::os::unix::process::ExitStatusExt::from_raw(256),
                    stderr: "Bad rule".into(),
                })
            });
        mock.expect_remove()
            .with(eq("nat"), eq("OUTPUT"), eq("-B"))
            .returning(|_, _, _| Ok(()));

        let rule_set = RuleSet::new(Arc::new(mock));
        rule_set.add(Rule::new("nat", "OUTPUT", "-A")).await.unwrap();
        rule_set.add(Rule::new("nat", "OUTPUT", "-B")).await.unwrap();

        let result = rule_set.remove_all().await;
        let errors = result.unwrap_err();
        assert_eq!(errors.0.len(), 1);
        // Both removals were attempted, and no rules remain tracked.
        assert!(rule_set.is_empty());
    }

    #[tokio::test]
    async fn rule_set_is_reusable_after_full_removal() {
        let mut mock = MockIpTablesCli::new();
        mock.expect_add().times(2).returning(|_, _, _| Ok(()));
        mock.expect_remove().times(2).returning(|_, _, _| Ok(()));

        let rule_set = RuleSet::new(Arc::new(mock));
        rule_set.add(Rule::new("nat", "OUTPUT", "-A")).await.unwrap();
        rule_set.remove_all().await.unwrap();

        rule_set.add(Rule::new("nat", "OUTPUT", "-A")).await.unwrap();
        assert_eq!(rule_set.len(), 1);
        rule_set.remove_all().await.unwrap();
        assert!(rule_set.is_empty());
    }
}
