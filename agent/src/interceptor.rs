//! C2: silently steers traffic to `target_port` through `proxy_port`,
//! excluding the proxy's own upstream traffic, and breaks already
//! established connections so clients reconnect through the new path.

use std::{net::Ipv4Addr, sync::Arc};

use disruptor_netfilter::{AddrCli, IpTablesCli, Rule, RuleSet};
use tracing::Level;

use crate::error::{AgentError, AgentResult, TeardownErrors};

/// `{interface, local_address, proxy_port, target_port}`.
#[derive(Debug, Clone)]
pub struct RedirectionSpec {
    pub interface: String,
    pub local_address: Ipv4Addr,
    pub proxy_port: u16,
    pub target_port: u16,
}

impl RedirectionSpec {
    pub fn validate(&self) -> AgentResult<()> {
        if self.target_port == self.proxy_port {
            return Err(AgentError::Validation(
                "target_port must differ from proxy_port".to_string(),
            ));
        }
        if self.target_port == 0 || self.proxy_port == 0 {
            return Err(AgentError::Validation("ports must be non-zero".to_string()));
        }
        if self.interface.is_empty() {
            return Err(AgentError::Validation("interface must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Started,
    Stopped,
}

/// Composes four netfilter rules (plus a teardown-only fifth) to
/// transparently redirect `target_port` to `proxy_port`.
pub struct TrafficInterceptor<IPT, ADDR> {
    spec: RedirectionSpec,
    rules: RuleSet<IPT>,
    ipt: Arc<IPT>,
    addr: Arc<ADDR>,
    state: State,
}

impl<IPT, ADDR> TrafficInterceptor<IPT, ADDR>
where
    IPT: IpTablesCli + 'static,
    ADDR: AddrCli + 'static,
{
    pub fn new(spec: RedirectionSpec, ipt: Arc<IPT>, addr: ADDR) -> AgentResult<Self> {
        spec.validate()?;
        Ok(Self {
            spec,
            rules: RuleSet::new(ipt.clone()),
            ipt,
            addr: Arc::new(addr),
            state: State::Idle,
        })
    }

    fn leftover_proxy_rule(&self) -> Rule {
        Rule::new(
            "filter",
            "INPUT",
            format!("-p tcp --dport {} -j REJECT --reject-with tcp-reset", self.spec.proxy_port),
        )
    }

    fn output_redirect_rule(&self) -> Rule {
        Rule::new(
            "nat",
            "OUTPUT",
            format!(
                "-p tcp -s 127.0.0.0/8 -d 127.0.0.1/32 --dport {} -j REDIRECT --to-ports {}",
                self.spec.target_port, self.spec.proxy_port
            ),
        )
    }

    fn prerouting_redirect_rule(&self) -> Rule {
        Rule::new(
            "nat",
            "PREROUTING",
            format!(
                "! -i lo -p tcp --dport {} -j REDIRECT --to-ports {}",
                self.spec.target_port, self.spec.proxy_port
            ),
        )
    }

    fn reset_loopback_rule(&self) -> Rule {
        Rule::new(
            "filter",
            "INPUT",
            format!(
                "-i lo -p tcp -s 127.0.0.0/8 --dport {} -m state --state ESTABLISHED -j REJECT --reject-with tcp-reset",
                self.spec.target_port
            ),
        )
    }

    fn reset_external_rule(&self) -> Rule {
        Rule::new(
            "filter",
            "INPUT",
            format!(
                "! -i lo -p tcp --dport {} -m state --state ESTABLISHED -j REJECT --reject-with tcp-reset",
                self.spec.target_port
            ),
        )
    }

    /// Not reentrant. Adds the interface address, then the four
    /// redirect/reset rules in order; returns immediately on the first
    /// failure, leaving cleanup to the caller's deferred `stop`.
    #[tracing::instrument(level = Level::DEBUG, skip(self), fields(interface = %self.spec.interface, target_port = self.spec.target_port))]
    pub async fn start(&mut self) -> AgentResult<()> {
        assert_eq!(self.state, State::Idle, "TrafficInterceptor::start is not reentrant");

        // Idempotently remove a leftover rule from a previous run before
        // installing anything new.
        let leftover = self.leftover_proxy_rule();
        let ipt = self.ipt.clone();
        let _ = tokio::task::spawn_blocking(move || ipt.remove(&leftover.table, &leftover.chain, &leftover.args)).await;

        self.state = State::Started;

        let addr = self.addr.clone();
        let (address, interface) = (self.spec.local_address.to_string(), self.spec.interface.clone());
        tokio::task::spawn_blocking(move || addr.add(&address, &interface))
            .await
            .map_err(|join_error| AgentError::Runtime(format!("blocking task panicked: {join_error}")))?
            .map_err(AgentError::from)?;

        self.rules.add(self.output_redirect_rule()).await?;
        self.rules.add(self.prerouting_redirect_rule()).await?;
        self.rules.add(self.reset_loopback_rule()).await?;
        self.rules.add(self.reset_external_rule()).await?;

        Ok(())
    }

    /// Removes the four rules and the interface address, attempting every
    /// step even if earlier ones failed, then installs the teardown-only
    /// fifth rule to kill leftover connections to the now-gone proxy.
    /// A no-op success when called from `Idle`.
    #[tracing::instrument(level = Level::DEBUG, skip(self))]
    pub async fn stop(&mut self) -> AgentResult<()> {
        if self.state == State::Idle {
            return Ok(());
        }

        let mut errors = TeardownErrors::default();

        if let Err(error) = self.rules.remove_all().await {
            errors.push(error);
        }

        let addr = self.addr.clone();
        let (address, interface) = (self.spec.local_address.to_string(), self.spec.interface.clone());
        match tokio::task::spawn_blocking(move || addr.remove(&address, &interface)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => errors.push(error),
            Err(join_error) => errors.push(format!("blocking task panicked: {join_error}")),
        }

        let leftover = self.leftover_proxy_rule();
        let ipt = self.ipt.clone();
        match tokio::task::spawn_blocking(move || ipt.add(&leftover.table, &leftover.chain, &leftover.args)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => errors.push(error),
            Err(join_error) => errors.push(format!("blocking task panicked: {join_error}")),
        }

        self.state = State::Stopped;

        errors.into_result().map_err(AgentError::from)
    }
}
