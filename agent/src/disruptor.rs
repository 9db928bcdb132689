//! C4.7 (plus the two additive disruptor shapes named in the CLI's
//! command table): compositions over the lower-level collaborators that
//! all share the same `apply(ctx, duration)` contract and minimum
//! duration.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use disruptor_netfilter::{AddrCli, IpTablesCli, Rule, RuleSet};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::dropper::{PacketQueue, Queue};
use crate::error::{AgentError, AgentResult, TeardownErrors};
use crate::grpc::GrpcProxy;
use crate::http::HttpProxy;
use crate::interceptor::TrafficInterceptor;

pub const MINIMUM_DURATION: Duration = Duration::from_secs(1);

/// Type-erases `HttpProxy`/`GrpcProxy`'s async lifecycle so
/// `ProtocolDisruptor` can be generic over either, the same way `tower`
/// (a workspace dependency) boxes per-call futures behind `Service`.
pub trait Proxy: Send + Sync + 'static {
    fn run(self: Arc<Self>) -> Pin<Box<dyn Future<Output = AgentResult<()>> + Send>>;
    fn stop(&self);
    fn force(&self);
    fn requests_total(&self) -> u64;
}

impl Proxy for HttpProxy {
    fn run(self: Arc<Self>) -> Pin<Box<dyn Future<Output = AgentResult<()>> + Send>> {
        Box::pin(HttpProxy::start(self))
    }
    fn stop(&self) {
        HttpProxy::stop(self)
    }
    fn force(&self) {
        HttpProxy::force(self)
    }
    fn requests_total(&self) -> u64 {
        self.metrics().requests_total()
    }
}

impl Proxy for GrpcProxy {
    fn run(self: Arc<Self>) -> Pin<Box<dyn Future<Output = AgentResult<()>> + Send>> {
        Box::pin(GrpcProxy::start(self))
    }
    fn stop(&self) {
        GrpcProxy::stop(self)
    }
    fn force(&self) {
        GrpcProxy::force(self)
    }
    fn requests_total(&self) -> u64 {
        self.metrics().requests_total()
    }
}

/// Wraps `{Proxy, TrafficInterceptor}`. The interceptor is absent for a
/// non-transparent run (no `--transparent` flag).
pub struct ProtocolDisruptor<P, IPT, ADDR> {
    proxy: Arc<P>,
    interceptor: Option<TrafficInterceptor<IPT, ADDR>>,
}

impl<P, IPT, ADDR> ProtocolDisruptor<P, IPT, ADDR>
where
    P: Proxy,
    IPT: IpTablesCli + 'static,
    ADDR: AddrCli + 'static,
{
    pub fn new(proxy: Arc<P>, interceptor: Option<TrafficInterceptor<IPT, ADDR>>) -> Self {
        Self { proxy, interceptor }
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self, ctx))]
    pub async fn apply(&mut self, ctx: CancellationToken, duration: Duration) -> AgentResult<()> {
        if duration < MINIMUM_DURATION {
            return Err(AgentError::Validation(format!(
                "duration must be at least {MINIMUM_DURATION:?}, got {duration:?}"
            )));
        }

        let mut proxy_task = tokio::spawn(self.proxy.clone().run());

        if let Some(interceptor) = self.interceptor.as_mut() {
            if let Err(error) = interceptor.start().await {
                let _ = interceptor.stop().await;
                self.proxy.force();
                let _ = proxy_task.await;
                return Err(error);
            }
        }

        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(AgentError::ContextCancelled),
            result = &mut proxy_task => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(error),
                Err(join_error) => Err(AgentError::Runtime(format!("proxy task panicked: {join_error}"))),
            },
            () = &mut deadline => Ok(()),
        };

        let mut errors = TeardownErrors::default();
        if let Some(interceptor) = self.interceptor.as_mut() {
            if let Err(error) = interceptor.stop().await {
                errors.push(error);
            }
        }

        self.proxy.stop();
        if !proxy_task.is_finished() {
            let _ = proxy_task.await;
        }

        if !errors.0.is_empty() {
            if let Err(error) = &outcome {
                errors.push(format!("primary: {error}"));
            }
            return Err(AgentError::from(errors));
        }

        match outcome {
            Ok(()) if self.proxy.requests_total() == 0 => Err(AgentError::NoRequestsReceived),
            other => other,
        }
    }
}

/// Wraps `{Dropper+Queue, RuleSet}` for the `tcp-drop` command.
pub struct TcpDropDisruptor<IPT, Q> {
    queue: Queue<IPT, Q>,
}

impl<IPT, Q> TcpDropDisruptor<IPT, Q>
where
    IPT: IpTablesCli + 'static,
    Q: PacketQueue,
{
    pub fn new(queue: Queue<IPT, Q>) -> Self {
        Self { queue }
    }

    pub async fn apply(&mut self, ctx: CancellationToken, duration: Duration) -> AgentResult<()> {
        self.queue.apply(ctx, duration).await
    }
}

/// Wraps a single blanket-DROP `Rule` for the `network-drop` command.
pub struct NetworkDropDisruptor<IPT> {
    rules: RuleSet<IPT>,
    rule: Rule,
}

impl<IPT> NetworkDropDisruptor<IPT>
where
    IPT: IpTablesCli + 'static,
{
    pub fn new(ipt: Arc<IPT>, port: Option<u16>, protocol: &str) -> Self {
        let filter = match port {
            Some(port) => format!("-p {protocol} --dport {port} -j DROP"),
            None => format!("-p {protocol} -j DROP"),
        };
        Self {
            rules: RuleSet::new(ipt),
            rule: Rule::new("filter", "INPUT", filter),
        }
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self, ctx))]
    pub async fn apply(&mut self, ctx: CancellationToken, duration: Duration) -> AgentResult<()> {
        if duration < MINIMUM_DURATION {
            return Err(AgentError::Validation(format!(
                "duration must be at least {MINIMUM_DURATION:?}, got {duration:?}"
            )));
        }

        self.rules.add(self.rule.clone()).await?;

        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(AgentError::ContextCancelled),
            () = &mut deadline => Ok(()),
        };

        if let Err(error) = self.rules.remove_all().await {
            return Err(match outcome {
                Err(primary) => AgentError::Runtime(format!("{primary}; cleanup also failed: {error}")),
                Ok(()) => AgentError::from(error),
            });
        }

        outcome
    }
}

/// Type-erases the three disruptor shapes so `AgentRunner` is generic
/// over whichever one the chosen command selected.
pub trait Disruptor {
    fn apply<'a>(
        &'a mut self,
        ctx: CancellationToken,
        duration: Duration,
    ) -> Pin<Box<dyn Future<Output = AgentResult<()>> + Send + 'a>>;
}

impl<P, IPT, ADDR> Disruptor for ProtocolDisruptor<P, IPT, ADDR>
where
    P: Proxy,
    IPT: IpTablesCli + 'static,
    ADDR: AddrCli + Send + Sync + 'static,
{
    fn apply<'a>(
        &'a mut self,
        ctx: CancellationToken,
        duration: Duration,
    ) -> Pin<Box<dyn Future<Output = AgentResult<()>> + Send + 'a>> {
        Box::pin(ProtocolDisruptor::apply(self, ctx, duration))
    }
}

impl<IPT, Q> Disruptor for TcpDropDisruptor<IPT, Q>
where
    IPT: IpTablesCli + 'static,
    Q: PacketQueue,
{
    fn apply<'a>(
        &'a mut self,
        ctx: CancellationToken,
        duration: Duration,
    ) -> Pin<Box<dyn Future<Output = AgentResult<()>> + Send + 'a>> {
        Box::pin(TcpDropDisruptor::apply(self, ctx, duration))
    }
}

impl<IPT> Disruptor for NetworkDropDisruptor<IPT>
where
    IPT: IpTablesCli + 'static,
{
    fn apply<'a>(
        &'a mut self,
        ctx: CancellationToken,
        duration: Duration,
    ) -> Pin<Box<dyn Future<Output = AgentResult<()>> + Send + 'a>> {
        Box::pin(NetworkDropDisruptor::apply(self, ctx, duration))
    }
}

#[cfg(test)]
mod tests {
    use disruptor_netfilter::cli::MockIpTablesCli;

    use super::*;

    #[tokio::test]
    async fn network_drop_rejects_sub_minimum_duration() {
        let mut mock = MockIpTablesCli::new();
        mock.expect_add().returning(|_, _, _| Ok(()));
        mock.expect_remove().returning(|_, _, _| Ok(()));

        let mut disruptor = NetworkDropDisruptor::new(Arc::new(mock), Some(8080), "tcp");
        let error = disruptor
            .apply(CancellationToken::new(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(error, AgentError::Validation(_)));
    }

    #[tokio::test]
    async fn network_drop_installs_then_removes_the_blanket_rule() {
        let mut mock = MockIpTablesCli::new();
        mock.expect_add().times(1).returning(|_, _, _| Ok(()));
        mock.expect_remove().times(1).returning(|_, _, _| Ok(()));

        let mut disruptor = NetworkDropDisruptor::new(Arc::new(mock), None, "tcp");
        disruptor.apply(CancellationToken::new(), MINIMUM_DURATION).await.unwrap();
    }
}
