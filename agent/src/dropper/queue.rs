//! C4's kernel-queue plumbing: installs the two filter/INPUT rules and
//! drives verdicts from the `Dropper`. The kernel-facing queue handle is
//! a small trait so this runs (and is tested) without root/NFQUEUE.

use std::{sync::Arc, time::Duration};

use disruptor_netfilter::{IpTablesCli, Rule, RuleSet};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::dropper::classify::Dropper;
use crate::error::{AgentError, AgentResult, TeardownErrors};
use crate::rng::Rng;

const MINIMUM_DURATION: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A packet awaiting a verdict, as handed out by the kernel queue.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub id: u32,
    pub payload: Vec<u8>,
}

/// Kernel-facing queue handle. Polled (not blocked on) so the `Apply`
/// loop can race it against cancellation and the duration timer.
pub trait PacketQueue: Send {
    fn try_recv(&mut self) -> AgentResult<Option<QueuedPacket>>;
    fn accept(&mut self, id: u32) -> AgentResult<()>;
    fn requeue_with_mark(&mut self, id: u32, mark: u32) -> AgentResult<()>;
}

/// Installs the reject-mark and NFQUEUE rules for `port`, then drives
/// verdicts from `dropper` until the duration elapses or cancellation.
pub struct Queue<IPT, Q> {
    rules: RuleSet<IPT>,
    port: u16,
    queue_id: u16,
    reject_mark: u32,
    dropper: Dropper,
    queue: Q,
}

impl<IPT, Q> Queue<IPT, Q>
where
    IPT: IpTablesCli + 'static,
    Q: PacketQueue,
{
    /// `open_queue` is handed the same `queue_id` that gets installed in the
    /// `--queue-num` iptables rule, so the kernel-facing binding (e.g.
    /// [`super::NfQueue::bind`]) can't drift from the rule that feeds it.
    pub fn new(
        port: u16,
        drop_rate: f64,
        ipt: Arc<IPT>,
        rng: &dyn Rng,
        open_queue: impl FnOnce(u16) -> AgentResult<Q>,
    ) -> AgentResult<Self> {
        let dropper = Dropper::new(drop_rate)?;
        let queue_id = rng.queue_id();
        let queue = open_queue(queue_id)?;
        Ok(Self {
            rules: RuleSet::new(ipt),
            port,
            queue_id,
            reject_mark: rng.reject_mark(),
            dropper,
            queue,
        })
    }

    fn reject_rule(&self) -> Rule {
        Rule::new(
            "filter",
            "INPUT",
            format!(
                "-p tcp --dport {} -m mark --mark {} -j REJECT --reject-with tcp-reset",
                self.port, self.reject_mark
            ),
        )
    }

    fn nfqueue_rule(&self) -> Rule {
        Rule::new(
            "filter",
            "INPUT",
            format!("-p tcp --dport {} -j NFQUEUE --queue-num {} --queue-bypass", self.port, self.queue_id),
        )
    }

    /// Blocks until `duration` elapses or `cancel` fires, dispatching
    /// verdicts in the meantime; always tears the rules down on exit.
    #[tracing::instrument(level = Level::DEBUG, skip(self, cancel), fields(port = self.port))]
    pub async fn apply(&mut self, cancel: CancellationToken, duration: Duration) -> AgentResult<()> {
        if duration < MINIMUM_DURATION {
            return Err(AgentError::Validation(format!(
                "duration must be at least {MINIMUM_DURATION:?}, got {duration:?}"
            )));
        }

        self.rules.add(self.reject_rule()).await?;
        self.rules.add(self.nfqueue_rule()).await?;

        let result = self.run_until(cancel, duration).await;

        let mut errors = TeardownErrors::default();
        if let Err(error) = self.rules.remove_all().await {
            errors.push(error);
        }

        if !errors.0.is_empty() {
            if let Err(error) = &result {
                errors.push(format!("primary: {error}"));
            }
            return Err(AgentError::from(errors));
        }

        result
    }

    async fn run_until(&mut self, cancel: CancellationToken, duration: Duration) -> AgentResult<()> {
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                () = &mut deadline => return Ok(()),
                () = cancel.cancelled() => return Err(AgentError::ContextCancelled),
                () = tokio::time::sleep(POLL_INTERVAL) => {
                    while let Some(packet) = self.queue.try_recv()? {
                        if self.dropper.should_drop(&packet.payload) {
                            self.queue.requeue_with_mark(packet.id, self.reject_mark)?;
                        } else {
                            self.queue.accept(packet.id)?;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use disruptor_netfilter::cli::MockIpTablesCli;
    use mockall::predicate::always;

    use crate::rng::SeededRng;

    use super::*;

    struct FakeQueue {
        pending: VecDeque<QueuedPacket>,
        pub verdicts: Vec<(u32, bool)>,
    }

    impl PacketQueue for FakeQueue {
        fn try_recv(&mut self) -> AgentResult<Option<QueuedPacket>> {
            Ok(self.pending.pop_front())
        }

        fn accept(&mut self, id: u32) -> AgentResult<()> {
            self.verdicts.push((id, true));
            Ok(())
        }

        fn requeue_with_mark(&mut self, id: u32, _mark: u32) -> AgentResult<()> {
            self.verdicts.push((id, false));
            Ok(())
        }
    }

    #[tokio::test]
    async fn rejects_durations_under_one_second() {
        let mut mock = MockIpTablesCli::new();
        mock.expect_add().returning(|_, _, _| Ok(()));
        mock.expect_remove().returning(|_, _, _| Ok(()));

        let queue = FakeQueue { pending: VecDeque::new(), verdicts: vec![] };
        let mut dropper_queue = Queue::new(8080, 0.5, Arc::new(mock), &SeededRng::new(1), |_| Ok(queue)).unwrap();

        let error = dropper_queue
            .apply(CancellationToken::new(), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(error, AgentError::Validation(_)));
    }

    #[tokio::test]
    async fn installs_and_tears_down_both_rules_around_the_window() {
        let mut mock = MockIpTablesCli::new();
        mock.expect_add().times(2).returning(|_, _, _| Ok(()));
        mock.expect_remove().times(2).returning(|_, _, _| Ok(()));

        let fake_queue = FakeQueue { pending: VecDeque::new(), verdicts: vec![] };
        let mut dropper_queue = Queue::new(8080, 0.0, Arc::new(mock), &SeededRng::new(1), |_| Ok(fake_queue)).unwrap();

        dropper_queue.apply(CancellationToken::new(), MINIMUM_DURATION).await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_returns_context_cancelled_and_still_tears_down() {
        let mut mock = MockIpTablesCli::new();
        mock.expect_add().times(2).returning(|_, _, _| Ok(()));
        mock.expect_remove().times(2).with(always(), always(), always()).returning(|_, _, _| Ok(()));

        let fake_queue = FakeQueue { pending: VecDeque::new(), verdicts: vec![] };
        let mut dropper_queue = Queue::new(8080, 0.0, Arc::new(mock), &SeededRng::new(1), |_| Ok(fake_queue)).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = dropper_queue.apply(cancel, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(error, AgentError::ContextCancelled));
    }
}
