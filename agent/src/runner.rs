//! C5: runs at most one fault injection per host, composing the
//! process lock, signal handling, profiling probes and a chosen
//! disruptor into the six-step lifecycle from the agent runner design.

use std::{path::PathBuf, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::disruptor::Disruptor;
use crate::error::{AgentError, AgentResult, TeardownErrors};
use crate::lock::Lock;
use crate::profiling::ProfilingHandles;
use crate::signal::Signals;

/// Output paths for the three profiling probes. `None` disables a probe.
#[derive(Debug, Clone, Default)]
pub struct ProfilingConfig {
    pub cpu_path: Option<PathBuf>,
    pub memory_path: Option<PathBuf>,
    pub trace_path: Option<PathBuf>,
}

/// Owns the single-instance lock and profiling configuration for one
/// run of `disruptor`.
pub struct AgentRunner<L, D> {
    lock: L,
    profiling: ProfilingConfig,
    disruptor: D,
}

impl<L, D> AgentRunner<L, D>
where
    L: Lock,
    D: Disruptor,
{
    pub fn new(lock: L, profiling: ProfilingConfig, disruptor: D) -> Self {
        Self { lock, profiling, disruptor }
    }

    /// 1. register signals; 2. acquire the lock; 3. start profiling;
    /// 4. derive a cancellable context; 5. race the disruptor against
    /// context cancellation and incoming signals; 6. guaranteed cleanup
    /// in reverse order, every step attempted regardless of earlier
    /// failures.
    #[tracing::instrument(level = Level::DEBUG, skip(self, ctx))]
    pub async fn run(mut self, ctx: CancellationToken, duration: Duration) -> AgentResult<()> {
        let mut signals = Signals::register()?;

        if let Err(error) = self.lock.acquire() {
            drop(signals);
            return Err(error);
        }

        let mut profiling = match ProfilingHandles::start(
            self.profiling.cpu_path.clone(),
            self.profiling.memory_path.clone(),
            self.profiling.trace_path.clone(),
        ) {
            Ok(profiling) => profiling,
            Err(error) => {
                let mut errors = TeardownErrors::default();
                if let Err(release_error) = self.lock.release() {
                    errors.push(release_error);
                }
                errors.push(format!("primary: {error}"));
                drop(signals);
                return Err(AgentError::from(errors));
            }
        };

        let inner = ctx.child_token();
        let outcome = {
            let mut apply = self.disruptor.apply(inner.clone(), duration);

            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    inner.cancel();
                    let _ = (&mut apply).await;
                    Err(AgentError::ContextCancelled)
                }
                signal = signals.recv() => {
                    inner.cancel();
                    let _ = (&mut apply).await;
                    Err(AgentError::SignalReceived(signal))
                }
                result = &mut apply => result,
            }
        };

        let mut errors = TeardownErrors::default();
        if let Err(error) = self.lock.release() {
            errors.push(error);
        }
        if let Err(error) = profiling.stop() {
            errors.push(error);
        }
        drop(signals);

        if !errors.0.is_empty() {
            if let Err(error) = &outcome {
                errors.push(format!("primary: {error}"));
            }
            return Err(AgentError::from(errors));
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use crate::lock::Lock;

    use super::*;

    #[derive(Clone, Default)]
    struct FakeLock {
        acquired: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl Lock for FakeLock {
        fn acquire(&self) -> AgentResult<()> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn release(&self) -> AgentResult<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ImmediateSuccess;
    impl crate::disruptor::Disruptor for ImmediateSuccess {
        fn apply<'a>(
            &'a mut self,
            _ctx: CancellationToken,
            _duration: Duration,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = AgentResult<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn successful_run_acquires_and_releases_the_lock_exactly_once() {
        let lock = FakeLock::default();
        let acquired = lock.acquired.clone();
        let released = lock.released.clone();

        let runner = AgentRunner::new(lock, ProfilingConfig::default(), ImmediateSuccess);
        runner.run(CancellationToken::new(), Duration::from_secs(1)).await.unwrap();

        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    struct Never;
    impl crate::disruptor::Disruptor for Never {
        fn apply<'a>(
            &'a mut self,
            _ctx: CancellationToken,
            _duration: Duration,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = AgentResult<()>> + Send + 'a>> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn context_cancellation_still_releases_the_lock() {
        let lock = FakeLock::default();
        let released = lock.released.clone();

        let ctx = CancellationToken::new();
        let runner = AgentRunner::new(lock, ProfilingConfig::default(), Never);

        let ctx_clone = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx_clone.cancel();
        });

        let error = runner.run(ctx, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(error, AgentError::ContextCancelled));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    /// A disruptor whose `apply` only does its (simulated) teardown work
    /// after observing its own context cancelled — standing in for
    /// `ProtocolDisruptor`/`Queue`'s `interceptor.stop()`/`remove_all()`.
    struct TracksTeardown {
        teardown_count: Arc<AtomicUsize>,
    }

    impl crate::disruptor::Disruptor for TracksTeardown {
        fn apply<'a>(
            &'a mut self,
            ctx: CancellationToken,
            _duration: Duration,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = AgentResult<()>> + Send + 'a>> {
            let counter = self.teardown_count.clone();
            Box::pin(async move {
                ctx.cancelled().await;
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AgentError::ContextCancelled)
            })
        }
    }

    #[tokio::test]
    async fn context_cancellation_still_runs_the_disruptors_own_teardown() {
        let teardown_count = Arc::new(AtomicUsize::new(0));
        let disruptor = TracksTeardown {
            teardown_count: teardown_count.clone(),
        };

        let ctx = CancellationToken::new();
        let runner = AgentRunner::new(FakeLock::default(), ProfilingConfig::default(), disruptor);

        let ctx_clone = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx_clone.cancel();
        });

        let error = runner.run(ctx, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(error, AgentError::ContextCancelled));
        assert_eq!(teardown_count.load(Ordering::SeqCst), 1);
    }
}
