//! 有界轮询

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AgentError, AgentResult};

/// 按 `tick` 间隔调用 `probe`，直到其返回 true
///
/// 第一次探测立即执行。到达 `deadline` 时返回 `Timeout`，正在进行的探测被丢弃；
/// `cancel` 触发时返回 `Cancelled`。
pub async fn poll_until<F, Fut>(
    what: &str,
    tick: Duration,
    deadline: Duration,
    cancel: &CancellationToken,
    mut probe: F,
) -> AgentResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline_at = Instant::now() + deadline;
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(AgentError::Cancelled(what.to_string()));
            }
            _ = sleep_until(deadline_at) => {
                return Err(AgentError::Timeout {
                    what: what.to_string(),
                    after: deadline,
                });
            }
            ready = async {
                interval.tick().await;
                probe().await
            } => {
                attempts += 1;
                if ready {
                    debug!(what = %what, attempts, "Condition satisfied");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_deadline() {
        let cancel = CancellationToken::new();
        let probes = Arc::new(AtomicU32::new(0));
        let counter = probes.clone();
        let started = Instant::now();

        let result = poll_until("etcd to stop", Duration::from_secs(2), Duration::from_secs(6), &cancel, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            }
        })
        .await;

        assert!(matches!(result, Err(AgentError::Timeout { .. })));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6));
        assert!(elapsed < Duration::from_secs(7));
        // t = 0, 2, 4
        assert_eq!(probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_check_is_immediate() {
        let cancel = CancellationToken::new();
        let started = Instant::now();
        poll_until("ready", Duration::from_secs(5), Duration::from_secs(60), &cancel, || async { true })
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_later_check() {
        let cancel = CancellationToken::new();
        let probes = Arc::new(AtomicU32::new(0));
        let counter = probes.clone();
        let started = Instant::now();

        poll_until("node ready", Duration::from_secs(5), Duration::from_secs(300), &cancel, || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) >= 2 }
        })
        .await
        .unwrap();

        assert_eq!(probes.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_check_is_abandoned_at_deadline() {
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let result = poll_until("health", Duration::from_secs(1), Duration::from_secs(3), &cancel, || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            true
        })
        .await;
        assert!(matches!(result, Err(AgentError::Timeout { .. })));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            trigger.cancel();
        });

        let result = poll_until("etcd health", Duration::from_secs(1), Duration::from_secs(60), &cancel, || async {
            false
        })
        .await;
        assert!(matches!(result, Err(AgentError::Cancelled(_))));
    }
}
