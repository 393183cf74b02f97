use crate::retry::RetryPolicy;
use crate::sender::{Message, MessageSender};
use crate::stats::ProducerStats;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Why a send loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    RetriesExhausted,
}

/// One send loop: send, record the outcome, repeat until stopped.
pub struct SendWorker {
    pub id: u32,
    sender: Arc<dyn MessageSender>,
    stats: Arc<ProducerStats>,
    message: Message,
    retry: RetryPolicy,
}

impl SendWorker {
    pub fn new(
        id: u32,
        sender: Arc<dyn MessageSender>,
        stats: Arc<ProducerStats>,
        message: Message,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id,
            sender,
            stats,
            message,
            retry,
        }
    }

    /// Run until `stop` flips to true. The flag is checked before every send;
    /// a send in flight always completes and is recorded.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> WorkerExit {
        let mut consecutive_failures = 0u32;

        while !*stop.borrow() {
            let start = Instant::now();
            match self.sender.send_sync(&self.message).await {
                Ok(result) => {
                    consecutive_failures = 0;
                    if result.status.is_ok() {
                        let rt_ms = start.elapsed().as_millis() as u64;
                        self.stats.record_success(rt_ms);
                    } else {
                        debug!(
                            "Worker {} send to {} returned status {:?}",
                            self.id, self.message.topic, result.status
                        );
                        self.stats.record_response_failed();
                    }
                }
                Err(e) => {
                    self.stats.record_send_failed();
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!("Worker {} send message sync error: {:#}", self.id, e);

                    if !self.retry.should_retry(consecutive_failures) {
                        warn!(
                            "Worker {} giving up after {} consecutive send errors",
                            self.id, consecutive_failures
                        );
                        return WorkerExit::RetriesExhausted;
                    }
                    if let Some(backoff) = self.retry.backoff() {
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = stop.changed() => {}
                        }
                    }
                }
            }
        }

        WorkerExit::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::{BoxFuture, SendResult, SendStatus};
    use anyhow::{bail, Result};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` sends, then answers OK and FLUSH_DISK_TIMEOUT in turn.
    struct FlakySender {
        failures: u64,
        calls: AtomicU64,
    }

    impl MessageSender for FlakySender {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn start(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn send_sync<'a>(&'a self, _message: &'a Message) -> BoxFuture<'a, Result<SendResult>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                let call = self.calls.fetch_add(1, Ordering::Relaxed);
                if call < self.failures {
                    bail!("connection reset");
                }
                Ok(SendResult {
                    status: if call % 2 == 0 {
                        SendStatus::Ok
                    } else {
                        SendStatus::FlushDiskTimeout
                    },
                })
            })
        }

        fn shutdown(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    fn worker(
        sender: Arc<dyn MessageSender>,
        stats: Arc<ProducerStats>,
        retry: RetryPolicy,
    ) -> SendWorker {
        SendWorker::new(0, sender, stats, Message::new("t", vec![b'x'; 4]), retry)
    }

    #[tokio::test]
    async fn test_stopped_worker_never_sends() {
        let sender = Arc::new(FlakySender {
            failures: 0,
            calls: AtomicU64::new(0),
        });
        let stats = Arc::new(ProducerStats::new());
        let (_tx, rx) = watch::channel(true);

        let exit = worker(sender.clone(), stats.clone(), RetryPolicy::unbounded())
            .run(rx)
            .await;

        assert_eq!(exit, WorkerExit::Stopped);
        assert_eq!(sender.calls.load(Ordering::Relaxed), 0);
        assert_eq!(stats.snapshot(Instant::now()).counters, Default::default());
    }

    #[tokio::test]
    async fn test_bounded_retries_give_up() {
        let sender = Arc::new(FlakySender {
            failures: u64::MAX,
            calls: AtomicU64::new(0),
        });
        let stats = Arc::new(ProducerStats::new());
        let (_tx, rx) = watch::channel(false);
        let retry = RetryPolicy {
            max_retries: Some(2),
            backoff_ms: 0,
        };

        let exit = worker(sender, stats.clone(), retry).run(rx).await;

        assert_eq!(exit, WorkerExit::RetriesExhausted);
        assert_eq!(stats.send_request_failed(), 3);
        assert_eq!(stats.receive_response_success(), 0);
    }

    #[tokio::test]
    async fn test_errors_then_mixed_statuses_until_stopped() {
        let sender = Arc::new(FlakySender {
            failures: 3,
            calls: AtomicU64::new(0),
        });
        let stats = Arc::new(ProducerStats::new());
        let (tx, rx) = watch::channel(false);
        let retry = RetryPolicy {
            max_retries: Some(5),
            backoff_ms: 1,
        };

        let handle = tokio::spawn(worker(sender.clone(), stats.clone(), retry).run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let exit = handle.await.unwrap();

        assert_eq!(exit, WorkerExit::Stopped);
        assert_eq!(stats.send_request_failed(), 3);
        let answered = stats.receive_response_success() + stats.receive_response_failed();
        assert_eq!(answered, sender.calls.load(Ordering::Relaxed) - 3);
        assert!(stats.receive_response_success() > 0);
        assert!(stats.receive_response_failed() > 0);
        assert_eq!(stats.send_request_success(), stats.receive_response_success());
    }
}
