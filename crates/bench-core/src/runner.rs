use crate::config::Config;
use crate::payload::build_body;
use crate::sender::{Message, MessageSender};
use crate::stats::{Counters, ProducerStats, SnapshotHistory, StatsReport};
use crate::worker::{SendWorker, WorkerExit};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub topic: String,
    pub instance_count: u32,
    pub duration_ms: u64,
    pub exhausted_workers: u32,
    /// Counters as of the final snapshot
    pub counters: Counters,
    /// Final report line, absent if fewer than two snapshots were taken
    pub report: Option<StatsReport>,
}

/// One benchmark run against a single sender.
pub struct Benchmark {
    config: Config,
    sender: Arc<dyn MessageSender>,
    stats: Arc<ProducerStats>,
}

impl Benchmark {
    pub fn new(config: Config, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            config,
            sender,
            stats: Arc::new(ProducerStats::new()),
        }
    }

    /// Live counters of this run.
    pub fn stats(&self) -> Arc<ProducerStats> {
        self.stats.clone()
    }

    /// Drive the workers until `shutdown` resolves, then stop everything,
    /// take a last snapshot and print a last report.
    ///
    /// Fails before any worker starts if the config is invalid or the sender
    /// cannot start.
    pub async fn run<F>(self, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        let producer = &self.config.producer;
        let report_cfg = &self.config.report;

        self.sender
            .start()
            .await
            .with_context(|| format!("start producer error ({})", self.sender.name()))?;

        info!(
            "Starting {} workers on topic '{}' (group {}, body {} bytes, sender {})",
            producer.instance_count,
            producer.topic,
            producer.group_id,
            producer.body_size,
            self.sender.name()
        );

        let started = Instant::now();
        let history = Arc::new(SnapshotHistory::with_capacity(
            self.stats.clone(),
            report_cfg.history_capacity,
        ));
        let (stop_tx, stop_rx) = watch::channel(false);

        let message = Message::new(producer.topic.clone(), build_body(producer.body_size));
        let mut workers = JoinSet::new();
        for id in 0..producer.instance_count {
            let worker = SendWorker::new(
                id,
                self.sender.clone(),
                self.stats.clone(),
                message.clone(),
                self.config.retry.clone(),
            );
            workers.spawn(worker.run(stop_rx.clone()));
        }

        let mut periodic = JoinSet::new();
        {
            let history = history.clone();
            periodic.spawn(every(
                report_cfg.snapshot_interval(),
                stop_rx.clone(),
                move || {
                    history.take_snapshot();
                },
            ));
        }
        {
            let history = history.clone();
            periodic.spawn(every(
                report_cfg.report_interval(),
                stop_rx.clone(),
                move || {
                    history.print_stati();
                },
            ));
        }
        drop(stop_rx);

        let mut exhausted_workers = 0u32;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                joined = workers.join_next() => match joined {
                    Some(Ok(exit)) => {
                        if exit == WorkerExit::RetriesExhausted {
                            exhausted_workers += 1;
                        }
                    }
                    Some(Err(e)) => warn!("Worker task failed: {}", e),
                    None => {
                        warn!("All workers exited before the test finished");
                        break;
                    }
                },
            }
        }

        info!("Stopping workers...");
        if stop_tx.send(true).is_err() {
            debug!("Every worker and periodic task had already exited");
        }
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(WorkerExit::RetriesExhausted) => exhausted_workers += 1,
                Ok(WorkerExit::Stopped) => {}
                Err(e) => warn!("Worker task failed: {}", e),
            }
        }
        while let Some(joined) = periodic.join_next().await {
            if let Err(e) = joined {
                warn!("Periodic task failed: {}", e);
            }
        }

        let last = history.take_snapshot();
        let report = history.report_partial();
        if let Some(report) = &report {
            println!("{report}");
        }

        self.sender.shutdown().await;

        Ok(RunSummary {
            topic: producer.topic.clone(),
            instance_count: producer.instance_count,
            duration_ms: started.elapsed().as_millis() as u64,
            exhausted_workers,
            counters: last.counters,
            report,
        })
    }
}

/// Call `action` once per `period`, first after one full period, until stopped.
async fn every<A>(period: Duration, mut stop: watch::Receiver<bool>, mut action: A)
where
    A: FnMut() + Send + 'static,
{
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => action(),
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::{BoxFuture, MockSender, SendResult, SendStatus};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::time::sleep;

    fn test_config(instance_count: u32) -> Config {
        let mut config = Config::default();
        config.producer.name_server = "127.0.0.1:9876".to_string();
        config.producer.instance_count = instance_count;
        config.report.snapshot_interval_ms = 100;
        config.report.report_interval_ms = 500;
        config
    }

    /// Answers OK and FLUSH_DISK_TIMEOUT in turn.
    struct AlternatingSender {
        calls: AtomicU64,
    }

    impl MessageSender for AlternatingSender {
        fn name(&self) -> &'static str {
            "alternating"
        }

        fn start(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn send_sync<'a>(&'a self, _message: &'a Message) -> BoxFuture<'a, Result<SendResult>> {
            Box::pin(async move {
                sleep(Duration::from_millis(2)).await;
                let status = if self.calls.fetch_add(1, Ordering::Relaxed) % 2 == 0 {
                    SendStatus::Ok
                } else {
                    SendStatus::FlushDiskTimeout
                };
                Ok(SendResult { status })
            })
        }

        fn shutdown(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    struct UnreachableSender;

    impl MessageSender for UnreachableSender {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        fn start(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Err(anyhow!("connection refused")) })
        }

        fn send_sync<'a>(&'a self, _message: &'a Message) -> BoxFuture<'a, Result<SendResult>> {
            Box::pin(async { Err(anyhow!("send before start")) })
        }

        fn shutdown(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mock_run_for_two_seconds() {
        let benchmark = Benchmark::new(test_config(4), Arc::new(MockSender::new(5)));

        let summary = benchmark
            .run(sleep(Duration::from_secs(2)))
            .await
            .unwrap();

        let counters = summary.counters;
        // 4 workers * 2000ms / 5ms is the ceiling; timer slack only lowers it.
        assert!(counters.receive_response_success <= 1_700, "{counters:?}");
        assert!(counters.receive_response_success >= 1_000, "{counters:?}");
        assert_eq!(counters.send_request_success, counters.receive_response_success);
        assert_eq!(counters.send_request_failed, 0);
        assert_eq!(counters.receive_response_failed, 0);
        assert!(counters.send_max_rt_ms >= 5);
        assert!(counters.send_success_rt_total_ms >= 5 * counters.receive_response_success);

        let report = summary.report.unwrap();
        assert!(report.send_tps > 0.0);
        assert!(report.average_rt_ms >= 5.0);
        assert_eq!(report.total, counters.receive_response_success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_non_ok_statuses_count_as_response_failures() {
        let sender = Arc::new(AlternatingSender {
            calls: AtomicU64::new(0),
        });
        let benchmark = Benchmark::new(test_config(2), sender.clone());

        let summary = benchmark
            .run(sleep(Duration::from_millis(1_200)))
            .await
            .unwrap();

        let counters = summary.counters;
        let calls = sender.calls.load(Ordering::Relaxed);
        assert_eq!(
            counters.receive_response_success + counters.receive_response_failed,
            calls
        );
        assert_eq!(counters.receive_response_success, calls.div_ceil(2));
        assert_eq!(counters.send_request_success, counters.receive_response_success);
        assert!(counters.receive_response_failed > 0);
        assert!(summary.report.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_writes_after_shutdown() {
        let benchmark = Benchmark::new(test_config(8), Arc::new(MockSender::new(3)));
        let stats = benchmark.stats();

        let summary = benchmark
            .run(sleep(Duration::from_millis(350)))
            .await
            .unwrap();

        assert_eq!(stats.snapshot(Instant::now()).counters, summary.counters);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(stats.snapshot(Instant::now()).counters, summary.counters);
        assert!(summary.counters.receive_response_success > 0);
    }

    #[tokio::test]
    async fn test_start_failure_aborts_before_workers() {
        let benchmark = Benchmark::new(test_config(2), Arc::new(UnreachableSender));
        let stats = benchmark.stats();

        let err = benchmark.run(async {}).await.unwrap_err();

        assert!(format!("{err:#}").contains("connection refused"));
        assert_eq!(stats.send_request_success(), 0);
        assert_eq!(stats.send_request_failed(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = test_config(1);
        config.producer.body_size = 0;
        let benchmark = Benchmark::new(config, Arc::new(UnreachableSender));

        let err = benchmark.run(async {}).await.unwrap_err();
        assert_eq!(err.to_string(), "body size must be positive integer");
    }

    #[tokio::test]
    async fn test_short_run_has_no_report() {
        let benchmark = Benchmark::new(test_config(1), Arc::new(MockSender::new(1)));

        let summary = benchmark.run(async {}).await.unwrap();

        assert!(summary.report.is_none());
        assert_eq!(summary.exhausted_workers, 0);
    }
}
