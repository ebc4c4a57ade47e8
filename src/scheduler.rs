// ============================================================================
// SCHEDULER
// ============================================================================
// Drives the fixed-interval loop: sample each bound category, attach network
// rates, publish. Failures are logged per category and never leave the cycle.
// ============================================================================

use std::time::Duration;

use chrono::{DateTime, Local, Timelike};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChannelsConfig;
use crate::error::{SampleError, SampleResult};
use crate::publisher::Publisher;
use crate::rates::RateCalculator;
use crate::sampler::Sampler;
use crate::snapshot::{Category, Snapshot};

/// A category and the channel its snapshots go to. Fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub category: Category,
    pub channel: String,
}

/// What happened to one category in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryOutcome {
    Published { retries: u32 },
    SampleFailed(SampleError),
    PublishFailed { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub outcomes: Vec<(Category, CategoryOutcome)>,
}

impl CycleReport {
    pub fn outcome(&self, category: Category) -> Option<&CategoryOutcome> {
        self.outcomes.iter().find(|(c, _)| *c == category).map(|(_, outcome)| outcome)
    }

    pub fn published(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, CategoryOutcome::Published { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.published()
    }
}

#[derive(Debug)]
pub struct Scheduler {
    sampler: Sampler,
    rates: RateCalculator,
    publisher: Publisher,
    bindings: Vec<Binding>,
    interval: Duration,
    sample_timeout: Option<Duration>,
}

impl Scheduler {
    /// Bind every category, in registration order, to its configured channel.
    pub fn new(
        sampler: Sampler,
        publisher: Publisher,
        channels: &ChannelsConfig,
        interval: Duration,
    ) -> Self {
        let bindings = Category::ALL
            .iter()
            .map(|&category| Binding {
                category,
                channel: channels.channel_for(category).to_string(),
            })
            .collect();

        Self {
            sampler,
            rates: RateCalculator::new(),
            publisher,
            bindings,
            interval,
            sample_timeout: None,
        }
    }

    /// Bound each sample call; a sample that overruns counts as unavailable.
    pub fn with_sample_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.sample_timeout = timeout;
        self
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Run cycles at a fixed rate until `shutdown` is cancelled. Cancellation
    /// is observed between cycles; a cycle in progress always completes.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            target: "telemetry::scheduler",
            interval_ms = self.interval.as_millis() as u64,
            categories = self.bindings.len(),
            "Scheduler started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = self.run_cycle().await;
            cycles += 1;
            debug!(
                target: "telemetry::scheduler",
                cycle = cycles,
                published = report.published(),
                failed = report.failed(),
                "Cycle complete"
            );

            if is_heartbeat(Local::now()) {
                info!(target: "telemetry::scheduler", cycles, "Metrics still being published");
            }
        }

        info!(target: "telemetry::scheduler", cycles, "Scheduler stopped");
    }

    /// One pass over every binding.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        for index in 0..self.bindings.len() {
            let Binding { category, channel } = self.bindings[index].clone();

            let snapshot = match self.sample(category).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(
                        target: "telemetry::scheduler",
                        category = %category,
                        kind = err.kind(),
                        error = %err,
                        "Sampling failed, skipping category this cycle"
                    );
                    report.outcomes.push((category, CategoryOutcome::SampleFailed(err)));
                    continue;
                }
            };

            let snapshot = match snapshot {
                Snapshot::Network(network) => {
                    let elapsed = self.interval.as_secs_f64();
                    let rates = self.rates.compute_rates(&network.network_io, elapsed);
                    Snapshot::Network(network.with_rates(rates))
                }
                other => other,
            };

            let published = self.publisher.publish(&channel, &snapshot).await;
            let retries = published.retries();
            let outcome = match published.into_result() {
                Ok(()) => CategoryOutcome::Published { retries },
                Err(err) => CategoryOutcome::PublishFailed { reason: err.to_string() },
            };
            report.outcomes.push((category, outcome));
        }

        report
    }

    /// Samples that sleep through a CPU window, or are under the watchdog, run
    /// on the blocking pool.
    async fn sample(&self, category: Category) -> SampleResult<Snapshot> {
        if self.sample_timeout.is_none() && !self.sampler.blocks() {
            return self.sampler.sample(category);
        }

        let sampler = self.sampler.clone();
        let task = tokio::task::spawn_blocking(move || sampler.sample(category));
        let joined = match self.sample_timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    return Err(SampleError::unavailable(
                        category.as_str(),
                        format!("no response within {}ms", limit.as_millis()),
                    ))
                }
            },
            None => task.await,
        };
        joined.unwrap_or_else(|join_error| {
            Err(SampleError::unavailable(category.as_str(), join_error))
        })
    }
}

/// Liveness is logged on cycles that land on second zero of a minute.
pub fn is_heartbeat(now: DateTime<Local>) -> bool {
    now.second() == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::publisher::tests::ScriptedBroker;
    use crate::publisher::RetryPolicy;
    use crate::sampler::tests::StaticSource;
    use crate::source::{
        CounterSource, CpuCounters, CpuFrequency, DiskIoCounters, FsStats, LoadAverage,
        MemoryCounters, NetIfStats, NetIoCounters, Partition,
    };
    use chrono::TimeZone;
    use compact_str::CompactString;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn two_second_scheduler(sampler: Sampler, publisher: Publisher) -> Scheduler {
        Scheduler::new(sampler, publisher, &ChannelsConfig::default(), Duration::from_secs(2))
    }

    fn scheduler(
        source: StaticSource,
        broker: &Arc<ScriptedBroker>,
    ) -> (Scheduler, Arc<StaticSource>) {
        let source = Arc::new(source);
        let sampler = Sampler::new(source.clone());
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let publisher = Publisher::new(broker.clone(), policy);
        (two_second_scheduler(sampler, publisher), source)
    }

    fn payload(broker: &ScriptedBroker, channel: &str) -> serde_json::Value {
        let delivered = broker.delivered.lock();
        let (_, bytes) = delivered
            .iter()
            .rev()
            .find(|(c, _)| c == channel)
            .expect("channel was published");
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_default_bindings() {
        let broker = Arc::new(ScriptedBroker::default());
        let (scheduler, _) = scheduler(StaticSource::default(), &broker);
        let channels: Vec<_> = scheduler.bindings().iter().map(|b| b.channel.as_str()).collect();
        assert_eq!(channels, ["cpu_stats", "memory_stats", "disk_stats", "network_stats"]);
    }

    #[tokio::test]
    async fn test_cycle_publishes_every_category() {
        let broker = Arc::new(ScriptedBroker::default());
        let (mut scheduler, _) = scheduler(StaticSource::default(), &broker);

        let report = scheduler.run_cycle().await;
        assert_eq!(report.published(), 4);
        assert_eq!(
            broker.delivered_channels(),
            ["cpu_stats", "memory_stats", "disk_stats", "network_stats"]
        );
        assert_eq!(payload(&broker, "cpu_stats")["host"], "static-host");
    }

    #[tokio::test]
    async fn test_cpu_failure_does_not_block_other_categories() {
        let broker = Arc::new(ScriptedBroker::default());
        let source = StaticSource {
            cpu_error: Some(SampleError::permission_denied("/proc/stat")),
            ..Default::default()
        };
        let (mut scheduler, _) = scheduler(source, &broker);

        let report = scheduler.run_cycle().await;
        assert_eq!(
            report.outcome(Category::Cpu),
            Some(&CategoryOutcome::SampleFailed(SampleError::permission_denied("/proc/stat")))
        );
        for category in [Category::Memory, Category::Disk, Category::Network] {
            assert_eq!(report.outcome(category), Some(&CategoryOutcome::Published { retries: 0 }));
        }
        assert_eq!(broker.delivered_channels(), ["memory_stats", "disk_stats", "network_stats"]);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_block_other_categories() {
        let broker = Arc::new(ScriptedBroker::failing_with([BrokerError::rejected("denied")]));
        let (mut scheduler, _) = scheduler(StaticSource::default(), &broker);

        let report = scheduler.run_cycle().await;
        assert!(matches!(
            report.outcome(Category::Cpu),
            Some(CategoryOutcome::PublishFailed { .. })
        ));
        assert_eq!(report.published(), 3);
        assert_eq!(report.failed(), 1);
    }

    #[tokio::test]
    async fn test_network_rates_attached_from_second_cycle() {
        let broker = Arc::new(ScriptedBroker::default());
        let (mut scheduler, source) = scheduler(StaticSource::default(), &broker);

        source.set_net_io(&[("eth0", 1000, 2000)]);
        scheduler.run_cycle().await;
        let first = payload(&broker, "network_stats");
        assert_eq!(first["upload_download"], serde_json::json!({}));

        source.set_net_io(&[("eth0", 1500, 2200)]);
        scheduler.run_cycle().await;
        let second = payload(&broker, "network_stats");
        assert_eq!(
            second["upload_download"]["eth0"],
            serde_json::json!({
                "bytes_uploaded": 500,
                "upload_rate": 250.0,
                "bytes_downloaded": 200,
                "download_rate": 100.0
            })
        );
        assert_eq!(second["network_io"]["eth0"]["bytes_sent"], 1500);
    }

    /// Source whose CPU read never returns in time.
    #[derive(Debug, Default)]
    struct SlowCpuSource(StaticSource);

    impl CounterSource for SlowCpuSource {
        fn hostname(&self) -> SampleResult<String> {
            self.0.hostname()
        }
        fn cpu_counters(&self) -> SampleResult<CpuCounters> {
            std::thread::sleep(Duration::from_millis(300));
            self.0.cpu_counters()
        }
        fn physical_core_count(&self) -> SampleResult<Option<usize>> {
            self.0.physical_core_count()
        }
        fn cpu_frequencies(&self) -> SampleResult<Vec<CpuFrequency>> {
            self.0.cpu_frequencies()
        }
        fn load_average(&self) -> SampleResult<LoadAverage> {
            self.0.load_average()
        }
        fn memory_counters(&self) -> SampleResult<MemoryCounters> {
            self.0.memory_counters()
        }
        fn mounted_partitions(&self) -> SampleResult<Vec<Partition>> {
            self.0.mounted_partitions()
        }
        fn filesystem_stats(&self) -> SampleResult<FsStats> {
            self.0.filesystem_stats()
        }
        fn disk_io_counters(&self) -> SampleResult<Vec<DiskIoCounters>> {
            self.0.disk_io_counters()
        }
        fn net_io_counters(&self) -> SampleResult<BTreeMap<CompactString, NetIoCounters>> {
            self.0.net_io_counters()
        }
        fn net_if_stats(&self) -> SampleResult<BTreeMap<CompactString, NetIfStats>> {
            self.0.net_if_stats()
        }
    }

    #[tokio::test]
    async fn test_watchdog_marks_hung_sample_unavailable() {
        let broker = Arc::new(ScriptedBroker::default());
        let sampler = Sampler::new(Arc::new(SlowCpuSource::default()));
        let publisher = Publisher::new(broker.clone(), RetryPolicy::default());
        let mut scheduler = two_second_scheduler(sampler, publisher)
            .with_sample_timeout(Some(Duration::from_millis(50)));

        let report = scheduler.run_cycle().await;
        assert!(matches!(
            report.outcome(Category::Cpu),
            Some(CategoryOutcome::SampleFailed(SampleError::CollectionUnavailable { .. }))
        ));
        assert_eq!(report.published(), 3);
    }

    #[tokio::test]
    async fn test_cpu_window_without_watchdog_runs_off_the_runtime() {
        let broker = Arc::new(ScriptedBroker::default());
        let sampler = Sampler::new(Arc::new(StaticSource::default()))
            .with_cpu_window(Duration::from_millis(10));
        let publisher = Publisher::new(broker.clone(), RetryPolicy::default());
        let mut scheduler = two_second_scheduler(sampler, publisher);

        let report = scheduler.run_cycle().await;
        assert_eq!(report.published(), 4);
        assert_eq!(payload(&broker, "cpu_stats")["cpu_overall_percentage"], 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_between_cycles_on_cancel() {
        let broker = Arc::new(ScriptedBroker::default());
        let (mut scheduler, _) = scheduler(StaticSource::default(), &broker);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            canceller.cancel();
        });

        scheduler.run(token).await;
        // Ticks at t=0 and t=2 ran; cancellation at t=3 stopped the loop.
        assert_eq!(broker.delivered.lock().len(), 8);
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_already_cancelled() {
        let broker = Arc::new(ScriptedBroker::default());
        let (mut scheduler, _) = scheduler(StaticSource::default(), &broker);
        let token = CancellationToken::new();
        token.cancel();

        scheduler.run(token).await;
        assert!(broker.delivered.lock().is_empty());
    }

    #[test]
    fn test_heartbeat_on_second_zero() {
        let on_minute = Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let off_minute = Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 2).unwrap();
        assert!(is_heartbeat(on_minute));
        assert!(!is_heartbeat(off_minute));
    }
}
