//! Best-effort statistics sinks. None of these report errors to their caller:
//! a sample that cannot be recorded is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cost::{CostKey, FunctionCostRecord, FunctionCostStore};

pub trait FunctionInvocationStatisticsGatherer: Send + Sync {
    fn function_invoked(
        &self,
        configuration_name: &str,
        function_id: &str,
        invocation_count: u64,
        execution_nanos: f64,
        input_bytes: f64,
        output_bytes: f64,
    );
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingInvocationStatisticsGatherer;

impl FunctionInvocationStatisticsGatherer for DiscardingInvocationStatisticsGatherer {
    fn function_invoked(&self, _: &str, _: &str, _: u64, _: f64, _: f64, _: f64) {}
}

#[derive(Debug, Default, Clone, Copy)]
struct PendingSamples {
    invocations: u64,
    execution_nanos: f64,
    input_bytes: f64,
    output_bytes: f64,
}

/// Accumulates invocation samples and folds them into the cost store.
///
/// Samples are summed per key on the hot path; [`flush`](Self::flush) turns
/// each pending batch into a per-invocation mean and blends it into the stored
/// record with an exponential decay weighted by the batch's invocation count.
pub struct FunctionCostStatisticsGatherer {
    store: Arc<dyn FunctionCostStore>,
    pending: DashMap<CostKey, PendingSamples>,
    /// Weight of a single invocation in the moving aggregate.
    decay: f64,
}

impl FunctionCostStatisticsGatherer {
    pub const DEFAULT_DECAY: f64 = 0.05;

    pub fn new(store: Arc<dyn FunctionCostStore>) -> Self {
        Self::with_decay(store, Self::DEFAULT_DECAY)
    }

    pub fn with_decay(store: Arc<dyn FunctionCostStore>, decay: f64) -> Self {
        Self {
            store,
            pending: DashMap::new(),
            decay: decay.clamp(f64::EPSILON, 1.0),
        }
    }

    pub fn pending_keys(&self) -> usize {
        self.pending.len()
    }

    /// Writes every pending batch to the cost store; returns how many records
    /// were written. Batches that fail to store are dropped.
    pub async fn flush(&self) -> usize {
        let keys: Vec<CostKey> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut written = 0;
        for key in keys {
            let Some((_, samples)) = self.pending.remove(&key) else {
                continue;
            };
            if samples.invocations == 0 {
                continue;
            }
            let n = samples.invocations as f64;
            let batch = FunctionCostRecord::new(
                key.configuration_name.clone(),
                key.function_id.clone(),
                samples.execution_nanos / n,
                samples.input_bytes / n,
                samples.output_bytes / n,
            );

            let previous = match self
                .store
                .load(&key.configuration_name, &key.function_id, None)
                .await
            {
                Ok(previous) => previous,
                Err(e) => {
                    warn!("Dropping cost samples for {}: {e}", key.function_id);
                    continue;
                }
            };
            let record = match previous {
                Some(previous) => self.blend(&previous, &batch, samples.invocations),
                None => batch,
            };

            match self.store.store(record).await {
                Ok(_) => written += 1,
                Err(e) => warn!("Dropping cost samples for {}: {e}", key.function_id),
            }
        }
        debug!("Flushed {written} function cost records");
        written
    }

    fn blend(
        &self,
        previous: &FunctionCostRecord,
        batch: &FunctionCostRecord,
        invocations: u64,
    ) -> FunctionCostRecord {
        let exponent = i32::try_from(invocations).unwrap_or(i32::MAX);
        let weight = 1.0 - (1.0 - self.decay).powi(exponent);
        let mix = |old: f64, new: f64| old + (new - old) * weight;
        FunctionCostRecord::new(
            previous.configuration_name.clone(),
            previous.function_id.clone(),
            mix(previous.invocation_nanos, batch.invocation_nanos),
            mix(previous.data_input_bytes, batch.data_input_bytes),
            mix(previous.data_output_bytes, batch.data_output_bytes),
        )
    }

    /// Flushes on a fixed interval until the returned task is aborted.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let gatherer = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                gatherer.flush().await;
            }
        })
    }
}

impl FunctionInvocationStatisticsGatherer for FunctionCostStatisticsGatherer {
    fn function_invoked(
        &self,
        configuration_name: &str,
        function_id: &str,
        invocation_count: u64,
        execution_nanos: f64,
        input_bytes: f64,
        output_bytes: f64,
    ) {
        if invocation_count == 0 || !execution_nanos.is_finite() {
            return;
        }
        let mut entry = self
            .pending
            .entry(CostKey::new(configuration_name, function_id))
            .or_default();
        entry.invocations += invocation_count;
        entry.execution_nanos += execution_nanos;
        entry.input_bytes += input_bytes;
        entry.output_bytes += output_bytes;
    }
}

pub trait CalculationNodeStatisticsGatherer: Send + Sync {
    fn job_completed(&self, node_id: &str, job_items: u64, execution_nanos: u64, duration_nanos: u64);

    fn job_failed(&self, node_id: &str, duration_nanos: u64);

    /// Recent failure rate of the node in `[0, 1]`, used to deprioritise it.
    fn recent_failure_rate(&self, _node_id: &str) -> f64 {
        0.0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingNodeStatisticsGatherer;

impl CalculationNodeStatisticsGatherer for DiscardingNodeStatisticsGatherer {
    fn job_completed(&self, _: &str, _: u64, _: u64, _: u64) {}

    fn job_failed(&self, _: &str, _: u64) {}
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct NodeStatistics {
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub job_items: u64,
    pub execution_nanos: u64,
    pub duration_nanos: u64,
    /// Exponentially decayed failure indicator.
    pub recent_failure_rate: f64,
}

impl NodeStatistics {
    /// Share of the round-trip spent outside the node's own computation.
    pub fn overhead_fraction(&self) -> f64 {
        if self.duration_nanos == 0 {
            return 0.0;
        }
        let overhead = self.duration_nanos.saturating_sub(self.execution_nanos);
        overhead as f64 / self.duration_nanos as f64
    }
}

/// Keeps running totals per calculation node.
#[derive(Debug)]
pub struct TotallingNodeStatisticsGatherer {
    nodes: DashMap<String, NodeStatistics>,
    failure_decay: f64,
}

impl Default for TotallingNodeStatisticsGatherer {
    fn default() -> Self {
        Self::new(0.3)
    }
}

impl TotallingNodeStatisticsGatherer {
    pub fn new(failure_decay: f64) -> Self {
        Self {
            nodes: DashMap::new(),
            failure_decay: failure_decay.clamp(0.0, 1.0),
        }
    }

    pub fn snapshot(&self, node_id: &str) -> Option<NodeStatistics> {
        self.nodes.get(node_id).map(|s| *s)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|e| e.key().clone()).collect()
    }

    pub fn reset(&self) {
        self.nodes.clear();
    }
}

impl CalculationNodeStatisticsGatherer for TotallingNodeStatisticsGatherer {
    fn job_completed(&self, node_id: &str, job_items: u64, execution_nanos: u64, duration_nanos: u64) {
        let mut stats = self.nodes.entry(node_id.to_string()).or_default();
        stats.successful_jobs += 1;
        stats.job_items += job_items;
        stats.execution_nanos += execution_nanos;
        stats.duration_nanos += duration_nanos;
        stats.recent_failure_rate *= 1.0 - self.failure_decay;
    }

    fn job_failed(&self, node_id: &str, duration_nanos: u64) {
        let mut stats = self.nodes.entry(node_id.to_string()).or_default();
        stats.failed_jobs += 1;
        stats.duration_nanos += duration_nanos;
        stats.recent_failure_rate += (1.0 - stats.recent_failure_rate) * self.failure_decay;
    }

    fn recent_failure_rate(&self, node_id: &str) -> f64 {
        self.nodes.get(node_id).map_or(0.0, |s| s.recent_failure_rate)
    }
}

pub trait GraphExecutionStatisticsGatherer: Send + Sync {
    fn graph_executed(
        &self,
        configuration_name: &str,
        item_count: u64,
        executed_items: u64,
        failed_items: u64,
        duration_nanos: u64,
    );
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingGraphStatisticsGatherer;

impl GraphExecutionStatisticsGatherer for DiscardingGraphStatisticsGatherer {
    fn graph_executed(&self, _: &str, _: u64, _: u64, _: u64, _: u64) {}
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct GraphExecutionStatistics {
    pub processed_graphs: u64,
    pub total_items: u64,
    pub executed_items: u64,
    pub failed_items: u64,
    pub duration_nanos: u64,
}

impl GraphExecutionStatistics {
    pub fn average_graph_size(&self) -> f64 {
        if self.processed_graphs == 0 {
            0.0
        } else {
            self.total_items as f64 / self.processed_graphs as f64
        }
    }
}

/// Totals per calculation configuration.
#[derive(Debug, Default)]
pub struct TotallingGraphStatisticsGatherer {
    configurations: DashMap<String, GraphExecutionStatistics>,
}

impl TotallingGraphStatisticsGatherer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, configuration_name: &str) -> Option<GraphExecutionStatistics> {
        self.configurations.get(configuration_name).map(|s| *s)
    }
}

impl GraphExecutionStatisticsGatherer for TotallingGraphStatisticsGatherer {
    fn graph_executed(
        &self,
        configuration_name: &str,
        item_count: u64,
        executed_items: u64,
        failed_items: u64,
        duration_nanos: u64,
    ) {
        let mut stats = self
            .configurations
            .entry(configuration_name.to_string())
            .or_default();
        stats.processed_graphs += 1;
        stats.total_items += item_count;
        stats.executed_items += executed_items;
        stats.failed_items += failed_items;
        stats.duration_nanos += duration_nanos;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::InMemoryFunctionCostStore;

    #[tokio::test]
    async fn folds_samples_into_cost_store() {
        let store = Arc::new(InMemoryFunctionCostStore::new());
        let gatherer = FunctionCostStatisticsGatherer::with_decay(store.clone(), 0.5);

        gatherer.function_invoked("Default", "Discounting", 2, 4000.0, 200.0, 20.0);
        gatherer.function_invoked("Default", "Discounting", 2, 4000.0, 200.0, 20.0);
        assert_eq!(gatherer.pending_keys(), 1);
        assert_eq!(gatherer.flush().await, 1);
        assert_eq!(gatherer.pending_keys(), 0);

        let first = store
            .load("Default", "Discounting", None)
            .await
            .expect("loaded")
            .expect("present");
        assert_eq!(first.invocation_nanos, 2000.0);
        assert_eq!(first.data_input_bytes, 100.0);
        assert_eq!(first.data_output_bytes, 10.0);

        gatherer.function_invoked("Default", "Discounting", 1, 4000.0, 100.0, 10.0);
        gatherer.flush().await;
        let second = store
            .load("Default", "Discounting", None)
            .await
            .expect("loaded")
            .expect("present");
        assert_eq!(second.invocation_nanos, 3000.0);
        assert!(second.version > first.version);
    }

    #[test]
    fn node_failure_rate_rises_and_decays() {
        let gatherer = TotallingNodeStatisticsGatherer::new(0.5);
        gatherer.job_failed("node-a", 1_000);
        gatherer.job_failed("node-a", 1_000);
        assert_eq!(gatherer.recent_failure_rate("node-a"), 0.75);

        gatherer.job_completed("node-a", 4, 500, 1_000);
        assert_eq!(gatherer.recent_failure_rate("node-a"), 0.375);

        let stats = gatherer.snapshot("node-a").expect("tracked");
        assert_eq!(stats.failed_jobs, 2);
        assert_eq!(stats.successful_jobs, 1);
        assert_eq!(stats.job_items, 4);
        assert_eq!(stats.duration_nanos, 3_000);
        assert_eq!(gatherer.recent_failure_rate("node-b"), 0.0);
    }

    #[test]
    fn graph_statistics_total_per_configuration() {
        let gatherer = TotallingGraphStatisticsGatherer::new();
        gatherer.graph_executed("Default", 10, 9, 1, 100);
        gatherer.graph_executed("Default", 20, 20, 0, 100);
        let stats = gatherer.snapshot("Default").expect("tracked");
        assert_eq!(stats.processed_graphs, 2);
        assert_eq!(stats.failed_items, 1);
        assert_eq!(stats.average_graph_size(), 15.0);
        assert!(gatherer.snapshot("Other").is_none());
    }
}
