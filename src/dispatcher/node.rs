use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use moka::sync::Cache;
use tracing::debug;

use super::job::{CalculationJob, CalculationJobResult, FailureReason, ItemResult, JobItem, NodeFault};
use crate::blacklist::BlacklistReplica;
use crate::function::{FunctionExecutionContext, FunctionRepository, ValuationFunction};
use crate::value::FunctionId;

/// A worker that executes jobs. Remote nodes implement this over their
/// transport; faults of the transport surface as [`NodeFault`].
#[async_trait]
pub trait CalculationNode: Send + Sync {
    fn node_id(&self) -> &str;

    /// Jobs the node accepts concurrently.
    fn capacity(&self) -> usize {
        1
    }

    async fn submit(&self, job: CalculationJob) -> Result<CalculationJobResult, NodeFault>;
}

type FunctionInstanceKey = (FunctionId, String);

/// Runs jobs in-process on the blocking pool.
#[derive(Clone)]
pub struct LocalCalculationNode {
    node_id: String,
    capacity: usize,
    repository: Arc<FunctionRepository>,
    functions: Cache<FunctionInstanceKey, Arc<dyn ValuationFunction>>,
    blacklist: Option<Arc<BlacklistReplica>>,
}

impl LocalCalculationNode {
    pub fn new(node_id: impl Into<String>, repository: Arc<FunctionRepository>) -> Self {
        Self {
            node_id: node_id.into(),
            capacity: 1,
            repository,
            functions: Cache::new(1_000),
            blacklist: None,
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Refuses items matched by the replica, as a node that has received a
    /// blacklist delta before the dispatcher acted on it would.
    #[must_use]
    pub fn with_blacklist(mut self, blacklist: Arc<BlacklistReplica>) -> Self {
        self.blacklist = Some(blacklist);
        self
    }

    fn function(&self, item: &JobItem) -> Result<Arc<dyn ValuationFunction>, FailureReason> {
        let key = (item.function_id.clone(), item.parameters.to_string());
        if let Some(function) = self.functions.get(&key) {
            return Ok(function);
        }
        let function = self
            .repository
            .get_configured(&item.function_id, &item.parameters)
            .map_err(|e| FailureReason::FunctionFault(e.to_string()))?;
        self.functions.insert(key, Arc::clone(&function));
        Ok(function)
    }

    fn execute_item(&self, configuration_name: &str, item: &JobItem) -> ItemResult {
        if let Some(blacklist) = &self.blacklist {
            if blacklist.is_blacklisted(&item.function_id, &item.parameters, &item.target) {
                return ItemResult::Failure(FailureReason::FunctionBlacklisted);
            }
        }
        let function = match self.function(item) {
            Ok(function) => function,
            Err(reason) => return ItemResult::Failure(reason),
        };

        let context = FunctionExecutionContext {
            configuration_name,
            function_id: &item.function_id,
            target: &item.target,
            desired_outputs: &item.outputs,
        };
        let start = Instant::now();
        let outcome = function.execute(&context, &item.inputs);
        let execution_nanos = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);

        match outcome {
            Ok(values) => {
                let output_bytes = values.values().map(|v| v.estimated_size()).sum();
                ItemResult::Success {
                    values,
                    execution_nanos,
                    input_bytes: item.inputs.estimated_size(),
                    output_bytes,
                }
            }
            Err(e) => {
                debug!("Item {} ({}) failed: {e}", item.item_id, item.function_id);
                ItemResult::Failure(FailureReason::FunctionFault(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl CalculationNode for LocalCalculationNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn submit(&self, job: CalculationJob) -> Result<CalculationJobResult, NodeFault> {
        let node = self.clone();
        tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let item_results = job
                .items
                .iter()
                .map(|item| node.execute_item(&job.specification.configuration_name, item))
                .collect();
            debug!(
                "Node {} ran job {} ({} items) in {:?}",
                node.node_id,
                job.specification.job_id,
                job.items.len(),
                start.elapsed()
            );
            CalculationJobResult {
                specification: job.specification,
                node_id: node.node_id,
                item_results,
                execution_nanos: u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX),
            }
        })
        .await
        .map_err(|e| NodeFault::Communication(e.to_string()))
    }
}
