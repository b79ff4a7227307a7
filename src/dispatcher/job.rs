use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::function::{FunctionInputs, FunctionOutputs};
use crate::graph::{DependencyNode, NodeIndex};
use crate::value::{ComputationTargetSpecification, FunctionId, ValueSpecification};

/// One function invocation with its resolved inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobItem {
    pub item_id: NodeIndex,
    pub function_id: FunctionId,
    pub parameters: Value,
    pub target: ComputationTargetSpecification,
    pub inputs: FunctionInputs,
    pub outputs: Vec<ValueSpecification>,
}

impl JobItem {
    pub fn from_node(item_id: NodeIndex, node: &DependencyNode, inputs: FunctionInputs) -> Self {
        Self {
            item_id,
            function_id: node.function_id.clone(),
            parameters: node.parameters.clone(),
            target: node.target.clone(),
            inputs,
            outputs: node.outputs.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpecification {
    pub job_id: Uuid,
    pub plan_id: Uuid,
    pub configuration_name: String,
    /// Starts at 1; only wholesale node faults advance it.
    pub attempt: u32,
}

impl JobSpecification {
    pub fn new(plan_id: Uuid, configuration_name: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            plan_id,
            configuration_name: configuration_name.into(),
            attempt: 1,
        }
    }

    /// Specification of a new job replacing this one.
    #[must_use]
    pub fn resubmitted(&self, attempt: u32) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            plan_id: self.plan_id,
            configuration_name: self.configuration_name.clone(),
            attempt,
        }
    }
}

/// A batch of items sent to one node in one round trip. Retries build a new
/// job; a job is never changed once created.
#[derive(Debug, Clone)]
pub struct CalculationJob {
    pub specification: JobSpecification,
    pub items: Arc<Vec<JobItem>>,
}

impl CalculationJob {
    pub fn new(specification: JobSpecification, items: Vec<JobItem>) -> Self {
        Self {
            specification,
            items: Arc::new(items),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum FailureReason {
    #[error("function fault: {0}")]
    FunctionFault(String),
    #[error("function is blacklisted")]
    FunctionBlacklisted,
    #[error("inputs are missing")]
    MissingInputs,
    #[error("transport fault: {0}")]
    TransportFault(String),
    #[error("plan retry budget exhausted")]
    RetryBudgetExhausted,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::FunctionFault(_) => "FUNCTION_FAULT",
            FailureReason::FunctionBlacklisted => "FUNCTION_BLACKLISTED",
            FailureReason::MissingInputs => "MISSING_INPUTS",
            FailureReason::TransportFault(_) => "TRANSPORT_FAULT",
            FailureReason::RetryBudgetExhausted => "RETRY_BUDGET_EXHAUSTED",
        }
    }
}

/// Outcome of one item, as reported by the node that ran its job.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemResult {
    Success {
        values: FunctionOutputs,
        execution_nanos: u64,
        input_bytes: u64,
        output_bytes: u64,
    },
    Failure(FailureReason),
    /// The node gave up on the item without invoking it.
    NotExecuted,
}

#[derive(Debug, Clone)]
pub struct CalculationJobResult {
    pub specification: JobSpecification,
    pub node_id: String,
    /// One entry per job item, in job order. Items past the end count as not executed.
    pub item_results: Vec<ItemResult>,
    /// Pure compute time reported by the node.
    pub execution_nanos: u64,
}

/// A failure of the whole round trip, not attributable to any item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeFault {
    #[error("node {0} is unreachable")]
    Unreachable(String),
    #[error("job timed out after {0:?}")]
    Timeout(Duration),
    #[error("communication fault: {0}")]
    Communication(String),
}
