use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::json;
use tokio::time::timeout;

use super::*;
use crate::dispatcher::{
    CalculationJob, CalculationJobResult, CalculationNode, DispatcherCollaborators, FixedSizeJobSizer,
    LocalCalculationNode, NodeFault,
};
use crate::function::FunctionRepository;
use crate::functions::{fault_injector::FaultInjector, summing::Summing};
use crate::graph::DependencyNode;
use crate::settings::{DispatcherSettings, GridSettings};
use crate::stats::TotallingGraphStatisticsGatherer;
use crate::value::ComputationTargetSpecification;

fn target() -> ComputationTargetSpecification {
    ComputationTargetSpecification::security("TICKER", "ACME")
}

fn spec(name: &str, function: &str) -> ValueSpecification {
    ValueSpecification::produced_by(name, target(), function)
}

fn local_dispatcher(items_per_job: usize, capacity: usize) -> JobDispatcher {
    let mut repository = FunctionRepository::new();
    repository.register::<Summing>("Summing");
    repository.register::<FaultInjector>("FaultInjector");
    let collaborators = DispatcherCollaborators::new(&GridSettings::default())
        .with_job_sizer(Arc::new(FixedSizeJobSizer::new(items_per_job)));
    let dispatcher = JobDispatcher::new(DispatcherSettings::default(), collaborators);
    dispatcher.add_node(Arc::new(
        LocalCalculationNode::new("local", Arc::new(repository)).with_capacity(capacity),
    ));
    dispatcher
}

fn sleeping_graph(count: usize, sleep_ms: u64) -> Arc<DependencyGraph> {
    let mut builder = DependencyGraph::builder("Default");
    for i in 0..count {
        builder = builder.node(
            DependencyNode::new(format!("sleep-{i}"), "FaultInjector", target())
                .with_parameters(json!({ "sleep_duration_ms": sleep_ms }))
                .with_output(spec(&format!("Out{i}"), "FaultInjector")),
        );
    }
    Arc::new(builder.build().expect("valid graph"))
}

struct StuckNode;

#[async_trait]
impl CalculationNode for StuckNode {
    fn node_id(&self) -> &str {
        "stuck"
    }

    async fn submit(&self, _job: CalculationJob) -> Result<CalculationJobResult, NodeFault> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err(NodeFault::Communication("gave up".to_string()))
    }
}

#[tokio::test]
async fn values_flow_from_market_data_through_dependants() {
    let graph = DependencyGraph::builder("Default")
        .node(
            DependencyNode::new("total", "Summing", target())
                .with_input(spec("Shifted", "Summing"))
                .with_input(spec("Spot", "MarketData"))
                .with_output(spec("Total", "Summing")),
        )
        .node(
            DependencyNode::new("shifted", "Summing", target())
                .with_parameters(json!({ "offset": 1.0 }))
                .with_input(spec("Spot", "MarketData"))
                .with_output(spec("Shifted", "Summing")),
        )
        .build()
        .expect("valid graph");
    let mut market_data = IndexMap::new();
    market_data.insert(spec("Spot", "MarketData"), ComputedValue::Double(10.0));

    let executor = PlanExecutor::new(
        ExecutionPlan::new(Arc::new(graph), market_data),
        local_dispatcher(10, 1),
    );
    executor.start().expect("started");
    let result = executor.get().await.expect("completed");

    assert_eq!(executor.state(), PlanState::Completed);
    assert_eq!(result.values.get(&spec("Shifted", "Summing")), Some(&ComputedValue::Double(11.0)));
    assert_eq!(result.values.get(&spec("Total", "Summing")), Some(&ComputedValue::Double(21.0)));
    assert!(!result.is_partial());
    assert_eq!(result.item_count, 2);
}

#[tokio::test]
async fn missing_inputs_fail_without_dispatch() {
    let graph = DependencyGraph::builder("Default")
        .node(
            DependencyNode::new("needs-spot", "Summing", target())
                .with_input(spec("Spot", "MarketData"))
                .with_output(spec("A", "Summing")),
        )
        .node(
            DependencyNode::new("downstream", "Summing", target())
                .with_input(spec("A", "Summing"))
                .with_output(spec("B", "Summing")),
        )
        .node(DependencyNode::new("independent", "Summing", target()).with_output(spec("C", "Summing")))
        .build()
        .expect("valid graph");
    let dispatcher = local_dispatcher(10, 1);
    let executor = PlanExecutor::new(
        ExecutionPlan::new(Arc::new(graph), IndexMap::new()),
        dispatcher.clone(),
    );
    executor.start().expect("started");
    let result = executor.get().await.expect("completed");

    assert_eq!(executor.state(), PlanState::Completed);
    assert!(result.is_partial());
    assert_eq!(result.failures.get(&spec("A", "Summing")), Some(&FailureReason::MissingInputs));
    assert_eq!(result.failures.get(&spec("B", "Summing")), Some(&FailureReason::MissingInputs));
    assert_eq!(result.values.get(&spec("C", "Summing")), Some(&ComputedValue::Double(0.0)));
    assert_eq!(dispatcher.submitted_item_count(), 1);
}

#[tokio::test]
async fn starting_twice_is_an_error() {
    let executor = PlanExecutor::new(
        ExecutionPlan::new(sleeping_graph(1, 0), IndexMap::new()),
        local_dispatcher(10, 1),
    );
    executor.start().expect("started");
    assert!(matches!(executor.start(), Err(PlanError::AlreadyStarted)));
    executor.get().await.expect("completed");
}

#[tokio::test]
async fn concurrent_waiters_share_one_result() {
    let executor = PlanExecutor::new(
        ExecutionPlan::new(sleeping_graph(3, 10), IndexMap::new()),
        local_dispatcher(1, 2),
    );
    executor.start().expect("started");

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let executor = executor.clone();
            tokio::spawn(async move { executor.get().await })
        })
        .collect();
    let mut results = Vec::new();
    for waiter in waiters {
        results.push(waiter.await.expect("waiter finished").expect("completed"));
    }

    assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    assert_eq!(results[0].values.len(), 3);
    let again = executor.get().await.expect("cached");
    assert!(Arc::ptr_eq(&again, &results[0]));
}

#[tokio::test]
async fn cancel_with_interrupt_unblocks_waiters() {
    let dispatcher = JobDispatcher::new(
        DispatcherSettings::default(),
        DispatcherCollaborators::new(&GridSettings::default()),
    );
    dispatcher.add_node(Arc::new(StuckNode));
    let executor = PlanExecutor::new(
        ExecutionPlan::new(sleeping_graph(5, 0), IndexMap::new()),
        dispatcher,
    );
    executor.start().expect("started");

    let waiter = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.get().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(executor.cancel(true));

    let outcome = timeout(Duration::from_secs(1), waiter)
        .await
        .expect("unblocked in time")
        .expect("waiter finished");
    assert!(matches!(outcome, Err(PlanError::Cancelled)));
    assert_eq!(executor.state(), PlanState::Cancelled);
    assert!(!executor.cancel(true));
}

#[tokio::test]
async fn timed_out_get_leaves_the_plan_running() {
    let executor = PlanExecutor::new(
        ExecutionPlan::new(sleeping_graph(1, 200), IndexMap::new()),
        local_dispatcher(10, 1),
    );
    executor.start().expect("started");

    let outcome = executor.get_timeout(Duration::from_millis(20)).await;
    assert!(matches!(outcome, Err(PlanError::Timeout(_))));
    assert_eq!(executor.state(), PlanState::Running);

    let result = executor.get().await.expect("completed later");
    assert_eq!(result.values.len(), 1);
    assert_eq!(executor.state(), PlanState::Completed);
}

#[tokio::test]
async fn cancel_without_interrupt_drains_running_jobs() {
    let dispatcher = local_dispatcher(1, 1);
    let executor = PlanExecutor::new(
        ExecutionPlan::new(sleeping_graph(2, 300), IndexMap::new()),
        dispatcher.clone(),
    );
    executor.start().expect("started");
    timeout(Duration::from_secs(2), async {
        while dispatcher.submitted_item_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first job submitted");

    assert!(executor.cancel(false));
    assert_eq!(executor.state(), PlanState::Running);
    assert!(matches!(executor.get().await, Err(PlanError::Cancelled)));
    assert_eq!(dispatcher.submitted_item_count(), 1);
}

#[tokio::test]
async fn cancel_before_start() {
    let executor = PlanExecutor::new(
        ExecutionPlan::new(sleeping_graph(1, 0), IndexMap::new()),
        local_dispatcher(10, 1),
    );
    assert!(executor.cancel(false));
    assert!(matches!(executor.start(), Err(PlanError::AlreadyStarted)));
    assert!(matches!(executor.get().await, Err(PlanError::Cancelled)));
}

#[tokio::test]
async fn completion_reports_graph_statistics() {
    let statistics = Arc::new(TotallingGraphStatisticsGatherer::new());
    let graph = DependencyGraph::builder("Risk")
        .node(DependencyNode::new("ok", "Summing", target()).with_output(spec("Ok", "Summing")))
        .node(
            DependencyNode::new("broken", "FaultInjector", target())
                .with_parameters(json!({ "fail": true }))
                .with_output(spec("Broken", "FaultInjector")),
        )
        .build()
        .expect("valid graph");
    let executor = PlanExecutor::new(
        ExecutionPlan::new(Arc::new(graph), IndexMap::new()),
        local_dispatcher(10, 1),
    )
    .with_graph_statistics(statistics.clone());
    executor.start().expect("started");
    let result = executor.get().await.expect("completed");

    assert!(matches!(
        result.failures.get(&spec("Broken", "FaultInjector")),
        Some(FailureReason::FunctionFault(_))
    ));
    let totals = statistics.snapshot("Risk").expect("reported");
    assert_eq!(totals.processed_graphs, 1);
    assert_eq!(totals.executed_items, 1);
    assert_eq!(totals.failed_items, 1);
}

#[tokio::test]
async fn empty_graph_completes_at_once() {
    let graph = DependencyGraph::builder("Default").build().expect("valid graph");
    let executor = PlanExecutor::new(
        ExecutionPlan::new(Arc::new(graph), IndexMap::new()),
        local_dispatcher(10, 1),
    );
    executor.start().expect("started");
    let result = executor
        .get_timeout(Duration::from_secs(1))
        .await
        .expect("completed");
    assert!(result.values.is_empty());
    assert_eq!(result.item_count, 0);
}

#[tokio::test]
async fn graph_statistics_attach_to_a_shared_executor() {
    let statistics = Arc::new(TotallingGraphStatisticsGatherer::new());
    let executor = PlanExecutor::new(
        ExecutionPlan::new(sleeping_graph(2, 0), IndexMap::new()),
        local_dispatcher(10, 1),
    );
    let waiter = executor.clone();
    let executor = executor.with_graph_statistics(statistics.clone());
    executor.start().expect("started");
    waiter.get().await.expect("completed");

    let totals = statistics.snapshot("Default").expect("reported");
    assert_eq!(totals.processed_graphs, 1);
    assert_eq!(totals.executed_items, 2);
}
