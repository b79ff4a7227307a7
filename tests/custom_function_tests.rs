use std::sync::Arc;

use calcgrid::dispatcher::{
    DispatcherCollaborators, FailureReason, JobDispatcher, LocalCalculationNode,
};
use calcgrid::function::{
    FunctionError, FunctionExecutionContext, FunctionInputs, FunctionOutputs, FunctionRepository,
    ValuationFunction,
};
use calcgrid::functions::summing::Summing;
use calcgrid::graph::{DependencyGraph, DependencyNode};
use calcgrid::plan::{ExecutionPlan, PlanExecutor};
use calcgrid::settings::{BlacklistPolicy, DispatcherSettings, GridSettings};
use calcgrid::value::{ComputationTargetSpecification, ComputedValue, ValueSpecification};
use indexmap::IndexMap;
use serde_json::{json, Value};

#[derive(Debug)]
struct Multiplier {
    value: f64,
}

impl ValuationFunction for Multiplier {
    fn configure(parameters: &Value) -> Result<Self, FunctionError> {
        // NOTE: purposefully can fail to test configuration error handling
        let multiplier = parameters["multiplier"]
            .as_f64()
            .ok_or_else(|| FunctionError::Configuration("multiplier must be a number".to_string()))?;
        Ok(Self { value: multiplier })
    }

    fn execute(
        &self,
        context: &FunctionExecutionContext<'_>,
        inputs: &FunctionInputs,
    ) -> Result<FunctionOutputs, FunctionError> {
        let mut total = 0.0;
        for (spec, value) in inputs.iter() {
            total += value
                .as_double()
                .ok_or_else(|| FunctionError::Execution(format!("{spec} is not a number")))?;
        }
        Ok(context
            .desired_outputs
            .iter()
            .map(|spec| (spec.clone(), ComputedValue::Double(total * self.value)))
            .collect())
    }
}

fn setup_test_repository() -> Arc<FunctionRepository> {
    let mut repository = FunctionRepository::new();
    repository.register::<Summing>("Summing");
    repository.register::<Multiplier>("Multiplier");
    Arc::new(repository)
}

fn target() -> ComputationTargetSpecification {
    ComputationTargetSpecification::security("ISIN", "XS0000000001")
}

fn spec(name: &str, function: &str) -> ValueSpecification {
    ValueSpecification::produced_by(name, target(), function)
}

fn dispatcher() -> JobDispatcher {
    // Faults are expected here; keep the function off the blacklist.
    let settings = GridSettings {
        blacklist: BlacklistPolicy::disabled(),
        ..GridSettings::default()
    };
    let dispatcher = JobDispatcher::new(DispatcherSettings::default(), DispatcherCollaborators::new(&settings));
    dispatcher.add_node(Arc::new(LocalCalculationNode::new("local", setup_test_repository())));
    dispatcher
}

fn chain(multiplier_parameters: Value) -> DependencyGraph {
    DependencyGraph::builder("Default")
        .node(
            DependencyNode::new("shifted", "Summing", target())
                .with_parameters(json!({ "offset": 5.0 }))
                .with_input(spec("Spot", "MarketData"))
                .with_output(spec("Shifted", "Summing")),
        )
        .node(
            DependencyNode::new("scaled", "Multiplier", target())
                .with_parameters(multiplier_parameters)
                .with_input(spec("Shifted", "Summing"))
                .with_output(spec("Scaled", "Multiplier")),
        )
        .node(
            DependencyNode::new("reported", "Summing", target())
                .with_input(spec("Scaled", "Multiplier"))
                .with_output(spec("Reported", "Summing")),
        )
        .build()
        .expect("Valid graph")
}

fn spot(value: f64) -> IndexMap<ValueSpecification, ComputedValue> {
    let mut market_data = IndexMap::new();
    market_data.insert(spec("Spot", "MarketData"), ComputedValue::Double(value));
    market_data
}

#[test]
fn test_repository_rejects_bad_parameters() {
    let repository = setup_test_repository();
    assert!(repository.contains("Multiplier"));
    assert!(repository.get_configured("Multiplier", &json!({ "multiplier": 2.0 })).is_ok());

    let err = repository
        .get_configured("Multiplier", &json!({ "multiplier": "two" }))
        .err()
        .expect("Configuration error");
    assert_eq!(
        err,
        FunctionError::Configuration("multiplier must be a number".to_string())
    );

    let err = repository
        .get_configured("Divider", &Value::Null)
        .err()
        .expect("Unknown function");
    assert_eq!(err, FunctionError::UnknownFunction("Divider".to_string()));
}

#[tokio::test]
async fn test_custom_function_in_a_chain() {
    let executor = PlanExecutor::new(
        ExecutionPlan::new(Arc::new(chain(json!({ "multiplier": 2.0 }))), spot(10.0)),
        dispatcher(),
    );
    executor.start().expect("Plan started");
    let result = executor.get().await.expect("Completed");

    assert_eq!(result.values.get(&spec("Shifted", "Summing")), Some(&ComputedValue::Double(15.0)));
    assert_eq!(result.values.get(&spec("Scaled", "Multiplier")), Some(&ComputedValue::Double(30.0)));
    assert_eq!(result.values.get(&spec("Reported", "Summing")), Some(&ComputedValue::Double(30.0)));
    assert!(!result.is_partial());
}

#[tokio::test]
async fn test_misconfigured_function_fails_its_dependants() {
    let executor = PlanExecutor::new(
        ExecutionPlan::new(Arc::new(chain(json!({}))), spot(10.0)),
        dispatcher(),
    );
    executor.start().expect("Plan started");
    let result = executor.get().await.expect("Partial result");

    assert_eq!(result.values.get(&spec("Shifted", "Summing")), Some(&ComputedValue::Double(15.0)));
    match result.failures.get(&spec("Scaled", "Multiplier")) {
        Some(FailureReason::FunctionFault(message)) => {
            assert!(message.contains("multiplier must be a number"));
        }
        other => panic!("Expected a function fault, got {other:?}"),
    }
    assert_eq!(
        result.failures.get(&spec("Reported", "Summing")),
        Some(&FailureReason::MissingInputs)
    );
    assert_eq!(result.item_count, 3);
}

#[tokio::test]
async fn test_execution_error_is_reported_per_item() {
    let mut market_data = spot(10.0);
    market_data.insert(spec("Spot", "MarketData"), ComputedValue::Text("n/a".to_string()));
    let executor = PlanExecutor::new(
        ExecutionPlan::new(Arc::new(chain(json!({ "multiplier": 2.0 }))), market_data),
        dispatcher(),
    );
    executor.start().expect("Plan started");
    let result = executor.get().await.expect("Partial result");

    assert!(result.values.is_empty());
    assert!(matches!(
        result.failures.get(&spec("Shifted", "Summing")),
        Some(FailureReason::FunctionFault(_))
    ));
    assert_eq!(result.failures.len(), 3);
}
