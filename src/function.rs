use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

use crate::value::{ComputationTargetSpecification, ComputedValue, FunctionId, ValueSpecification};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FunctionError {
    #[error("no function registered as {0}")]
    UnknownFunction(FunctionId),
    #[error("invalid function parameters: {0}")]
    Configuration(String),
    #[error("missing input {0}")]
    MissingInput(String),
    #[error("{0}")]
    Execution(String),
}

/// Resolved input values of one invocation, in the graph's input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionInputs {
    values: IndexMap<ValueSpecification, ComputedValue>,
}

impl FunctionInputs {
    pub fn new(values: IndexMap<ValueSpecification, ComputedValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, specification: &ValueSpecification) -> Option<&ComputedValue> {
        self.values.get(specification)
    }

    /// First input with the given value name.
    pub fn value(&self, value_name: &str) -> Option<&ComputedValue> {
        self.values
            .iter()
            .find(|(spec, _)| spec.value_name() == value_name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ValueSpecification, &ComputedValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn estimated_size(&self) -> u64 {
        self.values.values().map(ComputedValue::estimated_size).sum()
    }
}

pub type FunctionOutputs = IndexMap<ValueSpecification, ComputedValue>;

/// What a function knows about the invocation it is serving.
#[derive(Debug, Clone)]
pub struct FunctionExecutionContext<'a> {
    pub configuration_name: &'a str,
    pub function_id: &'a str,
    pub target: &'a ComputationTargetSpecification,
    pub desired_outputs: &'a [ValueSpecification],
}

/// A valuation function as deployed on a calculation node. The numerical
/// content lives outside this crate; the scheduler only needs to configure and
/// invoke it.
pub trait ValuationFunction: Send + Sync + 'static {
    fn configure(parameters: &Value) -> Result<Self, FunctionError>
    where
        Self: Sized;

    fn execute(
        &self,
        context: &FunctionExecutionContext<'_>,
        inputs: &FunctionInputs,
    ) -> Result<FunctionOutputs, FunctionError>;
}

type FunctionFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn ValuationFunction>, FunctionError> + Send + Sync>;

/// Maps function ids to factories producing configured instances.
#[derive(Clone, Default)]
pub struct FunctionRepository {
    functions: HashMap<FunctionId, FunctionFactory>,
}

impl FunctionRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F: ValuationFunction>(&mut self, function_id: &str) {
        self.functions.insert(
            function_id.to_string(),
            Arc::new(|parameters| {
                F::configure(parameters).map(|f| Arc::new(f) as Arc<dyn ValuationFunction>)
            }),
        );
    }

    pub fn contains(&self, function_id: &str) -> bool {
        self.functions.contains_key(function_id)
    }

    /// Builds a configured instance of `function_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the function is not registered or rejects its parameters.
    pub fn get_configured(
        &self,
        function_id: &str,
        parameters: &Value,
    ) -> Result<Arc<dyn ValuationFunction>, FunctionError> {
        let factory = self
            .functions
            .get(function_id)
            .ok_or_else(|| FunctionError::UnknownFunction(function_id.to_string()))?;
        factory(parameters)
    }
}

impl std::fmt::Debug for FunctionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRepository")
            .field("registered_functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}
