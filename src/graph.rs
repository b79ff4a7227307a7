use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::value::{ComputationTargetSpecification, FunctionId, ValueSpecification};

/// Position of a node within its graph; doubles as the job item id.
pub type NodeIndex = usize;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphError {
    #[error("invalid graph configuration: {0}")]
    InvalidConfiguration(String),
    #[error("calculation configuration name cannot be empty")]
    EmptyConfigurationName,
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),
    #[error("node {0} produces no outputs")]
    NoOutputs(String),
    #[error("{specification} is produced by both {first} and {second}")]
    DuplicateProducer {
        specification: String,
        first: String,
        second: String,
    },
    #[error("cycle detected in the dependency graph")]
    CycleDetected,
}

/// One function invocation in a compiled graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub id: String,
    pub function_id: FunctionId,
    #[serde(default)]
    pub parameters: Value,
    pub target: ComputationTargetSpecification,
    #[serde(default)]
    pub inputs: BTreeSet<ValueSpecification>,
    pub outputs: BTreeSet<ValueSpecification>,
}

impl DependencyNode {
    pub fn new(
        id: impl Into<String>,
        function_id: impl Into<FunctionId>,
        target: ComputationTargetSpecification,
    ) -> Self {
        Self {
            id: id.into(),
            function_id: function_id.into(),
            parameters: Value::Null,
            target,
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn with_input(mut self, input: ValueSpecification) -> Self {
        self.inputs.insert(input);
        self
    }

    #[must_use]
    pub fn with_inputs<I>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = ValueSpecification>,
    {
        self.inputs.extend(inputs);
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: ValueSpecification) -> Self {
        self.outputs.insert(output);
        self
    }
}

/// Serialized form of a compiled graph, as handed over by a graph compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub calculation_configuration: String,
    #[serde(default)]
    pub nodes: Vec<DependencyNode>,
}

/// An immutable, validated dependency graph for one calculation configuration.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    configuration_name: String,
    nodes: Vec<DependencyNode>,
    producers: HashMap<ValueSpecification, NodeIndex>,
    upstream: Vec<Vec<NodeIndex>>,
    dependants: Vec<Vec<NodeIndex>>,
    execution_order: Vec<NodeIndex>,
    market_data: BTreeSet<ValueSpecification>,
}

impl DependencyGraph {
    pub fn builder(configuration_name: impl Into<String>) -> DependencyGraphBuilder {
        DependencyGraphBuilder {
            config: GraphConfig {
                calculation_configuration: configuration_name.into(),
                nodes: Vec::new(),
            },
        }
    }

    /// Creates a graph from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON does not describe a graph, or the graph is invalid.
    pub fn from_json(json: &Value) -> Result<Self, GraphError> {
        let config: GraphConfig = serde_json::from_value(json.clone())
            .map_err(|e| GraphError::InvalidConfiguration(e.to_string()))?;
        Self::from_config(config)
    }

    /// Validates and indexes a graph.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration name is empty
    /// - Two nodes share an id
    /// - A node has no outputs
    /// - Two nodes produce the same specification
    /// - The graph contains a cycle
    pub fn from_config(config: GraphConfig) -> Result<Self, GraphError> {
        let start = Instant::now();
        if config.calculation_configuration.is_empty() {
            return Err(GraphError::EmptyConfigurationName);
        }

        let mut ids = HashSet::new();
        let mut producers: HashMap<ValueSpecification, NodeIndex> = HashMap::new();
        for (index, node) in config.nodes.iter().enumerate() {
            if !ids.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
            if node.outputs.is_empty() {
                return Err(GraphError::NoOutputs(node.id.clone()));
            }
            for output in &node.outputs {
                if let Some(&first) = producers.get(output) {
                    return Err(GraphError::DuplicateProducer {
                        specification: output.to_string(),
                        first: config.nodes[first].id.clone(),
                        second: node.id.clone(),
                    });
                }
                producers.insert(output.clone(), index);
            }
        }

        let mut upstream = vec![Vec::new(); config.nodes.len()];
        let mut dependants = vec![Vec::new(); config.nodes.len()];
        let mut market_data = BTreeSet::new();
        for (index, node) in config.nodes.iter().enumerate() {
            for input in &node.inputs {
                match producers.get(input) {
                    Some(&producer) => {
                        if !upstream[index].contains(&producer) {
                            upstream[index].push(producer);
                            dependants[producer].push(index);
                        }
                    }
                    None => {
                        market_data.insert(input.clone());
                    }
                }
            }
        }

        let execution_order = Self::compute_execution_order(&upstream, &dependants)?;

        debug!(
            "Indexed graph {} with {} nodes in {:?}",
            config.calculation_configuration,
            config.nodes.len(),
            start.elapsed()
        );
        Ok(Self {
            configuration_name: config.calculation_configuration,
            nodes: config.nodes,
            producers,
            upstream,
            dependants,
            execution_order,
            market_data,
        })
    }

    fn compute_execution_order(
        upstream: &[Vec<NodeIndex>],
        dependants: &[Vec<NodeIndex>],
    ) -> Result<Vec<NodeIndex>, GraphError> {
        let mut in_degree: Vec<usize> = upstream.iter().map(Vec::len).collect();
        let mut queue: VecDeque<NodeIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(index, _)| index)
            .collect();

        let mut sorted = Vec::with_capacity(upstream.len());
        while let Some(node) = queue.pop_front() {
            sorted.push(node);
            for &child in &dependants[node] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    queue.push_back(child);
                }
            }
        }

        if sorted.len() != upstream.len() {
            return Err(GraphError::CycleDetected);
        }
        Ok(sorted)
    }

    pub fn configuration_name(&self) -> &str {
        &self.configuration_name
    }

    pub fn nodes(&self) -> &[DependencyNode] {
        &self.nodes
    }

    pub fn node(&self, index: NodeIndex) -> Option<&DependencyNode> {
        self.nodes.get(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn producer_of(&self, specification: &ValueSpecification) -> Option<NodeIndex> {
        self.producers.get(specification).copied()
    }

    /// Nodes producing at least one input of `index`.
    pub fn upstream(&self, index: NodeIndex) -> &[NodeIndex] {
        self.upstream.get(index).map_or(&[], Vec::as_slice)
    }

    /// Nodes consuming at least one output of `index`.
    pub fn dependants(&self, index: NodeIndex) -> &[NodeIndex] {
        self.dependants.get(index).map_or(&[], Vec::as_slice)
    }

    pub fn execution_order(&self) -> &[NodeIndex] {
        &self.execution_order
    }

    /// Inputs that no node produces; they must come from market data.
    pub fn market_data_requirements(&self) -> &BTreeSet<ValueSpecification> {
        &self.market_data
    }

    /// Outputs no other node consumes.
    pub fn terminal_outputs(&self) -> BTreeSet<&ValueSpecification> {
        let consumed: HashSet<&ValueSpecification> =
            self.nodes.iter().flat_map(|n| n.inputs.iter()).collect();
        self.nodes
            .iter()
            .flat_map(|n| n.outputs.iter())
            .filter(|spec| !consumed.contains(spec))
            .collect()
    }
}

pub struct DependencyGraphBuilder {
    config: GraphConfig,
}

impl DependencyGraphBuilder {
    #[must_use]
    pub fn node(mut self, node: DependencyNode) -> Self {
        self.config.nodes.push(node);
        self
    }

    /// # Errors
    ///
    /// See [`DependencyGraph::from_config`].
    pub fn build(self) -> Result<DependencyGraph, GraphError> {
        DependencyGraph::from_config(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ComputationTargetSpecification;
    use serde_json::json;

    fn spec(name: &str, function: &str) -> ValueSpecification {
        ValueSpecification::produced_by(
            name,
            ComputationTargetSpecification::security("TICKER", "ACME"),
            function,
        )
    }

    fn target() -> ComputationTargetSpecification {
        ComputationTargetSpecification::security("TICKER", "ACME")
    }

    #[test]
    fn orders_producers_before_consumers() {
        let graph = DependencyGraph::builder("Default")
            .node(
                DependencyNode::new("pv", "Summing", target())
                    .with_input(spec("Delta", "Summing"))
                    .with_input(spec("Price", "MarketData"))
                    .with_output(spec("PV", "Summing")),
            )
            .node(DependencyNode::new("delta", "Summing", target()).with_output(spec("Delta", "Summing")))
            .build()
            .expect("valid graph");

        assert_eq!(graph.execution_order(), &[1, 0]);
        assert_eq!(graph.upstream(0), &[1]);
        assert_eq!(graph.dependants(1), &[0]);
        assert_eq!(
            graph.market_data_requirements().iter().collect::<Vec<_>>(),
            vec![&spec("Price", "MarketData")]
        );
        assert_eq!(
            graph.terminal_outputs().into_iter().collect::<Vec<_>>(),
            vec![&spec("PV", "Summing")]
        );
    }

    #[test]
    fn rejects_cycles_and_duplicate_producers() {
        let cyclic = DependencyGraph::builder("Default")
            .node(
                DependencyNode::new("a", "Summing", target())
                    .with_input(spec("B", "Summing"))
                    .with_output(spec("A", "Summing")),
            )
            .node(
                DependencyNode::new("b", "Summing", target())
                    .with_input(spec("A", "Summing"))
                    .with_output(spec("B", "Summing")),
            )
            .build();
        assert_eq!(cyclic.unwrap_err(), GraphError::CycleDetected);

        let duplicate = DependencyGraph::builder("Default")
            .node(DependencyNode::new("a", "Summing", target()).with_output(spec("A", "Summing")))
            .node(DependencyNode::new("b", "Summing", target()).with_output(spec("A", "Summing")))
            .build();
        assert!(matches!(
            duplicate.unwrap_err(),
            GraphError::DuplicateProducer { .. }
        ));
    }

    #[test]
    fn parses_json_form() {
        let json = json!({
            "calculation_configuration": "Default",
            "nodes": [{
                "id": "pv",
                "function_id": "Summing",
                "parameters": { "offset": 1.5 },
                "target": { "target_type": "SECURITY", "id": { "scheme": "TICKER", "value": "ACME" } },
                "outputs": [{
                    "value_name": "PV",
                    "target": { "target_type": "SECURITY", "id": { "scheme": "TICKER", "value": "ACME" } },
                    "properties": { "Function": ["Summing"] }
                }]
            }]
        });

        let graph = DependencyGraph::from_json(&json).expect("valid graph");
        assert_eq!(graph.configuration_name(), "Default");
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.producer_of(&spec("PV", "Summing")), Some(0));
        assert_eq!(graph.nodes()[0].parameters["offset"], json!(1.5));
    }

    #[test]
    fn rejects_empty_configuration_name() {
        let result = DependencyGraph::from_json(&json!({ "calculation_configuration": "" }));
        assert_eq!(result.unwrap_err(), GraphError::EmptyConfigurationName);
    }
}
