use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies the function that produces a value, as registered in the
/// [`FunctionRepository`](crate::function::FunctionRepository).
pub type FunctionId = String;

/// Property carrying the id of the function that produced a specification.
pub const FUNCTION_PROPERTY: &str = "Function";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueId {
    pub scheme: String,
    pub value: String,
}

impl UniqueId {
    pub fn of(scheme: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.scheme, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputationTargetType {
    Portfolio,
    PortfolioNode,
    Position,
    Trade,
    Security,
    Primitive,
}

/// What a function operates on. Two specifications are equal when their type
/// and identifier are equal; the resolved object never takes part.
///
/// A specification without an identifier is a type-only target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputationTargetSpecification {
    pub target_type: ComputationTargetType,
    #[serde(default)]
    pub id: Option<UniqueId>,
}

impl ComputationTargetSpecification {
    pub fn of(target_type: ComputationTargetType, id: UniqueId) -> Self {
        Self {
            target_type,
            id: Some(id),
        }
    }

    #[must_use]
    pub fn type_only(target_type: ComputationTargetType) -> Self {
        Self {
            target_type,
            id: None,
        }
    }

    pub fn security(scheme: impl Into<String>, value: impl Into<String>) -> Self {
        Self::of(ComputationTargetType::Security, UniqueId::of(scheme, value))
    }

    pub fn position(scheme: impl Into<String>, value: impl Into<String>) -> Self {
        Self::of(ComputationTargetType::Position, UniqueId::of(scheme, value))
    }
}

impl fmt::Display for ComputationTargetSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{:?}[{id}]", self.target_type),
            None => write!(f, "{:?}[*]", self.target_type),
        }
    }
}

/// Property name to a set of values. As a requirement constraint an empty set
/// accepts any value for that property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueProperties(BTreeMap<String, BTreeSet<String>>);

impl ValueProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.entry(name.into()).or_default().insert(value.into());
        self
    }

    #[must_use]
    pub fn with_any(mut self, name: impl Into<String>) -> Self {
        self.0.entry(name.into()).or_default();
        self
    }

    pub fn values(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.0.get(name)
    }

    /// Returns the value of a property when it has exactly one.
    pub fn single_value(&self, name: &str) -> Option<&str> {
        let values = self.0.get(name)?;
        if values.len() == 1 {
            values.iter().next().map(String::as_str)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks whether `properties` satisfies these properties used as constraints.
    pub fn is_satisfied_by(&self, properties: &ValueProperties) -> bool {
        self.0.iter().all(|(name, wanted)| match properties.0.get(name) {
            None => false,
            Some(_) if wanted.is_empty() => true,
            Some(actual) => wanted.iter().any(|w| actual.contains(w)),
        })
    }
}

/// An abstract request for a computed quantity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueRequirement {
    pub value_name: String,
    pub target: ComputationTargetSpecification,
    #[serde(default)]
    pub constraints: ValueProperties,
}

impl ValueRequirement {
    pub fn new(value_name: impl Into<String>, target: ComputationTargetSpecification) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            constraints: ValueProperties::new(),
        }
    }

    #[must_use]
    pub fn with_constraints(mut self, constraints: ValueProperties) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn is_satisfied_by(&self, specification: &ValueSpecification) -> bool {
        self.value_name == specification.value_name
            && self.target == specification.target
            && self.constraints.is_satisfied_by(&specification.properties)
    }
}

/// The resolved description of a computed value. Used as the key of every
/// job item result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueSpecification {
    value_name: String,
    target: ComputationTargetSpecification,
    #[serde(default)]
    properties: ValueProperties,
}

impl ValueSpecification {
    pub fn new(
        value_name: impl Into<String>,
        target: ComputationTargetSpecification,
        properties: ValueProperties,
    ) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            properties,
        }
    }

    /// Specification of a value produced by `function_id`.
    pub fn produced_by(
        value_name: impl Into<String>,
        target: ComputationTargetSpecification,
        function_id: &str,
    ) -> Self {
        Self::new(
            value_name,
            target,
            ValueProperties::new().with(FUNCTION_PROPERTY, function_id),
        )
    }

    pub fn value_name(&self) -> &str {
        &self.value_name
    }

    pub fn target(&self) -> &ComputationTargetSpecification {
        &self.target
    }

    pub fn properties(&self) -> &ValueProperties {
        &self.properties
    }

    pub fn function_id(&self) -> Option<&str> {
        self.properties.single_value(FUNCTION_PROPERTY)
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.value_name, self.target)
    }
}

/// Runtime values that flow between job items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ComputedValue {
    Null,
    Double(f64),
    Text(String),
    List(Vec<ComputedValue>),
    Json(Value),
}

impl ComputedValue {
    pub fn as_double(&self) -> Option<f64> {
        if let ComputedValue::Double(v) = self {
            Some(*v)
        } else {
            None
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        if let ComputedValue::Text(v) = self {
            Some(v)
        } else {
            None
        }
    }

    pub fn as_list(&self) -> Option<&[ComputedValue]> {
        if let ComputedValue::List(v) = self {
            Some(v)
        } else {
            None
        }
    }

    /// Rough in-memory footprint, used for input/output byte statistics.
    pub fn estimated_size(&self) -> u64 {
        match self {
            ComputedValue::Null => 1,
            ComputedValue::Double(_) => 8,
            ComputedValue::Text(s) => s.len() as u64,
            ComputedValue::List(items) => 8 + items.iter().map(Self::estimated_size).sum::<u64>(),
            ComputedValue::Json(v) => v.to_string().len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_equality_uses_identifier() {
        let a = ComputationTargetSpecification::security("TICKER", "AAPL");
        let b = ComputationTargetSpecification::security("TICKER", "AAPL");
        let c = ComputationTargetSpecification::position("TICKER", "AAPL");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn requirement_constraints() {
        let target = ComputationTargetSpecification::security("TICKER", "AAPL");
        let spec = ValueSpecification::new(
            "PresentValue",
            target.clone(),
            ValueProperties::new()
                .with(FUNCTION_PROPERTY, "Discounting")
                .with("Currency", "USD"),
        );

        let any_currency = ValueRequirement::new("PresentValue", target.clone())
            .with_constraints(ValueProperties::new().with_any("Currency"));
        let usd = ValueRequirement::new("PresentValue", target.clone())
            .with_constraints(ValueProperties::new().with("Currency", "USD"));
        let eur = ValueRequirement::new("PresentValue", target.clone())
            .with_constraints(ValueProperties::new().with("Currency", "EUR"));
        let curve = ValueRequirement::new("PresentValue", target)
            .with_constraints(ValueProperties::new().with_any("Curve"));

        assert!(any_currency.is_satisfied_by(&spec));
        assert!(usd.is_satisfied_by(&spec));
        assert!(!eur.is_satisfied_by(&spec));
        assert!(!curve.is_satisfied_by(&spec));
        assert_eq!(spec.function_id(), Some("Discounting"));
    }
}
