use serde_json::Value;

use crate::function::{
    FunctionError, FunctionExecutionContext, FunctionInputs, FunctionOutputs, ValuationFunction,
};
use crate::value::ComputedValue;

/// Adds every numeric input (lists are flattened) to a configured offset and
/// writes the total to each desired output.
pub struct Summing {
    offset: f64,
}

impl ValuationFunction for Summing {
    fn configure(parameters: &Value) -> Result<Self, FunctionError> {
        let offset = match parameters.get("offset") {
            None | Some(Value::Null) => 0.0,
            Some(v) => v
                .as_f64()
                .ok_or_else(|| FunctionError::Configuration("offset must be a number".to_string()))?,
        };
        Ok(Summing { offset })
    }

    fn execute(
        &self,
        context: &FunctionExecutionContext<'_>,
        inputs: &FunctionInputs,
    ) -> Result<FunctionOutputs, FunctionError> {
        let mut total = self.offset;
        for (spec, value) in inputs.iter() {
            total += match value {
                ComputedValue::Double(v) => *v,
                ComputedValue::List(items) => items.iter().filter_map(ComputedValue::as_double).sum(),
                ComputedValue::Null => 0.0,
                other => {
                    return Err(FunctionError::Execution(format!(
                        "input {spec} is not numeric: {other:?}"
                    )))
                }
            };
        }

        Ok(context
            .desired_outputs
            .iter()
            .map(|spec| (spec.clone(), ComputedValue::Double(total)))
            .collect())
    }
}
