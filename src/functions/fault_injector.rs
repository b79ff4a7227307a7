use serde_json::Value;

use crate::function::{
    FunctionError, FunctionExecutionContext, FunctionInputs, FunctionOutputs, ValuationFunction,
};
use crate::value::ComputedValue;

/// Sleeps and/or fails on demand, for exercising the scheduler's failure paths.
pub struct FaultInjector {
    fail: bool,
    sleep_duration_ms: Option<u64>,
}

impl ValuationFunction for FaultInjector {
    fn configure(parameters: &Value) -> Result<Self, FunctionError> {
        Ok(FaultInjector {
            fail: parameters["fail"].as_bool().unwrap_or(false),
            sleep_duration_ms: parameters["sleep_duration_ms"].as_u64(),
        })
    }

    fn execute(
        &self,
        context: &FunctionExecutionContext<'_>,
        _inputs: &FunctionInputs,
    ) -> Result<FunctionOutputs, FunctionError> {
        if let Some(duration) = self.sleep_duration_ms {
            std::thread::sleep(std::time::Duration::from_millis(duration));
        }

        if self.fail {
            return Err(FunctionError::Execution(format!(
                "simulated failure on {}",
                context.target
            )));
        }

        Ok(context
            .desired_outputs
            .iter()
            .map(|spec| (spec.clone(), ComputedValue::Text("Success!".to_string())))
            .collect())
    }
}
