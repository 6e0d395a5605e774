//! The capability allowlist handed to expressions.
//!
//! Expressions can only read their dependency snapshot and whatever a
//! [`Capabilities`] value exposes: named constants and named functions.
//! Nothing else in the process is reachable from expression text.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use super::interpreter::is_truthy;
use super::parser::number_literal;
use crate::operations::status::OperationStatusRegistry;

/// A function callable from expressions; errors are plain messages.
pub type CapabilityFunction = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// Named values and functions visible to expressions.
#[derive(Clone, Default)]
pub struct Capabilities {
    values: IndexMap<String, Value>,
    functions: IndexMap<String, CapabilityFunction>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("values", &self.values.keys().collect::<Vec<_>>())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Capabilities {
    /// An empty allowlist.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in helper functions.
    pub fn standard() -> Self {
        Self::new()
            .with_function("round", round)
            .with_function("floor", |arguments| unary_math(arguments, f64::floor))
            .with_function("ceil", |arguments| unary_math(arguments, f64::ceil))
            .with_function("abs", |arguments| unary_math(arguments, f64::abs))
            .with_function("min", |arguments| fold_numbers(arguments, f64::min))
            .with_function("max", |arguments| fold_numbers(arguments, f64::max))
            .with_function("sum", sum)
            .with_function("count", count)
            .with_function("isEmpty", is_empty)
            .with_function("coalesce", |arguments| {
                Ok(arguments.iter().find(|value| !value.is_null()).cloned().unwrap_or(Value::Null))
            })
    }

    /// Adds `isOperationInProgress([name])` backed by the status registry.
    pub fn with_operation_status(self, registry: OperationStatusRegistry) -> Self {
        self.with_function("isOperationInProgress", move |arguments| match arguments {
            [] | [Value::Null] => Ok(Value::Bool(registry.is_operation_in_progress(None))),
            [Value::String(name)] => Ok(Value::Bool(registry.is_operation_in_progress(Some(name.as_str())))),
            _ => Err("expected an optional operation name".to_string()),
        })
    }

    /// Exposes a named constant.
    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Exposes a named function.
    pub fn with_function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn function(&self, name: &str) -> Option<CapabilityFunction> {
        self.functions.get(name).cloned()
    }

    /// Names of every exposed function.
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

fn number_argument(value: &Value, position: usize) -> Result<f64, String> {
    value
        .as_f64()
        .ok_or_else(|| format!("argument {} must be a number, got {value}", position + 1))
}

fn unary_math(arguments: &[Value], operation: fn(f64) -> f64) -> Result<Value, String> {
    match arguments {
        [value] => finite(operation(number_argument(value, 0)?)),
        _ => Err(format!("expected 1 argument, got {}", arguments.len())),
    }
}

fn round(arguments: &[Value]) -> Result<Value, String> {
    let (value, digits) = match arguments {
        [value] => (number_argument(value, 0)?, 0),
        [value, digits] => (number_argument(value, 0)?, number_argument(digits, 1)? as i32),
        _ => return Err(format!("expected 1 or 2 arguments, got {}", arguments.len())),
    };
    let factor = 10f64.powi(digits);
    finite((value * factor).round() / factor)
}

fn finite(number: f64) -> Result<Value, String> {
    number_literal(number).ok_or_else(|| "result is not a finite number".to_string())
}

fn numbers_in(arguments: &[Value]) -> Vec<&Value> {
    match arguments {
        [Value::Array(items)] => items.iter().collect(),
        _ => arguments.iter().collect(),
    }
}

fn fold_numbers(arguments: &[Value], combine: fn(f64, f64) -> f64) -> Result<Value, String> {
    let values = numbers_in(arguments);
    let mut numbers = values
        .iter()
        .enumerate()
        .map(|(position, value)| number_argument(value, position));
    let Some(first) = numbers.next() else {
        return Err("expected at least one number".to_string());
    };
    let folded = numbers.try_fold(first?, |accumulator, next| next.map(|next| combine(accumulator, next)))?;
    finite(folded)
}

fn sum(arguments: &[Value]) -> Result<Value, String> {
    let total = numbers_in(arguments)
        .iter()
        .filter(|value| !value.is_null())
        .enumerate()
        .try_fold(0.0, |total, (position, value)| number_argument(value, position).map(|number| total + number))?;
    finite(total)
}

fn count(arguments: &[Value]) -> Result<Value, String> {
    match arguments {
        [Value::Array(items)] => Ok(Value::from(items.iter().filter(|item| is_truthy(item)).count())),
        [Value::Null] => Ok(Value::from(0)),
        _ => Err("expected an array".to_string()),
    }
}

fn is_empty(arguments: &[Value]) -> Result<Value, String> {
    let [value] = arguments else {
        return Err(format!("expected 1 argument, got {}", arguments.len()));
    };
    let empty = match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    Ok(Value::Bool(empty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, arguments: &[Value]) -> Result<Value, String> {
        let capabilities = Capabilities::standard();
        let function = capabilities.function(name).expect("registered function");
        function(arguments)
    }

    #[test]
    fn rounding_supports_decimal_places() {
        assert_eq!(call("round", &[json!(2.346), json!(2)]).unwrap(), json!(2.35));
        assert_eq!(call("round", &[json!(2.5)]).unwrap(), json!(3));
        assert!(call("round", &[json!("x")]).is_err());
    }

    #[test]
    fn aggregates_accept_arrays_or_varargs() {
        assert_eq!(call("sum", &[json!([1, 2, null, 3.5])]).unwrap(), json!(6.5));
        assert_eq!(call("max", &[json!(1), json!(7), json!(3)]).unwrap(), json!(7));
        assert_eq!(call("min", &[json!([4, 2])]).unwrap(), json!(2));
        assert_eq!(call("count", &[json!([1, 0, "a", null])]).unwrap(), json!(2));
        assert!(call("min", &[]).is_err());
        assert!(call("sum", &[json!([1e308, 1e308])]).is_err());
    }

    #[test]
    fn emptiness_and_coalescing() {
        assert_eq!(call("isEmpty", &[json!("  ")]).unwrap(), json!(true));
        assert_eq!(call("isEmpty", &[json!([0])]).unwrap(), json!(false));
        assert_eq!(call("coalesce", &[Value::Null, json!("b"), json!("c")]).unwrap(), json!("b"));
    }

    #[test]
    fn operation_status_is_exposed_on_request() {
        let registry = OperationStatusRegistry::new("calculate");
        let capabilities = Capabilities::new().with_operation_status(registry);
        let function = capabilities.function("isOperationInProgress").expect("registered");
        assert_eq!(function(&[]).unwrap(), json!(false));
        assert_eq!(function(&[json!("bind")]).unwrap(), json!(false));
        assert!(function(&[json!(1)]).is_err());
    }
}
