//! Tree-walking interpreter.
//!
//! Every invocation gets a fresh [`Scope`]; nothing survives between calls.
//! Identifiers resolve against the dependency snapshot first and the
//! capability values second. Only capability functions can be called, plus
//! the `includes` method on arrays and strings.

use serde_json::Value;

use super::EvaluationError;
use super::capabilities::Capabilities;
use super::parser::{BinaryOperator, Expr, LogicalOperator, UnaryOperator, number_literal};

/// Bindings visible to one evaluation.
pub struct Scope<'a> {
    dependencies: &'a Value,
    capabilities: &'a Capabilities,
}

impl<'a> Scope<'a> {
    pub fn new(dependencies: &'a Value, capabilities: &'a Capabilities) -> Self {
        Self {
            dependencies,
            capabilities,
        }
    }

    fn resolve(&self, name: &str) -> Result<Value, EvaluationError> {
        if let Some(value) = self.dependencies.get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.capabilities.value(name) {
            return Ok(value.clone());
        }
        Err(EvaluationError::UnknownIdentifier(name.to_string()))
    }
}

/// Evaluates `expression` in `scope`.
pub fn evaluate(expression: &Expr, scope: &Scope<'_>) -> Result<Value, EvaluationError> {
    match expression {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Array(items) => items
            .iter()
            .map(|item| evaluate(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Identifier(name) => scope.resolve(name),
        Expr::Member { object, property } => {
            let object = evaluate(object, scope)?;
            read_property(&object, property)
        }
        Expr::Index { object, index } => {
            let object = evaluate(object, scope)?;
            let index = evaluate(index, scope)?;
            read_index(&object, &index)
        }
        Expr::Call { callee, arguments } => call(callee, arguments, scope),
        Expr::Unary { operator, operand } => {
            let operand = evaluate(operand, scope)?;
            match operator {
                UnaryOperator::Not => Ok(Value::Bool(!is_truthy(&operand))),
                UnaryOperator::Negate => match operand.as_f64() {
                    Some(number) => number_literal(-number).ok_or_else(|| EvaluationError::NonFinite("-".into())),
                    None => Err(EvaluationError::type_mismatch("-", &operand, None)),
                },
            }
        }
        Expr::Logical { operator, left, right } => {
            let left = evaluate(left, scope)?;
            match (operator, is_truthy(&left)) {
                (LogicalOperator::And, false) | (LogicalOperator::Or, true) => Ok(left),
                _ => evaluate(right, scope),
            }
        }
        Expr::Conditional {
            condition,
            then_branch,
            else_branch,
        } => {
            if is_truthy(&evaluate(condition, scope)?) {
                evaluate(then_branch, scope)
            } else {
                evaluate(else_branch, scope)
            }
        }
        Expr::Binary { operator, left, right } => {
            let left = evaluate(left, scope)?;
            let right = evaluate(right, scope)?;
            binary(*operator, &left, &right)
        }
    }
}

/// JSON truthiness: `null`, `false`, `0`, `NaN` and `""` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|number| number != 0.0 && !number.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// JSON equality with integer and float representations of a number treated alike.
pub fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(left), Value::Number(right)) => left.as_f64() == right.as_f64(),
        (Value::Array(left), Value::Array(right)) => {
            left.len() == right.len() && left.iter().zip(right).all(|(left, right)| loosely_equal(left, right))
        }
        _ => left == right,
    }
}

fn binary(operator: BinaryOperator, left: &Value, right: &Value) -> Result<Value, EvaluationError> {
    match operator {
        BinaryOperator::Equal => return Ok(Value::Bool(loosely_equal(left, right))),
        BinaryOperator::NotEqual => return Ok(Value::Bool(!loosely_equal(left, right))),
        BinaryOperator::Add if left.is_string() || right.is_string() => {
            return Ok(Value::String(format!("{}{}", display(left), display(right))));
        }
        BinaryOperator::Less | BinaryOperator::LessEqual | BinaryOperator::Greater | BinaryOperator::GreaterEqual => {
            return compare(operator, left, right);
        }
        _ => {}
    }

    let (Some(lhs), Some(rhs)) = (left.as_f64(), right.as_f64()) else {
        return Err(EvaluationError::type_mismatch(operator.symbol(), left, Some(right)));
    };
    let result = match operator {
        BinaryOperator::Add => lhs + rhs,
        BinaryOperator::Subtract => lhs - rhs,
        BinaryOperator::Multiply => lhs * rhs,
        BinaryOperator::Divide | BinaryOperator::Remainder if rhs == 0.0 => {
            return Err(EvaluationError::DivisionByZero);
        }
        BinaryOperator::Divide => lhs / rhs,
        BinaryOperator::Remainder => lhs % rhs,
        _ => return Err(EvaluationError::type_mismatch(operator.symbol(), left, Some(right))),
    };
    number_literal(result).ok_or_else(|| EvaluationError::NonFinite(operator.symbol().into()))
}

fn compare(operator: BinaryOperator, left: &Value, right: &Value) -> Result<Value, EvaluationError> {
    let ordering = match (left, right) {
        (Value::Number(lhs), Value::Number(rhs)) => lhs.as_f64().partial_cmp(&rhs.as_f64()),
        (Value::String(lhs), Value::String(rhs)) => Some(lhs.cmp(rhs)),
        _ => return Err(EvaluationError::type_mismatch(operator.symbol(), left, Some(right))),
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    let result = match operator {
        BinaryOperator::Less => ordering.is_lt(),
        BinaryOperator::LessEqual => ordering.is_le(),
        BinaryOperator::Greater => ordering.is_gt(),
        _ => ordering.is_ge(),
    };
    Ok(Value::Bool(result))
}

fn call(callee: &Expr, arguments: &[Expr], scope: &Scope<'_>) -> Result<Value, EvaluationError> {
    match callee {
        Expr::Identifier(name) => {
            let function = scope
                .capabilities
                .function(name)
                .ok_or_else(|| EvaluationError::UnknownFunction(name.clone()))?;
            let arguments = arguments
                .iter()
                .map(|argument| evaluate(argument, scope))
                .collect::<Result<Vec<_>, _>>()?;
            function(&arguments).map_err(|message| EvaluationError::Capability {
                name: name.clone(),
                message,
            })
        }
        Expr::Member { object, property } if property == "includes" => {
            let target = evaluate(object, scope)?;
            let [needle] = arguments else {
                return Err(EvaluationError::Capability {
                    name: "includes".into(),
                    message: format!("expected 1 argument, got {}", arguments.len()),
                });
            };
            let needle = evaluate(needle, scope)?;
            match (&target, &needle) {
                (Value::Array(items), _) => Ok(Value::Bool(items.iter().any(|item| loosely_equal(item, &needle)))),
                (Value::String(text), Value::String(fragment)) => Ok(Value::Bool(text.contains(fragment.as_str()))),
                _ => Err(EvaluationError::type_mismatch("includes", &target, Some(&needle))),
            }
        }
        Expr::Member { property, .. } => Err(EvaluationError::UnknownFunction(property.clone())),
        _ => Err(EvaluationError::NotCallable),
    }
}

fn read_property(object: &Value, property: &str) -> Result<Value, EvaluationError> {
    match object {
        Value::Object(map) => Ok(map.get(property).cloned().unwrap_or(Value::Null)),
        Value::Array(items) if property == "length" => Ok(Value::from(items.len())),
        Value::String(text) if property == "length" => Ok(Value::from(text.chars().count())),
        Value::Null => Err(EvaluationError::NullAccess(property.to_string())),
        other => Err(EvaluationError::type_mismatch(".", other, Some(&Value::String(property.to_string())))),
    }
}

fn read_index(object: &Value, index: &Value) -> Result<Value, EvaluationError> {
    match (object, index) {
        (Value::Array(items), Value::Number(position)) => Ok(position
            .as_u64()
            .and_then(|position| items.get(position as usize))
            .cloned()
            .unwrap_or(Value::Null)),
        (Value::Object(_), Value::String(key)) => read_property(object, key),
        (Value::String(text), Value::Number(position)) => Ok(position
            .as_u64()
            .and_then(|position| text.chars().nth(position as usize))
            .map(|character| Value::String(character.to_string()))
            .unwrap_or(Value::Null)),
        (Value::Null, _) => Err(EvaluationError::NullAccess(display(index))),
        _ => Err(EvaluationError::type_mismatch("[]", object, Some(index))),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parser::parse;
    use serde_json::json;

    fn run(source: &str, dependencies: Value) -> Result<Value, EvaluationError> {
        let expression = parse(source).expect("parse");
        let capabilities = Capabilities::standard();
        evaluate(&expression, &Scope::new(&dependencies, &capabilities))
    }

    #[test]
    fn arithmetic_keeps_integers_integral() {
        assert_eq!(run("total * 2", json!({"total": 5})).unwrap(), json!(10));
        assert_eq!(run("7 / 2", json!({})).unwrap(), json!(3.5));
        assert_eq!(run("-(1 + 2) % 2", json!({})).unwrap(), json!(-1));
    }

    #[test]
    fn arithmetic_on_strings_is_a_type_error() {
        let error = run("total * 2", json!({"total": "abc"})).unwrap_err();
        assert!(matches!(error, EvaluationError::TypeMismatch { ref operator, .. } if operator == "*"));
        assert_eq!(run("'n=' + 2", json!({})).unwrap(), json!("n=2"));
        assert!(matches!(run("1 / 0", json!({})), Err(EvaluationError::DivisionByZero)));
    }

    #[test]
    fn overflowing_arithmetic_fails_instead_of_yielding_null() {
        let error = run("total * 10", json!({"total": 1e308})).unwrap_err();
        assert_eq!(error, EvaluationError::NonFinite("*".into()));
        assert_eq!(run("total * 2", json!({"total": 1e300})).unwrap(), json!(2e300));
    }

    #[test]
    fn logical_operators_return_the_deciding_operand() {
        assert_eq!(run("name || 'anonymous'", json!({"name": ""})).unwrap(), json!("anonymous"));
        assert_eq!(run("a && b", json!({"a": 1, "b": 0})).unwrap(), json!(0));
        assert_eq!(run("missing && missing.x", json!({"missing": null})).unwrap(), Value::Null);
    }

    #[test]
    fn nested_dependencies_read_naturally() {
        let dependencies = json!({"items": [{"price": 2}, {"price": 3}], "policy": {"type": "home"}});
        assert_eq!(run("items[1].price + items.length", dependencies.clone()).unwrap(), json!(5));
        assert_eq!(run("policy.type == 'home' ? 'H' : 'O'", dependencies).unwrap(), json!("H"));
    }

    #[test]
    fn equality_normalizes_numbers() {
        assert_eq!(run("a == 2", json!({"a": 2.0})).unwrap(), json!(true));
        assert_eq!(run("a !== null", json!({"a": null})).unwrap(), json!(false));
    }

    #[test]
    fn only_allowlisted_functions_can_be_called() {
        assert_eq!(run("max(a, 4)", json!({"a": 9})).unwrap(), json!(9));
        assert!(matches!(run("eval('1')", json!({})), Err(EvaluationError::UnknownFunction(_))));
        assert!(matches!(run("a.toString()", json!({"a": 1})), Err(EvaluationError::UnknownFunction(_))));
        assert!(matches!(run("nope + 1", json!({})), Err(EvaluationError::UnknownIdentifier(_))));
    }

    #[test]
    fn includes_works_on_arrays_and_strings() {
        assert_eq!(run("tags.includes('x')", json!({"tags": ["x", "y"]})).unwrap(), json!(true));
        assert_eq!(run("'hello'.includes('ell')", json!({})).unwrap(), json!(true));
    }

    #[test]
    fn property_access_on_null_fails() {
        assert!(matches!(run("a.b", json!({"a": null})), Err(EvaluationError::NullAccess(_))));
    }
}
