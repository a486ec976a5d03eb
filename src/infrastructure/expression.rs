// Sandboxed expression evaluation backed by evalexpr
use crate::application::evaluator::{EvalError, ExpressionEvaluator};
use async_trait::async_trait;
use evalexpr::{
    build_operator_tree, ContextWithMutableFunctions, ContextWithMutableVariables, EvalexprError,
    Function, HashMapContext, Value,
};
use std::collections::HashMap;
use std::time::Duration;

const MAX_EXPRESSION_LEN: usize = 4096;

/// Evaluates formula expressions in a restricted context: the scope
/// variables, a math function registry, and nothing else. Each evaluation
/// runs on a blocking task raced against a fixed per-step budget so one
/// runaway expression cannot stall a whole chain.
pub struct SandboxEvaluator {
    budget_ms: u64,
}

impl SandboxEvaluator {
    pub fn new(budget_ms: u64) -> Self {
        Self { budget_ms }
    }

    fn eval_blocking(expression: &str, scope: &HashMap<String, f64>) -> Result<f64, EvalError> {
        if expression.trim().is_empty() {
            return Err(EvalError::Invalid("expression is empty".to_string()));
        }
        if expression.len() > MAX_EXPRESSION_LEN {
            return Err(EvalError::Invalid("expression is too long".to_string()));
        }

        let mut ctx = HashMapContext::new();
        register_math_functions(&mut ctx).map_err(|err| EvalError::Failed(err.to_string()))?;
        for (name, value) in scope {
            ctx.set_value(name.clone(), Value::from(*value))
                .map_err(|err| EvalError::Failed(err.to_string()))?;
        }

        let tree = build_operator_tree(expression.trim())
            .map_err(|err| EvalError::Invalid(err.to_string()))?;
        let value = tree
            .eval_with_context(&ctx)
            .map_err(|err| EvalError::Failed(err.to_string()))?;

        let number = to_float(&value).map_err(EvalError::Failed)?;
        if !number.is_finite() {
            return Err(EvalError::NonFinite);
        }
        Ok(number)
    }
}

#[async_trait]
impl ExpressionEvaluator for SandboxEvaluator {
    async fn evaluate(
        &self,
        expression: &str,
        scope: &HashMap<String, f64>,
    ) -> Result<f64, EvalError> {
        let expression = expression.to_string();
        let scope = scope.clone();
        let handle = tokio::task::spawn_blocking(move || Self::eval_blocking(&expression, &scope));

        match tokio::time::timeout(Duration::from_millis(self.budget_ms), handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(EvalError::Failed(join_err.to_string())),
            // The blocking task is abandoned; its eventual result is
            // discarded.
            Err(_) => Err(EvalError::Budget {
                budget_ms: self.budget_ms,
            }),
        }
    }
}

fn to_float(value: &Value) -> Result<f64, String> {
    match value {
        Value::Float(v) => Ok(*v),
        Value::Int(v) => Ok(*v as f64),
        other => Err(format!("expected a numeric result, got {other:?}")),
    }
}

fn args_to_floats(args: &Value) -> Result<Vec<f64>, String> {
    match args {
        Value::Tuple(items) => items.iter().map(to_float).collect(),
        other => Ok(vec![to_float(other)?]),
    }
}

fn expect_args(args: &Value, name: &str, count: usize) -> Result<Vec<f64>, EvalexprError> {
    let floats = args_to_floats(args).map_err(EvalexprError::CustomMessage)?;
    if floats.len() != count {
        return Err(EvalexprError::CustomMessage(format!(
            "{name}() requires exactly {count} argument(s)"
        )));
    }
    Ok(floats)
}

fn register_math_functions(ctx: &mut HashMapContext) -> Result<(), EvalexprError> {
    let unary: [(&str, fn(f64) -> f64); 11] = [
        ("abs", f64::abs),
        ("sqrt", f64::sqrt),
        ("floor", f64::floor),
        ("ceil", f64::ceil),
        ("round", f64::round),
        ("ln", f64::ln),
        ("log10", f64::log10),
        ("exp", f64::exp),
        ("sin", f64::sin),
        ("cos", f64::cos),
        ("tan", f64::tan),
    ];
    for (name, op) in unary {
        ctx.set_function(
            name.to_string(),
            Function::new(move |args| {
                let floats = expect_args(args, name, 1)?;
                Ok(Value::from(op(floats[0])))
            }),
        )?;
    }

    ctx.set_function(
        "pow".to_string(),
        Function::new(|args| {
            let floats = expect_args(args, "pow", 2)?;
            Ok(Value::from(floats[0].powf(floats[1])))
        }),
    )?;

    ctx.set_function(
        "clamp".to_string(),
        Function::new(|args| {
            let floats = expect_args(args, "clamp", 3)?;
            Ok(Value::from(floats[0].max(floats[1]).min(floats[2])))
        }),
    )?;

    ctx.set_function(
        "min".to_string(),
        Function::new(|args| {
            let floats = args_to_floats(args).map_err(EvalexprError::CustomMessage)?;
            floats
                .into_iter()
                .reduce(f64::min)
                .map(Value::from)
                .ok_or_else(|| {
                    EvalexprError::CustomMessage("min() requires at least 1 argument".to_string())
                })
        }),
    )?;

    ctx.set_function(
        "max".to_string(),
        Function::new(|args| {
            let floats = args_to_floats(args).map_err(EvalexprError::CustomMessage)?;
            floats
                .into_iter()
                .reduce(f64::max)
                .map(Value::from)
                .ok_or_else(|| {
                    EvalexprError::CustomMessage("max() requires at least 1 argument".to_string())
                })
        }),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect()
    }

    #[tokio::test]
    async fn evaluates_arithmetic_on_the_running_value() {
        let evaluator = SandboxEvaluator::new(200);
        let result = evaluator
            .evaluate("value * 2", &scope(&[("value", 3.0)]))
            .await
            .unwrap();
        assert_eq!(result, 6.0);
    }

    #[tokio::test]
    async fn auxiliary_variables_are_in_scope() {
        let evaluator = SandboxEvaluator::new(200);
        let result = evaluator
            .evaluate(
                "(value - 0.5) * temp",
                &scope(&[("value", 2.5), ("temp", 10.0)]),
            )
            .await
            .unwrap();
        assert_eq!(result, 20.0);
    }

    #[tokio::test]
    async fn math_functions_are_registered() {
        let evaluator = SandboxEvaluator::new(200);
        let result = evaluator
            .evaluate(
                "sqrt(pow(value, 2) + pow(4, 2))",
                &scope(&[("value", 3.0)]),
            )
            .await
            .unwrap();
        assert!((result - 5.0).abs() < 1e-9);

        let result = evaluator
            .evaluate("clamp(value, 0, 10)", &scope(&[("value", 42.0)]))
            .await
            .unwrap();
        assert_eq!(result, 10.0);

        let result = evaluator
            .evaluate("min(value, 2, 8)", &scope(&[("value", 5.0)]))
            .await
            .unwrap();
        assert_eq!(result, 2.0);
    }

    #[tokio::test]
    async fn unparsable_expressions_are_invalid() {
        let evaluator = SandboxEvaluator::new(200);
        let err = evaluator
            .evaluate("(value", &scope(&[("value", 1.0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Invalid(_)));
    }

    #[tokio::test]
    async fn dangling_operators_fail_at_evaluation() {
        // "value ***" parses into nested multiplications with missing
        // operands and only errors once evaluated.
        let evaluator = SandboxEvaluator::new(200);
        let err = evaluator
            .evaluate("value ***", &scope(&[("value", 1.0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Failed(_)));
    }

    #[tokio::test]
    async fn empty_expressions_are_invalid() {
        let evaluator = SandboxEvaluator::new(200);
        let err = evaluator.evaluate("  ", &scope(&[])).await.unwrap_err();
        assert!(matches!(err, EvalError::Invalid(_)));
    }

    #[tokio::test]
    async fn unknown_variables_fail() {
        let evaluator = SandboxEvaluator::new(200);
        let err = evaluator
            .evaluate("value + missing", &scope(&[("value", 1.0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Failed(_)));
    }

    #[tokio::test]
    async fn non_finite_results_are_rejected() {
        let evaluator = SandboxEvaluator::new(200);
        let err = evaluator
            .evaluate("value / 0.0", &scope(&[("value", 1.0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::NonFinite));

        let err = evaluator
            .evaluate("ln(0.0 - value)", &scope(&[("value", 1.0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::NonFinite));
    }

    #[tokio::test]
    async fn boolean_results_are_not_numbers() {
        let evaluator = SandboxEvaluator::new(200);
        let err = evaluator
            .evaluate("value > 1", &scope(&[("value", 3.0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Failed(_)));
    }
}
