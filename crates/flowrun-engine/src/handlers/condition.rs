use futures::future::BoxFuture;
use serde_json::Value;

use flowrun_core::template::lookup;
use flowrun_core::types::Variables;

use super::{NextSteps, StepContext, StepHandler, StepOutcome};

/// Picks successors by evaluating an expression to a branch label.
pub struct ConditionHandler;

impl StepHandler for ConditionHandler {
    fn run(&self, ctx: StepContext) -> BoxFuture<'_, StepOutcome> {
        Box::pin(async move {
            let label = match ctx.param("expression") {
                Some(Value::String(expr)) => match evaluate_comparison(expr, &ctx.variables) {
                    Some(result) => result.to_string(),
                    None => expr.trim().to_string(),
                },
                Some(other) => value_text(other),
                None => {
                    return StepOutcome::fatal(format!(
                        "Condition step '{}' has no expression",
                        ctx.step.id
                    ))
                }
            };

            let selected = ctx
                .param("branches")
                .and_then(|b| b.get(&label))
                .or_else(|| ctx.param("default"))
                .map(targets);

            let Some(selected) = selected else {
                return StepOutcome::fatal(format!(
                    "Condition step '{}' evaluated to '{}', which matches no branch",
                    ctx.step.id, label
                ));
            };

            let mut patch = Variables::new();
            patch.insert(ctx.output_key(), Value::String(label));
            StepOutcome::Succeeded {
                patch,
                next: NextSteps::Only(selected),
            }
        })
    }
}

/// A branch target is a single step id or a list of them.
fn targets(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Evaluate `left OP right` where OP is one of `==`, `!=`, `contains`,
/// `>`, `>=`, `<`, `<=`.
///
/// The left operand names a variable (dotted paths allowed) or is a literal
/// when no such variable exists; the right operand is always a literal.
/// Returns `None` when the expression is not a comparison.
pub fn evaluate_comparison(expr: &str, vars: &Variables) -> Option<bool> {
    let expr = expr.trim();

    // Two-character operators must be tried before their one-character prefixes.
    for op in [" contains ", "!=", "==", ">=", "<=", ">", "<"] {
        if let Some((left, right)) = parse_operator(expr, op) {
            let left = operand(left, vars);
            return Some(compare(op.trim(), &left, right));
        }
    }
    None
}

/// Truthiness of an `until`-style predicate: a comparison, a variable name,
/// or the literal `true`. Names of unset variables are false.
pub fn evaluate_predicate(value: &Value, vars: &Variables) -> bool {
    match value {
        Value::String(expr) => evaluate_comparison(expr, vars).unwrap_or_else(|| {
            let expr = expr.trim();
            match lookup(vars, expr) {
                Some(v) => truthy(v),
                None => expr == "true",
            }
        }),
        other => truthy(other),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !(s.is_empty() || s == "false" || s == "0"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    let val = val.trim().trim_matches('"');
    if key.is_empty() {
        return None;
    }
    Some((key, val))
}

fn operand(name: &str, vars: &Variables) -> Value {
    if let Some(v) = lookup(vars, name) {
        return v.clone();
    }
    let literal = name.trim_matches('"');
    literal
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(literal.to_string()))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare(op: &str, left: &Value, right: &str) -> bool {
    let numbers = || {
        let l = match left {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }?;
        let r = right.parse::<f64>().ok()?;
        Some((l, r))
    };

    match op {
        "contains" => match left {
            Value::Array(items) => items.iter().any(|v| value_text(v) == right),
            other => value_text(other).contains(right),
        },
        "==" => match numbers() {
            Some((l, r)) => l == r,
            None => value_text(left) == right,
        },
        "!=" => match numbers() {
            Some((l, r)) => l != r,
            None => value_text(left) != right,
        },
        ">" => numbers().is_some_and(|(l, r)| l > r),
        ">=" => numbers().is_some_and(|(l, r)| l >= r),
        "<" => numbers().is_some_and(|(l, r)| l < r),
        "<=" => numbers().is_some_and(|(l, r)| l <= r),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::ctx;
    use flowrun_test_utils::{condition_step, vars};
    use serde_json::json;

    #[test]
    fn test_condition_equals() {
        let v = vars(&[("status", json!("success"))]);
        assert_eq!(evaluate_comparison(r#"status == "success""#, &v), Some(true));
        assert_eq!(evaluate_comparison(r#"status == "failure""#, &v), Some(false));
        assert_eq!(evaluate_comparison(r#"status != "failure""#, &v), Some(true));
    }

    #[test]
    fn test_condition_contains() {
        let v = vars(&[
            ("output", json!("The file was created successfully.")),
            ("tags", json!(["a", "b"])),
        ]);
        assert_eq!(evaluate_comparison(r#"output contains "created""#, &v), Some(true));
        assert_eq!(evaluate_comparison(r#"output contains "deleted""#, &v), Some(false));
        assert_eq!(evaluate_comparison(r#"tags contains "b""#, &v), Some(true));
    }

    #[test]
    fn test_condition_numeric() {
        let v = vars(&[("score", json!(7)), ("review", json!({ "grade": "4.5" }))]);
        assert_eq!(evaluate_comparison("score > 5", &v), Some(true));
        assert_eq!(evaluate_comparison("score >= 7", &v), Some(true));
        assert_eq!(evaluate_comparison("score < 7", &v), Some(false));
        assert_eq!(evaluate_comparison("review.grade <= 4.5", &v), Some(true));
        assert_eq!(evaluate_comparison("score == 7.0", &v), Some(true));
        // Rendered placeholders arrive as literals.
        assert_eq!(evaluate_comparison("12 > 5", &v), Some(true));
    }

    #[test]
    fn test_condition_missing_key() {
        let v = Variables::new();
        assert_eq!(evaluate_comparison(r#"missing == "value""#, &v), Some(false));
        assert_eq!(evaluate_comparison("missing > 1", &v), Some(false));
        assert_eq!(evaluate_comparison("just a label", &v), None);
    }

    #[test]
    fn test_predicate() {
        let v = vars(&[("done", json!(true)), ("count", json!(0))]);
        assert!(evaluate_predicate(&json!("done"), &v));
        assert!(!evaluate_predicate(&json!("count"), &v));
        assert!(evaluate_predicate(&json!("count == 0"), &v));
        assert!(!evaluate_predicate(&json!(false), &v));
        assert!(!evaluate_predicate(&json!("false"), &v));
        assert!(!evaluate_predicate(&json!("approved"), &v));
        assert!(evaluate_predicate(&json!("true"), &v));
    }

    #[tokio::test]
    async fn test_selects_branch() {
        let step = condition_step(
            "route",
            r#"kind == "bug""#,
            json!({ "true": ["triage"], "false": "backlog" }),
        )
        .with_next(["triage", "backlog"]);
        let outcome = ConditionHandler
            .run(ctx(step, vars(&[("kind", json!("bug"))])))
            .await;
        match outcome {
            StepOutcome::Succeeded { patch, next } => {
                assert_eq!(next, NextSteps::Only(vec!["triage".into()]));
                assert_eq!(patch["route_output"], json!("true"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_template_label_and_default() {
        let step = condition_step("route", "${tier}", json!({ "gold": "vip" }))
            .with_param("default", json!(["standard"]))
            .with_next(["vip", "standard"]);

        let outcome = ConditionHandler
            .run(ctx(step.clone(), vars(&[("tier", json!("gold"))])))
            .await;
        assert!(matches!(
            outcome,
            StepOutcome::Succeeded { next: NextSteps::Only(ref ids), .. } if ids == &["vip"]
        ));

        let outcome = ConditionHandler
            .run(ctx(step, vars(&[("tier", json!("bronze"))])))
            .await;
        assert!(matches!(
            outcome,
            StepOutcome::Succeeded { next: NextSteps::Only(ref ids), .. } if ids == &["standard"]
        ));
    }

    #[tokio::test]
    async fn test_unknown_label_without_default_fails() {
        let step = condition_step("route", "${tier}", json!({ "gold": "vip" })).with_next(["vip"]);
        let outcome = ConditionHandler
            .run(ctx(step, vars(&[("tier", json!("tin"))])))
            .await;
        assert!(matches!(outcome, StepOutcome::Failed { retryable: false, .. }));
    }
}
