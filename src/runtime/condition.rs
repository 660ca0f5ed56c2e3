//! Condition node evaluation
//!
//! Rules compare a resolved `field` against a resolved `value` with a named
//! operator. String comparisons are case-insensitive, numeric ones parse both
//! sides and are false when either side is not a number. Unknown operators
//! evaluate to false.

use crate::runtime::resolver::{render, resolve};
use crate::workflow::types::{ActionResult, ConditionSpec, ExecutionContext, Logic, Rule, RuleSet};
use serde::Serialize;
use serde_json::{json, Value};

/// Edge handle a condition node continues on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    Yes,
    No,
}

impl Branch {
    pub fn as_str(self) -> &'static str {
        match self {
            Branch::Yes => "yes",
            Branch::No => "no",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleResult {
    pub field: String,
    pub operator: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionOutcome {
    pub branch: Branch,
    pub rule_results: Vec<RuleResult>,
}

impl ConditionOutcome {
    pub fn to_output(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "branch": self.branch.as_str() }))
    }
}

/// Evaluate a rule set; an empty set always takes the "yes" branch
pub fn evaluate(rule_set: &RuleSet, ctx: &ExecutionContext) -> ConditionOutcome {
    let rule_results: Vec<RuleResult> = rule_set
        .rules
        .iter()
        .map(|rule| evaluate_rule(rule, ctx))
        .collect();

    let passed = rule_results.is_empty()
        || match rule_set.logic {
            Logic::And => rule_results.iter().all(|r| r.passed),
            Logic::Or => rule_results.iter().any(|r| r.passed),
        };

    ConditionOutcome {
        branch: if passed { Branch::Yes } else { Branch::No },
        rule_results,
    }
}

/// Evaluate a condition node into the branch to follow and its step result
///
/// A malformed rule set takes the "no" branch with a failing result.
pub fn evaluate_node(spec: &ConditionSpec, ctx: &ExecutionContext) -> (Branch, ActionResult) {
    match spec {
        ConditionSpec::Rules(rules) => {
            let outcome = evaluate(rules, ctx);
            (outcome.branch, ActionResult::ok(outcome.to_output()))
        }
        ConditionSpec::Malformed(error) => (
            Branch::No,
            ActionResult::failed_with(
                error.clone(),
                json!({ "branch": Branch::No.as_str(), "ruleResults": [] }),
            ),
        ),
    }
}

fn evaluate_rule(rule: &Rule, ctx: &ExecutionContext) -> RuleResult {
    // A bare path is shorthand for `{{path}}`
    let field_template = if rule.field.contains("{{") {
        rule.field.clone()
    } else {
        format!("{{{{{}}}}}", rule.field.trim())
    };
    let actual = resolve(&field_template, ctx);
    let expected = match &rule.value {
        Value::String(s) => resolve(s, ctx),
        other => render(other),
    };
    let passed = compare(&rule.operator, &actual, &expected);

    RuleResult {
        field: rule.field.clone(),
        operator: rule.operator.clone(),
        expected,
        actual,
        passed,
    }
}

/// Apply `operator` to the resolved operands
pub fn compare(operator: &str, actual: &str, expected: &str) -> bool {
    let a = actual.trim().to_lowercase();
    let e = expected.trim().to_lowercase();

    match operator {
        "equals" => a == e,
        "not_equals" => a != e,
        "contains" => a.contains(&e),
        "not_contains" => !a.contains(&e),
        "starts_with" => a.starts_with(&e),
        "ends_with" => a.ends_with(&e),
        "greater_than" => numeric(actual, expected, |x, y| x > y),
        "less_than" => numeric(actual, expected, |x, y| x < y),
        "greater_than_or_equal" => numeric(actual, expected, |x, y| x >= y),
        "less_than_or_equal" => numeric(actual, expected, |x, y| x <= y),
        "is_empty" => actual.is_empty(),
        "is_not_empty" => !actual.is_empty(),
        "in_list" => in_list(&a, expected),
        "not_in_list" => !in_list(&a, expected),
        other => {
            tracing::debug!(operator = other, "❓ Unknown condition operator, rule evaluates false");
            false
        }
    }
}

fn numeric(actual: &str, expected: &str, op: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) if !x.is_nan() && !y.is_nan() => op(x, y),
        _ => false,
    }
}

fn in_list(needle: &str, list: &str) -> bool {
    list.split(',')
        .map(|item| item.trim().to_lowercase())
        .any(|item| item == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(payload: Value) -> ExecutionContext {
        ExecutionContext::new("wf", "run", "ws", "order.created", payload)
    }

    fn rules(value: Value) -> RuleSet {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn greater_than_selects_branch() {
        let set = rules(json!({
            "rules": [{ "field": "order.total", "operator": "greater_than", "value": "100" }],
            "logic": "and"
        }));
        assert_eq!(evaluate(&set, &ctx(json!({ "total": "150" }))).branch, Branch::Yes);
        assert_eq!(evaluate(&set, &ctx(json!({ "total": "50" }))).branch, Branch::No);
    }

    #[test]
    fn empty_rule_set_is_yes() {
        let set = rules(json!({ "rules": [], "logic": "or" }));
        let outcome = evaluate(&set, &ctx(json!({})));
        assert_eq!(outcome.branch, Branch::Yes);
        assert!(outcome.rule_results.is_empty());
    }

    #[test]
    fn and_or_combination() {
        let both = |logic: &str| {
            rules(json!({
                "rules": [
                    { "field": "order.status", "operator": "equals", "value": "PAID" },
                    { "field": "order.total", "operator": "less_than", "value": 10 }
                ],
                "logic": logic
            }))
        };
        let c = ctx(json!({ "status": " paid ", "total": 25 }));
        assert_eq!(evaluate(&both("and"), &c).branch, Branch::No);
        assert_eq!(evaluate(&both("or"), &c).branch, Branch::Yes);
    }

    #[test]
    fn rule_results_capture_operands() {
        let set = rules(json!({
            "rules": [{ "field": "{{order.email}}", "operator": "ends_with", "value": "@B.com" }]
        }));
        let outcome = evaluate(&set, &ctx(json!({ "email": "a@b.com" })));
        assert_eq!(
            outcome.rule_results,
            vec![RuleResult {
                field: "{{order.email}}".to_string(),
                operator: "ends_with".to_string(),
                expected: "@B.com".to_string(),
                actual: "a@b.com".to_string(),
                passed: true,
            }]
        );
        assert_eq!(outcome.to_output()["ruleResults"][0]["passed"], true);
        assert_eq!(outcome.to_output()["branch"], "yes");
    }

    #[test]
    fn value_templates_are_resolved() {
        let set = rules(json!({
            "rules": [{ "field": "order.total", "operator": "greater_than_or_equal", "value": "{{order.minimum}}" }]
        }));
        assert_eq!(evaluate(&set, &ctx(json!({ "total": 20, "minimum": 20 }))).branch, Branch::Yes);
    }

    #[test]
    fn operator_table() {
        assert!(compare("contains", "Hello World", "WORLD"));
        assert!(compare("not_contains", "Hello", "bye"));
        assert!(compare("starts_with", "Premium Plan", "premium"));
        assert!(compare("not_equals", "a", "b"));
        assert!(compare("less_than_or_equal", "3", "3.0"));
        assert!(compare("is_empty", "", "ignored"));
        assert!(compare("is_not_empty", "x", ""));
        assert!(compare("in_list", "VIP", "gold, vip ,silver"));
        assert!(compare("not_in_list", "bronze", "gold,vip"));
        assert!(!compare("greater_than", "abc", "1"));
        assert!(!compare("greater_than", "5", ""));
        assert!(!compare("matches_regex", "a", "a"));
    }

    #[test]
    fn malformed_rules_take_no_branch_and_fail() {
        let (branch, result) = evaluate_node(&ConditionSpec::Malformed("bad rules".to_string()), &ctx(json!({})));
        assert_eq!(branch, Branch::No);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("bad rules"));
        assert_eq!(result.output.unwrap()["branch"], "no");
    }
}
