use serde_json::Value;

use flex_types::envelope::{PolicyAction, PolicyRule};

/// Evaluates `runtime` policy rules against a `{capabilityId}.{factName}`
/// subject, last-match-wins (later rules in the list override earlier
/// ones for the same pattern), defaulting to `Allow` when nothing
/// matches.
pub fn evaluate_runtime_policies(rules: &[PolicyRule], subject: &str) -> PolicyAction {
    rules
        .iter()
        .rev()
        .find(|rule| wildcard_matches(&rule.pattern, subject))
        .map(|rule| rule.action)
        .unwrap_or(PolicyAction::Allow)
}

/// `*`-only glob matcher: `*` matches any run of characters, everything
/// else must match literally. No other glob syntax (`?`, `[...]`) is
/// supported.
pub fn wildcard_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    let mut remaining = value;
    let anchored_start = !pattern.starts_with('*');
    let mut is_first = true;
    for part in pattern.split('*') {
        if part.is_empty() {
            continue;
        }
        if is_first && anchored_start {
            if let Some(stripped) = remaining.strip_prefix(part) {
                remaining = stripped;
            } else {
                return false;
            }
            is_first = false;
            continue;
        }
        is_first = false;
        if let Some(index) = remaining.find(part) {
            remaining = &remaining[index + part.len()..];
        } else {
            return false;
        }
    }
    pattern.ends_with('*') || remaining.is_empty()
}

/// Evaluates a JSON-Logic expression against `data`, returning `false`
/// for anything that doesn't resolve to a boolean. Covers the subset
/// `capability.post_conditions` expressions need: `var`, the comparison
/// operators, `and`/`or`/`!`, and `in`.
pub fn evaluate_expression(expr: &Value, data: &Value) -> bool {
    eval(expr, data).as_bool().unwrap_or(false)
}

fn eval(expr: &Value, data: &Value) -> Value {
    let Value::Object(map) = expr else {
        return expr.clone();
    };
    let Some((op, args)) = map.iter().next() else {
        return Value::Null;
    };
    if map.len() != 1 {
        return Value::Null;
    }
    let args: Vec<Value> = match args {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };

    match op.as_str() {
        "var" => {
            let path = args.first().and_then(|v| v.as_str()).unwrap_or("");
            resolve_var(data, path)
        }
        "==" => Value::Bool(binary(&args, data, |a, b| a == b)),
        "!=" => Value::Bool(binary(&args, data, |a, b| a != b)),
        ">" => Value::Bool(compare(&args, data, |ord| ord == std::cmp::Ordering::Greater)),
        ">=" => Value::Bool(compare(&args, data, |ord| ord != std::cmp::Ordering::Less)),
        "<" => Value::Bool(compare(&args, data, |ord| ord == std::cmp::Ordering::Less)),
        "<=" => Value::Bool(compare(&args, data, |ord| ord != std::cmp::Ordering::Greater)),
        "and" => Value::Bool(args.iter().all(|a| eval(a, data).as_bool().unwrap_or(false))),
        "or" => Value::Bool(args.iter().any(|a| eval(a, data).as_bool().unwrap_or(false))),
        "!" => Value::Bool(!args.first().map(|a| eval(a, data).as_bool().unwrap_or(false)).unwrap_or(false)),
        "in" => {
            let Some(needle) = args.first().map(|a| eval(a, data)) else {
                return Value::Bool(false);
            };
            let Some(haystack) = args.get(1).map(|a| eval(a, data)) else {
                return Value::Bool(false);
            };
            Value::Bool(match haystack {
                Value::Array(items) => items.iter().any(|v| *v == needle),
                Value::String(s) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
                _ => false,
            })
        }
        _ => Value::Null,
    }
}

fn resolve_var(data: &Value, path: &str) -> Value {
    if path.is_empty() {
        return data.clone();
    }
    path.split('.').fold(Some(data.clone()), |acc, segment| acc.and_then(|v| v.get(segment).cloned()))
        .unwrap_or(Value::Null)
}

fn binary(args: &[Value], data: &Value, cmp: impl Fn(&Value, &Value) -> bool) -> bool {
    match (args.first(), args.get(1)) {
        (Some(a), Some(b)) => cmp(&eval(a, data), &eval(b, data)),
        _ => false,
    }
}

fn compare(args: &[Value], data: &Value, cmp: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    let (Some(a), Some(b)) = (args.first(), args.get(1)) else {
        return false;
    };
    let (a, b) = (eval(a, data), eval(b, data));
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).map(cmp).unwrap_or(false),
        _ => match (a.as_str(), b.as_str()) {
            (Some(a), Some(b)) => cmp(a.cmp(b)),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_prefix_glob() {
        assert!(wildcard_matches("qa.*", "qa.tone"));
        assert!(!wildcard_matches("qa.*", "copy.tone"));
    }

    #[test]
    fn wildcard_matches_suffix_glob() {
        assert!(wildcard_matches("*.tone", "qa.tone"));
        assert!(wildcard_matches("*.tone", "copy.tone"));
        assert!(!wildcard_matches("*.tone", "qa.structure"));
    }

    #[test]
    fn evaluate_runtime_policies_last_match_wins() {
        let rules = vec![
            PolicyRule {
                pattern: "qa.*".to_string(),
                action: PolicyAction::Deny,
                reason: None,
            },
            PolicyRule {
                pattern: "qa.tone".to_string(),
                action: PolicyAction::RequireApproval,
                reason: None,
            },
        ];
        assert_eq!(
            evaluate_runtime_policies(&rules, "qa.tone"),
            PolicyAction::RequireApproval
        );
        assert_eq!(evaluate_runtime_policies(&rules, "qa.structure"), PolicyAction::Deny);
    }

    #[test]
    fn evaluate_runtime_policies_defaults_to_allow() {
        let rules = vec![];
        assert_eq!(evaluate_runtime_policies(&rules, "anything"), PolicyAction::Allow);
    }

    #[test]
    fn evaluate_expression_resolves_var_and_comparisons() {
        let data = serde_json::json!({"wordCount": 120, "tone": "formal"});
        assert!(evaluate_expression(&serde_json::json!({">=": [{"var": "wordCount"}, 100]}), &data));
        assert!(!evaluate_expression(&serde_json::json!({"<": [{"var": "wordCount"}, 100]}), &data));
        assert!(evaluate_expression(&serde_json::json!({"==": [{"var": "tone"}, "formal"]}), &data));
    }

    #[test]
    fn evaluate_expression_supports_and_or_not_in() {
        let data = serde_json::json!({"tone": "formal", "tags": ["launch", "q4"]});
        assert!(evaluate_expression(
            &serde_json::json!({"and": [{"==": [{"var": "tone"}, "formal"]}, {"in": [{"var": "tone"}, ["formal", "casual"]]}]}),
            &data
        ));
        assert!(!evaluate_expression(&serde_json::json!({"!": [{"==": [{"var": "tone"}, "formal"]}]}), &data));
        assert!(evaluate_expression(&serde_json::json!({"in": ["launch", {"var": "tags"}]}), &data));
    }
}
