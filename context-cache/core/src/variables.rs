//! Substitution of `{{ expression }}` variables.
//!
//! Each variable is a query expression evaluated against the rule's variables. A leading
//! backslash (`\{{ ... }}`) escapes a variable so that it is emitted literally, without the
//! backslash.

use crate::{Evaluate, Value};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static VARIABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\?\{\{([^{}]*)\}\}").expect("variable regex must compile"));

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("variable {0:?} not resolved")]
    Unresolved(String),

    #[error("failed to evaluate variable {expression:?}: {error:#}")]
    Evaluate {
        expression: String,
        error: anyhow::Error,
    },
}

/// Replaces every variable in `input` with its value.
///
/// String values are substituted verbatim; other values are substituted as JSON. A variable
/// that evaluates to null is an error.
pub fn substitute(input: &str, vars: &Value, evaluator: &dyn Evaluate) -> Result<String, Error> {
    let mut error = None;
    let output = VARIABLE.replace_all(input, |caps: &Captures<'_>| {
        let matched = &caps[0];
        if let Some(escaped) = matched.strip_prefix('\\') {
            return escaped.to_string();
        }
        if error.is_some() {
            return String::new();
        }

        let expression = caps[1].trim();
        match evaluator.evaluate(expression, vars) {
            Ok(Value::String(s)) => s,
            Ok(Value::Null) => {
                error = Some(Error::Unresolved(expression.to_string()));
                String::new()
            }
            Ok(value) => value.to_string(),
            Err(e) => {
                error = Some(Error::Evaluate {
                    expression: expression.to_string(),
                    error: e,
                });
                String::new()
            }
        }
    });

    match error {
        Some(error) => Err(error),
        None => Ok(output.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JmesPath;
    use serde_json::json;

    #[test]
    fn substitutes_values() {
        let vars = json!({
            "request": { "namespace": "prod", "replicas": 3 },
        });
        let out = substitute(
            "{{ request.namespace }}-{{request.replicas}}",
            &vars,
            &JmesPath::new(),
        )
        .unwrap();
        assert_eq!(out, "prod-3");
    }

    #[test]
    fn leaves_plain_input() {
        let out = substitute("deployments", &json!({}), &JmesPath::new()).unwrap();
        assert_eq!(out, "deployments");
    }

    #[test]
    fn escaped_variables_are_literal() {
        let input = r"\{{ request.namespace }}";
        let out = substitute(input, &json!({}), &JmesPath::new()).unwrap();
        assert_eq!(out, "{{ request.namespace }}");
    }

    #[test]
    fn unresolved_variables_fail() {
        let err = substitute("{{ request.missing }}", &json!({}), &JmesPath::new())
            .expect_err("missing variable must fail");
        assert!(matches!(err, Error::Unresolved(ref e) if e == "request.missing"));
    }
}
