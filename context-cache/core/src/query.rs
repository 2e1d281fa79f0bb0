use crate::{Evaluate, Value};
use anyhow::{Context, Result};

/// Evaluates JMESPath expressions.
#[derive(Clone, Debug, Default)]
pub struct JmesPath(());

impl JmesPath {
    pub fn new() -> Self {
        Self(())
    }
}

impl Evaluate for JmesPath {
    fn check(&self, expression: &str) -> Result<()> {
        jmespath::compile(expression)?;
        Ok(())
    }

    fn evaluate(&self, expression: &str, data: &Value) -> Result<Value> {
        let compiled = jmespath::compile(expression)?;
        let result = compiled
            .search(data)
            .with_context(|| format!("failed to search {expression:?}"))?;
        serde_json::to_value(&*result).context("failed to convert search result")
    }
}
