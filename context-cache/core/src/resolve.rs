//! Resolves global context references on behalf of the rule evaluation engine.

use crate::{variables, Evaluate, Store, Value, RAW};
use serde_json::Map;
use std::sync::Arc;

/// A rule's reference to a global context entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reference {
    /// The name under which the data is exposed to the rule.
    pub name: String,

    /// The name of the global context entry. May contain variables.
    pub entry: String,

    /// The projection to read. May contain variables. Reads the raw data when unset.
    pub projection: Option<String>,
}

/// Reads entries from a [`Store`] for rule evaluation.
#[derive(Clone)]
pub struct Resolver {
    store: Store,
    evaluator: Arc<dyn Evaluate>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to substitute variables in {input:?}: {source}")]
    Substitute {
        input: String,
        #[source]
        source: variables::Error,
    },

    #[error("global context entry {0:?} not found")]
    NotFound(String),

    #[error("failed to get data from global context entry {name:?}: {source}")]
    Entry {
        name: String,
        #[source]
        source: crate::Error,
    },

    #[error("failed to marshal data from global context entry {name:?}: {source}")]
    Json {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

// === impl Resolver ===

impl Resolver {
    pub fn new(store: Store, evaluator: Arc<dyn Evaluate>) -> Self {
        Self { store, evaluator }
    }

    /// Returns the JSON encoding of an entry's projection.
    pub fn get(
        &self,
        entry: &str,
        projection: Option<&str>,
        vars: &Value,
    ) -> Result<Vec<u8>, Error> {
        let (name, value) = self.lookup(entry, projection, vars)?;
        serde_json::to_vec(&*value).map_err(|source| Error::Json { name, source })
    }

    /// Adds the referenced data to a rule's evaluation context under the reference's name.
    pub fn load(
        &self,
        context: &mut Map<String, Value>,
        reference: &Reference,
        vars: &Value,
    ) -> Result<(), Error> {
        let (_, value) = self.lookup(&reference.entry, reference.projection.as_deref(), vars)?;
        tracing::trace!(name = %reference.name, entry = %reference.entry, "Loaded global context");
        context.insert(reference.name.clone(), (*value).clone());
        Ok(())
    }

    fn lookup(
        &self,
        entry: &str,
        projection: Option<&str>,
        vars: &Value,
    ) -> Result<(String, Arc<Value>), Error> {
        let name = self.substitute(entry, vars)?;
        let projection = match projection {
            Some(projection) => self.substitute(projection, vars)?,
            None => RAW.to_string(),
        };

        let entry = self
            .store
            .get(&name)
            .ok_or_else(|| Error::NotFound(name.clone()))?;
        match entry.get(&projection) {
            Ok(value) => Ok((name, value)),
            Err(source) => Err(Error::Entry { name, source }),
        }
    }

    fn substitute(&self, input: &str, vars: &Value) -> Result<String, Error> {
        variables::substitute(input, vars, &*self.evaluator).map_err(|source| Error::Substitute {
            input: input.to_string(),
            source,
        })
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("store", &self.store)
            .finish()
    }
}
