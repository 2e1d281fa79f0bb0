use crate::{Entry, Error, Value};
use std::sync::Arc;

/// Stands in for an entry whose data source could not be constructed.
///
/// Every read returns the construction error, so the store and the resolver never need to
/// special-case names that failed to build.
#[derive(Clone, Debug)]
pub struct InvalidEntry {
    error: Error,
}

// === impl InvalidEntry ===

impl InvalidEntry {
    pub fn new(error: Error) -> Self {
        Self { error }
    }

    pub fn shared(error: Error) -> Arc<dyn Entry> {
        Arc::new(Self::new(error))
    }
}

#[async_trait::async_trait]
impl Entry for InvalidEntry {
    fn get(&self, _projection: &str) -> Result<Arc<Value>, Error> {
        Err(self.error.clone())
    }

    async fn stop(&self) {}
}
