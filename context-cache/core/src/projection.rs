use crate::{Error, Value, RAW};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Evaluates query expressions against JSON data.
pub trait Evaluate: Send + Sync + 'static {
    /// Fails if the expression cannot be compiled.
    fn check(&self, expression: &str) -> anyhow::Result<()>;

    fn evaluate(&self, expression: &str, data: &Value) -> anyhow::Result<Value>;
}

/// A named query over an entry's raw data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Projection {
    pub name: String,
    pub expression: String,
}

/// The projections declared by an entry, bound to the evaluator that computes them.
#[derive(Clone)]
pub struct Projections {
    items: Arc<[Projection]>,
    evaluator: Arc<dyn Evaluate>,
}

/// The raw value and projection values of an entry at one point in time.
///
/// Snapshots are immutable once built so that readers always observe the raw value and its
/// projections together. A projection that has never evaluated successfully holds its error.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    values: HashMap<String, Result<Arc<Value>, Error>>,
}

/// Holds an entry's latest snapshot, or the error that prevented one from being built.
#[derive(Debug)]
pub struct Cached(RwLock<Result<Snapshot, Error>>);

// === impl Projections ===

impl Projections {
    pub fn new(items: impl IntoIterator<Item = Projection>, evaluator: Arc<dyn Evaluate>) -> Self {
        Self {
            items: items.into_iter().collect(),
            evaluator,
        }
    }

    /// Computes every projection, failing if any one of them fails.
    pub fn compute(&self, raw: Value) -> Result<Snapshot, Error> {
        let raw = Arc::new(raw);
        let mut values = HashMap::with_capacity(self.items.len() + 1);
        for projection in self.items.iter() {
            let value = self.evaluate(projection, &raw)?;
            values.insert(projection.name.clone(), Ok(Arc::new(value)));
        }
        values.insert(RAW.to_string(), Ok(raw));
        Ok(Snapshot { values })
    }

    /// Computes every projection, keeping the previous value of any projection that fails.
    /// A failed projection with no previous value stores its error.
    ///
    /// Returns the new snapshot along with the errors of failed projections.
    pub fn recompute(&self, raw: Value, previous: Option<&Snapshot>) -> (Snapshot, Vec<Error>) {
        let raw = Arc::new(raw);
        let mut values = HashMap::with_capacity(self.items.len() + 1);
        let mut errors = Vec::new();
        for projection in self.items.iter() {
            match self.evaluate(projection, &raw) {
                Ok(value) => {
                    values.insert(projection.name.clone(), Ok(Arc::new(value)));
                }
                Err(error) => {
                    let value = match previous.and_then(|s| s.values.get(&projection.name)) {
                        Some(Ok(value)) => Ok(value.clone()),
                        _ => Err(error.clone()),
                    };
                    values.insert(projection.name.clone(), value);
                    errors.push(error);
                }
            }
        }
        values.insert(RAW.to_string(), Ok(raw));
        (Snapshot { values }, errors)
    }

    fn evaluate(&self, projection: &Projection, raw: &Value) -> Result<Value, Error> {
        self.evaluator
            .evaluate(&projection.expression, raw)
            .map_err(|error| Error::Projection {
                name: projection.name.clone(),
                error: Arc::new(error),
            })
    }
}

impl std::fmt::Debug for Projections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

// === impl Snapshot ===

impl Snapshot {
    pub fn get(&self, projection: &str) -> Result<Arc<Value>, Error> {
        match self.values.get(projection) {
            Some(value) => value.clone(),
            None => Err(Error::ProjectionNotFound(projection.to_string())),
        }
    }
}

// === impl Cached ===

impl Cached {
    pub fn new(init: Result<Snapshot, Error>) -> Self {
        Self(RwLock::new(init))
    }

    pub fn get(&self, projection: &str) -> Result<Arc<Value>, Error> {
        match &*self.0.read() {
            Ok(snapshot) => snapshot.get(projection),
            Err(error) => Err(error.clone()),
        }
    }

    /// Replaces the cached data, clearing any stored error.
    pub fn update(&self, snapshot: Snapshot) {
        *self.0.write() = Ok(snapshot);
    }

    /// Records a failed refresh.
    ///
    /// Data from an earlier successful refresh is retained; otherwise the error replaces the
    /// previously stored one. Returns true if data was retained.
    pub fn fail(&self, error: Error) -> bool {
        let mut state = self.0.write();
        if state.is_ok() {
            return true;
        }
        *state = Err(error);
        false
    }
}
