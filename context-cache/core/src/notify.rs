use crate::Error;

/// Why an entry's data source failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Reason {
    /// The initial list of a resource watch did not complete.
    SyncFailed,
    /// A resource watch failed after its initial sync.
    WatchFailed,
    /// An API call failed or returned unusable data.
    ApiCallFailed,
    /// A projection could not be evaluated against fresh data.
    ProjectionFailed,
    /// The entry could not be built from its spec.
    BuildFailed,
}

/// Receives lifecycle notifications about a single entry.
///
/// Implementations surface these to operators, e.g. as events and status conditions on the
/// object that declared the entry. Methods must not block.
pub trait Notify: Send + Sync + 'static {
    /// The entry's data was refreshed successfully.
    fn refreshed(&self);

    /// The entry's data source failed.
    fn failed(&self, reason: Reason, error: &Error);

    /// The entry was removed from the cache.
    fn deleted(&self) {}
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyncFailed => "CacheSyncFailure",
            Self::WatchFailed => "WatchFailure",
            Self::ApiCallFailed => "APICallFailure",
            Self::ProjectionFailed => "ProjectionFailure",
            Self::BuildFailed => "BuildFailure",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
