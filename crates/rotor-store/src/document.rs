use serde::de::DeserializeOwned;
use serde::Serialize;

/// A record that can be persisted by a [`StorageProvider`](crate::StorageProvider).
///
/// Documents round-trip through JSON objects. The id must be stable for the
/// lifetime of the record: it is the key for conditional field updates.
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection (table) this document type lives in.
    const COLLECTION: &'static str;

    /// Stable unique identifier.
    fn id(&self) -> &str;
}
