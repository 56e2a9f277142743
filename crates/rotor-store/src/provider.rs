use async_trait::async_trait;
use serde_json::Value;

use crate::document::Document;
use crate::error::Result;
use crate::filter::Filter;

/// Storage boundary consumed by the iteration scheduler.
///
/// Implementations must be `Send + Sync`; one provider instance is shared by
/// every iterator polling the same collection.
#[async_trait]
pub trait StorageProvider<T: Document>: Send + Sync {
    /// Insert the document, replacing any existing one with the same id.
    async fn insert(&self, entity: &T) -> Result<()>;

    /// Fetch a single document by id.
    async fn get(&self, id: &str) -> Result<Option<T>>;

    /// All documents matching the filter. No ordering is guaranteed.
    async fn find(&self, filter: &Filter) -> Result<Vec<T>>;

    /// The matching document with the smallest `order_field` value
    /// (smallest element, for list-valued fields). Documents without a
    /// comparable value (missing, null, or empty-list fields) are
    /// ignored; `None` when nothing matches or nothing carries the field.
    async fn find_first(&self, filter: &Filter, order_field: &str) -> Result<Option<T>>;

    /// Atomically set `field` to `new` if and only if it still holds
    /// `observed` (`None` = absent or null). Returns `false` when the
    /// document is gone or another writer got there first.
    ///
    /// This compare-and-set is the only coordination mechanism between
    /// iterator instances sharing a collection.
    async fn conditional_update(
        &self,
        id: &str,
        field: &str,
        observed: Option<&Value>,
        new: &Value,
    ) -> Result<bool>;
}
