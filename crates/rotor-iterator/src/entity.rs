use rotor_store::Document;

use crate::error::Result;
use crate::types::{FieldName, ScheduleValue};

/// A persisted record the scheduler can iterate over.
///
/// An entity may carry several independently scheduled fields, one per
/// background concern, each driven by its own iterator. Requesting a field
/// the type does not expose must return
/// [`IteratorError::InvalidField`](crate::IteratorError::InvalidField): that
/// is a wiring mistake by the integrating caller, not a runtime condition.
pub trait IterableEntity: Document {
    /// Read the named schedule field.
    fn schedule_value(&self, field: &FieldName) -> Result<ScheduleValue>;
}

/// Capability for entities scheduled by cron expression.
pub trait CronIterable: IterableEntity {
    /// The cron expression driving this entity, if one is configured.
    fn cron_expression(&self) -> Option<&str>;

    /// Whether fire times that are already in the past should be discarded
    /// instead of queued for sequential catch-up.
    fn skip_missed(&self) -> bool {
        false
    }
}
