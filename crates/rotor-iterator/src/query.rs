//! Due-entity query construction.
//!
//! A due query is the caller's scope predicate (the filter expander) ANDed
//! with the universal due-time predicate: the schedule field's earliest
//! timestamp is in the past, or the field was never set.

use std::time::Duration;

use rotor_store::Filter;

use crate::types::{FieldName, Millis};

/// Caller-supplied scope predicate for an entity type. Pure and stateless;
/// the same expander is reused on every sweep.
pub trait FilterExpander: Send + Sync {
    fn expand(&self, base: Filter) -> Filter;
}

impl<F> FilterExpander for F
where
    F: Fn(Filter) -> Filter + Send + Sync,
{
    fn expand(&self, base: Filter) -> Filter {
        self(base)
    }
}

/// Build the query matching every entity due as of `now`.
///
/// `maximum_delay_for_check` bounds how far behind `now` the overdue window
/// reaches; entities that have fallen further behind are left for alerting
/// rather than swept up here. The expander's predicate tree is composed by a
/// top-level AND without reshaping it.
pub fn due_query(
    field: &FieldName,
    now: Millis,
    maximum_delay_for_check: Option<Duration>,
    expander: Option<&dyn FilterExpander>,
) -> Filter {
    let overdue = match maximum_delay_for_check {
        Some(horizon) => Filter::gt(field.as_str(), now - horizon.as_millis() as Millis)
            .and(Filter::lt(field.as_str(), now)),
        None => Filter::lt(field.as_str(), now),
    };
    let due = Filter::Or(vec![overdue, Filter::exists(field.as_str(), false)]);

    match expander {
        Some(expander) => expander.expand(Filter::all()).and(due),
        None => due,
    }
}
