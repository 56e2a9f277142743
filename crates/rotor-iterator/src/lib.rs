//! `rotor-iterator` — persistence-backed iteration scheduling.
//!
//! # Overview
//!
//! Turns a shared, durable collection of entities into a repeatable,
//! jitter-controlled, concurrency-bounded execution schedule for background
//! work. Each entity carries one or more schedule fields; a
//! [`PersistenceIterator`] repeatedly discovers entities whose field is due,
//! dispatches a caller-supplied [`Handler`], and atomically advances the
//! field according to its scheduling policy. Because the advance is a
//! compare-and-set against the last-read value, any number of worker
//! processes can poll the same collection without stepping on each other's
//! progress.
//!
//! # Scheduling policies
//!
//! | Policy      | Field shape      | Behaviour                                    |
//! |-------------|------------------|----------------------------------------------|
//! | `Regular`   | single timestamp | fixed cadence with first-sight redistribution |
//! | `Irregular` | timestamp list   | externally supplied timetable, consumed front-to-back |
//! | `Cron`      | timestamp list   | cron-expression expansion, skip-missed + throttle |
//!
//! # Run modes
//!
//! *Pump* executes one bounded sweep per invocation and is driven by an
//! external fixed-rate trigger; *Loop* owns a task that alternates between
//! sweeping and sleeping until the next known marker, and can be woken
//! early. The [`IteratorFactory`] wires either mode up per entity type,
//! gated by a [`WorkerActivationPolicy`].

pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod factory;
pub mod health;
pub mod policy;
pub mod query;
pub mod types;

pub use config::WorkersConfig;
pub use engine::{Handler, IteratorBuilder, PersistenceIterator};
pub use entity::{CronIterable, IterableEntity};
pub use error::{IteratorError, Result};
pub use factory::{
    IteratorFactory, LoopIterator, PumpIterator, PumpOptions, WorkerActivationPolicy,
};
pub use health::{HealthSnapshot, IteratorHealth};
pub use policy::{fire_times, CronPolicy, IrregularPolicy, RegularPolicy, SchedulingPolicy};
pub use query::{due_query, FilterExpander};
pub use types::{
    now_millis, FieldName, Millis, ProcessMode, SchedulePlan, ScheduleValue, SchedulingType,
};
