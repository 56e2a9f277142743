//! The iterator engine: sweeps a collection for due entities, dispatches a
//! handler for each under a concurrency bound, and atomically advances each
//! entity's schedule.
//!
//! Correctness across iterator instances sharing a collection rests on the
//! compare-and-set reschedule: an instance that lost the race simply skips
//! its write and the entity stays eligible for the next sweep. Two instances
//! that both read an entity as due *before* either reschedule commits can
//! still dispatch it twice; that narrow window is accepted (handlers are
//! expected to be idempotent and intervals short), not closed with a lease.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use rotor_store::{Filter, StorageProvider};

use crate::entity::{CronIterable, IterableEntity};
use crate::error::{IteratorError, Result};
use crate::health::{HealthSnapshot, IteratorHealth};
use crate::policy::{CronPolicy, IrregularPolicy, RegularPolicy, SchedulingPolicy};
use crate::query::{due_query, FilterExpander};
use crate::types::{
    now_millis, FieldName, Millis, ProcessMode, SchedulePlan, ScheduleValue, SchedulingType,
};

/// Per-entity work callback.
///
/// Invoked at most once per due cycle per entity by a given engine instance.
/// Failures are logged and never stall the schedule: the entity is
/// rescheduled regardless.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, entity: T) -> anyhow::Result<()>;
}

struct Inner<T: IterableEntity> {
    name: String,
    field: FieldName,
    mode: ProcessMode,
    target_interval: Duration,
    maximum_delay_for_check: Option<Duration>,
    acceptable_no_alert_delay: Option<Duration>,
    acceptable_execution_time: Option<Duration>,
    semaphore: Arc<Semaphore>,
    policy: Box<dyn SchedulingPolicy<T>>,
    handler: Arc<dyn Handler<T>>,
    provider: Arc<dyn StorageProvider<T>>,
    expander: Option<Box<dyn FilterExpander>>,
    health: IteratorHealth,
    wake: Notify,
}

/// A configured iterator over one schedule field of one entity type.
///
/// Cheap to clone; clones share the same engine state.
pub struct PersistenceIterator<T: IterableEntity> {
    inner: Arc<Inner<T>>,
}

impl<T: IterableEntity> Clone for PersistenceIterator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: IterableEntity> PersistenceIterator<T> {
    pub fn builder() -> IteratorBuilder<T> {
        IteratorBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn mode(&self) -> ProcessMode {
        self.inner.mode
    }

    pub fn health(&self) -> HealthSnapshot {
        self.inner.health.snapshot()
    }

    /// The query matching every entity due as of `as_of`. Exposed so callers
    /// can count or inspect due entities without dispatching anything.
    pub fn create_query(&self, as_of: Millis) -> Filter {
        due_query(
            &self.inner.field,
            as_of,
            self.inner.maximum_delay_for_check,
            self.inner.expander.as_deref(),
        )
    }

    /// One sweep: query everything currently due and dispatch it. Returns
    /// the number of entities handed to the handler.
    pub async fn process_pump(&self) -> Result<usize> {
        let now = now_millis();
        let due = self.inner.provider.find(&self.create_query(now)).await?;
        self.inner.health.record_sweep();
        let mut dispatched = 0;
        for entity in due {
            if self.process_entity(entity).await? {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Dispatch one entity: seed it on first sight, otherwise run the
    /// handler under a semaphore permit and advance the schedule when it
    /// finishes. Returns whether the handler was dispatched.
    ///
    /// Only configuration-class errors propagate; handler and storage
    /// failures are contained and logged.
    pub async fn process_entity(&self, entity: T) -> Result<bool> {
        let inner = &self.inner;
        let now = now_millis();
        let observed = entity.schedule_value(&inner.field)?;

        if observed.is_unset() {
            if let Some(plan) = inner.policy.first_sight(&entity, &inner.field, now) {
                debug!(iterator = %inner.name, entity = %entity.id(), "seeding first-time schedule");
                apply_plan(inner, &entity, &observed, plan).await;
                return Ok(false);
            }
        }

        if let Some(head) = observed.head() {
            let lag = now - head;
            let acceptable = inner
                .acceptable_no_alert_delay
                .map(|d| d.as_millis() as i64);
            if inner.health.record_lag(lag, acceptable) {
                warn!(
                    iterator = %inner.name,
                    entity = %entity.id(),
                    lag_ms = lag,
                    "entity dispatched later than the acceptable delay"
                );
            }
        }

        // Backpressure: when every permit is in use this blocks the sweep,
        // throttling how fast entities come off the due queue.
        let permit = match Arc::clone(&inner.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Ok(false),
        };
        inner.health.record_dispatch();

        let this = Arc::clone(inner);
        tokio::spawn(async move {
            let _permit = permit;
            let entity_id = entity.id().to_string();
            let started = Instant::now();

            if let Err(err) = this.handler.handle(entity.clone()).await {
                this.health.record_handler_failure();
                error!(
                    iterator = %this.name,
                    entity = %entity_id,
                    error = ?err,
                    "handler failed; entity will still be rescheduled"
                );
            }
            let elapsed = started.elapsed();
            if this
                .acceptable_execution_time
                .is_some_and(|limit| elapsed > limit)
            {
                this.health.record_slow_handler();
                warn!(
                    iterator = %this.name,
                    entity = %entity_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "handler exceeded acceptable execution time"
                );
            }

            match this.policy.plan(&entity, &this.field, now_millis()) {
                Ok(plan) => apply_plan(&this, &entity, &observed, plan).await,
                Err(err) => error!(
                    iterator = %this.name,
                    entity = %entity_id,
                    error = %err,
                    "reschedule planning failed; schedule left untouched"
                ),
            }
        });
        Ok(true)
    }

    /// Continuous mode: sweep, then sleep until the earliest upcoming marker
    /// (capped at the target interval), until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(iterator = %self.inner.name, "iterator loop started");
        loop {
            match self.process_pump().await {
                Ok(count) if count > 0 => {
                    debug!(iterator = %self.inner.name, dispatched = count, "sweep complete");
                }
                Ok(_) => {}
                Err(err) => error!(iterator = %self.inner.name, error = %err, "sweep failed"),
            }

            let delay = self.next_sweep_delay().await;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.wake.notified() => {
                    debug!(iterator = %self.inner.name, "woken before schedule");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(iterator = %self.inner.name, "iterator loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Interrupt the loop's sleep so the next sweep starts immediately.
    /// Pump iterators have no sleep to interrupt; the call is a no-op there.
    pub fn wakeup(&self) {
        if self.inner.mode != ProcessMode::Loop {
            debug!(iterator = %self.inner.name, "wakeup on a pump iterator has no effect");
            return;
        }
        self.inner.wake.notify_one();
    }

    /// Make one entity immediately due by forcing its schedule field to now,
    /// then wake the loop. Only meaningful for regular scheduling. Returns
    /// false when the entity is gone or a concurrent writer interfered.
    pub async fn wakeup_entity(&self, id: &str) -> Result<bool> {
        if self.inner.policy.kind() != SchedulingType::Regular {
            return Err(IteratorError::Config(
                "wakeup_entity is only supported for regular scheduling".to_string(),
            ));
        }
        let Some(entity) = self.inner.provider.get(id).await? else {
            return Ok(false);
        };
        let observed = entity.schedule_value(&self.inner.field)?;
        let observed_json = observed.to_json();
        let updated = self
            .inner
            .provider
            .conditional_update(
                id,
                self.inner.field.as_str(),
                observed_json.as_ref(),
                &Value::from(now_millis()),
            )
            .await?;
        if updated {
            self.wakeup();
        }
        Ok(updated)
    }
}

/// Persist a policy verdict with a compare-and-set on the value observed at
/// dispatch time. A lost race means another instance already advanced the
/// entity; skipping is the correct outcome.
async fn apply_plan<T: IterableEntity>(
    inner: &Inner<T>,
    entity: &T,
    observed: &ScheduleValue,
    plan: SchedulePlan,
) {
    let new_value = match plan {
        SchedulePlan::Next(at) => Value::from(at),
        SchedulePlan::Replace(times) => Value::from(times),
        SchedulePlan::Park => json!([]),
        SchedulePlan::PopHead => match observed {
            ScheduleValue::List(Some(entries)) if !entries.is_empty() => {
                Value::from(entries[1..].to_vec())
            }
            _ => return,
        },
    };
    match inner
        .provider
        .conditional_update(
            entity.id(),
            inner.field.as_str(),
            observed.to_json().as_ref(),
            &new_value,
        )
        .await
    {
        Ok(true) => debug!(iterator = %inner.name, entity = %entity.id(), "schedule advanced"),
        Ok(false) => {
            inner.health.record_lost_race();
            debug!(
                iterator = %inner.name,
                entity = %entity.id(),
                "reschedule race lost; skipping this cycle"
            );
        }
        Err(err) => warn!(
            iterator = %inner.name,
            entity = %entity.id(),
            error = %err,
            "failed to persist schedule"
        ),
    }
}

/// Configuration surface for [`PersistenceIterator`].
pub struct IteratorBuilder<T: IterableEntity> {
    name: Option<String>,
    field: Option<FieldName>,
    mode: ProcessMode,
    target_interval: Duration,
    maximum_delay_for_check: Option<Duration>,
    acceptable_no_alert_delay: Option<Duration>,
    acceptable_execution_time: Option<Duration>,
    semaphore_permits: usize,
    scheduling_type: SchedulingType,
    redistribute: bool,
    policy: Option<Box<dyn SchedulingPolicy<T>>>,
    expander: Option<Box<dyn FilterExpander>>,
    handler: Option<Arc<dyn Handler<T>>>,
    provider: Option<Arc<dyn StorageProvider<T>>>,
}

impl<T: IterableEntity> Default for IteratorBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: IterableEntity> IteratorBuilder<T> {
    pub fn new() -> Self {
        Self {
            name: None,
            field: None,
            mode: ProcessMode::Pump,
            target_interval: Duration::from_secs(60),
            maximum_delay_for_check: None,
            acceptable_no_alert_delay: None,
            acceptable_execution_time: None,
            semaphore_permits: 1,
            scheduling_type: SchedulingType::Regular,
            redistribute: false,
            policy: None,
            expander: None,
            handler: None,
            provider: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn field(mut self, field: impl Into<FieldName>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn mode(mut self, mode: ProcessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn target_interval(mut self, interval: Duration) -> Self {
        self.target_interval = interval;
        self
    }

    pub fn maximum_delay_for_check(mut self, horizon: Duration) -> Self {
        self.maximum_delay_for_check = Some(horizon);
        self
    }

    pub fn acceptable_no_alert_delay(mut self, delay: Duration) -> Self {
        self.acceptable_no_alert_delay = Some(delay);
        self
    }

    pub fn acceptable_execution_time(mut self, limit: Duration) -> Self {
        self.acceptable_execution_time = Some(limit);
        self
    }

    pub fn semaphore_permits(mut self, permits: usize) -> Self {
        self.semaphore_permits = permits;
        self
    }

    pub fn scheduling_type(mut self, scheduling_type: SchedulingType) -> Self {
        self.scheduling_type = scheduling_type;
        self
    }

    pub fn redistribute(mut self, redistribute: bool) -> Self {
        self.redistribute = redistribute;
        self
    }

    pub fn filter_expander(mut self, expander: impl FilterExpander + 'static) -> Self {
        self.expander = Some(Box::new(expander));
        self
    }

    pub fn handler(mut self, handler: impl Handler<T> + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn provider(mut self, provider: Arc<dyn StorageProvider<T>>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn build(self) -> Result<PersistenceIterator<T>> {
        let field = self
            .field
            .ok_or_else(|| IteratorError::Config("a schedule field name is required".into()))?;
        let handler = self
            .handler
            .ok_or_else(|| IteratorError::Config("a handler is required".into()))?;
        let provider = self
            .provider
            .ok_or_else(|| IteratorError::Config("a storage provider is required".into()))?;
        if self.semaphore_permits == 0 {
            return Err(IteratorError::Config(
                "semaphore_permits must be at least 1".into(),
            ));
        }

        let policy: Box<dyn SchedulingPolicy<T>> = match self.policy {
            Some(policy) => policy,
            None => match self.scheduling_type {
                SchedulingType::Regular => {
                    Box::new(RegularPolicy::new(self.target_interval, self.redistribute))
                }
                SchedulingType::Irregular => Box::new(IrregularPolicy::new(false)),
                SchedulingType::IrregularSkipMissed => Box::new(IrregularPolicy::new(true)),
                SchedulingType::Cron => {
                    return Err(IteratorError::Config(
                        "cron scheduling requires with_cron_policy()".into(),
                    ))
                }
            },
        };

        let name = self
            .name
            .unwrap_or_else(|| format!("{}-{}", T::COLLECTION, field));

        Ok(PersistenceIterator {
            inner: Arc::new(Inner {
                name,
                field,
                mode: self.mode,
                target_interval: self.target_interval,
                maximum_delay_for_check: self.maximum_delay_for_check,
                acceptable_no_alert_delay: self.acceptable_no_alert_delay,
                acceptable_execution_time: self.acceptable_execution_time,
                semaphore: Arc::new(Semaphore::new(self.semaphore_permits)),
                policy,
                handler,
                provider,
                expander: self.expander,
                health: IteratorHealth::new(),
                wake: Notify::new(),
            }),
        })
    }
}

impl<T: CronIterable> IteratorBuilder<T> {
    /// Install cron scheduling. `throttle` bounds how far ahead fire times
    /// are precomputed.
    pub fn with_cron_policy(mut self, throttle: Duration) -> Self {
        self.scheduling_type = SchedulingType::Cron;
        self.policy = Some(Box::new(CronPolicy::new(throttle)));
        self
    }
}

impl<T: IterableEntity> PersistenceIterator<T> {
    /// Time until the next known marker in scope, capped at the target
    /// interval; the cap doubles as the poll fallback when nothing is
    /// scheduled.
    async fn next_sweep_delay(&self) -> Duration {
        let scope = match &self.inner.expander {
            Some(expander) => expander.expand(Filter::all()),
            None => Filter::all(),
        };
        let next = match self
            .inner
            .provider
            .find_first(&scope, self.inner.field.as_str())
            .await
        {
            Ok(found) => found
                .and_then(|entity| entity.schedule_value(&self.inner.field).ok())
                .and_then(|value| value.head()),
            Err(err) => {
                warn!(iterator = %self.inner.name, error = %err, "could not look up the next marker");
                None
            }
        };
        match next {
            Some(at) => {
                let cap = self.inner.target_interval.as_millis() as i64;
                Duration::from_millis((at - now_millis()).clamp(0, cap) as u64)
            }
            None => self.inner.target_interval,
        }
    }
}
