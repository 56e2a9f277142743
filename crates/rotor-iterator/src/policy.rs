//! Scheduling policies: the strategy objects that compute when an entity
//! runs next.
//!
//! | Policy              | Field shape      | Behaviour                                   |
//! |---------------------|------------------|---------------------------------------------|
//! | [`RegularPolicy`]   | single timestamp | fixed cadence, first-sight redistribution   |
//! | [`IrregularPolicy`] | timestamp list   | consume front-to-back, regenerate when dry  |
//! | [`CronPolicy`]      | timestamp list   | cron expansion with skip-missed / throttle  |

use std::str::FromStr;
use std::time::Duration;

use chrono::TimeZone;
use rand::Rng;
use tracing::warn;

use crate::entity::{CronIterable, IterableEntity};
use crate::error::{IteratorError, Result};
use crate::types::{FieldName, Millis, SchedulePlan, ScheduleValue, SchedulingType};

/// Strategy consulted by the engine after each processing cycle.
pub trait SchedulingPolicy<T: IterableEntity>: Send + Sync {
    fn kind(&self) -> SchedulingType;

    /// Called when the engine sees an entity whose field was never set.
    /// `Some(plan)` means "seed the schedule and skip the handler this
    /// cycle"; `None` means the entity is simply due.
    fn first_sight(&self, entity: &T, field: &FieldName, now: Millis) -> Option<SchedulePlan> {
        let _ = (entity, field, now);
        None
    }

    /// Compute the next schedule state after a handler invocation. The
    /// engine persists the plan with a compare-and-set keyed on the value it
    /// read before dispatching, so repeated calls without an intervening
    /// write cannot double-apply.
    fn plan(&self, entity: &T, field: &FieldName, now: Millis) -> Result<SchedulePlan>;
}

/// Fixed-cadence scheduling over a single timestamp field.
#[derive(Debug, Clone)]
pub struct RegularPolicy {
    target_interval: Duration,
    redistribute: bool,
}

impl RegularPolicy {
    pub fn new(target_interval: Duration, redistribute: bool) -> Self {
        Self {
            target_interval,
            redistribute,
        }
    }

    fn interval_millis(&self) -> Millis {
        self.target_interval.as_millis() as Millis
    }
}

impl<T: IterableEntity> SchedulingPolicy<T> for RegularPolicy {
    fn kind(&self) -> SchedulingType {
        SchedulingType::Regular
    }

    fn first_sight(&self, entity: &T, field: &FieldName, now: Millis) -> Option<SchedulePlan> {
        let _ = (entity, field);
        let next = if self.redistribute {
            // Spread freshly created entities across one interval so a batch
            // creation does not produce a synchronized load spike.
            now + rand::thread_rng().gen_range(0..=self.interval_millis().max(1))
        } else {
            now
        };
        Some(SchedulePlan::Next(next))
    }

    fn plan(&self, entity: &T, field: &FieldName, now: Millis) -> Result<SchedulePlan> {
        // Validates the field exists; the computed time depends only on now.
        entity.schedule_value(field)?;
        Ok(SchedulePlan::Next(now + self.interval_millis()))
    }
}

/// List-consuming scheduling for externally supplied, irregular timetables.
#[derive(Debug, Clone)]
pub struct IrregularPolicy {
    skip_missed: bool,
    regen_count: usize,
    regen_step: Duration,
}

impl IrregularPolicy {
    pub fn new(skip_missed: bool) -> Self {
        Self {
            skip_missed,
            regen_count: 4,
            regen_step: Duration::from_millis(1000),
        }
    }

    /// Override the regeneration window used when the list runs dry.
    pub fn with_regeneration(mut self, count: usize, step: Duration) -> Self {
        self.regen_count = count;
        self.regen_step = step;
        self
    }

    fn regenerate(&self, now: Millis) -> Vec<Millis> {
        let step = (self.regen_step.as_millis() as Millis).max(1);
        (1..=self.regen_count as Millis).map(|k| now + k * step).collect()
    }
}

impl<T: IterableEntity> SchedulingPolicy<T> for IrregularPolicy {
    fn kind(&self) -> SchedulingType {
        if self.skip_missed {
            SchedulingType::IrregularSkipMissed
        } else {
            SchedulingType::Irregular
        }
    }

    fn plan(&self, entity: &T, field: &FieldName, now: Millis) -> Result<SchedulePlan> {
        let entries = match entity.schedule_value(field)? {
            ScheduleValue::List(entries) => entries.unwrap_or_default(),
            ScheduleValue::Single(_) => {
                return Err(IteratorError::Config(format!(
                    "irregular scheduling requires a list-valued field, got a single timestamp in '{field}'"
                )))
            }
        };

        if entries.len() > 1 {
            if !self.skip_missed {
                // Catch-up path: the just-fired head goes, the rest of the
                // timetable is left exactly as supplied.
                return Ok(SchedulePlan::PopHead);
            }
            let future: Vec<Millis> = entries.into_iter().filter(|t| *t > now).collect();
            if !future.is_empty() {
                return Ok(SchedulePlan::Replace(future));
            }
            // Everything was stale; fall through to regeneration.
        }

        Ok(SchedulePlan::Replace(self.regenerate(now)))
    }
}

/// Cron-expression scheduling over a list field.
#[derive(Debug, Clone)]
pub struct CronPolicy {
    throttle: Duration,
    max_expansion: usize,
}

impl CronPolicy {
    pub fn new(throttle: Duration) -> Self {
        Self {
            throttle,
            max_expansion: 10,
        }
    }

    pub fn with_max_expansion(mut self, max_expansion: usize) -> Self {
        self.max_expansion = max_expansion.max(1);
        self
    }
}

impl<T: CronIterable> SchedulingPolicy<T> for CronPolicy {
    fn kind(&self) -> SchedulingType {
        SchedulingType::Cron
    }

    fn plan(&self, entity: &T, field: &FieldName, now: Millis) -> Result<SchedulePlan> {
        let entries = match entity.schedule_value(field)? {
            ScheduleValue::List(entries) => entries,
            ScheduleValue::Single(_) => {
                return Err(IteratorError::Config(format!(
                    "cron scheduling requires a list-valued field, got a single timestamp in '{field}'"
                )))
            }
        };

        let Some(expression) = entity.cron_expression() else {
            warn!(entity = %entity.id(), "no cron expression configured; parking entity");
            return Ok(SchedulePlan::Park);
        };

        let origin = entries.and_then(|v| v.first().copied()).unwrap_or(now);
        let throttle = self.throttle.as_millis() as Millis;
        match fire_times(
            expression,
            origin,
            now,
            throttle,
            self.max_expansion,
            entity.skip_missed(),
        ) {
            Ok(times) if times.is_empty() => {
                // The expression has no future fire time left (e.g. a
                // year-bounded schedule that ran out).
                Ok(SchedulePlan::Park)
            }
            Ok(times) => Ok(SchedulePlan::Replace(times)),
            Err(err) => {
                warn!(entity = %entity.id(), error = %err, "cron recalculation failed; parking entity");
                Ok(SchedulePlan::Park)
            }
        }
    }
}

/// Expand a cron expression into upcoming fire times.
///
/// Fire times are collected strictly after `origin` while they fall inside
/// `now + throttle`, capped at `max` entries. The first fire time is always
/// included even when it lies beyond the horizon: the throttle bounds how
/// much is *pre*computed, it must never starve a sparse expression. With
/// `skip_missed`, expansion starts from `now` so nothing stale is returned.
///
/// Also usable at entity intake to validate an expression before storing it.
pub fn fire_times(
    expression: &str,
    origin: Millis,
    now: Millis,
    throttle: Millis,
    max: usize,
    skip_missed: bool,
) -> Result<Vec<Millis>> {
    let schedule = cron::Schedule::from_str(expression).map_err(|e| IteratorError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })?;

    let start = if skip_missed { origin.max(now) } else { origin };
    let start_dt = chrono::Utc
        .timestamp_millis_opt(start)
        .single()
        .ok_or_else(|| IteratorError::InvalidCron {
            expression: expression.to_string(),
            reason: format!("expansion origin {start} is out of range"),
        })?;

    let horizon = now + throttle;
    let mut times = Vec::new();
    for fire in schedule.after(&start_dt) {
        let at = fire.timestamp_millis();
        if times.is_empty() || (times.len() < max && at <= horizon) {
            times.push(at);
        } else {
            break;
        }
    }
    Ok(times)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rotor_store::Document;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Job {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        expression: Option<String>,
        skip: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_run: Option<Millis>,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_runs: Option<Vec<Millis>>,
    }

    impl Document for Job {
        const COLLECTION: &'static str = "jobs";

        fn id(&self) -> &str {
            &self.id
        }
    }

    impl IterableEntity for Job {
        fn schedule_value(&self, field: &FieldName) -> Result<ScheduleValue> {
            match field.as_str() {
                "next_run" => Ok(ScheduleValue::Single(self.next_run)),
                "next_runs" => Ok(ScheduleValue::List(self.next_runs.clone())),
                other => Err(IteratorError::InvalidField {
                    field: other.to_string(),
                }),
            }
        }
    }

    impl CronIterable for Job {
        fn cron_expression(&self) -> Option<&str> {
            self.expression.as_deref()
        }

        fn skip_missed(&self) -> bool {
            self.skip
        }
    }

    fn list_job(next_runs: Option<Vec<Millis>>) -> Job {
        Job {
            id: "j".into(),
            expression: None,
            skip: false,
            next_run: None,
            next_runs,
        }
    }

    fn cron_job(expression: &str, skip: bool, next_runs: Option<Vec<Millis>>) -> Job {
        Job {
            id: "c".into(),
            expression: Some(expression.into()),
            skip,
            next_run: None,
            next_runs,
        }
    }

    const FIELD: &str = "next_runs";

    #[test]
    fn regular_reschedules_one_interval_out() {
        let policy = RegularPolicy::new(Duration::from_secs(30), true);
        let job = Job {
            next_run: Some(500),
            ..list_job(None)
        };
        let plan = SchedulingPolicy::<Job>::plan(&policy, &job, &"next_run".into(), 10_000).unwrap();
        assert_eq!(plan, SchedulePlan::Next(10_000 + 30_000));
    }

    #[test]
    fn regular_first_sight_redistributes_within_one_interval() {
        let policy = RegularPolicy::new(Duration::from_secs(60), true);
        let job = list_job(None);
        for _ in 0..50 {
            let Some(SchedulePlan::Next(next)) =
                SchedulingPolicy::<Job>::first_sight(&policy, &job, &"next_run".into(), 1_000_000)
            else {
                panic!("regular policy must seed on first sight");
            };
            assert!((1_000_000..=1_060_000).contains(&next));
        }
    }

    #[test]
    fn regular_first_sight_without_redistribution_is_due_now() {
        let policy = RegularPolicy::new(Duration::from_secs(60), false);
        let job = list_job(None);
        let plan = SchedulingPolicy::<Job>::first_sight(&policy, &job, &"next_run".into(), 42);
        assert_eq!(plan, Some(SchedulePlan::Next(42)));
    }

    #[test]
    fn irregular_consumes_head_while_entries_remain() {
        let policy = IrregularPolicy::new(false);
        let job = list_job(Some(vec![100, 2000, 3000, 4000]));
        let plan = SchedulingPolicy::<Job>::plan(&policy, &job, &FIELD.into(), 1000).unwrap();
        assert_eq!(plan, SchedulePlan::PopHead);
    }

    #[test]
    fn irregular_regenerates_when_exhausted() {
        let policy = IrregularPolicy::new(false);
        let now = 50_000;
        for entries in [None, Some(vec![]), Some(vec![100])] {
            let job = list_job(entries);
            let plan = SchedulingPolicy::<Job>::plan(&policy, &job, &FIELD.into(), now).unwrap();
            let SchedulePlan::Replace(times) = plan else {
                panic!("exhausted list must regenerate");
            };
            assert_eq!(times, vec![now + 1000, now + 2000, now + 3000, now + 4000]);
        }
    }

    #[test]
    fn irregular_skip_missed_drops_every_stale_entry() {
        let policy = IrregularPolicy::new(true);
        let job = list_job(Some(vec![100, 200, 5000, 9000]));
        let plan = SchedulingPolicy::<Job>::plan(&policy, &job, &FIELD.into(), 1000).unwrap();
        assert_eq!(plan, SchedulePlan::Replace(vec![5000, 9000]));
    }

    #[test]
    fn irregular_skip_missed_regenerates_when_all_stale() {
        let policy = IrregularPolicy::new(true);
        let now = 10_000;
        let job = list_job(Some(vec![100, 200, 300]));
        let plan = SchedulingPolicy::<Job>::plan(&policy, &job, &FIELD.into(), now).unwrap();
        assert_eq!(
            plan,
            SchedulePlan::Replace(vec![now + 1000, now + 2000, now + 3000, now + 4000])
        );
    }

    #[test]
    fn irregular_rejects_single_valued_fields() {
        let policy = IrregularPolicy::new(false);
        let job = Job {
            next_run: Some(1),
            ..list_job(None)
        };
        let err = SchedulingPolicy::<Job>::plan(&policy, &job, &"next_run".into(), 0).unwrap_err();
        assert!(matches!(err, IteratorError::Config(_)));
    }

    #[test]
    fn cron_skip_missed_returns_no_past_times() {
        // Every second; origin far in the past.
        let now = chrono::Utc::now().timestamp_millis();
        let times = fire_times("* * * * * *", now - 60_000, now, 5_000, 10, true).unwrap();
        assert!(!times.is_empty());
        assert!(times.iter().all(|t| *t >= now));
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn cron_catch_up_preserves_missed_times() {
        let now = chrono::Utc::now().timestamp_millis();
        let times = fire_times("* * * * * *", now - 5_000, now, 5_000, 10, false).unwrap();
        assert!(times.iter().any(|t| *t < now), "catch-up must keep missed fire times");
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn cron_expansion_is_bounded() {
        let now = chrono::Utc::now().timestamp_millis();
        // Every second with a huge horizon: the cap must hold.
        let times = fire_times("* * * * * *", now, now, 3_600_000, 10, true).unwrap();
        assert_eq!(times.len(), 10);
    }

    #[test]
    fn cron_sparse_expression_still_yields_one_time() {
        let now = chrono::Utc::now().timestamp_millis();
        // Daily schedule but a tiny throttle horizon: at least the next fire
        // time must come back or the entity would park forever.
        let times = fire_times("0 0 3 * * *", now, now, 1_000, 10, true).unwrap();
        assert_eq!(times.len(), 1);
        assert!(times[0] > now);
    }

    #[test]
    fn cron_malformed_expression_is_an_error() {
        let err = fire_times("not a cron", 0, 0, 1000, 10, false).unwrap_err();
        assert!(matches!(err, IteratorError::InvalidCron { .. }));
    }

    #[test]
    fn cron_policy_parks_on_malformed_expression() {
        let policy = CronPolicy::new(Duration::from_secs(60));
        let job = cron_job("definitely broken", false, Some(vec![100]));
        let plan = policy.plan(&job, &FIELD.into(), 1000).unwrap();
        assert_eq!(plan, SchedulePlan::Park);
    }

    #[test]
    fn cron_policy_parks_without_expression() {
        let policy = CronPolicy::new(Duration::from_secs(60));
        let job = list_job(Some(vec![100]));
        let plan = policy.plan(&cron_job_from(job), &FIELD.into(), 1000).unwrap();
        assert_eq!(plan, SchedulePlan::Park);
    }

    fn cron_job_from(job: Job) -> Job {
        Job {
            expression: None,
            ..job
        }
    }

    #[test]
    fn cron_policy_replaces_list_from_expression() {
        let policy = CronPolicy::new(Duration::from_secs(30));
        let now = chrono::Utc::now().timestamp_millis();
        let job = cron_job("* * * * * *", true, Some(vec![now - 2000]));
        let plan = policy.plan(&job, &FIELD.into(), now).unwrap();
        let SchedulePlan::Replace(times) = plan else {
            panic!("valid expression must produce a schedule");
        };
        assert!(!times.is_empty());
        assert!(times.iter().all(|t| *t >= now));
    }
}
