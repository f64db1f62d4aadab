//! Scheduler: cron/interval-driven creation of executions
//!
//! A single-instance loop owning all schedules. Cron expressions are
//! evaluated in the schedule's timezone; standard 5-field expressions are
//! accepted and normalized to the 6-field form the parser wants. After
//! downtime, at most one backfill is enqueued per schedule (the most recent
//! missed slot) unless the schedule opts into dropping missed slots.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flux_core::{ExecutionState, FluxError};
use flux_storage::{
    CatalogStore, CatchUpPolicy, ExecutionRecord, ExecutionStore, ScheduleRecord,
    ScheduleStore, ScheduleTrigger,
};

use crate::signals::Signals;

pub struct Scheduler {
    schedules: Arc<dyn ScheduleStore>,
    executions: Arc<dyn ExecutionStore>,
    catalog: Arc<dyn CatalogStore>,
    signals: Arc<Signals>,
    tick: Duration,
}

/// Compute the next fire time strictly after `after`.
pub fn next_fire(
    trigger: &ScheduleTrigger,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, FluxError> {
    match trigger {
        ScheduleTrigger::Cron { expr, timezone } => {
            let tz: Tz = timezone
                .parse()
                .map_err(|_| FluxError::validation(format!("unknown timezone `{timezone}`")))?;
            let schedule = parse_cron(expr)?;
            Ok(schedule
                .after(&after.with_timezone(&tz))
                .next()
                .map(|dt| dt.with_timezone(&Utc)))
        }
        ScheduleTrigger::Interval { period_ms } => {
            if *period_ms == 0 {
                return Err(FluxError::validation("interval period must be positive"));
            }
            Ok(Some(after + chrono::Duration::milliseconds(*period_ms as i64)))
        }
    }
}

/// Parse a cron expression, accepting the standard 5-field form by
/// prefixing a seconds field.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, FluxError> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| FluxError::validation(format!("invalid cron expression `{expr}`: {e}")))
}

/// Validate a trigger at schedule-creation time.
pub fn validate_trigger(trigger: &ScheduleTrigger) -> Result<(), FluxError> {
    next_fire(trigger, Utc::now()).map(|_| ())
}

impl Scheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        executions: Arc<dyn ExecutionStore>,
        catalog: Arc<dyn CatalogStore>,
        signals: Arc<Signals>,
        tick: Duration,
    ) -> Self {
        Self {
            schedules,
            executions,
            catalog,
            signals,
            tick,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("scheduler started");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(error) = self.tick_once(Utc::now()).await {
                warn!(%error, "scheduler tick failed");
            }
        }
        info!("scheduler stopped");
    }

    /// Evaluate every enabled schedule against `now`.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<(), FluxError> {
        let live = self.live_schedule_ids().await?;

        for mut schedule in self.schedules.list().await.map_err(FluxError::from)? {
            if !schedule.enabled {
                continue;
            }
            match self.evaluate(&mut schedule, now, &live).await {
                Ok(true) => {
                    self.schedules
                        .update(&schedule)
                        .await
                        .map_err(FluxError::from)?;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(schedule_id = %schedule.schedule_id, %error, "schedule evaluation failed");
                }
            }
        }
        Ok(())
    }

    /// Returns whether the schedule record changed.
    async fn evaluate(
        &self,
        schedule: &mut ScheduleRecord,
        now: DateTime<Utc>,
        live: &HashSet<Uuid>,
    ) -> Result<bool, FluxError> {
        let Some(due) = schedule.next_fire_at else {
            schedule.next_fire_at = next_fire(&schedule.trigger, now)?;
            return Ok(true);
        };
        if due > now {
            return Ok(false);
        }

        // Walk forward to the most recent due slot; everything older than
        // it was missed.
        let mut slot = due;
        let mut missed = 0u32;
        while let Some(next) = next_fire(&schedule.trigger, slot)? {
            if next <= now {
                slot = next;
                missed += 1;
            } else {
                break;
            }
        }
        let stale = now.signed_duration_since(slot)
            > chrono::Duration::from_std(self.tick * 2).unwrap_or(chrono::Duration::seconds(2));
        let drop_fire = schedule.catch_up == CatchUpPolicy::Skip && (missed > 0 || stale);

        if !drop_fire {
            // Concurrency guard: hold the fire while a previous execution
            // of this schedule is still live.
            if !schedule.allow_overlap && live.contains(&schedule.schedule_id) {
                debug!(schedule_id = %schedule.schedule_id, "previous execution still live, holding fire");
                return Ok(false);
            }
            self.fire(schedule, slot).await?;
        } else {
            debug!(schedule_id = %schedule.schedule_id, missed, "dropping missed fire");
        }

        schedule.last_fired_at = Some(slot);
        schedule.next_fire_at = next_fire(&schedule.trigger, now)?;
        Ok(true)
    }

    async fn fire(&self, schedule: &ScheduleRecord, slot: DateTime<Utc>) -> Result<(), FluxError> {
        let entry = self
            .catalog
            .get_latest(&schedule.workflow_name)
            .await
            .map_err(FluxError::from)?;

        let record = ExecutionRecord::new(
            entry.name.clone(),
            entry.version,
            schedule.input_template.clone(),
        )
        .with_schedule(schedule.schedule_id);

        info!(
            schedule_id = %schedule.schedule_id,
            execution_id = %record.execution_id,
            %slot,
            "schedule fired"
        );
        self.executions
            .create(record)
            .await
            .map_err(FluxError::from)?;
        self.signals.notify_dispatch();
        Ok(())
    }

    /// Schedule ids that still have a live (non-terminal) execution.
    async fn live_schedule_ids(&self) -> Result<HashSet<Uuid>, FluxError> {
        let mut live = HashSet::new();
        for state in [
            ExecutionState::Scheduled,
            ExecutionState::Claimed,
            ExecutionState::Running,
            ExecutionState::Paused,
            ExecutionState::Cancelling,
        ] {
            for record in self
                .executions
                .list_in_state(state)
                .await
                .map_err(FluxError::from)?
            {
                if let Some(schedule_id) = record.schedule_id {
                    live.insert(schedule_id);
                }
            }
        }
        Ok(live)
    }
}
