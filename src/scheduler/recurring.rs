//! Cron-driven dispatch of recurring tasks.
//!
//! Schedules live in SQLite and are mirrored in an in-memory map that carries
//! the runtime-only `is_running` flag. A single background loop evaluates the
//! map once per tick and hands every due schedule to its own dispatch task;
//! at most `max_concurrent_dispatches` of those run at once.
//!
//! Lock order: loop handle, schedule map, store connection.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::json;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerSettings;
use crate::error::{CoreError, CoreResult};
use crate::events::{self, EventHook};
use crate::metrics;

use super::cron::next_run;
use super::executors::TaskExecutors;
use super::models::*;
use super::schedule_store::ScheduleStore;

struct LoopHandle {
    started_at: DateTime<Utc>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct RecurringScheduler {
    store: Arc<dyn ScheduleStore>,
    executors: TaskExecutors,
    events: Arc<dyn EventHook>,
    settings: Arc<SchedulerSettings>,
    schedules: Arc<RwLock<HashMap<String, Schedule>>>,
    dispatch_permits: Arc<Semaphore>,
    evaluation_loop: Arc<Mutex<Option<LoopHandle>>>,
    /// Number of upcoming ticks that panic before evaluating.
    #[cfg(test)]
    tick_faults: Arc<std::sync::atomic::AtomicUsize>,
}

impl RecurringScheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        executors: TaskExecutors,
        events: Arc<dyn EventHook>,
        settings: SchedulerSettings,
    ) -> CoreResult<Self> {
        let schedules = store
            .list_schedules()?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        let permits = settings.max_concurrent_dispatches.max(1);

        Ok(Self {
            store,
            executors,
            events,
            settings: Arc::new(settings),
            schedules: Arc::new(RwLock::new(schedules)),
            dispatch_permits: Arc::new(Semaphore::new(permits)),
            evaluation_loop: Arc::new(Mutex::new(None)),
            #[cfg(test)]
            tick_faults: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Reconcile interrupted executions, reload every schedule and begin the
    /// evaluation loop.
    pub async fn start(&self) -> CoreResult<()> {
        let mut evaluation_loop = self.evaluation_loop.lock().await;
        if evaluation_loop.is_some() {
            return Err(CoreError::AlreadyRunning);
        }

        let loaded = self.reload().await?;

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.clone().run_supervised(shutdown.clone()));
        *evaluation_loop = Some(LoopHandle {
            started_at: Utc::now(),
            shutdown,
            task,
        });

        info!(
            "Recurring scheduler started with {} schedules (tick {:?})",
            loaded, self.settings.tick_interval
        );
        Ok(())
    }

    /// Stop the evaluation loop. Dispatches already in flight run to completion.
    pub async fn stop(&self) -> CoreResult<()> {
        let handle = self
            .evaluation_loop
            .lock()
            .await
            .take()
            .ok_or(CoreError::NotRunning)?;

        handle.shutdown.cancel();
        if let Err(e) = handle.task.await {
            warn!("Scheduler loop ended abnormally: {}", e);
        }
        info!("Recurring scheduler stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.evaluation_loop.lock().await.is_some()
    }

    pub async fn status(&self) -> SchedulerStatus {
        let started_at = self
            .evaluation_loop
            .lock()
            .await
            .as_ref()
            .map(|handle| handle.started_at);

        let schedules = self.schedules.read().await;
        SchedulerStatus {
            running: started_at.is_some(),
            started_at,
            uptime_secs: started_at.map(|t| (Utc::now() - t).num_seconds()),
            total_schedules: schedules.len(),
            active_schedules: schedules
                .values()
                .filter(|s| s.status == ScheduleStatus::Active)
                .count(),
            running_schedules: schedules.values().filter(|s| s.is_running).count(),
        }
    }

    /// Replace the in-memory map with the persisted schedules.
    ///
    /// Executions left `running` are failed first, unless a dispatch from this
    /// process is still in flight.
    async fn reload(&self) -> CoreResult<usize> {
        let mut schedules = self.schedules.write().await;
        let in_flight: HashSet<String> = schedules
            .values()
            .filter(|s| s.is_running)
            .map(|s| s.id.clone())
            .collect();

        if in_flight.is_empty() {
            let interrupted = self.store.mark_interrupted_executions_failed()?;
            if interrupted > 0 {
                warn!(
                    "Marked {} interrupted schedule executions as failed",
                    interrupted
                );
            }
        }

        *schedules = self
            .store
            .list_schedules()?
            .into_iter()
            .map(|mut s| {
                s.is_running = in_flight.contains(&s.id);
                (s.id.clone(), s)
            })
            .collect();
        Ok(schedules.len())
    }

    /// Keep the evaluation loop alive across panics until `shutdown` fires.
    async fn run_supervised(self, shutdown: CancellationToken) {
        loop {
            let evaluation = self.clone().evaluate_until(shutdown.clone());
            match AssertUnwindSafe(evaluation).catch_unwind().await {
                Ok(()) => break,
                Err(panic) => {
                    metrics::record_scheduler_loop_restart();
                    error!(
                        "Scheduler loop panicked: {}; restarting in {:?}",
                        panic_message(panic.as_ref()),
                        self.settings.restart_delay
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.restart_delay) => {}
                    }
                }
            }
        }
        debug!("Scheduler loop exited");
    }

    async fn evaluate_until(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {
                    #[cfg(test)]
                    self.take_tick_fault();
                    self.dispatch_due(Utc::now()).await;
                }
            }
        }
    }

    #[cfg(test)]
    fn take_tick_fault(&self) {
        use std::sync::atomic::Ordering;
        let pending = self
            .tick_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            panic!("injected tick fault");
        }
    }

    // =========================================================================
    // Evaluation and dispatch
    // =========================================================================

    /// Dispatch every active schedule whose `next_run` is at or before `now`
    /// and which is not already running. Returns the dispatched schedule ids.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let due: Vec<Schedule> = {
            let mut schedules = self.schedules.write().await;
            schedules
                .values_mut()
                .filter(|s| is_due(s, now))
                .map(|s| {
                    s.is_running = true;
                    s.clone()
                })
                .collect()
        };

        if !due.is_empty() {
            debug!("{} schedules due at {}", due.len(), now);
        }
        due.into_iter()
            .map(|schedule| {
                let id = schedule.id.clone();
                self.spawn_dispatch(schedule);
                id
            })
            .collect()
    }

    /// Run a schedule immediately, outside its cron cadence, and wait for the
    /// executor to hand back its job.
    pub async fn trigger_now(&self, id: &str) -> CoreResult<Execution> {
        let schedule = {
            let mut schedules = self.schedules.write().await;
            let schedule = schedules
                .get_mut(id)
                .ok_or_else(|| CoreError::not_found("schedule", id))?;
            if schedule.is_running {
                return Err(CoreError::AlreadyRunning);
            }
            schedule.is_running = true;
            schedule.clone()
        };

        info!("Manually triggering schedule {} ({})", schedule.id, schedule.name);
        self.spawn_dispatch(schedule)
            .await
            .map_err(|e| CoreError::ExecutionFailure(format!("dispatch task failed: {}", e)))?
            .ok_or_else(|| {
                CoreError::ExecutionFailure("could not record schedule execution".to_string())
            })
    }

    /// `schedule.is_running` must already be set in the map.
    fn spawn_dispatch(&self, schedule: Schedule) -> JoinHandle<Option<Execution>> {
        let this = self.clone();
        tokio::spawn(async move {
            let _permit = match this.dispatch_permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    this.finish_dispatch(&schedule.id, |_| {}).await;
                    return None;
                }
            };
            this.dispatch(&schedule).await
        })
    }

    async fn dispatch(&self, schedule: &Schedule) -> Option<Execution> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let execution_id = match self.store.record_execution_start(&schedule.id, started_at) {
            Ok(id) => id,
            Err(e) => {
                error!(
                    "Could not record execution for schedule {}: {:#}",
                    schedule.id, e
                );
                let reason = format!("could not record execution: {}", e);
                self.finish_dispatch(&schedule.id, |s| {
                    s.status = ScheduleStatus::Error;
                    s.last_error = Some(reason);
                })
                .await;
                return None;
            }
        };

        let outcome = AssertUnwindSafe(
            self.executors
                .execute(schedule.schedule_type, &schedule.parameters),
        )
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(CoreError::ExecutionFailure(format!(
                "executor panicked: {}",
                panic_message(panic.as_ref())
            )))
        });
        let duration_ms = i64::try_from(clock.elapsed().as_millis()).unwrap_or(i64::MAX);

        let execution = match outcome {
            Ok(job) => Execution {
                id: execution_id,
                schedule_id: schedule.id.clone(),
                result: Some(json!({ "job_id": job.id, "job_status": job.status })),
                job_id: Some(job.id),
                status: ExecutionStatus::Completed,
                started_at,
                completed_at: Some(Utc::now()),
                duration_ms: Some(duration_ms),
                error: None,
            },
            Err(e) => Execution {
                id: execution_id,
                schedule_id: schedule.id.clone(),
                job_id: None,
                status: ExecutionStatus::Failed,
                started_at,
                completed_at: Some(Utc::now()),
                duration_ms: Some(duration_ms),
                error: Some(e.to_string()),
                result: None,
            },
        };

        match self.store.record_execution_finish(
            execution.id,
            execution.status,
            execution.job_id.as_deref(),
            execution.error.as_deref(),
            execution.result.as_ref(),
            duration_ms,
        ) {
            Ok(true) => {}
            Ok(false) => warn!(
                "Execution {} of schedule {} was no longer running",
                execution.id, schedule.id
            ),
            Err(e) => error!("Failed to record execution {}: {:#}", execution.id, e),
        }
        metrics::record_schedule_execution(
            schedule.schedule_type.as_str(),
            execution.status.as_str(),
        );

        match &execution.error {
            None => info!(
                "Schedule {} ({}) started job {} in {}ms",
                schedule.id,
                schedule.name,
                execution.job_id.as_deref().unwrap_or("-"),
                duration_ms
            ),
            Some(err) => {
                warn!(
                    "Schedule {} ({}) execution {} failed: {}",
                    schedule.id, schedule.name, execution.id, err
                );
                self.events.emit(
                    events::SCHEDULE_EXECUTION_FAILED,
                    json!({
                        "schedule_id": schedule.id,
                        "name": schedule.name,
                        "type": schedule.schedule_type.as_str(),
                        "execution_id": execution.id,
                        "error": err,
                    }),
                );
            }
        }

        let next = next_run(&schedule.cron_expression, Utc::now());
        let recorded = execution.clone();
        self.finish_dispatch(&schedule.id, move |s| {
            s.run_count += 1;
            if recorded.status == ExecutionStatus::Failed {
                s.fail_count += 1;
            }
            s.last_run = Some(recorded.started_at);
            s.last_job_id = recorded.job_id;
            s.last_status = Some(recorded.status);
            s.last_error = recorded.error;

            match next {
                Ok(Some(at)) => s.next_run = Some(at),
                Ok(None) => {
                    s.next_run = None;
                    s.status = ScheduleStatus::Error;
                    s.last_error = Some("cron expression has no future run".to_string());
                }
                Err(e) => {
                    s.next_run = None;
                    s.status = ScheduleStatus::Error;
                    s.last_error = Some(e.to_string());
                }
            }
        })
        .await;

        Some(execution)
    }

    /// Apply the dispatch bookkeeping, clear `is_running` and persist.
    async fn finish_dispatch<F>(&self, id: &str, apply: F)
    where
        F: FnOnce(&mut Schedule),
    {
        let mut schedules = self.schedules.write().await;
        let Some(schedule) = schedules.get_mut(id) else {
            debug!("Schedule {} was deleted during dispatch", id);
            return;
        };

        apply(schedule);
        schedule.is_running = false;
        schedule.updated_at = Utc::now();
        if schedule.status == ScheduleStatus::Error {
            error!(
                "Schedule {} ({}) moved to error: {}",
                schedule.id,
                schedule.name,
                schedule.last_error.as_deref().unwrap_or("unknown")
            );
        }

        if let Err(e) = self.store.update_schedule(schedule) {
            error!("Failed to persist schedule {}: {:#}", id, e);
        }
    }

    // =========================================================================
    // Schedule management
    // =========================================================================

    pub async fn create_schedule(&self, new: NewSchedule) -> CoreResult<Schedule> {
        let name = validate_name(&new.name)?;
        let now = Utc::now();
        let next = future_run(&new.cron_expression, now)?;

        let schedule = Schedule {
            id: Uuid::new_v4().to_string(),
            name,
            schedule_type: new.schedule_type,
            cron_expression: new.cron_expression.trim().to_string(),
            status: new.status.unwrap_or(ScheduleStatus::Active),
            parameters: new.parameters.unwrap_or_else(|| json!({})),
            next_run: Some(next),
            last_run: None,
            run_count: 0,
            fail_count: 0,
            last_job_id: None,
            last_status: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            is_running: false,
        };

        let mut schedules = self.schedules.write().await;
        self.store.insert_schedule(&schedule)?;
        schedules.insert(schedule.id.clone(), schedule.clone());

        info!(
            "Created {} schedule {} ({}) '{}', next run {}",
            schedule.schedule_type, schedule.id, schedule.name, schedule.cron_expression, next
        );
        Ok(schedule)
    }

    pub async fn update_schedule(&self, id: &str, update: ScheduleUpdate) -> CoreResult<Schedule> {
        let now = Utc::now();
        let mut schedules = self.schedules.write().await;
        let mut schedule = schedules
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("schedule", id))?;

        if let Some(name) = update.name {
            schedule.name = validate_name(&name)?;
        }
        if let Some(expression) = update.cron_expression {
            schedule.next_run = Some(future_run(&expression, now)?);
            schedule.cron_expression = expression.trim().to_string();
        }
        if let Some(parameters) = update.parameters {
            schedule.parameters = parameters;
        }
        if let Some(status) = update.status {
            // A stale next_run would fire the moment the schedule comes back.
            if status == ScheduleStatus::Active && schedule.status != ScheduleStatus::Active {
                schedule.next_run = Some(future_run(&schedule.cron_expression, now)?);
            }
            schedule.status = status;
        }
        schedule.updated_at = now;

        if !self.store.update_schedule(&schedule)? {
            schedules.remove(id);
            return Err(CoreError::not_found("schedule", id));
        }
        schedules.insert(id.to_string(), schedule.clone());

        info!(
            "Updated schedule {} ({}): status {}, next run {:?}",
            schedule.id, schedule.name, schedule.status, schedule.next_run
        );
        Ok(schedule)
    }

    pub async fn pause_schedule(&self, id: &str) -> CoreResult<Schedule> {
        self.update_schedule(
            id,
            ScheduleUpdate {
                status: Some(ScheduleStatus::Paused),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn resume_schedule(&self, id: &str) -> CoreResult<Schedule> {
        self.update_schedule(
            id,
            ScheduleUpdate {
                status: Some(ScheduleStatus::Active),
                ..Default::default()
            },
        )
        .await
    }

    /// Removes the schedule and, by cascade, its execution history.
    pub async fn delete_schedule(&self, id: &str) -> CoreResult<()> {
        let mut schedules = self.schedules.write().await;
        let deleted = self.store.delete_schedule(id)?;
        if schedules.remove(id).is_none() && !deleted {
            return Err(CoreError::not_found("schedule", id));
        }
        info!("Deleted schedule {}", id);
        Ok(())
    }

    pub async fn get_schedule(&self, id: &str) -> CoreResult<Schedule> {
        self.schedules
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("schedule", id))
    }

    /// Oldest first.
    pub async fn list_schedules(&self) -> Vec<Schedule> {
        let mut schedules: Vec<Schedule> = self.schedules.read().await.values().cloned().collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        schedules
    }

    /// Execution history, newest first.
    pub async fn get_executions(&self, schedule_id: &str, limit: usize) -> CoreResult<Vec<Execution>> {
        if !self.schedules.read().await.contains_key(schedule_id) {
            return Err(CoreError::not_found("schedule", schedule_id));
        }
        Ok(self.store.get_executions(schedule_id, limit)?)
    }
}

fn is_due(schedule: &Schedule, now: DateTime<Utc>) -> bool {
    schedule.status == ScheduleStatus::Active
        && !schedule.is_running
        && schedule.next_run.is_some_and(|at| at <= now)
}

fn validate_name(name: &str) -> CoreResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CoreError::InvalidInput(
            "schedule name must not be empty".to_string(),
        ));
    }
    Ok(name.to_string())
}

/// Next firing strictly after `now`, or `InvalidInput` if there is none.
fn future_run(expression: &str, now: DateTime<Utc>) -> CoreResult<DateTime<Utc>> {
    match next_run(expression, now) {
        Ok(Some(at)) => Ok(at),
        Ok(None) => Err(CoreError::InvalidInput(format!(
            "cron expression '{}' never fires",
            expression
        ))),
        Err(e) => Err(CoreError::InvalidInput(e.to_string())),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
