//! Background executor: owns the task table, drains the scheduler into
//! worker tasks and applies timeout, cleanup and eviction policy.

use crate::attribution::{estimate_minutes_saved, AttributionSink};
use crate::config::ExecutorConfig;
use crate::context::{JobResult, ProgressReporter, TaskContext, TaskPayload};
use crate::monitor::ResourceMonitor;
use crate::queue::{QueueStats, QueuedTask};
use crate::result::{catch_panic, ResultHandler, Settlement};
use crate::scheduler::{Dispatch, TaskScheduler};
use crate::types::{
    BackgroundTask, ExecutionConfig, TaskFailure, TaskId, TaskOutcome, TaskProgress, TaskStatus,
};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use conductor_pool::GlobalResourcePool;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters returned by [`BackgroundExecutor::get_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub queue: QueueStats,
}

struct TaskEntry {
    task: BackgroundTask,
    payload: Option<TaskPayload>,
    cancel: CancellationToken,
    outcome: watch::Sender<Option<TaskOutcome>>,
    cleanup_due: Option<DateTime<Utc>>,
    deferrals: u32,
}

struct ExecutorState {
    tasks: HashMap<TaskId, TaskEntry>,
    scheduler: TaskScheduler,
}

enum RunResult {
    Finished(Result<JobResult, String>),
    TimedOut(Duration),
}

struct Launch {
    task_id: TaskId,
    payload: TaskPayload,
    ctx: TaskContext,
    cancel: CancellationToken,
    max_duration: Option<Duration>,
}

enum Step {
    Launch(Launch),
    Settled(Settlement),
}

struct ExecutorInner {
    config: ExecutorConfig,
    monitor: Arc<ResourceMonitor>,
    pool: Option<Arc<GlobalResourcePool>>,
    attribution: Option<Arc<dyn AttributionSink>>,
    state: Mutex<ExecutorState>,
    workers: Mutex<JoinSet<()>>,
    /// Set while a drain pass runs.
    processing: AtomicBool,
    /// Set by every drain request; the running pass loops until it is clear.
    drain_requested: AtomicBool,
    shut_down: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`BackgroundExecutor`].
pub struct BackgroundExecutorBuilder {
    config: ExecutorConfig,
    monitor: Arc<ResourceMonitor>,
    pool: Option<Arc<GlobalResourcePool>>,
    attribution: Option<Arc<dyn AttributionSink>>,
}

impl BackgroundExecutorBuilder {
    /// Slots held by this executor's orchestrator are released on shutdown.
    pub fn with_resource_pool(mut self, pool: Arc<GlobalResourcePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_attribution(mut self, sink: Arc<dyn AttributionSink>) -> Self {
        self.attribution = Some(sink);
        self
    }

    /// Builds the executor and starts its cleanup sweep. Must be called
    /// inside a Tokio runtime.
    pub fn build(self) -> ConductorResult<BackgroundExecutor> {
        self.config.validate()?;
        let inner = Arc::new(ExecutorInner {
            state: Mutex::new(ExecutorState {
                tasks: HashMap::new(),
                scheduler: TaskScheduler::new(self.monitor.clone()),
            }),
            config: self.config,
            monitor: self.monitor,
            pool: self.pool,
            attribution: self.attribution,
            workers: Mutex::new(JoinSet::new()),
            processing: AtomicBool::new(false),
            drain_requested: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        });
        *inner.sweeper.lock() = Some(ExecutorInner::start_sweeper(&inner));
        info!(
            orchestrator_id = %inner.config.orchestrator_id,
            max_agents = inner.monitor.thresholds().max_background_agents,
            "Background executor started"
        );
        Ok(BackgroundExecutor { inner })
    }
}

/// Runs submitted tasks in the background under admission control.
///
/// Cloning is cheap; every clone drives the same executor.
#[derive(Clone)]
pub struct BackgroundExecutor {
    inner: Arc<ExecutorInner>,
}

impl BackgroundExecutor {
    pub fn builder(config: ExecutorConfig, monitor: Arc<ResourceMonitor>) -> BackgroundExecutorBuilder {
        BackgroundExecutorBuilder {
            config,
            monitor,
            pool: None,
            attribution: None,
        }
    }

    /// Executor without a resource pool or attribution sink.
    pub fn new(config: ExecutorConfig, monitor: Arc<ResourceMonitor>) -> ConductorResult<Self> {
        Self::builder(config, monitor).build()
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.inner.monitor
    }

    pub fn resource_pool(&self) -> Option<&Arc<GlobalResourcePool>> {
        self.inner.pool.as_ref()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Submits a task.
    ///
    /// Fails with `Validation` for malformed limits and with
    /// `ResourcesUnavailable` when the host could never satisfy the task.
    /// A task that merely has to wait for capacity is queued.
    pub fn execute_task(&self, payload: TaskPayload, config: ExecutionConfig) -> ConductorResult<TaskId> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            return Err(ConductorError::State("executor has been shut down".into()));
        }

        let limits = config.resource_limits;
        if let Some(limits) = &limits {
            limits.validate()?;
            let capacity = inner.monitor.check_host_capacity(limits);
            if !capacity.can_execute {
                warn!(
                    reason = capacity.reason.as_deref().unwrap_or(""),
                    "Task rejected at submission"
                );
                return Err(ConductorError::ResourcesUnavailable(Box::new(capacity)));
            }
        }
        let check = inner.monitor.can_run_background_task(limits.as_ref());
        if !check.wait_is_viable() {
            return Err(ConductorError::ResourcesUnavailable(Box::new(check)));
        }

        let task = BackgroundTask::new(config);
        let task_id = task.id;
        let priority = task.config.priority;
        debug!(task_id = %task_id, mode = ?task.config.mode, "Submitting task");
        {
            let mut state = inner.state.lock();
            if inner.shut_down.load(Ordering::Acquire) {
                return Err(ConductorError::State("executor has been shut down".into()));
            }
            state.scheduler.enqueue(QueuedTask::from(&task));
            let (outcome, _) = watch::channel(None);
            state.tasks.insert(
                task_id,
                TaskEntry {
                    task,
                    payload: Some(payload),
                    cancel: CancellationToken::new(),
                    outcome,
                    cleanup_due: None,
                    deferrals: 0,
                },
            );
            inner.enforce_history_limit(&mut state);
        }

        if check.can_execute {
            info!(task_id = %task_id, priority = %priority, "Task queued");
        } else {
            info!(
                task_id = %task_id,
                priority = %priority,
                reason = check.reason.as_deref().unwrap_or(""),
                "Task queued until resources free up"
            );
        }
        inner.process_queue();
        Ok(task_id)
    }

    /// Snapshot of a task. Reading a finished task pushes its cleanup back,
    /// a bounded number of times.
    pub fn get_task(&self, task_id: TaskId) -> Option<BackgroundTask> {
        let mut state = self.inner.state.lock();
        let entry = state.tasks.get_mut(&task_id)?;
        if entry.task.status.is_terminal() {
            self.inner.defer_cleanup(entry);
        }
        Some(entry.task.clone())
    }

    /// Every retained task, oldest submission first.
    pub fn get_all_tasks(&self) -> Vec<BackgroundTask> {
        let state = self.inner.state.lock();
        let mut tasks: Vec<BackgroundTask> = state.tasks.values().map(|e| e.task.clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn get_tasks_by_status(&self, status: TaskStatus) -> Vec<BackgroundTask> {
        let state = self.inner.state.lock();
        let mut tasks: Vec<BackgroundTask> = state
            .tasks
            .values()
            .filter(|e| e.task.status == status)
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn get_progress(&self, task_id: TaskId) -> ConductorResult<TaskProgress> {
        let state = self.inner.state.lock();
        state
            .tasks
            .get(&task_id)
            .map(|e| e.task.progress.clone())
            .ok_or_else(|| ConductorError::task_not_found(task_id))
    }

    pub fn get_stats(&self) -> ExecutorStats {
        let state = self.inner.state.lock();
        let mut stats = ExecutorStats {
            queue: state.scheduler.stats(),
            ..ExecutorStats::default()
        };
        for entry in state.tasks.values() {
            match entry.task.status {
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Cancels a task.
    ///
    /// Queued tasks are removed and marked cancelled at once. Running tasks
    /// get their cancellation token tripped and settle when the body
    /// notices. Finished tasks are a `State` error.
    pub fn cancel_task(&self, task_id: TaskId) -> ConductorResult<()> {
        let inner = &self.inner;
        let settlement = {
            let mut state = inner.state.lock();
            let entry = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| ConductorError::task_not_found(task_id))?;
            entry.deferrals = 0;
            let status = entry.task.status;
            match status {
                TaskStatus::Queued => {
                    entry.cancel.cancel();
                    inner.finalize(&mut state, task_id, ResultHandler::cancel)
                }
                TaskStatus::Running => {
                    entry.cancel.cancel();
                    info!(task_id = %task_id, "Cancellation requested for running task");
                    return Ok(());
                }
                _ => {
                    return Err(ConductorError::State(format!(
                        "task {task_id} is already {status}"
                    )))
                }
            }
        };
        if let Some(settlement) = settlement {
            info!(task_id = %task_id, "Queued task cancelled");
            settlement.notify();
        }
        Ok(())
    }

    /// Resolves a task as completed from outside its body.
    pub fn complete_task(&self, task_id: TaskId, result: serde_json::Value) -> ConductorResult<()> {
        let settlement = self
            .inner
            .resolve(task_id, |task| ResultHandler::complete(task, result))?;
        if let Some(settlement) = settlement {
            if let Some(sink) = &self.inner.attribution {
                sink.record_success(task_id, estimate_minutes_saved(settlement.elapsed));
            }
            settlement.notify();
        }
        Ok(())
    }

    /// Resolves a task as failed from outside its body.
    pub fn fail_task(&self, task_id: TaskId, error: impl Into<String>) -> ConductorResult<()> {
        let failure = TaskFailure::error(error);
        let settlement = self
            .inner
            .resolve(task_id, |task| ResultHandler::fail(task, failure))?;
        if let Some(settlement) = settlement {
            if let (Some(sink), TaskOutcome::Failed { error }) =
                (&self.inner.attribution, &settlement.outcome)
            {
                sink.record_failure(task_id, error, estimate_minutes_saved(settlement.elapsed));
            }
            settlement.notify();
        }
        Ok(())
    }

    /// Drops every finished task now. Returns how many were removed.
    pub fn clear_finished_tasks(&self) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.tasks.len();
        state.tasks.retain(|_, e| !e.task.status.is_terminal());
        let removed = before - state.tasks.len();
        info!(removed, "Cleared finished tasks");
        removed
    }

    /// Runs the cleanup sweep immediately. Returns how many tasks were
    /// purged.
    pub fn run_cleanup_sweep(&self) -> usize {
        self.inner.run_cleanup_sweep()
    }

    /// Waits until the task settles.
    ///
    /// Fails with `NotFound` for unknown ids and with `State` if the task is
    /// removed before it finishes.
    pub async fn wait_for_task(&self, task_id: TaskId) -> ConductorResult<TaskOutcome> {
        let mut rx = {
            let state = self.inner.state.lock();
            state
                .tasks
                .get(&task_id)
                .map(|e| e.outcome.subscribe())
                .ok_or_else(|| ConductorError::task_not_found(task_id))?
        };
        let outcome = rx.wait_for(Option::is_some).await.map_err(|_| {
            ConductorError::State(format!("task {task_id} was removed before it settled"))
        })?;
        outcome
            .clone()
            .ok_or_else(|| ConductorError::State(format!("task {task_id} has no outcome")))
    }

    /// Stops the executor.
    ///
    /// Queued tasks are cancelled, running tasks have their tokens tripped
    /// and get `shutdown_grace_ms` to finish before their workers are
    /// aborted, and any global pool slots held by this orchestrator are
    /// released. Calling it again does nothing.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::AcqRel) {
            debug!("Executor already shut down");
            return;
        }
        if let Some(handle) = inner.sweeper.lock().take() {
            handle.abort();
        }

        // Once taken, no drain pass can add workers: spawn_worker checks
        // `shut_down` under the same lock.
        let mut workers = std::mem::take(&mut *inner.workers.lock());

        let cancelled = {
            let mut state = inner.state.lock();
            let queued: Vec<TaskId> = state
                .scheduler
                .drain()
                .into_iter()
                .map(|q| q.task_id)
                .collect();
            let settled: Vec<Settlement> = queued
                .into_iter()
                .filter_map(|id| inner.finalize(&mut state, id, ResultHandler::cancel))
                .collect();
            for entry in state.tasks.values() {
                if entry.task.status == TaskStatus::Running {
                    entry.cancel.cancel();
                }
            }
            settled
        };
        for settlement in &cancelled {
            settlement.notify();
        }

        if let Some(pool) = &inner.pool {
            let released = pool.release_all(&inner.config.orchestrator_id);
            if released > 0 {
                info!(
                    orchestrator_id = %inner.config.orchestrator_id,
                    released,
                    "Released global resource slots"
                );
            }
        }

        let joined = tokio::time::timeout(inner.config.shutdown_grace(), async {
            while let Some(joined) = workers.join_next().await {
                log_join(joined);
            }
        })
        .await;
        if joined.is_err() {
            warn!(
                remaining = workers.len(),
                "Workers still running after grace period; aborting"
            );
            workers.abort_all();
            // Aborted workers never reach settle, so their monitor
            // registration is returned here, one per worker.
            let mut aborted = 0usize;
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Err(e) if e.is_cancelled() => aborted += 1,
                    other => log_join(other),
                }
            }
            for _ in 0..aborted {
                inner.monitor.unregister_background_task();
            }

            let abandoned: Vec<Settlement> = {
                let mut state = inner.state.lock();
                let running: Vec<TaskId> = state
                    .tasks
                    .values()
                    .filter(|e| e.task.status == TaskStatus::Running)
                    .map(|e| e.task.id)
                    .collect();
                running
                    .into_iter()
                    .filter_map(|id| inner.finalize(&mut state, id, ResultHandler::cancel))
                    .collect()
            };
            debug!(aborted, abandoned = abandoned.len(), "Aborted workers after grace period");
            for settlement in abandoned {
                settlement.notify();
            }
        }

        info!(
            orchestrator_id = %inner.config.orchestrator_id,
            cancelled = cancelled.len(),
            "Background executor shut down"
        );
    }
}

impl ExecutorInner {
    fn start_sweeper(inner: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        let period = inner.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.run_cleanup_sweep();
                inner.reap_workers();
                // Host load can drop with nothing settling to trigger a drain.
                inner.process_queue();
            }
        })
    }

    /// Coalesces concurrent drain requests into a single running pass.
    fn process_queue(self: &Arc<Self>) {
        self.drain_requested.store(true, Ordering::Release);
        loop {
            if self
                .processing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            while self.drain_requested.swap(false, Ordering::AcqRel) {
                self.drain_queue();
            }
            self.processing.store(false, Ordering::Release);
            if !self.drain_requested.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn drain_queue(self: &Arc<Self>) {
        loop {
            if self.shut_down.load(Ordering::Acquire) {
                return;
            }
            let step = {
                let mut state = self.state.lock();
                match state.scheduler.next_task() {
                    None => return,
                    Some(Dispatch::Run(queued)) => self.start(&mut state, queued.task_id),
                    Some(Dispatch::Reject(queued, check)) => {
                        let reason = check
                            .reason
                            .unwrap_or_else(|| "insufficient resources".to_string());
                        warn!(task_id = %queued.task_id, reason = %reason, "Task can never be admitted");
                        self.finalize(&mut state, queued.task_id, |task| {
                            ResultHandler::fail(task, TaskFailure::rejected(reason))
                        })
                        .map(Step::Settled)
                    }
                }
            };
            match step {
                Some(Step::Launch(launch)) => self.spawn_worker(launch),
                Some(Step::Settled(settlement)) => settlement.notify(),
                None => {}
            }
        }
    }

    /// Marks a dequeued task running and registers it with the monitor.
    /// Admission and registration happen under the same state lock.
    fn start(self: &Arc<Self>, state: &mut ExecutorState, task_id: TaskId) -> Option<Step> {
        let entry = state.tasks.get_mut(&task_id)?;
        if entry.task.status != TaskStatus::Queued {
            return None;
        }
        let payload = entry.payload.take()?;
        let max_duration = entry
            .task
            .config
            .resource_limits
            .and_then(|limits| limits.max_duration().ok().flatten());

        self.monitor.register_background_task();
        entry.task.status = TaskStatus::Running;
        entry.task.start_time = Some(Utc::now());
        entry.task.progress = TaskProgress::new(0.0, "running");

        let cancel = entry.cancel.clone();
        let weak = Arc::downgrade(self);
        let reporter = ProgressReporter::new(
            Arc::new(move |progress: TaskProgress| {
                if let Some(inner) = weak.upgrade() {
                    inner.record_progress(task_id, progress);
                }
            }),
            cancel.clone(),
        );
        info!(task_id = %task_id, priority = %entry.task.config.priority, "Task started");
        Some(Step::Launch(Launch {
            task_id,
            payload,
            ctx: TaskContext::new(task_id, cancel.clone(), reporter),
            cancel,
            max_duration,
        }))
    }

    fn spawn_worker(self: &Arc<Self>, launch: Launch) {
        let Launch {
            task_id,
            payload,
            ctx,
            cancel,
            max_duration,
        } = launch;
        let inner = Arc::clone(self);
        let worker = async move {
            let body = catch_panic(async move { payload.run(ctx).await });
            let run = match max_duration {
                Some(limit) => match tokio::time::timeout(limit, body).await {
                    Ok(finished) => RunResult::Finished(finished),
                    Err(_) => {
                        cancel.cancel();
                        RunResult::TimedOut(limit)
                    }
                },
                None => RunResult::Finished(body.await),
            };
            inner.settle(task_id, run);
        };

        let mut workers = self.workers.lock();
        if self.shut_down.load(Ordering::Acquire) {
            drop(workers);
            self.abandon_launch(task_id);
            return;
        }
        while let Some(joined) = workers.try_join_next() {
            log_join(joined);
        }
        workers.spawn(worker);
    }

    /// Settles a task that was started but whose worker was never spawned
    /// because shutdown had already taken the worker set.
    fn abandon_launch(&self, task_id: TaskId) {
        let settlement = {
            let mut state = self.state.lock();
            self.finalize(&mut state, task_id, ResultHandler::cancel)
        };
        self.monitor.unregister_background_task();
        debug!(task_id = %task_id, "Worker not spawned after shutdown");
        if let Some(settlement) = settlement {
            settlement.notify();
        }
    }

    fn settle(self: &Arc<Self>, task_id: TaskId, run: RunResult) {
        let settlement = {
            let mut state = self.state.lock();
            let cancelled = state
                .tasks
                .get(&task_id)
                .is_some_and(|e| e.cancel.is_cancelled());
            self.finalize(&mut state, task_id, |task| match run {
                RunResult::TimedOut(limit) => ResultHandler::fail(task, TaskFailure::timeout(limit)),
                RunResult::Finished(_) if cancelled => ResultHandler::cancel(task),
                RunResult::Finished(Ok(Ok(value))) => ResultHandler::complete(task, value),
                RunResult::Finished(Ok(Err(e))) => {
                    ResultHandler::fail(task, TaskFailure::error(e.to_string()))
                }
                RunResult::Finished(Err(panic)) => ResultHandler::fail(task, TaskFailure::panic(panic)),
            })
        };
        self.monitor.unregister_background_task();

        match settlement {
            Some(settlement) => {
                info!(
                    task_id = %task_id,
                    status = %settlement.outcome.status(),
                    elapsed_ms = settlement.elapsed.num_milliseconds(),
                    "Task settled"
                );
                settlement.notify();
            }
            None => debug!(task_id = %task_id, "Worker finished after task was already resolved"),
        }
        self.process_queue();
    }

    /// Resolves a task on a caller's behalf. A running body is asked to
    /// stop; its own settlement later becomes a no-op.
    fn resolve(
        &self,
        task_id: TaskId,
        apply: impl FnOnce(&mut BackgroundTask) -> Option<Settlement>,
    ) -> ConductorResult<Option<Settlement>> {
        let mut state = self.state.lock();
        let entry = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| ConductorError::task_not_found(task_id))?;
        if entry.task.status == TaskStatus::Running {
            entry.cancel.cancel();
        }
        Ok(self.finalize(&mut state, task_id, apply))
    }

    /// Applies a terminal transition and the bookkeeping that follows it:
    /// queue removal, outcome broadcast, cleanup scheduling and history
    /// eviction.
    fn finalize(
        &self,
        state: &mut ExecutorState,
        task_id: TaskId,
        apply: impl FnOnce(&mut BackgroundTask) -> Option<Settlement>,
    ) -> Option<Settlement> {
        let entry = state.tasks.get_mut(&task_id)?;
        let was_queued = entry.task.status == TaskStatus::Queued;
        let settlement = apply(&mut entry.task)?;
        entry.payload = None;
        entry.cleanup_due = Some(Utc::now() + self.config.cleanup_delay());
        entry.outcome.send_replace(Some(settlement.outcome.clone()));
        if was_queued {
            state.scheduler.remove(task_id);
        }
        self.enforce_history_limit(state);
        Some(settlement)
    }

    fn record_progress(&self, task_id: TaskId, progress: TaskProgress) {
        let mut state = self.state.lock();
        if let Some(entry) = state.tasks.get_mut(&task_id) {
            if entry.task.status == TaskStatus::Running {
                entry.task.progress = progress;
            }
        }
    }

    fn defer_cleanup(&self, entry: &mut TaskEntry) {
        let now = Utc::now();
        let terminal_for = entry.task.end_time.map(|end| now - end);
        let too_old = terminal_for.is_some_and(|age| age >= self.config.force_cleanup_age());
        if too_old || entry.deferrals >= self.config.max_cleanup_deferrals {
            // Forced: purge on the next sweep.
            entry.cleanup_due = Some(entry.cleanup_due.map_or(now, |due| due.min(now)));
            debug!(task_id = %entry.task.id, deferrals = entry.deferrals, "Cleanup forced");
            return;
        }
        entry.deferrals += 1;
        entry.cleanup_due = Some(now + self.config.cleanup_delay());
    }

    /// Evicts the oldest finished tasks, a batch at a time, while the table
    /// is over `max_task_history`.
    fn enforce_history_limit(&self, state: &mut ExecutorState) {
        let max = self.config.max_task_history;
        if state.tasks.len() <= max {
            return;
        }
        let batch = self.config.eviction_batch_size;
        let overflow = state.tasks.len() - max;
        let count = overflow.div_ceil(batch) * batch;

        let mut finished: Vec<(DateTime<Utc>, TaskId)> = state
            .tasks
            .values()
            .filter(|e| e.task.status.is_terminal())
            .map(|e| (e.task.end_time.unwrap_or(e.task.created_at), e.task.id))
            .collect();
        finished.sort_unstable();

        let evicted = finished
            .into_iter()
            .take(count)
            .filter(|(_, id)| state.tasks.remove(id).is_some())
            .count();
        if evicted > 0 {
            info!(evicted, retained = state.tasks.len(), "Evicted oldest finished tasks");
        } else {
            debug!(retained = state.tasks.len(), "Task history over limit with nothing finished to evict");
        }
    }

    fn run_cleanup_sweep(&self) -> usize {
        let now = Utc::now();
        let force_age = self.config.force_cleanup_age();
        let mut state = self.state.lock();
        let before = state.tasks.len();
        state.tasks.retain(|_, entry| {
            if !entry.task.status.is_terminal() {
                return true;
            }
            let ended = entry.task.end_time.unwrap_or(now);
            if now - ended >= force_age {
                return false;
            }
            !matches!(entry.cleanup_due, Some(due) if now >= due)
        });
        let removed = before - state.tasks.len();
        if removed > 0 {
            debug!(removed, retained = state.tasks.len(), "Cleanup sweep purged finished tasks");
        }
        removed
    }

    fn reap_workers(&self) {
        let mut workers = self.workers.lock();
        while let Some(joined) = workers.try_join_next() {
            log_join(joined);
        }
    }
}

impl Drop for ExecutorInner {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

fn log_join(joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_panic() => error!("Background worker panicked outside its task body"),
        Err(e) => debug!(error = %e, "Background worker aborted"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::monitor::{HostSample, ResourceProbe};
    use crate::types::ResourceLimits;

    struct Idle;

    impl ResourceProbe for Idle {
        fn sample(&self) -> HostSample {
            HostSample {
                load_average_1m: 0.0,
                logical_cores: 8,
                total_memory_mb: 32_768,
                available_memory_mb: 30_000,
            }
        }
    }

    fn executor(config: ExecutorConfig) -> BackgroundExecutor {
        let monitor = Arc::new(
            ResourceMonitor::with_probe(MonitorConfig::default(), Arc::new(Idle)).unwrap(),
        );
        BackgroundExecutor::new(config, monitor).unwrap()
    }

    fn quick() -> TaskPayload {
        TaskPayload::from_fn(|_| async { Ok(serde_json::json!("done")) })
    }

    #[tokio::test]
    async fn test_defer_cleanup_is_bounded() {
        let exec = executor(ExecutorConfig {
            max_cleanup_deferrals: 2,
            ..ExecutorConfig::default()
        });
        let id = exec.execute_task(quick(), ExecutionConfig::default()).unwrap();
        exec.wait_for_task(id).await.unwrap();

        // Two reads push cleanup out; the third forces it.
        exec.get_task(id).unwrap();
        exec.get_task(id).unwrap();
        assert_eq!(exec.run_cleanup_sweep(), 0);
        exec.get_task(id).unwrap();
        assert_eq!(exec.run_cleanup_sweep(), 1);
        assert!(exec.get_task(id).is_none());
    }

    #[tokio::test]
    async fn test_cleanup_after_delay() {
        let exec = executor(ExecutorConfig {
            cleanup_delay_ms: 20,
            ..ExecutorConfig::default()
        });
        let id = exec.execute_task(quick(), ExecutionConfig::default()).unwrap();
        exec.wait_for_task(id).await.unwrap();
        assert_eq!(exec.run_cleanup_sweep(), 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(exec.run_cleanup_sweep(), 1);
        assert!(matches!(
            exec.get_progress(id),
            Err(ConductorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let exec = executor(ExecutorConfig::default());
        exec.shutdown().await;
        let err = exec
            .execute_task(quick(), ExecutionConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConductorError::State(_)));
    }

    #[tokio::test]
    async fn test_invalid_limits_rejected_before_queueing() {
        let exec = executor(ExecutorConfig::default());
        let config = ExecutionConfig::default()
            .with_resource_limits(ResourceLimits::default().with_max_duration_ms(-0.0));
        assert!(matches!(
            exec.execute_task(quick(), config),
            Err(ConductorError::Validation(_))
        ));
        assert!(exec.get_all_tasks().is_empty());
    }
}
