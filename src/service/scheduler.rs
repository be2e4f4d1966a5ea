//! Unified async job scheduler.
//!
//! One in-process scheduler drives every job kind through named slots
//! (`network_client`, `llm`, `nli`), each with a single worker loop so at
//! most one job per slot runs at a time. The queue itself is the `jobs`
//! table: within a slot, start order is `(priority, queued_at, rowid)`;
//! between slots, execution is independent.
//!
//! Submission performs duplicate suppression against queued/running jobs
//! (same kind + normalized input key), rejects failed tasks outright, and
//! captures the innermost causal trace id unless overridden.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use crate::domain::{Job, JobKind, JobState, TaskStatus};
use crate::error::AppError;
use crate::repository::{JobRepository, TaskRepository};
use crate::trace::current_cause_id;

pub const PRIORITY_HIGH: i64 = 10;
pub const PRIORITY_MEDIUM: i64 = 50;
pub const PRIORITY_LOW: i64 = 90;

pub const SLOTS: &[&str] = &["network_client", "llm", "nli"];

const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Map the tool-surface priority names onto queue priorities.
pub fn priority_from_name(name: &str) -> i64 {
    match name {
        "high" => PRIORITY_HIGH,
        "low" => PRIORITY_LOW,
        _ => PRIORITY_MEDIUM,
    }
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub job_id: String,
}

/// A job a handler wants queued after it completes. Submitted under the
/// finished job's cause id so the trace spans the whole chain.
#[derive(Debug, Clone)]
pub struct FollowUpJob {
    pub kind: JobKind,
    pub input: serde_json::Value,
    pub priority: i64,
}

/// What a handler produced; `summary` lands in the log line.
#[derive(Debug, Default)]
pub struct JobOutcome {
    pub summary: String,
    pub follow_ups: Vec<FollowUpJob>,
}

impl JobOutcome {
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            follow_ups: Vec::new(),
        }
    }
}

/// One job kind's executor. Errors mark the job failed; retry is a new job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<JobOutcome>;
}

// ---------------------------------------------------------------------------
// Per-engine QPS gate
// ---------------------------------------------------------------------------

/// Strict per-engine time barrier: no two requests to the same engine start
/// within its minimum interval. Keyed by engine name; unknown engines use
/// the slot default interval.
pub struct EngineRateGate {
    last_request: tokio::sync::Mutex<HashMap<String, tokio::time::Instant>>,
    default_interval: Duration,
}

impl EngineRateGate {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            last_request: tokio::sync::Mutex::new(HashMap::new()),
            default_interval,
        }
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Wait until the engine's interval has elapsed, then claim the slot.
    pub async fn wait(&self, engine: &str, min_interval: Option<Duration>) {
        let interval = min_interval.unwrap_or(self.default_interval);
        loop {
            let wait_for = {
                let mut last = self.last_request.lock().await;
                let now = tokio::time::Instant::now();
                match last.get(engine) {
                    Some(&previous) if now < previous + interval => previous + interval - now,
                    _ => {
                        last.insert(engine.to_string(), now);
                        return;
                    }
                }
            };
            tokio::time::sleep(wait_for).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Task cancellation flags
// ---------------------------------------------------------------------------

/// Cooperative per-task cancel flags. Workers check the flag before
/// starting a job; a running job runs to completion.
pub struct TaskCanceler {
    flags: DashMap<String, Arc<AtomicBool>>,
}

impl TaskCanceler {
    pub fn new() -> Self {
        Self {
            flags: DashMap::with_capacity(10),
        }
    }

    pub fn flag(&self, task_id: &str) -> Arc<AtomicBool> {
        self.flags
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    pub fn cancel(&self, task_id: &str) {
        self.flag(task_id).store(true, Ordering::Relaxed);
    }

    pub fn clear(&self, task_id: &str) {
        if let Some(flag) = self.flags.get(task_id) {
            flag.store(false, Ordering::Relaxed);
        }
    }

    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.flags
            .get(task_id)
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

impl Default for TaskCanceler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct JobScheduler {
    jobs: JobRepository,
    tasks: TaskRepository,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    canceler: TaskCanceler,
    gate: Arc<EngineRateGate>,
    notify: Notify,
}

impl JobScheduler {
    pub fn new(
        pool: SqlitePool,
        handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
        gate: Arc<EngineRateGate>,
    ) -> Self {
        Self {
            jobs: JobRepository::new(pool.clone()),
            tasks: TaskRepository::new(pool),
            handlers,
            canceler: TaskCanceler::new(),
            gate,
            notify: Notify::new(),
        }
    }

    /// Submit a job.
    ///
    /// Duplicate suppression returns the existing job id with
    /// `accepted=false` (not an error); a failed task is rejected outright.
    pub async fn submit(
        &self,
        kind: JobKind,
        mut input: serde_json::Value,
        priority: i64,
        task_id: &str,
        cause_id: Option<String>,
    ) -> Result<SubmitOutcome, AppError> {
        let task = self
            .tasks
            .get_by_id(task_id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::not_found("task", task_id))?;

        if !task.status.accepts_jobs() {
            return Err(AppError::PolicyRejected(format!(
                "Cannot queue {} on failed task {}",
                kind, task_id
            )));
        }

        normalize_input(kind, &mut input);

        // Duplicate suppression against queued/running work.
        let existing = match dedup_key(kind, &input) {
            DedupKey::JsonPath(path, value) => self
                .jobs
                .find_duplicate(task_id, kind, path, &value)
                .await
                .map_err(AppError::Internal)?,
            DedupKey::TaskScoped => self
                .jobs
                .find_active_of_kind(task_id, kind)
                .await
                .map_err(AppError::Internal)?,
        };
        if let Some(job_id) = existing {
            log::debug!(
                "Duplicate {} suppressed: task={} existing={}",
                kind,
                task_id,
                job_id
            );
            return Ok(SubmitOutcome {
                accepted: false,
                job_id,
            });
        }

        let cause_id = cause_id.or_else(current_cause_id);
        let job_id = self
            .jobs
            .insert(task_id, kind, priority, &input, cause_id.as_deref())
            .await
            .map_err(AppError::Internal)?;

        // New work resumes created/paused tasks.
        self.tasks
            .mark_exploring(task_id)
            .await
            .map_err(AppError::Internal)?;
        self.canceler.clear(task_id);

        log::info!(
            "Job queued: id={} kind={} task={} priority={} cause={:?}",
            job_id,
            kind,
            task_id,
            priority,
            cause_id
        );
        self.notify.notify_waiters();

        Ok(SubmitOutcome {
            accepted: true,
            job_id,
        })
    }

    /// Cancel a task: set its flag and park it in `paused`. Queued jobs are
    /// retained and resume when the task is re-submitted to.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.canceler.cancel(task_id);
        self.tasks.update_status(task_id, TaskStatus::Paused).await
    }

    /// Single worker loop for one slot.
    pub async fn run_slot(&self, slot: &'static str) {
        log::info!("Slot worker started: {}", slot);
        loop {
            match self.jobs.next_for_slot(slot).await {
                Ok(Some(job)) => {
                    self.execute_job(job).await;
                }
                Ok(None) => {
                    let wakeup = self.notify.notified();
                    tokio::select! {
                        _ = wakeup => {}
                        _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    }
                }
                Err(e) => {
                    log::error!("Failed to fetch next job for slot {}: {:#}", slot, e);
                    tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Drain every runnable job inline, slot by slot, until the queue is
    /// quiet. Deterministic driver for tests and one-shot batch runs.
    pub async fn run_pending_once(&self) -> Result<usize> {
        let mut executed = 0;
        loop {
            let mut progressed = false;
            for slot in SLOTS {
                if let Some(job) = self.jobs.next_for_slot(slot).await? {
                    self.execute_job(job).await;
                    executed += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(executed);
            }
        }
    }

    async fn execute_job(&self, job: Job) {
        // Cancellation is observed before start; a picked-up job whose task
        // was cancelled mid-queue parks the task instead of running.
        if self.canceler.is_cancelled(&job.task_id) {
            log::info!("Task {} cancelled; parking before job {}", job.task_id, job.id);
            if let Err(e) = self.tasks.update_status(&job.task_id, TaskStatus::Paused).await {
                log::error!("Failed to pause cancelled task: {:#}", e);
            }
            return;
        }

        let Some(handler) = self.handlers.get(&job.kind) else {
            log::error!("No handler for job kind {}; failing job {}", job.kind, job.id);
            let _ = self.jobs.mark_running(&job.id).await;
            let _ = self
                .jobs
                .mark_finished(&job.id, JobState::Failed, Some("no handler registered"))
                .await;
            return;
        };

        match self.jobs.mark_running(&job.id).await {
            Ok(true) => {}
            Ok(false) => return, // lost the race; state already advanced
            Err(e) => {
                log::error!("Failed to mark job running: {:#}", e);
                return;
            }
        }

        log::info!(
            "Job started: id={} kind={} task={} cause={:?}",
            job.id,
            job.kind,
            job.task_id,
            job.cause_id
        );

        let result = handler.execute(&job).await;
        let (state, error, follow_ups) = match result {
            Ok(outcome) => {
                log::info!("Job done: id={} {}", job.id, outcome.summary);
                (JobState::Done, None, outcome.follow_ups)
            }
            Err(e) => {
                log::warn!("Job failed: id={} error={:#}", job.id, e);
                (JobState::Failed, Some(format!("{:#}", e)), Vec::new())
            }
        };

        if let Err(e) = self
            .jobs
            .mark_finished(&job.id, state, error.as_deref())
            .await
        {
            log::error!("Failed to finish job {}: {:#}", job.id, e);
        }

        // Follow-up jobs inherit the finished job's cause id, keeping the
        // whole chain on one trace. Duplicates are suppressed as usual.
        for follow_up in follow_ups {
            match self
                .submit(
                    follow_up.kind,
                    follow_up.input,
                    follow_up.priority,
                    &job.task_id,
                    job.cause_id.clone(),
                )
                .await
            {
                Ok(_) => {}
                Err(e) => log::warn!(
                    "Follow-up {} from job {} not queued: {}",
                    follow_up.kind,
                    job.id,
                    e
                ),
            }
        }

        self.after_job(&job.task_id).await;
    }

    /// Park a task in `paused` once its queue drains (idle).
    async fn after_job(&self, task_id: &str) {
        match self.jobs.active_count_for_task(task_id).await {
            Ok(0) => {
                if let Ok(Some(task)) = self.tasks.get_by_id(task_id).await {
                    if task.status == TaskStatus::Exploring {
                        if let Err(e) = self.tasks.update_status(task_id, TaskStatus::Paused).await {
                            log::error!("Failed to pause idle task: {:#}", e);
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(e) => log::error!("Failed to count active jobs: {:#}", e),
        }
    }

    /// Spawn one worker per slot.
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        SLOTS
            .iter()
            .map(|slot| {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move { scheduler.run_slot(slot).await })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Dedup keys and input normalization
// ---------------------------------------------------------------------------

enum DedupKey {
    JsonPath(&'static str, String),
    TaskScoped,
}

fn dedup_key(kind: JobKind, input: &serde_json::Value) -> DedupKey {
    match kind {
        JobKind::SearchQueue => DedupKey::JsonPath(
            "$.query",
            input["query"].as_str().unwrap_or_default().to_string(),
        ),
        JobKind::TargetQueue => {
            if input["target"]["kind"].as_str() == Some("doi") {
                DedupKey::JsonPath(
                    "$.target.doi",
                    input["target"]["doi"].as_str().unwrap_or_default().to_string(),
                )
            } else {
                DedupKey::JsonPath(
                    "$.target.url",
                    input["target"]["url"].as_str().unwrap_or_default().to_string(),
                )
            }
        }
        JobKind::VerifyNli => DedupKey::TaskScoped,
        JobKind::CitationGraph => DedupKey::JsonPath(
            "$.search_id",
            input["search_id"].as_str().unwrap_or_default().to_string(),
        ),
    }
}

/// Canonicalize dedup-relevant fields before insertion so equality over
/// `json_extract` is meaningful: DOIs are lowercased with trailing
/// punctuation stripped, URLs lose trailing slashes and punctuation.
fn normalize_input(kind: JobKind, input: &mut serde_json::Value) {
    if kind != JobKind::TargetQueue {
        return;
    }
    let target = &mut input["target"];
    if let Some(doi) = target["doi"].as_str() {
        let normalized = doi.trim().trim_end_matches(['.', ',', ';', ':', ')']).to_lowercase();
        target["doi"] = serde_json::Value::from(normalized);
    }
    if let Some(url) = target["url"].as_str() {
        let normalized = url.trim().trim_end_matches(['.', ',', ';', ')', '/']).to_string();
        target["url"] = serde_json::Value::from(normalized);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn execute(&self, _job: &Job) -> Result<JobOutcome> {
            Ok(JobOutcome::summary("noop"))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        async fn execute(&self, _job: &Job) -> Result<JobOutcome> {
            anyhow::bail!("boom")
        }
    }

    async fn scheduler_with(
        pool: &SqlitePool,
        handler: Arc<dyn JobHandler>,
    ) -> (Arc<JobScheduler>, String) {
        let mut handlers: HashMap<JobKind, Arc<dyn JobHandler>> = HashMap::new();
        for kind in [
            JobKind::SearchQueue,
            JobKind::TargetQueue,
            JobKind::VerifyNli,
            JobKind::CitationGraph,
        ] {
            handlers.insert(kind, handler.clone());
        }
        let gate = Arc::new(EngineRateGate::new(Duration::from_secs(1)));
        let scheduler = Arc::new(JobScheduler::new(pool.clone(), handlers, gate));

        let task_id = TaskRepository::new(pool.clone())
            .create("test hypothesis")
            .await
            .unwrap();
        (scheduler, task_id)
    }

    #[tokio::test]
    async fn submit_accepts_and_resumes_task() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let (scheduler, task_id) = scheduler_with(&pool, Arc::new(NoopHandler)).await;

        let outcome = scheduler
            .submit(
                JobKind::SearchQueue,
                json!({"query": "rust async"}),
                PRIORITY_MEDIUM,
                &task_id,
                None,
            )
            .await
            .unwrap();
        assert!(outcome.accepted);

        let task = TaskRepository::new(pool.clone())
            .get_by_id(&task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Exploring);
    }

    #[tokio::test]
    async fn duplicate_submission_returns_existing_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let (scheduler, task_id) = scheduler_with(&pool, Arc::new(NoopHandler)).await;

        let first = scheduler
            .submit(
                JobKind::SearchQueue,
                json!({"query": "rust async"}),
                PRIORITY_MEDIUM,
                &task_id,
                None,
            )
            .await
            .unwrap();
        let second = scheduler
            .submit(
                JobKind::SearchQueue,
                json!({"query": "rust async"}),
                PRIORITY_MEDIUM,
                &task_id,
                None,
            )
            .await
            .unwrap();

        assert!(first.accepted);
        assert!(!second.accepted);
        assert_eq!(first.job_id, second.job_id);

        // A different query is new work.
        let third = scheduler
            .submit(
                JobKind::SearchQueue,
                json!({"query": "tokio select"}),
                PRIORITY_MEDIUM,
                &task_id,
                None,
            )
            .await
            .unwrap();
        assert!(third.accepted);
    }

    #[tokio::test]
    async fn target_dedup_normalizes_doi_and_url() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let (scheduler, task_id) = scheduler_with(&pool, Arc::new(NoopHandler)).await;

        let first = scheduler
            .submit(
                JobKind::TargetQueue,
                json!({"target": {"kind": "doi", "doi": "10.1000/XYZ123."}}),
                PRIORITY_MEDIUM,
                &task_id,
                None,
            )
            .await
            .unwrap();
        let second = scheduler
            .submit(
                JobKind::TargetQueue,
                json!({"target": {"kind": "doi", "doi": "10.1000/xyz123"}}),
                PRIORITY_MEDIUM,
                &task_id,
                None,
            )
            .await
            .unwrap();
        assert!(!second.accepted);
        assert_eq!(first.job_id, second.job_id);

        let url_first = scheduler
            .submit(
                JobKind::TargetQueue,
                json!({"target": {"kind": "url", "url": "https://example.com/paper/"}}),
                PRIORITY_MEDIUM,
                &task_id,
                None,
            )
            .await
            .unwrap();
        let url_second = scheduler
            .submit(
                JobKind::TargetQueue,
                json!({"target": {"kind": "url", "url": "https://example.com/paper"}}),
                PRIORITY_MEDIUM,
                &task_id,
                None,
            )
            .await
            .unwrap();
        assert!(!url_second.accepted);
        assert_eq!(url_first.job_id, url_second.job_id);
    }

    #[tokio::test]
    async fn failed_task_rejects_submission() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let (scheduler, task_id) = scheduler_with(&pool, Arc::new(NoopHandler)).await;

        TaskRepository::new(pool.clone())
            .update_status(&task_id, TaskStatus::Failed)
            .await
            .unwrap();

        let err = scheduler
            .submit(
                JobKind::SearchQueue,
                json!({"query": "anything"}),
                PRIORITY_MEDIUM,
                &task_id,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "policy_rejected");
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let (scheduler, _task_id) = scheduler_with(&pool, Arc::new(NoopHandler)).await;

        let err = scheduler
            .submit(
                JobKind::SearchQueue,
                json!({"query": "anything"}),
                PRIORITY_MEDIUM,
                "t_missing",
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn cause_id_inherits_from_trace_and_can_be_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let (scheduler, task_id) = scheduler_with(&pool, Arc::new(NoopHandler)).await;
        let jobs = JobRepository::new(pool.clone());

        // Outside any trace: null cause.
        let outside = scheduler
            .submit(
                JobKind::SearchQueue,
                json!({"query": "no trace"}),
                PRIORITY_MEDIUM,
                &task_id,
                None,
            )
            .await
            .unwrap();
        assert!(jobs.get_by_id(&outside.job_id).await.unwrap().unwrap().cause_id.is_none());

        // Inside a trace: innermost id wins.
        let trace = crate::trace::CausalTrace::new();
        let trace_id = trace.id().to_string();
        let inside = trace
            .scope(scheduler.submit(
                JobKind::SearchQueue,
                json!({"query": "traced"}),
                PRIORITY_MEDIUM,
                &task_id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(
            jobs.get_by_id(&inside.job_id).await.unwrap().unwrap().cause_id,
            Some(trace_id.clone())
        );

        // Explicit cause overrides the active trace.
        let overridden = trace
            .scope(scheduler.submit(
                JobKind::SearchQueue,
                json!({"query": "explicit"}),
                PRIORITY_MEDIUM,
                &task_id,
                Some("explicit-cause".to_string()),
            ))
            .await
            .unwrap();
        assert_eq!(
            jobs.get_by_id(&overridden.job_id).await.unwrap().unwrap().cause_id,
            Some("explicit-cause".to_string())
        );
    }

    #[tokio::test]
    async fn slot_order_is_priority_then_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let (scheduler, task_id) = scheduler_with(&pool, Arc::new(NoopHandler)).await;
        let jobs = JobRepository::new(pool.clone());

        let low = scheduler
            .submit(JobKind::SearchQueue, json!({"query": "low"}), PRIORITY_LOW, &task_id, None)
            .await
            .unwrap();
        let medium_a = scheduler
            .submit(JobKind::SearchQueue, json!({"query": "ma"}), PRIORITY_MEDIUM, &task_id, None)
            .await
            .unwrap();
        let medium_b = scheduler
            .submit(JobKind::SearchQueue, json!({"query": "mb"}), PRIORITY_MEDIUM, &task_id, None)
            .await
            .unwrap();
        let high = scheduler
            .submit(JobKind::SearchQueue, json!({"query": "high"}), PRIORITY_HIGH, &task_id, None)
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(job) = jobs.next_for_slot("network_client").await.unwrap() {
            order.push(job.id.clone());
            jobs.mark_running(&job.id).await.unwrap();
            jobs.mark_finished(&job.id, JobState::Done, None).await.unwrap();
        }

        assert_eq!(
            order,
            vec![high.job_id, medium_a.job_id, medium_b.job_id, low.job_id]
        );
    }

    #[tokio::test]
    async fn run_pending_once_executes_and_pauses_idle_task() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let (scheduler, task_id) = scheduler_with(&pool, Arc::new(NoopHandler)).await;

        scheduler
            .submit(JobKind::SearchQueue, json!({"query": "a"}), PRIORITY_MEDIUM, &task_id, None)
            .await
            .unwrap();
        scheduler
            .submit(JobKind::VerifyNli, json!({}), PRIORITY_MEDIUM, &task_id, None)
            .await
            .unwrap();

        let executed = scheduler.run_pending_once().await.unwrap();
        assert_eq!(executed, 2);

        // Queue drained: the task parks in paused.
        let task = TaskRepository::new(pool.clone())
            .get_by_id(&task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn failed_job_is_recorded_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let (scheduler, task_id) = scheduler_with(&pool, Arc::new(FailingHandler)).await;
        let jobs = JobRepository::new(pool.clone());

        let outcome = scheduler
            .submit(JobKind::SearchQueue, json!({"query": "a"}), PRIORITY_MEDIUM, &task_id, None)
            .await
            .unwrap();

        let executed = scheduler.run_pending_once().await.unwrap();
        assert_eq!(executed, 1);

        let job = jobs.get_by_id(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().contains("boom"));

        // No automatic retry: the queue stays quiet.
        assert_eq!(scheduler.run_pending_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_task_parks_and_resumes_on_resubmission() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let (scheduler, task_id) = scheduler_with(&pool, Arc::new(NoopHandler)).await;
        let tasks = TaskRepository::new(pool.clone());

        scheduler
            .submit(JobKind::SearchQueue, json!({"query": "a"}), PRIORITY_MEDIUM, &task_id, None)
            .await
            .unwrap();
        scheduler.cancel_task(&task_id).await.unwrap();

        // Paused task's jobs are not picked up.
        assert_eq!(scheduler.run_pending_once().await.unwrap(), 0);
        assert_eq!(
            tasks.get_by_id(&task_id).await.unwrap().unwrap().status,
            TaskStatus::Paused
        );

        // Re-submission resumes the task and clears the flag.
        scheduler
            .submit(JobKind::SearchQueue, json!({"query": "b"}), PRIORITY_MEDIUM, &task_id, None)
            .await
            .unwrap();
        assert_eq!(
            tasks.get_by_id(&task_id).await.unwrap().unwrap().status,
            TaskStatus::Exploring
        );
        assert!(scheduler.run_pending_once().await.unwrap() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_gate_enforces_min_interval_per_engine() {
        let gate = EngineRateGate::new(Duration::from_secs(1));
        let interval = Duration::from_secs(5);

        let t0 = tokio::time::Instant::now();
        gate.wait("duckduckgo", Some(interval)).await;
        let first = tokio::time::Instant::now() - t0;

        gate.wait("duckduckgo", Some(interval)).await;
        let second = tokio::time::Instant::now() - t0;

        // First passes immediately; second observes the full interval.
        assert!(first < Duration::from_millis(100));
        assert!(second >= interval, "second={:?}", second);

        // Independent engines are not coupled.
        let t1 = tokio::time::Instant::now();
        gate.wait("mojeek", Some(interval)).await;
        assert!(tokio::time::Instant::now() - t1 < Duration::from_millis(100));

        // Unknown engines fall back to the default interval.
        let t2 = tokio::time::Instant::now();
        gate.wait("unknown_engine", None).await;
        gate.wait("unknown_engine", None).await;
        assert!(tokio::time::Instant::now() - t2 >= Duration::from_secs(1));
    }
}
