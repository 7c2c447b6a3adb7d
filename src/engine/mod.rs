//! Per-node task lifecycle engine.
//!
//! Owns the state machine, launches runners, captures steps, resolves
//! operator assistance, and enforces the single-runner invariant through the
//! store's per-task mutex. All inputs arrive already authenticated.

pub mod runner;
pub mod scripted;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::{ApiError, reason};
use crate::scheduler::ScheduleQueue;
use crate::store::{LiveRun, TaskSlot, TaskState, TaskStore};
use crate::task::{
    AssistanceRequest, ChatMessage, ChatRole, CreateTaskRequest, TaskDetail, TaskRecord,
    TaskStatus, TaskStep, TaskSummary,
};
use crate::vnc;
use runner::{
    AgentRunner, CancelFlag, HookError, RunOutcome, RunnerHooks, StepPayload, TaskBrief,
};

/// Engine knobs, distilled from [`NodeConfig`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub node_id: String,
    pub max_steps_default: u32,
    pub default_model: String,
    pub schedule_check: Duration,
    pub assist_timeout: Duration,
    pub stop_grace: Duration,
    pub worker_concurrency: Option<usize>,
}

impl EngineConfig {
    pub fn from_node(cfg: &NodeConfig) -> Self {
        Self {
            node_id: cfg.node_id.clone(),
            max_steps_default: cfg.max_steps_default,
            default_model: cfg.default_model.clone(),
            schedule_check: Duration::from_secs(cfg.schedule_check_seconds),
            assist_timeout: cfg.assist_timeout(),
            stop_grace: cfg.stop_grace(),
            worker_concurrency: cfg.worker_concurrency,
        }
    }
}

pub struct TaskEngine {
    cfg: EngineConfig,
    store: Arc<TaskStore>,
    runner: Arc<dyn AgentRunner>,
    queue: ScheduleQueue,
    workers: Option<Arc<Semaphore>>,
    /// Back-reference for spawning runner tasks that outlive the caller.
    self_ref: Weak<TaskEngine>,
}

impl TaskEngine {
    /// Recover persisted tasks and seed the deferred-start queue.
    pub fn bootstrap(
        cfg: EngineConfig,
        store: Arc<TaskStore>,
        runner: Arc<dyn AgentRunner>,
    ) -> anyhow::Result<Arc<Self>> {
        let report = store.recover()?;
        if !report.failed_on_restart.is_empty() {
            tracing::warn!(
                count = report.failed_on_restart.len(),
                "tasks interrupted by restart marked failed"
            );
        }
        let queue = ScheduleQueue::new();
        for (id, due) in &report.scheduled {
            queue.push(id.clone(), *due);
        }
        tracing::info!(
            loaded = report.loaded,
            scheduled = report.scheduled.len(),
            "task engine ready"
        );
        let workers = cfg
            .worker_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Ok(Arc::new_cyclic(|self_ref| Self {
            cfg,
            store,
            runner,
            queue,
            workers,
            self_ref: self_ref.clone(),
        }))
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("engine dropped while in use")
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Background timer that promotes due scheduled tasks. One per node.
    pub fn spawn_scheduler(&self) -> JoinHandle<()> {
        let engine = self.arc();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.cfg.schedule_check);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let promoted = engine.promote_due(Utc::now()).await;
                if promoted > 0 {
                    tracing::debug!(promoted, "scheduled tasks promoted");
                }
            }
        })
    }

    // ── Public contract ──────────────────────────────────────────────────

    pub async fn create(&self, payload: CreateTaskRequest) -> Result<TaskDetail, ApiError> {
        payload.validate()?;
        let now = Utc::now();
        if let Some(when) = payload.scheduled_for
            && when <= now
        {
            return Err(ApiError::invalid_input(
                "scheduled_for must be in the future",
            ));
        }

        let id = Uuid::new_v4().to_string();
        let record = TaskRecord {
            id: id.clone(),
            node_id: self.cfg.node_id.clone(),
            title: payload.title.trim().to_string(),
            instructions: payload.instructions.trim().to_string(),
            model_name: payload.model.clone(),
            temperature: payload.temperature,
            reasoning_effort: payload.reasoning_effort.clone(),
            max_steps: payload.max_steps.unwrap_or(self.cfg.max_steps_default),
            leave_browser_open: payload.leave_browser_open,
            status: if payload.scheduled_for.is_some() {
                TaskStatus::Scheduled
            } else {
                TaskStatus::Pending
            },
            scheduled_for: payload.scheduled_for,
            created_at: now,
            updated_at: now,
            completed_at: None,
            step_count: 0,
            browser_open: false,
            needs_attention: false,
            last_error: None,
            result_summary: None,
            assistance: None,
            vnc_token: None,
        };
        let chat = vec![ChatMessage::new(ChatRole::User, record.instructions.clone())];
        let slot = self
            .store
            .insert(record, chat)
            .map_err(ApiError::internal)?;

        match payload.scheduled_for {
            Some(when) => {
                self.queue.push(id.clone(), when);
                tracing::info!(task_id = %id, scheduled_for = %when, "task scheduled");
            }
            None => self.launch(Arc::clone(&slot)).await?,
        }
        self.detail(&id).await
    }

    pub async fn list(&self) -> Vec<TaskSummary> {
        let mut summaries = Vec::new();
        for slot in self.store.slots() {
            let state = slot.state.lock().await;
            summaries.push(state.record.summary());
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    pub async fn detail(&self, id: &str) -> Result<TaskDetail, ApiError> {
        let slot = self.slot(id)?;
        let state = slot.state.lock().await;
        Ok(detail_from(&state))
    }

    pub fn owns(&self, id: &str) -> bool {
        self.store.contains(id)
    }

    /// Stop any live runner, wait out the grace period, then remove the
    /// task's directory.
    pub async fn delete(&self, id: &str) -> Result<(), ApiError> {
        let Some(slot) = self.store.detach(id) else {
            return Err(ApiError::not_found(id));
        };
        let run = {
            let mut state = slot.state.lock().await;
            // Dropping the assist sender wakes a blocked ask_human.
            state.assist_tx = None;
            state.run.take()
        };
        if let Some(run) = run {
            run.cancel.cancel();
            let mut join = run.join;
            if tokio::time::timeout(self.cfg.stop_grace, &mut join)
                .await
                .is_err()
            {
                tracing::warn!(task_id = %id, "runner did not exit in time, aborting");
                join.abort();
            }
        }
        self.store.delete_dir(id).map_err(ApiError::internal)?;
        tracing::info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// Answer a pending `ask_human`. Only valid while the task is waiting.
    pub async fn assist(&self, id: &str, message: String) -> Result<TaskDetail, ApiError> {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock().await;
        if state.record.status != TaskStatus::WaitingForInput {
            return Err(ApiError::conflict("task is not waiting for input"));
        }
        let Some(tx) = state.assist_tx.take() else {
            return Err(ApiError::conflict("task has no pending assistance request"));
        };
        let message = message.trim().to_string();
        if tx.send(message.clone()).is_err() {
            return Err(ApiError::conflict("task runner is no longer waiting"));
        }

        let before = state.record.clone();
        let chat_len = state.chat.len();
        state.record.needs_attention = false;
        state.record.status = TaskStatus::Running;
        if let Some(assist) = state.record.assistance.as_mut() {
            assist.response_text = Some(message.clone());
            assist.responded_at = Some(Utc::now());
        }
        state.record.touch();
        let answer = ChatMessage::new(ChatRole::User, message);
        state.chat.push(answer.clone());
        let persisted = self
            .store
            .append_chat(id, &answer)
            .and_then(|()| self.store.persist_record(&state.record));
        if let Err(error) = persisted {
            state.record = before;
            state.chat.truncate(chat_len);
            return Err(ApiError::internal(error));
        }
        Ok(detail_from(&state))
    }

    /// Start a fresh run on top of the preserved browser profile. Valid for
    /// any task without a live runner that is not scheduled.
    pub async fn continue_task(
        &self,
        id: &str,
        instructions: String,
    ) -> Result<TaskDetail, ApiError> {
        let slot = self.slot(id)?;
        {
            let mut state = slot.state.lock().await;
            if state.record.status == TaskStatus::Scheduled {
                return Err(ApiError::conflict("task is scheduled and has not started yet"));
            }
            if state.runner_alive() {
                return Err(ApiError::conflict("task is already running"));
            }
            let instructions = instructions.trim().to_string();
            if instructions.is_empty() {
                return Err(ApiError::invalid_input(
                    "additional instructions are required to continue",
                ));
            }

            let before = state.record.clone();
            let chat_len = state.chat.len();
            state.record.status = TaskStatus::Pending;
            state.record.browser_open = false;
            state.record.vnc_token = None;
            state.record.last_error = None;
            state.record.result_summary = None;
            state.record.completed_at = None;
            state.record.needs_attention = false;
            state.record.assistance = None;
            state.record.touch();
            let followup = ChatMessage::new(ChatRole::User, instructions);
            state.chat.push(followup.clone());
            let persisted = self
                .store
                .append_chat(id, &followup)
                .and_then(|()| self.store.persist_record(&state.record));
            if let Err(error) = persisted {
                state.record = before;
                state.chat.truncate(chat_len);
                return Err(ApiError::internal(error));
            }
            self.attach_runner(&slot, &mut state)?;
        }
        self.detail(id).await
    }

    /// Cooperative cancellation of a running task.
    pub async fn stop(&self, id: &str) -> Result<TaskDetail, ApiError> {
        let slot = self.slot(id)?;
        let run = {
            let mut state = slot.state.lock().await;
            if state.record.status != TaskStatus::Running {
                return Err(ApiError::conflict("task is not running"));
            }
            let Some(run) = state.run.take() else {
                return Err(ApiError::conflict("task has no live runner"));
            };
            run
        };
        run.cancel.cancel();
        let mut join = run.join;
        if tokio::time::timeout(self.cfg.stop_grace, &mut join)
            .await
            .is_err()
        {
            tracing::warn!(task_id = %id, "runner did not stop in time, aborting");
            join.abort();
            self.force_stopped(&slot).await;
        }
        self.detail(id).await
    }

    pub async fn open_browser(&self, id: &str) -> Result<TaskDetail, ApiError> {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock().await;
        if state.record.browser_open {
            return Ok(detail_from(&state));
        }
        let before = state.record.clone();
        state.record.browser_open = true;
        state.record.vnc_token = Some(vnc::new_token());
        state.record.leave_browser_open = true;
        state.record.touch();
        if let Err(error) = self.store.persist_record(&state.record) {
            state.record = before;
            return Err(ApiError::internal(error));
        }
        Ok(detail_from(&state))
    }

    pub async fn close_browser(&self, id: &str) -> Result<TaskDetail, ApiError> {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock().await;
        let before = state.record.clone();
        state.record.browser_open = false;
        state.record.vnc_token = None;
        state.record.leave_browser_open = false;
        state.record.touch();
        if let Err(error) = self.store.persist_record(&state.record) {
            state.record = before;
            return Err(ApiError::internal(error));
        }
        Ok(detail_from(&state))
    }

    /// Rotate the VNC token of an open browser session; previously issued
    /// tokens stop admitting connections immediately.
    pub async fn mint_vnc(&self, id: &str) -> Result<TaskDetail, ApiError> {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock().await;
        if !state.record.browser_open {
            return Err(ApiError::conflict("browser session is not open"));
        }
        let before = state.record.clone();
        state.record.vnc_token = Some(vnc::new_token());
        state.record.touch();
        if let Err(error) = self.store.persist_record(&state.record) {
            state.record = before;
            return Err(ApiError::internal(error));
        }
        Ok(detail_from(&state))
    }

    pub async fn reschedule(
        &self,
        id: &str,
        when: DateTime<Utc>,
    ) -> Result<TaskDetail, ApiError> {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock().await;
        if state.record.status != TaskStatus::Scheduled {
            return Err(ApiError::conflict("task is not scheduled"));
        }
        if when <= Utc::now() {
            return Err(ApiError::invalid_input("scheduled time must be in the future"));
        }
        let before = state.record.clone();
        state.record.scheduled_for = Some(when);
        state.record.touch();
        if let Err(error) = self.store.persist_record(&state.record) {
            state.record = before;
            return Err(ApiError::internal(error));
        }
        self.queue.push(id.to_string(), when);
        Ok(detail_from(&state))
    }

    pub async fn run_now(&self, id: &str) -> Result<TaskDetail, ApiError> {
        let slot = self.slot(id)?;
        {
            let mut state = slot.state.lock().await;
            if state.record.status != TaskStatus::Scheduled {
                return Err(ApiError::conflict("task is not scheduled"));
            }
            let before = state.record.clone();
            state.record.scheduled_for = None;
            state.record.status = TaskStatus::Pending;
            state.record.touch();
            if let Err(error) = self.store.persist_record(&state.record) {
                state.record = before;
                return Err(ApiError::internal(error));
            }
        }
        self.launch(Arc::clone(&slot)).await?;
        self.detail(id).await
    }

    /// Promote every scheduled task whose due time has arrived. Stale heap
    /// entries (rescheduled or already promoted) are re-filed or dropped.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> usize {
        let mut promoted = 0;
        for (id, _heap_due) in self.queue.pop_due(now) {
            let Some(slot) = self.store.slot(&id) else {
                continue;
            };
            let should_launch = {
                let mut state = slot.state.lock().await;
                if state.record.status != TaskStatus::Scheduled {
                    false
                } else {
                    match state.record.scheduled_for {
                        Some(actual) if actual > now => {
                            // Rescheduled to a later time after this entry
                            // was queued; re-file under the new due time.
                            self.queue.push(id.clone(), actual);
                            false
                        }
                        _ => {
                            state.record.scheduled_for = None;
                            state.record.status = TaskStatus::Pending;
                            state.record.touch();
                            if let Err(error) = self.store.persist_record(&state.record) {
                                tracing::warn!(task_id = %id, %error, "failed to persist promotion");
                            }
                            true
                        }
                    }
                }
            };
            if should_launch && self.launch(Arc::clone(&slot)).await.is_ok() {
                promoted += 1;
            }
        }
        promoted
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn slot(&self, id: &str) -> Result<Arc<TaskSlot>, ApiError> {
        self.store.slot(id).ok_or_else(|| ApiError::not_found(id))
    }

    /// Attach a runner to the slot. Exactly one live runner per task: a
    /// second start while one is alive returns `conflict`.
    async fn launch(&self, slot: Arc<TaskSlot>) -> Result<(), ApiError> {
        let mut state = slot.state.lock().await;
        self.attach_runner(&slot, &mut state)
    }

    /// The locked half of [`TaskEngine::launch`], for callers that must
    /// validate and attach under one critical section.
    fn attach_runner(&self, slot: &Arc<TaskSlot>, state: &mut TaskState) -> Result<(), ApiError> {
        if state.runner_alive() {
            return Err(ApiError::conflict("task is already running"));
        }
        let cancel = CancelFlag::new();
        let engine = self.arc();
        let task_slot = Arc::clone(slot);
        let run_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            engine.run_task(task_slot, run_cancel).await;
        });
        state.run = Some(LiveRun { join, cancel });
        Ok(())
    }

    async fn run_task(self: Arc<Self>, slot: Arc<TaskSlot>, cancel: CancelFlag) {
        // Wait for a worker slot; the task stays `pending` in the meantime.
        let _permit = match &self.workers {
            Some(workers) => {
                let workers = Arc::clone(workers);
                tokio::select! {
                    permit = workers.acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                    () = cancel.cancelled() => {
                        self.finalize(&slot, &cancel, None, false, None).await;
                        return;
                    }
                }
            }
            None => None,
        };
        if cancel.is_cancelled() {
            self.finalize(&slot, &cancel, None, false, None).await;
            return;
        }

        let brief = {
            let mut state = slot.state.lock().await;
            state.record.status = TaskStatus::Running;
            state.record.scheduled_for = None;
            state.record.browser_open = true;
            state.record.vnc_token = Some(vnc::new_token());
            state.record.needs_attention = false;
            state.record.touch();
            if let Err(error) = self.store.persist_record(&state.record) {
                tracing::error!(task_id = %slot.id, %error, "failed to persist run start");
                self.finalize(&slot, &cancel, None, false, Some(format!("{error:#}")))
                    .await;
                return;
            }
            TaskBrief {
                task_id: state.record.id.clone(),
                prompt: compose_prompt(&state),
                model_name: state.record.model_name.clone(),
                temperature: state.record.temperature,
                reasoning_effort: state.record.reasoning_effort.clone(),
                max_steps: state.record.max_steps,
                steps_taken: state.record.step_count,
                browser_profile_dir: self.store.browser_profile_dir(&state.record.id),
            }
        };
        tracing::info!(task_id = %slot.id, model = %brief.model_name, "task run starting");

        let hooks = Arc::new(EngineHooks {
            store: Arc::clone(&self.store),
            slot: Arc::clone(&slot),
            cancel: cancel.clone(),
            budget_exceeded: AtomicBool::new(false),
            persist_error: std::sync::Mutex::new(None),
            assist_timeout: self.cfg.assist_timeout,
        });
        let result = self
            .runner
            .start(brief, Arc::clone(&hooks) as Arc<dyn RunnerHooks>)
            .await;

        let budget_exceeded = hooks.budget_exceeded.load(Ordering::SeqCst);
        let persist_error = hooks.persist_error.lock().expect("hook state poisoned").take();
        self.finalize(&slot, &cancel, Some(result), budget_exceeded, persist_error)
            .await;
    }

    /// Map the run result onto a terminal state and settle the browser
    /// session. Precedence: persistence failure, cancellation, step budget,
    /// then the driver's own outcome.
    async fn finalize(
        &self,
        slot: &Arc<TaskSlot>,
        cancel: &CancelFlag,
        result: Option<anyhow::Result<RunOutcome>>,
        budget_exceeded: bool,
        persist_error: Option<String>,
    ) {
        let mut state = slot.state.lock().await;
        state.assist_tx = None;

        let (status, last_error, summary) = if let Some(error) = persist_error {
            (TaskStatus::Failed, Some(error), None)
        } else if cancel.is_cancelled() {
            (TaskStatus::Stopped, None, None)
        } else if budget_exceeded {
            (
                TaskStatus::Failed,
                Some(reason::STEP_BUDGET_EXCEEDED.to_string()),
                None,
            )
        } else {
            match result {
                Some(Ok(RunOutcome::Completed { result_summary })) => {
                    (TaskStatus::Completed, None, result_summary)
                }
                Some(Ok(RunOutcome::Failed { reason })) => {
                    (TaskStatus::Failed, Some(reason), None)
                }
                Some(Err(error)) => (TaskStatus::Failed, Some(format!("{error:#}")), None),
                None => (TaskStatus::Stopped, None, None),
            }
        };

        state.record.status = status;
        state.record.last_error = last_error;
        state.record.result_summary = summary;
        state.record.completed_at = Some(Utc::now());
        state.record.needs_attention = false;
        let keep_browser = state.record.leave_browser_open && status == TaskStatus::Completed;
        state.record.browser_open = keep_browser;
        if !keep_browser {
            state.record.vnc_token = None;
        }
        state.record.touch();

        let notice = ChatMessage::new(
            ChatRole::System,
            format!("Task finished with status {}.", status.as_str()),
        );
        if let Err(error) = self.store.append_chat(&state.record.id, &notice) {
            tracing::warn!(task_id = %slot.id, %error, "failed to append finish notice");
        } else {
            state.chat.push(notice);
        }
        if let Err(error) = self.store.persist_record(&state.record) {
            tracing::error!(task_id = %slot.id, %error, "failed to persist terminal state");
        }
        state.run = None;
        tracing::info!(task_id = %slot.id, status = status.as_str(), "task run finished");
    }

    /// Settle a task whose runner had to be hard-aborted (the in-task
    /// finalizer never ran).
    async fn force_stopped(&self, slot: &Arc<TaskSlot>) {
        let mut state = slot.state.lock().await;
        state.assist_tx = None;
        state.run = None;
        state.record.status = TaskStatus::Stopped;
        state.record.needs_attention = false;
        state.record.browser_open = false;
        state.record.vnc_token = None;
        state.record.completed_at = Some(Utc::now());
        state.record.touch();
        if let Err(error) = self.store.persist_record(&state.record) {
            tracing::error!(task_id = %slot.id, %error, "failed to persist forced stop");
        }
    }
}

fn detail_from(state: &TaskState) -> TaskDetail {
    let vnc_launch_url = if state.record.browser_open {
        state
            .record
            .vnc_token
            .as_ref()
            .map(|token| format!("/vnc/{}?token={token}", state.record.id))
    } else {
        None
    };
    TaskDetail {
        record: state.record.clone(),
        steps: state.steps.clone(),
        chat_history: state.chat.clone(),
        vnc_launch_url,
    }
}

// ── Runner hooks ─────────────────────────────────────────────────────────

struct EngineHooks {
    store: Arc<TaskStore>,
    slot: Arc<TaskSlot>,
    cancel: CancelFlag,
    budget_exceeded: AtomicBool,
    persist_error: std::sync::Mutex<Option<String>>,
    assist_timeout: Duration,
}

impl EngineHooks {
    fn record_persist_error(&self, error: &anyhow::Error) {
        let mut slot = self.persist_error.lock().expect("hook state poisoned");
        if slot.is_none() {
            *slot = Some(format!("{error:#}"));
        }
    }
}

#[async_trait]
impl RunnerHooks for EngineHooks {
    async fn on_step(&self, payload: StepPayload) -> Result<(), HookError> {
        if self.cancel.is_cancelled() {
            return Err(HookError::Cancelled);
        }
        let mut state = self.slot.state.lock().await;
        if state.record.step_count >= state.record.max_steps {
            self.budget_exceeded.store(true, Ordering::SeqCst);
            return Err(HookError::StepBudgetExceeded);
        }

        let step_number = state.record.step_count + 1;
        let step = TaskStep {
            step_number,
            summary_html: payload.summary_html,
            screenshot_b64: payload.screenshot_b64,
            url: payload.url,
            title: payload.title,
            created_at: Utc::now(),
        };
        let narration = ChatMessage::new(
            ChatRole::Assistant,
            format!("Step {step_number} completed."),
        );

        let id = state.record.id.clone();
        let persisted = self
            .store
            .append_step(&id, &step)
            .and_then(|()| self.store.append_chat(&id, &narration))
            .and_then(|()| {
                state.record.step_count = step_number;
                state.record.touch();
                self.store.persist_record(&state.record)
            });
        match persisted {
            Ok(()) => {
                state.steps.push(step);
                state.chat.push(narration);
                Ok(())
            }
            Err(error) => {
                tracing::error!(task_id = %id, %error, "failed to persist step");
                self.record_persist_error(&error);
                Err(HookError::Cancelled)
            }
        }
    }

    async fn on_ask_human(&self, question: String) -> Result<String, HookError> {
        if self.cancel.is_cancelled() {
            return Err(HookError::Cancelled);
        }
        let rx = {
            let mut state = self.slot.state.lock().await;
            let (tx, rx) = oneshot::channel();
            state.assist_tx = Some(tx);
            state.record.needs_attention = true;
            state.record.status = TaskStatus::WaitingForInput;
            state.record.assistance = Some(AssistanceRequest::open(question.as_str()));
            state.record.touch();
            let notice =
                ChatMessage::new(ChatRole::Assistant, format!("Agent needs help:\n{question}"));
            let id = state.record.id.clone();
            if let Err(error) = self
                .store
                .append_chat(&id, &notice)
                .and_then(|()| self.store.persist_record(&state.record))
            {
                tracing::error!(task_id = %id, %error, "failed to persist assistance request");
                self.record_persist_error(&error);
                state.assist_tx = None;
                return Err(HookError::Cancelled);
            }
            state.chat.push(notice);
            rx
        };

        enum Wait {
            Answer(String),
            Timeout,
            Cancelled,
        }
        let wait = tokio::select! {
            answer = rx => match answer {
                Ok(answer) => Wait::Answer(answer),
                Err(_) => Wait::Cancelled,
            },
            () = self.cancel.cancelled() => Wait::Cancelled,
            () = tokio::time::sleep(self.assist_timeout) => Wait::Timeout,
        };

        match wait {
            // The assist endpoint already persisted the resumed state.
            Wait::Answer(answer) => Ok(answer),
            Wait::Cancelled => Err(HookError::Cancelled),
            Wait::Timeout => {
                let answer = "Timed out waiting for operator input.".to_string();
                let mut state = self.slot.state.lock().await;
                state.assist_tx = None;
                state.record.needs_attention = false;
                state.record.status = TaskStatus::Running;
                if let Some(assist) = state.record.assistance.as_mut() {
                    assist.response_text = Some(answer.clone());
                    assist.responded_at = Some(Utc::now());
                }
                state.record.touch();
                if let Err(error) = self.store.persist_record(&state.record) {
                    tracing::warn!(task_id = %self.slot.id, %error, "failed to persist assist timeout");
                }
                Ok(answer)
            }
        }
    }

    fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }
}

// ── Prompt composition ───────────────────────────────────────────────────

/// Build the prompt for a run: the primary goal, recent follow-ups, and a
/// digest of completed steps so continuation runs pick up where the last
/// one left off.
fn compose_prompt(state: &TaskState) -> String {
    let initial_goal = state
        .chat
        .iter()
        .find(|m| m.role == ChatRole::User)
        .map_or_else(|| state.record.instructions.clone(), |m| m.content.clone());

    let followups: Vec<&str> = state
        .chat
        .iter()
        .skip(1)
        .filter(|m| m.role == ChatRole::User && !m.content.trim().is_empty())
        .map(|m| m.content.as_str())
        .collect();
    let latest_followup = followups.last().copied().unwrap_or("");
    let earlier: Vec<&str> = followups
        .iter()
        .rev()
        .skip(1)
        .take(4)
        .rev()
        .copied()
        .collect();

    let mut sections: Vec<String> = Vec::new();
    if !initial_goal.trim().is_empty() {
        sections.push(format!("Primary goal:\n{}", initial_goal.trim()));
    }
    if !earlier.is_empty() {
        let bullets: Vec<String> = earlier.iter().map(|text| format!("- {text}")).collect();
        sections.push(format!(
            "Earlier follow-up requests:\n{}",
            bullets.join("\n")
        ));
    }
    if !latest_followup.is_empty() {
        sections.push(format!(
            "Current follow-up request:\n{}",
            latest_followup.trim()
        ));
    }

    let tail = state.steps.iter().rev().take(5).rev();
    let mut step_lines: Vec<String> = Vec::new();
    for step in tail {
        let mut summary = step
            .summary_html
            .as_deref()
            .map(strip_html)
            .unwrap_or_default();
        if summary.is_empty()
            && let Some(title) = &step.title
        {
            summary = title.clone();
        }
        if summary.is_empty()
            && let Some(url) = &step.url
        {
            summary = format!("Visited {url}");
        }
        if summary.is_empty() {
            summary = "No summary provided.".into();
        }
        step_lines.push(format!("Step {}: {summary}", step.step_number));
    }
    if !step_lines.is_empty() {
        sections.push(format!("Completed steps so far:\n{}", step_lines.join("\n")));
        sections.push(
            "Continue from the existing browser session. Build on the completed work instead of starting over."
                .into(),
        );
    }

    sections.join("\n\n")
}

fn strip_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_tag = false;
    for ch in value.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.trim().to_string()
}
