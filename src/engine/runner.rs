//! The `AgentRunner` seam between the task engine and whatever actually
//! drives the browser.
//!
//! The engine supplies hooks for the three things a driver needs from the
//! control plane: recording a step, asking the operator a question, and
//! observing cancellation. The driver reports its end through the returned
//! [`RunOutcome`]; the engine maps that (plus the cancellation and budget
//! flags) onto a terminal task status.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

/// Cooperative cancellation flag shared between the engine and a runner.
/// Observed at step boundaries and inside `ask_human`.
#[derive(Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// What a driver hands the engine for one completed step.
#[derive(Debug, Clone, Default)]
pub struct StepPayload {
    pub summary_html: Option<String>,
    pub screenshot_b64: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
}

/// How a run ended, as reported by the driver itself.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed { result_summary: Option<String> },
    Failed { reason: String },
}

/// Why a hook refused to continue. Drivers should stop promptly and return;
/// the engine decides the terminal status from its own flags, not from the
/// driver's view of the abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("run cancelled")]
    Cancelled,
    #[error("step budget exhausted")]
    StepBudgetExceeded,
}

/// Everything the engine gives a driver about the task it is about to run.
#[derive(Debug, Clone)]
pub struct TaskBrief {
    pub task_id: String,
    /// Composed prompt: initial goal plus follow-ups and prior step context
    /// on continuation runs.
    pub prompt: String,
    pub model_name: String,
    pub temperature: Option<f64>,
    pub reasoning_effort: Option<String>,
    pub max_steps: u32,
    /// Steps already persisted before this run (continuations resume the
    /// numbering, not restart it).
    pub steps_taken: u32,
    /// Browser profile directory preserved across runs of the same task.
    pub browser_profile_dir: std::path::PathBuf,
}

/// Engine-side callbacks available to a running driver.
#[async_trait]
pub trait RunnerHooks: Send + Sync {
    /// Persist one step. Fails with [`HookError::StepBudgetExceeded`] when
    /// the step budget is already spent, or [`HookError::Cancelled`].
    async fn on_step(&self, step: StepPayload) -> Result<(), HookError>;

    /// Suspend until the operator answers, the wait times out (resolved as a
    /// timeout notice), or the run is cancelled.
    async fn on_ask_human(&self, question: String) -> Result<String, HookError>;

    /// The shared cancellation flag, for drivers that poll between actions.
    fn cancel_flag(&self) -> CancelFlag;
}

/// One variation point: the thing that drives the browser.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn start(
        &self,
        brief: TaskBrief,
        hooks: Arc<dyn RunnerHooks>,
    ) -> anyhow::Result<RunOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_flag_wakes_waiters() {
        let flag = CancelFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        flag.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn cancel_flag_is_sticky() {
        let flag = CancelFlag::new();
        flag.cancel();
        assert!(flag.is_cancelled());
        // A waiter arriving after the fact resolves immediately.
        tokio::time::timeout(Duration::from_millis(100), flag.cancelled())
            .await
            .unwrap();
    }
}
