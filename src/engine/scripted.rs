//! Deterministic `AgentRunner` that plays back a scripted event list.
//!
//! Used as the default driver for drills and end-to-end smoke runs, and by
//! the test suite to exercise every engine path without a browser.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::runner::{AgentRunner, RunOutcome, RunnerHooks, StepPayload, TaskBrief};

#[derive(Debug, Clone)]
pub enum ScriptedEvent {
    /// Emit one step with the given summary.
    Step(String),
    /// Ask the operator a question and wait for the answer.
    Ask(String),
    /// Sleep, observing cancellation.
    Sleep(Duration),
    /// Finish successfully.
    Complete(Option<String>),
    /// Finish with an error.
    Fail(String),
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
    events: Vec<ScriptedEvent>,
}

impl ScriptedRunner {
    pub fn new(events: Vec<ScriptedEvent>) -> Self {
        Self { events }
    }

    /// Emit `steps` steps, then complete. The stock demo script.
    pub fn completing(steps: u32) -> Self {
        let mut events: Vec<ScriptedEvent> = (1..=steps)
            .map(|n| ScriptedEvent::Step(format!("<p>scripted step {n}</p>")))
            .collect();
        events.push(ScriptedEvent::Complete(Some("scripted run finished".into())));
        Self::new(events)
    }

    /// Emit as many steps as the script loops allow; never completes on its
    /// own. Useful for exercising stop and budget enforcement.
    pub fn endless_steps() -> Self {
        Self { events: Vec::new() }
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn start(
        &self,
        brief: TaskBrief,
        hooks: Arc<dyn RunnerHooks>,
    ) -> anyhow::Result<RunOutcome> {
        if self.events.is_empty() {
            // Endless mode: keep stepping until a hook refuses.
            let mut n = brief.steps_taken;
            loop {
                n += 1;
                hooks
                    .on_step(StepPayload {
                        summary_html: Some(format!("<p>endless step {n}</p>")),
                        ..StepPayload::default()
                    })
                    .await?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        for event in &self.events {
            match event {
                ScriptedEvent::Step(summary) => {
                    hooks
                        .on_step(StepPayload {
                            summary_html: Some(summary.clone()),
                            url: Some("about:blank".into()),
                            ..StepPayload::default()
                        })
                        .await?;
                }
                ScriptedEvent::Ask(question) => {
                    let _answer = hooks.on_ask_human(question.clone()).await?;
                }
                ScriptedEvent::Sleep(duration) => {
                    let cancel = hooks.cancel_flag();
                    tokio::select! {
                        () = tokio::time::sleep(*duration) => {}
                        () = cancel.cancelled() => {
                            anyhow::bail!("scripted run interrupted during sleep");
                        }
                    }
                }
                ScriptedEvent::Complete(summary) => {
                    return Ok(RunOutcome::Completed {
                        result_summary: summary.clone(),
                    });
                }
                ScriptedEvent::Fail(reason) => {
                    return Ok(RunOutcome::Failed {
                        reason: reason.clone(),
                    });
                }
            }
        }

        Ok(RunOutcome::Completed {
            result_summary: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::runner::{CancelFlag, HookError};
    use std::sync::Mutex;

    struct RecordingHooks {
        steps: Mutex<Vec<StepPayload>>,
        answer: String,
        cancel: CancelFlag,
    }

    #[async_trait]
    impl RunnerHooks for RecordingHooks {
        async fn on_step(&self, step: StepPayload) -> Result<(), HookError> {
            self.steps.lock().unwrap().push(step);
            Ok(())
        }

        async fn on_ask_human(&self, _question: String) -> Result<String, HookError> {
            Ok(self.answer.clone())
        }

        fn cancel_flag(&self) -> CancelFlag {
            self.cancel.clone()
        }
    }

    fn brief() -> TaskBrief {
        TaskBrief {
            task_id: "t1".into(),
            prompt: "do it".into(),
            model_name: "gpt-5-mini".into(),
            temperature: None,
            reasoning_effort: None,
            max_steps: 10,
            steps_taken: 0,
            browser_profile_dir: std::path::PathBuf::from("/tmp/browser"),
        }
    }

    #[tokio::test]
    async fn completing_script_emits_requested_steps() {
        let hooks = Arc::new(RecordingHooks {
            steps: Mutex::new(Vec::new()),
            answer: String::new(),
            cancel: CancelFlag::new(),
        });
        let outcome = ScriptedRunner::completing(3)
            .start(brief(), Arc::clone(&hooks) as Arc<dyn RunnerHooks>)
            .await
            .unwrap();
        assert_eq!(hooks.steps.lock().unwrap().len(), 3);
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn fail_event_reports_reason() {
        let hooks = Arc::new(RecordingHooks {
            steps: Mutex::new(Vec::new()),
            answer: String::new(),
            cancel: CancelFlag::new(),
        });
        let outcome = ScriptedRunner::new(vec![ScriptedEvent::Fail("browser_crashed".into())])
            .start(brief(), hooks)
            .await
            .unwrap();
        match outcome {
            RunOutcome::Failed { reason } => assert_eq!(reason, "browser_crashed"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
