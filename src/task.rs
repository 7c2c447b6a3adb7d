//! Task data model shared by the engine, the node HTTP surface, and the head.
//!
//! The on-disk `record.json` is a serialized [`TaskRecord`]; steps and chat
//! messages live in append-only JSON-lines files next to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Lifecycle states of a task.
///
/// `Completed`, `Failed`, `Stopped`, and `Cancelled` are terminal with respect
/// to the agent: only the browser session (and its VNC token) may still change
/// until the task is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    WaitingForInput,
    Completed,
    Failed,
    Stopped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::WaitingForInput => "waiting_for_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// One agent step. `step_number` is 1-based and gap-free within a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub step_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An open or answered operator-assistance request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistanceRequest {
    pub question: String,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
}

impl AssistanceRequest {
    pub fn open(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            requested_at: Utc::now(),
            responded_at: None,
            response_text: None,
        }
    }
}

/// Persisted per-task record. The node that created a task owns it for life;
/// `node_id` never changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub node_id: String,
    pub title: String,
    pub instructions: String,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    pub max_steps: u32,
    pub leave_browser_open: bool,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub step_count: u32,
    pub browser_open: bool,
    pub needs_attention: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistance: Option<AssistanceRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_token: Option<String>,
}

impl TaskRecord {
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            node_id: self.node_id.clone(),
            title: self.title.clone(),
            status: self.status,
            browser_open: self.browser_open,
            leave_browser_open: self.leave_browser_open,
            needs_attention: self.needs_attention,
            created_at: self.created_at,
            updated_at: self.updated_at,
            scheduled_for: self.scheduled_for,
            step_count: self.step_count,
            model_name: self.model_name.clone(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Listing row. Never carries the VNC token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub node_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub browser_open: bool,
    pub leave_browser_open: bool,
    pub needs_attention: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub step_count: u32,
    pub model_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetail {
    pub record: TaskRecord,
    pub steps: Vec<TaskStep>,
    pub chat_history: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_launch_url: Option<String>,
}

pub const MIN_TITLE_LEN: usize = 3;
pub const MAX_TITLE_LEN: usize = 200;
pub const MIN_INSTRUCTIONS_LEN: usize = 5;
pub const MAX_STEPS_CEILING: u32 = 200;

pub const REASONING_EFFORT_OPTIONS: [&str; 3] = ["low", "medium", "high"];

/// Body of `POST /api/tasks`. `node_id` is consumed by the head for routing;
/// nodes stamp their own id into the record regardless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub instructions: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub leave_browser_open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl CreateTaskRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        let title_len = self.title.trim().chars().count();
        if !(MIN_TITLE_LEN..=MAX_TITLE_LEN).contains(&title_len) {
            return Err(ApiError::invalid_input(format!(
                "title must be {MIN_TITLE_LEN}-{MAX_TITLE_LEN} characters"
            )));
        }
        if self.instructions.trim().chars().count() < MIN_INSTRUCTIONS_LEN {
            return Err(ApiError::invalid_input(format!(
                "instructions must be at least {MIN_INSTRUCTIONS_LEN} characters"
            )));
        }
        if self.model.trim().is_empty() {
            return Err(ApiError::invalid_input("model is required"));
        }
        if let Some(steps) = self.max_steps
            && !(1..=MAX_STEPS_CEILING).contains(&steps)
        {
            return Err(ApiError::invalid_input(format!(
                "max_steps must be within 1-{MAX_STEPS_CEILING}"
            )));
        }
        if let Some(temp) = self.temperature
            && !(0.0..=2.0).contains(&temp)
        {
            return Err(ApiError::invalid_input("temperature must be within 0.0-2.0"));
        }
        if let Some(ref effort) = self.reasoning_effort
            && !REASONING_EFFORT_OPTIONS.contains(&effort.as_str())
        {
            return Err(ApiError::invalid_input(
                "reasoning_effort must be one of low, medium, high",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistRequest {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContinueRequest {
    pub instructions: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub scheduled_for: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> CreateTaskRequest {
        CreateTaskRequest {
            title: "Check order status".into(),
            instructions: "Open the store and check order #42".into(),
            model: "gpt-5-mini".into(),
            temperature: None,
            max_steps: Some(10),
            leave_browser_open: false,
            reasoning_effort: None,
            scheduled_for: None,
            node_id: None,
        }
    }

    #[test]
    fn create_request_accepts_valid_payload() {
        assert!(base_request().validate().is_ok());
    }

    #[test]
    fn create_request_rejects_short_title() {
        let mut req = base_request();
        req.title = "ab".into();
        assert!(req.validate().is_err());
    }

    #[test]
    fn create_request_rejects_step_budget_out_of_bounds() {
        let mut req = base_request();
        req.max_steps = Some(0);
        assert!(req.validate().is_err());
        req.max_steps = Some(MAX_STEPS_CEILING + 1);
        assert!(req.validate().is_err());
    }

    #[test]
    fn create_request_rejects_unknown_reasoning_effort() {
        let mut req = base_request();
        req.reasoning_effort = Some("extreme".into());
        assert!(req.validate().is_err());
        req.reasoning_effort = Some("medium".into());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn status_terminality() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Scheduled.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::WaitingForInput).unwrap();
        assert_eq!(json, "\"waiting_for_input\"");
    }

    #[test]
    fn summary_carries_no_vnc_token() {
        let record = TaskRecord {
            id: "t1".into(),
            node_id: "node-1".into(),
            title: "t".into(),
            instructions: "i".into(),
            model_name: "gpt-5".into(),
            temperature: None,
            reasoning_effort: None,
            max_steps: 5,
            leave_browser_open: false,
            status: TaskStatus::Running,
            scheduled_for: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            step_count: 0,
            browser_open: true,
            needs_attention: false,
            last_error: None,
            result_summary: None,
            assistance: None,
            vnc_token: Some("secret".into()),
        };
        let json = serde_json::to_value(record.summary()).unwrap();
        assert!(json.get("vnc_token").is_none());
    }
}
