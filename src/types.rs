use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::process::ProcessSnapshot;

pub const DOM_SNAPSHOT_MAX_CHARS: usize = 4000;

/// Kind of work a planned step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Navigate,
    Click,
    Type,
    Scroll,
    Screenshot,
    Extract,
    ExtractVision,
    ExtractHtml,
    AnswerVision,
    Wait,
    Verify,
    Complete,
    Command,
    Git,
    StartProcess,
    StopProcess,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Navigate => "navigate",
            StepKind::Click => "click",
            StepKind::Type => "type",
            StepKind::Scroll => "scroll",
            StepKind::Screenshot => "screenshot",
            StepKind::Extract => "extract",
            StepKind::ExtractVision => "extract_vision",
            StepKind::ExtractHtml => "extract_html",
            StepKind::AnswerVision => "answer_vision",
            StepKind::Wait => "wait",
            StepKind::Verify => "verify",
            StepKind::Complete => "complete",
            StepKind::Command => "command",
            StepKind::Git => "git",
            StepKind::StartProcess => "start_process",
            StepKind::StopProcess => "stop_process",
        }
    }
}

impl FromStr for StepKind {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let kind = match normalized.as_str() {
            "navigate" | "goto" | "open" => StepKind::Navigate,
            "click" => StepKind::Click,
            "type" | "type_text" | "fill" => StepKind::Type,
            "scroll" => StepKind::Scroll,
            "screenshot" => StepKind::Screenshot,
            "extract" | "extract_text" => StepKind::Extract,
            "extract_vision" => StepKind::ExtractVision,
            "extract_html" => StepKind::ExtractHtml,
            "answer_vision" => StepKind::AnswerVision,
            "wait" => StepKind::Wait,
            "verify" => StepKind::Verify,
            "complete" | "done" => StepKind::Complete,
            "command" | "run_command" | "shell" => StepKind::Command,
            "git" => StepKind::Git,
            "start_process" => StepKind::StartProcess,
            "stop_process" => StepKind::StopProcess,
            _ => return Err(EngineError::Planning(format!("unknown step kind '{raw}'"))),
        };
        Ok(kind)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One planned step. `number` is always assigned by the planner, never trusted from the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub number: usize,
    pub kind: StepKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
}

impl TaskStep {
    pub fn new(kind: StepKind, description: impl Into<String>) -> Self {
        Self {
            number: 0,
            kind,
            description: description.into(),
            target: None,
            value: None,
            expected_outcome: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    #[default]
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub task: String,
    pub steps: Vec<TaskStep>,
    pub complexity: Complexity,
    pub challenges: Vec<String>,
    /// True when the plan was built deterministically because the oracle output was unusable.
    #[serde(default)]
    pub fallback: bool,
}

impl TaskPlan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planning,
    Executing,
    Verifying,
    Replanning,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Allowed edges of the control-loop state machine.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::{Completed, Executing, Failed, Planning, Replanning, Verifying};
        matches!(
            (self, next),
            (Planning, Executing)
                | (Planning, Failed)
                | (Executing, Verifying)
                | (Executing, Failed)
                | (Verifying, Executing)
                | (Verifying, Replanning)
                | (Verifying, Completed)
                | (Verifying, Failed)
                | (Replanning, Executing)
                | (Replanning, Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Planning => "planning",
            RunStatus::Executing => "executing",
            RunStatus::Verifying => "verifying",
            RunStatus::Replanning => "replanning",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Mutable bookkeeping for one control-loop run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionState {
    pub current_step: usize,
    pub completed_steps: Vec<String>,
    pub extracted_data: Vec<Value>,
    pub screenshots: Vec<PathBuf>,
    pub last_error: Option<String>,
    pub status: RunStatus,
    pub retry_count: u32,
    pub total_executions: u32,
    pub replans: u32,
    /// Set once `executing` has been entered; `planning` is unreachable afterwards.
    pub started_executing: bool,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self {
            current_step: 0,
            completed_steps: Vec::new(),
            extracted_data: Vec::new(),
            screenshots: Vec::new(),
            last_error: None,
            status: RunStatus::Planning,
            retry_count: 0,
            total_executions: 0,
            replans: 0,
            started_executing: false,
        }
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<(), EngineError> {
        if next == RunStatus::Planning && self.started_executing {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if next == RunStatus::Executing {
            self.started_executing = true;
        }
        self.status = next;
        Ok(())
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a single Action Registry call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            payload: None,
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            payload: None,
            error: Some(error.into()),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// File path carried in the payload, if any (screenshots).
    pub fn artifact_path(&self) -> Option<PathBuf> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("path"))
            .and_then(Value::as_str)
            .map(PathBuf::from)
    }

    /// Short text fed back to the oracle as the observation of this call.
    pub fn describe(&self) -> String {
        let mut out = if self.success {
            String::from("success")
        } else {
            String::from("failure")
        };
        if let Some(message) = &self.message {
            out.push_str(": ");
            out.push_str(message);
        }
        if let Some(error) = &self.error {
            out.push_str(" error: ");
            out.push_str(error);
        }
        if let Some(payload) = &self.payload {
            let rendered = payload.to_string();
            out.push_str("\npayload: ");
            out.extend(rendered.chars().take(2000));
        }
        out
    }
}

/// What the agent observes about the page after a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub dom_snapshot: String,
}

impl PageState {
    pub fn render(&self, max_chars: usize) -> String {
        let dom = truncate_chars(&self.dom_snapshot, max_chars);
        format!("Page URL: {}\nTitle: {}\n\nDOM:\n{}", self.url, self.title, dom)
    }
}

/// Final structured outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    pub summary: String,
    pub steps_completed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extracted_data: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub running_processes: Vec<ProcessSnapshot>,
}

impl RunResult {
    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            summary: format!("Task failed: {error}"),
            steps_completed: Vec::new(),
            extracted_data: Vec::new(),
            screenshots: Vec::new(),
            error: Some(error),
            session_id: None,
            question: None,
            running_processes: Vec::new(),
        }
    }
}

/// Cut `text` at `max` characters, noting how much was dropped.
pub fn truncate_chars(text: &str, max: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max).collect();
    format!("{head}\n... [truncated, {total} total chars]")
}
