//! Interactive loop: the oracle drives one tool call per turn and may pause to ask the user.
//!
//! Every oracle turn is classified into exactly one [`OracleResponse`]. Consecutive
//! unparseable turns trigger one recovery (a fresh observation is injected); an
//! unparseable turn after recovery fails the run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::actions::{Action, ActionRegistry};
use crate::config::EngineConfig;
use crate::error::{EngineError, SafetyLimit};
use crate::oracle::{self, ChatMessage, DecisionOracle, extract_json_object, looks_like_question};
use crate::prompts::{INTERACTIVE_PROMPT, RECOVERY_NOTICE};
use crate::reporter::{ProgressEvent, ProgressReporter};
use crate::types::RunResult;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const MAX_SESSION_IDLE: Duration = Duration::from_secs(60 * 60);

const FORMAT_REMINDER: &str =
    "That reply could not be understood. Reply with exactly one JSON object in the required format.";

/// One classified oracle turn.
#[derive(Debug, Clone, PartialEq)]
pub enum OracleResponse {
    ExecuteTool {
        action: String,
        params: Value,
        reasoning: Option<String>,
    },
    AskUser {
        question: String,
    },
    Complete {
        summary: String,
    },
    Error {
        message: String,
    },
    Unknown {
        raw: String,
    },
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

impl OracleResponse {
    /// Classify free text. A JSON object with a non-empty `action` is always a tool call,
    /// whatever else it carries.
    pub fn classify(raw: &str) -> Self {
        let trimmed = raw.trim();
        let unknown = || OracleResponse::Unknown {
            raw: trimmed.to_string(),
        };
        if trimmed.is_empty() {
            return unknown();
        }
        let Some(value) = extract_json_object(trimmed) else {
            if looks_like_question(trimmed) {
                return OracleResponse::AskUser {
                    question: trimmed.to_string(),
                };
            }
            return unknown();
        };

        if let Some(action) = str_field(&value, &["action", "tool"]) {
            return OracleResponse::ExecuteTool {
                action: action.to_string(),
                params: value.get("params").cloned().unwrap_or_else(|| json!({})),
                reasoning: str_field(&value, &["reasoning"]).map(str::to_string),
            };
        }
        match str_field(&value, &["type"]) {
            Some("ask_user") => match str_field(&value, &["question", "message"]) {
                Some(question) => OracleResponse::AskUser {
                    question: question.to_string(),
                },
                None => unknown(),
            },
            Some("complete") => OracleResponse::Complete {
                summary: str_field(&value, &["summary", "message"])
                    .unwrap_or("Task complete")
                    .to_string(),
            },
            Some("error") => OracleResponse::Error {
                message: str_field(&value, &["message", "error"])
                    .unwrap_or("oracle reported an error")
                    .to_string(),
            },
            _ => unknown(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    WaitingForInput,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct InteractiveSession {
    pub id: String,
    pub task: String,
    pub status: SessionStatus,
    pub messages: Vec<ChatMessage>,
    pub pending_question: Option<String>,
    pub steps_completed: Vec<String>,
    pub extracted_data: Vec<Value>,
    pub screenshots: Vec<std::path::PathBuf>,
    pub tool_calls: u32,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl InteractiveSession {
    fn new(task: &str, messages: Vec<ChatMessage>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("session-{}", Uuid::new_v4().simple()),
            task: task.to_string(),
            status: SessionStatus::Running,
            messages,
            pending_question: None,
            steps_completed: Vec::new(),
            extracted_data: Vec::new(),
            screenshots: Vec::new(),
            tool_calls: 0,
            created_at: now,
            last_active: now,
        }
    }
}

/// Sessions keyed by id. Cheap to clone; clones share one table.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<String, InteractiveSession>>>,
}

impl SessionStore {
    pub fn get(&self, id: &str) -> Option<InteractiveSession> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn put(&self, session: InteractiveSession) {
        self.sessions.lock().insert(session.id.clone(), session);
    }

    /// Record `answer` on a waiting session and mark it running, in one critical section.
    /// Only one caller can claim a given question.
    pub fn accept_answer(&self, id: &str, answer: &str) -> Result<InteractiveSession, String> {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(id) else {
            return Err(format!("session {id} not found"));
        };
        if session.status != SessionStatus::WaitingForInput {
            let status = serde_json::to_value(session.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            return Err(format!("session {id} is not waiting for input ({status})"));
        }
        session.messages.push(ChatMessage::user(format!("User answer: {answer}")));
        session.pending_question = None;
        session.status = SessionStatus::Running;
        session.last_active = Utc::now();
        Ok(session.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of sessions currently waiting for the user.
    pub fn waiting(&self) -> Vec<(String, String)> {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.status == SessionStatus::WaitingForInput)
            .map(|s| (s.id.clone(), s.pending_question.clone().unwrap_or_default()))
            .collect()
    }

    /// Drop every session idle for longer than `max_idle` as of `now`, whatever its status.
    pub fn sweep(&self, max_idle: Duration, now: DateTime<Utc>) -> usize {
        let max_idle = chrono::Duration::from_std(max_idle).unwrap_or(chrono::Duration::MAX);
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| now.signed_duration_since(s.last_active) <= max_idle);
        before - sessions.len()
    }

    /// Periodic sweep on the current runtime.
    pub fn spawn_sweeper(&self, every: Duration, max_idle: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.sweep(max_idle, Utc::now());
                if removed > 0 {
                    info!(removed, remaining = store.len(), "swept idle sessions");
                }
            }
        })
    }
}

pub struct InteractiveRunner {
    oracle: Arc<dyn DecisionOracle>,
    registry: Arc<ActionRegistry>,
    reporter: Arc<dyn ProgressReporter>,
    sessions: SessionStore,
    config: EngineConfig,
}

impl InteractiveRunner {
    pub fn new(
        oracle: Arc<dyn DecisionOracle>,
        registry: Arc<ActionRegistry>,
        reporter: Arc<dyn ProgressReporter>,
        sessions: SessionStore,
    ) -> Self {
        let config = registry.config().clone();
        Self {
            oracle,
            registry,
            reporter,
            sessions,
            config,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    #[instrument(skip_all, fields(task = %task))]
    pub async fn start(&self, task: &str) -> RunResult {
        if task.trim().is_empty() {
            return self.reject(RunResult::failed("task description is empty"));
        }
        let observation = self.registry.observe().await;
        let messages = vec![
            ChatMessage::system(format!("{INTERACTIVE_PROMPT}\n\n{}", self.registry.menu())),
            ChatMessage::user(format!("Task: {task}\n\nCurrent state:\n{observation}")),
        ];
        let session = InteractiveSession::new(task, messages);
        info!(session_id = %session.id, "interactive session started");
        self.sessions.put(session.clone());
        self.drive(session).await
    }

    /// Continue a session that is waiting for input.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn resume(&self, session_id: &str, answer: &str) -> RunResult {
        match self.sessions.accept_answer(session_id, answer) {
            Ok(session) => self.drive(session).await,
            Err(reason) => self.reject(with_session(RunResult::failed(reason), session_id)),
        }
    }

    async fn drive(&self, mut session: InteractiveSession) -> RunResult {
        let threshold = self.config.unknown_response_threshold;
        let mut consecutive_unknown = 0u32;
        let mut unparsed_total = 0u32;
        let mut recovered = false;

        let outcome = loop {
            if session.tool_calls >= self.config.max_step_executions {
                let limit = SafetyLimit::TotalExecutions {
                    limit: self.config.max_step_executions,
                };
                error!(session_id = %session.id, "tool call limit reached");
                break Err(EngineError::from(limit).to_string());
            }

            let raw = match oracle::ask(self.oracle.as_ref(), &session.messages, self.config.oracle_timeout()).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(session_id = %session.id, error = %err, "oracle turn failed, counting as empty");
                    String::new()
                }
            };
            session.last_active = Utc::now();
            if !raw.trim().is_empty() {
                session.messages.push(ChatMessage::assistant(raw.clone()));
            }

            match OracleResponse::classify(&raw) {
                OracleResponse::ExecuteTool {
                    action,
                    params,
                    reasoning,
                } => {
                    consecutive_unknown = 0;
                    unparsed_total = 0;
                    recovered = false;
                    if let Some(reasoning) = reasoning {
                        debug!(session_id = %session.id, %reasoning, "oracle reasoning");
                    }
                    if let Some(summary) = self.execute_tool(&mut session, &action, params).await {
                        break Ok(summary);
                    }
                }
                OracleResponse::AskUser { question } => {
                    session.status = SessionStatus::WaitingForInput;
                    session.pending_question = Some(question.clone());
                    self.sessions.put(session.clone());
                    info!(session_id = %session.id, "waiting for user input");
                    self.reporter.on_event(&ProgressEvent::Question {
                        session_id: session.id.clone(),
                        question: question.clone(),
                    });
                    return RunResult {
                        summary: format!("Waiting for user input: {question}"),
                        question: Some(question),
                        ..self.result(&session, true, None)
                    };
                }
                OracleResponse::Complete { summary } => break Ok(summary),
                OracleResponse::Error { message } => break Err(message),
                OracleResponse::Unknown { .. } => {
                    consecutive_unknown += 1;
                    unparsed_total += 1;
                    warn!(session_id = %session.id, consecutive_unknown, "unparseable oracle turn");
                    if recovered {
                        break Err(format!(
                            "could not parse oracle output after {unparsed_total} attempts"
                        ));
                    }
                    if consecutive_unknown >= threshold {
                        let observation = self.registry.observe().await;
                        info!(session_id = %session.id, "injecting recovery snapshot");
                        self.reporter.on_progress("Oracle replies were unreadable; retrying with a fresh snapshot");
                        session
                            .messages
                            .push(ChatMessage::user(format!("{RECOVERY_NOTICE}\n\n{observation}")));
                        consecutive_unknown = 0;
                        recovered = true;
                    } else {
                        session.messages.push(ChatMessage::user(FORMAT_REMINDER));
                    }
                }
            }
        };

        let (success, summary, error) = match outcome {
            Ok(summary) => {
                session.status = SessionStatus::Completed;
                (true, summary, None)
            }
            Err(message) => {
                session.status = SessionStatus::Failed;
                (false, format!("Task failed: {message}"), Some(message))
            }
        };
        session.last_active = Utc::now();
        self.sessions.put(session.clone());
        info!(session_id = %session.id, success, "interactive session finished");
        self.reporter.on_event(&ProgressEvent::Finished {
            success,
            summary: summary.clone(),
        });
        RunResult {
            summary,
            ..self.result(&session, success, error)
        }
    }

    /// Run one tool call and feed its result back. Returns a summary when the call completes the task.
    async fn execute_tool(
        &self,
        session: &mut InteractiveSession,
        name: &str,
        params: Value,
    ) -> Option<String> {
        session.tool_calls += 1;
        let number = session.tool_calls as usize;
        let action = match Action::from_parts(name, params) {
            Ok(action) => action,
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "rejected tool call");
                session
                    .messages
                    .push(ChatMessage::user(format!("Tool call rejected: {err}")));
                return None;
            }
        };
        self.reporter.on_event(&ProgressEvent::StepStarted {
            number,
            total: number,
            description: action.to_string(),
        });
        let result = self.registry.invoke(&action).await;
        self.reporter.on_event(&ProgressEvent::StepFinished {
            number,
            success: result.success,
            detail: result
                .message
                .clone()
                .or_else(|| result.error.clone())
                .unwrap_or_default(),
        });
        session
            .messages
            .push(ChatMessage::user(format!("Result of {action}: {}", result.describe())));
        if !result.success {
            return None;
        }
        session.steps_completed.push(format!(
            "{action} -> {}",
            result.message.as_deref().unwrap_or("ok")
        ));
        if let Some(path) = result.artifact_path() {
            session.screenshots.push(path);
        }
        if action.yields_data()
            && let Some(payload) = &result.payload
        {
            session.extracted_data.push(payload.clone());
        }
        match action {
            Action::Complete { .. } => Some(result.message.unwrap_or_else(|| "Task complete".to_string())),
            _ => None,
        }
    }

    fn reject(&self, result: RunResult) -> RunResult {
        warn!(summary = %result.summary, "request rejected");
        self.reporter.on_event(&ProgressEvent::Finished {
            success: false,
            summary: result.summary.clone(),
        });
        result
    }

    fn result(&self, session: &InteractiveSession, success: bool, error: Option<String>) -> RunResult {
        RunResult {
            success,
            summary: String::new(),
            steps_completed: session.steps_completed.clone(),
            extracted_data: session.extracted_data.clone(),
            screenshots: session.screenshots.clone(),
            error,
            session_id: Some(session.id.clone()),
            question: None,
            running_processes: self.registry.processes().list_processes(),
        }
    }
}

fn with_session(mut result: RunResult, session_id: &str) -> RunResult {
    result.session_id = Some(session_id.to_string());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_calls_take_precedence() {
        let raw = r#"{"type": "complete", "summary": "done", "action": "screenshot"}"#;
        assert!(matches!(
            OracleResponse::classify(raw),
            OracleResponse::ExecuteTool { ref action, .. } if action == "screenshot"
        ));
    }

    #[test]
    fn classifies_each_kind() {
        assert_eq!(
            OracleResponse::classify(r#"{"type": "ask_user", "question": "Which one?"}"#),
            OracleResponse::AskUser {
                question: "Which one?".to_string()
            }
        );
        assert_eq!(
            OracleResponse::classify("```json\n{\"type\": \"complete\", \"summary\": \"ok\"}\n```"),
            OracleResponse::Complete {
                summary: "ok".to_string()
            }
        );
        assert_eq!(
            OracleResponse::classify(r#"{"type": "error", "message": "blocked"}"#),
            OracleResponse::Error {
                message: "blocked".to_string()
            }
        );
        assert!(matches!(OracleResponse::classify("   "), OracleResponse::Unknown { .. }));
        assert!(matches!(
            OracleResponse::classify(r#"{"type": "ask_user"}"#),
            OracleResponse::Unknown { .. }
        ));
    }

    #[test]
    fn plain_questions_fall_back_to_heuristic() {
        assert!(matches!(
            OracleResponse::classify("Should I delete the branch?"),
            OracleResponse::AskUser { .. }
        ));
        assert!(matches!(
            OracleResponse::classify("I clicked the button."),
            OracleResponse::Unknown { .. }
        ));
    }

    #[test]
    fn sweep_drops_idle_sessions_regardless_of_status() {
        let store = SessionStore::default();
        let mut old = InteractiveSession::new("old", Vec::new());
        old.status = SessionStatus::Completed;
        old.last_active = Utc::now() - chrono::Duration::hours(2);
        let fresh = InteractiveSession::new("fresh", Vec::new());
        let fresh_id = fresh.id.clone();
        store.put(old);
        store.put(fresh);

        assert_eq!(store.sweep(MAX_SESSION_IDLE, Utc::now()), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get(&fresh_id).is_some());
    }

    #[test]
    fn an_answer_is_accepted_once() {
        let store = SessionStore::default();
        let mut session = InteractiveSession::new("pick one", Vec::new());
        session.status = SessionStatus::WaitingForInput;
        session.pending_question = Some("Which?".to_string());
        let id = session.id.clone();
        store.put(session);

        let claimed = store.accept_answer(&id, "first").expect("claimed");
        assert_eq!(claimed.status, SessionStatus::Running);
        assert!(claimed.pending_question.is_none());
        let err = store.accept_answer(&id, "second").unwrap_err();
        assert_eq!(err, format!("session {id} is not waiting for input (running)"));
        let stored = store.get(&id).expect("session");
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.messages[0].content, "User answer: first");
        assert_eq!(store.accept_answer("session-x", "hi").unwrap_err(), "session session-x not found");
    }

    #[test]
    fn racing_answers_have_one_winner() {
        let store = SessionStore::default();
        let mut session = InteractiveSession::new("pick one", Vec::new());
        session.status = SessionStatus::WaitingForInput;
        let id = session.id.clone();
        store.put(session);

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let store = store.clone();
                    let id = id.clone();
                    scope.spawn(move || store.accept_answer(&id, &format!("answer {i}")).is_ok())
                })
                .collect();
            handles.into_iter().map(|h| usize::from(h.join().unwrap())).sum()
        });
        assert_eq!(winners, 1);
        assert_eq!(store.get(&id).expect("session").messages.len(), 1);
    }

    #[tokio::test]
    async fn sweeper_runs_on_its_interval() {
        let store = SessionStore::default();
        let mut old = InteractiveSession::new("old", Vec::new());
        old.last_active = Utc::now() - chrono::Duration::hours(2);
        store.put(old);
        let handle = store.spawn_sweeper(Duration::from_millis(20), MAX_SESSION_IDLE);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.is_empty());
        handle.abort();
    }
}
