//! Action Registry: every capability the agent can invoke.
//!
//! Actions form a closed enum. Oracle output is mapped onto it through
//! [`Action::from_parts`]; a name outside the enum is a typed error, never a no-op.
//! Every handler failure comes back as `ActionResult { success: false, .. }`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::oracle::{DecisionOracle, coerce_booleans};
use crate::process::ProcessManager;
use crate::types::ActionResult;

pub mod page;
pub mod processes;
pub mod shell;

pub use page::PageDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
    Top,
    Bottom,
}

/// A concrete, validated action invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
    },
    Type {
        selector: String,
        text: String,
        #[serde(default)]
        submit: bool,
    },
    PressKey {
        key: String,
    },
    Scroll {
        #[serde(default)]
        direction: ScrollDirection,
        #[serde(default)]
        amount: Option<i64>,
    },
    Screenshot {},
    Extract {
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        label: Option<String>,
    },
    ExtractHtml {
        #[serde(default)]
        selector: Option<String>,
    },
    ExtractVision {
        #[serde(default)]
        description: Option<String>,
    },
    AnswerVision {
        question: String,
    },
    Wait {
        ms: u64,
    },
    RunCommand {
        command: String,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Git {
        args: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    StartProcess {
        command: String,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        ready_pattern: Option<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        max_log_lines: Option<usize>,
    },
    StopProcess {
        id: String,
    },
    ListProcesses {},
    ProcessLogs {
        id: String,
        #[serde(default)]
        tail: Option<usize>,
    },
    Complete {
        #[serde(default)]
        summary: Option<String>,
    },
}

impl Action {
    /// Build an action from an oracle-chosen name and loosely typed params.
    pub fn from_parts(name: &str, params: Value) -> Result<Self, EngineError> {
        let kind: ActionName = name.parse()?;
        let mut params = match params {
            Value::Null => json!({}),
            Value::Object(_) => params,
            other => {
                return Err(EngineError::action(format!(
                    "params for {kind} must be an object, got {other}"
                )));
            }
        };
        coerce_params(kind, &mut params);
        serde_json::from_value(json!({ "action": kind.as_str(), "params": params }))
            .map_err(|err| EngineError::action(format!("invalid params for {kind}: {err}")))
    }

    pub fn name(&self) -> ActionName {
        match self {
            Action::Navigate { .. } => ActionName::Navigate,
            Action::Click { .. } => ActionName::Click,
            Action::Type { .. } => ActionName::Type,
            Action::PressKey { .. } => ActionName::PressKey,
            Action::Scroll { .. } => ActionName::Scroll,
            Action::Screenshot {} => ActionName::Screenshot,
            Action::Extract { .. } => ActionName::Extract,
            Action::ExtractHtml { .. } => ActionName::ExtractHtml,
            Action::ExtractVision { .. } => ActionName::ExtractVision,
            Action::AnswerVision { .. } => ActionName::AnswerVision,
            Action::Wait { .. } => ActionName::Wait,
            Action::RunCommand { .. } => ActionName::RunCommand,
            Action::Git { .. } => ActionName::Git,
            Action::StartProcess { .. } => ActionName::StartProcess,
            Action::StopProcess { .. } => ActionName::StopProcess,
            Action::ListProcesses {} => ActionName::ListProcesses,
            Action::ProcessLogs { .. } => ActionName::ProcessLogs,
            Action::Complete { .. } => ActionName::Complete,
        }
    }

    /// Actions whose payload is data the user asked for.
    pub fn yields_data(&self) -> bool {
        matches!(
            self,
            Action::Extract { .. }
                | Action::ExtractHtml { .. }
                | Action::ExtractVision { .. }
                | Action::AnswerVision { .. }
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Navigate { url } => write!(f, "navigate {url}"),
            Action::Click { selector } => write!(f, "click {selector}"),
            Action::Type { selector, text, .. } => write!(f, "type {text:?} into {selector}"),
            Action::PressKey { key } => write!(f, "press {key}"),
            Action::Wait { ms } => write!(f, "wait {ms}ms"),
            Action::RunCommand { command, .. } => write!(f, "run `{command}`"),
            Action::Git { args, .. } => write!(f, "git {}", args.join(" ")),
            Action::StartProcess { command, .. } => write!(f, "start `{command}`"),
            Action::StopProcess { id } => write!(f, "stop {id}"),
            other => f.write_str(other.name().as_str()),
        }
    }
}

/// Names of every registered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionName {
    Navigate,
    Click,
    Type,
    PressKey,
    Scroll,
    Screenshot,
    Extract,
    ExtractHtml,
    ExtractVision,
    AnswerVision,
    Wait,
    RunCommand,
    Git,
    StartProcess,
    StopProcess,
    ListProcesses,
    ProcessLogs,
    Complete,
}

impl ActionName {
    pub const ALL: [ActionName; 18] = [
        ActionName::Navigate,
        ActionName::Click,
        ActionName::Type,
        ActionName::PressKey,
        ActionName::Scroll,
        ActionName::Screenshot,
        ActionName::Extract,
        ActionName::ExtractHtml,
        ActionName::ExtractVision,
        ActionName::AnswerVision,
        ActionName::Wait,
        ActionName::RunCommand,
        ActionName::Git,
        ActionName::StartProcess,
        ActionName::StopProcess,
        ActionName::ListProcesses,
        ActionName::ProcessLogs,
        ActionName::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        self.spec().name
    }

    pub fn spec(self) -> &'static ActionSpec {
        &SPECS[self as usize]
    }
}

impl FromStr for ActionName {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let alias = match normalized.as_str() {
            "goto" | "open_url" => Some(ActionName::Navigate),
            "type_text" | "type_into" | "fill" => Some(ActionName::Type),
            "shell" | "run_shell_command" | "exec" => Some(ActionName::RunCommand),
            "done" | "finish" => Some(ActionName::Complete),
            _ => None,
        };
        alias
            .or_else(|| {
                ActionName::ALL
                    .into_iter()
                    .find(|name| name.as_str() == normalized)
            })
            .ok_or_else(|| EngineError::UnknownAction(raw.to_string()))
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Text,
    Bool,
    Integer,
    TextList,
}

#[derive(Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub about: &'static str,
}

/// Introspectable description of one action: its name and parameter shape.
#[derive(Debug)]
pub struct ActionSpec {
    pub name: &'static str,
    pub about: &'static str,
    pub params: &'static [ParamSpec],
}

impl ActionSpec {
    /// One line of the oracle's available-actions menu.
    pub fn menu_line(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                let kind = match p.kind {
                    ParamKind::Text => "string",
                    ParamKind::Bool => "bool",
                    ParamKind::Integer => "integer",
                    ParamKind::TextList => "string[]",
                };
                let optional = if p.required { "" } else { "?" };
                format!("{}{optional}: {kind}", p.name)
            })
            .collect();
        format!("- {} {{{}}}: {}", self.name, params.join(", "), self.about)
    }
}

const fn param(name: &'static str, kind: ParamKind, required: bool, about: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        kind,
        required,
        about,
    }
}

// Indexed by `ActionName as usize`; keep the order in sync with the enum.
static SPECS: [ActionSpec; 18] = [
    ActionSpec {
        name: "navigate",
        about: "open a URL in the browser",
        params: &[param("url", ParamKind::Text, true, "absolute URL")],
    },
    ActionSpec {
        name: "click",
        about: "click an element",
        params: &[param("selector", ParamKind::Text, true, "CSS selector")],
    },
    ActionSpec {
        name: "type",
        about: "clear an input and type text, optionally pressing Enter",
        params: &[
            param("selector", ParamKind::Text, true, "CSS selector"),
            param("text", ParamKind::Text, true, "text to type"),
            param("submit", ParamKind::Bool, false, "press Enter afterwards"),
        ],
    },
    ActionSpec {
        name: "press_key",
        about: "press a keyboard key",
        params: &[param("key", ParamKind::Text, true, "key name, e.g. Enter")],
    },
    ActionSpec {
        name: "scroll",
        about: "scroll the page",
        params: &[
            param("direction", ParamKind::Text, false, "up | down | top | bottom"),
            param("amount", ParamKind::Integer, false, "pixels"),
        ],
    },
    ActionSpec {
        name: "screenshot",
        about: "save a screenshot of the page",
        params: &[],
    },
    ActionSpec {
        name: "extract",
        about: "read the visible text of an element",
        params: &[
            param("selector", ParamKind::Text, false, "CSS selector, default body"),
            param("label", ParamKind::Text, false, "name for the extracted value"),
        ],
    },
    ActionSpec {
        name: "extract_html",
        about: "read the HTML of an element",
        params: &[param("selector", ParamKind::Text, false, "CSS selector, default document")],
    },
    ActionSpec {
        name: "extract_vision",
        about: "capture a screenshot and the visible page text",
        params: &[param("description", ParamKind::Text, false, "what to look for")],
    },
    ActionSpec {
        name: "answer_vision",
        about: "answer a question from what the page shows",
        params: &[param("question", ParamKind::Text, true, "question to answer")],
    },
    ActionSpec {
        name: "wait",
        about: "pause (capped)",
        params: &[param("ms", ParamKind::Integer, true, "milliseconds")],
    },
    ActionSpec {
        name: "run_command",
        about: "run a shell command and capture its output",
        params: &[
            param("command", ParamKind::Text, true, "shell command line"),
            param("cwd", ParamKind::Text, false, "working directory"),
            param("timeout_ms", ParamKind::Integer, false, "timeout"),
        ],
    },
    ActionSpec {
        name: "git",
        about: "run an allow-listed git subcommand",
        params: &[
            param("args", ParamKind::TextList, true, "git arguments, e.g. [\"status\"]"),
            param("cwd", ParamKind::Text, false, "repository directory"),
        ],
    },
    ActionSpec {
        name: "start_process",
        about: "start a background process (dev server, watcher)",
        params: &[
            param("command", ParamKind::Text, true, "shell command line"),
            param("cwd", ParamKind::Text, false, "working directory"),
            param("ready_pattern", ParamKind::Text, false, "output text that means ready"),
            param("timeout_ms", ParamKind::Integer, false, "start timeout"),
            param("max_log_lines", ParamKind::Integer, false, "log lines to keep"),
        ],
    },
    ActionSpec {
        name: "stop_process",
        about: "stop a background process",
        params: &[param("id", ParamKind::Text, true, "process id")],
    },
    ActionSpec {
        name: "list_processes",
        about: "list background processes",
        params: &[],
    },
    ActionSpec {
        name: "process_logs",
        about: "read recent output of a background process",
        params: &[
            param("id", ParamKind::Text, true, "process id"),
            param("tail", ParamKind::Integer, false, "number of lines"),
        ],
    },
    ActionSpec {
        name: "complete",
        about: "finish the task",
        params: &[param("summary", ParamKind::Text, false, "what was achieved")],
    },
];

/// Fix up free-text params according to the declared shape of `kind`.
fn coerce_params(kind: ActionName, params: &mut Value) {
    let Some(map) = params.as_object_mut() else {
        return;
    };
    for spec in kind.spec().params {
        let Some(value) = map.get_mut(spec.name) else {
            continue;
        };
        match spec.kind {
            ParamKind::Bool => coerce_booleans(value),
            ParamKind::Integer => {
                if let Some(n) = value.as_str().and_then(|s| s.trim().parse::<i64>().ok()) {
                    *value = json!(n);
                } else if let Some(f) = value.as_f64().filter(|f| f.fract() == 0.0) {
                    *value = json!(f as i64);
                }
            }
            ParamKind::TextList => {
                if let Some(s) = value.as_str() {
                    let parts: Vec<&str> = s.split_whitespace().collect();
                    *value = json!(parts);
                }
            }
            ParamKind::Text => {
                if value.is_number() || value.is_boolean() {
                    *value = Value::String(value.to_string());
                }
            }
        }
        if value.is_null() && !spec.required {
            map.remove(spec.name);
        }
    }
}

/// `min(requested, ceiling)`, plus whether capping happened.
pub fn clamp_wait(requested_ms: u64, ceiling_ms: u64) -> (u64, bool) {
    if requested_ms > ceiling_ms {
        (ceiling_ms, true)
    } else {
        (requested_ms, false)
    }
}

pub struct ActionRegistry {
    config: EngineConfig,
    processes: ProcessManager,
    page: Option<Arc<dyn PageDriver>>,
    oracle: Option<Arc<dyn DecisionOracle>>,
}

impl ActionRegistry {
    pub fn new(config: EngineConfig, processes: ProcessManager) -> Self {
        Self {
            config,
            processes,
            page: None,
            oracle: None,
        }
    }

    pub fn with_page(mut self, page: Arc<dyn PageDriver>) -> Self {
        self.page = Some(page);
        self
    }

    /// Oracle used by `answer_vision`.
    pub fn with_oracle(mut self, oracle: Arc<dyn DecisionOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    pub fn specs(&self) -> impl Iterator<Item = &'static ActionSpec> {
        ActionName::ALL.into_iter().map(ActionName::spec)
    }

    /// The available-actions menu shown to the oracle.
    pub fn menu(&self) -> String {
        let lines: Vec<String> = self.specs().map(ActionSpec::menu_line).collect();
        format!("Available actions:\n{}", lines.join("\n"))
    }

    /// Run one action. Never fails: errors and timeouts become `success: false`.
    #[instrument(skip_all, fields(action = %action.name()))]
    pub async fn invoke(&self, action: &Action) -> ActionResult {
        let limit = self.time_limit(action);
        let result = match tokio::time::timeout(limit, self.dispatch(action)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => ActionResult::fail(format!("{err:#}")),
            Err(_) => ActionResult::fail(format!("{} timed out after {}ms", action.name(), limit.as_millis())),
        };
        if result.success {
            debug!("action succeeded");
        } else {
            warn!(error = result.error.as_deref().unwrap_or(""), "action failed");
        }
        result
    }

    async fn dispatch(&self, action: &Action) -> anyhow::Result<ActionResult> {
        match action {
            Action::Navigate { url } => page::navigate(self.page()?, url).await,
            Action::Click { selector } => page::click(self.page()?, selector).await,
            Action::Type {
                selector,
                text,
                submit,
            } => page::type_text(self.page()?, selector, text, *submit).await,
            Action::PressKey { key } => page::press_key(self.page()?, key).await,
            Action::Scroll { direction, amount } => {
                page::scroll(self.page()?, *direction, *amount).await
            }
            Action::Screenshot {} => page::screenshot(self.page()?, &self.config.screenshot_dir).await,
            Action::Extract { selector, label } => {
                page::extract(self.page()?, selector.as_deref(), label.as_deref()).await
            }
            Action::ExtractHtml { selector } => {
                page::extract_html(self.page()?, selector.as_deref()).await
            }
            Action::ExtractVision { description } => {
                page::extract_vision(self.page()?, &self.config.screenshot_dir, description.as_deref())
                    .await
            }
            Action::AnswerVision { question } => {
                let oracle = self
                    .oracle
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("no oracle available to answer questions"))?;
                page::answer_vision(
                    self.page()?,
                    oracle,
                    &self.config.screenshot_dir,
                    question,
                    self.config.oracle_timeout(),
                )
                .await
            }
            Action::Wait { ms } => Ok(self.wait(*ms).await),
            Action::RunCommand {
                command,
                cwd,
                timeout_ms,
            } => {
                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.config.action_timeout());
                shell::run_command(
                    command,
                    cwd.as_deref(),
                    timeout,
                    self.config.command_output_limit_bytes,
                )
                .await
            }
            Action::Git { args, cwd } => {
                shell::git(
                    args,
                    cwd.as_deref(),
                    self.config.action_timeout(),
                    self.config.command_output_limit_bytes,
                )
                .await
            }
            Action::StartProcess {
                command,
                cwd,
                ready_pattern,
                timeout_ms,
                max_log_lines,
            } => Ok(processes::start(
                &self.processes,
                command,
                cwd.as_deref(),
                ready_pattern.as_deref(),
                *timeout_ms,
                *max_log_lines,
            )
            .await),
            Action::StopProcess { id } => Ok(processes::stop(&self.processes, id).await),
            Action::ListProcesses {} => Ok(processes::list(&self.processes)),
            Action::ProcessLogs { id, tail } => Ok(processes::logs(&self.processes, id, *tail)),
            Action::Complete { summary } => {
                let summary = summary.clone().unwrap_or_else(|| "Task complete".to_string());
                Ok(ActionResult::ok(summary.clone()).with_payload(json!({ "summary": summary })))
            }
        }
    }

    async fn wait(&self, requested_ms: u64) -> ActionResult {
        let (effective, capped) = clamp_wait(requested_ms, self.config.hard_wait_ceiling_ms);
        if capped {
            info!(requested_ms, effective_ms = effective, capped = true, "wait capped");
        } else {
            debug!(requested_ms, "wait");
        }
        tokio::time::sleep(Duration::from_millis(effective)).await;
        let message = if capped {
            format!("waited {effective}ms (capped from {requested_ms}ms)")
        } else {
            format!("waited {effective}ms")
        };
        ActionResult::ok(message).with_payload(json!({
            "requested_ms": requested_ms,
            "effective_ms": effective,
            "capped": capped,
        }))
    }

    fn time_limit(&self, action: &Action) -> Duration {
        let base = self.config.action_timeout();
        match action {
            Action::StartProcess { timeout_ms, .. } => {
                let start = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.processes.config().default_start_timeout);
                base.max(start + Duration::from_secs(2))
            }
            Action::StopProcess { .. } => {
                base.max(self.processes.config().stop_grace + Duration::from_secs(7))
            }
            Action::RunCommand {
                timeout_ms: Some(ms),
                ..
            } => base.max(Duration::from_millis(*ms) + Duration::from_secs(1)),
            Action::Wait { .. } => {
                base.max(Duration::from_millis(self.config.hard_wait_ceiling_ms) + Duration::from_secs(1))
            }
            _ => base,
        }
    }

    fn page(&self) -> anyhow::Result<&dyn PageDriver> {
        self.page
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no browser attached"))
    }

    /// Current observation: page state when a browser is attached, plus background processes.
    pub async fn observe(&self) -> String {
        let mut parts = Vec::new();
        match &self.page {
            Some(page) => {
                let snapshot =
                    tokio::time::timeout(self.config.action_timeout(), page.snapshot()).await;
                match snapshot {
                    Ok(Ok(state)) => parts.push(state.render(self.config.observation_max_chars)),
                    Ok(Err(err)) => parts.push(format!("Page snapshot unavailable: {err:#}")),
                    Err(_) => parts.push("Page snapshot timed out".to_string()),
                }
            }
            None => parts.push("No browser attached.".to_string()),
        }
        let running = self.processes.list_processes();
        if !running.is_empty() {
            let lines: Vec<String> = running
                .iter()
                .map(|p| {
                    format!(
                        "- {} [{:?}] {}{}",
                        p.id,
                        p.status,
                        p.command,
                        p.url.as_deref().map(|u| format!(" at {u}")).unwrap_or_default()
                    )
                })
                .collect();
            parts.push(format!("Background processes:\n{}", lines.join("\n")));
        }
        parts.join("\n\n")
    }
}
