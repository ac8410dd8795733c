//! Step/Action Resolver.
//!
//! Unambiguous step kinds map straight onto an [`Action`]. Everything else goes to
//! the oracle together with the step, the last few actions, the current observation
//! and the action menu; its reply must be `{action, params, reasoning}`.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::actions::{Action, ActionRegistry, ScrollDirection};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::oracle::{self, ChatMessage, DecisionOracle, extract_json_object};
use crate::prompts::RESOLVER_PROMPT;
use crate::types::{StepKind, TaskStep};

const DEFAULT_WAIT_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAction {
    pub action: Action,
    pub reasoning: Option<String>,
    pub via_oracle: bool,
}

pub struct StepResolver {
    oracle: Arc<dyn DecisionOracle>,
    config: EngineConfig,
}

impl StepResolver {
    pub fn new(oracle: Arc<dyn DecisionOracle>, config: EngineConfig) -> Self {
        Self { oracle, config }
    }

    #[instrument(skip_all, fields(step = step.number, kind = %step.kind))]
    pub async fn resolve(
        &self,
        step: &TaskStep,
        recent_actions: &[String],
        registry: &ActionRegistry,
    ) -> Result<ResolvedAction, EngineError> {
        if let Some(action) = resolve_direct(step) {
            debug!(action = %action, "resolved without oracle");
            return Ok(ResolvedAction {
                action,
                reasoning: None,
                via_oracle: false,
            });
        }

        let window = self.config.recent_actions_window;
        let recent = &recent_actions[recent_actions.len().saturating_sub(window)..];
        let observation = registry.observe().await;
        let conversation = [
            ChatMessage::system(format!("{RESOLVER_PROMPT}\n\n{}", registry.menu())),
            ChatMessage::user(step_request(step, recent, &observation)),
        ];
        let raw = oracle::ask(self.oracle.as_ref(), &conversation, self.config.oracle_timeout()).await?;
        let resolved = parse_choice(&raw)?;
        debug!(action = %resolved.action, "resolved by oracle");
        Ok(resolved)
    }
}

/// Deterministic mapping; `None` means the oracle has to decide.
pub fn resolve_direct(step: &TaskStep) -> Option<Action> {
    let target = step.target.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let value = step.value.as_deref().map(str::trim).filter(|v| !v.is_empty());
    let action = match step.kind {
        StepKind::Wait => Action::Wait {
            ms: value.or(target).and_then(parse_millis).unwrap_or(DEFAULT_WAIT_MS),
        },
        StepKind::Screenshot => Action::Screenshot {},
        StepKind::Navigate => Action::Navigate {
            url: target?.to_string(),
        },
        StepKind::Extract => Action::Extract {
            selector: target.map(str::to_string),
            label: value.map(str::to_string),
        },
        StepKind::ExtractVision => Action::ExtractVision {
            description: Some(step.description.clone()),
        },
        StepKind::ExtractHtml => Action::ExtractHtml {
            selector: target.map(str::to_string),
        },
        StepKind::AnswerVision => Action::AnswerVision {
            question: value.unwrap_or(&step.description).to_string(),
        },
        StepKind::Scroll => Action::Scroll {
            direction: value.or(target).map(parse_direction).unwrap_or_default(),
            amount: None,
        },
        StepKind::Complete => Action::Complete {
            summary: Some(step.description.clone()),
        },
        StepKind::Command => Action::RunCommand {
            command: target.or(value)?.to_string(),
            cwd: None,
            timeout_ms: None,
        },
        StepKind::Git => Action::Git {
            args: value
                .or(target)?
                .trim_start_matches("git ")
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            cwd: None,
        },
        StepKind::StartProcess => Action::StartProcess {
            command: target?.to_string(),
            cwd: None,
            ready_pattern: value.map(str::to_string),
            timeout_ms: None,
            max_log_lines: None,
        },
        StepKind::StopProcess => Action::StopProcess {
            id: target.or(value)?.to_string(),
        },
        StepKind::Click | StepKind::Type | StepKind::Verify => return None,
    };
    Some(action)
}

/// "2500", "2500ms", "3s" or "1.5 seconds".
fn parse_millis(raw: &str) -> Option<u64> {
    let lower = raw.trim().to_ascii_lowercase();
    let digits_end = lower
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(lower.len());
    let number: f64 = lower[..digits_end].parse().ok()?;
    let unit = lower[digits_end..].trim();
    let ms = if unit.starts_with('s') {
        number * 1_000.0
    } else {
        number
    };
    (ms >= 0.0).then_some(ms as u64)
}

fn parse_direction(raw: &str) -> ScrollDirection {
    match raw.to_ascii_lowercase().as_str() {
        "up" => ScrollDirection::Up,
        "top" => ScrollDirection::Top,
        "bottom" | "end" => ScrollDirection::Bottom,
        _ => ScrollDirection::Down,
    }
}

fn step_request(step: &TaskStep, recent: &[String], observation: &str) -> String {
    let mut out = format!("Current step {}: {} - {}\n", step.number, step.kind, step.description);
    if let Some(target) = &step.target {
        out.push_str(&format!("Target: {target}\n"));
    }
    if let Some(value) = &step.value {
        out.push_str(&format!("Value: {value}\n"));
    }
    if let Some(expected) = &step.expected_outcome {
        out.push_str(&format!("Expected outcome: {expected}\n"));
    }
    out.push_str("\nRecent actions:\n");
    if recent.is_empty() {
        out.push_str("(none)\n");
    }
    for line in recent {
        out.push_str(&format!("- {line}\n"));
    }
    out.push_str("\nObservation:\n");
    out.push_str(observation);
    out
}

/// Validate an `{action, params, reasoning}` reply.
pub fn parse_choice(raw: &str) -> Result<ResolvedAction, EngineError> {
    let value = extract_json_object(raw)
        .ok_or_else(|| EngineError::protocol("no JSON object in resolver reply"))?;
    let name = value
        .get("action")
        .and_then(Value::as_str)
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| EngineError::protocol("resolver reply has no action"))?;
    let params = match value.get("params") {
        Some(params) => params.clone(),
        None => {
            // Some replies put the params beside the action name.
            let inline: Map<String, Value> = value
                .as_object()
                .into_iter()
                .flatten()
                .filter(|(key, _)| !matches!(key.as_str(), "action" | "reasoning" | "type"))
                .map(|(key, v)| (key.clone(), v.clone()))
                .collect();
            Value::Object(inline)
        }
    };
    let action = Action::from_parts(name, params)?;
    let reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(ResolvedAction {
        action,
        reasoning,
        via_oracle: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessManager;
    use crate::test_support::{FakePage, ScriptedOracle};

    #[test]
    fn deterministic_kinds_skip_the_oracle() {
        let nav = TaskStep::new(StepKind::Navigate, "open").with_target("https://example.com");
        assert_eq!(
            resolve_direct(&nav),
            Some(Action::Navigate {
                url: "https://example.com".to_string()
            })
        );
        let wait = TaskStep::new(StepKind::Wait, "pause").with_value("9000");
        assert_eq!(resolve_direct(&wait), Some(Action::Wait { ms: 9000 }));
        let git = TaskStep::new(StepKind::Git, "status").with_value("git status --short");
        assert_eq!(
            resolve_direct(&git),
            Some(Action::Git {
                args: vec!["status".to_string(), "--short".to_string()],
                cwd: None
            })
        );
    }

    #[test]
    fn ambiguous_kinds_need_the_oracle() {
        assert!(resolve_direct(&TaskStep::new(StepKind::Click, "press login")).is_none());
        assert!(resolve_direct(&TaskStep::new(StepKind::Navigate, "go to the docs")).is_none());
        assert!(resolve_direct(&TaskStep::new(StepKind::Command, "build it")).is_none());
    }

    #[test]
    fn wait_values_accept_units() {
        assert_eq!(parse_millis("2500"), Some(2500));
        assert_eq!(parse_millis("3s"), Some(3000));
        assert_eq!(parse_millis("1.5 seconds"), Some(1500));
        assert_eq!(parse_millis("soon"), None);
    }

    #[test]
    fn choice_with_inline_params_is_accepted() {
        let resolved = parse_choice(r#"{"action": "click", "selector": "[data-eid=\"[e3]\"]"}"#)
            .expect("choice");
        assert_eq!(
            resolved.action,
            Action::Click {
                selector: "[data-eid=\"[e3]\"]".to_string()
            }
        );
    }

    #[test]
    fn unknown_action_name_is_typed() {
        let err = parse_choice(r#"{"action": "fly", "params": {}}"#).unwrap_err();
        assert!(matches!(err, EngineError::UnknownAction(_)));
        let err = parse_choice("no idea").unwrap_err();
        assert!(matches!(err, EngineError::OracleProtocol(_)));
    }

    #[tokio::test]
    async fn oracle_sees_step_history_and_observation() {
        let oracle = Arc::new(ScriptedOracle::new([
            r##"{"action": "type", "params": {"selector": "#q", "text": "rust", "submit": "true"}, "reasoning": "search box"}"##,
        ]));
        let resolver = StepResolver::new(oracle.clone(), EngineConfig::default());
        let page = FakePage::new().with_url("https://example.com");
        let registry = ActionRegistry::new(EngineConfig::default(), ProcessManager::default())
            .with_page(Arc::new(page));
        let step = TaskStep::new(StepKind::Type, "search for rust").with_value("rust");
        let recent: Vec<String> = (1..=7).map(|i| format!("action {i}")).collect();
        let resolved = resolver
            .resolve(&step, &recent, &registry)
            .await
            .expect("resolved");
        assert!(resolved.via_oracle);
        assert_eq!(resolved.reasoning.as_deref(), Some("search box"));
        assert!(matches!(resolved.action, Action::Type { submit: true, .. }));

        let sent = &oracle.conversations()[0];
        assert!(sent[0].content.contains("Available actions"));
        assert!(!sent[1].content.contains("action 2\n"));
        assert!(sent[1].content.contains("action 3") && sent[1].content.contains("action 7"));
        assert!(sent[1].content.contains("https://example.com"));
    }
}
