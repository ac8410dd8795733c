//! Task Planner: task text in, bounded step list out.
//!
//! Oracle output is never trusted. A plan that cannot be extracted is replaced by a
//! deterministic fallback, and every plan is renumbered and length-capped before it
//! reaches the control loop.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, SafetyLimit};
use crate::oracle::{self, ChatMessage, DecisionOracle, extract_json_object};
use crate::prompts::{PLANNER_PROMPT, REPLANNER_PROMPT};
use crate::types::{Complexity, StepKind, TaskPlan, TaskStep};

static URL_IN_TASK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"'<>)\]]+"#).expect("task url regex")
});

pub struct TaskPlanner {
    oracle: Arc<dyn DecisionOracle>,
    config: EngineConfig,
}

impl TaskPlanner {
    pub fn new(oracle: Arc<dyn DecisionOracle>, config: EngineConfig) -> Self {
        Self { oracle, config }
    }

    /// Plan a fresh task. Only an empty description is an error; bad oracle output falls back.
    #[instrument(skip_all)]
    pub async fn plan_task(
        &self,
        description: &str,
        context: Option<&str>,
    ) -> Result<TaskPlan, EngineError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(EngineError::Planning("task description is empty".to_string()));
        }

        let mut request = format!("Task: {description}");
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            request.push_str("\n\nCurrent state:\n");
            request.push_str(context);
        }
        let conversation = [ChatMessage::system(PLANNER_PROMPT), ChatMessage::user(request)];

        let plan = match self.request_plan(description, &conversation).await {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "plan unusable, using fallback plan");
                fallback_plan(description)
            }
        };
        Ok(self.finalize(plan))
    }

    /// Plan only the remaining work of `original`, given what already ran.
    #[instrument(skip_all, fields(completed = completed_steps.len()))]
    pub async fn replan_from_state(
        &self,
        original: &TaskPlan,
        completed_steps: &[String],
        current_context: &str,
        failure_reason: Option<&str>,
    ) -> TaskPlan {
        let window = self.config.replan_history_window;
        let recent = &completed_steps[completed_steps.len().saturating_sub(window)..];
        let mut request = format!("Original task: {}\n\nCompleted steps:\n", original.task);
        if recent.is_empty() {
            request.push_str("(none)\n");
        }
        for line in recent {
            request.push_str("- ");
            request.push_str(line);
            request.push('\n');
        }
        if let Some(reason) = failure_reason {
            request.push_str("\nThe last attempt failed: ");
            request.push_str(reason);
            request.push('\n');
        }
        request.push_str("\nCurrent state:\n");
        request.push_str(current_context);

        let conversation = [ChatMessage::system(REPLANNER_PROMPT), ChatMessage::user(request)];
        let plan = match self.request_plan(&original.task, &conversation).await {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "replan unusable, using fallback plan");
                fallback_plan(&original.task)
            }
        };
        self.finalize(plan)
    }

    async fn request_plan(
        &self,
        task: &str,
        conversation: &[ChatMessage],
    ) -> Result<TaskPlan, EngineError> {
        let raw = oracle::ask(self.oracle.as_ref(), conversation, self.config.oracle_timeout()).await?;
        debug!(chars = raw.len(), "planner reply received");
        let value = extract_json_object(&raw)
            .ok_or_else(|| EngineError::Planning("no JSON object in planner reply".to_string()))?;
        parse_plan(task, &value)
    }

    /// Renumber 1..N and enforce the plan-length cap.
    fn finalize(&self, mut plan: TaskPlan) -> TaskPlan {
        let max = self.config.max_plan_steps;
        if plan.steps.len() > max {
            let limit = SafetyLimit::PlanLength { limit: max };
            warn!(proposed = plan.steps.len(), %limit, "plan too long, truncating");
            plan.steps.truncate(max.saturating_sub(1));
            plan.steps.push(TaskStep::new(
                StepKind::Complete,
                format!("Plan truncated ({limit}); report progress so far"),
            ));
        }
        for (idx, step) in plan.steps.iter_mut().enumerate() {
            step.number = idx + 1;
        }
        info!(steps = plan.steps.len(), fallback = plan.fallback, "plan ready");
        plan
    }
}

fn text_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
}

fn parse_step(raw: &Value) -> Option<TaskStep> {
    if !raw.is_object() {
        return None;
    }
    let kind_name = text_field(raw, &["action", "kind", "type"]);
    let kind = match kind_name.as_deref().map(str::parse::<StepKind>) {
        Some(Ok(kind)) => kind,
        Some(Err(_)) => {
            warn!(kind = kind_name.as_deref().unwrap_or(""), "unknown step kind, treating as verify");
            StepKind::Verify
        }
        None => StepKind::Verify,
    };
    let target = text_field(raw, &["target", "url", "selector", "command"]);
    let description = text_field(raw, &["description", "title", "summary"]).unwrap_or_else(|| {
        match &target {
            Some(target) => format!("{kind} {target}"),
            None => kind.to_string(),
        }
    });
    Some(TaskStep {
        number: 0,
        kind,
        description,
        target,
        value: text_field(raw, &["value", "text", "question"]),
        expected_outcome: text_field(raw, &["expected_outcome", "expectedOutcome"]),
    })
}

fn parse_plan(task: &str, value: &Value) -> Result<TaskPlan, EngineError> {
    let steps: Vec<TaskStep> = value
        .get("steps")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_step).collect())
        .unwrap_or_default();
    if steps.is_empty() {
        return Err(EngineError::Planning("plan has no usable steps".to_string()));
    }
    let complexity = value
        .get("complexity")
        .cloned()
        .and_then(|c| serde_json::from_value::<Complexity>(c).ok())
        .unwrap_or_default();
    let challenges = value
        .get("challenges")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(TaskPlan {
        task: task.to_string(),
        steps,
        complexity,
        challenges,
        fallback: false,
    })
}

/// Deterministic plan for when the oracle gives nothing usable.
pub fn fallback_plan(task: &str) -> TaskPlan {
    let mut steps = Vec::new();
    if let Some(url) = URL_IN_TASK.find(task) {
        let url = url.as_str().trim_end_matches(['.', ',', ';', '!', '?']);
        steps.push(TaskStep::new(StepKind::Navigate, format!("Open {url}")).with_target(url));
    }
    steps.push(TaskStep::new(
        StepKind::ExtractVision,
        format!("Look at the page for: {task}"),
    ));
    steps.push(TaskStep::new(StepKind::Complete, "Report what was found"));
    for (idx, step) in steps.iter_mut().enumerate() {
        step.number = idx + 1;
    }
    TaskPlan {
        task: task.to_string(),
        steps,
        complexity: Complexity::Simple,
        challenges: vec!["planner output was unusable".to_string()],
        fallback: true,
    }
}
