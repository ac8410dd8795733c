//! Control Loop: planner, resolver and registry driven by an explicit state machine.
//!
//! ```text
//! planning -> executing -> verifying -> executing      (next step / retry)
//!                                    -> replanning -> executing
//!                                    -> completed | failed
//! ```
//!
//! Every exit from `verifying` first checks the global execution counter, so a run
//! always terminates whatever the oracle says. Replanning shares that counter.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::actions::{Action, ActionRegistry};
use crate::config::EngineConfig;
use crate::error::{EngineError, SafetyLimit};
use crate::oracle::DecisionOracle;
use crate::planner::TaskPlanner;
use crate::reporter::{ProgressEvent, ProgressReporter};
use crate::resolver::StepResolver;
use crate::types::{ActionResult, ExecutionState, RunResult, RunStatus, TaskPlan, TaskStep};

pub struct TaskRunner {
    planner: TaskPlanner,
    resolver: StepResolver,
    registry: Arc<ActionRegistry>,
    reporter: Arc<dyn ProgressReporter>,
    config: EngineConfig,
}

/// What one step execution produced, before the verifier looks at it.
struct StepOutcome {
    action: Option<Action>,
    result: Result<ActionResult, EngineError>,
}

/// Per-run bookkeeping beyond [`ExecutionState`].
struct Run {
    state: ExecutionState,
    plan: TaskPlan,
    recent_actions: Vec<String>,
    completion: Option<String>,
}

impl TaskRunner {
    pub fn new(
        oracle: Arc<dyn DecisionOracle>,
        registry: Arc<ActionRegistry>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        let config = registry.config().clone();
        Self {
            planner: TaskPlanner::new(oracle.clone(), config.clone()),
            resolver: StepResolver::new(oracle, config.clone()),
            registry,
            reporter,
            config,
        }
    }

    /// Run `task` to a terminal state. Never fails: every error ends up in the result.
    #[instrument(skip_all, fields(task = %task))]
    pub async fn run(&self, task: &str) -> RunResult {
        let mut state = ExecutionState::new();
        let context = self.registry.observe().await;
        let plan = match self.planner.plan_task(task, Some(&context)).await {
            Ok(plan) => plan,
            Err(err) => {
                error!(error = %err, "planning failed");
                state.last_error = Some(err.to_string());
                if let Err(err) = self.transition(&mut state, RunStatus::Failed) {
                    warn!(error = %err, "could not record planning failure");
                }
                return self.finish(Run {
                    state,
                    plan: TaskPlan {
                        task: task.to_string(),
                        steps: Vec::new(),
                        complexity: Default::default(),
                        challenges: Vec::new(),
                        fallback: false,
                    },
                    recent_actions: Vec::new(),
                    completion: None,
                });
            }
        };
        self.reporter.on_event(&ProgressEvent::Planned {
            steps: plan.len(),
            fallback: plan.fallback,
        });

        let mut run = Run {
            state,
            plan,
            recent_actions: Vec::new(),
            completion: None,
        };
        if let Err(err) = self.drive(&mut run).await {
            error!(error = %err, "control loop aborted");
            run.state.last_error = Some(err.to_string());
            run.state.status = RunStatus::Failed;
        }
        self.finish(run)
    }

    async fn drive(&self, run: &mut Run) -> Result<(), EngineError> {
        self.transition(&mut run.state, RunStatus::Executing)?;
        loop {
            match run.state.status {
                RunStatus::Executing => self.execute(run).await?,
                RunStatus::Verifying => self.verify(run).await?,
                RunStatus::Replanning => self.replan(run).await?,
                RunStatus::Completed | RunStatus::Failed => return Ok(()),
                RunStatus::Planning => {
                    return Err(EngineError::InvalidTransition {
                        from: RunStatus::Planning,
                        to: RunStatus::Executing,
                    });
                }
            }
        }
    }

    async fn execute(&self, run: &mut Run) -> Result<(), EngineError> {
        let Some(step) = run.plan.steps.get(run.state.current_step).cloned() else {
            return Err(EngineError::Planning(format!(
                "step index {} outside a plan of {} steps",
                run.state.current_step,
                run.plan.len()
            )));
        };
        run.state.total_executions += 1;
        self.reporter.on_event(&ProgressEvent::StepStarted {
            number: step.number,
            total: run.plan.len(),
            description: step.description.clone(),
        });

        let outcome = self.execute_step(&step, &run.recent_actions).await;
        self.record(run, &step, outcome);
        self.transition(&mut run.state, RunStatus::Verifying)
    }

    async fn execute_step(&self, step: &TaskStep, recent: &[String]) -> StepOutcome {
        let resolved = match self.resolver.resolve(step, recent, &self.registry).await {
            Ok(resolved) => resolved,
            Err(err) => {
                return StepOutcome {
                    action: None,
                    result: Err(err),
                };
            }
        };
        if let Some(reasoning) = &resolved.reasoning {
            debug!(step = step.number, %reasoning, "oracle reasoning");
        }
        let result = self.registry.invoke(&resolved.action).await;
        StepOutcome {
            action: Some(resolved.action),
            result: Ok(result),
        }
    }

    /// Fold a step outcome into the run state. Success or failure is recorded, not branched on.
    fn record(&self, run: &mut Run, step: &TaskStep, outcome: StepOutcome) {
        let label = outcome
            .action
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| step.kind.to_string());
        let state = &mut run.state;
        match outcome.result {
            Ok(result) if result.success => {
                let detail = result.message.clone().unwrap_or_else(|| "ok".to_string());
                state.completed_steps.push(format!("Step {}: {} -> {}", step.number, step.description, detail));
                if let Some(path) = result.artifact_path() {
                    state.screenshots.push(path);
                }
                if let Some(action) = &outcome.action {
                    if action.yields_data()
                        && let Some(payload) = &result.payload
                    {
                        state.extracted_data.push(tag_payload(step.number, payload));
                    }
                    if matches!(action, Action::Complete { .. }) {
                        run.completion = Some(detail.clone());
                    }
                }
                state.last_error = None;
                run.recent_actions.push(format!("{label} -> ok"));
                self.reporter.on_event(&ProgressEvent::StepFinished {
                    number: step.number,
                    success: true,
                    detail,
                });
            }
            Ok(result) => {
                let error = result.error.unwrap_or_else(|| "action failed".to_string());
                self.record_failure(run, step, &label, EngineError::action(error));
            }
            Err(err) => self.record_failure(run, step, &label, err),
        }
    }

    fn record_failure(&self, run: &mut Run, step: &TaskStep, label: &str, err: EngineError) {
        warn!(step = step.number, error = %err, "step failed");
        let message = err.to_string();
        run.recent_actions.push(format!("{label} -> failed: {message}"));
        self.reporter.on_event(&ProgressEvent::StepFinished {
            number: step.number,
            success: false,
            detail: message.clone(),
        });
        run.state.last_error = Some(message);
    }

    async fn verify(&self, run: &mut Run) -> Result<(), EngineError> {
        let limit = self.config.max_step_executions;
        if run.state.total_executions >= limit {
            let err = EngineError::from(SafetyLimit::TotalExecutions { limit });
            error!(executions = run.state.total_executions, "safety valve tripped");
            run.state.last_error = Some(err.to_string());
            return self.transition(&mut run.state, RunStatus::Failed);
        }

        if let Some(last_error) = run.state.last_error.clone() {
            let number = run.plan.steps.get(run.state.current_step).map_or(0, |s| s.number);
            if run.state.retry_count < self.config.max_retries {
                run.state.retry_count += 1;
                run.state.last_error = None;
                self.reporter.on_event(&ProgressEvent::Retrying {
                    number,
                    attempt: run.state.retry_count,
                    error: last_error,
                });
                tokio::time::sleep(self.config.retry_delay()).await;
                return self.transition(&mut run.state, RunStatus::Executing);
            }
            if run.state.replans < self.config.max_replans {
                return self.transition(&mut run.state, RunStatus::Replanning);
            }
            let limit = SafetyLimit::Retries {
                step: number,
                limit: self.config.max_retries,
            };
            error!(step = number, "retries exhausted");
            run.state.last_error = Some(format!("{}: {last_error}", EngineError::from(limit)));
            return self.transition(&mut run.state, RunStatus::Failed);
        }

        run.state.retry_count = 0;
        if run.completion.is_some() {
            return self.transition(&mut run.state, RunStatus::Completed);
        }
        run.state.current_step += 1;
        if run.state.current_step < run.plan.len() {
            self.transition(&mut run.state, RunStatus::Executing)
        } else {
            self.transition(&mut run.state, RunStatus::Completed)
        }
    }

    async fn replan(&self, run: &mut Run) -> Result<(), EngineError> {
        run.state.replans += 1;
        let reason = run.state.last_error.clone();
        info!(replan = run.state.replans, reason = reason.as_deref().unwrap_or(""), "replanning");
        self.reporter.on_event(&ProgressEvent::Replanning {
            reason: reason.clone().unwrap_or_default(),
        });
        let observation = self.registry.observe().await;
        let plan = self
            .planner
            .replan_from_state(&run.plan, &run.state.completed_steps, &observation, reason.as_deref())
            .await;
        self.reporter.on_event(&ProgressEvent::Planned {
            steps: plan.len(),
            fallback: plan.fallback,
        });
        run.plan = plan;
        run.state.current_step = 0;
        run.state.retry_count = 0;
        run.state.last_error = None;
        self.transition(&mut run.state, RunStatus::Executing)
    }

    fn transition(&self, state: &mut ExecutionState, next: RunStatus) -> Result<(), EngineError> {
        let from = state.status;
        state.transition(next)?;
        debug!(%from, to = %next, "state transition");
        self.reporter.on_event(&ProgressEvent::Status { status: next });
        Ok(())
    }

    fn finish(&self, run: Run) -> RunResult {
        let Run {
            state, completion, ..
        } = run;
        let success = state.status == RunStatus::Completed;
        let summary = if success {
            completion.unwrap_or_else(|| format!("Completed {} step(s)", state.completed_steps.len()))
        } else {
            format!(
                "Task failed: {}",
                state.last_error.as_deref().unwrap_or("unknown error")
            )
        };
        info!(success, steps = state.completed_steps.len(), executions = state.total_executions, "run finished");
        self.reporter.on_event(&ProgressEvent::Finished {
            success,
            summary: summary.clone(),
        });
        RunResult {
            success,
            summary,
            steps_completed: state.completed_steps,
            extracted_data: state.extracted_data,
            screenshots: state.screenshots,
            error: if success { None } else { state.last_error },
            session_id: None,
            question: None,
            running_processes: self.registry.processes().list_processes(),
        }
    }
}

fn tag_payload(step: usize, payload: &Value) -> Value {
    match payload {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert("step".to_string(), json!(step));
            Value::Object(map)
        }
        other => json!({ "step": step, "value": other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessManager;
    use crate::test_support::{FakePage, RecordingReporter, ScriptedOracle};

    fn quick_config() -> EngineConfig {
        EngineConfig {
            retry_delay_ms: 0,
            screenshot_dir: std::env::temp_dir().join("task-agent-runner-tests"),
            ..EngineConfig::default()
        }
    }

    fn runner(
        replies: Vec<String>,
        page: FakePage,
        config: EngineConfig,
    ) -> (TaskRunner, Arc<RecordingReporter>) {
        let oracle = Arc::new(ScriptedOracle::new(replies));
        let registry = ActionRegistry::new(config, ProcessManager::default())
            .with_page(Arc::new(page))
            .with_oracle(oracle.clone());
        let reporter = Arc::new(RecordingReporter::default());
        (
            TaskRunner::new(oracle, Arc::new(registry), reporter.clone()),
            reporter,
        )
    }

    #[tokio::test]
    async fn status_sequence_for_a_clean_run() {
        let plan = r#"{"steps": [{"action": "wait", "description": "pause", "value": "1"}, {"action": "complete", "description": "all good"}]}"#;
        let (runner, reporter) = runner(vec![plan.to_string()], FakePage::new(), quick_config());
        let result = runner.run("pause briefly").await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.summary, "all good");
        assert_eq!(
            reporter.statuses(),
            vec![
                RunStatus::Executing,
                RunStatus::Verifying,
                RunStatus::Executing,
                RunStatus::Verifying,
                RunStatus::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn complete_step_ends_the_run_early() {
        let plan = r#"{"steps": [
            {"action": "complete", "description": "nothing to do"},
            {"action": "screenshot", "description": "never runs"}
        ]}"#;
        let (runner, _) = runner(vec![plan.to_string()], FakePage::new(), quick_config());
        let result = runner.run("trivial").await;
        assert!(result.success);
        assert_eq!(result.steps_completed.len(), 1);
        assert!(result.screenshots.is_empty());
    }

    #[tokio::test]
    async fn extracted_data_is_tagged_with_step() {
        let plan = r#"{"steps": [{"action": "extract", "description": "read", "target": "main", "value": "headline"}]}"#;
        let page = FakePage::new().with_text("Big News");
        let (runner, _) = runner(vec![plan.to_string()], page, quick_config());
        let result = runner.run("read the headline").await;
        assert!(result.success);
        assert_eq!(result.extracted_data.len(), 1);
        assert_eq!(result.extracted_data[0]["step"], 1);
        assert_eq!(result.extracted_data[0]["label"], "headline");
        assert_eq!(result.extracted_data[0]["content"], "Big News");
    }

    #[tokio::test]
    async fn retry_then_recover() {
        let plan = r#"{"steps": [{"action": "click", "description": "press go"}]}"#;
        let replies = vec![
            plan.to_string(),
            "I am not sure".to_string(),
            r##"{"action": "click", "params": {"selector": "#go"}}"##.to_string(),
        ];
        let (runner, reporter) = runner(replies, FakePage::new(), quick_config());
        let result = runner.run("press go").await;
        assert!(result.success, "{result:?}");
        assert_eq!(reporter.count(|e| matches!(e, ProgressEvent::Retrying { .. })), 1);
    }

    #[tokio::test]
    async fn safety_valve_trips_on_the_next_verification() {
        let waits: Vec<String> = (0..10)
            .map(|i| format!(r#"{{"action": "wait", "description": "w{i}", "value": "1"}}"#))
            .collect();
        let plan = format!(r#"{{"steps": [{}]}}"#, waits.join(","));
        let config = EngineConfig {
            max_step_executions: 3,
            ..quick_config()
        };
        let (runner, reporter) = runner(vec![plan], FakePage::new(), config);
        let result = runner.run("many waits").await;
        assert!(!result.success);
        assert_eq!(result.steps_completed.len(), 3);
        assert!(result.error.as_deref().unwrap().contains("maximum step executions (3)"));
        assert_eq!(reporter.statuses().last(), Some(&RunStatus::Failed));
    }

    #[tokio::test]
    async fn replans_share_the_execution_budget() {
        let plan = r#"{"steps": [{"action": "click", "description": "press go"}]}"#;
        let click = r##"{"action": "click", "params": {"selector": "#go"}}"##;
        let waits: Vec<String> = (0..5)
            .map(|i| format!(r#"{{"action": "wait", "description": "w{i}", "value": "1"}}"#))
            .collect();
        let replan = format!(r#"{{"steps": [{}]}}"#, waits.join(","));
        let config = EngineConfig {
            max_step_executions: 3,
            max_retries: 0,
            max_replans: 2,
            ..quick_config()
        };
        let replies = vec![plan.to_string(), click.to_string(), replan];
        let (runner, reporter) = runner(replies, FakePage::new().failing_on("click"), config);
        let result = runner.run("press go").await;

        assert!(!result.success);
        assert!(
            result.error.as_deref().unwrap_or("").contains("maximum step executions (3)"),
            "{result:?}"
        );
        assert_eq!(reporter.count(|e| matches!(e, ProgressEvent::Replanning { .. })), 1);
        assert_eq!(reporter.count(|e| matches!(e, ProgressEvent::StepStarted { .. })), 3);
        assert_eq!(result.steps_completed.len(), 2);
    }

    #[tokio::test]
    async fn empty_task_fails_in_planning() {
        let (runner, reporter) = runner(vec![], FakePage::new(), quick_config());
        let result = runner.run("  ").await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("planning failed"));
        assert_eq!(reporter.statuses(), vec![RunStatus::Failed]);
    }
}
