use std::sync::Arc;
use std::time::{Duration, Instant};

use task_agent::actions::ActionRegistry;
use task_agent::config::EngineConfig;
use task_agent::interactive::{InteractiveRunner, SessionStore};
use task_agent::process::{ProcessManager, ProcessStatus};
use task_agent::prompts::RECOVERY_NOTICE;
use task_agent::reporter::ProgressEvent;
use task_agent::runner::TaskRunner;
use task_agent::test_support::{FakePage, RecordingReporter, ScriptedOracle};

struct Harness {
    oracle: Arc<ScriptedOracle>,
    reporter: Arc<RecordingReporter>,
    registry: Arc<ActionRegistry>,
    page: Arc<FakePage>,
    _shots: tempfile::TempDir,
}

impl Harness {
    fn new(replies: Vec<&str>, page: FakePage, tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let shots = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig {
            retry_delay_ms: 0,
            screenshot_dir: shots.path().to_path_buf(),
            ..EngineConfig::default()
        };
        tweak(&mut config);
        let oracle = Arc::new(ScriptedOracle::new(replies));
        let page = Arc::new(page);
        let registry = ActionRegistry::new(config, ProcessManager::default())
            .with_page(page.clone())
            .with_oracle(oracle.clone());
        Self {
            oracle,
            reporter: Arc::new(RecordingReporter::default()),
            registry: Arc::new(registry),
            page,
            _shots: shots,
        }
    }

    fn runner(&self) -> TaskRunner {
        TaskRunner::new(self.oracle.clone(), self.registry.clone(), self.reporter.clone())
    }

    fn interactive(&self) -> InteractiveRunner {
        InteractiveRunner::new(
            self.oracle.clone(),
            self.registry.clone(),
            self.reporter.clone(),
            SessionStore::default(),
        )
    }
}

#[tokio::test]
async fn navigate_screenshot_complete() {
    let plan = r#"{"complexity": "simple", "steps": [
        {"action": "navigate", "description": "Open the site", "target": "https://example.com"},
        {"action": "screenshot", "description": "Capture it"},
        {"action": "complete", "description": "Captured the homepage"}
    ]}"#;
    let h = Harness::new(vec![plan], FakePage::new(), |_| {});
    let result = h.runner().run("Take a screenshot of https://example.com").await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.summary, "Captured the homepage");
    assert_eq!(result.steps_completed.len(), 3);
    assert_eq!(result.screenshots.len(), 1);
    assert!(result.screenshots[0].exists());
    assert_eq!(h.page.calls()[0], "navigate https://example.com");
    assert_eq!(h.oracle.calls(), 1);
}

#[tokio::test]
async fn exhausted_retries_fail_the_run() {
    let click = r##"{"action": "click", "params": {"selector": "#missing"}}"##;
    let plan = r#"{"steps": [{"action": "click", "description": "Press the missing button"}]}"#;
    let h = Harness::new(vec![plan, click, click, click], FakePage::new().failing_on("click"), |c| {
        c.max_retries = 2;
        c.max_replans = 0;
    });
    let result = h.runner().run("press it").await;

    assert!(!result.success);
    let error = result.error.as_deref().expect("error");
    assert!(error.contains("step 1 failed after 2 retries"), "{error}");
    assert_eq!(h.reporter.count(|e| matches!(e, ProgressEvent::Retrying { .. })), 2);
    assert_eq!(h.page.calls().len(), 3);
    assert_eq!(h.oracle.remaining(), 0);
}

#[tokio::test]
async fn failed_step_triggers_a_replan() {
    let plan = r#"{"steps": [{"action": "click", "description": "Open the menu"}]}"#;
    let click = r##"{"action": "click", "params": {"selector": "#menu"}}"##;
    let replan = r#"{"steps": [
        {"action": "screenshot", "description": "Look again"},
        {"action": "complete", "description": "recovered"}
    ]}"#;
    let h = Harness::new(vec![plan, click, replan], FakePage::new().failing_times("click", 1), |c| {
        c.max_retries = 0;
        c.max_replans = 1;
    });
    let result = h.runner().run("open the menu").await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.summary, "recovered");
    assert_eq!(h.reporter.count(|e| matches!(e, ProgressEvent::Replanning { .. })), 1);
    let replan_request = &h.oracle.conversations()[2][1].content;
    assert!(replan_request.contains("The last attempt failed"), "{replan_request}");
}

#[tokio::test]
async fn long_plans_are_truncated() {
    let waits: Vec<String> = (0..10)
        .map(|i| format!(r#"{{"action": "wait", "description": "pause {i}", "value": "1"}}"#))
        .collect();
    let plan = format!(r#"{{"steps": [{}]}}"#, waits.join(","));
    let h = Harness::new(vec![plan.as_str()], FakePage::new(), |c| c.max_plan_steps = 4);
    let result = h.runner().run("wait a lot").await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.steps_completed.len(), 4);
    assert!(result.summary.starts_with("Plan truncated"), "{}", result.summary);
    assert!(h.reporter.events().contains(&ProgressEvent::Planned {
        steps: 4,
        fallback: false
    }));
}

#[tokio::test]
async fn unusable_plan_falls_back() {
    let h = Harness::new(vec!["Sorry, I can't plan that."], FakePage::new(), |_| {});
    let result = h.runner().run("Check the prices on https://example.com/pricing.").await;

    assert!(result.success, "{result:?}");
    assert!(h.reporter.events().contains(&ProgressEvent::Planned {
        steps: 3,
        fallback: true
    }));
    assert_eq!(h.page.calls()[0], "navigate https://example.com/pricing");
    assert_eq!(result.screenshots.len(), 1);
}

#[tokio::test]
async fn long_waits_are_capped() {
    let plan = r#"{"steps": [{"action": "wait", "description": "Wait for the page", "value": "9000"}]}"#;
    let h = Harness::new(vec![plan], FakePage::new(), |c| c.hard_wait_ceiling_ms = 50);
    let started = Instant::now();
    let result = h.runner().run("wait nine seconds").await;

    assert!(result.success, "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(
        result.steps_completed[0].contains("waited 50ms (capped from 9000ms)"),
        "{:?}",
        result.steps_completed
    );
}

#[tokio::test]
async fn unreadable_replies_recover_once_then_fail() {
    let h = Harness::new(
        vec!["Working on it.", "Still looking.", "Hmm.", "Nothing useful."],
        FakePage::new().with_url("https://example.com"),
        |c| c.unknown_response_threshold = 3,
    );
    let result = h.interactive().start("find the docs").await;

    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("could not parse oracle output after 4 attempts")
    );
    let last = h.oracle.conversations().pop().expect("conversation");
    assert!(last.iter().any(|m| m.content.starts_with(RECOVERY_NOTICE)));
}

#[tokio::test]
async fn question_pauses_and_answer_resumes() {
    let h = Harness::new(
        vec![
            r#"{"type": "ask_user", "question": "Which account should I use?"}"#,
            r#"{"action": "screenshot", "params": {}, "reasoning": "record the account page"}"#,
            r#"{"type": "complete", "summary": "Used the work account"}"#,
        ],
        FakePage::new(),
        |_| {},
    );
    let runner = h.interactive();

    let waiting = runner.start("log in").await;
    assert!(waiting.success);
    assert_eq!(waiting.question.as_deref(), Some("Which account should I use?"));
    assert_eq!(waiting.summary, "Waiting for user input: Which account should I use?");
    let session_id = waiting.session_id.clone().expect("session id");
    assert_eq!(runner.sessions().waiting().len(), 1);

    let done = runner.resume(&session_id, "work").await;
    assert!(done.success, "{done:?}");
    assert_eq!(done.summary, "Used the work account");
    assert_eq!(done.screenshots.len(), 1);
    assert!(h.oracle.conversations()[1].iter().any(|m| m.content == "User answer: work"));

    let again = runner.resume(&session_id, "work").await;
    assert!(!again.success);
    assert!(again.summary.contains("is not waiting for input (completed)"), "{}", again.summary);
}

#[tokio::test]
async fn resuming_an_unknown_session_fails() {
    let h = Harness::new(vec![], FakePage::new(), |_| {});
    let result = h.interactive().resume("session-nope", "hello").await;

    assert!(!result.success);
    assert_eq!(result.session_id.as_deref(), Some("session-nope"));
    assert_eq!(result.error.as_deref(), Some("session session-nope not found"));
    assert_eq!(h.oracle.calls(), 0);
}

#[tokio::test]
async fn interactive_tool_calls_hit_the_safety_valve() {
    let wait = r#"{"action": "wait", "params": {"ms": 1}}"#;
    let h = Harness::new(vec![wait; 5], FakePage::new(), |c| c.max_step_executions = 2);
    let result = h.interactive().start("loop forever").await;

    assert!(!result.success);
    assert!(
        result.error.as_deref().unwrap_or("").contains("maximum step executions (2)"),
        "{result:?}"
    );
    assert_eq!(h.oracle.calls(), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn silent_process_is_assumed_running_after_start_timeout() {
    let h = Harness::new(
        vec![
            r#"{"action": "start_process", "params": {"command": "sleep 5", "ready_pattern": "listening on", "timeout_ms": 300}}"#,
            r#"{"type": "complete", "summary": "server up"}"#,
        ],
        FakePage::new(),
        |_| {},
    );
    let result = h.interactive().start("start the dev server").await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.running_processes.len(), 1);
    assert_eq!(result.running_processes[0].status, ProcessStatus::Running);
    assert_eq!(h.registry.processes().shutdown().await, 1);
}
