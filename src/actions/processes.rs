//! Background-process actions over [`ProcessManager`].

use std::time::Duration;

use serde_json::json;

use crate::process::{ProcessManager, ProcessOutcome, StartRequest, resolve_cwd};
use crate::types::ActionResult;

const LOG_TAIL_IN_RESULT: usize = 20;
const DEFAULT_LOG_TAIL: usize = 50;

fn from_outcome(outcome: ProcessOutcome, message: impl FnOnce(&ProcessOutcome) -> String) -> ActionResult {
    let payload = json!({
        "process": outcome.process,
        "logs": outcome.logs,
    });
    if outcome.success {
        ActionResult::ok(message(&outcome)).with_payload(payload)
    } else {
        let error = outcome.error.clone().unwrap_or_else(|| "process error".to_string());
        ActionResult::fail(error).with_payload(payload)
    }
}

pub(super) async fn start(
    manager: &ProcessManager,
    command: &str,
    cwd: Option<&str>,
    ready_pattern: Option<&str>,
    timeout_ms: Option<u64>,
    max_log_lines: Option<usize>,
) -> ActionResult {
    if command.trim().is_empty() {
        return ActionResult::fail("start_process needs a command");
    }
    let mut request = StartRequest::new(command, resolve_cwd(cwd));
    if let Some(pattern) = ready_pattern.filter(|p| !p.trim().is_empty()) {
        request = request.ready_pattern(pattern);
    }
    if let Some(ms) = timeout_ms {
        request = request.timeout(Duration::from_millis(ms));
    } else {
        request = request.timeout(manager.config().default_start_timeout);
    }
    if let Some(lines) = max_log_lines {
        request = request.max_log_lines(lines);
    }
    let mut outcome = manager.start_process(request).await;
    let skip = outcome.logs.len().saturating_sub(LOG_TAIL_IN_RESULT);
    outcome.logs.drain(..skip);
    from_outcome(outcome, |o| match &o.process {
        Some(p) => match &p.url {
            Some(url) => format!("process {} running at {url}", p.id),
            None => format!("process {} running", p.id),
        },
        None => "process started".to_string(),
    })
}

pub(super) async fn stop(manager: &ProcessManager, id: &str) -> ActionResult {
    let mut outcome = manager.stop_process(id).await;
    outcome.logs.clear();
    from_outcome(outcome, |_| format!("process {id} stopped"))
}

pub(super) fn list(manager: &ProcessManager) -> ActionResult {
    let processes = manager.list_processes();
    ActionResult::ok(format!("{} background process(es)", processes.len()))
        .with_payload(json!({ "processes": processes }))
}

pub(super) fn logs(manager: &ProcessManager, id: &str, tail: Option<usize>) -> ActionResult {
    match manager.get_process_logs(id, tail.unwrap_or(DEFAULT_LOG_TAIL)) {
        Some(lines) => ActionResult::ok(format!("{} log line(s) from {id}", lines.len()))
            .with_payload(json!({ "id": id, "lines": lines })),
        None => ActionResult::fail(format!("process {id} not found")),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_logs_and_stop_round() {
        let manager = ProcessManager::default();
        let started = start(
            &manager,
            "echo 'listening on http://localhost:4321'; sleep 30",
            None,
            Some("listening"),
            Some(5_000),
            None,
        )
        .await;
        assert!(started.success, "{started:?}");
        assert!(started.message.as_deref().unwrap().contains("http://localhost:4321"));
        let id = started.payload.as_ref().unwrap()["process"]["id"]
            .as_str()
            .expect("id")
            .to_string();

        let listed = list(&manager);
        assert_eq!(listed.payload.unwrap()["processes"].as_array().unwrap().len(), 1);

        let tail = logs(&manager, &id, Some(5));
        assert!(tail.success);

        let stopped = stop(&manager, &id).await;
        assert!(stopped.success, "{stopped:?}");
        assert!(manager.list_processes().is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_fail() {
        let manager = ProcessManager::default();
        assert!(!stop(&manager, "nope").await.success);
        assert!(!logs(&manager, "nope", None).success);
        assert!(!start(&manager, "  ", None, None, None, None).await.success);
    }
}
