//! Supervision of long-running background processes (dev servers, watchers, ...).
//!
//! The manager is the only owner of spawned children. Each child runs in its own
//! process group so termination reaches everything it forked. Callers only ever
//! see plain [`ProcessSnapshot`] data.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\])(?::(\d{2,5}))?[^\s]*")
        .expect("url regex")
});

#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    /// Time between the termination signal and the forced kill.
    pub stop_grace: Duration,
    /// Wait used to capture initial output when no ready pattern is given.
    pub initial_output_delay: Duration,
    pub default_start_timeout: Duration,
    pub default_max_log_lines: usize,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            initial_output_delay: Duration::from_secs(1),
            default_start_timeout: Duration::from_secs(30),
            default_max_log_lines: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

/// Output line that marks a process as started.
#[derive(Debug, Clone)]
pub enum ReadyPattern {
    /// Compiled case-insensitively; treated literally if it is not a valid regex.
    Text(String),
    Regex(Regex),
}

impl ReadyPattern {
    fn compile(&self) -> Regex {
        match self {
            ReadyPattern::Regex(re) => re.clone(),
            ReadyPattern::Text(text) => RegexBuilder::new(text)
                .case_insensitive(true)
                .build()
                .or_else(|_| {
                    RegexBuilder::new(&regex::escape(text))
                        .case_insensitive(true)
                        .build()
                })
                .expect("escaped ready pattern"),
        }
    }
}

impl From<&str> for ReadyPattern {
    fn from(text: &str) -> Self {
        ReadyPattern::Text(text.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub command: String,
    pub cwd: PathBuf,
    pub ready_pattern: Option<ReadyPattern>,
    pub timeout: Duration,
    pub max_log_lines: usize,
}

impl StartRequest {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        let defaults = ProcessManagerConfig::default();
        Self {
            command: command.into(),
            cwd: cwd.into(),
            ready_pattern: None,
            timeout: defaults.default_start_timeout,
            max_log_lines: defaults.default_max_log_lines,
        }
    }

    pub fn ready_pattern(mut self, pattern: impl Into<ReadyPattern>) -> Self {
        self.ready_pattern = Some(pattern.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_log_lines(mut self, lines: usize) -> Self {
        self.max_log_lines = lines;
        self
    }
}

/// Read-only view of a managed process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub id: String,
    pub command: String,
    pub cwd: PathBuf,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub log_lines: usize,
}

/// Result of a manager call. Failures are data, never panics or errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub success: bool,
    pub process: Option<ProcessSnapshot>,
    pub logs: Vec<String>,
    pub error: Option<String>,
}

impl ProcessOutcome {
    fn ok(process: ProcessSnapshot, logs: Vec<String>) -> Self {
        Self {
            success: true,
            process: Some(process),
            logs,
            error: None,
        }
    }

    fn failed(process: Option<ProcessSnapshot>, logs: Vec<String>, error: String) -> Self {
        Self {
            success: false,
            process,
            logs,
            error: Some(error),
        }
    }

    fn not_found() -> Self {
        Self::failed(None, Vec::new(), "not found".to_string())
    }
}

/// Fixed-capacity line buffer; the oldest line goes first.
#[derive(Debug)]
struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    fn len(&self) -> usize {
        self.lines.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct ExitInfo {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitInfo {
    fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("signal {signal}"),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

#[derive(Debug)]
struct Details {
    logs: LogBuffer,
    port: Option<u16>,
    url: Option<String>,
    exit: Option<ExitInfo>,
}

#[derive(Debug)]
struct ManagedProcess {
    id: String,
    command: String,
    cwd: PathBuf,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    details: Mutex<Details>,
    status: watch::Sender<ProcessStatus>,
    exited: watch::Sender<bool>,
    stopping: AtomicBool,
}

impl ManagedProcess {
    fn snapshot(&self) -> ProcessSnapshot {
        let details = self.details.lock();
        ProcessSnapshot {
            id: self.id.clone(),
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            pid: self.pid,
            port: details.port,
            url: details.url.clone(),
            status: *self.status.borrow(),
            started_at: self.started_at,
            exit_code: details.exit.and_then(|e| e.code),
            log_lines: details.logs.len(),
        }
    }

    fn logs(&self, tail: usize) -> Vec<String> {
        self.details.lock().logs.tail(tail)
    }

    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    fn record_line(&self, line: String, ready: Option<&Regex>) {
        let matched = ready.is_some_and(|re| re.is_match(&line));
        {
            let mut details = self.details.lock();
            if details.url.is_none()
                && let Some(caps) = URL_PATTERN.captures(&line)
            {
                details.url = Some(caps[0].trim_end_matches(['.', ',', ')']).to_string());
                details.port = caps.get(1).and_then(|p| p.as_str().parse().ok());
            }
            details.logs.push(line);
        }
        if matched {
            self.promote_to_running();
        }
    }

    /// Starting -> Running. Never overrides a terminal status.
    fn promote_to_running(&self) -> bool {
        self.status.send_if_modified(|status| {
            if *status == ProcessStatus::Starting {
                *status = ProcessStatus::Running;
                true
            } else {
                false
            }
        })
    }

    /// The child has been waited on; its pid must not be signalled any more.
    fn mark_reaped(&self, info: ExitInfo) {
        self.details.lock().exit = Some(info);
        self.exited.send_replace(true);
    }

    /// Final status, once the output readers have drained.
    fn settle(&self) {
        let stopping = self.stopping.load(Ordering::SeqCst);
        let clean = self.details.lock().exit.is_some_and(|e| e.code == Some(0));
        self.status.send_modify(|status| {
            *status = if stopping {
                ProcessStatus::Stopped
            } else if *status == ProcessStatus::Starting || !clean {
                ProcessStatus::Failed
            } else {
                ProcessStatus::Stopped
            };
        });
    }
}

type ProcessTable = Arc<Mutex<HashMap<String, Arc<ManagedProcess>>>>;

/// Process Lifecycle Manager. Cheap to clone; clones share one process table.
#[derive(Clone)]
pub struct ProcessManager {
    processes: ProcessTable,
    config: ProcessManagerConfig,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(ProcessManagerConfig::default())
    }
}

impl ProcessManager {
    pub fn new(config: ProcessManagerConfig) -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &ProcessManagerConfig {
        &self.config
    }

    /// Spawn `command` and return once it is ready, has failed, or the start timeout elapsed.
    #[instrument(skip_all, fields(command = %request.command))]
    pub async fn start_process(&self, request: StartRequest) -> ProcessOutcome {
        let id = format!("proc-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let ready = request.ready_pattern.as_ref().map(ReadyPattern::compile);

        let mut cmd = shell_command(&request.command);
        cmd.current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let spawned = cmd.spawn();
        let (status_tx, _) = watch::channel(ProcessStatus::Starting);
        let (exited_tx, _) = watch::channel(false);
        let mut details = Details {
            logs: LogBuffer::new(request.max_log_lines),
            port: None,
            url: None,
            exit: None,
        };

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                error!(%id, err = %err, "failed to spawn process");
                details.logs.push(format!("spawn failed: {err}"));
                status_tx.send_replace(ProcessStatus::Failed);
                exited_tx.send_replace(true);
                let proc = ManagedProcess {
                    id,
                    command: request.command.clone(),
                    cwd: request.cwd.clone(),
                    pid: None,
                    started_at: Utc::now(),
                    details: Mutex::new(details),
                    status: status_tx,
                    exited: exited_tx,
                    stopping: AtomicBool::new(false),
                };
                return ProcessOutcome::failed(
                    Some(proc.snapshot()),
                    proc.logs(usize::MAX),
                    format!("spawn failed: {err}"),
                );
            }
        };

        let proc = Arc::new(ManagedProcess {
            id: id.clone(),
            command: request.command.clone(),
            cwd: request.cwd.clone(),
            pid: child.id(),
            started_at: Utc::now(),
            details: Mutex::new(details),
            status: status_tx,
            exited: exited_tx,
            stopping: AtomicBool::new(false),
        });
        self.processes.lock().insert(id.clone(), proc.clone());
        info!(%id, pid = ?proc.pid, cwd = %request.cwd.display(), "process spawned");

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, proc.clone(), ready.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, proc.clone(), ready.clone()));
        }

        let monitored = proc.clone();
        let table = self.processes.clone();
        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => exit_info(status),
                Err(err) => {
                    warn!(id = %monitored.id, err = %err, "wait on process failed");
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            monitored.mark_reaped(info);
            // Let the readers drain what the process wrote before it exited.
            for reader in readers {
                let _ = tokio::time::timeout(Duration::from_millis(500), reader).await;
            }
            monitored.settle();
            let mut processes = table.lock();
            if processes
                .get(&monitored.id)
                .is_some_and(|entry| Arc::ptr_eq(entry, &monitored))
            {
                processes.remove(&monitored.id);
            }
            drop(processes);
            debug!(id = %monitored.id, exit = %info.describe(), "process exited, record dropped");
        });

        let wait = if ready.is_some() {
            request.timeout
        } else {
            self.config.initial_output_delay.min(request.timeout)
        };
        let mut status_rx = proc.status.subscribe();
        let settled = tokio::time::timeout(wait, async {
            status_rx
                .wait_for(|s| *s != ProcessStatus::Starting)
                .await
                .map(|s| *s)
        })
        .await;

        match settled {
            Ok(Ok(ProcessStatus::Running)) => {
                info!(%id, "process ready");
                ProcessOutcome::ok(proc.snapshot(), proc.logs(usize::MAX))
            }
            Ok(Ok(_)) | Ok(Err(_)) => {
                let exit = proc
                    .details
                    .lock()
                    .exit
                    .map(|e| e.describe())
                    .unwrap_or_else(|| "unknown exit status".to_string());
                warn!(%id, %exit, "process exited before it was ready");
                ProcessOutcome::failed(
                    Some(proc.snapshot()),
                    proc.logs(usize::MAX),
                    format!("process exited before ready ({exit})"),
                )
            }
            Err(_) => {
                if ready.is_some() {
                    warn!(
                        %id,
                        timeout_ms = wait.as_millis() as u64,
                        "ready pattern not seen before timeout, assuming running"
                    );
                }
                proc.promote_to_running();
                ProcessOutcome::ok(proc.snapshot(), proc.logs(usize::MAX))
            }
        }
    }

    /// Terminate the process group, escalating to a forced kill after the grace period.
    /// An id that is unknown or whose process already exited is "not found".
    #[instrument(skip(self))]
    pub async fn stop_process(&self, id: &str) -> ProcessOutcome {
        self.terminate(id, Some(self.config.stop_grace)).await
    }

    /// `None` skips the termination signal and kills the group straight away.
    async fn terminate(&self, id: &str, grace: Option<Duration>) -> ProcessOutcome {
        let Some(proc) = self.entry(id) else {
            debug!(%id, "stop requested for unknown process");
            return ProcessOutcome::not_found();
        };

        let pid = match proc.pid {
            Some(pid) if !proc.has_exited() => pid,
            _ => {
                self.processes.lock().remove(id);
                debug!(%id, "stop requested for a process that already exited");
                return ProcessOutcome::not_found();
            }
        };

        proc.stopping.store(true, Ordering::SeqCst);
        let mut exited_rx = proc.exited.subscribe();
        let graceful = match grace {
            Some(grace) => {
                if let Err(err) = signal_group(pid, Signal::Terminate) {
                    debug!(pid, err = %err, "terminate signal failed, process may already be gone");
                }
                let exited = tokio::time::timeout(grace, exited_rx.wait_for(|e| *e))
                    .await
                    .is_ok();
                if !exited {
                    warn!(
                        pid,
                        grace_ms = grace.as_millis() as u64,
                        "process ignored termination, killing"
                    );
                }
                exited
            }
            None => false,
        };

        if !graceful && !proc.has_exited() {
            if let Err(err) = signal_group(pid, Signal::Kill) {
                debug!(pid, err = %err, "kill signal failed");
            }
            let killed = tokio::time::timeout(Duration::from_secs(5), exited_rx.wait_for(|e| *e))
                .await
                .is_ok();
            if !killed {
                error!(pid, "process survived forced kill");
                return ProcessOutcome::failed(
                    Some(proc.snapshot()),
                    proc.logs(usize::MAX),
                    "process did not exit after forced kill".to_string(),
                );
            }
        }

        // Give the monitor a moment to record the final status.
        let mut status_rx = proc.status.subscribe();
        let _ = tokio::time::timeout(
            Duration::from_secs(1),
            status_rx.wait_for(|s| matches!(s, ProcessStatus::Stopped | ProcessStatus::Failed)),
        )
        .await;
        self.processes.lock().remove(id);
        info!(pid, graceful, "process stopped");
        ProcessOutcome::ok(proc.snapshot(), proc.logs(usize::MAX))
    }

    pub fn list_processes(&self) -> Vec<ProcessSnapshot> {
        let mut list: Vec<ProcessSnapshot> = self
            .processes
            .lock()
            .values()
            .map(|p| p.snapshot())
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        list
    }

    pub fn get_process(&self, id: &str) -> Option<ProcessSnapshot> {
        self.entry(id).map(|p| p.snapshot())
    }

    pub fn get_process_logs(&self, id: &str, tail_lines: usize) -> Option<Vec<String>> {
        self.entry(id).map(|p| p.logs(tail_lines))
    }

    /// Force-stop every process at once. Returns how many were stopped.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<String> = self.processes.lock().keys().cloned().collect();
        let mut stops = JoinSet::new();
        for id in ids {
            let manager = self.clone();
            stops.spawn(async move { manager.terminate(&id, None).await.success });
        }
        let mut stopped = 0;
        while let Some(joined) = stops.join_next().await {
            if matches!(joined, Ok(true)) {
                stopped += 1;
            }
        }
        info!(stopped, "process manager shut down");
        stopped
    }

    fn entry(&self, id: &str) -> Option<Arc<ManagedProcess>> {
        self.processes.lock().get(id).cloned()
    }
}

fn spawn_reader<R>(stream: R, proc: Arc<ManagedProcess>, ready: Option<Regex>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            proc.record_line(line, ready.as_ref());
        }
    })
}

/// `sh -c` (or `cmd /C`) for a command line.
pub(crate) fn shell_command(command: &str) -> Command {
    #[cfg(unix)]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
    #[cfg(not(unix))]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }
}

pub(crate) fn resolve_cwd(cwd: Option<&str>) -> PathBuf {
    match cwd {
        Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => std::env::current_dir().unwrap_or_else(|_| Path::new(".").to_path_buf()),
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: Signal) -> std::io::Result<()> {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child was spawned as its own group leader, so its pid is the group id.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(pid: u32, signal: Signal) -> std::io::Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/T", "/PID", &pid.to_string()]);
    if matches!(signal, Signal::Kill) {
        cmd.arg("/F");
    }
    cmd.stdout(Stdio::null()).stderr(Stdio::null()).status()?;
    Ok(())
}

#[cfg(unix)]
fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;
    ExitInfo {
        code: status.code(),
        signal: status.signal(),
    }
}

#[cfg(not(unix))]
fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        signal: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_evicts_oldest() {
        let mut buf = LogBuffer::new(3);
        for i in 1..=5 {
            buf.push(format!("line{i}"));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.tail(10), vec!["line3", "line4", "line5"]);
        assert_eq!(buf.tail(1), vec!["line5"]);
    }

    #[test]
    fn text_pattern_is_case_insensitive_and_tolerates_bad_regex() {
        let re = ReadyPattern::from("listening").compile();
        assert!(re.is_match("Server LISTENING on 3000"));
        let literal = ReadyPattern::from("ready (").compile();
        assert!(literal.is_match("READY ( now"));
    }

    #[test]
    fn url_pattern_captures_port() {
        let caps = URL_PATTERN
            .captures("  ➜  Local:   http://localhost:5173/")
            .expect("match");
        assert_eq!(&caps[1], "5173");
    }
}

#[cfg(all(test, unix))]
mod lifecycle_tests {
    use std::time::Instant;

    use super::*;

    fn manager(grace_ms: u64) -> ProcessManager {
        ProcessManager::new(ProcessManagerConfig {
            stop_grace: Duration::from_millis(grace_ms),
            initial_output_delay: Duration::from_millis(200),
            ..ProcessManagerConfig::default()
        })
    }

    fn tmp() -> PathBuf {
        std::env::temp_dir()
    }

    #[tokio::test]
    async fn resolves_early_when_ready_pattern_matches() {
        let pm = manager(1000);
        let started = Instant::now();
        let outcome = pm
            .start_process(
                StartRequest::new(
                    "echo 'Server LISTENING at http://localhost:4321/'; sleep 30",
                    tmp(),
                )
                .ready_pattern("listening")
                .timeout(Duration::from_secs(10)),
            )
            .await;
        assert!(outcome.success, "{outcome:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        let snap = outcome.process.expect("snapshot");
        assert_eq!(snap.status, ProcessStatus::Running);
        assert_eq!(snap.port, Some(4321));
        assert!(outcome.logs.iter().any(|l| l.contains("LISTENING")));

        assert!(pm.stop_process(&snap.id).await.success);
        assert!(pm.list_processes().is_empty());
    }

    #[tokio::test]
    async fn missing_ready_line_resolves_running_at_timeout() {
        let pm = manager(1000);
        let started = Instant::now();
        let outcome = pm
            .start_process(
                StartRequest::new("echo booting; sleep 30", tmp())
                    .ready_pattern("listening")
                    .timeout(Duration::from_millis(2000)),
            )
            .await;
        let elapsed = started.elapsed();
        assert!(outcome.success);
        assert_eq!(
            outcome.process.as_ref().map(|p| p.status),
            Some(ProcessStatus::Running)
        );
        assert!(elapsed >= Duration::from_millis(2000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(4000), "{elapsed:?}");
        pm.shutdown().await;
    }

    #[tokio::test]
    async fn exit_before_ready_is_a_failure_with_logs() {
        let pm = manager(1000);
        let outcome = pm
            .start_process(
                StartRequest::new("echo boom; exit 3", tmp())
                    .ready_pattern("ready")
                    .timeout(Duration::from_secs(5)),
            )
            .await;
        assert!(!outcome.success);
        let error = outcome.error.expect("error");
        assert!(error.contains("exit code 3"), "{error}");
        assert!(outcome.logs.iter().any(|l| l == "boom"));
        let snap = outcome.process.expect("snapshot");
        assert_eq!(snap.status, ProcessStatus::Failed);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_not_thrown() {
        let pm = manager(1000);
        let outcome = pm
            .start_process(StartRequest::new("true", "/definitely/not/a/dir"))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.expect("error").contains("spawn failed"));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let pm = manager(1000);
        let outcome = pm
            .start_process(
                StartRequest::new("echo up; sleep 30", tmp())
                    .ready_pattern("up")
                    .timeout(Duration::from_secs(5)),
            )
            .await;
        let id = outcome.process.expect("snapshot").id;

        assert!(pm.stop_process(&id).await.success);
        let second = pm.stop_process(&id).await;
        assert!(!second.success);
        assert_eq!(second.error.as_deref(), Some("not found"));

        let never = pm.stop_process("proc-missing").await;
        assert!(!never.success);
        assert_eq!(never.error.as_deref(), Some("not found"));
    }

    #[tokio::test]
    async fn escalates_to_kill_after_grace_period() {
        let pm = manager(300);
        let outcome = pm
            .start_process(
                StartRequest::new("trap '' TERM; echo started; sleep 30", tmp())
                    .ready_pattern("started")
                    .timeout(Duration::from_secs(5)),
            )
            .await;
        let id = outcome.process.expect("snapshot").id;

        let started = Instant::now();
        let stopped = pm.stop_process(&id).await;
        assert!(stopped.success, "{stopped:?}");
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(pm.get_process(&id).is_none());
    }

    #[tokio::test]
    async fn default_grace_is_five_seconds() {
        let pm = ProcessManager::default();
        let outcome = pm
            .start_process(
                StartRequest::new("trap '' TERM; echo started; sleep 6; sleep 30", tmp())
                    .ready_pattern("started")
                    .timeout(Duration::from_secs(5)),
            )
            .await;
        let id = outcome.process.expect("snapshot").id;

        let started = Instant::now();
        let stopped = pm.stop_process(&id).await;
        let elapsed = started.elapsed();
        assert!(stopped.success);
        assert!(elapsed >= Duration::from_secs(5), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(8), "{elapsed:?}");
    }

    #[tokio::test]
    async fn log_buffer_is_bounded_per_process() {
        let pm = manager(1000);
        let outcome = pm
            .start_process(
                StartRequest::new(
                    "for i in 1 2 3 4 5 6; do echo line$i; done; sleep 30",
                    tmp(),
                )
                .ready_pattern("line6")
                .max_log_lines(3)
                .timeout(Duration::from_secs(5)),
            )
            .await;
        assert_eq!(outcome.logs, vec!["line4", "line5", "line6"]);
        let id = outcome.process.expect("snapshot").id;
        assert_eq!(
            pm.get_process_logs(&id, 2),
            Some(vec!["line5".to_string(), "line6".to_string()])
        );
        pm.shutdown().await;
    }

    #[tokio::test]
    async fn exited_process_leaves_the_table() {
        let pm = manager(1000);
        let outcome = pm
            .start_process(
                StartRequest::new("echo hi; sleep 0.2", tmp())
                    .ready_pattern("hi")
                    .timeout(Duration::from_secs(5)),
            )
            .await;
        let id = outcome.process.expect("snapshot").id;
        assert!(pm.get_process(&id).is_some());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(pm.get_process(&id).is_none());
        assert!(pm.list_processes().is_empty());
        let stop = pm.stop_process(&id).await;
        assert!(!stop.success);
        assert_eq!(stop.error.as_deref(), Some("not found"));
    }

    #[tokio::test]
    async fn failed_starts_leave_no_records() {
        let pm = manager(1000);
        for _ in 0..5 {
            let outcome = pm
                .start_process(
                    StartRequest::new("echo boom; exit 3", tmp())
                        .ready_pattern("ready")
                        .timeout(Duration::from_secs(5)),
                )
                .await;
            assert!(!outcome.success);
        }
        pm.start_process(StartRequest::new("true", "/definitely/not/a/dir"))
            .await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(pm.list_processes().is_empty(), "{:?}", pm.list_processes());
    }

    #[tokio::test]
    async fn shutdown_kills_stubborn_processes_together() {
        let pm = ProcessManager::default();
        for _ in 0..3 {
            let outcome = pm
                .start_process(
                    StartRequest::new("trap '' TERM; echo started; sleep 60", tmp())
                        .ready_pattern("started")
                        .timeout(Duration::from_secs(5)),
                )
                .await;
            assert!(outcome.success, "{outcome:?}");
        }

        let started = Instant::now();
        assert_eq!(pm.shutdown().await, 3);
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
        assert!(pm.list_processes().is_empty());
    }

    #[tokio::test]
    async fn no_pattern_resolves_after_initial_delay() {
        let pm = manager(1000);
        let started = Instant::now();
        let outcome = pm
            .start_process(StartRequest::new("echo warming; sleep 30", tmp()))
            .await;
        assert!(outcome.success);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(outcome.logs.contains(&"warming".to_string()));
        assert_eq!(pm.shutdown().await, 1);
        assert!(pm.list_processes().is_empty());
    }
}
