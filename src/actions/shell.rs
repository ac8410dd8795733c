//! One-shot shell and git commands with a timeout and bounded output.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::process::{Signal, resolve_cwd, shell_command, signal_group};
use crate::types::ActionResult;

/// Read-only or local-history git subcommands the agent may run.
pub const GIT_ALLOWED: &[&str] = &[
    "status", "diff", "log", "show", "branch", "add", "commit", "checkout", "switch", "init",
    "rev-parse", "stash", "restore", "remote", "fetch", "pull", "tag",
];

#[derive(Debug)]
struct Captured {
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    truncated: usize,
}

#[instrument(skip_all, fields(command = %command))]
pub(super) async fn run_command(
    command: &str,
    cwd: Option<&str>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ActionResult> {
    if command.trim().is_empty() {
        bail!("run_command needs a command");
    }
    let mut cmd = shell_command(command);
    cmd.current_dir(resolve_cwd(cwd));
    let captured = capture(cmd, timeout, output_limit_bytes).await?;
    Ok(into_result(command, captured))
}

#[instrument(skip_all, fields(args = %args.join(" ")))]
pub(super) async fn git(
    args: &[String],
    cwd: Option<&str>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ActionResult> {
    let subcommand = args
        .first()
        .map(String::as_str)
        .ok_or_else(|| anyhow!("git needs a subcommand"))?;
    if !GIT_ALLOWED.contains(&subcommand) {
        bail!("git subcommand '{subcommand}' is not allowed");
    }
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(resolve_cwd(cwd));
    let captured = capture(cmd, timeout, output_limit_bytes).await?;
    Ok(into_result(&format!("git {}", args.join(" ")), captured))
}

fn into_result(label: &str, captured: Captured) -> ActionResult {
    let payload = json!({
        "exit_code": captured.exit_code,
        "stdout": captured.stdout,
        "stderr": captured.stderr,
        "truncated_bytes": captured.truncated,
    });
    match captured.exit_code {
        Some(0) => ActionResult::ok(format!("`{label}` succeeded")).with_payload(payload),
        Some(code) => {
            ActionResult::fail(format!("`{label}` exited with code {code}")).with_payload(payload)
        }
        None => ActionResult::fail(format!("`{label}` was terminated by a signal"))
            .with_payload(payload),
    }
}

async fn capture(mut cmd: Command, timeout: Duration, limit: usize) -> Result<Captured> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    let mut child = cmd.spawn().context("spawn command")?;
    let pid = child.id();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_task = tokio::spawn(read_limited(stdout, limit));
    let stderr_task = tokio::spawn(read_limited(stderr, limit));

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.context("wait for command")?,
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
            if let Some(pid) = pid
                && let Err(err) = signal_group(pid, Signal::Kill)
            {
                debug!(pid, err = %err, "group kill failed");
            }
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            bail!("command timed out after {}ms", timeout.as_millis());
        }
    };

    let (stdout, out_dropped) = stdout_task.await.context("join stdout reader")??;
    let (stderr, err_dropped) = stderr_task.await.context("join stderr reader")??;
    let truncated = out_dropped + err_dropped;
    if truncated > 0 {
        warn!(truncated, "command output truncated");
    }
    debug!(exit_code = ?status.code(), "command finished");
    Ok(Captured {
        exit_code: status.code(),
        stdout,
        stderr,
        truncated,
    })
}

/// Drain `stream`, keeping at most `limit` bytes. Returns the kept text and the dropped byte count.
async fn read_limited<R: AsyncRead + Unpin>(mut stream: R, limit: usize) -> Result<(String, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut buf = [0u8; 8192];
    loop {
        let n = stream.read(&mut buf).await.context("read output")?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        let take = room.min(n);
        kept.extend_from_slice(&buf[..take]);
        dropped += n - take;
    }
    Ok((String::from_utf8_lossy(&kept).into_owned(), dropped))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const LIMIT: usize = 20_000;

    #[tokio::test]
    async fn captures_stdout() {
        let result = run_command("echo hello", None, Duration::from_secs(5), LIMIT)
            .await
            .expect("run");
        assert!(result.success);
        assert_eq!(result.payload.unwrap()["stdout"], "hello\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_with_output() {
        let result = run_command("echo oops >&2; exit 2", None, Duration::from_secs(5), LIMIT)
            .await
            .expect("run");
        assert!(!result.success);
        assert!(result.error.unwrap().contains("code 2"));
        assert_eq!(result.payload.unwrap()["stderr"], "oops\n");
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = run_command("sleep 5", None, Duration::from_millis(200), LIMIT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn timeout_kills_background_children_too() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("child.pid");
        let command = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let err = run_command(&command, None, Duration::from_millis(300), LIMIT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!is_running(pid), "background sleep {pid} survived the timeout");
    }

    /// Zombies waiting for a reaper count as gone.
    fn is_running(pid: i32) -> bool {
        if unsafe { libc::kill(pid, 0) } != 0 {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn output_is_bounded() {
        let result = run_command("head -c 5000 /dev/zero | tr '\\0' a", None, Duration::from_secs(5), 100)
            .await
            .expect("run");
        let payload = result.payload.unwrap();
        assert_eq!(payload["stdout"].as_str().unwrap().len(), 100);
        assert_eq!(payload["truncated_bytes"], 4900);
    }

    #[tokio::test]
    async fn runs_in_requested_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("marker.txt"), "x").expect("write");
        let result = run_command("ls", dir.path().to_str(), Duration::from_secs(5), LIMIT)
            .await
            .expect("run");
        assert!(result.payload.unwrap()["stdout"].as_str().unwrap().contains("marker.txt"));
    }

    #[tokio::test]
    async fn git_rejects_unlisted_subcommands() {
        let args = vec!["push".to_string(), "--force".to_string()];
        let err = git(&args, None, Duration::from_secs(5), LIMIT).await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
        assert!(git(&[], None, Duration::from_secs(5), LIMIT).await.is_err());
    }

    #[tokio::test]
    async fn git_init_and_status_in_tempdir() {
        if std::process::Command::new("git").arg("--version").output().is_err() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let cwd = dir.path().to_str();
        let init = git(&["init".to_string()], cwd, Duration::from_secs(10), LIMIT)
            .await
            .expect("init");
        assert!(init.success, "{init:?}");
        let status = git(&["status".to_string()], cwd, Duration::from_secs(10), LIMIT)
            .await
            .expect("status");
        assert!(status.success, "{status:?}");
    }
}
