//! Deterministic stand-ins for the oracle, the browser and the reporter.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::actions::PageDriver;
use crate::oracle::{ChatMessage, DecisionOracle, OracleReply};
use crate::reporter::{ProgressEvent, ProgressReporter};
use crate::types::{PageState, RunStatus};

/// Replays canned replies in order and records every conversation it was sent.
/// Once the script runs out, every call fails.
#[derive(Default)]
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<String>>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedOracle {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }

    pub fn conversations(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn invoke(&self, conversation: &[ChatMessage]) -> Result<OracleReply> {
        self.seen.lock().push(conversation.to_vec());
        let reply = self
            .replies
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted oracle has no replies left"))?;
        Ok(OracleReply::text(reply))
    }
}

/// In-memory page. Records every interaction except snapshots as a short string.
pub struct FakePage {
    state: Mutex<PageState>,
    text: Mutex<String>,
    html: Mutex<String>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<&'static str, u32>>,
}

impl Default for FakePage {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PageState {
                url: "about:blank".to_string(),
                title: String::new(),
                dom_snapshot: String::new(),
            }),
            text: Mutex::new(String::new()),
            html: Mutex::new("<html><body></body></html>".to_string()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_url(self, url: &str) -> Self {
        self.state.lock().url = url.to_string();
        self
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        *self.text.lock() = text.into();
        self
    }

    pub fn with_html(self, html: impl Into<String>) -> Self {
        *self.html.lock() = html.into();
        self
    }

    /// Every call to `op` (e.g. "click") fails.
    pub fn failing_on(self, op: &'static str) -> Self {
        self.failing_times(op, u32::MAX)
    }

    /// The next `times` calls to `op` fail, later ones succeed.
    pub fn failing_times(self, op: &'static str, times: u32) -> Self {
        self.failures.lock().insert(op, times);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn hit(&self, op: &'static str, detail: String) -> Result<()> {
        self.calls.lock().push(detail);
        let mut failures = self.failures.lock();
        match failures.get_mut(op) {
            Some(left) if *left > 0 => {
                if *left != u32::MAX {
                    *left -= 1;
                }
                bail!("{op} failed (scripted)");
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.hit("navigate", format!("navigate {url}"))?;
        self.state.lock().url = url.to_string();
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.hit("click", format!("click {selector}"))
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        self.hit("type", format!("type {selector} {text}"))
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        self.hit("key", format!("key {key}"))
    }

    async fn scroll(&self, delta_y: i64) -> Result<()> {
        self.hit("scroll", format!("scroll {delta_y}"))
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        self.hit("screenshot", format!("screenshot {}", path.display()))?;
        tokio::fs::write(path, b"\x89PNG\r\n\x1a\n").await?;
        Ok(())
    }

    async fn extract_text(&self, selector: Option<&str>) -> Result<String> {
        self.hit("extract", format!("extract {}", selector.unwrap_or("body")))?;
        Ok(self.text.lock().clone())
    }

    async fn extract_html(&self, selector: Option<&str>) -> Result<String> {
        self.hit("extract_html", format!("extract_html {}", selector.unwrap_or("document")))?;
        Ok(self.html.lock().clone())
    }

    async fn snapshot(&self) -> Result<PageState> {
        Ok(self.state.lock().clone())
    }
}

/// Keeps every progress event for later assertions.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    pub fn statuses(&self) -> Vec<RunStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Status { status } => Some(*status),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&ProgressEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }
}

impl ProgressReporter for RecordingReporter {
    fn on_progress(&self, message: &str) {
        self.events.lock().push(ProgressEvent::Note {
            message: message.to_string(),
        });
    }

    fn on_event(&self, event: &ProgressEvent) {
        self.events.lock().push(event.clone());
    }
}
