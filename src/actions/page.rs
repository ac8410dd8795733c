//! Browser actions, written against the [`PageDriver`] seam.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::ScrollDirection;
use crate::oracle::{self, ChatMessage, DecisionOracle};
use crate::prompts::VISION_ANSWER_PROMPT;
use crate::types::{ActionResult, PageState, truncate_chars};

const EXTRACT_MAX_CHARS: usize = 2_000;
const HTML_MAX_CHARS: usize = 20_000;
const VISION_TEXT_MAX_CHARS: usize = 6_000;
const DEFAULT_SCROLL_PX: i64 = 600;

/// A live browser page. Implementations block however they need to; callers only see async.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;
    async fn click(&self, selector: &str) -> Result<()>;
    /// Clear the element, then type `text` into it.
    async fn type_text(&self, selector: &str, text: &str) -> Result<()>;
    async fn press_key(&self, key: &str) -> Result<()>;
    /// Positive `delta_y` scrolls down; `i64::MIN` and `i64::MAX` jump to the top and bottom.
    async fn scroll(&self, delta_y: i64) -> Result<()>;
    async fn screenshot(&self, path: &Path) -> Result<()>;
    /// Visible text of `selector`, or of the whole body.
    async fn extract_text(&self, selector: Option<&str>) -> Result<String>;
    async fn extract_html(&self, selector: Option<&str>) -> Result<String>;
    async fn snapshot(&self) -> Result<PageState>;
}

pub(super) fn normalize_url(raw: &str) -> Result<String> {
    let url = raw.trim();
    if url.is_empty() {
        bail!("navigate needs a url");
    }
    let lower = url.to_ascii_lowercase();
    if ["http://", "https://", "file://", "about:", "data:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
    {
        return Ok(url.to_string());
    }
    if url.contains(char::is_whitespace) {
        bail!("not a url: {url}");
    }
    Ok(format!("https://{url}"))
}

pub(super) async fn navigate(page: &dyn PageDriver, url: &str) -> Result<ActionResult> {
    let url = normalize_url(url)?;
    page.navigate(&url)
        .await
        .with_context(|| format!("navigate to {url}"))?;
    Ok(ActionResult::ok(format!("navigated to {url}")).with_payload(json!({ "url": url })))
}

pub(super) async fn click(page: &dyn PageDriver, selector: &str) -> Result<ActionResult> {
    page.click(selector)
        .await
        .with_context(|| format!("click {selector}"))?;
    Ok(ActionResult::ok(format!("clicked {selector}")))
}

pub(super) async fn type_text(
    page: &dyn PageDriver,
    selector: &str,
    text: &str,
    submit: bool,
) -> Result<ActionResult> {
    page.type_text(selector, text)
        .await
        .with_context(|| format!("type into {selector}"))?;
    if submit {
        page.press_key("Enter").await.context("submit with Enter")?;
    }
    let suffix = if submit { " and submitted" } else { "" };
    Ok(ActionResult::ok(format!("typed into {selector}{suffix}")))
}

pub(super) async fn press_key(page: &dyn PageDriver, key: &str) -> Result<ActionResult> {
    page.press_key(key)
        .await
        .with_context(|| format!("press {key}"))?;
    Ok(ActionResult::ok(format!("pressed {key}")))
}

pub(super) async fn scroll(
    page: &dyn PageDriver,
    direction: ScrollDirection,
    amount: Option<i64>,
) -> Result<ActionResult> {
    let amount = amount.unwrap_or(DEFAULT_SCROLL_PX).abs();
    let delta = match direction {
        ScrollDirection::Down => amount,
        ScrollDirection::Up => -amount,
        ScrollDirection::Top => i64::MIN,
        ScrollDirection::Bottom => i64::MAX,
    };
    page.scroll(delta).await.context("scroll")?;
    Ok(ActionResult::ok(format!("scrolled {direction:?}").to_lowercase()))
}

fn screenshot_path(dir: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let short = uuid::Uuid::new_v4().simple().to_string();
    dir.join(format!("shot-{stamp}-{}.png", &short[..8]))
}

async fn capture(page: &dyn PageDriver, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create screenshot dir {}", dir.display()))?;
    let path = screenshot_path(dir);
    page.screenshot(&path).await.context("capture screenshot")?;
    debug!(path = %path.display(), "screenshot saved");
    Ok(path)
}

pub(super) async fn screenshot(page: &dyn PageDriver, dir: &Path) -> Result<ActionResult> {
    let path = capture(page, dir).await?;
    Ok(ActionResult::ok(format!("screenshot saved to {}", path.display()))
        .with_payload(json!({ "path": path })))
}

pub(super) async fn extract(
    page: &dyn PageDriver,
    selector: Option<&str>,
    label: Option<&str>,
) -> Result<ActionResult> {
    let text = page
        .extract_text(selector)
        .await
        .with_context(|| format!("extract text from {}", selector.unwrap_or("body")))?;
    let label = label.or(selector).unwrap_or("page text");
    let content: String = text.chars().take(EXTRACT_MAX_CHARS).collect();
    Ok(ActionResult::ok(format!("extracted {} chars as {label}", content.chars().count()))
        .with_payload(json!({ "label": label, "content": content })))
}

pub(super) async fn extract_html(page: &dyn PageDriver, selector: Option<&str>) -> Result<ActionResult> {
    let html = page
        .extract_html(selector)
        .await
        .with_context(|| format!("extract html from {}", selector.unwrap_or("document")))?;
    Ok(ActionResult::ok(format!("extracted {} chars of html", html.chars().count()))
        .with_payload(json!({
            "selector": selector,
            "html": truncate_chars(&html, HTML_MAX_CHARS),
        })))
}

pub(super) async fn extract_vision(
    page: &dyn PageDriver,
    dir: &Path,
    description: Option<&str>,
) -> Result<ActionResult> {
    let path = capture(page, dir).await?;
    let text = page.extract_text(None).await.context("read visible text")?;
    Ok(ActionResult::ok("captured page view").with_payload(json!({
        "path": path,
        "description": description,
        "content": truncate_chars(&text, VISION_TEXT_MAX_CHARS),
    })))
}

pub(super) async fn answer_vision(
    page: &dyn PageDriver,
    oracle: &dyn DecisionOracle,
    dir: &Path,
    question: &str,
    timeout: Duration,
) -> Result<ActionResult> {
    let path = capture(page, dir).await?;
    let state = page.snapshot().await.context("read page state")?;
    let text = page.extract_text(None).await.context("read visible text")?;
    let conversation = [
        ChatMessage::system(VISION_ANSWER_PROMPT),
        ChatMessage::user(format!(
            "Page: {} ({})\n\nVisible text:\n{}\n\nQuestion: {question}",
            state.title,
            state.url,
            truncate_chars(&text, VISION_TEXT_MAX_CHARS),
        )),
    ];
    let answer = oracle::ask(oracle, &conversation, timeout).await?;
    let answer = answer.trim().to_string();
    Ok(ActionResult::ok(answer.clone()).with_payload(json!({
        "path": path,
        "question": question,
        "answer": answer,
    })))
}
