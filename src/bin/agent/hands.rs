use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use parking_lot::Mutex;
use tracing::info;

use task_agent::actions::PageDriver;
use task_agent::types::PageState;

use crate::dom;

const DEBUG_ENDPOINT: &str = "http://127.0.0.1:9222";
const SETTLE_AFTER_NAVIGATE: Duration = Duration::from_millis(1500);
const SETTLE_AFTER_INPUT: Duration = Duration::from_millis(800);

/// Chrome session shared by every task. Each blocking CDP call runs on the blocking pool.
pub struct ChromePage {
    browser: Browser,
    tab: Mutex<Arc<Tab>>,
}

impl ChromePage {
    /// Attach to a Chrome already listening on 9222, otherwise launch one with a
    /// dedicated profile under the cache dir.
    pub fn launch(headless: bool) -> Result<Self> {
        if let Ok(browser) = Browser::connect(DEBUG_ENDPOINT.to_string()) {
            info!("attached to running Chrome");
            let existing = browser
                .get_tabs()
                .lock()
                .map_err(|_| anyhow!("tab list lock poisoned"))?
                .first()
                .cloned();
            let tab = match existing {
                Some(tab) => tab,
                None => browser.new_tab()?,
            };
            return Ok(Self {
                browser,
                tab: Mutex::new(tab),
            });
        }

        let profile = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("task-agent")
            .join("chrome-profile");
        std::fs::create_dir_all(&profile)
            .with_context(|| format!("create profile dir {}", profile.display()))?;
        info!(profile = %profile.display(), headless, "launching Chrome");

        let options = LaunchOptions {
            headless,
            user_data_dir: Some(profile),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };
        let browser = Browser::new(options).map_err(|e| anyhow!("browser launch failed: {e}"))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        Ok(Self {
            browser,
            tab: Mutex::new(tab),
        })
    }

    /// Give the next task a clean tab.
    pub fn new_tab(&self) -> Result<()> {
        let tab = self.browser.new_tab()?;
        *self.tab.lock() = tab;
        Ok(())
    }

    async fn with_tab<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
    {
        let tab = self.tab.lock().clone();
        tokio::task::spawn_blocking(move || op(&tab))
            .await
            .map_err(|e| anyhow!("browser task panicked: {e}"))?
    }
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn navigate(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.with_tab(move |tab| {
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            std::thread::sleep(SETTLE_AFTER_NAVIGATE);
            Ok(())
        })
        .await
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let selector = selector.to_string();
        self.with_tab(move |tab| {
            tab.wait_for_element(&selector)?.click()?;
            std::thread::sleep(SETTLE_AFTER_INPUT);
            Ok(())
        })
        .await
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        let (selector, text) = (selector.to_string(), text.to_string());
        self.with_tab(move |tab| {
            tab.wait_for_element(&selector)?.click()?;
            tab.evaluate(
                &format!(
                    "(() => {{ const el = document.querySelector({}); if (el) el.value = ''; }})()",
                    serde_json::Value::String(selector.clone())
                ),
                false,
            )?;
            tab.type_str(&text)?;
            Ok(())
        })
        .await
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_tab(move |tab| {
            tab.press_key(&key)?;
            std::thread::sleep(SETTLE_AFTER_INPUT);
            Ok(())
        })
        .await
    }

    async fn scroll(&self, delta_y: i64) -> Result<()> {
        self.with_tab(move |tab| dom::scroll_by(tab, delta_y)).await
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        let png = self
            .with_tab(|tab| {
                tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
            })
            .await?;
        tokio::fs::write(path, png)
            .await
            .with_context(|| format!("write {}", path.display()))
    }

    async fn extract_text(&self, selector: Option<&str>) -> Result<String> {
        let selector = selector.map(str::to_string);
        self.with_tab(move |tab| dom::visible_text(tab, selector.as_deref())).await
    }

    async fn extract_html(&self, selector: Option<&str>) -> Result<String> {
        let selector = selector.map(str::to_string);
        self.with_tab(move |tab| dom::outer_html(tab, selector.as_deref())).await
    }

    async fn snapshot(&self) -> Result<PageState> {
        self.with_tab(dom::page_state).await
    }
}
