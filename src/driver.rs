//! Live browser access.
//!
//! The session only talks to a [`PageDriver`]; [`WebDriverSession`] is the
//! real one, backed by a WebDriver server (chromedriver by default).

use std::time::Duration;

use async_trait::async_trait;
use fantoccini::elements::Element;
use fantoccini::key::Key;
use fantoccini::wd::TimeoutConfiguration;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::json;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::config::BrowserSettings;
use crate::locate::ElementHandle;
use crate::{Error, Result};

const READY_POLL: Duration = Duration::from_millis(100);

#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;
    async fn current_url(&self) -> Result<String>;
    async fn title(&self) -> Result<String>;
    /// Serialized DOM of the current page.
    async fn source(&self) -> Result<String>;
    /// `document.readyState`
    async fn ready_state(&self) -> Result<String>;

    async fn click(&self, el: &ElementHandle) -> Result<()>;
    async fn clear(&self, el: &ElementHandle) -> Result<()>;
    async fn type_text(&self, el: &ElementHandle, text: &str) -> Result<()>;
    async fn press_enter(&self, el: &ElementHandle) -> Result<()>;
    async fn select_by_value(&self, el: &ElementHandle, value: &str) -> Result<()>;
    async fn select_by_label(&self, el: &ElementHandle, label: &str) -> Result<()>;

    async fn screenshot(&self) -> Result<Vec<u8>>;
    async fn close(&self) -> Result<()>;
}

/// Polls until the page reports `complete`, or fails after `timeout`.
pub async fn wait_until_ready<D: PageDriver + ?Sized>(driver: &D, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if driver.ready_state().await? == "complete" {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::TransientPage("document.readyState == complete".into()));
        }
        sleep(READY_POLL).await;
    }
}

/// Checks the WebDriver `/status` endpoint.
pub async fn webdriver_running(url: &str) -> bool {
    let status_url = format!("{}/status", url.trim_end_matches('/'));
    match reqwest::get(&status_url).await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Cheap to clone, clones share the same browser session.
#[derive(Clone)]
pub struct WebDriverSession {
    client: Client,
}

impl WebDriverSession {
    /// Starts a Chrome session on the WebDriver server at `webdriver_url`.
    pub async fn connect(webdriver_url: &str, browser: &BrowserSettings) -> Result<Self> {
        info!("Connecting to WebDriver at {webdriver_url}");
        if !webdriver_running(webdriver_url).await {
            return Err(Error::WebDriverUnavailable(webdriver_url.into()));
        }

        let mut args = vec![
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-gpu".to_string(),
            format!("--window-size={},{}", browser.window_width, browser.window_height),
        ];
        if browser.headless {
            args.push("--headless=new".to_string());
        }

        let mut caps = serde_json::Map::new();
        caps.insert("goog:chromeOptions".to_string(), json!({ "args": args }));

        let client = ClientBuilder::native()
            .capabilities(caps)
            .connect(webdriver_url)
            .await?;

        client
            .update_timeouts(TimeoutConfiguration::new(
                None,
                Some(browser.page_load_timeout()),
                Some(browser.implicit_wait()),
            ))
            .await?;

        if let Err(e) = client
            .set_window_size(browser.window_width, browser.window_height)
            .await
        {
            debug!("Could not set window size: {e}");
        }

        Ok(Self { client })
    }

    async fn resolve(&self, el: &ElementHandle) -> Result<Element> {
        self.client
            .find_all(Locator::Css(&el.tag))
            .await?
            .into_iter()
            .nth(el.index)
            .ok_or_else(|| Error::StaleElement {
                tag: el.tag.clone(),
                index: el.index,
            })
    }
}

#[async_trait]
impl PageDriver for WebDriverSession {
    async fn goto(&self, url: &str) -> Result<()> {
        info!("Navigating to {url}");
        Ok(self.client.goto(url).await?)
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.client.current_url().await?.to_string())
    }

    async fn title(&self) -> Result<String> {
        Ok(self.client.title().await?)
    }

    async fn source(&self) -> Result<String> {
        Ok(self.client.source().await?)
    }

    async fn ready_state(&self) -> Result<String> {
        let state = self
            .client
            .execute("return document.readyState;", vec![])
            .await?;
        Ok(state.as_str().unwrap_or_default().to_string())
    }

    async fn click(&self, el: &ElementHandle) -> Result<()> {
        Ok(self.resolve(el).await?.click().await?)
    }

    async fn clear(&self, el: &ElementHandle) -> Result<()> {
        Ok(self.resolve(el).await?.clear().await?)
    }

    async fn type_text(&self, el: &ElementHandle, text: &str) -> Result<()> {
        Ok(self.resolve(el).await?.send_keys(text).await?)
    }

    async fn press_enter(&self, el: &ElementHandle) -> Result<()> {
        let enter = char::from(Key::Enter).to_string();
        Ok(self.resolve(el).await?.send_keys(&enter).await?)
    }

    async fn select_by_value(&self, el: &ElementHandle, value: &str) -> Result<()> {
        Ok(self.resolve(el).await?.select_by_value(value).await?)
    }

    async fn select_by_label(&self, el: &ElementHandle, label: &str) -> Result<()> {
        Ok(self.resolve(el).await?.select_by_label(label).await?)
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(self.client.screenshot().await?)
    }

    async fn close(&self) -> Result<()> {
        info!("Closing browser session");
        Ok(self.client.clone().close().await?)
    }
}
