//! Login, navigation, filtering and extraction against one browser session.
//!
//! ```text
//! Unauthenticated -> Authenticating -> Authenticated -> Navigating -> OnDataPage
//!                                                                   <-> Filtering
//!                                                       OnDataPage -> Extracted
//! ```
//! Any step can end in `Failed`. Nothing is retried at this level beyond the
//! bounded page-load retry; restarting is up to the caller via [`SessionController::reset`].

use std::fmt;
use std::sync::Arc;

use scraper::Html;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::config::{Credentials, Settings};
use crate::driver::{wait_until_ready, PageDriver};
use crate::locate::{links, ElementHandle, FormInventory, FormTokens, Locator, Role};
use crate::parse::extract_records;
use crate::record::{DateFilter, MeasurementRecord};
use crate::retry::with_retry;
use crate::store::{DiagnosticSink, PageCapture};
use crate::{Error, Result};

const LOCATE_POLL: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Navigating,
    OnDataPage,
    Filtering,
    Extracted,
    Failed(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unauthenticated => f.write_str("unauthenticated"),
            SessionState::Authenticating => f.write_str("authenticating"),
            SessionState::Authenticated => f.write_str("authenticated"),
            SessionState::Navigating => f.write_str("navigating"),
            SessionState::OnDataPage => f.write_str("on the data page"),
            SessionState::Filtering => f.write_str("filtering"),
            SessionState::Extracted => f.write_str("extracted"),
            SessionState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Everything one run knows about its browser session.
pub struct SessionContext<D> {
    pub driver: D,
    pub authenticated: bool,
    pub tokens: FormTokens,
    pub records: Vec<MeasurementRecord>,
}

impl<D> SessionContext<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            authenticated: false,
            tokens: FormTokens::default(),
            records: Vec::new(),
        }
    }
}

pub struct SessionController<D> {
    ctx: SessionContext<D>,
    locator: Locator,
    settings: Settings,
    state: SessionState,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

impl<D: PageDriver> SessionController<D> {
    pub fn new(driver: D, settings: Settings) -> Result<Self> {
        Ok(Self {
            ctx: SessionContext::new(driver),
            locator: Locator::new(&settings.selectors)?,
            settings,
            state: SessionState::Unauthenticated,
            diagnostics: None,
        })
    }

    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn context(&self) -> &SessionContext<D> {
        &self.ctx
    }

    pub fn driver(&self) -> &D {
        &self.ctx.driver
    }

    pub fn records(&self) -> &[MeasurementRecord] {
        &self.ctx.records
    }

    pub fn into_records(self) -> Vec<MeasurementRecord> {
        self.ctx.records
    }

    /// Back to `Unauthenticated`, keeping the browser.
    pub fn reset(&mut self) {
        self.ctx.authenticated = false;
        self.ctx.tokens = FormTokens::default();
        self.ctx.records.clear();
        self.state = SessionState::Unauthenticated;
    }

    pub async fn login(&mut self, credentials: &Credentials) -> Result<()> {
        self.expect_state("log in", &[SessionState::Unauthenticated])?;
        self.state = SessionState::Authenticating;
        let res = self.authenticate(credentials).await;
        self.settle(res, SessionState::Authenticated)
    }

    pub async fn navigate_to_data_page(&mut self) -> Result<()> {
        self.expect_state("navigate", &[SessionState::Authenticated])?;
        self.state = SessionState::Navigating;
        let res = self.follow_data_link().await;
        self.settle(res, SessionState::OnDataPage)
    }

    pub async fn set_date_filter(&mut self, filter: &DateFilter) -> Result<()> {
        self.expect_state("filter", &[SessionState::OnDataPage])?;
        self.state = SessionState::Filtering;
        let res = self.apply_filter(filter).await;
        self.settle(res, SessionState::OnDataPage)
    }

    pub async fn extract_data(&mut self) -> Result<&[MeasurementRecord]> {
        self.expect_state("extract", &[SessionState::OnDataPage])?;
        let res = self.extract().await;
        self.settle(res, SessionState::Extracted)?;
        Ok(&self.ctx.records)
    }

    fn expect_state(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    /// Moves to `next` on success, to `Failed` otherwise.
    fn settle(&mut self, res: Result<()>, next: SessionState) -> Result<()> {
        match res {
            Ok(()) => {
                info!("session is now {next}");
                self.state = next;
                Ok(())
            }
            Err(e) => {
                error!("session failed while {}: {e}", self.state);
                self.state = SessionState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<()> {
        let base_url = self.settings.base_url.clone();
        info!("Opening login page");
        self.load(&base_url).await?;

        let driver = &self.ctx.driver;
        let (url, title) = (driver.current_url().await?, driver.title().await?);
        info!(%url, %title, "current page");

        let page = self.snapshot().await?;
        self.ctx.tokens = FormTokens::read(&page);

        let username = self.locate_waiting(Role::Username).await?;
        let password = self.locate_waiting(Role::Password).await?;
        let (Some(username), Some(password)) = (username, password) else {
            let page = self.snapshot().await?;
            FormInventory::collect(&page)?.log_login_controls(&page)?;
            self.capture("login_form_missing").await;
            return Err(Error::SessionFailure("form fields not found".into()));
        };

        let driver = &self.ctx.driver;
        driver.clear(&username).await?;
        driver.type_text(&username, &credentials.username).await?;
        driver.clear(&password).await?;
        driver.type_text(&password, &credentials.password).await?;

        let page = self.snapshot().await?;
        let driver = &self.ctx.driver;
        match self.locator.locate(Role::Submit, &page) {
            Some(submit) => driver.click(&submit).await?,
            None => {
                info!("no submit control, pressing enter in the password field");
                driver.press_enter(&password).await?;
            }
        }
        sleep(self.settings.browser.settle()).await;

        let current = driver.current_url().await?;
        if login_looks_successful(&base_url, &current) {
            info!("login succeeded, now at {current}");
            self.ctx.authenticated = true;
            Ok(())
        } else {
            self.capture("login_rejected").await;
            Err(Error::SessionFailure(format!(
                "still on a login page after submitting: {current}"
            )))
        }
    }

    async fn follow_data_link(&mut self) -> Result<()> {
        info!("Looking for the blood sugar data page");
        let page = self.snapshot().await?;
        let Some(link) = self.locator.locate(Role::DataLink, &page) else {
            for (i, (text, href)) in links(&page)?.iter().enumerate() {
                info!("link {i}: text='{text}', href={href:?}");
            }
            self.capture("data_link_missing").await;
            return Err(Error::NotFound(Role::DataLink));
        };
        info!(label = ?link.descriptor.label, href = ?link.descriptor.href, "following link");

        self.ctx.driver.click(&link).await?;
        sleep(self.settings.browser.settle()).await;
        self.wait_ready().await?;

        let page = self.snapshot().await?;
        self.ctx.tokens = FormTokens::read(&page);
        Ok(())
    }

    async fn apply_filter(&mut self, filter: &DateFilter) -> Result<()> {
        info!("Setting date filter: {filter}");
        let page = self.snapshot().await?;

        if let Some(year) = self.locator.locate(Role::YearSelect, &page) {
            self.choose_option(&year, filter.year()).await?;
            info!("year set: {}", filter.year());
        }
        if let Some(month) = self.locator.locate(Role::MonthSelect, &page) {
            self.choose_option(&month, filter.month()).await?;
            info!("month set: {}", filter.month());
        }

        // Some pages refresh on change and have no button at all.
        let page = self.snapshot().await?;
        if let Some(submit) = self.locator.locate(Role::FilterSubmit, &page) {
            self.ctx.driver.click(&submit).await?;
            sleep(self.settings.browser.settle()).await;
            info!("filter applied");
            let page = self.snapshot().await?;
            self.ctx.tokens = FormTokens::read(&page);
        } else {
            warn!("no filter submit control, relying on the selects alone");
        }
        Ok(())
    }

    /// By value first, then by visible label.
    async fn choose_option(&self, select: &ElementHandle, choice: &str) -> Result<()> {
        let driver = &self.ctx.driver;
        if let Err(e) = driver.select_by_value(select, choice).await {
            info!("no option with value {choice} ({e}), trying the label");
            driver.select_by_label(select, choice).await?;
        }
        Ok(())
    }

    async fn extract(&mut self) -> Result<()> {
        info!("Extracting blood sugar data");
        let driver = &self.ctx.driver;
        let (url, title) = (driver.current_url().await?, driver.title().await?);
        info!(%url, %title, "current page");

        let source = driver.source().await?;
        let records = extract_records(source, self.settings.keywords.clone()).await?;
        info!("extraction done: {} records", records.len());
        self.ctx.records = records;
        Ok(())
    }

    async fn load(&self, url: &str) -> Result<()> {
        let driver = &self.ctx.driver;
        let timeout = self.settings.browser.ready_timeout();
        with_retry(&self.settings.retry, url, move || async move {
            driver.goto(url).await?;
            wait_until_ready(driver, timeout).await
        })
        .await
    }

    async fn wait_ready(&self) -> Result<()> {
        let driver = &self.ctx.driver;
        let timeout = self.settings.browser.ready_timeout();
        with_retry(&self.settings.retry, "page ready", move || {
            wait_until_ready(driver, timeout)
        })
        .await
    }

    async fn snapshot(&self) -> Result<Html> {
        let source = self.ctx.driver.source().await?;
        Ok(Html::parse_document(&source))
    }

    /// Re-inspects the page until the role shows up or the implicit wait runs out.
    async fn locate_waiting(&self, role: Role) -> Result<Option<ElementHandle>> {
        let deadline = Instant::now() + self.settings.browser.implicit_wait();
        loop {
            let page = self.snapshot().await?;
            if let Some(handle) = self.locator.locate(role, &page) {
                return Ok(Some(handle));
            }
            if Instant::now() >= deadline {
                warn!(%role, "element not found");
                return Ok(None);
            }
            sleep(LOCATE_POLL).await;
        }
    }

    /// Best effort; a failing capture is only logged.
    async fn capture(&self, label: &str) {
        let Some(sink) = &self.diagnostics else {
            return;
        };
        match self.page_capture().await {
            Ok(page) => {
                if let Err(e) = sink.capture(label, &page).await {
                    warn!("diagnostic capture failed: {e}");
                }
            }
            Err(e) => warn!("could not read the page for diagnostics: {e}"),
        }
    }

    async fn page_capture(&self) -> Result<PageCapture> {
        let driver = &self.ctx.driver;
        let source = driver.source().await?;
        let inventory = FormInventory::collect(&Html::parse_document(&source))?;
        Ok(PageCapture {
            url: driver.current_url().await?,
            screenshot: driver.screenshot().await.ok(),
            source,
            inventory,
        })
    }

    /// Captures the current page on the operator's request.
    pub async fn capture_now(&self, label: &str) {
        self.capture(label).await
    }
}

/// Fuzzy by nature: left the entry URL and no "login" in the new one.
/// An error page without "login" in its URL passes too.
pub fn login_looks_successful(entry_url: &str, current_url: &str) -> bool {
    current_url != entry_url && !current_url.to_lowercase().contains("login")
}
