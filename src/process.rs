use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use scraper::Html;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Credentials, OutputFormat, Settings};
use crate::driver::{PageDriver, WebDriverSession};
use crate::locate::{links, FormInventory};
use crate::record::{clean, AggregateSummary, DateFilter, MeasurementRecord, ValidationSummary};
use crate::session::SessionController;
use crate::store::{file_timestamp, DiagnosticSink, FileDiagnostics, RecordStore, FILE_STEM};
use crate::{info_time, Result};

/// What one run produced. `records` are the cleaned ones that got persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub records: Vec<MeasurementRecord>,
    pub validation: ValidationSummary,
    pub summary: Option<AggregateSummary>,
    pub written: Vec<PathBuf>,
}

/// Connects a browser and runs the whole scrape, closing the browser either way.
pub async fn process_site(
    settings: Settings,
    credentials: &Credentials,
    filter: Option<&DateFilter>,
) -> Result<RunReport> {
    let driver = WebDriverSession::connect(&settings.webdriver_url, &settings.browser).await?;
    let res = run_session(driver.clone(), settings, credentials, filter).await;
    if let Err(e) = driver.close().await {
        warn!("Couldn't close the browser: {e}");
    }
    res
}

/// The scrape itself against any driver: login, navigate, filter, extract,
/// then write everything once.
pub async fn run_session<D: PageDriver>(
    driver: D,
    settings: Settings,
    credentials: &Credentials,
    filter: Option<&DateFilter>,
) -> Result<RunReport> {
    let start_time = Local::now();
    info_time!("Started scraping {}", settings.base_url);

    let store = RecordStore::new(&settings.output);
    let format = settings.output.format;
    let diagnostics: Arc<dyn DiagnosticSink> =
        Arc::new(FileDiagnostics::new(&settings.output, &settings.debug));

    let mut session = SessionController::new(driver, settings)?.with_diagnostics(diagnostics);
    session.login(credentials).await?;
    session.navigate_to_data_page().await?;
    if let Some(filter) = filter {
        session.set_date_filter(filter).await?;
    }
    session.extract_data().await?;
    let records = session.into_records();
    info_time!(start_time, "Finished extracting {} records", records.len());

    let validation = ValidationSummary::from_records(&records);
    info!(
        total = validation.total_records,
        valid = validation.valid_count,
        invalid = validation.invalid_count,
        "validation"
    );
    for message in &validation.error_messages {
        warn!("{message}");
    }
    let records = clean(records, Local::now());
    let summary = AggregateSummary::from_records(&records);
    match &summary {
        Some(s) => info!(
            count = s.count,
            average = s.average,
            min = s.minimum,
            max = s.maximum,
            earliest = ?s.earliest_timestamp,
            latest = ?s.latest_timestamp,
            "summary"
        ),
        None => info!("No data to summarize"),
    }

    let written = write_outputs(&store, &records, format, summary.as_ref()).await?;
    Ok(RunReport {
        records,
        validation,
        summary,
        written,
    })
}

async fn write_outputs(
    store: &RecordStore,
    records: &[MeasurementRecord],
    format: OutputFormat,
    summary: Option<&AggregateSummary>,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    if records.is_empty() {
        warn!("No data retrieved, nothing written");
        return Ok(written);
    }
    if format.json() {
        written.push(store.write_json(records, None).await?);
    }
    if format.csv() {
        written.extend(store.write_csv(records, None).await?);
    }
    if let Some(summary) = summary {
        let name = format!("{FILE_STEM}_summary_{}.json", file_timestamp());
        written.push(store.write_summary(summary, &name).await?);
    }
    Ok(written)
}

/// Captures the login page, logs in, and captures what comes after, so the
/// selectors can be tuned by hand.
pub async fn investigate_site(settings: Settings, credentials: &Credentials) -> Result<()> {
    let driver = WebDriverSession::connect(&settings.webdriver_url, &settings.browser).await?;
    let res = investigate(driver.clone(), settings, credentials).await;
    if let Err(e) = driver.close().await {
        warn!("Couldn't close the browser: {e}");
    }
    res
}

pub async fn investigate<D: PageDriver>(
    driver: D,
    settings: Settings,
    credentials: &Credentials,
) -> Result<()> {
    let diagnostics = Arc::new(FileDiagnostics::new(&settings.output, &settings.debug));
    let base_url = settings.base_url.clone();

    driver.goto(&base_url).await?;
    let source = driver.source().await?;
    let page = Html::parse_document(&source);
    let inventory = FormInventory::collect(&page)?;
    inventory.log_login_controls(&page)?;
    for (i, form) in inventory.forms.iter().enumerate() {
        info!("form {i}: action={:?}, method={:?}", form.action, form.method);
    }

    let mut session = SessionController::new(driver, settings)?.with_diagnostics(diagnostics);
    session.capture_now("01_initial_page").await;

    match session.login(credentials).await {
        Ok(()) => {
            session.capture_now("02_after_login").await;
            let driver = session.driver();
            let (url, title) = (driver.current_url().await?, driver.title().await?);
            info!(%url, %title, "after login");
            let page = Html::parse_document(&driver.source().await?);
            for (i, (text, href)) in links(&page)?.iter().enumerate() {
                info!("link {i}: text='{text}', href={href:?}");
            }
        }
        Err(e) => warn!("Login failed during investigation: {e}"),
    }
    Ok(())
}
