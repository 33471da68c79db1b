//! Output files and operator diagnostics.
//!
//! Records are written once per run, through a temporary file that is renamed
//! into place, so a failed write never leaves a half-written output behind.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Local;
use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};

use crate::config::{DebugSettings, OutputSettings};
use crate::locate::FormInventory;
use crate::record::MeasurementRecord;
use crate::Result;

pub const FILE_STEM: &str = "blood_sugar_data";

pub fn file_timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

/// Write a single CSV row to any writer.
pub fn write_row<W: Write>(mut w: W, row: &[String]) -> io::Result<()> {
    let mut first = true;
    for cell in row {
        if !first {
            write!(w, ",")?;
        } else {
            first = false;
        }
        if needs_quotes(cell) {
            write!(w, "\"{}\"", cell.replace('"', "\"\""))?;
        } else {
            write!(w, "{cell}")?;
        }
    }
    writeln!(w)
}

/// Header from the record fields plus one row per record.
/// `None` for an empty record set: there is nothing to write.
pub fn records_to_csv(records: &[MeasurementRecord]) -> Result<Option<String>> {
    if records.is_empty() {
        return Ok(None);
    }
    let mut buf: Vec<u8> = Vec::new();
    let header: Vec<String> = MeasurementRecord::CSV_HEADER
        .iter()
        .map(|h| h.to_string())
        .collect();
    write_row(&mut buf, &header)?;
    for record in records {
        write_row(&mut buf, &record.csv_row()?)?;
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

async fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.as_os_str().is_empty() {
        fs::create_dir_all(dir).await?;
    }
    Ok(())
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Writes records and summaries under the configured data directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    data_dir: PathBuf,
    backup_dir: PathBuf,
}

impl RecordStore {
    pub fn new(output: &OutputSettings) -> Self {
        Self {
            data_dir: output.data_dir.clone(),
            backup_dir: output.backup_dir.clone(),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Copies an existing file to the backup dir before it gets replaced.
    pub async fn backup(&self, path: &Path) -> Result<Option<PathBuf>> {
        let Some(name) = path.file_name() else {
            return Ok(None);
        };
        if fs::metadata(path).await.is_err() {
            return Ok(None);
        }
        ensure_dir(&self.backup_dir).await?;
        let backup = self.backup_dir.join(format!(
            "backup_{}_{}",
            file_timestamp(),
            name.to_string_lossy()
        ));
        fs::copy(path, &backup).await?;
        info!("Backed up {} to {}", path.display(), backup.display());
        Ok(Some(backup))
    }

    /// Pretty JSON, non-ASCII kept as is. `name` defaults to a timestamped one.
    pub async fn write_json(&self, records: &[MeasurementRecord], name: Option<&str>) -> Result<PathBuf> {
        let path = self.path_for(&name.map_or_else(
            || format!("{FILE_STEM}_{}.json", file_timestamp()),
            str::to_string,
        ));
        self.backup(&path).await?;
        write_atomic(&path, to_pretty_json(records)?.as_bytes()).await?;
        info!("Saved {} records to {}", records.len(), path.display());
        Ok(path)
    }

    /// `None` when there are no records; no file is created then.
    pub async fn write_csv(&self, records: &[MeasurementRecord], name: Option<&str>) -> Result<Option<PathBuf>> {
        let Some(contents) = records_to_csv(records)? else {
            warn!("No records, skipping CSV output");
            return Ok(None);
        };
        let path = self.path_for(&name.map_or_else(
            || format!("{FILE_STEM}_{}.csv", file_timestamp()),
            str::to_string,
        ));
        self.backup(&path).await?;
        write_atomic(&path, contents.as_bytes()).await?;
        info!("Saved {} records to {}", records.len(), path.display());
        Ok(Some(path))
    }

    pub async fn write_summary<T: Serialize + Sync>(&self, summary: &T, name: &str) -> Result<PathBuf> {
        let path = self.path_for(name);
        write_atomic(&path, to_pretty_json(summary)?.as_bytes()).await?;
        Ok(path)
    }

    pub async fn read_json(path: &Path) -> Result<Vec<MeasurementRecord>> {
        let text = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// What the session hands over when something needs a human look.
#[derive(Debug, Clone)]
pub struct PageCapture {
    pub url: String,
    pub screenshot: Option<Vec<u8>>,
    pub source: String,
    pub inventory: FormInventory,
}

/// Receives page captures; failures here never fail the run.
#[async_trait]
pub trait DiagnosticSink: Send + Sync {
    async fn capture(&self, label: &str, page: &PageCapture) -> Result<()>;
}

/// Writes screenshots, page sources and form inventories to disk.
#[derive(Debug, Clone)]
pub struct FileDiagnostics {
    output: OutputSettings,
    debug: DebugSettings,
}

impl FileDiagnostics {
    pub fn new(output: &OutputSettings, debug: &DebugSettings) -> Self {
        Self {
            output: output.clone(),
            debug: debug.clone(),
        }
    }

    pub async fn save_screenshot(&self, png: &[u8], label: &str) -> Result<PathBuf> {
        let path = self
            .output
            .screenshot_dir
            .join(format!("screenshot_{label}_{}.png", file_timestamp()));
        write_atomic(&path, png).await?;
        info!("Saved screenshot: {}", path.display());
        Ok(path)
    }

    pub async fn save_page_source(&self, source: &str, label: &str) -> Result<PathBuf> {
        let path = self
            .output
            .page_source_dir
            .join(format!("page_source_{label}_{}.html", file_timestamp()));
        write_atomic(&path, source.as_bytes()).await?;
        info!("Saved page source: {}", path.display());
        Ok(path)
    }

    pub async fn save_form_analysis(&self, inventory: &FormInventory, label: &str) -> Result<PathBuf> {
        let path = self
            .output
            .data_dir
            .join(format!("form_analysis_{label}_{}.json", file_timestamp()));
        write_atomic(&path, to_pretty_json(inventory)?.as_bytes()).await?;
        info!("Saved form analysis: {}", path.display());
        Ok(path)
    }
}

#[async_trait]
impl DiagnosticSink for FileDiagnostics {
    async fn capture(&self, label: &str, page: &PageCapture) -> Result<()> {
        info!(url = %page.url, "capturing diagnostics: {label}");
        if self.debug.save_screenshots {
            if let Some(png) = &page.screenshot {
                self.save_screenshot(png, label).await?;
            }
        }
        if self.debug.save_page_source {
            self.save_page_source(&page.source, label).await?;
        }
        if self.debug.analyze_page_structure {
            self.save_form_analysis(&page.inventory, label).await?;
        }
        Ok(())
    }
}
