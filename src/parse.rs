use chrono::{NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html};
use tokio::task::spawn_blocking;
use tracing::{info, warn};

use crate::config::KeywordConfig;
use crate::locate::{create_selector, visible_text};
use crate::record::MeasurementRecord;
use crate::Result;

/// Tried in order, most specific first. `%m/%d/%Y` deliberately precedes
/// `%d/%m/%Y`, so ambiguous days resolve US-style.
const DATETIME_FORMATS: [(&str, bool); 12] = [
    ("%Y-%m-%d %H:%M:%S", true),
    ("%Y/%m/%d %H:%M:%S", true),
    ("%Y-%m-%d %H:%M", true),
    ("%Y/%m/%d %H:%M", true),
    ("%Y-%m-%d", false),
    ("%Y/%m/%d", false),
    ("%m/%d/%Y %H:%M:%S", true),
    ("%m/%d/%Y %H:%M", true),
    ("%m/%d/%Y", false),
    ("%d/%m/%Y %H:%M:%S", true),
    ("%d/%m/%Y %H:%M", true),
    ("%d/%m/%Y", false),
];

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parses a page snapshot off the async runtime and extracts its records.
pub async fn extract_records(html: String, keywords: KeywordConfig) -> Result<Vec<MeasurementRecord>> {
    let records = spawn_blocking(move || -> Result<Vec<MeasurementRecord>> {
        let doc = Html::parse_document(&html);
        survey_page(&doc)?;
        extract_table(&doc, &keywords)
    })
    .await??;

    Ok(records)
}

/// Finds the glucose table on the page and turns its rows into records.
/// A page without a qualifying table yields no records.
pub fn extract_table(doc: &Html, keywords: &KeywordConfig) -> Result<Vec<MeasurementRecord>> {
    let Some(table) = find_data_table(doc, &keywords.table)? else {
        warn!("no glucose data table found");
        return Ok(Vec::new());
    };

    let rows = table_rows(table)?;
    let Some((header_row, data_rows)) = rows.split_first() else {
        return Ok(Vec::new());
    };

    let headers = header_labels(*header_row)?;
    info!(?headers, "table header");

    let value_idx = find_column_index(&headers, &keywords.value_column);
    let timestamp_idx = find_column_index(&headers, &keywords.timestamp_column);
    info!(?value_idx, ?timestamp_idx, "column mapping");

    let td = create_selector("td")?;
    let cells: Vec<Vec<String>> = data_rows
        .iter()
        .map(|row| row.select(&td).map(|c| visible_text(&c)).collect())
        .collect();

    let records = extract_rows(&cells, value_idx, timestamp_idx);
    info!("extracted {} records", records.len());
    Ok(records)
}

/// First table whose text contains a keyword and that has a data row.
pub fn find_data_table<'a>(doc: &'a Html, keywords: &[String]) -> Result<Option<ElementRef<'a>>> {
    let table_sel = create_selector("table")?;
    let tr = create_selector("tr")?;
    let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();

    for table in doc.select(&table_sel) {
        let text = visible_text(&table).to_lowercase();
        if !keywords.iter().any(|k| text.contains(k.as_str())) {
            continue;
        }
        let row_count = table.select(&tr).count();
        if row_count > 1 {
            info!(rows = row_count, "found glucose data table");
            return Ok(Some(table));
        }
    }
    Ok(None)
}

fn table_rows(table: ElementRef) -> Result<Vec<ElementRef>> {
    let tr = create_selector("tr")?;
    Ok(table.select(&tr).collect())
}

/// `th` texts of the row, or its `td` texts when it has no `th`.
pub fn header_labels(row: ElementRef) -> Result<Vec<String>> {
    let th = create_selector("th")?;
    let td = create_selector("td")?;

    let mut labels: Vec<String> = row.select(&th).map(|c| visible_text(&c)).collect();
    if labels.is_empty() {
        labels = row.select(&td).map(|c| visible_text(&c)).collect();
    }
    Ok(labels)
}

/// Index of the first column whose header contains any keyword, ignoring case.
pub fn find_column_index(headers: &[String], keywords: &[String]) -> Option<usize> {
    headers.iter().position(|header| {
        let header = header.to_lowercase();
        keywords
            .iter()
            .any(|k| header.contains(k.to_lowercase().as_str()))
    })
}

/// Rows too short for the mapped columns and rows without a number are dropped.
pub fn extract_rows(
    rows: &[Vec<String>],
    value_idx: Option<usize>,
    timestamp_idx: Option<usize>,
) -> Vec<MeasurementRecord> {
    let min_cells = value_idx.unwrap_or(0).max(timestamp_idx.unwrap_or(0)) + 1;

    rows.iter()
        .enumerate()
        .filter_map(|(i, cells)| {
            if cells.len() < min_cells {
                return None;
            }
            let Some(value) = value_idx.and_then(|idx| extract_numeric_value(&cells[idx])) else {
                info!(row = i + 1, "dropping row without a numeric value");
                return None;
            };
            let timestamp = timestamp_idx.and_then(|idx| parse_timestamp(&cells[idx]));
            Some(MeasurementRecord::new(value, timestamp, cells.clone()))
        })
        .collect()
}

/// First `123` or `123.45` looking run in the text. Full-width digits and
/// the full-width point count as well.
pub fn extract_numeric_value(text: &str) -> Option<f64> {
    lazy_static! {
        static ref NUMERIC_RE: Regex = Regex::new(r"[0-9０-９]+[.．]?[0-9０-９]*").unwrap();
    }
    NUMERIC_RE
        .find(text)
        .and_then(|m| to_ascii_number(m.as_str()).parse::<f64>().ok())
}

fn to_ascii_number(run: &str) -> String {
    run.chars()
        .map(|c| match c {
            '０'..='９' => char::from(b'0' + (c as u32 - '０' as u32) as u8),
            '．' => '.',
            c => c,
        })
        .collect()
}

/// Normalizes to ISO-8601 when a known format fits, otherwise hands back
/// the text untouched. Empty text has no timestamp.
pub fn parse_timestamp(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    for (format, has_time) in DATETIME_FORMATS {
        let parsed = if has_time {
            NaiveDateTime::parse_from_str(text, format).ok()
        } else {
            NaiveDate::parse_from_str(text, format)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        };
        if let Some(dt) = parsed {
            return Some(dt.format(ISO_FORMAT).to_string());
        }
    }

    warn!(text, "unrecognized timestamp, keeping raw text");
    Some(text.to_string())
}

/// Logs every table and select on the page.
pub fn survey_page(doc: &Html) -> Result<()> {
    let table_sel = create_selector("table")?;
    let select_sel = create_selector("select")?;
    let tr = create_selector("tr")?;
    let option = create_selector("option")?;

    let tables: Vec<_> = doc.select(&table_sel).collect();
    info!("found {} tables", tables.len());
    for (i, table) in tables.iter().enumerate() {
        info!(
            "table {i}: id={:?}, class={:?}, rows={}",
            table.value().attr("id"),
            table.value().attr("class"),
            table.select(&tr).count()
        );
    }

    let selects: Vec<_> = doc.select(&select_sel).collect();
    info!("found {} selects", selects.len());
    for (i, select) in selects.iter().enumerate() {
        info!(
            "select {i}: name={:?}, id={:?}, options={}",
            select.value().attr("name"),
            select.value().attr("id"),
            select.select(&option).count()
        );
    }
    Ok(())
}
