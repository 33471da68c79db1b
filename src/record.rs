//! Extracted readings and what is derived from them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Plausible reading range, inclusive.
pub const VALUE_RANGE: (f64, f64) = (0.0, 1000.0);

/// One glucose reading taken from a table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementRecord {
    value: f64,
    timestamp: Option<String>,
    raw_cells: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extracted_at: Option<String>,
}

impl MeasurementRecord {
    pub fn new(value: f64, timestamp: Option<String>, raw_cells: Vec<String>) -> Self {
        Self {
            value,
            timestamp,
            raw_cells,
            extracted_at: None,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// ISO-8601 when it parsed, the raw cell text when it didn't.
    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    pub fn raw_cells(&self) -> &[String] {
        &self.raw_cells
    }

    /// Set once the record has been through [`clean`].
    pub fn extracted_at(&self) -> Option<&str> {
        self.extracted_at.as_deref()
    }

    pub const CSV_HEADER: [&'static str; 4] = ["value", "timestamp", "rawCells", "extractedAt"];

    pub fn csv_row(&self) -> Result<Vec<String>> {
        Ok(vec![
            format!("{:?}", self.value),
            self.timestamp.clone().unwrap_or_default(),
            serde_json::to_string(&self.raw_cells)?,
            self.extracted_at.clone().unwrap_or_default(),
        ])
    }
}

/// Keeps the records worth persisting: zero or non-finite values go,
/// the rest are stamped with the extraction time.
pub fn clean(records: Vec<MeasurementRecord>, extracted_at: DateTime<Local>) -> Vec<MeasurementRecord> {
    let stamp = extracted_at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
    records
        .into_iter()
        .filter(|r| r.value != 0.0 && r.value.is_finite())
        .map(|r| MeasurementRecord {
            extracted_at: Some(stamp.clone()),
            ..r
        })
        .collect()
}

/// Year/month to narrow the data view to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFilter {
    year: String,
    month: String,
}

impl DateFilter {
    pub fn new(year: &str, month: &str) -> Result<Self> {
        let year = year.trim();
        let month = month.trim();
        let digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());

        if year.len() != 4 || !digits(year) {
            return Err(Error::InvalidDateFilter(format!("year must be 4 digits: {year}")));
        }
        if !(1..=2).contains(&month.len()) || !digits(month) {
            return Err(Error::InvalidDateFilter(format!(
                "month must be 1-2 digits: {month}"
            )));
        }
        Ok(Self {
            year: year.into(),
            month: month.into(),
        })
    }

    pub fn year(&self) -> &str {
        &self.year
    }

    pub fn month(&self) -> &str {
        &self.month
    }
}

impl FromStr for DateFilter {
    type Err = Error;

    /// Parses `YYYY-MM`.
    fn from_str(s: &str) -> Result<Self> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidDateFilter(format!("expected YYYY-MM: {s}")))?;
        DateFilter::new(year, month)
    }
}

impl fmt::Display for DateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.year, self.month)
    }
}

/// Data-quality report for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub total_records: usize,
    pub valid_count: usize,
    pub invalid_count: usize,
    pub error_messages: Vec<String>,
}

impl ValidationSummary {
    pub fn from_records(records: &[MeasurementRecord]) -> Self {
        let mut error_messages = Vec::new();
        let mut valid_count = 0;

        for (i, record) in records.iter().enumerate() {
            let value = record.value();
            if value == 0.0 || !value.is_finite() {
                error_messages.push(format!("Record {i}: Invalid blood sugar value"));
            } else if value < VALUE_RANGE.0 || value > VALUE_RANGE.1 {
                error_messages.push(format!(
                    "Record {i}: Blood sugar value out of range: {value:?}"
                ));
            } else {
                valid_count += 1;
            }
        }

        Self {
            total_records: records.len(),
            valid_count,
            invalid_count: records.len() - valid_count,
            error_messages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSummary {
    pub count: usize,
    pub average: f64,
    pub minimum: f64,
    pub maximum: f64,
    pub earliest_timestamp: Option<String>,
    pub latest_timestamp: Option<String>,
}

impl AggregateSummary {
    /// `None` when there is nothing to summarize.
    ///
    /// Timestamps are compared as strings. Normalized ones sort by time,
    /// raw fallbacks just sort lexically among them.
    pub fn from_records(records: &[MeasurementRecord]) -> Option<Self> {
        let values: Vec<f64> = records
            .iter()
            .map(MeasurementRecord::value)
            .filter(|v| *v != 0.0)
            .collect();
        if values.is_empty() {
            return None;
        }

        let timestamps = || records.iter().filter_map(MeasurementRecord::timestamp);
        let count = values.len();

        Some(Self {
            count,
            average: values.iter().sum::<f64>() / count as f64,
            minimum: values.iter().copied().fold(f64::INFINITY, f64::min),
            maximum: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            earliest_timestamp: timestamps().min().map(str::to_string),
            latest_timestamp: timestamps().max().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rec(value: f64, ts: Option<&str>) -> MeasurementRecord {
        MeasurementRecord::new(value, ts.map(str::to_string), vec![])
    }

    #[test]
    fn date_filter_parsing() {
        let filter: DateFilter = "2024-3".parse().unwrap();
        assert_eq!(filter.year(), "2024");
        assert_eq!(filter.month(), "3");
        assert_eq!(filter.to_string(), "2024-3");

        assert!("24-03".parse::<DateFilter>().is_err());
        assert!("2024-003".parse::<DateFilter>().is_err());
        assert!("2024/03".parse::<DateFilter>().is_err());
        assert!(DateFilter::new("2024", "").is_err());
    }

    #[test]
    fn validation_flags_zero_and_out_of_range() {
        let records = vec![rec(120.0, None), rec(0.0, None), rec(1200.0, None), rec(95.5, None)];
        let summary = ValidationSummary::from_records(&records);

        assert_eq!(summary.total_records, 4);
        assert_eq!(summary.valid_count, 2);
        assert_eq!(summary.invalid_count, 2);
        assert_eq!(
            summary.error_messages,
            vec![
                "Record 1: Invalid blood sugar value".to_string(),
                "Record 2: Blood sugar value out of range: 1200.0".to_string(),
            ]
        );
    }

    #[test]
    fn aggregate_over_values_and_timestamps() {
        let records = vec![
            rec(100.0, Some("2024-03-02T08:00:00")),
            rec(140.0, None),
            rec(90.0, Some("2024-03-01T07:30:00")),
        ];
        let summary = AggregateSummary::from_records(&records).unwrap();

        assert_eq!(summary.count, 3);
        assert!((summary.average - 110.0).abs() < 1e-9);
        assert_eq!(summary.minimum, 90.0);
        assert_eq!(summary.maximum, 140.0);
        assert_eq!(summary.earliest_timestamp.as_deref(), Some("2024-03-01T07:30:00"));
        assert_eq!(summary.latest_timestamp.as_deref(), Some("2024-03-02T08:00:00"));
    }

    #[test]
    fn cleaning_drops_empty_values_and_stamps_the_rest() {
        let at = Local.with_ymd_and_hms(2024, 3, 5, 9, 15, 0).unwrap();
        let records = vec![rec(120.0, Some("2024-03-01T08:30:00")), rec(0.0, None), rec(98.5, None)];

        let cleaned = clean(records, at);
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0].value(), 120.0);
        assert_eq!(cleaned[0].timestamp(), Some("2024-03-01T08:30:00"));
        assert_eq!(cleaned[1].value(), 98.5);
        assert!(cleaned
            .iter()
            .all(|r| r.extracted_at() == Some("2024-03-05T09:15:00.000000")));

        let json = serde_json::to_value(&cleaned[0]).unwrap();
        assert_eq!(json["extractedAt"], "2024-03-05T09:15:00.000000");
        assert_eq!(
            cleaned[1].csv_row().unwrap(),
            vec!["98.5", "", "[]", "2024-03-05T09:15:00.000000"]
        );
    }

    #[test]
    fn csv_value_keeps_the_decimal() {
        let row = rec(120.0, None).csv_row().unwrap();
        assert_eq!(row[0], "120.0");
        assert_eq!(row[3], "");
    }

    #[test]
    fn aggregate_of_nothing() {
        assert_eq!(AggregateSummary::from_records(&[]), None);
    }

    #[test]
    fn json_field_names() {
        let record = MeasurementRecord::new(
            120.0,
            Some("2024-03-01T08:30:00".into()),
            vec!["2024-03-01 08:30".into(), "120".into()],
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["value"], 120.0);
        assert_eq!(json["timestamp"], "2024-03-01T08:30:00");
        assert_eq!(json["rawCells"][1], "120");
        assert!(json.get("extractedAt").is_none());
    }
}
