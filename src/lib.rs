//! Blood-glucose record scraper.
//!
//! Logs into the measurement portal with a real browser, finds the data
//! table by heuristics and turns its rows into [`record::MeasurementRecord`]s.

mod error;
mod macros;

pub mod config;
pub mod driver;
pub mod locate;
pub mod parse;
pub mod process;
pub mod record;
pub mod retry;
pub mod session;
pub mod store;

pub use error::{Error, Result};

const BASE_URL: &str = "https://cloud.e-smbg.net/";
const WEBDRIVER_URL: &str = "http://localhost:9515";
