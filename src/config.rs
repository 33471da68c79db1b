//! Runtime settings.
//!
//! Built-in defaults are layered under an optional TOML file and `GLUCOSE_*`
//! environment overrides. Candidate selector lists and keyword sets live here
//! so they can be swapped without touching the locator or parser.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::locate::Rule;
use crate::{Result, BASE_URL, WEBDRIVER_URL};

pub const ENV_PREFIX: &str = "GLUCOSE";
pub const USERNAME_VAR: &str = "SCRAPER_USERNAME";
pub const PASSWORD_VAR: &str = "SCRAPER_PASSWORD";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub base_url: String,
    pub webdriver_url: String,
    pub browser: BrowserSettings,
    pub retry: RetryPolicy,
    pub selectors: SelectorConfig,
    pub keywords: KeywordConfig,
    pub output: OutputSettings,
    pub debug: DebugSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: BASE_URL.into(),
            webdriver_url: WEBDRIVER_URL.into(),
            browser: BrowserSettings::default(),
            retry: RetryPolicy::default(),
            selectors: SelectorConfig::default(),
            keywords: KeywordConfig::default(),
            output: OutputSettings::default(),
            debug: DebugSettings::default(),
        }
    }
}

impl Settings {
    /// Loads defaults, then `path` (if it exists), then the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?)
            .add_source(config::File::with_name(path.unwrap_or("config/settings")).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub implicit_wait_secs: u64,
    pub page_load_timeout_secs: u64,
    pub ready_timeout_secs: u64,
    /// Pause after a click that is expected to change the page.
    pub settle_millis: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: false,
            window_width: 1920,
            window_height: 1080,
            implicit_wait_secs: 10,
            page_load_timeout_secs: 30,
            ready_timeout_secs: 15,
            settle_millis: 3000,
        }
    }
}

impl BrowserSettings {
    pub fn implicit_wait(&self) -> Duration {
        Duration::from_secs(self.implicit_wait_secs)
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_millis)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_secs: 5,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Ordered candidate rules per role. Earlier rules win.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub username: Vec<Rule>,
    pub password: Vec<Rule>,
    pub submit: Vec<Rule>,
    pub data_link: Vec<Rule>,
    pub year_select: Vec<Rule>,
    pub month_select: Vec<Rule>,
    pub filter_submit: Vec<Rule>,
}

fn css(rules: &[&str]) -> Vec<Rule> {
    rules.iter().map(|r| Rule::Css(r.to_string())).collect()
}

fn select_keywords(keywords: &[&str]) -> Vec<Rule> {
    keywords
        .iter()
        .map(|k| Rule::AttrKeyword {
            tag: "select".into(),
            attrs: vec!["name".into(), "id".into()],
            keyword: k.to_string(),
        })
        .collect()
}

impl Default for SelectorConfig {
    fn default() -> Self {
        let filter_submit = ["検索", "表示", "Search", "Filter"]
            .iter()
            .flat_map(|k| {
                [
                    Rule::Css(format!(r#"input[type="submit"][value*="{k}"]"#)),
                    Rule::Css(format!(r#"input[type="button"][value*="{k}"]"#)),
                ]
            })
            .collect();

        Self {
            username: css(&[
                r#"input[name*="user"]"#,
                r#"input[id*="user"]"#,
                r#"input[name*="User"]"#,
                r#"input[id*="User"]"#,
                r#"input[name*="login"]"#,
                r#"input[id*="login"]"#,
                r#"input[name*="Login"]"#,
                r#"input[id*="Login"]"#,
                r#"input[name*="id"]"#,
                r#"input[id*="id"]"#,
                r#"input[type="text"]"#,
            ]),
            password: css(&[
                r#"input[name*="pass"]"#,
                r#"input[id*="pass"]"#,
                r#"input[name*="Pass"]"#,
                r#"input[id*="Pass"]"#,
                r#"input[name*="password"]"#,
                r#"input[id*="password"]"#,
                r#"input[name*="Password"]"#,
                r#"input[id*="Password"]"#,
                r#"input[type="password"]"#,
            ]),
            submit: css(&[
                r#"input[type="submit"]"#,
                r#"button[type="submit"]"#,
                r#"input[value*="ログイン"]"#,
                r#"input[value*="Login"]"#,
                r#"button[name*="login"]"#,
                r#"button[id*="login"]"#,
            ]),
            data_link: [
                "血糖値",
                "血糖",
                "データ",
                "記録",
                "履歴",
                "測定値",
                "Blood Sugar",
                "Data",
                "Records",
                "History",
                "Measurements",
            ]
            .iter()
            .map(|t| Rule::LinkText(t.to_string()))
            .collect(),
            year_select: select_keywords(&["year", "年", "yyyy"]),
            month_select: select_keywords(&["month", "月", "mm"]),
            filter_submit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordConfig {
    /// A table qualifies only if its text contains one of these.
    pub table: Vec<String>,
    pub value_column: Vec<String>,
    pub timestamp_column: Vec<String>,
}

fn strings(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            table: strings(&[
                "血糖値",
                "血糖",
                "glucose",
                "mg/dl",
                "mmol/l",
                "測定",
                "日時",
                "時刻",
                "value",
                "measurement",
            ]),
            value_column: strings(&["血糖値", "glucose", "値", "value", "mg/dl"]),
            timestamp_column: strings(&["日時", "時刻", "測定日", "date", "time", "datetime"]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Csv,
    Both,
}

impl OutputFormat {
    pub fn json(&self) -> bool {
        matches!(self, OutputFormat::Json | OutputFormat::Both)
    }

    pub fn csv(&self) -> bool {
        matches!(self, OutputFormat::Csv | OutputFormat::Both)
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "both" => Ok(OutputFormat::Both),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub screenshot_dir: PathBuf,
    pub page_source_dir: PathBuf,
    pub format: OutputFormat,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            data_dir: "data".into(),
            backup_dir: "data/backup".into(),
            screenshot_dir: "screenshots".into(),
            page_source_dir: "page_sources".into(),
            format: OutputFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugSettings {
    pub save_page_source: bool,
    pub save_screenshots: bool,
    pub analyze_page_structure: bool,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            save_page_source: true,
            save_screenshots: true,
            analyze_page_structure: true,
        }
    }
}

/// Portal login pair.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            username: std::env::var(USERNAME_VAR).unwrap_or_else(|_| "your_username".into()),
            password: std::env::var(PASSWORD_VAR).unwrap_or_else(|_| "your_password".into()),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}
