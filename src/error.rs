use thiserror::Error;

use crate::locate::Role;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Couldn't compile the candidate selector. Selector: {0}")]
    InvalidSelector(String),

    #[error("No element found for role: {0}")]
    NotFound(Role),
    #[error("Element {tag}[{index}] is no longer on the page")]
    StaleElement { tag: String, index: usize },
    #[error("Timed out waiting for: {0}")]
    TransientPage(String),

    #[error("Session failure: {0}")]
    SessionFailure(String),
    #[error("Can't {operation} while the session is {state}")]
    InvalidTransition {
        operation: &'static str,
        state: String,
    },
    #[error("Invalid date filter: {0}")]
    InvalidDateFilter(String),

    #[error("WebDriver command error: {0}")]
    WebDriverCmd(#[from] fantoccini::error::CmdError),
    #[error("WebDriver session error: {0}")]
    WebDriverSession(#[from] fantoccini::error::NewSessionError),
    #[error("WebDriver is not reachable at {0}")]
    WebDriverUnavailable(String),

    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config Error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Tokio Join Error, couldn't await a task! {0}")]
    RuntimeJoin(#[from] tokio::task::JoinError),

    #[error("Reqwest Error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

impl Error {
    /// Errors worth another attempt: the page may simply not have settled yet.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientPage(_) | Error::StaleElement { .. } | Error::WebDriverCmd(_)
        )
    }
}
