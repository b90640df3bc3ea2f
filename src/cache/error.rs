use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// Failure of a fetch or action function.
///
/// Stored on the cache entry and handed to every reader, so it is cheap to
/// clone and keeps the message chain of the underlying error rather than the
/// error value itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", .messages.join(": "))]
pub struct FetchError {
    messages: Vec<String>,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }

    /// Capture `error` and every `source()` below it.
    pub fn from_error(error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { messages }
    }

    /// The outermost message.
    pub fn message(&self) -> &str {
        self.messages.first().map(String::as_str).unwrap_or_default()
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}

impl From<String> for FetchError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for FetchError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(error: serde_json::Error) -> Self {
        Self::from_error(&error)
    }
}

impl From<std::io::Error> for FetchError {
    fn from(error: std::io::Error) -> Self {
        Self::from_error(&error)
    }
}

/// Wraps a displayable reason as a `FetchError`.
pub fn fetch_error(reason: impl fmt::Display) -> FetchError {
    FetchError::new(reason.to_string())
}
