//! Error type shared by every tabpilot component.
//!
//! Errors carry a stable machine-readable [`ErrorCode`], a human message, and
//! optional JSON context. Run-level failures never surface as `Error` to a
//! sink; they are folded into a run's `errors` list instead.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_IO")]
    Io,
    #[serde(rename = "E_CONFIG")]
    Config,
    #[serde(rename = "E_STORE")]
    Store,
    #[serde(rename = "E_BROWSER")]
    Browser,
    #[serde(rename = "E_LAUNCH")]
    Launch,
    #[serde(rename = "E_SIGNAL")]
    Signal,
    #[serde(rename = "E_PROTOCOL")]
    Protocol,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Io => "E_IO",
            Self::Config => "E_CONFIG",
            Self::Store => "E_STORE",
            Self::Browser => "E_BROWSER",
            Self::Launch => "E_LAUNCH",
            Self::Signal => "E_SIGNAL",
            Self::Protocol => "E_PROTOCOL",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "E_IO" => Some(Self::Io),
            "E_CONFIG" => Some(Self::Config),
            "E_STORE" => Some(Self::Store),
            "E_BROWSER" => Some(Self::Browser),
            "E_LAUNCH" => Some(Self::Launch),
            "E_SIGNAL" => Some(Self::Signal),
            "E_PROTOCOL" => Some(Self::Protocol),
            _ => None,
        }
    }

    /// Process exit code the CLI uses for this error.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Protocol => 2,
            Self::Config => 3,
            Self::Store => 4,
            Self::Browser => 5,
            Self::Launch => 6,
            Self::Io | Self::Signal => 10,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, Diagnostic)]
#[error("{code}: {message}")]
#[diagnostic(code(tabpilot::error))]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub context: Option<Value>,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn io(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Io, message)
            .with_context(serde_json::json!({ "source": err.to_string() }))
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Config, message)
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Store, message)
    }

    pub fn browser(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Browser, message)
    }

    pub fn launch(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Launch, message)
            .with_context(serde_json::json!({ "source": err.to_string() }))
    }

    pub fn signal(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Signal, message)
            .with_context(serde_json::json!({ "source": err.to_string() }))
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Protocol, message)
    }

    /// Message plus the underlying source, if any. Used when an error is
    /// folded into a run's `errors` list.
    pub fn detail(&self) -> String {
        match self
            .context
            .as_ref()
            .and_then(|ctx| ctx.get("source"))
            .and_then(Value::as_str)
        {
            Some(source) => format!("{}: {source}", self.message),
            None => self.message.clone(),
        }
    }
}
