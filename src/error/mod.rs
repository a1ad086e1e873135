use std::collections::HashMap;
use std::fmt;
use std::io::Error as IoError;

use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use ts_rs::TS;

/// Error shape shared by the queue, the engine and the CLI. Serializes flat
/// so a UI can switch on `code` and show `message` as is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AppError {
    /// `FAMILY/DETAIL`, e.g. `STORE/NOT_FOUND`.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    #[ts(as = "Option<HashMap<String, String>>", optional)]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

// SQLite primary result codes that clear up on their own.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

fn is_busy(sqlite_code: Option<&str>) -> bool {
    sqlite_code
        .and_then(|raw| raw.parse::<i64>().ok())
        .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        .unwrap_or(false)
}

impl AppError {
    /// Code for errors built from a bare message.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            let mut pairs: Vec<_> = self.context.iter().collect();
            pairs.sort();
            let rendered: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, " ({})", rendered.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

/// Keeps an `AppError` carried inside an anyhow chain; anything else becomes
/// `APP/UNKNOWN` with the whole chain as the message.
impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<AppError>() {
            Ok(app) => app,
            Err(other) => AppError::new("APP/UNKNOWN", format!("{other:#}")),
        }
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let mut app_error = AppError::new(format!("IO/{:?}", error.kind()), error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_syntax() || error.is_eof() {
            "JSON/SYNTAX"
        } else if error.is_data() {
            "JSON/DATA"
        } else {
            "JSON/ERROR"
        };
        let mut app_error = AppError::new(code, error.to_string());
        if error.line() > 0 {
            app_error = app_error
                .with_context("line", error.line().to_string())
                .with_context("column", error.column().to_string());
        }
        app_error
    }
}

/// Storage failures surface under `DB/`; store call sites wrap them in their
/// own `STORE/` or `PHOTOS/` code and keep this as the cause.
impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::PoolTimedOut => {
                AppError::new("DB/BUSY", "Timed out waiting for the queue database")
            }
            SqlxError::PoolClosed => AppError::new("DB/CLOSED", "Queue database is closed"),
            SqlxError::ColumnNotFound(name) => {
                AppError::new("DB/SCHEMA", format!("Column not found: {name}"))
            }
            SqlxError::ColumnDecode { index, source } => {
                AppError::new("DB/DECODE", source.to_string()).with_context("column", index.to_string())
            }
            SqlxError::Io(err) => AppError::new("DB/IO", err.to_string()).with_cause(err),
            SqlxError::Database(db) => {
                let sqlite_code = db.code().map(|c| c.into_owned());
                let code = if is_busy(sqlite_code.as_deref()) {
                    "DB/BUSY"
                } else if db.constraint().is_some() {
                    "DB/CONSTRAINT"
                } else {
                    "DB/SQLITE"
                };
                let mut app_error = AppError::new(code, db.message().to_string());
                if let Some(raw) = sqlite_code {
                    app_error = app_error.with_context("sqlite_code", raw);
                }
                if let Some(constraint) = db.constraint() {
                    app_error = app_error.with_context("constraint", constraint.to_string());
                }
                app_error
            }
            other => AppError::new("DB/ERROR", other.to_string()),
        }
    }
}
