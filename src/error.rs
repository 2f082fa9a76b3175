use thiserror::Error;

/// A single failed fetch attempt. Always retryable.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("HTTP status {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("browser error: {0}")]
    Browser(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// Every fetch attempt failed. Fatal to the run.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("failed to fetch {url} after {attempts} attempts, last error: {last}")]
pub struct FetchError {
    pub url: String,
    pub attempts: u32,
    pub last: TransportError,
}

/// Non-fatal extraction problems. The run still finishes, with zero videos.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExtractDiagnostic {
    #[error("state script #{script_id} not found, page layout may have changed")]
    LayoutChanged { script_id: String },

    #[error("state script could not be parsed: {0}")]
    MalformedState(String),
}

/// A raw item that cannot produce a stable url key.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("item under key {key:?} has no identifier")]
pub struct InvalidRecord {
    pub key: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Init(String),

    #[error("failed to read existing keys: {0}")]
    Read(String),

    #[error("append failed after {appended} rows: {message}")]
    Write { appended: usize, message: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Write {
            appended: 0,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be set")]
    Missing { name: &'static str },

    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

/// Failures that escape a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("store write failed after {appended} rows: {message}")]
    StoreWrite { appended: usize, message: String },
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Fetch(_) => "FETCH_EXHAUSTED",
            PipelineError::StoreWrite { .. } => "STORE_WRITE_FAILED",
        }
    }
}
