use oauth2::basic::BasicErrorResponseType;
use oauth2::reqwest::Error as ReqwestClientError;
use oauth2::{HttpClientError, RequestTokenError, StandardErrorResponse};
use sqlx::Error as SqlxError;
use std::time::Duration;
use thiserror::Error as ThisError;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, ThisError)]
pub enum StoreError {
    /// No credential source produced a usable token.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The connection parameters were rejected before any connection was opened.
    #[error("engine creation failed: {0}")]
    EngineCreation(String),

    /// Insert or commit failed; the transaction was rolled back.
    #[error("write to table {table} failed: {source}")]
    StorageWrite {
        table: &'static str,
        #[source]
        source: SqlxError,
    },

    #[error("read from table {table} failed: {source}")]
    StorageRead {
        table: &'static str,
        #[source]
        source: SqlxError,
    },

    /// An entry could not be turned into column values; nothing was written.
    #[error("entry for table {table} rejected: {reason}")]
    InvalidEntry { table: &'static str, reason: String },

    /// A connect hook other than token acquisition failed while opening a connection.
    #[error("connect hook {hook} failed: {message}")]
    ConnectHook { hook: &'static str, message: String },

    #[error("token encoding failed: {0}")]
    TokenEncoding(String),

    #[error("engine has been disposed")]
    EngineDisposed,

    #[error("schema operation on table {table} failed: {source}")]
    Schema {
        table: &'static str,
        #[source]
        source: SqlxError,
    },

    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(SqlxError),
}

impl StoreError {
    /// Classify a driver error raised outside of a table-scoped operation.
    pub(crate) fn from_sqlx(e: SqlxError) -> Self {
        match e {
            SqlxError::PoolClosed => StoreError::EngineDisposed,
            other => StoreError::Database(other),
        }
    }

    pub(crate) fn write(table: &'static str, e: SqlxError) -> Self {
        match e {
            SqlxError::PoolClosed => StoreError::EngineDisposed,
            source => StoreError::StorageWrite { table, source },
        }
    }

    pub(crate) fn read(table: &'static str, e: SqlxError) -> Self {
        match e {
            SqlxError::PoolClosed => StoreError::EngineDisposed,
            source => StoreError::StorageRead { table, source },
        }
    }
}

impl From<figment::Error> for StoreError {
    fn from(e: figment::Error) -> Self {
        StoreError::Config(Box::new(e))
    }
}

impl
    From<
        RequestTokenError<
            HttpClientError<ReqwestClientError>,
            StandardErrorResponse<BasicErrorResponseType>,
        >,
    > for StoreError
{
    fn from(
        e: RequestTokenError<
            HttpClientError<ReqwestClientError>,
            StandardErrorResponse<BasicErrorResponseType>,
        >,
    ) -> Self {
        match e {
            RequestTokenError::ServerResponse(err) => {
                let detail = err
                    .error_description()
                    .map(|d| format!("{}: {}", err.error(), d))
                    .unwrap_or_else(|| err.error().to_string());
                StoreError::Authentication(format!("token endpoint rejected request: {detail}"))
            }
            RequestTokenError::Request(req_e) => {
                StoreError::Authentication(format!("token request failed: {}", req_e))
            }
            RequestTokenError::Parse(parse_err, _body) => {
                StoreError::Json(parse_err.into_inner())
            }
            RequestTokenError::Other(s) => StoreError::Authentication(s),
        }
    }
}
