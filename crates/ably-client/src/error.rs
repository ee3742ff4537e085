//! Error types shared by the REST and realtime clients.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite;

/// A boxed error type for user-supplied callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Well-known platform error codes. Only the subset the client acts on is
/// listed; anything else is passed through untouched.
pub mod codes {
    pub const BAD_REQUEST: i32 = 40000;
    pub const TOKEN_ERROR: i32 = 40140;
    pub const TOKEN_EXPIRED: i32 = 40142;
    pub const OPERATION_NOT_PERMITTED: i32 = 40160;
    pub const INTERNAL_ERROR: i32 = 50000;
    pub const CONNECTION_FAILED: i32 = 80000;
    pub const CONNECTION_SUSPENDED: i32 = 80002;
    pub const DISCONNECTED: i32 = 80003;
    pub const TIMEOUT: i32 = 80014;
    pub const CONNECTION_CLOSED: i32 = 80017;
    pub const CHANNEL_OPERATION_FAILED: i32 = 90000;

    /// Token-renewable errors occupy a contiguous range.
    pub fn is_token_error(code: i32) -> bool {
        (40140..40150).contains(&code)
    }
}

/// Error details as carried on wire frames and REST error bodies.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: i32,
    pub status_code: Option<i32>,
    pub message: String,
    pub href: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        ErrorInfo {
            code,
            status_code: None,
            message: message.into(),
            href: if code != 0 {
                Some(format!("https://help.ably.io/error/{code}"))
            } else {
                None
            },
        }
    }

    pub fn with_status(mut self, status_code: i32) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Fill in placeholder details for frames that should carry an error but
    /// don't.
    pub fn or_unknown(error: Option<ErrorInfo>) -> ErrorInfo {
        error.unwrap_or_else(|| {
            ErrorInfo::new(codes::CONNECTION_FAILED, "no error details from server")
        })
    }

    /// Whether a connection-scope error is worth retrying. An error is
    /// retriable when it has no status code, is a server error (5xx), or
    /// carries a well-known connection error code even at 4xx.
    pub fn is_retriable(&self) -> bool {
        const CONNECTION_ERROR_CODES: &[i32] = &[
            codes::CONNECTION_FAILED,
            codes::CONNECTION_SUSPENDED,
            codes::DISCONNECTED,
            codes::CONNECTION_CLOSED,
            50001, // unknown channel error
            50002, // unknown connection error
        ];
        match self.status_code {
            None => true,
            Some(sc) if sc >= 500 => true,
            Some(_) => CONNECTION_ERROR_CODES.contains(&self.code),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code={}", self.code)?;
        if let Some(sc) = self.status_code {
            write!(f, " status={sc}")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("connection error: {0}")]
    Connection(ErrorInfo),

    #[error("auth error: {0}")]
    Auth(ErrorInfo),

    #[error("channel error: {0}")]
    Channel(ErrorInfo),

    #[error("protocol error: {0}")]
    Protocol(ErrorInfo),

    #[error("request error: {0}")]
    Request(ErrorInfo),

    #[error("cannot encode message data: {0}")]
    Encoding(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("token fetch failed: {0}")]
    TokenFetch(BoxError),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// The wire-level error details, if this error carries any.
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match self {
            Error::Connection(e)
            | Error::Auth(e)
            | Error::Channel(e)
            | Error::Protocol(e)
            | Error::Request(e) => Some(e),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<i32> {
        self.error_info().map(|e| e.code)
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

impl From<ErrorInfo> for Error {
    fn from(e: ErrorInfo) -> Self {
        if codes::is_token_error(e.code) {
            Error::Auth(e)
        } else if (80000..80020).contains(&e.code) {
            Error::Connection(e)
        } else if (90000..90010).contains(&e.code) {
            Error::Channel(e)
        } else {
            Error::Request(e)
        }
    }
}
