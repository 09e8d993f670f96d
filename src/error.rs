// =============================================================================
// Error taxonomy for the synchronization layer
// =============================================================================
//
// Every failure is scoped to one ChartStream or UserDataSession and delivered
// through that instance's own callback channel. Nothing here is fatal to the
// process.
// =============================================================================

/// Unified error type for chart streams, user sessions and their collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Socket connect/send failure, or an HTTP request that never produced a body.
    Transport(String),
    /// Listen key invalid, expired or unknown to the exchange.
    Auth(String),
    /// REST call answered with the exchange error shape `{code, msg}`.
    Exchange { code: i64, msg: String },
    /// Malformed payload (kline delta without `k`, unparsable numbers, ...).
    Validation(String),
    /// A correlated request exhausted its retries without a usable response.
    LoadFailed { attempts: u32 },
    /// Operation attempted on a session or stream that is already closed.
    Closed,
}

impl SyncError {
    /// True when the exchange reports that the listen key no longer exists.
    pub fn is_token_missing(&self) -> bool {
        match self {
            Self::Auth(_) => true,
            Self::Exchange { code, msg } => {
                *code == LISTEN_KEY_MISSING_CODE || msg == LISTEN_KEY_MISSING_MSG
            }
            _ => false,
        }
    }
}

/// Exchange error code for "This listenKey does not exist."
pub const LISTEN_KEY_MISSING_CODE: i64 = -1125;
pub const LISTEN_KEY_MISSING_MSG: &str = "This listenKey does not exist.";

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport_error: {msg}"),
            Self::Auth(msg) => write!(f, "auth_error: {msg}"),
            Self::Exchange { code, msg } => write!(f, "exchange_error: [{code}] {msg}"),
            Self::Validation(msg) => write!(f, "validation_error: {msg}"),
            Self::LoadFailed { attempts } => {
                write!(f, "load_failed: no usable response after {attempts} attempts")
            }
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
