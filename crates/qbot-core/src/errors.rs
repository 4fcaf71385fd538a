/// Core error type shared by the bot crates.
///
/// The platform adapter maps its transport/protocol failures into this type
/// so callers can distinguish what is retryable (transport, timeout) from
/// what is not (rejected credentials, platform error codes).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// Credential rejected by the platform, or still invalid after a refresh.
    /// Not retried automatically beyond the renewal schedule.
    #[error("authentication failed: {message}")]
    Auth {
        /// Platform-reported error code, when the response carried one.
        code: Option<i64>,
        message: String,
    },

    /// An operation needed an access token before any was acquired.
    #[error("no access token held")]
    NoCredential,

    /// Network-level failure (connect, TLS, read). Retried with backoff at
    /// the supervisor level; a single outbound call retries at most once.
    #[error("transport error: {0}")]
    Transport(String),

    /// Outbound call exceeded the fixed transport timeout. Surfaced as-is;
    /// the gateway never retries it because calls are not idempotent.
    #[error("outbound call timed out")]
    Timeout,

    /// Malformed or unexpected frame/response. Logged by the session without
    /// tearing the connection down unless the frame is unparsable at the
    /// transport level.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The platform answered an outbound call with an error body.
    #[error("platform error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
