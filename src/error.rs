use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

/// Errors thrown by a rule handler, a hook, or user middleware.
///
/// Exception-handler middleware selects a handler by walking the error's
/// `source()` chain, so wrap causes rather than flattening them to strings.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// When things go awry
#[derive(Debug, Error)]
pub enum YakNsError {
    /// A record or rule was constructed from values that fail validation
    /// (bad IP, bad domain, out-of-range integer, invalid CAA tag).
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// Raw bytes that did not parse as a DNS message. Logged and dropped,
    /// never answered.
    #[error("invalid message from {remote}: {reason} bytes={data}")]
    InvalidMessage {
        remote: String,
        reason: String,
        data: String,
    },
    /// An error escaped a rule handler or middleware stack.
    #[error("handler error: {0}")]
    Handler(#[source] HandlerError),
    #[error("byte packing error: {0}")]
    BytePackingError(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    /// Something failed in the start up of the server
    #[error("startup error: {0}")]
    StartupError(String),
    #[error("transport error: {0}")]
    Transport(String),
    /// A socket read did not complete within the per-read timeout.
    #[error("read timed out after {0:?}")]
    ReadTimeout(std::time::Duration),
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

impl YakNsError {
    /// Wrap unparseable wire bytes along with where they came from.
    pub fn invalid_message(
        remote: impl std::fmt::Display,
        reason: impl std::fmt::Display,
        data: &[u8],
    ) -> Self {
        YakNsError::InvalidMessage {
            remote: remote.to_string(),
            reason: reason.to_string(),
            data: BASE64.encode(data),
        }
    }
}

impl From<packed_struct::PackingError> for YakNsError {
    fn from(error: packed_struct::PackingError) -> Self {
        YakNsError::BytePackingError(error.to_string())
    }
}

impl From<config::ConfigError> for YakNsError {
    fn from(error: config::ConfigError) -> Self {
        YakNsError::Config(error.to_string())
    }
}

impl From<flexi_logger::FlexiLoggerError> for YakNsError {
    fn from(error: flexi_logger::FlexiLoggerError) -> Self {
        YakNsError::StartupError(error.to_string())
    }
}
