/// Failures surfaced by the remote client and the upload protocol.
///
/// Every variant carries a rendered message rather than the source error so the
/// type stays `Clone`; the listing cache hands one failed fetch to every caller
/// that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The server rejected our credentials (or never handed out a token)
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The path is absent from the server's view of its parent
    #[error("not found: {0}")]
    NotFound(String),
    /// Transport failure, non-success status, or a response missing the
    ///  field we expected
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),
    /// A chunk manifest that does not add up to the object it describes
    #[error("protocol invariant violated: {0}")]
    ProtocolInvariant(String),
    /// Reading local content for an upload failed
    #[error("scratch storage error: {0}")]
    Scratch(String),
}

pub type Result<T, E = RemoteError> = std::result::Result<T, E>;

impl RemoteError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::RemoteUnavailable(msg.into())
    }

    pub fn missing_field(endpoint: &str, field: &str) -> Self {
        Self::RemoteUnavailable(format!("{} response is missing `{}`", endpoint, field))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        Self::RemoteUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        Self::RemoteUnavailable(format!("malformed response: {}", e))
    }
}

impl From<url::ParseError> for RemoteError {
    fn from(e: url::ParseError) -> Self {
        Self::RemoteUnavailable(format!("bad endpoint url: {}", e))
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        Self::Scratch(e.to_string())
    }
}
