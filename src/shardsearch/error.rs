use hyper::StatusCode;

/// Error kinds raised while partitioning, splitting, dispatching or merging a search.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Requested shard count incompatible with the partition key domain.
    #[error("invalid partitioning: {num_partitions} partitions over a domain of {total_domain}")]
    InvalidPartitioning {
        /// Size of the partition key domain `[0, total_domain)`.
        total_domain: u64,
        /// Requested number of partitions.
        num_partitions: u64,
    },

    /// Two partial results disagree on the shape of what is being merged.
    #[error("inconsistent partitions: {0}")]
    InconsistentPartitions(String),

    /// A shard answered with a non-2xx status. The response is relayed verbatim.
    #[error("upstream responded with status {status}")]
    Upstream {
        /// Upstream HTTP status.
        status: u16,
        /// Trimmed upstream `Content-Type`, if any.
        content_type: Option<String>,
        /// Raw upstream body.
        body: Vec<u8>,
    },

    /// Network or timeout failure after retries were exhausted.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Caller is not authenticated.
    #[error("unauthorized")]
    Unauthorized,

    /// Caller is authenticated but lacks the "use" capability.
    #[error("forbidden")]
    Forbidden,

    /// Request body or parameters could not be interpreted.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// HTTP status reported to the caller for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::Forbidden => StatusCode::FORBIDDEN,
            ProxyError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::InvalidPartitioning { .. }
            | ProxyError::InconsistentPartitions(_)
            | ProxyError::Transport(_)
            | ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(error: serde_json::Error) -> Self {
        ProxyError::MalformedRequest(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(ProxyError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ProxyError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ProxyError::MalformedRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Transport("reset".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let upstream = ProxyError::Upstream {
            status: 404,
            content_type: None,
            body: Vec::new(),
        };
        assert_eq!(upstream.status_code(), StatusCode::NOT_FOUND);
    }
}
