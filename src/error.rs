use thiserror::Error;

/// Unified error taxonomy for every fallible operation in this crate.
///
/// Internal adapter code (LanceDB, Tantivy, reqwest) keeps using `anyhow::Result`
/// at the call-site level; conversion to `RagError` happens at the trait-object
/// boundary via the `From<anyhow::Error>` impl below, which maps unclassified
/// errors to `Upstream`.
#[derive(Debug, Error)]
pub enum RagError {
    /// Bad input: empty query, unsupported file type, strict dimension mismatch.
    #[error("validation error in {operation}: {message}")]
    Validation { operation: String, message: String },

    /// A required backend (embedder, vector store, lexical index) is unavailable.
    #[error("{backend} not ready: {message}")]
    NotReady { backend: String, message: String },

    /// A remote model or storage call failed.
    #[error("upstream error in {operation}: {message}")]
    Upstream {
        operation: String,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// A chunk or document was left in a partially-written state.
    #[error("consistency error: {message}")]
    Consistency { message: String },

    /// The operation's deadline expired or it was explicitly cancelled.
    #[error("cancelled: {message}")]
    Cancelled { message: String },
}

impl RagError {
    pub fn validation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn not_ready(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotReady {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn upstream(operation: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Upstream {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// True for errors the ingestion pipeline should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::NotReady { .. })
    }
}

impl From<anyhow::Error> for RagError {
    fn from(err: anyhow::Error) -> Self {
        Self::Upstream {
            operation: "unclassified".to_string(),
            message: err.to_string(),
            source: Some(err),
        }
    }
}

pub type RagResult<T> = Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_and_not_ready_are_retryable() {
        let e = RagError::upstream("search", anyhow::anyhow!("timeout"));
        assert!(e.is_retryable());
        let e = RagError::not_ready("embedder", "no api key");
        assert!(e.is_retryable());
    }

    #[test]
    fn validation_is_not_retryable() {
        let e = RagError::validation("search", "empty query");
        assert!(!e.is_retryable());
    }

    #[test]
    fn anyhow_conversion_maps_to_upstream() {
        let err: anyhow::Error = anyhow::anyhow!("boom");
        let rag_err: RagError = err.into();
        assert!(matches!(rag_err, RagError::Upstream { .. }));
    }
}
