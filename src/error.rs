//! Error type for the retrieval library.
//!
//! Duplicate ingests, missing index caches and orphan chunks are handled
//! in-band and never show up here.

use thiserror::Error;

use crate::models::{CollectionId, DocumentId};

#[derive(Debug, Error)]
pub enum RagError {
    /// The embedding backend could not be loaded or refused the request.
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("collection {0} not found")]
    CollectionNotFound(CollectionId),

    #[error("document {0} not found")]
    DocumentNotFound(DocumentId),

    #[error("collection name already in use: {0}")]
    CollectionExists(String),

    /// The target collection already holds a document with the same content.
    #[error("collection already contains identical content as document {existing}")]
    DuplicateInCollection { existing: DocumentId },

    #[error("index error: {0}")]
    Index(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_unavailable_display() {
        let e = RagError::ProviderUnavailable("model not loaded".into());
        assert_eq!(
            e.to_string(),
            "embedding provider unavailable: model not loaded"
        );
    }

    #[test]
    fn test_not_found_display() {
        assert_eq!(
            RagError::CollectionNotFound(CollectionId(7)).to_string(),
            "collection 7 not found"
        );
        assert_eq!(
            RagError::DocumentNotFound(DocumentId(3)).to_string(),
            "document 3 not found"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: RagError = io.into();
        assert!(matches!(e, RagError::Io(_)));
    }
}
