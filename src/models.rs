//! Core data models for collections, documents, chunks and search hits.
//!
//! Entities reference each other through integer surrogate keys that mirror
//! the SQLite row ids; nothing holds a pointer into another entity.

use serde::Serialize;
use std::fmt;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }
    };
}

row_id!(
    /// Row id of a collection; also names its index cache files.
    CollectionId
);
row_id!(DocumentId);
row_id!(ChunkId);

/// An isolated group of documents with its own vector index.
#[derive(Debug, Clone, Serialize)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    pub description: String,
    pub created_at: i64,
}

/// Document metadata. The full text lives in storage and is fetched on demand.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: DocumentId,
    pub collection_id: CollectionId,
    pub display_name: String,
    pub original_name: String,
    pub content_hash: String,
    pub byte_size: i64,
    pub content_preview: String,
    pub chunk_count: i64,
    pub archived: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A stored passage of a document. Embeddings are loaded separately.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub collection_id: CollectionId,
    pub chunk_index: i64,
    pub text: String,
    pub metadata_json: String,
}

/// A scored chunk returned by [`crate::engine::RetrievalEngine::search`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hit {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub collection_id: CollectionId,
    pub document_name: String,
    pub text: String,
    pub score: f32,
}
