//! Retrieval engine: ingest and document lifecycle.
//!
//! [`RetrievalEngine`] ties the store, the embedding provider and the index
//! manager together. Ingest runs chunk → embed → store → rebuild; every
//! mutation that changes which chunks a collection serves ends with a
//! rebuild of that collection's index. Query-side search lives in
//! [`crate::search`].
//!
//! Text is chunked and embedded before anything is written, so an embedding
//! failure leaves storage untouched and a retry goes through the same
//! duplicate check.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::chunk;
use crate::config::{ChunkingConfig, Config};
use crate::db;
use crate::embedding::warmup::WarmupRegistry;
use crate::embedding::{EmbeddingProvider, Provider};
use crate::error::{RagError, Result};
use crate::index::{IndexManager, IndexParams};
use crate::migrate;
use crate::models::{Chunk, Collection, CollectionId, Document, DocumentId};
use crate::store::{DocumentStore, InsertOutcome, NewDocument, PreparedChunk};

pub struct RetrievalEngine {
    pub(crate) store: DocumentStore,
    pub(crate) index: IndexManager,
    pub(crate) provider: Arc<Provider>,
    warmups: WarmupRegistry,
    chunking: ChunkingConfig,
    top_k: usize,
    pub(crate) auto_repair: bool,
}

impl RetrievalEngine {
    /// Open the database, run migrations, resolve the configured provider
    /// and purge orphan chunks.
    pub async fn open(config: &Config) -> Result<Self> {
        let provider = Provider::from_config(&config.embedding)?;
        Self::open_with_provider(config, provider).await
    }

    pub async fn open_with_provider(config: &Config, provider: Provider) -> Result<Self> {
        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool).await?;

        let engine = Self {
            store: DocumentStore::new(pool),
            index: IndexManager::new(config.index_dir(), IndexParams::from(&config.index)),
            provider: Arc::new(provider),
            warmups: WarmupRegistry::new(),
            chunking: config.chunking,
            top_k: config.retrieval.top_k,
            auto_repair: config.retrieval.auto_repair,
        };

        let purged = engine.store.delete_orphan_chunks().await?;
        if purged > 0 {
            warn!(chunks = purged, "purged orphan chunks at startup");
        }
        Ok(engine)
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    pub fn warmups(&self) -> &WarmupRegistry {
        &self.warmups
    }

    pub fn default_top_k(&self) -> usize {
        self.top_k
    }

    /// Start loading the embedding model in the background.
    pub fn start_warmup(&self) -> String {
        self.warmups.start(self.provider.clone())
    }

    // ============ Collections ============

    pub async fn create_collection(&self, name: &str, description: &str) -> Result<Collection> {
        let collection = self.store.create_collection(name, description).await?;
        info!(collection_id = %collection.id, name = %collection.name, "collection created");
        Ok(collection)
    }

    pub async fn list_collections(&self) -> Result<Vec<Collection>> {
        self.store.list_collections().await
    }

    pub async fn get_collection(&self, id: CollectionId) -> Result<Option<Collection>> {
        self.store.get_collection(id).await
    }

    /// Delete a collection, its documents, chunks and index files.
    pub async fn delete_collection(&self, id: CollectionId) -> Result<u64> {
        let docs = self.store.delete_collection(id).await?;
        self.index.drop_collection(id).await;
        info!(collection_id = %id, documents = docs, "collection deleted");
        Ok(docs)
    }

    /// Look up a collection, recovering placeholders first when auto-repair
    /// is enabled.
    pub async fn require_collection(&self, id: CollectionId) -> Result<Collection> {
        if let Some(c) = self.store.get_collection(id).await? {
            return Ok(c);
        }
        if self.auto_repair {
            self.recover_missing_collections().await?;
            if let Some(c) = self.store.get_collection(id).await? {
                return Ok(c);
            }
        }
        Err(RagError::CollectionNotFound(id))
    }

    // ============ Ingest ============

    /// Inbound ingest entry point; same as [`Self::add_document`].
    pub async fn ingest(
        &self,
        collection_id: CollectionId,
        filename: &str,
        text: &str,
    ) -> Result<DocumentId> {
        self.add_document(collection_id, filename, text).await
    }

    /// Read a UTF-8 file and ingest it under its file name.
    pub async fn ingest_file(&self, collection_id: CollectionId, path: &Path) -> Result<DocumentId> {
        let text = tokio::fs::read_to_string(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        self.add_document(collection_id, &name, &text).await
    }

    /// Store `text` as a document. Ingesting the same text into the same
    /// collection again returns the existing id without reprocessing.
    pub async fn add_document(
        &self,
        collection_id: CollectionId,
        name: &str,
        text: &str,
    ) -> Result<DocumentId> {
        self.add_named(collection_id, name, name, text).await
    }

    async fn add_named(
        &self,
        collection_id: CollectionId,
        display_name: &str,
        original_name: &str,
        text: &str,
    ) -> Result<DocumentId> {
        self.require_collection(collection_id).await?;

        let hash = content_hash(text);
        if let Some(existing) = self.store.find_by_hash(collection_id, &hash).await? {
            debug!(document_id = %existing, collection_id = %collection_id, "duplicate content, reusing document");
            return Ok(existing);
        }

        let prepared = self.prepare_chunks(text, self.chunking).await?;
        let doc = NewDocument {
            collection_id,
            display_name,
            original_name,
            content_hash: &hash,
            text,
        };

        match self.store.insert_document(&doc, &prepared).await? {
            InsertOutcome::Existing(id) => Ok(id),
            InsertOutcome::Inserted(id) => {
                info!(document_id = %id, collection_id = %collection_id, chunks = prepared.len(), "document ingested");
                if !prepared.is_empty() {
                    self.refresh_index(collection_id).await?;
                }
                Ok(id)
            }
        }
    }

    async fn prepare_chunks(&self, text: &str, chunking: ChunkingConfig) -> Result<Vec<PreparedChunk>> {
        let pieces = chunk::split(text, chunking.chunk_size, chunking.chunk_overlap);
        if pieces.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.provider.embed(&pieces).await?;
        Ok(pieces
            .into_iter()
            .zip(vectors)
            .map(|(text, embedding)| PreparedChunk { text, embedding })
            .collect())
    }

    // ============ Lifecycle ============

    /// Re-chunk and re-embed a document from its stored text. Unset
    /// parameters fall back to the configured chunking. Returns the new
    /// chunk count.
    pub async fn reprocess_document(
        &self,
        id: DocumentId,
        chunk_size: Option<usize>,
        chunk_overlap: Option<usize>,
    ) -> Result<usize> {
        let doc = self.require_document(id).await?;
        let text = self.store.document_text(id).await?;

        let chunk_size = chunk_size.unwrap_or(self.chunking.chunk_size).max(1);
        let chunking = ChunkingConfig {
            chunk_size,
            chunk_overlap: chunk_overlap
                .unwrap_or(self.chunking.chunk_overlap)
                .min(chunk_size - 1),
        };

        let prepared = self.prepare_chunks(&text, chunking).await?;
        self.store.replace_chunks(id, &prepared).await?;
        self.refresh_index(doc.collection_id).await?;

        info!(document_id = %id, chunks = prepared.len(), chunk_size = chunking.chunk_size, "document reprocessed");
        Ok(prepared.len())
    }

    /// Move a document and its chunks to another collection, then rebuild
    /// both indexes.
    pub async fn move_document(&self, id: DocumentId, target: CollectionId) -> Result<()> {
        self.require_collection(target).await?;
        let source = self.store.move_document(id, target).await?;
        if source == target {
            return Ok(());
        }
        self.refresh_index(source).await?;
        self.refresh_index(target).await?;
        info!(document_id = %id, from = %source, to = %target, "document moved");
        Ok(())
    }

    /// Copy a document's text into `target` as a new document. Subject to the
    /// same duplicate check as ingest, so copying into a collection that
    /// already holds the content returns the existing id.
    pub async fn duplicate_document(&self, id: DocumentId, target: CollectionId) -> Result<DocumentId> {
        let doc = self.require_document(id).await?;
        let text = self.store.document_text(id).await?;
        self.add_named(target, &doc.display_name, &doc.original_name, &text)
            .await
    }

    pub async fn set_archived(&self, id: DocumentId, archived: bool) -> Result<()> {
        let collection_id = self.store.set_archived(id, archived).await?;
        self.refresh_index(collection_id).await?;
        info!(document_id = %id, archived, "document archive flag changed");
        Ok(())
    }

    pub async fn delete_document(&self, id: DocumentId) -> Result<()> {
        let collection_id = self.store.delete_document(id).await?;
        self.refresh_index(collection_id).await?;
        info!(document_id = %id, collection_id = %collection_id, "document deleted");
        Ok(())
    }

    /// Change the display name. Chunks and the index are unaffected.
    pub async fn rename_document(&self, id: DocumentId, display_name: &str) -> Result<()> {
        self.store.rename_document(id, display_name).await
    }

    pub async fn get_document(&self, id: DocumentId) -> Result<Option<Document>> {
        self.store.get_document(id).await
    }

    pub async fn list_documents(
        &self,
        collection_id: CollectionId,
        include_archived: bool,
    ) -> Result<Vec<Document>> {
        self.store.list_documents(collection_id, include_archived).await
    }

    pub async fn document_chunks(&self, id: DocumentId) -> Result<Vec<Chunk>> {
        self.store.document_chunks(id).await
    }

    async fn require_document(&self, id: DocumentId) -> Result<Document> {
        self.store
            .get_document(id)
            .await?
            .ok_or(RagError::DocumentNotFound(id))
    }

    // ============ Maintenance ============

    /// Remove chunks whose document row is gone. Safe to repeat.
    pub async fn delete_orphan_chunks(&self) -> Result<u64> {
        let removed = self.store.delete_orphan_chunks().await?;
        if removed > 0 {
            info!(chunks = removed, "orphan chunks removed");
        }
        Ok(removed)
    }

    pub async fn recover_missing_collections(&self) -> Result<Vec<Collection>> {
        let recovered = self.store.recover_missing_collections().await?;
        for c in &recovered {
            warn!(collection_id = %c.id, name = %c.name, "recreated missing collection");
        }
        Ok(recovered)
    }

    /// Rebuild one collection's index from storage.
    pub async fn rebuild_index(&self, collection_id: CollectionId) -> Result<usize> {
        self.require_collection(collection_id).await?;
        self.refresh_index(collection_id).await
    }

    /// Rebuild after a mutation. On failure the stale index is dropped so
    /// the next search rebuilds it, and the error is returned.
    async fn refresh_index(&self, collection_id: CollectionId) -> Result<usize> {
        match self.index.rebuild(&self.store, collection_id).await {
            Ok(n) => Ok(n),
            Err(e) => {
                warn!(collection_id = %collection_id, error = %e, "index rebuild failed, dropping cache");
                self.index.invalidate(collection_id).await;
                Err(e)
            }
        }
    }
}

/// Hex SHA-256 of the full text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("").len(), 64);
    }
}
