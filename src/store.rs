//! SQLite persistence for collections, documents and chunks.
//!
//! The database is the source of truth. Every multi-row mutation runs in a
//! single transaction so a failure leaves either the old or the new state.
//! Documents are unique per `(content_hash, collection_id)`.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{RagError, Result};
use crate::models::{Chunk, ChunkId, Collection, CollectionId, Document, DocumentId};

const PREVIEW_CHARS: usize = 200;

const DOCUMENT_COLUMNS: &str = "id, collection_id, display_name, original_name, content_hash, \
     byte_size, content_preview, chunk_count, archived, created_at, updated_at";

/// A chunk ready to be written: text plus its embedding.
#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Metadata for a new document row.
#[derive(Debug, Clone)]
pub struct NewDocument<'a> {
    pub collection_id: CollectionId,
    pub display_name: &'a str,
    pub original_name: &'a str,
    pub content_hash: &'a str,
    pub text: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(DocumentId),
    /// Same content was already present in the collection.
    Existing(DocumentId),
}

impl InsertOutcome {
    pub fn id(&self) -> DocumentId {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Existing(id) => *id,
        }
    }
}

/// Chunk fields needed to turn an index hit into a [`crate::models::Hit`].
#[derive(Debug, Clone)]
pub struct HitRow {
    pub document_id: DocumentId,
    pub collection_id: CollectionId,
    pub document_name: String,
    pub text: String,
}

/// Per-collection counters for `stats`.
#[derive(Debug, Clone)]
pub struct CollectionCounts {
    pub collection: Collection,
    pub documents: i64,
    pub archived: i64,
    pub chunks: i64,
}

#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Collections ============

    pub async fn create_collection(&self, name: &str, description: &str) -> Result<Collection> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO collections (name, description, created_at) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(description)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(Collection {
                id: CollectionId(done.last_insert_rowid()),
                name: name.to_string(),
                description: description.to_string(),
                created_at: now,
            }),
            Err(e) if is_unique_violation(&e) => Err(RagError::CollectionExists(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_collection(&self, id: CollectionId) -> Result<Option<Collection>> {
        let row = sqlx::query(
            "SELECT id, name, description, created_at FROM collections WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| collection_from_row(&r)).transpose()
    }

    pub async fn list_collections(&self) -> Result<Vec<Collection>> {
        let rows =
            sqlx::query("SELECT id, name, description, created_at FROM collections ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(collection_from_row).collect()
    }

    /// Delete a collection with all of its documents and chunks.
    /// Returns the number of documents removed.
    pub async fn delete_collection(&self, id: CollectionId) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE collection_id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        let docs = sqlx::query("DELETE FROM documents WHERE collection_id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let gone = sqlx::query("DELETE FROM collections WHERE id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if gone == 0 && docs == 0 {
            return Err(RagError::CollectionNotFound(id));
        }
        tx.commit().await?;
        Ok(docs)
    }

    /// Create placeholder rows for collection ids referenced by documents
    /// but missing from `collections`.
    pub async fn recover_missing_collections(&self) -> Result<Vec<Collection>> {
        let missing: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT collection_id FROM documents
            WHERE collection_id NOT IN (SELECT id FROM collections)
            ORDER BY collection_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = Vec::with_capacity(missing.len());
        for raw in missing {
            let id = CollectionId(raw);
            let now = Utc::now().timestamp();
            let mut name = format!("recovered-{}", id);
            let taken: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM collections WHERE name = ?")
                .bind(&name)
                .fetch_one(&self.pool)
                .await?;
            if taken > 0 {
                name = format!("recovered-{}-{}", id, now);
            }
            let description = "Placeholder recreated for documents whose collection was missing";

            sqlx::query(
                "INSERT INTO collections (id, name, description, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(id.0)
            .bind(&name)
            .bind(description)
            .bind(now)
            .execute(&self.pool)
            .await?;

            recovered.push(Collection {
                id,
                name,
                description: description.to_string(),
                created_at: now,
            });
        }
        Ok(recovered)
    }

    // ============ Documents ============

    pub async fn find_by_hash(
        &self,
        collection_id: CollectionId,
        content_hash: &str,
    ) -> Result<Option<DocumentId>> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE content_hash = ? AND collection_id = ?",
        )
        .bind(content_hash)
        .bind(collection_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(DocumentId))
    }

    /// Insert a document together with all of its chunks in one transaction.
    ///
    /// If the collection already holds the same content hash, nothing is
    /// written and the existing id is returned.
    pub async fn insert_document(
        &self,
        doc: &NewDocument<'_>,
        chunks: &[PreparedChunk],
    ) -> Result<InsertOutcome> {
        let now = Utc::now().timestamp();
        let preview: String = doc.text.chars().take(PREVIEW_CHARS).collect();

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO documents (collection_id, display_name, original_name, content_hash,
                                   byte_size, content_preview, chunk_count, archived, raw_text,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT(content_hash, collection_id) DO NOTHING
            "#,
        )
        .bind(doc.collection_id.0)
        .bind(doc.display_name)
        .bind(doc.original_name)
        .bind(doc.content_hash)
        .bind(doc.text.len() as i64)
        .bind(&preview)
        .bind(chunks.len() as i64)
        .bind(doc.text)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            let existing: i64 = sqlx::query_scalar(
                "SELECT id FROM documents WHERE content_hash = ? AND collection_id = ?",
            )
            .bind(doc.content_hash)
            .bind(doc.collection_id.0)
            .fetch_one(&mut *tx)
            .await?;
            tx.rollback().await?;
            return Ok(InsertOutcome::Existing(DocumentId(existing)));
        }

        let id = DocumentId(inserted.last_insert_rowid());
        insert_chunks(&mut tx, id, doc.collection_id, chunks).await?;
        tx.commit().await?;
        Ok(InsertOutcome::Inserted(id))
    }

    pub async fn get_document(&self, id: DocumentId) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| document_from_row(&r)).transpose()
    }

    pub async fn list_documents(
        &self,
        collection_id: CollectionId,
        include_archived: bool,
    ) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE collection_id = ? AND (archived = 0 OR ?) ORDER BY id",
            DOCUMENT_COLUMNS
        ))
        .bind(collection_id.0)
        .bind(include_archived)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    /// The document's original text.
    ///
    /// Rows written before raw text was stored fall back to joining the
    /// chunks with newlines, which repeats overlapping text.
    pub async fn document_text(&self, id: DocumentId) -> Result<String> {
        let raw: Option<String> = sqlx::query_scalar("SELECT raw_text FROM documents WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        let raw = raw.ok_or(RagError::DocumentNotFound(id))?;
        if !raw.is_empty() {
            return Ok(raw);
        }

        let chunks = self.document_chunks(id).await?;
        if !chunks.is_empty() {
            tracing::warn!(document_id = %id, "no stored raw text, rebuilding from chunks");
        }
        Ok(chunks
            .into_iter()
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Swap a document's chunks for a new set in one transaction.
    pub async fn replace_chunks(&self, id: DocumentId, chunks: &[PreparedChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let collection_id: Option<i64> =
            sqlx::query_scalar("SELECT collection_id FROM documents WHERE id = ?")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let collection_id = CollectionId(collection_id.ok_or(RagError::DocumentNotFound(id))?);

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        insert_chunks(&mut tx, id, collection_id, chunks).await?;
        sqlx::query("UPDATE documents SET chunk_count = ?, updated_at = ? WHERE id = ?")
            .bind(chunks.len() as i64)
            .bind(Utc::now().timestamp())
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn rename_document(&self, id: DocumentId, display_name: &str) -> Result<()> {
        let done = sqlx::query("UPDATE documents SET display_name = ?, updated_at = ? WHERE id = ?")
            .bind(display_name)
            .bind(Utc::now().timestamp())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(RagError::DocumentNotFound(id));
        }
        Ok(())
    }

    /// Move a document and its chunks to `target`. Returns the source collection.
    pub async fn move_document(&self, id: DocumentId, target: CollectionId) -> Result<CollectionId> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT collection_id, content_hash FROM documents WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(RagError::DocumentNotFound(id))?;
        let source = CollectionId(row.try_get("collection_id")?);
        let hash: String = row.try_get("content_hash")?;
        if source == target {
            return Ok(source);
        }

        let clash: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE content_hash = ? AND collection_id = ?",
        )
        .bind(&hash)
        .bind(target.0)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(existing) = clash {
            return Err(RagError::DuplicateInCollection {
                existing: DocumentId(existing),
            });
        }

        sqlx::query("UPDATE documents SET collection_id = ?, updated_at = ? WHERE id = ?")
            .bind(target.0)
            .bind(Utc::now().timestamp())
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE chunks SET collection_id = ? WHERE document_id = ?")
            .bind(target.0)
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(source)
    }

    /// Flip the archived flag. Returns the owning collection.
    pub async fn set_archived(&self, id: DocumentId, archived: bool) -> Result<CollectionId> {
        let collection_id: Option<i64> = sqlx::query_scalar(
            "UPDATE documents SET archived = ?, updated_at = ? WHERE id = ? RETURNING collection_id",
        )
        .bind(archived)
        .bind(Utc::now().timestamp())
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        collection_id
            .map(CollectionId)
            .ok_or(RagError::DocumentNotFound(id))
    }

    /// Delete a document and its chunks. Returns the owning collection.
    pub async fn delete_document(&self, id: DocumentId) -> Result<CollectionId> {
        let mut tx = self.pool.begin().await?;

        let collection_id: Option<i64> =
            sqlx::query_scalar("SELECT collection_id FROM documents WHERE id = ?")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let collection_id = CollectionId(collection_id.ok_or(RagError::DocumentNotFound(id))?);

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(collection_id)
    }

    /// Remove chunks whose document no longer exists. Returns the count removed.
    pub async fn delete_orphan_chunks(&self) -> Result<u64> {
        let done =
            sqlx::query("DELETE FROM chunks WHERE document_id NOT IN (SELECT id FROM documents)")
                .execute(&self.pool)
                .await?;
        Ok(done.rows_affected())
    }

    // ============ Chunks ============

    pub async fn document_chunks(&self, id: DocumentId) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, collection_id, chunk_index, text, metadata_json
            FROM chunks WHERE document_id = ? ORDER BY chunk_index
            "#,
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(Chunk {
                    id: ChunkId(r.try_get("id")?),
                    document_id: DocumentId(r.try_get("document_id")?),
                    collection_id: CollectionId(r.try_get("collection_id")?),
                    chunk_index: r.try_get("chunk_index")?,
                    text: r.try_get("text")?,
                    metadata_json: r.try_get("metadata_json")?,
                })
            })
            .collect()
    }

    /// Embeddings of every live chunk in a collection, by primary key.
    /// Chunks of archived or missing documents are left out.
    pub async fn index_rows(&self, collection_id: CollectionId) -> Result<Vec<(ChunkId, Vec<f32>)>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.embedding
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE c.collection_id = ? AND d.archived = 0
            ORDER BY c.id
            "#,
        )
        .bind(collection_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                let blob: Vec<u8> = r.try_get("embedding")?;
                Ok((ChunkId(r.try_get("id")?), blob_to_vec(&blob)))
            })
            .collect()
    }

    /// Resolve chunk ids to text and document metadata. Ids that no longer
    /// resolve to a live chunk are absent from the map.
    pub async fn hydrate(&self, ids: &[ChunkId]) -> Result<HashMap<ChunkId, HitRow>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT c.id, c.document_id, c.collection_id, c.text, d.display_name
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.archived = 0 AND c.id IN ({})
            "#,
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.0);
        }

        let mut out = HashMap::with_capacity(ids.len());
        for r in query.fetch_all(&self.pool).await? {
            out.insert(
                ChunkId(r.try_get("id")?),
                HitRow {
                    document_id: DocumentId(r.try_get("document_id")?),
                    collection_id: CollectionId(r.try_get("collection_id")?),
                    document_name: r.try_get("display_name")?,
                    text: r.try_get("text")?,
                },
            );
        }
        Ok(out)
    }

    pub async fn chunk_count(&self, collection_id: CollectionId) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE collection_id = ?")
            .bind(collection_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn collection_counts(&self) -> Result<Vec<CollectionCounts>> {
        let mut out = Vec::new();
        for collection in self.list_collections().await? {
            let row = sqlx::query(
                r#"
                SELECT COUNT(*) AS documents,
                       COALESCE(SUM(archived), 0) AS archived
                FROM documents WHERE collection_id = ?
                "#,
            )
            .bind(collection.id.0)
            .fetch_one(&self.pool)
            .await?;
            let chunks = self.chunk_count(collection.id).await?;
            out.push(CollectionCounts {
                documents: row.try_get("documents")?,
                archived: row.try_get("archived")?,
                chunks,
                collection,
            });
        }
        Ok(out)
    }
}

async fn insert_chunks(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: DocumentId,
    collection_id: CollectionId,
    chunks: &[PreparedChunk],
) -> Result<()> {
    for (index, chunk) in chunks.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO chunks (document_id, collection_id, chunk_index, text, embedding, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(document_id.0)
        .bind(collection_id.0)
        .bind(index as i64)
        .bind(&chunk.text)
        .bind(vec_to_blob(&chunk.embedding))
        .bind(serde_json::json!({ "chars": chunk.text.chars().count() }).to_string())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn collection_from_row(row: &SqliteRow) -> Result<Collection> {
    Ok(Collection {
        id: CollectionId(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    Ok(Document {
        id: DocumentId(row.try_get("id")?),
        collection_id: CollectionId(row.try_get("collection_id")?),
        display_name: row.try_get("display_name")?,
        original_name: row.try_get("original_name")?,
        content_hash: row.try_get("content_hash")?,
        byte_size: row.try_get("byte_size")?,
        content_preview: row.try_get("content_preview")?,
        chunk_count: row.try_get("chunk_count")?,
        archived: row.try_get::<i64, _>("archived")? != 0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn store(tmp: &TempDir) -> DocumentStore {
        let pool = db::connect(&tmp.path().join("store.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        DocumentStore::new(pool)
    }

    fn chunks(texts: &[&str]) -> Vec<PreparedChunk> {
        texts
            .iter()
            .map(|t| PreparedChunk {
                text: t.to_string(),
                embedding: vec![1.0, 0.0],
            })
            .collect()
    }

    fn new_doc<'a>(collection_id: CollectionId, hash: &'a str, text: &'a str) -> NewDocument<'a> {
        NewDocument {
            collection_id,
            display_name: "doc.txt",
            original_name: "doc.txt",
            content_hash: hash,
            text,
        }
    }

    #[tokio::test]
    async fn test_insert_conflict_returns_existing() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let c = store.create_collection("c", "").await.unwrap();

        let first = store
            .insert_document(&new_doc(c.id, "h1", "alpha beta"), &chunks(&["alpha", "beta"]))
            .await
            .unwrap();
        let second = store
            .insert_document(&new_doc(c.id, "h1", "alpha beta"), &chunks(&["alpha", "beta"]))
            .await
            .unwrap();

        assert!(matches!(first, InsertOutcome::Inserted(_)));
        assert_eq!(second, InsertOutcome::Existing(first.id()));
        assert_eq!(store.chunk_count(c.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_document_text_prefers_raw_text() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let c = store.create_collection("c", "").await.unwrap();
        let id = store
            .insert_document(&new_doc(c.id, "h1", "one two three"), &chunks(&["one two", "two three"]))
            .await
            .unwrap()
            .id();

        assert_eq!(store.document_text(id).await.unwrap(), "one two three");

        // Rows without stored text fall back to the chunks
        sqlx::query("UPDATE documents SET raw_text = '' WHERE id = ?")
            .bind(id.0)
            .execute(store.pool())
            .await
            .unwrap();
        assert_eq!(store.document_text(id).await.unwrap(), "one two\ntwo three");

        assert!(matches!(
            store.document_text(DocumentId(99)).await,
            Err(RagError::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_archived_documents_are_not_indexed_or_hydrated() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let c = store.create_collection("c", "").await.unwrap();
        let live = store
            .insert_document(&new_doc(c.id, "h1", "live"), &chunks(&["live"]))
            .await
            .unwrap()
            .id();
        let hidden = store
            .insert_document(&new_doc(c.id, "h2", "hidden"), &chunks(&["hidden"]))
            .await
            .unwrap()
            .id();
        store.set_archived(hidden, true).await.unwrap();

        let rows = store.index_rows(c.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, vec![1.0, 0.0]);

        let live_chunk = store.document_chunks(live).await.unwrap()[0].id;
        let hidden_chunk = store.document_chunks(hidden).await.unwrap()[0].id;
        let hydrated = store
            .hydrate(&[live_chunk, hidden_chunk, ChunkId(12345)])
            .await
            .unwrap();
        assert_eq!(hydrated.len(), 1);
        assert_eq!(hydrated[&live_chunk].text, "live");
    }

    #[tokio::test]
    async fn test_collection_counts() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let c = store.create_collection("c", "").await.unwrap();
        let id = store
            .insert_document(&new_doc(c.id, "h1", "a b"), &chunks(&["a", "b"]))
            .await
            .unwrap()
            .id();
        store.set_archived(id, true).await.unwrap();

        let counts = store.collection_counts().await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].documents, 1);
        assert_eq!(counts[0].archived, 1);
        assert_eq!(counts[0].chunks, 2);
    }
}
