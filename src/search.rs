//! Cross-collection semantic search.
//!
//! # Algorithm
//!
//! 1. Embed the query once.
//! 2. For each requested collection, in order: make sure its index is in
//!    memory (load the disk cache, or rebuild from storage when there is
//!    none), then take the `min(top_k, index_size)` nearest chunks.
//! 3. Hydrate the returned chunk ids. Ids that no longer resolve (deleted,
//!    archived or orphaned since the index was built) are skipped.
//! 4. Merge all hits by score descending. Equal scores keep per-collection
//!    rank order, then request order.
//! 5. Truncate to `top_k × collections`.
//!
//! Collections are searched one after another. Finding nothing anywhere is an
//! empty result, not an error.

use std::cmp::Ordering;

use tracing::debug;

use crate::engine::RetrievalEngine;
use crate::error::Result;
use crate::models::{CollectionId, Hit};

impl RetrievalEngine {
    pub async fn search(
        &self,
        query: &str,
        collection_ids: &[CollectionId],
        top_k: usize,
    ) -> Result<Vec<Hit>> {
        let mut collections: Vec<CollectionId> = Vec::with_capacity(collection_ids.len());
        for id in collection_ids {
            if !collections.contains(id) {
                collections.push(*id);
            }
        }
        if collections.is_empty() || top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = self.provider.embed_one(query).await?;

        // (hit, rank within its collection, position in the request)
        let mut ranked: Vec<(Hit, usize, usize)> = Vec::new();
        for (position, &collection_id) in collections.iter().enumerate() {
            if !self.ensure_index(collection_id).await? {
                continue;
            }

            let neighbours = self
                .index
                .search(collection_id, query_vec.clone(), top_k)
                .await?;
            if neighbours.is_empty() {
                continue;
            }

            let ids: Vec<_> = neighbours.iter().map(|(id, _)| *id).collect();
            let rows = self.store.hydrate(&ids).await?;

            for (rank, (chunk_id, score)) in neighbours.into_iter().enumerate() {
                let Some(row) = rows.get(&chunk_id) else {
                    debug!(chunk_id = %chunk_id, "skipping unresolvable index entry");
                    continue;
                };
                ranked.push((
                    Hit {
                        chunk_id,
                        document_id: row.document_id,
                        collection_id,
                        document_name: row.document_name.clone(),
                        text: row.text.clone(),
                        score,
                    },
                    rank,
                    position,
                ));
            }
        }

        ranked.sort_by(|a, b| {
            b.0.score
                .partial_cmp(&a.0.score)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });
        ranked.truncate(top_k.saturating_mul(collections.len()));

        Ok(ranked.into_iter().map(|(hit, _, _)| hit).collect())
    }

    /// Search with the configured default `top_k`.
    pub async fn search_default(&self, query: &str, collection_ids: &[CollectionId]) -> Result<Vec<Hit>> {
        self.search(query, collection_ids, self.default_top_k()).await
    }

    /// Make the collection's index available. `false` when the collection
    /// does not exist.
    async fn ensure_index(&self, collection_id: CollectionId) -> Result<bool> {
        if self.index.is_loaded(collection_id) {
            return Ok(true);
        }
        let exists = match self.require_collection(collection_id).await {
            Ok(_) => true,
            Err(crate::error::RagError::CollectionNotFound(_)) => false,
            Err(e) => return Err(e),
        };
        if !exists {
            debug!(collection_id = %collection_id, "skipping unknown collection");
            return Ok(false);
        }
        if !self.index.load(collection_id).await {
            self.index.rebuild(&self.store, collection_id).await?;
        }
        Ok(true)
    }
}
