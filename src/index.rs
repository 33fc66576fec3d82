//! Per-collection vector indexes.
//!
//! Each collection owns one [`CollectionIndex`]: the ordered chunk ids of its
//! non-archived chunks, their L2-normalized vectors, and an HNSW graph with
//! cosine distance over them. Indexes are a cache over the `chunks` table and
//! can be thrown away at any time.
//!
//! # Concurrency
//!
//! [`IndexManager`] keeps an arena of slots keyed by [`CollectionId`]. A slot
//! holds a rebuild lock and the current index behind an `Arc`:
//!
//! - rebuilds of the same collection are serialized by the slot's lock,
//!   rebuilds of different collections run in parallel;
//! - a rebuild constructs the new index off to the side and swaps the `Arc`
//!   only after construction succeeded, so searches observe either the old or
//!   the new index, never a partial one;
//! - searches clone the `Arc` and run without holding any lock.
//!
//! Graph construction and search are CPU-bound and run on the blocking pool.
//!
//! # Cache files
//!
//! | File | Content |
//! |------|---------|
//! | `{collection_id}.index` | magic, version, dim, count, checksum, then `count × dim` little-endian `f32` |
//! | `{collection_id}.mapping` | `# <checksum>` line, then one chunk id per line in vector order |
//!
//! Files are written to `*.tmp` and renamed into place one after the other.
//! Both carry the same checksum over ids and vectors, so an `.index` from one
//! build next to a `.mapping` from another is rejected on load. The graph is
//! rebuilt from the stored vectors without re-embedding anything. A missing,
//! truncated or mismatched pair is treated as "no cache".

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use hnsw_rs::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::IndexConfig;
use crate::embedding::{blob_to_vec, normalize, vec_to_blob};
use crate::error::{RagError, Result};
use crate::models::{ChunkId, CollectionId};
use crate::store::DocumentStore;

const MAGIC: &[u8; 4] = b"RCIX";
const VERSION: u32 = 2;
const HEADER_LEN: usize = 24;
const MAX_LAYERS: usize = 16;

/// HNSW construction and search parameters.
#[derive(Debug, Clone)]
pub struct IndexParams {
    pub max_connections: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl From<&IndexConfig> for IndexParams {
    fn from(config: &IndexConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            ef_construction: config.ef_construction,
            ef_search: config.ef_search,
        }
    }
}

impl Default for IndexParams {
    fn default() -> Self {
        (&IndexConfig::default()).into()
    }
}

/// An immutable nearest-neighbor index over one collection.
pub struct CollectionIndex {
    dim: usize,
    chunk_ids: Vec<ChunkId>,
    vectors: Vec<Vec<f32>>,
    hnsw: Option<Hnsw<'static, f32, DistCosine>>,
    ef_search: usize,
}

impl CollectionIndex {
    /// Build from `(chunk_id, embedding)` rows in primary-key order.
    ///
    /// Vectors are normalized; zero vectors and vectors whose dimension
    /// differs from the first row are skipped.
    pub fn build(rows: Vec<(ChunkId, Vec<f32>)>, params: &IndexParams) -> Self {
        let mut dim = 0usize;
        let mut chunk_ids = Vec::with_capacity(rows.len());
        let mut vectors = Vec::with_capacity(rows.len());

        for (chunk_id, mut v) in rows {
            if dim == 0 {
                dim = v.len();
            }
            if v.len() != dim || dim == 0 {
                warn!(chunk_id = %chunk_id, len = v.len(), expected = dim, "skipping vector with wrong dimension");
                continue;
            }
            if !normalize(&mut v) {
                debug!(chunk_id = %chunk_id, "skipping zero vector");
                continue;
            }
            chunk_ids.push(chunk_id);
            vectors.push(v);
        }

        Self::from_parts(dim, chunk_ids, vectors, params)
    }

    fn from_parts(
        dim: usize,
        chunk_ids: Vec<ChunkId>,
        vectors: Vec<Vec<f32>>,
        params: &IndexParams,
    ) -> Self {
        let hnsw = if vectors.is_empty() {
            None
        } else {
            let hnsw = Hnsw::<f32, DistCosine>::new(
                params.max_connections,
                vectors.len(),
                MAX_LAYERS,
                params.ef_construction,
                DistCosine {},
            );
            for (label, v) in vectors.iter().enumerate() {
                hnsw.insert((&v[..], label));
            }
            Some(hnsw)
        };

        Self {
            dim,
            chunk_ids,
            vectors,
            hnsw,
            ef_search: params.ef_search,
        }
    }

    pub fn len(&self) -> usize {
        self.chunk_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn chunk_ids(&self) -> &[ChunkId] {
        &self.chunk_ids
    }

    /// Nearest neighbors of `query`, best first, as `(chunk_id, cosine)`.
    ///
    /// Returns at most `min(k, len)` results. A query of the wrong dimension
    /// or with zero norm matches nothing.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(ChunkId, f32)> {
        let Some(hnsw) = &self.hnsw else {
            return Vec::new();
        };
        let k = k.min(self.len());
        if k == 0 || query.len() != self.dim {
            return Vec::new();
        }
        let mut q = query.to_vec();
        if !normalize(&mut q) {
            return Vec::new();
        }

        let ef = self.ef_search.max(k);
        let mut found: Vec<(usize, f32)> = hnsw
            .search(&q, k, ef)
            .into_iter()
            .filter(|n| n.d_id < self.chunk_ids.len())
            .map(|n| (n.d_id, 1.0 - n.distance))
            .collect();

        found.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        found.truncate(k);
        found
            .into_iter()
            .map(|(label, score)| (self.chunk_ids[label], score))
            .collect()
    }

    /// Write the cache pair for `collection_id` into `dir`.
    pub fn persist(&self, dir: &Path, collection_id: CollectionId) -> std::io::Result<()> {
        fs::create_dir_all(dir)?;
        let (index_path, mapping_path) = cache_paths(dir, collection_id);
        let index_tmp = index_path.with_extension("index.tmp");
        let mapping_tmp = mapping_path.with_extension("mapping.tmp");
        let stamp = checksum(&self.chunk_ids, &self.vectors);

        {
            let mut w = std::io::BufWriter::new(fs::File::create(&index_tmp)?);
            w.write_all(MAGIC)?;
            w.write_all(&VERSION.to_le_bytes())?;
            w.write_all(&(self.dim as u32).to_le_bytes())?;
            w.write_all(&(self.vectors.len() as u32).to_le_bytes())?;
            w.write_all(&stamp.to_le_bytes())?;
            for v in &self.vectors {
                w.write_all(&vec_to_blob(v))?;
            }
            w.flush()?;
        }
        {
            let mut w = std::io::BufWriter::new(fs::File::create(&mapping_tmp)?);
            writeln!(w, "# {:016x}", stamp)?;
            for id in &self.chunk_ids {
                writeln!(w, "{}", id.0)?;
            }
            w.flush()?;
        }

        fs::rename(&index_tmp, &index_path)?;
        fs::rename(&mapping_tmp, &mapping_path)?;
        Ok(())
    }

    /// Read a cache pair. `Ok(None)` when either file is absent.
    pub fn read_cache(
        dir: &Path,
        collection_id: CollectionId,
        params: &IndexParams,
    ) -> Result<Option<Self>> {
        let (index_path, mapping_path) = cache_paths(dir, collection_id);
        if !index_path.exists() || !mapping_path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&index_path)?;
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(RagError::Index(format!(
                "{} is not an index cache",
                index_path.display()
            )));
        }
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let version = word(4);
        let dim = word(8) as usize;
        let count = word(12) as usize;
        let mut stamp = [0u8; 8];
        stamp.copy_from_slice(&bytes[16..24]);
        let stored = u64::from_le_bytes(stamp);
        if version != VERSION {
            return Err(RagError::Index(format!("unsupported cache version {}", version)));
        }
        if bytes.len() != HEADER_LEN + dim * count * 4 {
            return Err(RagError::Index(format!(
                "{} is truncated",
                index_path.display()
            )));
        }

        let mapping = fs::read_to_string(&mapping_path)?;
        let mut lines = mapping.lines();
        let mapping_stamp = lines
            .next()
            .and_then(|l| l.strip_prefix("# "))
            .and_then(|h| u64::from_str_radix(h.trim(), 16).ok());
        if mapping_stamp != Some(stored) {
            return Err(RagError::Index(format!(
                "{} does not belong to {}",
                mapping_path.display(),
                index_path.display()
            )));
        }
        let chunk_ids = lines
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                l.trim()
                    .parse::<i64>()
                    .map(ChunkId)
                    .map_err(|e| RagError::Index(format!("bad mapping line '{}': {}", l, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        if chunk_ids.len() != count {
            return Err(RagError::Index(format!(
                "mapping has {} ids but index has {} vectors",
                chunk_ids.len(),
                count
            )));
        }

        let vectors = if dim == 0 {
            Vec::new()
        } else {
            blob_to_vec(&bytes[HEADER_LEN..])
                .chunks_exact(dim)
                .map(|c| c.to_vec())
                .collect()
        };

        if checksum(&chunk_ids, &vectors) != stored {
            return Err(RagError::Index(format!(
                "{} checksum mismatch",
                index_path.display()
            )));
        }

        Ok(Some(Self::from_parts(dim, chunk_ids, vectors, params)))
    }
}

/// First 8 bytes of SHA-256 over the ids and vector bytes, in order.
fn checksum(chunk_ids: &[ChunkId], vectors: &[Vec<f32>]) -> u64 {
    let mut hasher = Sha256::new();
    for id in chunk_ids {
        hasher.update(id.0.to_le_bytes());
    }
    for v in vectors {
        hasher.update(vec_to_blob(v));
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

fn cache_paths(dir: &Path, collection_id: CollectionId) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{}.index", collection_id)),
        dir.join(format!("{}.mapping", collection_id)),
    )
}

#[derive(Default)]
struct IndexSlot {
    rebuild: tokio::sync::Mutex<()>,
    current: RwLock<Option<Arc<CollectionIndex>>>,
}

impl IndexSlot {
    fn get(&self) -> Option<Arc<CollectionIndex>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set(&self, index: Option<Arc<CollectionIndex>>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = index;
    }
}

/// Process-wide arena of per-collection indexes.
pub struct IndexManager {
    dir: PathBuf,
    params: IndexParams,
    slots: Mutex<HashMap<CollectionId, Arc<IndexSlot>>>,
}

impl IndexManager {
    pub fn new(dir: impl Into<PathBuf>, params: IndexParams) -> Self {
        Self {
            dir: dir.into(),
            params,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Slot for `id`, created on first use. Only load and rebuild create slots.
    fn slot(&self, id: CollectionId) -> Arc<IndexSlot> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id)
            .or_default()
            .clone()
    }

    fn existing_slot(&self, id: CollectionId) -> Option<Arc<IndexSlot>> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// The in-memory index for `id`, if loaded.
    pub fn current(&self, id: CollectionId) -> Option<Arc<CollectionIndex>> {
        self.existing_slot(id).and_then(|slot| slot.get())
    }

    pub fn is_loaded(&self, id: CollectionId) -> bool {
        self.current(id).is_some()
    }

    /// Vectors in the loaded index; 0 when not loaded.
    pub fn len(&self, id: CollectionId) -> usize {
        self.current(id).map(|i| i.len()).unwrap_or(0)
    }

    pub fn has_cache(&self, id: CollectionId) -> bool {
        let (index, mapping) = cache_paths(&self.dir, id);
        index.exists() && mapping.exists()
    }

    /// Ensure the index for `id` is in memory, hydrating from the disk
    /// cache if needed. Returns `false` when there is no usable cache.
    pub async fn load(&self, id: CollectionId) -> bool {
        let slot = self.slot(id);
        if slot.get().is_some() {
            return true;
        }

        let _guard = slot.rebuild.lock().await;
        if slot.get().is_some() {
            return true;
        }

        let dir = self.dir.clone();
        let params = self.params.clone();
        let read = tokio::task::spawn_blocking(move || {
            CollectionIndex::read_cache(&dir, id, &params)
        })
        .await;

        match read {
            Ok(Ok(Some(index))) => {
                debug!(collection_id = %id, vectors = index.len(), "index loaded from cache");
                slot.set(Some(Arc::new(index)));
                true
            }
            Ok(Ok(None)) => false,
            Ok(Err(e)) => {
                warn!(collection_id = %id, error = %e, "ignoring unreadable index cache");
                false
            }
            Err(e) => {
                warn!(collection_id = %id, error = %e, "index load task failed");
                false
            }
        }
    }

    /// Rebuild the index for `id` from storage, persist it and swap it in.
    /// Returns the number of indexed vectors.
    pub async fn rebuild(&self, store: &DocumentStore, id: CollectionId) -> Result<usize> {
        let slot = self.slot(id);
        let _guard = slot.rebuild.lock().await;

        let rows = store.index_rows(id).await?;
        let dir = self.dir.clone();
        let params = self.params.clone();

        let index = tokio::task::spawn_blocking(move || {
            let index = CollectionIndex::build(rows, &params);
            if let Err(e) = index.persist(&dir, id) {
                warn!(collection_id = %id, error = %e, "failed to persist index cache");
            }
            index
        })
        .await
        .map_err(|e| RagError::Index(format!("index build task failed: {}", e)))?;

        let count = index.len();
        slot.set(Some(Arc::new(index)));
        info!(collection_id = %id, vectors = count, "index rebuilt");
        Ok(count)
    }

    /// Search the loaded index for `id`. An unloaded collection yields nothing.
    pub async fn search(
        &self,
        id: CollectionId,
        query: Vec<f32>,
        k: usize,
    ) -> Result<Vec<(ChunkId, f32)>> {
        let Some(index) = self.current(id) else {
            return Ok(Vec::new());
        };
        if index.is_empty() {
            return Ok(Vec::new());
        }
        tokio::task::spawn_blocking(move || index.search(&query, k))
            .await
            .map_err(|e| RagError::Index(format!("index search task failed: {}", e)))
    }

    /// Forget the in-memory index and delete its cache files.
    pub async fn invalidate(&self, id: CollectionId) {
        let slot = self.existing_slot(id);
        let _guard = match &slot {
            Some(slot) => Some(slot.rebuild.lock().await),
            None => None,
        };
        if let Some(slot) = &slot {
            slot.set(None);
        }
        let (index, mapping) = cache_paths(&self.dir, id);
        for path in [index, mapping] {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove index cache");
                }
            }
        }
    }

    /// Drop all state for a deleted collection.
    pub async fn drop_collection(&self, id: CollectionId) {
        self.invalidate(id).await;
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rows() -> Vec<(ChunkId, Vec<f32>)> {
        vec![
            (ChunkId(10), vec![1.0, 0.0, 0.0]),
            (ChunkId(11), vec![0.0, 2.0, 0.0]),
            (ChunkId(12), vec![0.0, 0.0, 3.0]),
            (ChunkId(13), vec![1.0, 1.0, 0.0]),
        ]
    }

    #[test]
    fn test_build_normalizes_and_skips_bad_rows() {
        let mut input = rows();
        input.push((ChunkId(14), vec![0.0, 0.0, 0.0]));
        input.push((ChunkId(15), vec![1.0, 0.0]));
        let index = CollectionIndex::build(input, &IndexParams::default());
        assert_eq!(index.len(), 4);
        assert_eq!(index.dim(), 3);
        assert_eq!(
            index.chunk_ids(),
            &[ChunkId(10), ChunkId(11), ChunkId(12), ChunkId(13)]
        );
    }

    #[test]
    fn test_search_best_first() {
        let index = CollectionIndex::build(rows(), &IndexParams::default());
        let hits = index.search(&[0.0, 5.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, ChunkId(11));
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
        assert_eq!(hits[1].0, ChunkId(13));
        assert!(hits[0].1 >= hits[1].1);
    }

    #[test]
    fn test_search_caps_k_at_len() {
        let index = CollectionIndex::build(rows(), &IndexParams::default());
        assert_eq!(index.search(&[1.0, 0.0, 0.0], 50).len(), 4);
    }

    #[test]
    fn test_search_rejects_bad_query() {
        let index = CollectionIndex::build(rows(), &IndexParams::default());
        assert!(index.search(&[1.0, 0.0], 2).is_empty());
        assert!(index.search(&[0.0, 0.0, 0.0], 2).is_empty());
    }

    #[test]
    fn test_empty_index() {
        let index = CollectionIndex::build(Vec::new(), &IndexParams::default());
        assert!(index.is_empty());
        assert!(index.search(&[1.0], 3).is_empty());
    }

    #[test]
    fn test_persist_and_read_cache() {
        let tmp = TempDir::new().unwrap();
        let params = IndexParams::default();
        let index = CollectionIndex::build(rows(), &params);
        index.persist(tmp.path(), CollectionId(3)).unwrap();

        assert!(tmp.path().join("3.index").exists());
        assert!(tmp.path().join("3.mapping").exists());
        assert!(!tmp.path().join("3.index.tmp").exists());

        let loaded = CollectionIndex::read_cache(tmp.path(), CollectionId(3), &params)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.chunk_ids(), index.chunk_ids());
        assert_eq!(
            loaded.search(&[0.0, 0.0, 1.0], 1),
            index.search(&[0.0, 0.0, 1.0], 1)
        );
    }

    #[test]
    fn test_missing_cache_is_none() {
        let tmp = TempDir::new().unwrap();
        let loaded =
            CollectionIndex::read_cache(tmp.path(), CollectionId(9), &IndexParams::default())
                .unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_mismatched_mapping_is_error() {
        let tmp = TempDir::new().unwrap();
        let params = IndexParams::default();
        CollectionIndex::build(rows(), &params)
            .persist(tmp.path(), CollectionId(1))
            .unwrap();
        fs::write(tmp.path().join("1.mapping"), "10\n11\n").unwrap();
        assert!(CollectionIndex::read_cache(tmp.path(), CollectionId(1), &params).is_err());
    }

    #[test]
    fn test_mapping_from_another_index_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let params = IndexParams::default();
        CollectionIndex::build(rows(), &params)
            .persist(tmp.path(), CollectionId(1))
            .unwrap();

        // Same count and dimension, different ids
        let other: Vec<_> = rows()
            .into_iter()
            .map(|(id, v)| (ChunkId(id.0 + 10), v))
            .collect();
        CollectionIndex::build(other, &params)
            .persist(tmp.path(), CollectionId(2))
            .unwrap();

        fs::copy(tmp.path().join("2.mapping"), tmp.path().join("1.mapping")).unwrap();
        assert!(CollectionIndex::read_cache(tmp.path(), CollectionId(1), &params).is_err());
        assert!(CollectionIndex::read_cache(tmp.path(), CollectionId(2), &params)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_stale_index_file_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let params = IndexParams::default();
        CollectionIndex::build(rows(), &params)
            .persist(tmp.path(), CollectionId(1))
            .unwrap();
        let mapping = fs::read(tmp.path().join("1.mapping")).unwrap();

        // Same ids, different vectors: only the index file was replaced
        let changed: Vec<_> = rows()
            .into_iter()
            .map(|(id, mut v)| {
                v.reverse();
                (id, v)
            })
            .collect();
        CollectionIndex::build(changed, &params)
            .persist(tmp.path(), CollectionId(1))
            .unwrap();
        fs::write(tmp.path().join("1.mapping"), mapping).unwrap();

        assert!(CollectionIndex::read_cache(tmp.path(), CollectionId(1), &params).is_err());
    }

    #[tokio::test]
    async fn test_lookups_do_not_create_slots() {
        let tmp = TempDir::new().unwrap();
        let manager = IndexManager::new(tmp.path(), IndexParams::default());

        assert!(!manager.is_loaded(CollectionId(77)));
        assert!(manager.current(CollectionId(77)).is_none());
        assert_eq!(manager.len(CollectionId(77)), 0);
        assert!(manager
            .search(CollectionId(77), vec![1.0, 0.0, 0.0], 3)
            .await
            .unwrap()
            .is_empty());
        manager.invalidate(CollectionId(78)).await;

        assert!(manager.slots.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manager_load_reports_missing_and_corrupt() {
        let tmp = TempDir::new().unwrap();
        let manager = IndexManager::new(tmp.path(), IndexParams::default());
        assert!(!manager.load(CollectionId(1)).await);

        fs::write(tmp.path().join("2.index"), b"garbage").unwrap();
        fs::write(tmp.path().join("2.mapping"), "1\n").unwrap();
        assert!(!manager.load(CollectionId(2)).await);
        assert!(!manager.is_loaded(CollectionId(2)));
    }

    #[tokio::test]
    async fn test_manager_load_from_cache_then_invalidate() {
        let tmp = TempDir::new().unwrap();
        CollectionIndex::build(rows(), &IndexParams::default())
            .persist(tmp.path(), CollectionId(4))
            .unwrap();

        let manager = IndexManager::new(tmp.path(), IndexParams::default());
        assert!(manager.load(CollectionId(4)).await);
        assert!(manager.is_loaded(CollectionId(4)));
        let hits = manager
            .search(CollectionId(4), vec![1.0, 0.0, 0.0], 1)
            .await
            .unwrap();
        assert_eq!(hits[0].0, ChunkId(10));

        manager.invalidate(CollectionId(4)).await;
        assert!(!manager.is_loaded(CollectionId(4)));
        assert!(!manager.has_cache(CollectionId(4)));
    }
}
