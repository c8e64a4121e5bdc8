//! Per-job vector store: two flat scratch files, ids and reduced-precision
//! vectors, addressed by dense row index.
//!
//! The builder streams matching points out of the database in bounded
//! batches and appends them to `ids_{job}.dat` (i64 little-endian) and
//! `vecs_{job}.dat` (f16 little-endian, row-major). Downstream code opens
//! the finished files memory-mapped and addresses rows 0..N-1 directly; ids
//! are resolved only at persistence and labelling time. There is never an
//! id-to-row map sized to the corpus.
//!
//! The store is exclusively owned by its job and removed unconditionally at
//! job end; leftovers from a crashed process are swept by the startup purge.

use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use thiserror::Error;

use crate::config::{ClusterConfig, PointFilter};
use crate::db::Database;
use crate::embedding::{self, l2_squared, Embedder};

/// Rows fetched per keyset batch while streaming the export.
const BATCH: usize = 100;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("corrupt store: {0}")]
    Corrupt(String),
}

/// Shape of a built store. `n == 0` is an explicit non-error outcome:
/// nothing matched the filter and there is nothing to cluster.
#[derive(Debug, Clone)]
pub struct StoreMeta {
    pub ids_path: PathBuf,
    pub vecs_path: PathBuf,
    pub n: usize,
    pub dims: usize,
}

/// Deterministic per-job file names; no dims in the names, the meta carries
/// the shape.
pub fn store_paths(dir: &Path, job_id: i64) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("ids_{}.dat", job_id)),
        dir.join(format!("vecs_{}.dat", job_id)),
    )
}

/// Delete the scratch files for a job. Best-effort: missing files are fine.
pub fn cleanup_store(dir: &Path, job_id: i64) {
    let (ids_path, vecs_path) = store_paths(dir, job_id);
    for path in [ids_path, vecs_path] {
        let _ = std::fs::remove_file(path);
    }
}

fn empty_store(dir: &Path, job_id: i64) -> Result<StoreMeta, StoreError> {
    let (ids_path, vecs_path) = store_paths(dir, job_id);
    File::create(&ids_path)?;
    File::create(&vecs_path)?;
    Ok(StoreMeta {
        ids_path,
        vecs_path,
        n: 0,
        dims: 0,
    })
}

/// Build the store for one job.
///
/// Full export: every point matching the filter that has both a vector and
/// an attribution. Search mode (`config.search`): candidates ranked by
/// full-precision distance to the embedded query, top `search_limit` kept.
pub fn build_store(
    db: &Database,
    dir: &Path,
    filter: &PointFilter,
    config: &ClusterConfig,
    job_id: i64,
    embedder: Option<&dyn Embedder>,
) -> Result<StoreMeta, StoreError> {
    if config.search {
        build_store_search(db, dir, filter, config, job_id, embedder)
    } else {
        build_store_full(db, dir, filter, job_id)
    }
}

fn build_store_full(
    db: &Database,
    dir: &Path,
    filter: &PointFilter,
    job_id: i64,
) -> Result<StoreMeta, StoreError> {
    // Dimensionality comes from the first matching vector, never config
    let dims = match db.candidate_dims(filter)? {
        Some(dims) if dims > 0 => dims,
        _ => return empty_store(dir, job_id),
    };
    let expected = db.count_candidates(filter)? as usize;
    if expected == 0 {
        return empty_store(dir, job_id);
    }

    let (ids_path, vecs_path) = store_paths(dir, job_id);
    let mut ids_out = BufWriter::new(File::create(&ids_path)?);
    let mut vecs_out = BufWriter::new(File::create(&vecs_path)?);

    let mut written = 0usize;
    let mut last_id = i64::MIN;
    loop {
        let batch = db.candidates_after(filter, last_id, BATCH)?;
        if batch.is_empty() {
            break;
        }
        last_id = batch.last().map(|(id, _)| *id).unwrap_or(last_id);
        for (point_id, f16_blob) in batch {
            if f16_blob.len() != dims * 2 {
                eprintln!(
                    "[Store] Skipping point {}: vector has {} bytes, expected {}",
                    point_id,
                    f16_blob.len(),
                    dims * 2
                );
                continue;
            }
            ids_out.write_all(&point_id.to_le_bytes())?;
            vecs_out.write_all(&f16_blob)?;
            written += 1;
        }
    }
    ids_out.flush()?;
    vecs_out.flush()?;

    if written != expected {
        println!(
            "[Store] Job {}: wrote {} rows (count query said {})",
            job_id, written, expected
        );
    }
    Ok(StoreMeta {
        ids_path,
        vecs_path,
        n: written,
        dims,
    })
}

/// Ranking candidate held in the bounded top-K heap. Max-heap order on
/// (distance, id), so the worst survivor is always on top.
struct Candidate {
    dist: f32,
    point_id: i64,
    f16_blob: Vec<u8>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.dist.total_cmp(&other.dist).is_eq() && self.point_id == other.point_id
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then(self.point_id.cmp(&other.point_id))
    }
}

fn build_store_search(
    db: &Database,
    dir: &Path,
    filter: &PointFilter,
    config: &ClusterConfig,
    job_id: i64,
    embedder: Option<&dyn Embedder>,
) -> Result<StoreMeta, StoreError> {
    let limit = config.search_limit.unwrap_or(0);
    let query = filter.query.as_deref().unwrap_or("");
    if limit == 0 || query.is_empty() {
        return empty_store(dir, job_id);
    }

    // A query that cannot be embedded has no candidates to rank
    let query_vec = match embedder.and_then(|e| e.embed(query)) {
        Some(v) => v,
        None => {
            println!("[Store] Job {}: query embedding unavailable, empty store", job_id);
            return empty_store(dir, job_id);
        }
    };

    // Stream every candidate, keep only the top `limit` by full-precision
    // distance. The heap bounds memory at limit rows regardless of corpus
    // size; ranking at the source is not available without a vector index.
    let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(limit + 1);
    let mut last_id = i64::MIN;
    loop {
        let batch = db.search_candidates_after(filter, last_id, BATCH)?;
        if batch.is_empty() {
            break;
        }
        last_id = batch.last().map(|(id, _, _)| *id).unwrap_or(last_id);
        for (point_id, full_blob, f16_blob) in batch {
            let vector = embedding::blob_to_vec(&full_blob);
            heap.push(Candidate {
                dist: l2_squared(&query_vec, &vector),
                point_id,
                f16_blob,
            });
            if heap.len() > limit {
                heap.pop();
            }
        }
    }

    let ranked = heap.into_sorted_vec();
    let dims = match ranked.first() {
        Some(first) => first.f16_blob.len() / 2,
        None => return empty_store(dir, job_id),
    };

    let (ids_path, vecs_path) = store_paths(dir, job_id);
    let mut ids_out = BufWriter::new(File::create(&ids_path)?);
    let mut vecs_out = BufWriter::new(File::create(&vecs_path)?);
    let mut written = 0usize;
    for candidate in &ranked {
        if candidate.f16_blob.len() != dims * 2 {
            continue;
        }
        ids_out.write_all(&candidate.point_id.to_le_bytes())?;
        vecs_out.write_all(&candidate.f16_blob)?;
        written += 1;
    }
    ids_out.flush()?;
    vecs_out.flush()?;

    Ok(StoreMeta {
        ids_path,
        vecs_path,
        n: written,
        dims,
    })
}

/// Read view over a built store: both files memory-mapped, rows addressed
/// by dense index only.
pub struct VectorStore {
    ids: Option<Mmap>,
    vecs: Option<Mmap>,
    n: usize,
    dims: usize,
}

impl VectorStore {
    pub fn open(meta: &StoreMeta) -> Result<Self, StoreError> {
        if meta.n == 0 {
            return Ok(Self {
                ids: None,
                vecs: None,
                n: 0,
                dims: 0,
            });
        }

        let ids_file = File::open(&meta.ids_path)?;
        let vecs_file = File::open(&meta.vecs_path)?;
        let ids = unsafe { Mmap::map(&ids_file)? };
        let vecs = unsafe { Mmap::map(&vecs_file)? };

        if ids.len() != meta.n * 8 {
            return Err(StoreError::Corrupt(format!(
                "ids file is {} bytes, expected {}",
                ids.len(),
                meta.n * 8
            )));
        }
        if vecs.len() != meta.n * meta.dims * 2 {
            return Err(StoreError::Corrupt(format!(
                "vectors file is {} bytes, expected {}",
                vecs.len(),
                meta.n * meta.dims * 2
            )));
        }

        Ok(Self {
            ids: Some(ids),
            vecs: Some(vecs),
            n: meta.n,
            dims: meta.dims,
        })
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// External point id for a store row.
    pub fn id_at(&self, row: usize) -> i64 {
        debug_assert!(row < self.n);
        let ids = self.ids.as_ref().expect("id_at on empty store");
        let offset = row * 8;
        let bytes: [u8; 8] = ids[offset..offset + 8].try_into().unwrap();
        i64::from_le_bytes(bytes)
    }

    /// Decoded f32 vector for a store row.
    pub fn vector_at(&self, row: usize) -> Vec<f32> {
        debug_assert!(row < self.n);
        let vecs = self.vecs.as_ref().expect("vector_at on empty store");
        let offset = row * self.dims * 2;
        embedding::f16_blob_to_vec(&vecs[offset..offset + self.dims * 2])
    }
}
