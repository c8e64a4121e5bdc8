//! One clustering run, end to end: stage the vector store, build the tree,
//! drop the scratch files.
//!
//! Visibility and job status are the caller's concern. A run only writes
//! invisible nodes; the worker pool (or the CLI) finalises or fails the job
//! around it.

use std::path::Path;

use crate::config::JobParams;
use crate::db::Database;
use crate::embedding::{Embedder, Labeller};
use crate::store::{build_store, cleanup_store, VectorStore};
use crate::tree::{cluster_recursive, TreeContext};

/// Execute the build for `job_id`. Returns the root cluster id, or `None`
/// when the filter matched nothing (a legal, complete outcome).
///
/// The scratch store is removed on every path out of this function.
pub fn run_clustering(
    db: &Database,
    scratch_dir: &Path,
    params: &JobParams,
    job_id: i64,
    embedder: Option<&dyn Embedder>,
    labeller: Option<&dyn Labeller>,
) -> Result<Option<i64>, String> {
    let result = run_inner(db, scratch_dir, params, job_id, embedder, labeller);
    cleanup_store(scratch_dir, job_id);
    result
}

fn run_inner(
    db: &Database,
    scratch_dir: &Path,
    params: &JobParams,
    job_id: i64,
    embedder: Option<&dyn Embedder>,
    labeller: Option<&dyn Labeller>,
) -> Result<Option<i64>, String> {
    let meta = build_store(db, scratch_dir, &params.filters, &params.config, job_id, embedder)
        .map_err(|e| e.to_string())?;
    println!(
        "[Run] Job {}: staged {} points ({} dims)",
        job_id, meta.n, meta.dims
    );
    if meta.n == 0 {
        return Ok(None);
    }

    let store = VectorStore::open(&meta).map_err(|e| e.to_string())?;
    let filters_json = serde_json::to_string(&params.filters).map_err(|e| e.to_string())?;
    let config_json = serde_json::to_string(&params.config).map_err(|e| e.to_string())?;

    let ctx = TreeContext {
        db,
        store: &store,
        config: &params.config,
        filters_json: &filters_json,
        config_json: &config_json,
        job_id,
        embedder,
        labeller,
    };
    let subset: Vec<u32> = (0..store.len() as u32).collect();
    let root = cluster_recursive(&ctx, &subset, 0, None)?;
    println!("[Run] Job {}: tree built, root cluster {}", job_id, root);
    Ok(Some(root))
}
