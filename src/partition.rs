//! Index-based partitioner: mini-batch k-means over a subset of store rows.
//!
//! Operates directly on row indices against the shared store; the subset is
//! never copied into a separate matrix and no id-keyed structure is built.
//! Deterministic for identical inputs and seed: centroid seeding uses a
//! seeded rng plus farthest-point refinement, and the single fitting pass
//! visits rows in subset order.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::embedding::l2_squared;
use crate::store::VectorStore;

/// One label per subset entry, in subset order. `k` is clamped to the
/// subset size so undersized subsets still terminate; empty groups in the
/// output are legal and are skipped by the caller.
pub fn partition(store: &VectorStore, subset: &[u32], k: usize, seed: u64) -> Vec<u32> {
    if subset.is_empty() {
        return vec![];
    }
    let k = k.min(subset.len()).max(1);
    if k == 1 {
        return vec![0; subset.len()];
    }

    let mut centroids = init_centroids(store, subset, k, seed);
    fit(store, subset, &mut centroids, k);
    assign(store, subset, &centroids)
}

/// Seeded farthest-point initialization: a random subset row first, then
/// each next centroid is the row furthest from all chosen so far. Spreads
/// seeds across separated groups, which a plain random draw does not
/// guarantee at small k.
fn init_centroids(store: &VectorStore, subset: &[u32], k: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = Vec::with_capacity(k);

    let first = subset[rng.gen_range(0..subset.len())];
    centroids.push(store.vector_at(first as usize));

    // min squared distance from each subset row to the chosen centroids
    let mut min_dist: Vec<f32> = subset
        .iter()
        .map(|&row| l2_squared(&store.vector_at(row as usize), &centroids[0]))
        .collect();

    while centroids.len() < k {
        let (best_pos, _) = min_dist
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap_or((0, &0.0));
        let next = store.vector_at(subset[best_pos] as usize);
        for (pos, &row) in subset.iter().enumerate() {
            let d = l2_squared(&store.vector_at(row as usize), &next);
            if d < min_dist[pos] {
                min_dist[pos] = d;
            }
        }
        centroids.push(next);
    }

    centroids
}

fn batch_size(k: usize) -> usize {
    (32 * k).clamp(256, 4096)
}

/// One incremental fitting pass over the subset in bounded batches, with
/// per-centroid count learning rates (each update moves a centroid by
/// 1/count toward the sample).
fn fit(store: &VectorStore, subset: &[u32], centroids: &mut [Vec<f32>], k: usize) {
    let batch = batch_size(k);
    let mut counts = vec![1.0f32; centroids.len()];

    for chunk in subset.chunks(batch) {
        for &row in chunk {
            let x = store.vector_at(row as usize);
            let j = nearest(&x, centroids);
            counts[j] += 1.0;
            let lr = 1.0 / counts[j];
            for (c, xi) in centroids[j].iter_mut().zip(x.iter()) {
                *c += lr * (xi - *c);
            }
        }
    }
}

/// Batched assignment pass: every subset entry gets exactly one label.
fn assign(store: &VectorStore, subset: &[u32], centroids: &[Vec<f32>]) -> Vec<u32> {
    let batch = batch_size(centroids.len());
    let mut labels = Vec::with_capacity(subset.len());
    for chunk in subset.chunks(batch) {
        for &row in chunk {
            let x = store.vector_at(row as usize);
            labels.push(nearest(&x, centroids) as u32);
        }
    }
    labels
}

fn nearest(x: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (j, c) in centroids.iter().enumerate() {
        let d = l2_squared(x, c);
        if d < best_dist {
            best_dist = d;
            best = j;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::vec_to_f16_blob;
    use crate::store::{store_paths, StoreMeta, VectorStore};
    use std::io::Write;
    use tempfile::TempDir;

    /// Write a store directly from f32 vectors, ids 1..=n.
    fn store_from_vectors(dir: &TempDir, job_id: i64, vectors: &[Vec<f32>]) -> VectorStore {
        let (ids_path, vecs_path) = store_paths(dir.path(), job_id);
        let mut ids_out = std::fs::File::create(&ids_path).unwrap();
        let mut vecs_out = std::fs::File::create(&vecs_path).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            ids_out.write_all(&((i + 1) as i64).to_le_bytes()).unwrap();
            vecs_out.write_all(&vec_to_f16_blob(v)).unwrap();
        }
        ids_out.flush().unwrap();
        vecs_out.flush().unwrap();
        let meta = StoreMeta {
            ids_path,
            vecs_path,
            n: vectors.len(),
            dims: vectors[0].len(),
        };
        VectorStore::open(&meta).unwrap()
    }

    fn two_blobs() -> Vec<Vec<f32>> {
        vec![
            vec![1.0, 0.05, 0.0],
            vec![0.95, 0.0, 0.05],
            vec![1.05, 0.0, 0.0],
            vec![0.9, 0.05, 0.05],
            vec![0.0, 1.0, 0.05],
            vec![0.05, 0.95, 0.0],
            vec![0.0, 1.05, 0.0],
        ]
    }

    #[test]
    fn test_every_index_gets_one_label() {
        let dir = TempDir::new().unwrap();
        let store = store_from_vectors(&dir, 1, &two_blobs());
        let subset: Vec<u32> = (0..7).collect();
        let labels = partition(&store, &subset, 2, 42);
        assert_eq!(labels.len(), 7);
        assert!(labels.iter().all(|&l| l < 2));
    }

    #[test]
    fn test_separated_blobs_split_four_three() {
        let dir = TempDir::new().unwrap();
        let store = store_from_vectors(&dir, 2, &two_blobs());
        let subset: Vec<u32> = (0..7).collect();
        let labels = partition(&store, &subset, 2, 42);

        // Rows 0-3 are one blob, rows 4-6 the other
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[2], labels[3]);
        assert_eq!(labels[4], labels[5]);
        assert_eq!(labels[5], labels[6]);
        assert_ne!(labels[0], labels[4]);
    }

    #[test]
    fn test_group_count_clamps_to_subset_size() {
        let dir = TempDir::new().unwrap();
        let store = store_from_vectors(&dir, 3, &two_blobs());
        let subset: Vec<u32> = vec![0, 4];
        let labels = partition(&store, &subset, 5, 42);
        assert_eq!(labels.len(), 2);
        assert!(labels.iter().all(|&l| l < 2));
    }

    #[test]
    fn test_singleton_subset_terminates() {
        let dir = TempDir::new().unwrap();
        let store = store_from_vectors(&dir, 4, &two_blobs());
        let labels = partition(&store, &[3], 3, 42);
        assert_eq!(labels, vec![0]);
    }

    #[test]
    fn test_deterministic_for_identical_inputs() {
        let dir = TempDir::new().unwrap();
        let store = store_from_vectors(&dir, 5, &two_blobs());
        let subset: Vec<u32> = (0..7).collect();
        let a = partition(&store, &subset, 3, 42);
        let b = partition(&store, &subset, 3, 42);
        assert_eq!(a, b);
    }

    #[test]
    fn test_subset_addressing_uses_given_rows_only() {
        let dir = TempDir::new().unwrap();
        let store = store_from_vectors(&dir, 6, &two_blobs());
        // Only blob-one rows: a 2-way split of near-identical vectors still
        // labels every entry
        let subset: Vec<u32> = vec![0, 1, 2, 3];
        let labels = partition(&store, &subset, 2, 42);
        assert_eq!(labels.len(), 4);
    }
}
