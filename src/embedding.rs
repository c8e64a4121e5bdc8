//! Embedding collaborators and vector math.
//!
//! Embedding computation and cluster labelling live outside this crate; the
//! pipeline only sees the two traits below. A failed `embed` returns `None`
//! and the point is excluded from placement, never substituted with zeros.

use half::f16;

/// Opaque text-to-vector collaborator.
pub trait Embedder: Send + Sync {
    /// Returns `None` when the text could not be embedded.
    fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

/// Opaque cluster-labelling collaborator.
pub trait Labeller: Send + Sync {
    /// Produces a (title, summary) pair for a bounded sample of member
    /// texts. Callers degrade to untitled clusters on failure.
    fn label(&self, samples: &[String], context: Option<&str>) -> Result<(String, String), String>;
}

/// Cosine similarity between two vectors.
/// Returns 0.0 for mismatched or empty inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Cosine distance (1 - similarity), the ordering used for semantic paging.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Squared L2 distance, used to rank search-mode candidates and to assign
/// points to centroids. Mismatched lengths compare as infinitely far.
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// f32 slice -> little-endian blob (the on-row storage format).
pub fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Little-endian f32 blob -> vector. Trailing partial values are dropped.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// f32 slice -> little-endian f16 blob (the reduced-precision store format).
pub fn vec_to_f16_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 2);
    for x in v {
        out.extend_from_slice(&f16::from_f32(*x).to_le_bytes());
    }
    out
}

/// Little-endian f16 blob -> f32 vector.
pub fn f16_blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(2)
        .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&a, &b);
        assert!((sim - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(sim.abs() < 0.0001);
    }

    #[test]
    fn test_cosine_distance_mismatched_lengths() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_l2_squared() {
        let a = vec![0.0, 0.0];
        let b = vec![3.0, 4.0];
        assert!((l2_squared(&a, &b) - 25.0).abs() < 0.0001);
    }

    #[test]
    fn test_f32_blob_round_trip() {
        let v = vec![1.5, -2.25, 0.0, 1e-3];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn test_f16_blob_halves_storage_within_tolerance() {
        let v = vec![0.125, -0.5, 0.333, 10.0];
        let blob = vec_to_f16_blob(&v);
        assert_eq!(blob.len(), v.len() * 2);
        let back = f16_blob_to_vec(&blob);
        for (orig, round) in v.iter().zip(back.iter()) {
            assert!((orig - round).abs() < 0.01, "{} vs {}", orig, round);
        }
    }
}
