//! Embedding provider trait, similarity capability, and vector utilities.
//!
//! The dedup step never computes embeddings itself. It is written against
//! two abstract capabilities:
//!
//! - [`EmbeddingProvider`]: `text → fixed-length vector` (implemented by
//!   the app crate: OpenAI, Ollama, fastembed).
//! - [`Similarity`]: `(vector, vector) → score in [0, 1]`; [`Cosine`] is
//!   the default and the only metric persisted today.

/// Trait for embedding providers.
///
/// Implementations are created by the application; the core only needs
/// their metadata to record which model produced the stored vectors.
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
}

/// Pluggable similarity metric used for duplicate detection.
pub trait Similarity: Send + Sync {
    /// Short name persisted with the knowledge-base settings.
    fn name(&self) -> &str;

    /// Score two vectors. Must return a value in `[0.0, 1.0]`, where
    /// `1.0` means identical.
    fn score(&self, a: &[f32], b: &[f32]) -> f32;
}

/// Cosine similarity clamped to `[0, 1]`.
///
/// Opposite or orthogonal vectors both score `0.0`; for deduplication
/// only "how alike" matters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cosine;

impl Similarity for Cosine {
    fn name(&self) -> &str {
        "cosine"
    }

    fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        cosine_similarity(a, b).clamp(0.0, 1.0)
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use feedback_harness_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, and zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Fold `incoming` into a running mean of `count` vectors.
///
/// `centroid` holds the mean of the first `count` vectors; the result is
/// the mean of all `count + 1`. A length mismatch keeps the current
/// centroid unchanged.
pub fn update_centroid(centroid: &[f32], count: u32, incoming: &[f32]) -> Vec<f32> {
    if centroid.len() != incoming.len() || count == 0 {
        return if count == 0 {
            incoming.to_vec()
        } else {
            centroid.to_vec()
        };
    }
    let n = count as f32;
    centroid
        .iter()
        .zip(incoming.iter())
        .map(|(c, x)| (c * n + x) / (n + 1.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_metric_clamps_opposite_to_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
        assert_eq!(Cosine.score(&a, &b), 0.0);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_update_centroid_is_running_mean() {
        let c1 = update_centroid(&[], 0, &[1.0, 0.0]);
        assert_eq!(c1, vec![1.0, 0.0]);
        let c2 = update_centroid(&c1, 1, &[0.0, 1.0]);
        assert_eq!(c2, vec![0.5, 0.5]);
        let c3 = update_centroid(&c2, 2, &[0.5, 0.5]);
        assert!((c3[0] - 0.5).abs() < 1e-6 && (c3[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_update_centroid_ignores_mismatched_dims() {
        let c = update_centroid(&[1.0, 1.0], 3, &[1.0]);
        assert_eq!(c, vec![1.0, 1.0]);
    }
}
