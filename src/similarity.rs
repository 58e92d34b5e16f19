//! Semantic similarity calculations for embeddings
//!
//! Cosine similarity/distance, centroids, and the weighted running average
//! used when a persisted category absorbs a new run's centroid.

/// Cosine similarity between two embedding vectors
/// Returns a value between -1.0 and 1.0 (1.0 = identical, 0.0 = orthogonal)
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

    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Cosine distance in [0, 2] (0 = same direction)
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    (1.0 - cosine_similarity(a, b)).max(0.0)
}

/// Distance between two vectors already normalized to unit length.
/// Skips the norm computation; used in the clustering inner loops.
pub fn unit_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    (1.0 - dot.clamp(-1.0, 1.0)).max(0.0)
}

/// L2-normalize a vector. Zero vectors are returned unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// Compute the centroid (average) of multiple embeddings
/// Returns a normalized centroid vector
pub fn compute_centroid(embeddings: &[&[f32]]) -> Option<Vec<f32>> {
    let weighted: Vec<(&[f32], usize)> = embeddings.iter().map(|e| (*e, 1)).collect();
    weighted_centroid(&weighted)
}

/// Weighted mean of vectors, normalized.
/// Vectors with a different dimension than the first one, or zero weight, are skipped.
pub fn weighted_centroid(parts: &[(&[f32], usize)]) -> Option<Vec<f32>> {
    let dim = parts.first()?.0.len();
    if dim == 0 {
        return None;
    }

    let mut centroid = vec![0.0f32; dim];
    let mut total = 0usize;
    for (emb, weight) in parts {
        if emb.len() != dim || *weight == 0 {
            continue;
        }
        let w = *weight as f32;
        for (i, &val) in emb.iter().enumerate() {
            centroid[i] += val * w;
        }
        total += weight;
    }

    if total == 0 {
        return None;
    }

    let n = total as f32;
    for val in &mut centroid {
        *val /= n;
    }

    Some(normalize(&centroid))
}

/// Running average of a persisted centroid with a freshly computed one,
/// weighted by their member counts.
pub fn running_average(
    previous: &[f32],
    previous_weight: usize,
    current: &[f32],
    current_weight: usize,
) -> Vec<f32> {
    if previous.len() != current.len() || previous_weight == 0 {
        return normalize(current);
    }
    weighted_centroid(&[(previous, previous_weight), (current, current_weight)])
        .unwrap_or_else(|| normalize(current))
}
