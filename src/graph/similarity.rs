use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

/// Compute cosine similarity between two vectors.
///
/// Zero vectors have similarity 0.0 with everything. The result is clamped to [-1, 1].
#[must_use]
pub fn cosine_similarity(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();
    cosine_with_norms(a, b, norm_a, norm_b)
}

/// Cosine similarity with precomputed L2 norms.
#[must_use]
pub fn cosine_with_norms(
    a: ArrayView1<'_, f32>,
    b: ArrayView1<'_, f32>,
    norm_a: f32,
    norm_b: f32,
) -> f32 {
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (a.dot(&b) / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// L2 norm of every row.
#[must_use]
pub fn row_norms(features: ArrayView2<'_, f32>) -> Array1<f32> {
    features.map_axis(Axis(1), |row| row.dot(&row).sqrt())
}
