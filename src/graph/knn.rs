//! Exact nearest-neighbor candidate search over a bag's instances.

use ndarray::{Array1, ArrayView2};

/// Brute-force squared-Euclidean index. Every query is an exact scan.
#[derive(Debug)]
pub(crate) struct NeighborIndex<'a> {
    features: ArrayView2<'a, f32>,
    squared_norms: Array1<f32>,
}

impl<'a> NeighborIndex<'a> {
    pub(crate) fn fit(features: ArrayView2<'a, f32>) -> Self {
        let squared_norms = features
            .rows()
            .into_iter()
            .map(|row| row.dot(&row))
            .collect();
        Self {
            features,
            squared_norms,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.features.nrows()
    }

    /// Returns up to `count` nearest instances to `query`, excluding `query` itself.
    ///
    /// Ordered by ascending distance; equal distances keep ascending index order.
    pub(crate) fn nearest(&self, query: usize, count: usize) -> Vec<usize> {
        let n = self.len();
        let count = count.min(n.saturating_sub(1));
        if count == 0 {
            return Vec::new();
        }

        let row = self.features.row(query);
        let mut distances: Vec<(usize, f32)> = (0..n)
            .filter(|&other| other != query)
            .map(|other| {
                let cross = row.dot(&self.features.row(other));
                let distance =
                    (self.squared_norms[query] + self.squared_norms[other] - 2.0 * cross).max(0.0);
                (other, distance)
            })
            .collect();

        let by_distance =
            |a: &(usize, f32), b: &(usize, f32)| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0));
        if count < distances.len() {
            distances.select_nth_unstable_by(count - 1, by_distance);
            distances.truncate(count);
        }
        distances.sort_by(by_distance);
        distances.into_iter().map(|(index, _)| index).collect()
    }
}
