//! Binary ROC curve, AUC and threshold selection.

/// ROC curve points, ordered by decreasing threshold.
///
/// The first point is `(0, 0)` at threshold `+inf`; collinear intermediate points are
/// dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    pub thresholds: Vec<f64>,
}

/// Operating point chosen by [`optimal_threshold`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperatingPoint {
    pub fpr: f64,
    pub tpr: f64,
    pub threshold: f64,
}

/// Computes the ROC curve of `scores` against binary `labels` (positive when `> 0.5`).
///
/// Without positives (or negatives) the corresponding rate is undefined; it is
/// reported as 0 so threshold selection still has a curve to work on.
#[must_use]
pub fn roc_curve(labels: &[f32], scores: &[f32]) -> RocCurve {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));

    // cumulative counts at the last index of every distinct score
    let mut tps = Vec::new();
    let mut fps = Vec::new();
    let mut thresholds = Vec::new();
    let mut true_positives = 0.0;
    for (position, &index) in order.iter().enumerate() {
        if labels[index] > 0.5 {
            true_positives += 1.0;
        }
        let last_of_run = order
            .get(position + 1)
            .is_none_or(|&next| scores[next] != scores[index]);
        if last_of_run {
            tps.push(true_positives);
            #[allow(clippy::cast_precision_loss)]
            fps.push((position + 1) as f64 - true_positives);
            thresholds.push(f64::from(scores[index]));
        }
    }

    let keep = non_collinear(&fps, &tps);
    let mut tps: Vec<f64> = keep.iter().map(|&i| tps[i]).collect();
    let mut fps: Vec<f64> = keep.iter().map(|&i| fps[i]).collect();
    let mut thresholds: Vec<f64> = keep.iter().map(|&i| thresholds[i]).collect();
    tps.insert(0, 0.0);
    fps.insert(0, 0.0);
    thresholds.insert(0, f64::INFINITY);

    let positives = tps.last().copied().unwrap_or_default();
    let negatives = fps.last().copied().unwrap_or_default();
    RocCurve {
        fpr: rates(&fps, negatives),
        tpr: rates(&tps, positives),
        thresholds,
    }
}

/// Indices to keep: the endpoints plus every point where the curve changes direction.
fn non_collinear(fps: &[f64], tps: &[f64]) -> Vec<usize> {
    let len = fps.len();
    if len <= 2 {
        return (0..len).collect();
    }
    let second_diff = |values: &[f64], i: usize| values[i + 1] - 2.0 * values[i] + values[i - 1];
    (0..len)
        .filter(|&i| {
            i == 0 || i == len - 1 || second_diff(fps, i) != 0.0 || second_diff(tps, i) != 0.0
        })
        .collect()
}

fn rates(counts: &[f64], total: f64) -> Vec<f64> {
    if total <= 0.0 {
        return vec![0.0; counts.len()];
    }
    counts.iter().map(|count| count / total).collect()
}

/// Area under the curve by the trapezoidal rule.
#[must_use]
pub fn auc(curve: &RocCurve) -> f64 {
    curve
        .fpr
        .windows(2)
        .zip(curve.tpr.windows(2))
        .map(|(x, y)| (x[1] - x[0]) * (y[1] + y[0]) / 2.0)
        .sum()
}

/// Whether both label values occur, i.e. whether AUC is defined.
#[must_use]
pub fn has_both_classes(labels: &[f32]) -> bool {
    labels.iter().any(|label| *label > 0.5) && labels.iter().any(|label| *label <= 0.5)
}

/// Point minimizing `(fpr - tpr) - penalty * tpr / (fpr + tpr + 1)`; the first one wins ties.
#[must_use]
pub fn optimal_threshold(curve: &RocCurve, prevalence_penalty: f64) -> OperatingPoint {
    let loss = |i: usize| {
        let (fpr, tpr) = (curve.fpr[i], curve.tpr[i]);
        (fpr - tpr) - prevalence_penalty * tpr / (fpr + tpr + 1.0)
    };
    let best = (0..curve.thresholds.len())
        .min_by(|&a, &b| loss(a).total_cmp(&loss(b)).then(a.cmp(&b)))
        .unwrap_or(0);
    OperatingPoint {
        fpr: curve.fpr.get(best).copied().unwrap_or_default(),
        tpr: curve.tpr.get(best).copied().unwrap_or_default(),
        threshold: curve.thresholds.get(best).copied().unwrap_or(f64::INFINITY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn matches_reference_curve() {
        // sklearn: roc_curve([0, 0, 1, 1], [0.1, 0.4, 0.35, 0.8])
        let curve = roc_curve(&[0.0, 0.0, 1.0, 1.0], &[0.1, 0.4, 0.35, 0.8]);
        assert_eq!(curve.fpr, vec![0.0, 0.0, 0.5, 0.5, 1.0]);
        assert_eq!(curve.tpr, vec![0.0, 0.5, 0.5, 1.0, 1.0]);
        assert!(curve.thresholds[0].is_infinite());
        assert!((curve.thresholds[1] - 0.8).abs() < 1e-6);
        assert!((curve.thresholds[4] - 0.1).abs() < 1e-6);
        assert!((auc(&curve) - 0.75).abs() < 1e-12);
    }

    #[rstest]
    #[case::perfect(&[0.0, 0.0, 1.0, 1.0], &[0.1, 0.2, 0.8, 0.9], 1.0)]
    #[case::inverted(&[1.0, 1.0, 0.0, 0.0], &[0.1, 0.2, 0.8, 0.9], 0.0)]
    #[case::all_tied(&[0.0, 1.0, 0.0, 1.0], &[0.5, 0.5, 0.5, 0.5], 0.5)]
    fn auc_cases(#[case] labels: &[f32], #[case] scores: &[f32], #[case] expected: f64) {
        let curve = roc_curve(labels, scores);
        assert!((auc(&curve) - expected).abs() < 1e-12);
    }

    #[test]
    fn collinear_points_are_dropped() {
        let curve = roc_curve(&[1.0, 1.0, 1.0, 0.0], &[0.9, 0.8, 0.7, 0.1]);
        // the step at 0.8 lies on the segment between 0.9 and 0.7
        assert_eq!(curve.thresholds.len(), 4);
        assert_eq!(curve.fpr, vec![0.0, 0.0, 0.0, 1.0]);
        assert!((curve.tpr[1] - 1.0 / 3.0).abs() < 1e-12);
        assert!((curve.thresholds[2] - 0.7).abs() < 1e-6);
    }

    #[test]
    fn optimal_threshold_separates_perfect_scores() {
        let curve = roc_curve(&[0.0, 0.0, 1.0, 1.0], &[0.1, 0.2, 0.8, 0.9]);
        let point = optimal_threshold(&curve, 0.0);
        assert!((point.threshold - 0.8).abs() < 1e-6);
        assert_eq!((point.fpr, point.tpr), (0.0, 1.0));
    }

    #[test]
    fn single_label_value_still_yields_a_threshold() {
        let labels = [0.0, 0.0, 0.0];
        assert!(!has_both_classes(&labels));
        let curve = roc_curve(&labels, &[0.3, 0.2, 0.9]);
        assert!(curve.tpr.iter().all(|tpr| *tpr == 0.0));
        let point = optimal_threshold(&curve, 0.0);
        assert!(point.threshold.is_infinite());
    }

    #[test]
    fn prevalence_penalty_favors_recall() {
        // without a penalty the tie between (0, 0.5) and (0.5, 1) resolves to the first
        let curve = roc_curve(&[0.0, 0.0, 1.0, 1.0], &[0.1, 0.4, 0.35, 0.8]);
        assert!((optimal_threshold(&curve, 0.0).threshold - 0.8).abs() < 1e-6);
        let point = optimal_threshold(&curve, 1.0);
        assert!((point.tpr - 1.0).abs() < 1e-12);
    }
}
