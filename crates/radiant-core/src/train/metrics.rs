//! Evaluation metrics: min-max normalization and ROC-AUC.

use crate::error::MetricError;

/// Rescale `scores` to [0, 1] over the whole set.
///
/// A constant input (max == min) maps to all zeros.
pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    let (min, max) = scores
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &s| {
            (lo.min(s), hi.max(s))
        });
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return vec![0.0; scores.len()];
    }
    scores.iter().map(|&s| (s - min) / range).collect()
}

/// Area under the ROC curve of `scores` against binary `labels` (non-zero =
/// positive).
///
/// Computed from the Mann-Whitney statistic with average ranks for ties, which
/// equals the trapezoidal area under the empirical ROC curve.
pub fn roc_auc(scores: &[f32], labels: &[u8]) -> Result<f64, MetricError> {
    if scores.len() != labels.len() {
        return Err(MetricError::LengthMismatch {
            scores: scores.len(),
            labels: labels.len(),
        });
    }
    if scores.is_empty() {
        return Err(MetricError::Empty {
            metric: "ROC-AUC".to_string(),
        });
    }

    let positives = labels.iter().filter(|&&l| l != 0).count();
    let negatives = labels.len() - positives;
    if positives == 0 {
        return Err(MetricError::SingleClass {
            present: "negative".to_string(),
        });
    }
    if negatives == 0 {
        return Err(MetricError::SingleClass {
            present: "positive".to_string(),
        });
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    // Sum of 1-based ranks of the positives, ties sharing their average rank.
    let mut positive_rank_sum = 0.0f64;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        let average_rank = (start + 1 + end) as f64 / 2.0;
        let tied_positives = order[start..end]
            .iter()
            .filter(|&&i| labels[i] != 0)
            .count();
        positive_rank_sum += average_rank * tied_positives as f64;
        start = end;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Ok((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}
