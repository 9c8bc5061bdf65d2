//! Held-out evaluation metrics

/// Area under the ROC curve via the rank-sum statistic.
///
/// Tied scores receive their average rank. Returns `None` when the inputs
/// differ in length or one class is absent, since AUC is undefined there.
pub fn roc_auc(labels: &[u8], scores: &[f64]) -> Option<f64> {
    if labels.len() != scores.len() || labels.is_empty() {
        return None;
    }

    let positives = labels.iter().filter(|&&l| l == 1).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // ranks are 1-based; tied block [i, j] shares the mean rank
        let mean_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if labels[idx] == 1 {
                rank_sum_pos += mean_rank;
            }
        }
        i = j + 1;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some((rank_sum_pos - p * (p + 1.0) / 2.0) / (p * n))
}

/// Mean binary cross-entropy with probabilities clamped away from 0 and 1
pub fn log_loss(labels: &[u8], probabilities: &[f64]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let total: f64 = labels
        .iter()
        .zip(probabilities)
        .map(|(&y, &p)| {
            let p = p.clamp(1e-12, 1.0 - 1e-12);
            if y == 1 {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum();
    total / labels.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_ranking() {
        let auc = roc_auc(&[0, 0, 1, 1], &[0.1, 0.2, 0.8, 0.9]).unwrap();
        assert!((auc - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_ranking() {
        let auc = roc_auc(&[1, 1, 0, 0], &[0.1, 0.2, 0.8, 0.9]).unwrap();
        assert!(auc.abs() < 1e-12);
    }

    #[test]
    fn test_ties_count_half() {
        let auc = roc_auc(&[0, 1], &[0.5, 0.5]).unwrap();
        assert!((auc - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_known_value() {
        // pairs (pos, neg): (0.35 vs 0.1 ok), (0.35 vs 0.4 no), (0.8 vs both ok) -> 3/4
        let auc = roc_auc(&[0, 0, 1, 1], &[0.1, 0.4, 0.35, 0.8]).unwrap();
        assert!((auc - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_single_class_is_undefined() {
        assert!(roc_auc(&[1, 1, 1], &[0.1, 0.2, 0.3]).is_none());
        assert!(roc_auc(&[], &[]).is_none());
        assert!(roc_auc(&[0, 1], &[0.1]).is_none());
    }

    #[test]
    fn test_log_loss_prefers_confident_correct() {
        let good = log_loss(&[1, 0], &[0.9, 0.1]);
        let bad = log_loss(&[1, 0], &[0.1, 0.9]);
        assert!(good < bad);
        assert!(log_loss(&[1], &[1.0]).is_finite());
    }
}
