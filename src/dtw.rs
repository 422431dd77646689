// Dynamic time warping over inter-onset interval sequences.

/// DTW distance between two sequences with absolute-difference local cost.
///
/// Full dynamic-programming table; sequences here are interval lists (a few
/// dozen entries), so the quadratic cost is irrelevant.
pub fn dtw_distance(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return f64::INFINITY;
    }

    let (n, m) = (a.len(), b.len());
    let mut table = vec![vec![f64::INFINITY; m + 1]; n + 1];
    table[0][0] = 0.0;

    for i in 1..=n {
        for j in 1..=m {
            let cost = (a[i - 1] - b[j - 1]).abs();
            let best = table[i - 1][j]
                .min(table[i][j - 1])
                .min(table[i - 1][j - 1]);
            table[i][j] = cost + best;
        }
    }

    table[n][m]
}

/// Similarity score in [0, 100] between two onset sequences, compared by the
/// shape of their interval patterns rather than absolute placement.
///
/// The DTW distance is normalized by `max(n, m) * mean(reference intervals)`
/// so that a pattern played against itself scores 100 regardless of tempo
/// magnitude.
pub fn compare_rhythms(user_onsets_ms: &[f64], reference_onsets_ms: &[f64]) -> f64 {
    let user_intervals = intervals(user_onsets_ms);
    let ref_intervals = intervals(reference_onsets_ms);
    if user_intervals.is_empty() || ref_intervals.is_empty() {
        return 0.0;
    }

    let mean_ref = ref_intervals.iter().sum::<f64>() / ref_intervals.len() as f64;
    if mean_ref <= 0.0 {
        return 0.0;
    }

    let distance = dtw_distance(&user_intervals, &ref_intervals);
    let normalized =
        distance / (user_intervals.len().max(ref_intervals.len()) as f64 * mean_ref);

    (100.0 * (1.0 - normalized)).max(0.0)
}

pub(crate) fn intervals(onsets_ms: &[f64]) -> Vec<f64> {
    onsets_ms.windows(2).map(|w| w[1] - w[0]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtw_identical_sequences() {
        let seq = [500.0, 500.0, 250.0, 250.0];
        assert_eq!(dtw_distance(&seq, &seq), 0.0);
    }

    #[test]
    fn test_dtw_known_distance() {
        // Single mismatched element
        let a = [100.0, 200.0];
        let b = [100.0, 250.0];
        assert!((dtw_distance(&a, &b) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_dtw_empty_is_infinite() {
        assert!(dtw_distance(&[], &[1.0]).is_infinite());
    }

    #[test]
    fn test_compare_identical_rhythm_is_100() {
        let onsets = [0.0, 500.0, 1000.0, 1500.0];
        assert!((compare_rhythms(&onsets, &onsets) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_compare_similar_beats_high_score() {
        let reference = [0.0, 500.0, 1000.0, 1500.0];
        let user = [0.0, 520.0, 990.0, 1510.0];
        let score = compare_rhythms(&user, &reference);
        assert!(score > 85.0, "score {}", score);
    }

    #[test]
    fn test_compare_different_rhythm_lower_score() {
        let reference = [0.0, 500.0, 1000.0, 1500.0];
        let scrambled = [0.0, 100.0, 900.0, 1000.0, 1900.0];
        let similar = compare_rhythms(&reference, &reference);
        let different = compare_rhythms(&scrambled, &reference);
        assert!(different < similar);
    }

    #[test]
    fn test_compare_too_few_onsets() {
        assert_eq!(compare_rhythms(&[0.0], &[0.0, 500.0]), 0.0);
        assert_eq!(compare_rhythms(&[], &[]), 0.0);
    }
}
