//! Group-relative advantage estimation and beam ranking.
//!
//! The group supplies its own baseline:
//!
//!   A_i = (V_i - mean(V)) / max(std(V), eps)
//!
//! with the population standard deviation. Without normalization the
//! advantages are just the mean-centered values.

use std::cmp::Ordering;

/// Mean and population standard deviation of `values`.
pub fn group_stats(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Compute group-relative advantages for one beam.
///
/// # Edge cases
///
/// - Empty input gives an empty vector.
/// - Identical values give exactly zero advantages.
/// - Values that differ only by rounding noise are divided by `epsilon`.
pub fn compute_group_advantages(values: &[f64], normalize: bool, epsilon: f64) -> Vec<f64> {
    if values.windows(2).all(|w| w[0] == w[1]) {
        return vec![0.0; values.len()];
    }
    let (mean, std) = group_stats(values);
    let scale = if normalize { std.max(epsilon) } else { 1.0 };
    values.iter().map(|v| (v - mean) / scale).collect()
}

/// What the ranking needs to know about one beam member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemberScore {
    pub trajectory_id: usize,
    pub value: f64,
    pub advantage: f64,
    pub turns: usize,
}

/// Order members best first and return their positions in `scores`.
///
/// Higher advantage wins; equal values fall back to fewer turns, then to the
/// lower trajectory id.
pub fn rank_members(scores: &[MemberScore]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| compare_members(&scores[a], &scores[b]));
    order
}

fn compare_members(a: &MemberScore, b: &MemberScore) -> Ordering {
    b.advantage
        .total_cmp(&a.advantage)
        .then_with(|| b.value.total_cmp(&a.value))
        .then_with(|| a.turns.cmp(&b.turns))
        .then_with(|| a.trajectory_id.cmp(&b.trajectory_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn score(id: usize, value: f64, turns: usize) -> MemberScore {
        MemberScore {
            trajectory_id: id,
            value,
            advantage: value,
            turns,
        }
    }

    #[test]
    fn test_three_member_scenario() {
        let advs = compute_group_advantages(&[10.0, 5.0, 3.0], true, 1e-6);
        assert!((advs[0] - 1.365).abs() < 1e-2);
        assert!((advs[1] - (-0.341)).abs() < 1e-2);
        assert!((advs[2] - (-1.024)).abs() < 1e-2);

        let scores: Vec<_> = [10.0, 5.0, 3.0]
            .iter()
            .zip(&advs)
            .enumerate()
            .map(|(i, (v, a))| MemberScore {
                trajectory_id: i,
                value: *v,
                advantage: *a,
                turns: 5,
            })
            .collect();
        assert_eq!(rank_members(&scores)[0], 0);
    }

    #[test]
    fn test_identical_values_give_zero() {
        let advs = compute_group_advantages(&[2.0, 2.0, 2.0], true, 1e-6);
        assert!(advs.iter().all(|a| a.abs() < 1e-12));
    }

    #[test]
    fn test_unnormalized_is_mean_centered() {
        let advs = compute_group_advantages(&[4.0, 0.0], false, 1e-6);
        assert_eq!(advs, vec![2.0, -2.0]);
    }

    #[test]
    fn test_empty_group() {
        assert!(compute_group_advantages(&[], true, 1e-6).is_empty());
        assert_eq!(group_stats(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_tie_break_fewer_turns_then_lower_id() {
        let scores = vec![score(3, 1.0, 10), score(1, 1.0, 10), score(2, 1.0, 8), score(0, 0.5, 1)];
        let order = rank_members(&scores);
        let ids: Vec<_> = order.iter().map(|&i| scores[i].trajectory_id).collect();
        assert_eq!(ids, vec![2, 1, 3, 0]);
    }

    proptest! {
        #[test]
        fn prop_centered_advantages_sum_to_zero(
            values in proptest::collection::vec(-100.0f64..100.0, 2..16)
        ) {
            let centered: f64 = compute_group_advantages(&values, false, 1e-6).iter().sum();
            prop_assert!(centered.abs() < 1e-6);
            let normalized: f64 = compute_group_advantages(&values, true, 1e-6).iter().sum();
            prop_assert!(normalized.abs() < 1e-6);
        }

        #[test]
        fn prop_best_ranked_has_max_value(
            values in proptest::collection::vec(-50.0f64..50.0, 2..12)
        ) {
            let advs = compute_group_advantages(&values, true, 1e-6);
            let scores: Vec<_> = values
                .iter()
                .zip(&advs)
                .enumerate()
                .map(|(i, (v, a))| MemberScore { trajectory_id: i, value: *v, advantage: *a, turns: 5 })
                .collect();
            let best = rank_members(&scores)[0];
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            prop_assert_eq!(values[best], max);
        }
    }
}
