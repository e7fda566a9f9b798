pub const DEFAULT_SCORE_WINDOW: f64 = 0.5;

const WINDOW_EPSILON: f64 = 1e-9;

/// Mean of the trailing `ceil(len * window_fraction)` losses, clamped to at
/// least one and at most all of them. An empty history scores infinitely
/// badly so it can never win.
pub fn score(history: &[f64], window_fraction: f64) -> f64 {
    if history.is_empty() {
        return f64::INFINITY;
    }
    let n = history.len();
    // 25 * 0.28 is 7.000000000000001 in binary floating point
    let window = ((n as f64 * window_fraction - WINDOW_EPSILON).ceil() as usize).clamp(1, n);
    mean(&history[n - window..])
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::INFINITY;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Index of the lowest finite score; ties go to the earliest index. `None`
/// when no score is finite.
pub fn select_best(scores: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &s) in scores.iter().enumerate() {
        if !s.is_finite() {
            continue;
        }
        match best {
            Some((_, b)) if s >= b => {}
            _ => best = Some((idx, s)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Early-stop rule applied after a swarm member's trial segment. A member
/// stops when its trial mean misses the target by more than the margin, or
/// when the trial already covered every requested episode.
pub fn should_stop_after_trial(
    trial_score: f64,
    target_score: f64,
    margin: f64,
    num_episodes: u32,
    trial_episodes: u32,
) -> bool {
    trial_failed(trial_score, target_score, margin) || num_episodes == trial_episodes
}

pub fn trial_failed(trial_score: f64, target_score: f64, margin: f64) -> bool {
    trial_score.is_nan() || trial_score > target_score + margin
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_averages_trailing_half() {
        assert_eq!(score(&[10.0, 10.0, 2.0, 4.0], 0.5), 3.0);
        // ceil(5 * 0.5) = 3
        assert_eq!(score(&[100.0, 100.0, 1.0, 2.0, 3.0], 0.5), 2.0);
        assert_eq!(score(&[7.5], 0.5), 7.5);
        assert_eq!(score(&[1.0, 3.0], 1.0), 2.0);
        assert_eq!(score(&[1.0, 3.0], 0.01), 3.0);
    }

    #[test]
    fn window_is_exact_when_the_product_is_integral() {
        let mut history = vec![100.0; 18];
        history.extend_from_slice(&[1.0; 7]);
        assert_eq!(score(&history, 0.28), 1.0);
        assert_eq!(score(&history, 0.2), 1.0);
        // ceil(25 * 0.3) = 8
        assert_eq!(score(&history, 0.3), (100.0 + 7.0) / 8.0);
    }

    #[test]
    fn empty_history_never_wins() {
        assert_eq!(score(&[], 0.5), f64::INFINITY);
        assert_eq!(select_best(&[f64::INFINITY, 4.0]), Some(1));
    }

    #[test]
    fn select_best_prefers_earliest_of_ties() {
        assert_eq!(select_best(&[5.0, 1.0, 3.0, 1.0]), Some(1));
        assert_eq!(select_best(&[2.0, 0.5, 1.5]), Some(1));
        assert_eq!(select_best(&[f64::NAN, 3.0, 3.0]), Some(1));
        assert_eq!(select_best(&[f64::INFINITY, f64::NAN]), None);
        assert_eq!(select_best(&[]), None);
    }

    #[test]
    fn early_stop_rule() {
        assert!(should_stop_after_trial(20_000.0, 10.0, 1e4, 100, 5));
        assert!(!should_stop_after_trial(9_000.0, 10.0, 1e4, 100, 5));
        assert!(should_stop_after_trial(1.0, 10.0, 1e4, 5, 5));
        assert!(should_stop_after_trial(f64::NAN, 10.0, 1e4, 100, 5));
        assert!(!should_stop_after_trial(1e9, f64::INFINITY, 1e4, 100, 5));
    }
}
