/// Trailing mean over `period` values ending at (and including) each index.
/// Positions without a full window are `None`.
pub fn rolling_mean(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() {
        return Vec::new();
    }
    if period == 0 || values.len() < period {
        return vec![None; values.len()];
    }

    let mut means = Vec::with_capacity(values.len());
    for _ in 0..period - 1 {
        means.push(None);
    }

    let mut window_sum: f64 = values[..period].iter().sum();
    means.push(Some(window_sum / period as f64));
    for i in period..values.len() {
        window_sum += values[i] - values[i - period];
        means.push(Some(window_sum / period as f64));
    }

    means
}

/// Number of `true` flags in the trailing `period` window. A window touching an
/// undefined flag is itself undefined.
pub fn rolling_count(flags: &[Option<bool>], period: usize) -> Vec<Option<u32>> {
    if period == 0 {
        return vec![None; flags.len()];
    }

    let mut counts = Vec::with_capacity(flags.len());
    for end in 0..flags.len() {
        if end + 1 < period {
            counts.push(None);
            continue;
        }
        let window = &flags[end + 1 - period..=end];
        let count = window
            .iter()
            .try_fold(0u32, |acc, flag| flag.map(|up| acc + u32::from(up)));
        counts.push(count);
    }

    counts
}

/// Moves every value `periods` positions later; the vacated head is `None`.
pub fn shift<T: Copy>(values: &[Option<T>], periods: usize) -> Vec<Option<T>> {
    (0..values.len())
        .map(|idx| {
            if idx < periods {
                None
            } else {
                values[idx - periods]
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_mean_leaves_partial_windows_undefined() {
        let means = rolling_mean(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(means[0], None);
        assert_eq!(means[1], None);
        assert!((means[2].unwrap() - 2.0).abs() < 1e-12);
        assert!((means[3].unwrap() - 3.0).abs() < 1e-12);
        assert!(rolling_mean(&[1.0, 2.0], 3).iter().all(Option::is_none));
    }

    #[test]
    fn rolling_count_propagates_gaps() {
        let flags = shift(&[Some(true), Some(false), Some(true), Some(true)], 1);
        assert_eq!(flags, vec![None, Some(true), Some(false), Some(true)]);
        let counts = rolling_count(&flags, 2);
        assert_eq!(counts, vec![None, None, Some(1), Some(1)]);
    }
}
