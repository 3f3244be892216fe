//! Splits the live change-number domain into contiguous windows of roughly
//! equal row count, so polling the unsent set costs one bounded scan per
//! window instead of one scan of the whole table.

use serde::Serialize;

/// Inclusive change-number window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChangeWindow {
    pub lower: i64,
    pub upper: i64,
}

impl ChangeWindow {
    pub fn contains(&self, change_number: i64) -> bool {
        (self.lower..=self.upper).contains(&change_number)
    }
}

/// Plans windows covering `[min, max]` exactly once each.
///
/// The number of windows is `1 + row_count / target_rows`; the width is the
/// domain size divided by that, rounded up. The row count is only an
/// estimate under concurrent writes, so windows are not guaranteed to hold
/// equal numbers of rows. Returns no windows for an empty domain.
pub fn plan_windows(min: i64, max: i64, row_count: u64, target_rows: u64) -> Vec<ChangeWindow> {
    if row_count == 0 || max < min {
        return Vec::new();
    }

    let chunks = 1 + u128::from(row_count / target_rows.max(1));
    // The full i64 domain holds 2^64 numbers, one more than u64 can count.
    let span = (i128::from(max) - i128::from(min) + 1) as u128;
    let width = span.div_ceil(chunks).max(1) as i128;

    let mut windows = Vec::new();
    let mut lower = min;
    while lower <= max {
        let upper = (i128::from(lower) + width - 1).min(i128::from(max)) as i64;
        windows.push(ChangeWindow { lower, upper });
        if upper == max {
            break;
        }
        lower = upper + 1;
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(windows: &[ChangeWindow], min: i64, max: i64) {
        assert_eq!(windows.first().unwrap().lower, min);
        assert_eq!(windows.last().unwrap().upper, max);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].upper + 1, pair[1].lower);
        }
    }

    #[test]
    fn test_empty_domain_has_no_windows() {
        assert!(plan_windows(0, 0, 0, 100).is_empty());
        assert!(plan_windows(10, 5, 3, 100).is_empty());
    }

    #[test]
    fn test_small_table_is_one_window() {
        let windows = plan_windows(1, 50, 50, 100);
        assert_eq!(windows, vec![ChangeWindow { lower: 1, upper: 50 }]);
    }

    #[test]
    fn test_windows_are_contiguous() {
        let windows = plan_windows(7, 10_006, 10_000, 1_000);
        assert_eq!(windows.len(), 11);
        assert_covers(&windows, 7, 10_006);
    }

    #[test]
    fn test_sparse_domain() {
        // Few rows spread over a wide range still get one window.
        let windows = plan_windows(1, 1_000_000, 3, 10_000);
        assert_eq!(windows.len(), 1);
        assert_covers(&windows, 1, 1_000_000);
    }

    #[test]
    fn test_full_i64_domain() {
        let windows = plan_windows(i64::MIN, i64::MAX, 10, 1);
        assert_eq!(windows.len(), 11);
        assert_covers(&windows, i64::MIN, i64::MAX);

        let whole = plan_windows(i64::MIN, i64::MAX, 1, 100);
        assert_eq!(
            whole,
            vec![ChangeWindow {
                lower: i64::MIN,
                upper: i64::MAX
            }]
        );
    }

    #[test]
    fn test_single_number_domain() {
        let windows = plan_windows(42, 42, 1, 1);
        assert_eq!(windows, vec![ChangeWindow { lower: 42, upper: 42 }]);
        assert!(windows[0].contains(42));
    }
}
