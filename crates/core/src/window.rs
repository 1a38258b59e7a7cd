//! Sliding-window arithmetic shared by the in-process window store and the
//! rate-limiter tests.
//!
//! A window is a time-ordered list of entry timestamps (epoch millis). On
//! each check the caller prunes entries older than the window, counts what
//! survives, and when at the limit reports how long until the oldest
//! surviving entry ages out.

/// Drop entries older than `now_ms - window_ms`, keeping the list ordered.
pub fn prune(entries: &mut Vec<i64>, now_ms: i64, window_ms: i64) {
    let cutoff = now_ms - window_ms;
    entries.retain(|&ts| ts > cutoff);
}

/// Whether the window still has room for one more entry.
pub fn has_capacity(entries: &[i64], limit: u32) -> bool {
    (entries.len() as u32) < limit
}

/// Milliseconds until the oldest surviving entry leaves the window.
///
/// Zero when the window is empty or the oldest entry has already aged out
/// (callers treat zero as "retry now").
pub fn retry_after_ms(entries: &[i64], now_ms: i64, window_ms: i64) -> i64 {
    match entries.first() {
        Some(&oldest) => (window_ms - (now_ms - oldest)).max(0),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_drops_aged_entries() {
        let mut entries = vec![100, 500, 900];
        prune(&mut entries, 1_000, 500);
        assert_eq!(entries, vec![900]);
    }

    #[test]
    fn prune_keeps_entries_inside_window() {
        let mut entries = vec![600, 700, 800];
        prune(&mut entries, 1_000, 500);
        assert_eq!(entries, vec![600, 700, 800]);
    }

    #[test]
    fn capacity_respects_limit() {
        assert!(has_capacity(&[1, 2], 3));
        assert!(!has_capacity(&[1, 2, 3], 3));
    }

    #[test]
    fn retry_after_counts_down_from_oldest() {
        // Oldest entry at t=600 with a 500ms window ages out at t=1100.
        let entries = vec![600, 900];
        assert_eq!(retry_after_ms(&entries, 1_000, 500), 100);
        assert_eq!(retry_after_ms(&entries, 1_050, 500), 50);
    }

    #[test]
    fn retry_after_clamps_to_zero() {
        let entries = vec![100];
        assert_eq!(retry_after_ms(&entries, 1_000, 500), 0);
        assert_eq!(retry_after_ms(&[], 1_000, 500), 0);
    }
}
