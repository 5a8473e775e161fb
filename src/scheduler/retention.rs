//! Retention pruning: bulk-deletes samples older than the horizon.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::db::{DbError, Store};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Oldest timestamp that survives pruning, or `None` when pruning is off.
pub fn retention_cutoff(now: DateTime<Utc>, keep_days: f64) -> Option<DateTime<Utc>> {
    if !keep_days.is_finite() || keep_days <= 0.0 {
        return None;
    }
    let keep = ChronoDuration::try_milliseconds((keep_days * MILLIS_PER_DAY) as i64)?;
    now.checked_sub_signed(keep)
}

/// Delete every sample captured more than `keep_days` before `now`.
///
/// A `keep_days` of zero or less disables pruning. Freed pages are left for
/// SQLite to reuse; no VACUUM is run.
pub fn prune(store: &Store, now: DateTime<Utc>, keep_days: f64) -> Result<usize, DbError> {
    let Some(cutoff) = retention_cutoff(now, keep_days) else {
        return Ok(0);
    };

    let deleted = store.delete_samples_before(cutoff)?;
    if deleted > 0 {
        tracing::info!(
            "Retention: deleted {} samples older than {}",
            deleted,
            cutoff.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SampleRow, TOTAL_IFACE};
    use chrono::TimeZone;

    fn seeded_store(now: DateTime<Utc>, ages_hours: &[i64]) -> Store {
        let store = Store::open_in_memory().unwrap();
        let rows: Vec<SampleRow> = ages_hours
            .iter()
            .map(|h| SampleRow::counters_only(now - ChronoDuration::hours(*h), "box", TOTAL_IFACE, None))
            .collect();
        store.record(&rows).unwrap();
        store
    }

    #[test]
    fn test_prune_mixed_ages() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        // 2 days = 48h; rows at 47h and 48h are kept, older ones go
        let store = seeded_store(now, &[0, 1, 23, 47, 48, 49, 72, 24 * 30]);

        let deleted = prune(&store, now, 2.0).unwrap();
        assert_eq!(deleted, 3);

        let remaining: Vec<DateTime<Utc>> = store.samples().unwrap().iter().map(|s| s.time).collect();
        assert_eq!(remaining.len(), 5);
        assert!(remaining.iter().all(|t| *t >= now - ChronoDuration::days(2)));
    }

    #[test]
    fn test_fractional_days() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let store = seeded_store(now, &[1, 11, 13]);
        assert_eq!(prune(&store, now, 0.5).unwrap(), 1);
        assert_eq!(store.count_samples().unwrap(), 2);
    }

    #[test]
    fn test_non_positive_keep_days_disables() {
        let now = Utc::now();
        let store = seeded_store(now, &[24 * 365, 24 * 3650]);
        assert_eq!(prune(&store, now, 0.0).unwrap(), 0);
        assert_eq!(prune(&store, now, -5.0).unwrap(), 0);
        assert_eq!(store.count_samples().unwrap(), 2);
        assert_eq!(retention_cutoff(now, f64::NAN), None);
    }
}
