//! Photo retention: age-based pruning with a recency exemption, then a
//! hard per-user ceiling.

use crate::photo::{PhotoEntry, PhotoStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Limits enforced on every user's collection after a retention pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Hard upper bound on collection size.
    pub max_photos_per_user: usize,
    /// Photos older than this many days may be pruned.
    pub retention_days: u32,
    /// The newest N photos are never pruned for age.
    pub min_recent_to_keep: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_photos_per_user: 100,
            retention_days: 90,
            min_recent_to_keep: 50,
        }
    }
}

impl RetentionPolicy {
    /// Anything created strictly before this instant is past retention.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.retention_days))
    }
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Photos removed by the age phase.
    pub aged_out: usize,
    /// Photos removed by the ceiling phase.
    pub trimmed: usize,
    /// Collection size after the pass.
    pub remaining: usize,
}

/// Indices (into the oldest-first `photos`) that the age phase removes.
///
/// A photo qualifies when it is past the retention cutoff and is not
/// among the newest `min_recent_to_keep`.
pub fn age_eligible(photos: &[PhotoEntry], policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<usize> {
    let cutoff = policy.cutoff(now);
    let n = photos.len();
    photos
        .iter()
        .enumerate()
        .filter(|(i, photo)| photo.created_at < cutoff && n - 1 - i >= policy.min_recent_to_keep)
        .map(|(i, _)| i)
        .collect()
}

/// Run a retention pass over `user`'s collection.
pub fn apply<S>(store: &S, user: &str, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<RetentionReport, StoreError>
where
    S: PhotoStore + ?Sized,
{
    let photos = store.list_ordered(user)?;
    let mut report = RetentionReport::default();

    for idx in age_eligible(&photos, policy, now) {
        let photo = &photos[idx];
        store.delete(&photo.handle)?;
        report.aged_out += 1;
        tracing::debug!(photo = %photo.handle, created_at = %photo.created_at, "retention: aged out");
    }

    let remaining = store.list_ordered(user)?;
    let surplus = remaining.len().saturating_sub(policy.max_photos_per_user);
    for photo in remaining.iter().take(surplus) {
        store.delete(&photo.handle)?;
        report.trimmed += 1;
        tracing::debug!(photo = %photo.handle, "retention: trimmed to ceiling");
    }

    report.remaining = remaining.len() - surplus;

    if report.aged_out > 0 || report.trimmed > 0 {
        tracing::info!(
            user,
            aged_out = report.aged_out,
            trimmed = report.trimmed,
            remaining = report.remaining,
            "retention pass removed photos"
        );
    }

    Ok(report)
}
