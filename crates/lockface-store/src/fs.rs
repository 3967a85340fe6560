//! Filesystem backend: one directory per user, one PNG per photo.
//!
//! Photo files are named `face_<YYYYmmdd_HHMMSS_ffffff>_<seq>.png`, so the
//! creation time travels with the file. Photos are ordered by timestamp,
//! then numerically by `seq`, which disambiguates photos stamped in the
//! same microsecond.

use crate::clock::{Clock, SystemClock};
use crate::photo::{PhotoEntry, PhotoHandle, PhotoStore, StoreError};
use crate::registry::{validate_name, UserRegistry};
use crate::retention::RetentionPolicy;
use chrono::{DateTime, NaiveDateTime, Utc};
use image::{GrayImage, ImageFormat};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PHOTO_PREFIX: &str = "face_";
const PHOTO_EXTENSION: &str = "png";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";
/// Length of a formatted timestamp: `YYYYmmdd_HHMMSS_ffffff`.
const TIMESTAMP_LEN: usize = 22;
const ACCEPTED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Directory-backed photo store and user registry.
pub struct FsStore {
    root: PathBuf,
    policy: RetentionPolicy,
    clock: Arc<dyn Clock>,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, policy: RetentionPolicy) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        tracing::debug!(root = %root.display(), "photo store opened");
        Ok(Self {
            root,
            policy,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the wall clock (tests pin time with a [`crate::ManualClock`]).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, user: &str) -> Result<PathBuf, StoreError> {
        validate_name(user)?;
        Ok(self.root.join(user))
    }

    fn photo_path(&self, photo: &PhotoHandle) -> Result<PathBuf, StoreError> {
        let dir = self.user_dir(&photo.user)?;
        if photo.key.is_empty() || photo.key.contains(['/', '\\']) || photo.key.starts_with('.') {
            return Err(StoreError::PhotoNotFound(photo.to_string()));
        }
        Ok(dir.join(&photo.key))
    }

    /// Next free sequence number for photos stamped `stamp` in `dir`.
    fn next_seq(dir: &Path, stamp: &str) -> Result<u32, StoreError> {
        let prefix = format!("{PHOTO_PREFIX}{stamp}_");
        let mut next = 0u32;
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let seq = rest.split('.').next().and_then(|s| s.parse::<u32>().ok());
            if let Some(seq) = seq {
                next = next.max(seq + 1);
            }
        }
        Ok(next)
    }
}

fn photo_file_name(stamp: &str, seq: u32) -> String {
    format!("{PHOTO_PREFIX}{stamp}_{seq:04}.{PHOTO_EXTENSION}")
}

/// Creation time embedded in a photo file name, if it carries one.
fn parse_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    let rest = file_name.strip_prefix(PHOTO_PREFIX)?;
    let stamp = rest.get(..TIMESTAMP_LEN)?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Insertion sequence number of a timestamped photo file name.
fn parse_seq(file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix(PHOTO_PREFIX)?.get(TIMESTAMP_LEN..)?;
    rest.strip_prefix('_')?.split('.').next()?.parse().ok()
}

fn is_photo_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ACCEPTED_EXTENSIONS.iter().any(|ok| ext.eq_ignore_ascii_case(ok)))
        .unwrap_or(false)
}

impl PhotoStore for FsStore {
    fn list_ordered(&self, user: &str) -> Result<Vec<PhotoEntry>, StoreError> {
        let dir = self.user_dir(user)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut photos = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !is_photo_file(&path) {
                continue;
            }
            let Some(key) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!(path = %path.display(), "skipping photo with non UTF-8 name");
                continue;
            };
            let created_at = match parse_timestamp(&key) {
                Some(ts) => ts,
                None => match entry.metadata().and_then(|m| m.modified()) {
                    Ok(modified) => DateTime::<Utc>::from(modified),
                    // Vanished between read_dir and stat.
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                },
            };
            photos.push(PhotoEntry {
                handle: PhotoHandle {
                    user: user.to_string(),
                    key,
                },
                created_at,
            });
        }

        photos.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| parse_seq(&a.handle.key).cmp(&parse_seq(&b.handle.key)))
                .then_with(|| a.handle.key.cmp(&b.handle.key))
        });
        Ok(photos)
    }

    fn add(&self, user: &str, image: &GrayImage) -> Result<usize, StoreError> {
        let dir = self.user_dir(user)?;
        fs::create_dir_all(&dir)?;

        let stamp = self.clock.now().format(TIMESTAMP_FORMAT).to_string();
        let mut seq = Self::next_seq(&dir, &stamp)?;
        let (path, file) = loop {
            let path = dir.join(photo_file_name(&stamp, seq));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (path, file),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => seq += 1,
                Err(e) => return Err(e.into()),
            }
        };

        let mut writer = BufWriter::new(file);
        if let Err(e) = image.write_to(&mut writer, ImageFormat::Png) {
            drop(writer);
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }
        drop(writer);

        let count = self.count(user)?;
        tracing::debug!(user, photo = %path.display(), count, "photo added");
        Ok(count)
    }

    fn delete(&self, photo: &PhotoHandle) -> Result<(), StoreError> {
        let path = self.photo_path(photo)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(%photo, "photo already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn load(&self, photo: &PhotoHandle) -> Result<GrayImage, StoreError> {
        let path = self.photo_path(photo)?;
        if !path.is_file() {
            return Err(StoreError::PhotoNotFound(photo.to_string()));
        }
        Ok(image::open(&path)?.into_luma8())
    }

    fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}

impl UserRegistry for FsStore {
    fn create(&self, name: &str) -> Result<bool, StoreError> {
        let dir = self.user_dir(name)?;
        match fs::create_dir(&dir) {
            Ok(()) => {
                tracing::info!(user = name, "identity created");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let dir = self.user_dir(name)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!(user = name, "identity deleted");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.user_dir(name)?.is_dir())
    }

    fn list(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut users = BTreeSet::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_name(name).is_ok() {
                    users.insert(name.to_string());
                }
            }
        }
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn face(shade: u8) -> GrayImage {
        GrayImage::from_pixel(128, 128, image::Luma([shade]))
    }

    fn store_with_clock(policy: RetentionPolicy) -> (TempDir, FsStore, Arc<ManualClock>) {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()));
        let store = FsStore::open(dir.path().join("users"), policy)
            .unwrap()
            .with_clock(clock.clone());
        (dir, store, clock)
    }

    #[test]
    fn test_unknown_user_reads_empty() {
        let (_dir, store, _) = store_with_clock(RetentionPolicy::default());
        assert_eq!(store.count("nobody").unwrap(), 0);
        assert!(store.list_ordered("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_add_creates_user_and_counts() {
        let (_dir, store, clock) = store_with_clock(RetentionPolicy::default());
        assert_eq!(store.add("alice", &face(10)).unwrap(), 1);
        clock.advance(Duration::seconds(1));
        assert_eq!(store.add("alice", &face(20)).unwrap(), 2);
        assert!(store.exists("alice").unwrap());
        assert_eq!(store.count("alice").unwrap(), 2);
    }

    #[test]
    fn test_list_ordered_by_timestamp_then_insertion() {
        let (_dir, store, clock) = store_with_clock(RetentionPolicy::default());
        let t0 = clock.now();

        // Same instant three times, then one earlier photo.
        store.add("alice", &face(1)).unwrap();
        store.add("alice", &face(2)).unwrap();
        store.add("alice", &face(3)).unwrap();
        clock.set(t0 - Duration::hours(1));
        store.add("alice", &face(0)).unwrap();

        let photos = store.list_ordered("alice").unwrap();
        assert_eq!(photos.len(), 4);
        assert_eq!(photos[0].created_at, t0 - Duration::hours(1));
        let shades: Vec<u8> = photos
            .iter()
            .map(|p| store.load(&p.handle).unwrap().get_pixel(0, 0)[0])
            .collect();
        assert_eq!(shades, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_tie_order_survives_deleting_earlier_sibling() {
        let (_dir, store, _) = store_with_clock(RetentionPolicy::default());
        store.add("alice", &face(1)).unwrap();
        store.add("alice", &face(2)).unwrap();
        let first = store.list_ordered("alice").unwrap()[0].handle.clone();
        PhotoStore::delete(&store, &first).unwrap();
        store.add("alice", &face(3)).unwrap();

        let photos = store.list_ordered("alice").unwrap();
        let shades: Vec<u8> = photos
            .iter()
            .map(|p| store.load(&p.handle).unwrap().get_pixel(0, 0)[0])
            .collect();
        assert_eq!(shades, vec![2, 3]);
    }

    #[test]
    fn test_sequence_compared_numerically() {
        let (_dir, store, clock) = store_with_clock(RetentionPolicy::default());
        let stamp = clock.now().format(TIMESTAMP_FORMAT).to_string();
        let user_dir = store.root().join("alice");
        fs::create_dir_all(&user_dir).unwrap();
        for seq in [10000, 9999, 2] {
            fs::write(user_dir.join(photo_file_name(&stamp, seq)), b"").unwrap();
        }

        let seqs: Vec<Option<u32>> = store
            .list_ordered("alice")
            .unwrap()
            .iter()
            .map(|p| parse_seq(&p.handle.key))
            .collect();
        assert_eq!(seqs, vec![Some(2), Some(9999), Some(10000)]);
    }

    #[test]
    fn test_timestamp_round_trips_through_file_name() {
        let (_dir, store, clock) = store_with_clock(RetentionPolicy::default());
        let at = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 58).unwrap() + Duration::microseconds(123_456);
        clock.set(at);
        store.add("alice", &face(1)).unwrap();
        let photos = store.list_ordered("alice").unwrap();
        assert_eq!(photos[0].created_at, at);
        assert!(photos[0].handle.key.starts_with("face_20251231_235958_123456_"));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store, _) = store_with_clock(RetentionPolicy::default());
        store.add("alice", &face(1)).unwrap();
        let handle = store.list_ordered("alice").unwrap()[0].handle.clone();
        PhotoStore::delete(&store, &handle).unwrap();
        PhotoStore::delete(&store, &handle).unwrap();
        let missing = PhotoHandle {
            user: "ghost".into(),
            key: "face_missing.png".into(),
        };
        PhotoStore::delete(&store, &missing).unwrap();
        assert_eq!(store.count("alice").unwrap(), 0);
    }

    #[test]
    fn test_load_missing_photo() {
        let (_dir, store, _) = store_with_clock(RetentionPolicy::default());
        let missing = PhotoHandle {
            user: "alice".into(),
            key: "face_missing.png".into(),
        };
        assert!(matches!(store.load(&missing), Err(StoreError::PhotoNotFound(_))));
    }

    #[test]
    fn test_registry_create_delete_list() {
        let (_dir, store, _) = store_with_clock(RetentionPolicy::default());
        assert!(store.create("alice").unwrap());
        assert!(!store.create("alice").unwrap());
        assert!(store.create("bob").unwrap());
        store.add("bob", &face(5)).unwrap();

        let users: Vec<String> = store.list().unwrap().into_iter().collect();
        assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);

        assert!(UserRegistry::delete(&store, "bob").unwrap());
        assert!(!UserRegistry::delete(&store, "bob").unwrap());
        assert_eq!(store.count("bob").unwrap(), 0);
        assert!(!store.exists("bob").unwrap());
    }

    #[test]
    fn test_invalid_user_name_rejected() {
        let (_dir, store, _) = store_with_clock(RetentionPolicy::default());
        assert!(matches!(store.add("../escape", &face(1)), Err(StoreError::InvalidUser(_))));
        assert!(matches!(store.create(""), Err(StoreError::InvalidUser(_))));
    }

    #[test]
    fn test_legacy_photo_uses_modified_time() {
        let (_dir, store, _) = store_with_clock(RetentionPolicy::default());
        store.create("alice").unwrap();
        let legacy = store.root().join("alice").join("old_capture.jpg");
        face(7).save_with_format(&legacy, ImageFormat::Jpeg).unwrap();
        fs::write(store.root().join("alice").join("notes.txt"), b"ignored").unwrap();

        let photos = store.list_ordered("alice").unwrap();
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].handle.key, "old_capture.jpg");
    }

    // --- retention through add_and_retain ---

    fn seed(store: &FsStore, clock: &ManualClock, user: &str, count: usize) {
        for i in 0..count {
            store.add(user, &face(i as u8)).unwrap();
            clock.advance(Duration::seconds(1));
        }
    }

    #[test]
    fn test_retention_trims_aged_photos_outside_recent_window() {
        let policy = RetentionPolicy {
            max_photos_per_user: 100,
            retention_days: 90,
            min_recent_to_keep: 50,
        };
        let (_dir, store, clock) = store_with_clock(policy);
        let now = clock.now();

        clock.set(now - Duration::days(120));
        seed(&store, &clock, "alice", 60);
        clock.set(now - Duration::days(10));
        seed(&store, &clock, "alice", 50);
        assert_eq!(store.count("alice").unwrap(), 110);

        clock.set(now);
        let report = store.add_and_retain("alice", &face(255)).unwrap();
        assert_eq!(report.aged_out, 60);
        assert_eq!(report.trimmed, 0);
        assert_eq!(report.remaining, 51);

        let photos = store.list_ordered("alice").unwrap();
        assert_eq!(photos.len(), 51);
        let cutoff = policy.cutoff(now);
        assert!(photos.iter().all(|p| p.created_at >= cutoff));
    }

    #[test]
    fn test_retention_ceiling_only_removes_oldest() {
        let policy = RetentionPolicy {
            max_photos_per_user: 100,
            retention_days: 90,
            min_recent_to_keep: 50,
        };
        let (_dir, store, clock) = store_with_clock(policy);
        seed(&store, &clock, "alice", 100);
        let oldest = store.list_ordered("alice").unwrap()[0].clone();

        let report = store.add_and_retain("alice", &face(255)).unwrap();
        assert_eq!(report.aged_out, 0);
        assert_eq!(report.trimmed, 1);
        assert_eq!(store.count("alice").unwrap(), 100);

        let photos = store.list_ordered("alice").unwrap();
        assert!(photos.iter().all(|p| p.handle != oldest.handle));
        assert_eq!(store.load(&photos[99].handle).unwrap().get_pixel(0, 0)[0], 255);
    }

    #[test]
    fn test_retention_recent_photos_survive_any_age() {
        let policy = RetentionPolicy {
            max_photos_per_user: 100,
            retention_days: 0,
            min_recent_to_keep: 5,
        };
        let (_dir, store, clock) = store_with_clock(policy);
        clock.set(clock.now() - Duration::days(365));
        seed(&store, &clock, "alice", 10);
        let newest_before: Vec<PhotoHandle> = store.list_ordered("alice").unwrap()[6..]
            .iter()
            .map(|p| p.handle.clone())
            .collect();

        clock.set(clock.now() + Duration::days(365));
        store.add_and_retain("alice", &face(200)).unwrap();

        // The fresh photo is not past a zero-day cutoff; the four older
        // photos inside the newest five are exempt.
        let photos = store.list_ordered("alice").unwrap();
        assert_eq!(photos.len(), 5);
        for handle in newest_before {
            assert!(photos.iter().any(|p| p.handle == handle));
        }
    }

    #[test]
    fn test_retention_ceiling_holds_when_exemption_covers_everything() {
        let policy = RetentionPolicy {
            max_photos_per_user: 10,
            retention_days: 1,
            min_recent_to_keep: 10,
        };
        let (_dir, store, clock) = store_with_clock(policy);
        clock.set(clock.now() - Duration::days(30));
        seed(&store, &clock, "alice", 10);
        clock.set(clock.now() + Duration::days(30));

        for _ in 0..5 {
            store.add_and_retain("alice", &face(9)).unwrap();
            assert!(store.count("alice").unwrap() <= 10);
        }
    }
}
