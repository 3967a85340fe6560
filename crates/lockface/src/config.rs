use crate::recognition::RecognitionTiming;
use crate::registration::PhotoLimits;
use lockface_hw::CaptureConfig;
use lockface_store::RetentionPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Root for user photos and the trained gallery.
    pub data_dir: PathBuf,
    pub gallery_path: PathBuf,
    /// Cosine distance below which a face counts as a match. Lower is stricter.
    pub distance_threshold: f32,
    pub max_initial_photos: usize,
    pub additional_photos_step: usize,
    pub max_photos_per_user: usize,
    pub retention_days: u32,
    /// Newest photos that age-based pruning never touches.
    pub min_recent_photos: usize,
    pub lock_poll_secs: u64,
    pub settle_secs: u64,
    pub camera_on_secs: u64,
    pub camera_off_secs: u64,
    /// Consecutive frame read failures before the camera is reopened.
    pub max_read_failures: u32,
    pub shutdown_timeout_ms: u64,
    /// Command run to unlock the session instead of calling logind.
    pub unlock_command: Option<String>,
}

impl Config {
    /// Load configuration from `LOCKFACE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("LOCKFACE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| lockface_core::default_model_dir());

        let data_dir = std::env::var("LOCKFACE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| {
                        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("lockface")
            });

        let gallery_path = std::env::var("LOCKFACE_GALLERY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("gallery.json"));

        Self {
            camera_device: std::env::var("LOCKFACE_CAMERA_DEVICE").unwrap_or_else(|_| "/dev/video0".to_string()),
            camera_width: env_u32("LOCKFACE_CAMERA_WIDTH", 320),
            camera_height: env_u32("LOCKFACE_CAMERA_HEIGHT", 240),
            model_dir,
            data_dir,
            gallery_path,
            distance_threshold: env_f32("LOCKFACE_DISTANCE_THRESHOLD", 0.55),
            max_initial_photos: env_usize("LOCKFACE_MAX_INITIAL_PHOTOS", 50),
            additional_photos_step: env_usize("LOCKFACE_ADDITIONAL_PHOTOS_STEP", 5),
            max_photos_per_user: env_usize("LOCKFACE_MAX_PHOTOS_PER_USER", 100),
            retention_days: env_u32("LOCKFACE_RETENTION_DAYS", 90),
            min_recent_photos: env_usize("LOCKFACE_MIN_RECENT_PHOTOS", 50),
            lock_poll_secs: env_u64("LOCKFACE_LOCK_POLL_SECS", 10),
            settle_secs: env_u64("LOCKFACE_SETTLE_SECS", 5),
            camera_on_secs: env_u64("LOCKFACE_CAMERA_ON_SECS", 5),
            camera_off_secs: env_u64("LOCKFACE_CAMERA_OFF_SECS", 5),
            max_read_failures: env_u32("LOCKFACE_MAX_READ_FAILURES", 5),
            shutdown_timeout_ms: env_u64("LOCKFACE_SHUTDOWN_TIMEOUT_MS", 2000),
            unlock_command: std::env::var("LOCKFACE_UNLOCK_COMMAND")
                .ok()
                .filter(|c| !c.trim().is_empty()),
        }
    }

    pub fn users_dir(&self) -> PathBuf {
        self.data_dir.join("users")
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_photos_per_user: self.max_photos_per_user,
            retention_days: self.retention_days,
            min_recent_to_keep: self.min_recent_photos,
        }
    }

    pub fn photo_limits(&self) -> PhotoLimits {
        PhotoLimits {
            initial: self.max_initial_photos,
            step: self.additional_photos_step,
            max: self.max_photos_per_user,
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            max_read_failures: self.max_read_failures,
            join_timeout: self.shutdown_timeout(),
            ..CaptureConfig::default()
        }
    }

    pub fn recognition_timing(&self) -> RecognitionTiming {
        RecognitionTiming {
            lock_poll: Duration::from_secs(self.lock_poll_secs),
            settle: Duration::from_secs(self.settle_secs),
            camera_on: Duration::from_secs(self.camera_on_secs),
            camera_off: Duration::from_secs(self.camera_off_secs),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
