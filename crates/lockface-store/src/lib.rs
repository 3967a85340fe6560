//! lockface-store: Durable per-user photo collections.
//!
//! Users are identity namespaces (one directory each under a base root);
//! photos are timestamp-named grayscale face crops inside them. The
//! retention pass keeps every collection under a hard ceiling while
//! protecting the newest captures from age-based pruning.

pub mod clock;
pub mod fs;
pub mod photo;
pub mod registry;
pub mod retention;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fs::FsStore;
pub use photo::{PhotoEntry, PhotoHandle, PhotoStore, StoreError};
pub use registry::UserRegistry;
pub use retention::{RetentionPolicy, RetentionReport};
