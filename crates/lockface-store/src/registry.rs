//! Identity namespaces.

use crate::photo::StoreError;
use std::collections::BTreeSet;

/// Creates, deletes and enumerates user identities.
pub trait UserRegistry: Send + Sync {
    /// Returns `false` when the identity already exists.
    fn create(&self, name: &str) -> Result<bool, StoreError>;

    /// Removes the identity and every photo it owns. Returns `false` when
    /// there was nothing to remove.
    fn delete(&self, name: &str) -> Result<bool, StoreError>;

    fn exists(&self, name: &str) -> Result<bool, StoreError>;

    fn list(&self) -> Result<BTreeSet<String>, StoreError>;
}

/// Reject names that cannot serve as a single namespace component.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name.trim() != name;
    if bad {
        return Err(StoreError::InvalidUser(name.to_string()));
    }
    Ok(())
}
