/**
 * Helper functions for creating common error types
 */
use crate::error::Error;

/// Create a `LockPoisoned` error for mutex/rwlock poisoning (indicates prior panic)
#[must_use]
pub fn lock_poisoned_error(message: &str) -> Error {
    Error::LockPoisoned(format!(
        "{message} - this indicates a prior panic, application may be in an inconsistent state"
    ))
}

/// Create an error for a registry slot holding a different object type than requested
#[must_use]
pub fn type_mismatch_error(component: &str, key: &str) -> Error {
    Error::Custom(format!("{component} entry {key} holds a different resource type"))
}
