//! Core error types.

use thiserror::Error;

/// Core cache errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A cache key component was empty or contained the key separator.
    #[error("invalid cache key {component}: {reason}")]
    InvalidKey {
        component: &'static str,
        reason: String,
    },
}
