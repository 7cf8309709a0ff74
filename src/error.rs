// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents the recoverable errors the forest can produce.
///
/// Invariant violations are not represented here: they are programmer
/// errors and are raised via `assert!`/`unreachable!` so that they abort
/// the process immediately rather than propagate as a recoverable result.
#[derive(Debug)]
pub enum Error {
    /// Allocating a fixed-size structure (block pool, bitset, registry)
    /// failed.
    Alloc(std::collections::TryReserveError),

    /// A structural precondition was violated at construction time
    /// (duplicate or non-contiguous tree ids, an oversubscribed block pool).
    ///
    /// These are caller configuration errors surfaced at startup, not
    /// mid-operation invariant violations.
    InvariantViolation(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alloc(e) => write!(f, "ForestError: allocation failed: {e}"),
            Self::InvariantViolation(msg) => write!(f, "ForestError: invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::collections::TryReserveError> for Error {
    fn from(value: std::collections::TryReserveError) -> Self {
        Self::Alloc(value)
    }
}

/// Forest result.
pub type Result<T> = std::result::Result<T, Error>;
