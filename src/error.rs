//! Error types for all cache operations.

use thiserror::Error;

/// Main error type for the off-heap cache.
///
/// Allocation failures are recoverable: a caching layer above the core may
/// evict entries and retry. Everything else indicates caller misuse or a
/// configuration problem. Internal invariant violations (double free, bad
/// handle) are not represented here; they panic.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The owning arena cannot serve the request without exceeding its
    /// chunk budget.
    #[error("allocation failed: requested {requested} bytes, arena budget exhausted")]
    AllocationFailure { requested: usize },

    /// A read or write was attempted on a buffer that has already been
    /// returned to its arena. Indicates use-after-release by a caller.
    #[error("buffer has been disposed")]
    BufferDisposed,

    /// `write` was called with more bytes than the buffer can hold.
    #[error("capacity exceeded: {requested} bytes do not fit in a buffer of {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    /// Mapping native memory from the OS failed.
    #[error("native memory error: {0}")]
    Memory(String),

    /// Invalid construction parameters.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Serialization of a typed value failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Whether retrying after freeing memory can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CacheError::AllocationFailure { .. })
    }
}

/// Error types for configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid memory size: {0}")]
    InvalidMemorySize(String),

    #[error("invalid load factor: {0}")]
    InvalidLoadFactor(String),

    #[error("invalid concurrency: {0}")]
    InvalidConcurrency(String),

    #[error("invalid arena count: {0}")]
    InvalidArenaCount(String),

    #[error("invalid capacity: {0}")]
    InvalidCapacity(String),
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_failure_recoverable() {
        let err = CacheError::AllocationFailure { requested: 1024 };
        assert!(err.is_recoverable());
        assert!(!CacheError::BufferDisposed.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = CacheError::CapacityExceeded {
            requested: 100,
            capacity: 64,
        };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("64"));
    }
}
