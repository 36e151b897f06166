//! Cache configuration parameters and validation.
//!
//! Most parameters have sensible defaults; the only one worth tuning for a
//! first deployment is `max_memory_size`.

use crate::error::ConfigError;
use crate::util::size;

/// Maximum number of map segments. Power of two, slightly conservative.
pub const MAX_SEGMENTS: usize = 1 << 16;

/// Page size served by the pool allocator. Fixed at 8 KiB.
pub const PAGE_SIZE: usize = 8192;

/// Depth of the buddy tree inside each chunk.
pub const MAX_ORDER: u32 = 11;

/// Chunk size derived from `PAGE_SIZE << MAX_ORDER` = 16 MiB.
pub const CHUNK_SIZE: usize = PAGE_SIZE << MAX_ORDER;

/// Configuration for an off-heap cache.
///
/// # Examples
///
/// ```rust
/// use offheap::CacheConfig;
///
/// let config = CacheConfig {
///     max_memory_size: 512 * 1024 * 1024,
///     concurrency: 32,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total off-heap budget in bytes, passed to the allocator.
    ///
    /// Default: 256 MiB
    pub max_memory_size: usize,

    /// Number of allocator arenas.
    ///
    /// More arenas reduce allocation contention at the cost of fragmentation.
    /// If `None`, defaults to 2x the CPU count, clamped to >= 1.
    pub arena_count: Option<usize>,

    /// Map segment count, rounded up to a power of two, capped at 65536.
    ///
    /// Default: 16
    pub concurrency: usize,

    /// Total bucket count across all segments.
    ///
    /// Default: 1024
    pub initial_capacity: usize,

    /// Per-segment rehash threshold factor, in (0, 1].
    ///
    /// Default: 0.75
    pub load_factor: f64,

    /// How many evict-and-retry rounds `set` performs when the allocator
    /// reports exhaustion before giving up.
    ///
    /// Default: 4
    pub max_retries_on_full: usize,

    /// Entries cached per thread-local size-class ring.
    ///
    /// Default: 256
    pub thread_cache_size: usize,

    /// Thread-cache allocations between idle-entry trims.
    ///
    /// Default: 8192
    pub thread_cache_trim_interval: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_memory_size: size::mb(256),
            arena_count: None,
            concurrency: 16,
            initial_capacity: 1024,
            load_factor: 0.75,
            max_retries_on_full: 4,
            thread_cache_size: 256,
            thread_cache_trim_interval: 8192,
        }
    }
}

impl CacheConfig {
    /// Validate configuration, returning the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_memory_size == 0 {
            return Err(ConfigError::InvalidMemorySize(
                "max_memory_size must be > 0".to_string(),
            ));
        }

        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            return Err(ConfigError::InvalidLoadFactor(format!(
                "load_factor must be in (0, 1], got {}",
                self.load_factor
            )));
        }

        if self.concurrency == 0 || self.concurrency > MAX_SEGMENTS {
            return Err(ConfigError::InvalidConcurrency(format!(
                "concurrency must be in 1..={MAX_SEGMENTS}, got {}",
                self.concurrency
            )));
        }

        if let Some(arenas) = self.arena_count {
            if arenas == 0 {
                return Err(ConfigError::InvalidArenaCount(
                    "arena_count must be > 0".to_string(),
                ));
            }
        }

        if self.initial_capacity == 0 {
            return Err(ConfigError::InvalidCapacity(
                "initial_capacity must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolved arena count: the configured value or `2 * num_cpus`, >= 1.
    pub fn resolved_arena_count(&self) -> usize {
        self.arena_count
            .unwrap_or_else(|| (num_cpus::get() * 2).max(1))
    }

    /// Build configuration from environment variables.
    ///
    /// Recognized overrides:
    /// - `OFFHEAP_MAX_MEMORY`: size string, e.g. `512M`
    /// - `OFFHEAP_CONCURRENCY`: segment count
    /// - `OFFHEAP_ARENAS`: arena count
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("OFFHEAP_MAX_MEMORY") {
            if let Ok(bytes) = size::parse(&val) {
                config.max_memory_size = bytes;
            }
        }

        if let Ok(val) = std::env::var("OFFHEAP_CONCURRENCY") {
            if let Ok(n) = val.parse::<usize>() {
                config.concurrency = n;
            }
        }

        if let Ok(val) = std::env::var("OFFHEAP_ARENAS") {
            if let Ok(n) = val.parse::<usize>() {
                config.arena_count = Some(n);
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency, 16);
    }

    #[test]
    fn test_zero_memory_rejected() {
        let config = CacheConfig {
            max_memory_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_factor_bounds() {
        for lf in [0.0, -1.0, 1.5, f64::NAN] {
            let config = CacheConfig {
                load_factor: lf,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "load_factor {lf} accepted");
        }
    }

    #[test]
    fn test_concurrency_cap() {
        let config = CacheConfig {
            concurrency: MAX_SEGMENTS + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunk_geometry() {
        assert_eq!(CHUNK_SIZE, 16 * 1024 * 1024);
        assert_eq!(PAGE_SIZE << MAX_ORDER, CHUNK_SIZE);
    }
}
