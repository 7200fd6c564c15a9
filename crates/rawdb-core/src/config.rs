//! Configuration management for RawDb
//!
//! Provides presets for different deployment sizes, per page-type settings,
//! and a validation pass run before the database opens anything on disk.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RawDbError, RawResult};

/// Where page regions keep their bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionMemoryKind {
    /// Boxed heap slice owned by the region
    Heap,
    /// Raw allocation made through the global allocator and addressed by pointer
    Native,
}

/// Settings shared by every file of one page type.
///
/// A page type maps to exactly one page cache: the cache is keyed by
/// `(category, page_size)`.
#[derive(Debug, Clone)]
pub struct PageTypeConfig {
    /// Cache category name, also the quota consumer name
    pub category: String,
    /// Page size in bytes
    pub page_size: usize,
    /// Maximum size in bytes of any single file of this type
    pub max_file_size: u64,
    /// Backing memory for regions
    pub memory: RegionMemoryKind,
    /// Initial soft ceiling of the page cache, in bytes
    pub max_cache_size: u64,
    /// Load every page of a file the first time any page of it is touched
    pub preload: bool,
    /// Number of freed regions kept for reuse
    pub pool_size: usize,
}

impl PageTypeConfig {
    /// A heap-backed page type with sensible defaults.
    pub fn new(category: impl Into<String>, page_size: usize) -> Self {
        Self {
            category: category.into(),
            page_size,
            max_file_size: 1 << 40,
            memory: RegionMemoryKind::Heap,
            max_cache_size: 64 * 1024 * 1024,
            preload: false,
            pool_size: 64,
        }
    }
}

/// RawDb configuration with deployment presets
#[derive(Debug, Clone)]
pub struct RawDbConfig {
    /// Data directories; the first one holds `tx.log`, `txr.log` and the batch header
    pub paths: Vec<PathBuf>,
    /// Page types, addressed by their position in this list
    pub page_types: Vec<PageTypeConfig>,
    /// Period after which committed pages are flushed by the timer
    pub flush_period: Duration,
    /// Buffered committed bytes that force a synchronous flush on commit
    pub max_flush_size: u64,
    /// Pages idle longer than this are evicted on timer ticks
    pub max_idle_period: Duration,
    /// Eviction under pressure drains the cache down to this percentage of its maximum
    pub min_cache_percent: u64,
    /// Delay before a lowered quota takes effect
    pub quota_change_delay: Duration,
    /// Tick period of the timer thread
    pub timer_period: Duration,
    /// Capacity of the per-transaction ring of non-cached pages
    pub non_cached_queue_size: usize,
    /// Advise the OS to drop file ranges after reading them into a region
    pub drop_behind: bool,
    /// Period between sweeps of unused page proxies
    pub proxy_sweep_period: Duration,
    /// Continuous run slice granted to a batch operation
    pub batch_run_period: Duration,
    /// Idle slice a batch operation yields after each run slice
    pub batch_idle_period: Duration,
    /// Page type of the batch header file
    pub batch_page_type: usize,
}

impl RawDbConfig {
    /// Server-class: large caches, relaxed flush pacing
    pub fn server(path: impl Into<PathBuf>) -> Self {
        Self {
            paths: vec![path.into()],
            page_types: vec![
                PageTypeConfig {
                    max_cache_size: 1024 * 1024 * 1024,
                    memory: RegionMemoryKind::Native,
                    pool_size: 1024,
                    ..PageTypeConfig::new("default", 8192)
                },
            ],
            flush_period: Duration::from_secs(3),
            max_flush_size: 256 * 1024 * 1024,
            max_idle_period: Duration::from_secs(600),
            min_cache_percent: 90,
            quota_change_delay: Duration::from_secs(60),
            timer_period: Duration::from_millis(500),
            non_cached_queue_size: 64,
            drop_behind: true,
            proxy_sweep_period: Duration::from_secs(10),
            batch_run_period: Duration::from_millis(500),
            batch_idle_period: Duration::from_millis(100),
            batch_page_type: 0,
        }
    }

    /// Small footprint: tight caches and fast timers, used by embedded setups and tests
    pub fn small(path: impl Into<PathBuf>) -> Self {
        Self {
            paths: vec![path.into()],
            page_types: vec![PageTypeConfig {
                max_cache_size: 4 * 1024 * 1024,
                pool_size: 16,
                ..PageTypeConfig::new("default", 4096)
            }],
            flush_period: Duration::from_millis(200),
            max_flush_size: 4 * 1024 * 1024,
            max_idle_period: Duration::from_secs(60),
            min_cache_percent: 90,
            quota_change_delay: Duration::from_millis(500),
            timer_period: Duration::from_millis(50),
            non_cached_queue_size: 16,
            drop_behind: false,
            proxy_sweep_period: Duration::from_secs(1),
            batch_run_period: Duration::from_millis(50),
            batch_idle_period: Duration::from_millis(20),
            batch_page_type: 0,
        }
    }

    /// First configured path, home of the transaction logs.
    pub fn primary_path(&self) -> &std::path::Path {
        &self.paths[0]
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> RawResult<()> {
        let fail = |reason: &str| Err(RawDbError::Config { reason: reason.into() });

        if self.paths.is_empty() {
            return fail("at least one path must be configured");
        }
        if self.page_types.is_empty() {
            return fail("at least one page type must be configured");
        }
        for page_type in &self.page_types {
            if page_type.page_size < 64 || !page_type.page_size.is_power_of_two() {
                return fail("page_size must be a power of two >= 64");
            }
            if page_type.max_file_size < page_type.page_size as u64 {
                return fail("max_file_size must hold at least one page");
            }
            if page_type.category.is_empty() {
                return fail("page type category must not be empty");
            }
        }
        if self.batch_page_type >= self.page_types.len() {
            return fail("batch_page_type must name a configured page type");
        }
        if self.min_cache_percent == 0 || self.min_cache_percent > 100 {
            return fail("min_cache_percent must be in [1, 100]");
        }
        if self.timer_period.is_zero() {
            return fail("timer_period must be > 0");
        }
        if self.non_cached_queue_size == 0 {
            return fail("non_cached_queue_size must be > 0");
        }
        Ok(())
    }
}

impl Default for RawDbConfig {
    fn default() -> Self {
        Self::server("rawdb")
    }
}
