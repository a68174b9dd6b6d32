use std::time::Duration;

use crate::utils::{KIB, MIB};

pub(crate) const DEFAULT_PAGE_SIZE: usize = 16 * KIB;
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 2 * MIB;
pub(crate) const DEFAULT_POOL_SIZE: usize = 128 * MIB;
pub(crate) const DEFAULT_INSTANCES: usize = 1;
pub(crate) const DEFAULT_HASH_PARTITIONS: usize = 16;

/// Fraction of the LRU list that forms the old segment (3/8).
pub(crate) const DEFAULT_OLD_RATIO: f64 = 0.375;
pub(crate) const DEFAULT_OLD_THRESHOLD: Duration = Duration::from_millis(1000);
pub(crate) const DEFAULT_LRU_OLD_MIN_LEN: usize = 64;
pub(crate) const DEFAULT_LRU_SCAN_DEPTH: usize = 1024;

/// The old segment is only moved once it is off target by more than this.
pub(crate) const LRU_OLD_TOLERANCE: usize = 1;

pub(crate) const DEFAULT_WATCH_SLOTS: usize = 8;
pub(crate) const DEFAULT_READ_RETRIES: usize = 3;
pub(crate) const DEFAULT_READ_WAIT_INTERVAL: Duration = Duration::from_micros(100);
pub(crate) const MAX_READ_WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// How often a fetch may start over after a concurrent read it waited for
/// failed.
pub(crate) const MAX_FETCH_RESTARTS: usize = 16;

/// Rounds of free-list / eviction / LRU-flush attempts when looking for a
/// victim frame.
pub(crate) const ALLOCATION_ROUNDS: usize = 3;
pub(crate) const ALLOCATION_BACKOFF: Duration = Duration::from_micros(200);

pub(crate) const DEFAULT_MAX_DIRTY_PAGES: f64 = 0.75;
pub(crate) const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_FLUSH_BATCH_SIZE: usize = 128;
pub(crate) const DEFAULT_IO_THREADS: usize = 4;

pub(crate) const DEFAULT_RESIZE_MAX_ROUNDS: usize = 100;
pub(crate) const DEFAULT_RESIZE_BACKOFF: Duration = Duration::from_millis(10);
pub(crate) const MAX_RESIZE_BACKOFF_FACTOR: u32 = 8;

/// Upper bound for frame alignment; frames are aligned to the OS page size or
/// to the page size itself, whichever is smaller.
pub(crate) const MAX_FRAME_ALIGNMENT: usize = 4 * KIB;
