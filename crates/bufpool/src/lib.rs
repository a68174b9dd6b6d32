//! A concurrent page cache ("buffer pool") for a disk-backed storage engine.
//!
//! The pool keeps a bounded set of fixed-size pages resident in memory and
//! serves them to many threads at once. Pages are looked up through a
//! partitioned hash index, evicted from a scan-resistant LRU list, flushed in
//! the order of their oldest modification, and the whole pool can be grown or
//! shrunk online.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bufpool::{BufferPool, BufferPoolConfig, FetchMode, FileStorage, PageId, Shared};
//!
//! let config = BufferPoolConfig::default();
//! let storage = Arc::new(FileStorage::open("/var/lib/db", config.page_size).unwrap());
//! let pool = BufferPool::new(&config, storage).unwrap();
//!
//! let page = pool.get::<Shared>(PageId::new(1, 7), FetchMode::Get).unwrap();
//! println!("first byte: {}", page[0]);
//! ```

#![cfg_attr(
	not(test),
	warn(clippy::cast_possible_wrap),
	warn(clippy::cast_possible_truncation)
)]

mod consts;
mod page;
mod pool;
mod storage;
mod tasks;
mod utils;

pub use page::{IoFix, LogPos, PageId, PageState};
pub use pool::{
	BufferPool, BufferPoolConfig, CacheError, Collaborators, Exclusive, FetchMode, LatchMode,
	PinnedPage, PoolStats, RecoveryMode, Shared, Unlatched, WarmLoadReport, WatchStatus,
};
pub use storage::{
	file::FileStorage, Crc32Verifier, EvictionHookApi, FrameAddress, PageStorageApi, PageVerifier,
	StorageError, UnloggedWal, WalApi,
};
pub use utils::{GIB, KIB, MIB};
