use std::{
	io, iter,
	sync::{atomic::AtomicBool, Arc},
	time::Duration,
};

use log::{error, info};
use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use thiserror::Error;

use crate::{
	consts::{
		DEFAULT_CHUNK_SIZE, DEFAULT_FLUSH_BATCH_SIZE, DEFAULT_FLUSH_PERIOD,
		DEFAULT_HASH_PARTITIONS, DEFAULT_INSTANCES, DEFAULT_IO_THREADS, DEFAULT_LRU_OLD_MIN_LEN,
		DEFAULT_LRU_SCAN_DEPTH, DEFAULT_MAX_DIRTY_PAGES, DEFAULT_OLD_RATIO, DEFAULT_OLD_THRESHOLD,
		DEFAULT_PAGE_SIZE, DEFAULT_POOL_SIZE, DEFAULT_READ_RETRIES, DEFAULT_READ_WAIT_INTERVAL,
		DEFAULT_RESIZE_BACKOFF, DEFAULT_RESIZE_MAX_ROUNDS, DEFAULT_WATCH_SLOTS,
	},
	page::{LogPos, PageId, PageState},
	storage::{EvictionHookApi, PageStorageApi, PageVerifier, StorageError, UnloggedWal, WalApi},
	tasks::{IoDispatcher, ScheduledTaskHandle},
};

use fetch::FetchRequest;
use instance::PoolInstance;
use watch::WatchOutcome;

mod fetch;
mod flush;
mod frames;
mod free;
mod guard;
mod hash;
mod instance;
mod list;
mod lru;
mod resize;
mod warm;
mod watch;
mod writer;

pub use guard::{Exclusive, LatchMode, PinnedPage, Shared, Unlatched};
pub use warm::WarmLoadReport;

#[derive(Debug, Error)]
pub enum CacheError {
	#[error("Failed to allocate {0} bytes of frame memory")]
	OutOfMemory(usize),

	#[error("Page {0} is corrupt")]
	CorruptPage(PageId),

	#[error("I/O on page {0} failed: {1}")]
	Io(PageId, #[source] StorageError),

	#[error("No replaceable frame could be found")]
	AllocationStall,

	#[error("Resize gave up with {0} frames still to withdraw")]
	ResizeStall(usize),

	#[error("Resize was aborted")]
	ResizeAborted,

	#[error("Page {0} is not in the pool")]
	NotFound(PageId),

	#[error("All {0} watch slots are in use")]
	WatchSlotsExhausted(usize),

	#[error("Gave up on page {0} after repeated failed reads")]
	ReadAborted(PageId),

	#[error("Invalid buffer pool configuration: {0}")]
	InvalidConfig(String),

	#[error("Failed to start background threads: {0}")]
	ThreadPool(#[source] io::Error),

	#[error("Failed to access the warm cache file: {0}")]
	WarmCache(#[source] io::Error),
}

/// What happens when a page still cannot be read, or still fails
/// verification, after all retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
	/// Failures are fatal; the reading thread panics.
	Strict,
	/// The fetch fails with [`CacheError::Io`] or [`CacheError::CorruptPage`].
	#[default]
	Report,
	/// A corrupt page is replaced by a zero-filled page. Read errors are
	/// reported as with `Report`.
	BestEffort,
}

/// How a fetch treats a page that is not in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
	/// Read the page if it is not in the pool.
	Get,
	/// Fail with [`CacheError::NotFound`] if the page is not in the pool.
	IfInPool,
	/// Like `IfInPool`, but the access does not count for the LRU list.
	PeekIfInPool,
	/// Like `IfInPool`, but set a watch on the page if it is absent. The
	/// caller must eventually call [`BufferPool::watch_unset`].
	IfInPoolOrWatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
	/// The page was already in the pool; it stays pinned until the watch is
	/// unset.
	Present,
	/// A sentinel now stands in for the page.
	Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
	pub frames: usize,
	pub lru_len: usize,
	pub old_len: usize,
	pub free_len: usize,
	pub dirty_len: usize,
	pub withdrawn_len: usize,
	pub watches: usize,
	pub pending_reads: usize,
	pub pending_writes: usize,
	pub pages_read: usize,
	pub pages_written: usize,
	pub pages_evicted: usize,
	pub pages_made_young: usize,
	pub pages_created: usize,
}

impl iter::Sum for PoolStats {
	fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
		iter.fold(Self::default(), |acc, s| Self {
			frames: acc.frames + s.frames,
			lru_len: acc.lru_len + s.lru_len,
			old_len: acc.old_len + s.old_len,
			free_len: acc.free_len + s.free_len,
			dirty_len: acc.dirty_len + s.dirty_len,
			withdrawn_len: acc.withdrawn_len + s.withdrawn_len,
			watches: acc.watches + s.watches,
			pending_reads: acc.pending_reads + s.pending_reads,
			pending_writes: acc.pending_writes + s.pending_writes,
			pages_read: acc.pages_read + s.pages_read,
			pages_written: acc.pages_written + s.pages_written,
			pages_evicted: acc.pages_evicted + s.pages_evicted,
			pages_made_young: acc.pages_made_young + s.pages_made_young,
			pages_created: acc.pages_created + s.pages_created,
		})
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferPoolConfig {
	/// Total frame memory over all instances, in bytes.
	pub pool_size: usize,
	pub page_size: usize,
	/// Unit of growing and shrinking, in bytes.
	pub chunk_size: usize,
	pub instances: usize,
	/// Hash index partitions per instance; a power of two.
	pub hash_partitions: usize,
	/// Fraction of the LRU list that forms the old segment.
	pub old_ratio: f64,
	/// How long after its first access an old page has to be accessed again
	/// to become young.
	pub old_threshold: Duration,
	/// Below this many pages the LRU list has no old segment.
	pub lru_old_min_len: usize,
	/// How many pages an eviction scan looks at from the LRU tail.
	pub lru_scan_depth: usize,
	pub watch_slots: usize,
	/// Re-reads of a page that failed verification.
	pub read_retries: usize,
	pub recovery_mode: RecoveryMode,
	/// First sleep interval when waiting for another thread's read.
	pub read_wait_interval: Duration,
	/// Fraction of dirty pages above which the page cleaner flushes.
	pub max_dirty_pages: f64,
	/// Period of the page cleaner; `None` disables it.
	pub flush_period: Option<Duration>,
	pub flush_batch_size: usize,
	pub io_threads: usize,
	pub resize_max_rounds: usize,
	pub resize_backoff: Duration,
}

impl Default for BufferPoolConfig {
	fn default() -> Self {
		Self {
			pool_size: DEFAULT_POOL_SIZE,
			page_size: DEFAULT_PAGE_SIZE,
			chunk_size: DEFAULT_CHUNK_SIZE,
			instances: DEFAULT_INSTANCES,
			hash_partitions: DEFAULT_HASH_PARTITIONS,
			old_ratio: DEFAULT_OLD_RATIO,
			old_threshold: DEFAULT_OLD_THRESHOLD,
			lru_old_min_len: DEFAULT_LRU_OLD_MIN_LEN,
			lru_scan_depth: DEFAULT_LRU_SCAN_DEPTH,
			watch_slots: DEFAULT_WATCH_SLOTS,
			read_retries: DEFAULT_READ_RETRIES,
			recovery_mode: RecoveryMode::default(),
			read_wait_interval: DEFAULT_READ_WAIT_INTERVAL,
			max_dirty_pages: DEFAULT_MAX_DIRTY_PAGES,
			flush_period: Some(DEFAULT_FLUSH_PERIOD),
			flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
			io_threads: DEFAULT_IO_THREADS,
			resize_max_rounds: DEFAULT_RESIZE_MAX_ROUNDS,
			resize_backoff: DEFAULT_RESIZE_BACKOFF,
		}
	}
}

impl BufferPoolConfig {
	pub fn validate(&self) -> Result<(), CacheError> {
		let invalid = |reason: String| -> Result<(), CacheError> {
			Err(CacheError::InvalidConfig(reason))
		};
		if !self.page_size.is_power_of_two() {
			return invalid(format!("page size {} is not a power of two", self.page_size));
		}
		if self.chunk_size < self.page_size || self.chunk_size % self.page_size != 0 {
			return invalid(format!(
				"chunk size {} is not a multiple of the page size {}",
				self.chunk_size, self.page_size
			));
		}
		if self.instances == 0 {
			return invalid("there must be at least one instance".to_string());
		}
		if self.chunks_per_instance(self.pool_size) == 0 {
			return invalid(format!(
				"pool size {} does not fit one chunk per instance",
				self.pool_size
			));
		}
		if !self.hash_partitions.is_power_of_two() {
			return invalid(format!(
				"{} hash partitions is not a power of two",
				self.hash_partitions
			));
		}
		if !(self.old_ratio > 0.0 && self.old_ratio < 1.0) {
			return invalid(format!("old ratio {} is not between 0 and 1", self.old_ratio));
		}
		if !(self.max_dirty_pages > 0.0 && self.max_dirty_pages <= 1.0) {
			return invalid(format!(
				"max dirty pages {} is not between 0 and 1",
				self.max_dirty_pages
			));
		}
		if self.lru_scan_depth == 0 || self.flush_batch_size == 0 || self.io_threads == 0 {
			return invalid("scan depth, flush batch size and I/O threads must be positive".to_string());
		}
		if self.resize_max_rounds == 0 {
			return invalid("resize needs at least one round".to_string());
		}
		Ok(())
	}

	#[inline]
	pub(crate) fn frames_per_chunk(&self) -> usize {
		self.chunk_size / self.page_size
	}

	/// How many chunks each instance holds for a total pool size.
	#[inline]
	pub(crate) fn chunks_per_instance(&self, pool_size: usize) -> usize {
		pool_size / self.instances / self.chunk_size
	}

	#[cfg(test)]
	pub(crate) fn for_tests(num_frames: usize) -> Self {
		Self {
			pool_size: 256 * num_frames,
			page_size: 256,
			chunk_size: 256,
			instances: 1,
			hash_partitions: 4,
			old_threshold: Duration::ZERO,
			lru_old_min_len: 8,
			watch_slots: 4,
			read_retries: 2,
			read_wait_interval: Duration::from_micros(50),
			flush_period: None,
			flush_batch_size: 16,
			io_threads: 2,
			resize_max_rounds: 20,
			resize_backoff: Duration::from_millis(1),
			..Self::default()
		}
	}
}

/// The collaborators the pool calls out to besides page storage.
#[derive(Clone)]
pub struct Collaborators {
	pub wal: Arc<dyn WalApi + Send + Sync>,
	/// Verifies every page read from storage, if set.
	pub verifier: Option<Arc<dyn PageVerifier + Send + Sync>>,
	pub eviction_hook: Option<Arc<dyn EvictionHookApi + Send + Sync>>,
}

impl Default for Collaborators {
	fn default() -> Self {
		Self {
			wal: Arc::new(UnloggedWal),
			verifier: None,
			eviction_hook: None,
		}
	}
}

/// A buffer pool made of independent instances; every page id maps to
/// exactly one of them.
pub struct BufferPool<S: PageStorageApi + Send + Sync + 'static> {
	config: BufferPoolConfig,
	instances: Box<[Arc<PoolInstance<S>>]>,
	storage: Arc<S>,
	dispatcher: Arc<IoDispatcher>,
	resize_lock: Mutex<()>,
	abort_resize: AtomicBool,
	_cleaner: Option<ScheduledTaskHandle>,
}

impl<S: PageStorageApi + Send + Sync + 'static> BufferPool<S> {
	pub fn new(config: &BufferPoolConfig, storage: Arc<S>) -> Result<Self, CacheError> {
		Self::with_collaborators(config, storage, Collaborators::default())
	}

	pub fn with_collaborators(
		config: &BufferPoolConfig,
		storage: Arc<S>,
		collaborators: Collaborators,
	) -> Result<Self, CacheError> {
		config.validate()?;
		let dispatcher =
			Arc::new(IoDispatcher::new(config.io_threads).map_err(CacheError::ThreadPool)?);
		let num_chunks = config.chunks_per_instance(config.pool_size);
		let instances = (0..config.instances)
			.map(|index| {
				PoolInstance::new(
					index,
					config,
					num_chunks,
					Arc::clone(&storage),
					&collaborators,
					Arc::clone(&dispatcher),
				)
				.map(Arc::new)
			})
			.collect::<Result<Box<[_]>, _>>()?;

		let cleaner = config
			.flush_period
			.map(|period| {
				let instances = instances.clone();
				let max_dirty_pages = config.max_dirty_pages;
				dispatcher.schedule("cleaner", period, move || {
					Self::clean_pages(&instances, max_dirty_pages);
				})
			})
			.transpose()
			.map_err(CacheError::ThreadPool)?;

		info!(
			"Created a buffer pool of {} instances with {} frames each",
			config.instances,
			num_chunks * config.frames_per_chunk()
		);
		Ok(Self {
			config: config.clone(),
			instances,
			storage,
			dispatcher,
			resize_lock: Mutex::new(()),
			abort_resize: AtomicBool::new(false),
			_cleaner: cleaner,
		})
	}

	#[inline]
	pub fn config(&self) -> &BufferPoolConfig {
		&self.config
	}

	#[allow(clippy::cast_possible_truncation)]
	fn instance(&self, id: PageId) -> &Arc<PoolInstance<S>> {
		&self.instances[(id.instance_fold() % self.instances.len() as u64) as usize]
	}

	/// Returns the page pinned and latched according to `L`.
	pub fn get<L: LatchMode>(
		&self,
		id: PageId,
		mode: FetchMode,
	) -> Result<PinnedPage<'_, L>, CacheError> {
		let instance = self.instance(id);
		let block = instance.fetch(FetchRequest {
			id,
			mode,
			latch: L::KIND,
			track_access: mode != FetchMode::PeekIfInPool,
		})?;
		Ok(PinnedPage::new(&instance.core, block, id))
	}

	/// Puts a new, zero-filled page into the pool without reading it.
	pub fn create(&self, id: PageId) -> Result<PinnedPage<'_, Exclusive>, CacheError> {
		let instance = self.instance(id);
		let block = instance.create(id)?;
		Ok(PinnedPage::new(&instance.core, block, id))
	}

	/// Reads a page in the background, if it is not in the pool yet.
	pub fn prefetch(&self, id: PageId) {
		self.instance(id).prefetch(id);
	}

	/// Hints that a cached page will not be needed again soon; it becomes the
	/// next eviction candidate. Returns false if the page is not cached.
	pub fn make_old(&self, id: PageId) -> bool {
		self.instance(id).core.make_old(id)
	}

	pub fn watch_set(&self, id: PageId) -> Result<WatchStatus, CacheError> {
		let core = &self.instance(id).core;
		match core.watch_set(id, true)? {
			WatchOutcome::Found(_) => Ok(WatchStatus::Present),
			WatchOutcome::Watching => Ok(WatchStatus::Absent),
		}
	}

	/// Whether the page a watch was set on has been loaded since.
	pub fn watch_occurred(&self, id: PageId) -> bool {
		self.instance(id).core.watch_occurred(id)
	}

	pub fn watch_unset(&self, id: PageId) {
		self.instance(id).core.watch_unset(id);
	}

	/// Writes up to `max` dirty pages whose oldest modification lies before
	/// `lsn_limit`, oldest first. Returns the number of pages written.
	pub fn flush_list(&self, max: usize, lsn_limit: LogPos) -> Result<usize, CacheError> {
		let mut written = 0;
		let mut first_error = None;
		for instance in self.instances.iter() {
			if written >= max {
				break;
			}
			match instance.flush_list_batch(max - written, lsn_limit) {
				Ok(n) => written += n,
				Err(err) => {
					first_error.get_or_insert(err);
				}
			}
		}
		match first_error {
			Some(err) => Err(err),
			None => Ok(written),
		}
	}

	/// Writes every dirty page that the log allows to be written.
	pub fn flush_sync(&self) -> Result<usize, CacheError> {
		self.flush_list(usize::MAX, LogPos::MAX)
	}

	/// Like `flush_sync`, but in the background.
	pub fn flush(&self) {
		for instance in self.instances.iter() {
			let instance = Arc::clone(instance);
			self.dispatcher.spawn(move || {
				if let Err(err) = instance.flush_list_batch(usize::MAX, LogPos::MAX) {
					error!("Background flush of instance {} failed: {err}", instance.core.index);
				}
			});
		}
	}

	/// The oldest modification of any dirty page; recovery has to start from
	/// this position at the latest.
	pub fn checkpoint_lower_bound(&self) -> Option<LogPos> {
		self.instances
			.iter()
			.filter_map(|instance| instance.core.checkpoint_lower_bound())
			.min()
	}

	pub fn stats(&self) -> PoolStats {
		self.instances.iter().map(|instance| instance.core.stats()).sum()
	}

	/// Current size of the frame memory, in bytes.
	pub fn size(&self) -> usize {
		self.instances
			.iter()
			.map(|instance| instance.core.chunks.num_frames())
			.sum::<usize>()
			* self.config.page_size
	}

	/// Checks the structural invariants of every instance and panics if one
	/// is broken. Only meaningful while the pool is otherwise idle.
	pub fn validate(&self) {
		for instance in self.instances.iter() {
			instance.core.validate();
		}
	}

	/// The state of the descriptor that holds `id`, if any.
	pub fn page_state(&self, id: PageId) -> Option<PageState> {
		self.instance(id).core.page_state(id)
	}

	#[allow(clippy::cast_precision_loss)]
	fn clean_pages(instances: &[Arc<PoolInstance<S>>], max_dirty_pages: f64) {
		for instance in instances {
			let dirty = instance.core.flush.lock().len();
			let frames = instance.core.chunks.num_frames();
			if (dirty as f64) <= frames as f64 * max_dirty_pages {
				continue;
			}
			let batch = instance.core.config.flush_batch_size;
			if let Err(err) = instance.flush_list_batch(batch, LogPos::MAX) {
				error!("Page cleaner failed to flush instance {}: {err}", instance.core.index);
			}
		}
	}
}

assert_impl_all!(BufferPool<crate::storage::file::FileStorage>: Send, Sync);
