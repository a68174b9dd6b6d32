use std::{
	mem,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	thread,
	time::Instant,
};

use log::{debug, warn};
use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use super::{
	flush::FlushList,
	frames::{Block, ChunkTable, DescriptorMeta, FrameId},
	free::FreeList,
	hash::{HashEntry, PageHash},
	lru::LruList,
	watch::WatchRegistry,
	BufferPoolConfig, CacheError, Collaborators, PoolStats,
};
use crate::{
	consts::{ALLOCATION_BACKOFF, ALLOCATION_ROUNDS},
	page::{IoFix, LogPos, PageId, PageState},
	storage::{EvictionHookApi, PageStorageApi, PageVerifier, WalApi},
	tasks::IoDispatcher,
};

#[derive(Debug, Default)]
pub(crate) struct Counters {
	pub pending_reads: AtomicUsize,
	pub pending_writes: AtomicUsize,
	pub pages_read: AtomicUsize,
	pub pages_written: AtomicUsize,
	pub pages_evicted: AtomicUsize,
	pub pages_made_young: AtomicUsize,
	pub pages_created: AtomicUsize,
}

impl Counters {
	#[inline]
	pub fn bump(counter: &AtomicUsize) {
		counter.fetch_add(1, Ordering::Relaxed);
	}

	#[inline]
	pub fn drop_one(counter: &AtomicUsize) {
		counter.fetch_sub(1, Ordering::Relaxed);
	}
}

/// The storage-independent state of one pool instance: its frames, the
/// hash index and the lists.
///
/// Locks are always taken in this order: `lru`, hash partitions (in index
/// order), `free`, `flush`, descriptor metadata, frame latch. Frame latches
/// are only ever try-locked while a list or hash lock is held.
pub(crate) struct PoolCore {
	pub index: usize,
	pub config: BufferPoolConfig,
	pub chunks: Arc<ChunkTable>,
	pub hash: PageHash,
	pub lru: Mutex<LruList>,
	pub free: Mutex<FreeList>,
	pub flush: Mutex<FlushList>,
	pub watch: WatchRegistry,
	pub counters: Counters,
	epoch: Instant,
	hook: Option<Arc<dyn EvictionHookApi + Send + Sync>>,
}

assert_impl_all!(PoolCore: Send, Sync);

impl PoolCore {
	pub fn new(
		index: usize,
		config: &BufferPoolConfig,
		num_chunks: usize,
		hook: Option<Arc<dyn EvictionHookApi + Send + Sync>>,
	) -> Result<Self, CacheError> {
		let chunks = Arc::new(ChunkTable::new(config.frames_per_chunk(), config.page_size));
		for i in 0..num_chunks {
			chunks.push(chunks.allocate_chunk(i)?);
		}
		let num_frames = chunks.num_frames();

		let mut free = FreeList::new(num_frames);
		for fid in (0..num_frames).rev() {
			free.push(FrameId::from_index(fid));
		}

		Ok(Self {
			index,
			config: config.clone(),
			hash: PageHash::new(config.hash_partitions, num_frames),
			lru: Mutex::new(LruList::new(
				Arc::clone(&chunks),
				config.old_ratio,
				config.lru_old_min_len,
			)),
			free: Mutex::new(free),
			flush: Mutex::new(FlushList::new(num_frames)),
			watch: WatchRegistry::new(config.watch_slots),
			counters: Counters::default(),
			epoch: Instant::now(),
			chunks,
			hook,
		})
	}

	#[inline]
	pub fn block(&self, fid: FrameId) -> Block {
		self.chunks.block(fid)
	}

	/// Milliseconds since the instance was created, plus one, so that zero
	/// can stand for "never".
	#[allow(clippy::cast_possible_truncation)]
	fn now(&self) -> u64 {
		self.epoch.elapsed().as_millis() as u64 + 1
	}

	pub fn release_pin(&self, block: &Block) {
		self.release_pins(block, 1);
	}

	pub fn release_pins(&self, block: &Block, n: u32) {
		if n > 0 && block.unpin_by(n) == 0 {
			self.free_if_removed(block);
		}
	}

	/// Frees a descriptor that was taken out of the hash index while it was
	/// still pinned, once the last pin is gone.
	fn free_if_removed(&self, block: &Block) {
		let mut meta = block.meta.lock();
		if meta.state() != PageState::RemoveHash || block.pin_count() != 0 {
			return;
		}
		meta.clear_page();
		meta.set_state(PageState::NotUsed);
		mem::drop(meta);

		block.poison();
		self.free.lock().push(block.id());
	}

	/// Takes a descriptor off the free list; it comes back `ReadyForUse`.
	pub fn pop_free(&self) -> Option<Block> {
		let fid = self.free.lock().pop()?;
		let block = self.block(fid);
		block.meta.lock().set_state(PageState::ReadyForUse);
		Some(block)
	}

	/// Returns a descriptor that was claimed but never made reachable.
	pub fn push_free(&self, block: &Block) {
		let mut meta = block.meta.lock();
		meta.clear_page();
		meta.set_state(PageState::NotUsed);
		mem::drop(meta);

		block.poison();
		self.free.lock().push(block.id());
	}

	/// The page a descriptor holds, if it may be evicted right now.
	fn evictable(meta: &DescriptorMeta) -> Option<PageId> {
		if meta.state() != PageState::FilePage || meta.io_fix != IoFix::None || meta.is_dirty() {
			return None;
		}
		meta.id
	}

	/// Scans the LRU list from the tail for a clean, unpinned page and evicts
	/// it. The victim comes back `ReadyForUse`. Victims in the area a running
	/// shrink withdraws are withdrawn instead, and the scan goes on.
	pub fn try_evict(&self) -> Option<Block> {
		let mut lru = self.lru.lock();
		let mut cursor = lru.list().tail();
		let mut scanned = 0;
		while let Some(fid) = cursor {
			if scanned >= self.config.lru_scan_depth {
				break;
			}
			scanned += 1;
			cursor = lru.list().prev(fid);

			let block = self.block(fid);
			if block.pin_count() > 0 {
				continue;
			}
			let Some(id) = Self::evictable(&block.meta.lock()) else {
				continue;
			};

			let mut partition = self.hash.write(id);
			let mut meta = block.meta.lock();
			// Pins are only taken under the partition lock, so this holds until
			// the page is unlinked.
			if block.pin_count() > 0 || meta.id != Some(id) || Self::evictable(&meta).is_none() {
				continue;
			}
			partition.remove(&id);
			lru.remove(fid);
			meta.set_state(PageState::RemoveHash);
			mem::drop(meta);
			mem::drop(partition);

			self.notify_evict(id, &block);

			let mut free = self.free.lock();
			if free.should_withdraw(fid) {
				let mut meta = block.meta.lock();
				meta.clear_page();
				meta.set_state(PageState::NotUsed);
				mem::drop(meta);
				block.poison();
				free.push(fid);
				continue;
			}
			mem::drop(free);

			let mut meta = block.meta.lock();
			meta.clear_page();
			meta.set_state(PageState::ReadyForUse);
			mem::drop(meta);
			return Some(block);
		}
		None
	}

	/// Counts an eviction and tells the eviction hook. The page must already
	/// be unreachable.
	pub fn notify_evict(&self, id: PageId, block: &Block) {
		Counters::bump(&self.counters.pages_evicted);
		if let Some(hook) = &self.hook {
			hook.before_evict(id, block.frame_address());
		}
	}

	/// Notes an access to a page, and moves it into the young segment if it
	/// is old and was first accessed at least `old_threshold` ago.
	pub fn record_access(&self, block: &Block) {
		if !block.is_old() {
			return;
		}
		let now = self.now();
		let first = block.access_time();
		if first == 0 {
			block.record_first_access(now);
			if !self.config.old_threshold.is_zero() {
				return;
			}
		} else if u128::from(now.saturating_sub(first)) < self.config.old_threshold.as_millis() {
			return;
		}

		let mut lru = self.lru.lock();
		let fid = block.id();
		if lru.contains(fid) && block.is_old() {
			lru.make_young(fid);
			Counters::bump(&self.counters.pages_made_young);
		}
	}

	/// Moves a cached page to the LRU tail, so that it is the next one to be
	/// evicted. Returns false if the page is not cached.
	pub fn make_old(&self, id: PageId) -> bool {
		let mut lru = self.lru.lock();
		let Some(HashEntry::Frame(fid)) = self.hash.lookup(id) else {
			return false;
		};
		if !lru.contains(fid) {
			return false;
		}
		lru.make_old(fid);
		true
	}

	/// The oldest modification of any dirty page in this instance.
	pub fn checkpoint_lower_bound(&self) -> Option<LogPos> {
		self.flush.lock().min()
	}

	pub fn page_state(&self, id: PageId) -> Option<PageState> {
		match self.hash.lookup(id)? {
			HashEntry::Frame(fid) => Some(self.block(fid).meta.lock().state()),
			HashEntry::Watch(_) => Some(PageState::ZipPage),
		}
	}

	/// The ids of all pages in the LRU list, most recently used first.
	pub fn cached_pages(&self) -> Vec<PageId> {
		let lru = self.lru.lock();
		lru.list()
			.iter()
			.filter_map(|fid| self.block(fid).meta.lock().id)
			.collect()
	}

	pub fn stats(&self) -> PoolStats {
		let lru = self.lru.lock();
		let (lru_len, old_len) = (lru.len(), lru.old_len());
		mem::drop(lru);
		let free = self.free.lock();
		let (free_len, withdrawn_len) = (free.len(), free.withdrawn_len());
		mem::drop(free);
		let dirty_len = self.flush.lock().len();

		let load = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
		PoolStats {
			frames: self.chunks.num_frames(),
			lru_len,
			old_len,
			free_len,
			dirty_len,
			withdrawn_len,
			watches: self.watch.in_use(),
			pending_reads: load(&self.counters.pending_reads),
			pending_writes: load(&self.counters.pending_writes),
			pages_read: load(&self.counters.pages_read),
			pages_written: load(&self.counters.pages_written),
			pages_evicted: load(&self.counters.pages_evicted),
			pages_made_young: load(&self.counters.pages_made_young),
			pages_created: load(&self.counters.pages_created),
		}
	}

	/// Checks the structural invariants of the instance. Panics if one is
	/// broken. Only meaningful while no other thread uses the instance.
	pub fn validate(&self) {
		let lru = self.lru.lock();
		let partitions = self.hash.lock_all();
		let free = self.free.lock();
		let flush = self.flush.lock();

		for fid in (0..self.chunks.num_frames()).map(FrameId::from_index) {
			let block = self.block(fid);
			let meta = block.meta.lock();
			let memberships = [lru.contains(fid), free.contains(fid), free.is_withdrawn(fid)]
				.into_iter()
				.filter(|member| *member)
				.count();
			assert!(memberships <= 1, "Frame {fid} is linked into more than one list");
			if memberships == 0 {
				assert!(
					matches!(
						meta.state(),
						PageState::ReadyForUse | PageState::Memory | PageState::RemoveHash
					),
					"Frame {fid} in state {:?} is not in any list",
					meta.state()
				);
			}
			if free.contains(fid) || free.is_withdrawn(fid) {
				assert_eq!(meta.state(), PageState::NotUsed);
				assert!(meta.id.is_none());
			}
			if lru.contains(fid) {
				let id = meta.id.expect("Page in the LRU list without an id");
				let partition = &partitions[self.hash.partition_index(id)];
				assert_eq!(partition.get(&id), Some(&HashEntry::Frame(fid)));
			}
			assert_eq!(flush.contains(fid), meta.is_dirty(), "Dirty flag of {fid} disagrees");
			if flush.contains(fid) {
				assert!(lru.contains(fid), "Dirty frame {fid} is not in the LRU list");
			}
		}

		for partition in &partitions {
			for (id, entry) in partition.iter() {
				match *entry {
					HashEntry::Frame(fid) => {
						assert_eq!(self.block(fid).meta.lock().id, Some(*id));
					}
					HashEntry::Watch(slot) => {
						assert_eq!(self.watch.slot_page(slot), Some(*id));
					}
				}
			}
		}

		flush.validate();
		lru.validate();
	}
}

/// One pool instance together with the collaborators it performs I/O with.
pub(crate) struct PoolInstance<S> {
	pub core: PoolCore,
	pub storage: Arc<S>,
	pub wal: Arc<dyn WalApi + Send + Sync>,
	pub verifier: Option<Arc<dyn PageVerifier + Send + Sync>>,
	pub dispatcher: Arc<IoDispatcher>,
}

impl<S: PageStorageApi + Send + Sync + 'static> PoolInstance<S> {
	pub fn new(
		index: usize,
		config: &BufferPoolConfig,
		num_chunks: usize,
		storage: Arc<S>,
		collaborators: &Collaborators,
		dispatcher: Arc<IoDispatcher>,
	) -> Result<Self, CacheError> {
		Ok(Self {
			core: PoolCore::new(
				index,
				config,
				num_chunks,
				collaborators.eviction_hook.clone(),
			)?,
			storage,
			wal: Arc::clone(&collaborators.wal),
			verifier: collaborators.verifier.clone(),
			dispatcher,
		})
	}

	/// Finds a descriptor for a new page: from the free list, by evicting a
	/// clean page, or after flushing dirty pages at the LRU tail. Gives up
	/// after a bounded number of rounds.
	pub fn allocate_block(&self) -> Result<Block, CacheError> {
		let mut round = 0;
		loop {
			if let Some(block) = self.core.pop_free().or_else(|| self.core.try_evict()) {
				return Ok(block);
			}
			if round == ALLOCATION_ROUNDS {
				warn!(
					"Instance {} found no replaceable frame after {round} rounds",
					self.core.index
				);
				return Err(CacheError::AllocationStall);
			}
			round += 1;
			if self.flush_lru_tail(self.core.config.flush_batch_size) == 0 {
				debug!("No frame to replace in instance {}, backing off", self.core.index);
				#[allow(clippy::cast_possible_truncation)]
				thread::sleep(ALLOCATION_BACKOFF * round as u32);
			}
		}
	}
}
