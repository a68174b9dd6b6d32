use std::{cmp, mem, sync::atomic::Ordering, thread};

use log::{debug, info, warn};
use parking_lot::{MutexGuard, RwLockWriteGuard};

use super::{
	flush::FlushList,
	frames::{Block, Chunk, FrameId},
	free::FreeList,
	hash::{HashEntry, Partition},
	instance::{PoolCore, PoolInstance},
	lru::LruList,
	BufferPool, CacheError,
};
use crate::{
	consts::MAX_RESIZE_BACKOFF_FACTOR,
	page::{IoFix, PageState},
	storage::PageStorageApi,
};

/// What happened to a page in the withdraw area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Withdrawal {
	/// The page moved to a free frame outside the withdraw area.
	Relocated,
	/// No frame was free, so the clean page was evicted.
	Evicted,
	/// No frame was free and the page has to be written before it can go.
	NeedsFlush,
	/// The page is pinned, under I/O, or no longer there.
	Busy,
}

/// Every list and hash lock of one instance.
struct CoreLocks<'a> {
	core: &'a PoolCore,
	lru: MutexGuard<'a, LruList>,
	partitions: Vec<RwLockWriteGuard<'a, Partition>>,
	free: MutexGuard<'a, FreeList>,
	flush: MutexGuard<'a, FlushList>,
}

impl<'a> CoreLocks<'a> {
	fn acquire(core: &'a PoolCore) -> Self {
		let lru = core.lru.lock();
		let partitions = core.hash.lock_all();
		let free = core.free.lock();
		let flush = core.flush.lock();
		Self {
			core,
			lru,
			partitions,
			free,
			flush,
		}
	}
}

impl PoolCore {
	fn attach_chunks(&self, chunks: Vec<Chunk>) {
		let mut locks = CoreLocks::acquire(self);
		let mut new_frames = Vec::new();
		for chunk in chunks {
			new_frames.extend(self.chunks.push(chunk).frame_ids());
		}
		let num_frames = self.chunks.num_frames();

		locks.lru.grow(num_frames);
		locks.free.grow(num_frames);
		locks.flush.grow(num_frames);
		for fid in new_frames.into_iter().rev() {
			locks.free.push(fid);
		}
		self.hash.resize_locked(&mut locks.partitions, num_frames);
	}

	fn begin_withdraw(&self, from: FrameId) {
		let _lru = self.lru.lock();
		let moved = self.free.lock().begin_withdraw(from);
		debug!("Instance {} withdrew {moved} free frames from {from} on", self.index);
	}

	fn rollback_withdraw(&self) {
		let _lru = self.lru.lock();
		let returned = self.free.lock().end_withdraw(true);
		debug!("Instance {} took back {} withdrawn frames", self.index, returned.len());
	}

	/// Frames in the withdraw area that are not withdrawn yet.
	fn withdraw_remaining(&self, from: FrameId) -> usize {
		let area = self.chunks.num_frames().saturating_sub(from.index());
		area - self.free.lock().withdrawn_len()
	}

	/// Frames of the LRU list that lie in the withdraw area.
	fn lru_frames_from(&self, from: FrameId) -> Vec<FrameId> {
		self.lru.lock().list().iter().filter(|fid| *fid >= from).collect()
	}

	/// Moves the page in `block` out of the withdraw area, either into a free
	/// frame or, if there is none, out of the pool.
	fn withdraw_page(&self, block: &Block) -> Withdrawal {
		let fid = block.id();
		let mut lru = self.lru.lock();
		if !lru.contains(fid) || block.pin_count() > 0 {
			return Withdrawal::Busy;
		}
		let Some(id) = block.meta.lock().id else {
			return Withdrawal::Busy;
		};

		let mut partition = self.hash.write(id);
		let mut free = self.free.lock();
		let mut flush = self.flush.lock();
		let mut meta = block.meta.lock();
		// Pins are only taken under the partition lock, so the page stays idle
		// from here on.
		if block.pin_count() > 0
			|| meta.id != Some(id)
			|| meta.state() != PageState::FilePage
			|| meta.io_fix != IoFix::None
		{
			return Withdrawal::Busy;
		}

		let Some(target_fid) = free.pop() else {
			if meta.is_dirty() {
				return Withdrawal::NeedsFlush;
			}
			partition.remove(&id);
			lru.remove(fid);
			meta.set_state(PageState::RemoveHash);
			meta.clear_page();
			meta.set_state(PageState::NotUsed);
			mem::drop(meta);
			self.notify_evict(id, block);
			block.poison();
			free.push(fid);
			return Withdrawal::Evicted;
		};

		let target = self.block(target_fid);
		let mut target_meta = target.meta.lock();
		meta.io_fix = IoFix::Pin;
		// Safety: the source page is unpinned and has no I/O in flight, so no
		// latch on it can be held; the target frame is not reachable at all.
		unsafe { target.frame_mut() }.copy_from_slice(unsafe { block.frame() });
		target_meta.set_state(PageState::ReadyForUse);
		target_meta.set_state(PageState::FilePage);
		target_meta.id = Some(id);
		target_meta.oldest_modification = meta.oldest_modification;
		target_meta.newest_modification = meta.newest_modification;
		target.set_access_time(block.access_time());

		partition.insert(id, HashEntry::Frame(target_fid));
		lru.replace(fid, target_fid);
		if flush.contains(fid) {
			flush.replace(fid, target_fid);
		}

		meta.set_state(PageState::RemoveHash);
		meta.clear_page();
		meta.set_state(PageState::NotUsed);
		mem::drop(target_meta);
		mem::drop(meta);
		block.poison();
		free.push(fid);
		Withdrawal::Relocated
	}
}

impl<S: PageStorageApi + Send + Sync + 'static> PoolInstance<S> {
	/// One pass over the withdraw area. Returns the number of frames still to
	/// withdraw afterwards.
	fn withdraw_round(&self, from: FrameId) -> usize {
		self.core.free.lock().drain_free();
		let (mut relocated, mut evicted, mut busy) = (0, 0, 0);
		for fid in self.core.lru_frames_from(from) {
			let block = self.core.block(fid);
			let mut outcome = self.core.withdraw_page(&block);
			if outcome == Withdrawal::NeedsFlush && self.flush_block(&block) {
				outcome = self.core.withdraw_page(&block);
			}
			match outcome {
				Withdrawal::Relocated => relocated += 1,
				Withdrawal::Evicted => evicted += 1,
				Withdrawal::NeedsFlush | Withdrawal::Busy => busy += 1,
			}
		}
		debug!(
			"Instance {}: relocated {relocated}, evicted {evicted}, {busy} busy",
			self.core.index
		);
		self.core.withdraw_remaining(from)
	}
}

impl<S: PageStorageApi + Send + Sync + 'static> BufferPool<S> {
	/// Resizes the frame memory of the pool to `new_size` bytes, rounded down
	/// to whole chunks per instance. Only one resize runs at a time.
	///
	/// Shrinking drains the frames to be removed while the pool stays in use;
	/// pages in them are moved elsewhere or evicted. If that does not succeed
	/// within the configured number of rounds, or [`abort_resize`] is called,
	/// the pool keeps its previous size.
	///
	/// [`abort_resize`]: BufferPool::abort_resize
	pub fn resize(&self, new_size: usize) -> Result<(), CacheError> {
		let _resize = self.resize_lock.lock();
		self.abort_resize.store(false, Ordering::Relaxed);

		let target = self.config.chunks_per_instance(new_size);
		if target == 0 {
			return Err(CacheError::InvalidConfig(format!(
				"{new_size} bytes do not make up one chunk per instance"
			)));
		}
		let current = self.instances[0].core.chunks.num_chunks();
		match target.cmp(&current) {
			cmp::Ordering::Equal => Ok(()),
			cmp::Ordering::Greater => self.grow(current, target),
			cmp::Ordering::Less => self.shrink(current, target),
		}
	}

	/// Makes a running shrink give up and roll back at its next round.
	pub fn abort_resize(&self) {
		self.abort_resize.store(true, Ordering::Relaxed);
	}

	fn grow(&self, current: usize, target: usize) -> Result<(), CacheError> {
		// All memory is allocated up front, so that running out of it leaves
		// the pool untouched.
		let allocated = self
			.instances
			.iter()
			.map(|instance| {
				(current..target)
					.map(|index| instance.core.chunks.allocate_chunk(index))
					.collect::<Result<Vec<_>, _>>()
			})
			.collect::<Result<Vec<_>, _>>()?;

		for (instance, chunks) in self.instances.iter().zip(allocated) {
			instance.core.attach_chunks(chunks);
		}
		info!(
			"Grew buffer pool from {current} to {target} chunks per instance ({} bytes)",
			self.size()
		);
		Ok(())
	}

	fn shrink(&self, current: usize, target: usize) -> Result<(), CacheError> {
		let from = FrameId::from_index(target * self.config.frames_per_chunk());
		info!("Shrinking buffer pool from {current} to {target} chunks per instance");
		for instance in self.instances.iter() {
			instance.core.begin_withdraw(from);
		}

		let max_backoff = self.config.resize_backoff * MAX_RESIZE_BACKOFF_FACTOR;
		let mut backoff = self.config.resize_backoff;
		let mut remaining = 0;
		for round in 1..=self.config.resize_max_rounds {
			if self.abort_resize.load(Ordering::Relaxed) {
				warn!("Shrink aborted in round {round}");
				self.rollback_shrink();
				return Err(CacheError::ResizeAborted);
			}

			remaining = self
				.instances
				.iter()
				.map(|instance| instance.withdraw_round(from))
				.sum();
			if remaining == 0 {
				self.finish_shrink(target);
				info!("Shrank buffer pool to {} bytes in {round} rounds", self.size());
				return Ok(());
			}
			info!("Shrink round {round}: {remaining} frames left to withdraw");
			thread::sleep(backoff);
			backoff = cmp::min(backoff * 2, max_backoff);
		}

		warn!("Shrink gave up with {remaining} frames left to withdraw");
		self.rollback_shrink();
		Err(CacheError::ResizeStall(remaining))
	}

	fn rollback_shrink(&self) {
		for instance in self.instances.iter() {
			instance.core.rollback_withdraw();
		}
	}

	/// Drops the withdrawn chunks. Every instance is locked at once for this.
	fn finish_shrink(&self, target: usize) {
		let mut all_locks: Vec<_> = self
			.instances
			.iter()
			.map(|instance| CoreLocks::acquire(&instance.core))
			.collect();

		for locks in &mut all_locks {
			let core = locks.core;
			let withdrawn = locks.free.end_withdraw(false);
			let num_frames = target * core.chunks.frames_per_chunk();
			debug_assert!(withdrawn.iter().all(|fid| fid.index() >= num_frames));
			debug_assert!(locks.lru.list().iter().all(|fid| fid.index() < num_frames));

			locks.lru.truncate(num_frames);
			locks.free.truncate(num_frames);
			locks.flush.truncate(num_frames);
			let removed = core.chunks.truncate(target);
			core.hash.resize_locked(&mut locks.partitions, num_frames);
			debug!(
				"Instance {} released {} chunks ({} bytes)",
				core.index,
				removed.len(),
				removed.iter().map(|chunk| chunk.size_bytes()).sum::<usize>()
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{thread, time::Duration};

	use crate::{
		pool::{
			tests::test_pool, BufferPoolConfig, Collaborators, Exclusive, FetchMode, Shared, Unlatched,
		},
		storage::MockPageStorageApi,
		utils::test_helpers::{log_pos, page_id},
		CacheError,
	};

	fn storage_with_io() -> MockPageStorageApi {
		let mut storage = MockPageStorageApi::new();
		storage.expect_read_page().returning(|id, buf| {
			buf.fill(id.page_no as u8);
			Ok(())
		});
		storage.expect_write_page().returning(|_, _| Ok(()));
		storage.expect_space_exists().return_const(true);
		storage
	}

	fn chunked_config(num_frames: usize) -> BufferPoolConfig {
		let mut config = BufferPoolConfig::for_tests(num_frames);
		config.chunk_size = 10 * config.page_size;
		config
	}

	#[test]
	fn grow_adds_free_frames() {
		// given
		let config = chunked_config(20);
		let pool = test_pool(&config, storage_with_io(), Collaborators::default());
		for page_no in 0..20 {
			pool.get::<Unlatched>(page_id!(1, page_no), FetchMode::Get).unwrap();
		}

		// when
		pool.resize(40 * config.page_size).unwrap();

		// then
		let stats = pool.stats();
		assert_eq!(stats.frames, 40);
		assert_eq!(stats.free_len, 20);
		assert_eq!(stats.lru_len, 20);
		for page_no in 20..40 {
			pool.get::<Unlatched>(page_id!(1, page_no), FetchMode::Get).unwrap();
		}
		assert_eq!(pool.stats().pages_evicted, 0);
		pool.validate();
	}

	#[test]
	fn shrink_relocates_pages_into_free_frames() {
		// given
		let config = chunked_config(20);
		let pool = test_pool(&config, storage_with_io(), Collaborators::default());
		pool.resize(40 * config.page_size).unwrap();
		// The frames added by the grow are handed out first, so these pages
		// all live in the area the shrink withdraws again.
		for page_no in 0..10 {
			pool.get::<Unlatched>(page_id!(1, page_no), FetchMode::Get).unwrap();
		}
		let mut page = pool.get::<Exclusive>(page_id!(1, 5), FetchMode::Get).unwrap();
		page[0] = 0xee;
		page.mark_dirty(log_pos!(9));
		page.release();

		// when
		pool.resize(20 * config.page_size).unwrap();

		// then
		let stats = pool.stats();
		assert_eq!(stats.frames, 20);
		assert_eq!(stats.lru_len, 10);
		assert_eq!(stats.dirty_len, 1);
		assert_eq!(stats.pages_evicted, 0);
		let page = pool.get::<Shared>(page_id!(1, 5), FetchMode::IfInPool).unwrap();
		assert_eq!(page[0], 0xee);
		assert_eq!(page[1], 5);
		page.release();
		assert_eq!(pool.checkpoint_lower_bound(), Some(log_pos!(9)));
		pool.validate();
	}

	#[test]
	fn shrink_evicts_when_no_frame_is_free() {
		// given
		let config = chunked_config(40);
		let pool = test_pool(&config, storage_with_io(), Collaborators::default());
		for page_no in 0..40 {
			pool.get::<Unlatched>(page_id!(1, page_no), FetchMode::Get).unwrap();
		}

		// when
		pool.resize(20 * config.page_size).unwrap();

		// then
		let stats = pool.stats();
		assert_eq!(stats.frames, 20);
		assert_eq!(stats.lru_len, 20);
		assert_eq!(stats.pages_evicted, 20);
		pool.validate();
	}

	#[test]
	fn shrink_waits_for_pinned_pages() {
		// given
		let mut config = chunked_config(100);
		config.resize_max_rounds = 500;
		let pool = test_pool(&config, storage_with_io(), Collaborators::default());
		for page_no in 0..90 {
			pool.get::<Unlatched>(page_id!(1, page_no), FetchMode::Get).unwrap();
		}
		let pinned: Vec<_> = (90..100)
			.map(|page_no| pool.get::<Unlatched>(page_id!(1, page_no), FetchMode::Get).unwrap())
			.collect();

		// when
		thread::scope(|s| {
			s.spawn(move || {
				thread::sleep(Duration::from_millis(30));
				std::mem::drop(pinned);
			});
			pool.resize(60 * config.page_size).unwrap();
		});

		// then
		let stats = pool.stats();
		assert_eq!(stats.frames, 60);
		assert_eq!(stats.lru_len + stats.free_len, 60);
		assert_eq!(stats.withdrawn_len, 0);
		assert_eq!(pool.size(), 60 * config.page_size);
		pool.validate();
	}

	#[test]
	fn shrink_stalls_on_a_page_that_stays_pinned() {
		// given
		let mut config = chunked_config(20);
		config.resize_max_rounds = 3;
		let pool = test_pool(&config, storage_with_io(), Collaborators::default());
		for page_no in 0..15 {
			pool.get::<Unlatched>(page_id!(1, page_no), FetchMode::Get).unwrap();
		}
		let pinned = pool.get::<Unlatched>(page_id!(1, 15), FetchMode::Get).unwrap();

		// when
		let result = pool.resize(10 * config.page_size);

		// then
		assert!(matches!(result, Err(CacheError::ResizeStall(1))));
		assert_eq!(pool.stats().frames, 20);
		assert_eq!(pool.stats().withdrawn_len, 0);
		pinned.release();
		pool.validate();
	}

	#[test]
	fn abort_rolls_back_a_shrink() {
		// given
		let mut config = chunked_config(20);
		config.resize_max_rounds = 10_000;
		let pool = test_pool(&config, storage_with_io(), Collaborators::default());
		for page_no in 0..15 {
			pool.get::<Unlatched>(page_id!(1, page_no), FetchMode::Get).unwrap();
		}
		let pinned = pool.get::<Unlatched>(page_id!(1, 15), FetchMode::Get).unwrap();

		// when
		let result = thread::scope(|s| {
			s.spawn(|| {
				thread::sleep(Duration::from_millis(20));
				pool.abort_resize();
			});
			pool.resize(10 * config.page_size)
		});

		// then
		assert!(matches!(result, Err(CacheError::ResizeAborted)));
		let stats = pool.stats();
		assert_eq!(stats.frames, 20);
		assert_eq!(stats.withdrawn_len, 0);
		assert_eq!(stats.lru_len + stats.free_len, 20);
		pinned.release();
		pool.validate();
	}

	#[test]
	fn resize_below_one_chunk_is_rejected() {
		// given
		let config = chunked_config(20);
		let pool = test_pool(&config, storage_with_io(), Collaborators::default());

		// when
		let result = pool.resize(config.page_size);

		// then
		assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
		assert_eq!(pool.stats().frames, 20);
	}
}
