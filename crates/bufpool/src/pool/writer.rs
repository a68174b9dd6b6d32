use std::mem;

use log::error;
use parking_lot::lock_api::RawRwLock as _;

use super::{
	frames::Block,
	instance::{Counters, PoolCore, PoolInstance},
	CacheError,
};
use crate::{
	page::{IoFix, LogPos, PageId, PageState},
	storage::{PageStorageApi, StorageError},
};

impl PoolCore {
	/// The caller holds the exclusive latch on the frame.
	pub fn mark_dirty(&self, block: &Block, lsn: LogPos) {
		let mut flush = self.flush.lock();
		let mut meta = block.meta.lock();
		if meta.oldest_modification.is_none() {
			meta.oldest_modification = Some(lsn);
			flush.insert_ordered(block.id(), lsn);
		}
		meta.newest_modification = Some(meta.newest_modification.map_or(lsn, |pos| pos.max(lsn)));
	}

	/// Claims a dirty page for writing if nothing stands in the way: the page
	/// must be idle, its changes must be durable in the log up to `wal_limit`,
	/// and no writer may hold its latch. On success the page is io-fixed for
	/// writing and its latch is held shared until `complete_write`.
	pub fn begin_write(&self, block: &Block, wal_limit: LogPos) -> Option<PageId> {
		let mut meta = block.meta.lock();
		if meta.state() != PageState::FilePage || meta.io_fix != IoFix::None || !meta.is_dirty() {
			return None;
		}
		if meta
			.newest_modification
			.is_some_and(|newest| newest >= wal_limit)
		{
			return None;
		}
		if !block.latch.try_lock_shared() {
			return None;
		}
		meta.io_fix = IoFix::Write;
		Counters::bump(&self.counters.pending_writes);
		meta.id
	}

	pub fn complete_write(
		&self,
		block: &Block,
		id: PageId,
		result: Result<(), StorageError>,
	) -> Result<(), CacheError> {
		let mut flush = self.flush.lock();
		let mut meta = block.meta.lock();
		debug_assert_eq!(meta.io_fix, IoFix::Write);
		if result.is_ok() {
			flush.remove(block.id());
			meta.oldest_modification = None;
			meta.newest_modification = None;
		}
		// The latch must be free before the io-fix is cleared and the frame
		// becomes evictable.
		// Safety: `begin_write` acquired the latch in shared mode.
		unsafe { block.latch.unlock_shared() };
		meta.io_fix = IoFix::None;
		mem::drop(meta);
		mem::drop(flush);
		Counters::drop_one(&self.counters.pending_writes);

		match result {
			Ok(()) => {
				Counters::bump(&self.counters.pages_written);
				Ok(())
			}
			Err(err) => {
				error!("Failed to write page {id}: {err}");
				Err(CacheError::Io(id, err))
			}
		}
	}
}

impl<S: PageStorageApi + Send + Sync + 'static> PoolInstance<S> {
	fn write_block(&self, block: &Block, id: PageId) -> Result<(), CacheError> {
		// Safety: `begin_write` holds the latch in shared mode.
		let result = self.storage.write_page(id, unsafe { block.frame() });
		self.core.complete_write(block, id, result)
	}

	/// Writes a single dirty page if the log allows it. Returns whether the
	/// page was written.
	pub fn flush_block(&self, block: &Block) -> bool {
		let wal_limit = self.wal.oldest_unflushed_log_position();
		match self.core.begin_write(block, wal_limit) {
			Some(id) => self.write_block(block, id).is_ok(),
			None => false,
		}
	}

	/// Writes up to `max` dirty pages, oldest modification first, stopping at
	/// the first page whose oldest modification is at or beyond `lsn_limit`.
	/// Pages whose changes are not yet durable in the log are skipped.
	///
	/// Returns the number of pages written, or the first write error after
	/// the batch finished.
	pub fn flush_list_batch(&self, max: usize, lsn_limit: LogPos) -> Result<usize, CacheError> {
		let wal_limit = self.wal.oldest_unflushed_log_position();
		let mut written = 0;
		let mut first_error = None;

		let mut flush = self.core.flush.lock();
		let hazard = flush.acquire_hazard(None);
		let mut cursor = flush.tail();
		while let Some(fid) = cursor {
			if written >= max
				|| flush
					.oldest_modification(fid)
					.is_some_and(|pos| pos >= lsn_limit)
			{
				break;
			}
			let prev = flush.prev(fid);
			let block = self.core.block(fid);
			let Some(id) = self.core.begin_write(&block, wal_limit) else {
				cursor = prev;
				continue;
			};

			flush.set_hazard(hazard, prev);
			mem::drop(flush);
			match self.write_block(&block, id) {
				Ok(()) => written += 1,
				Err(err) => {
					first_error.get_or_insert(err);
				}
			}
			flush = self.core.flush.lock();
			cursor = flush.hazard(hazard);
		}
		flush.release_hazard(hazard);
		mem::drop(flush);

		match first_error {
			Some(err) => Err(err),
			None => Ok(written),
		}
	}

	/// Writes dirty pages near the LRU tail so they can be evicted. Returns
	/// the number of pages written.
	pub fn flush_lru_tail(&self, max: usize) -> usize {
		let wal_limit = self.wal.oldest_unflushed_log_position();
		let mut written = 0;
		let mut scanned = 0;

		let mut lru = self.core.lru.lock();
		let hazard = lru.list_mut().acquire_hazard(None);
		let mut cursor = lru.list().tail();
		while let Some(fid) = cursor {
			if written >= max || scanned >= self.core.config.lru_scan_depth {
				break;
			}
			scanned += 1;
			let prev = lru.list().prev(fid);
			let block = self.core.block(fid);
			let started = if block.pin_count() == 0 {
				self.core.begin_write(&block, wal_limit)
			} else {
				None
			};
			let Some(id) = started else {
				cursor = prev;
				continue;
			};

			lru.list_mut().set_hazard(hazard, prev);
			mem::drop(lru);
			// Errors are logged by `complete_write`; the page stays dirty.
			if self.write_block(&block, id).is_ok() {
				written += 1;
			}
			lru = self.core.lru.lock();
			cursor = lru.list().hazard(hazard);
		}
		lru.list_mut().release_hazard(hazard);
		written
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use mockall::predicate::*;

	use crate::{
		pool::{tests::test_pool, BufferPoolConfig, Collaborators, Exclusive, FetchMode},
		storage::{MockPageStorageApi, MockWalApi},
		utils::test_helpers::{log_pos, page_id},
	};

	fn storage_with_reads() -> MockPageStorageApi {
		let mut storage = MockPageStorageApi::new();
		storage.expect_read_page().returning(|_, buf| {
			buf.fill(0);
			Ok(())
		});
		storage.expect_space_exists().return_const(true);
		storage
	}

	#[test]
	fn flush_list_writes_oldest_first() {
		// given
		let mut storage = storage_with_reads();
		let mut seq = mockall::Sequence::new();
		storage
			.expect_write_page()
			.with(eq(page_id!(1, 2)), always())
			.times(1)
			.in_sequence(&mut seq)
			.returning(|_, _| Ok(()));
		storage
			.expect_write_page()
			.with(eq(page_id!(1, 1)), always())
			.times(1)
			.in_sequence(&mut seq)
			.returning(|_, _| Ok(()));
		let pool = test_pool(&BufferPoolConfig::for_tests(16), storage, Collaborators::default());
		for (page_no, lsn) in [(1, 20), (2, 10)] {
			let mut page = pool.get::<Exclusive>(page_id!(1, page_no), FetchMode::Get).unwrap();
			page[0] = 1;
			page.mark_dirty(log_pos!(lsn));
		}

		// when
		let written = pool.flush_list(usize::MAX, log_pos!(u64::MAX)).unwrap();

		// then
		assert_eq!(written, 2);
		assert_eq!(pool.stats().dirty_len, 0);
		assert_eq!(pool.checkpoint_lower_bound(), None);
	}

	#[test]
	fn flush_list_stops_at_lsn_limit() {
		// given
		let mut storage = storage_with_reads();
		storage
			.expect_write_page()
			.with(eq(page_id!(1, 2)), always())
			.times(1)
			.returning(|_, _| Ok(()));
		let pool = test_pool(&BufferPoolConfig::for_tests(16), storage, Collaborators::default());
		for (page_no, lsn) in [(1, 20), (2, 10)] {
			let mut page = pool.get::<Exclusive>(page_id!(1, page_no), FetchMode::Get).unwrap();
			page.mark_dirty(log_pos!(lsn));
		}

		// when
		let written = pool.flush_list(usize::MAX, log_pos!(15)).unwrap();

		// then
		assert_eq!(written, 1);
		assert_eq!(pool.checkpoint_lower_bound(), Some(log_pos!(20)));
	}

	#[test]
	fn pages_ahead_of_the_log_are_not_written() {
		// given
		let mut storage = storage_with_reads();
		storage.expect_write_page().never();
		let mut wal = MockWalApi::new();
		wal.expect_oldest_unflushed_log_position()
			.return_const(log_pos!(5));
		let collaborators = Collaborators {
			wal: Arc::new(wal),
			..Collaborators::default()
		};
		let pool = test_pool(&BufferPoolConfig::for_tests(16), storage, collaborators);
		let mut page = pool.get::<Exclusive>(page_id!(1, 1), FetchMode::Get).unwrap();
		page.mark_dirty(log_pos!(7));
		page.release();

		// when
		let written = pool.flush_list(usize::MAX, log_pos!(u64::MAX)).unwrap();

		// then
		assert_eq!(written, 0);
		assert_eq!(pool.checkpoint_lower_bound(), Some(log_pos!(7)));
	}

	#[test]
	fn failed_write_keeps_page_dirty() {
		// given
		let mut storage = storage_with_reads();
		storage.expect_write_page().returning(|_, _| {
			Err(std::io::Error::other("disk on fire").into())
		});
		let pool = test_pool(&BufferPoolConfig::for_tests(16), storage, Collaborators::default());
		let mut page = pool.get::<Exclusive>(page_id!(1, 1), FetchMode::Get).unwrap();
		page.mark_dirty(log_pos!(3));
		page.release();

		// when
		let result = pool.flush_list(usize::MAX, log_pos!(u64::MAX));

		// then
		assert!(matches!(result, Err(crate::CacheError::Io(id, _)) if id == page_id!(1, 1)));
		assert_eq!(pool.stats().dirty_len, 1);
		pool.validate();
	}
}
