use std::{mem, sync::Arc, thread};

use log::{error, warn};
use parking_lot::lock_api::RawRwLock as _;

use super::{
	frames::Block,
	guard::LatchKind,
	hash::HashEntry,
	instance::{Counters, PoolInstance},
	watch::WatchOutcome,
	CacheError, FetchMode, RecoveryMode,
};
use crate::{
	consts::{MAX_FETCH_RESTARTS, MAX_READ_WAIT_INTERVAL},
	page::{IoFix, PageId, PageState},
	storage::PageStorageApi,
};

#[derive(Debug, Clone, Copy)]
pub(crate) struct FetchRequest {
	pub id: PageId,
	pub mode: FetchMode,
	pub latch: LatchKind,
	/// Whether the access counts towards making the page young.
	pub track_access: bool,
}

/// Where a fetch stands. Every state that carries a block holds a pin on it.
enum FetchState {
	Lookup,
	Found(Block),
	WaitForRead(Block),
	NotFound,
	BecomeWatcher,
	AllocateVictim,
	IssueRead(Block),
}

impl<S: PageStorageApi + Send + Sync + 'static> PoolInstance<S> {
	/// Returns the page pinned and latched as requested. A page that is not in
	/// the pool is read at most once, however many threads ask for it.
	pub fn fetch(&self, request: FetchRequest) -> Result<Block, CacheError> {
		let id = request.id;
		let mut restarts = 0;
		let mut state = FetchState::Lookup;
		loop {
			state = match state {
				FetchState::Lookup => {
					let partition = self.core.hash.read(id);
					match partition.get(&id).copied() {
						Some(HashEntry::Frame(fid)) => {
							let block = self.core.block(fid);
							block.pin();
							FetchState::Found(block)
						}
						Some(HashEntry::Watch(_)) if request.mode == FetchMode::IfInPoolOrWatch => {
							FetchState::BecomeWatcher
						}
						_ => FetchState::NotFound,
					}
				}
				FetchState::Found(block) => {
					let meta = block.meta.lock();
					let io_fix = meta.io_fix;
					let holds_page = meta.state() == PageState::FilePage && meta.id == Some(id);
					mem::drop(meta);
					if io_fix == IoFix::Read {
						FetchState::WaitForRead(block)
					} else if holds_page {
						return Ok(self.latch_found(block, request));
					} else {
						// The read failed and the page was dropped.
						self.core.release_pin(&block);
						restarts += 1;
						if restarts > MAX_FETCH_RESTARTS {
							return Err(CacheError::ReadAborted(id));
						}
						FetchState::Lookup
					}
				}
				FetchState::WaitForRead(block) => {
					self.wait_for_read(&block);
					FetchState::Found(block)
				}
				FetchState::NotFound => match request.mode {
					FetchMode::Get => FetchState::AllocateVictim,
					FetchMode::IfInPool | FetchMode::PeekIfInPool => {
						return Err(CacheError::NotFound(id))
					}
					FetchMode::IfInPoolOrWatch => FetchState::BecomeWatcher,
				},
				FetchState::BecomeWatcher => match self.core.watch_set(id, false)? {
					WatchOutcome::Found(block) => FetchState::Found(block),
					WatchOutcome::Watching => return Err(CacheError::NotFound(id)),
				},
				FetchState::AllocateVictim => FetchState::IssueRead(self.allocate_block()?),
				FetchState::IssueRead(block) => FetchState::Found(self.issue_read(id, block)?),
			}
		}
	}

	fn latch_found(&self, block: Block, request: FetchRequest) -> Block {
		if request.track_access {
			self.core.record_access(&block);
		}
		match request.latch {
			LatchKind::None => (),
			LatchKind::Shared => block.latch.lock_shared(),
			LatchKind::Exclusive => block.latch.lock_exclusive(),
		}
		block
	}

	/// Polls until the read in flight on a pinned page has completed.
	fn wait_for_read(&self, block: &Block) {
		let mut interval = self.core.config.read_wait_interval;
		while block.meta.lock().io_fix == IoFix::Read {
			thread::sleep(interval);
			interval = (interval * 2).min(MAX_READ_WAIT_INTERVAL);
		}
	}

	/// Makes `block` the descriptor of `id` and reads the page into it. If
	/// another thread got there first, `block` is returned to the free list
	/// and that thread's descriptor is returned instead. Either way the
	/// returned block is pinned.
	fn issue_read(&self, id: PageId, block: Block) -> Result<Block, CacheError> {
		let mut lru = self.core.lru.lock();
		let mut partition = self.core.hash.write(id);
		let (watch_pins, sentinel) = match partition.get(&id).copied() {
			Some(HashEntry::Frame(fid)) => {
				let winner = self.core.block(fid);
				winner.pin();
				mem::drop(partition);
				mem::drop(lru);
				self.core.push_free(&block);
				return Ok(winner);
			}
			Some(HashEntry::Watch(slot)) => (self.core.watch.take_pins(slot), Some(slot)),
			None => (0, None),
		};

		let mut meta = block.meta.lock();
		meta.id = Some(id);
		meta.set_state(PageState::FilePage);
		meta.io_fix = IoFix::Read;
		meta.watch_pins = watch_pins;
		meta.watch_sentinel = sentinel;
		block.pin_by(1 + watch_pins);
		block.set_access_time(0);
		let latched = block.latch.try_lock_exclusive();
		debug_assert!(latched, "Latch of an unreachable frame was taken");
		partition.insert(id, HashEntry::Frame(block.id()));
		lru.insert(block.id(), true);
		mem::drop(meta);
		mem::drop(partition);
		mem::drop(lru);

		Counters::bump(&self.core.counters.pending_reads);
		let result = self.read_into(&block, id);
		self.complete_read(&block, id, result)?;
		Ok(block)
	}

	/// Reads and verifies a page. Failed reads and pages that fail
	/// verification are retried with the same budget.
	fn read_into(&self, block: &Block, id: PageId) -> Result<(), CacheError> {
		// Safety: the exclusive latch is held on behalf of the read.
		let frame = unsafe { block.frame_mut() };
		let retries = self.core.config.read_retries;
		for attempt in 0..=retries {
			let last = attempt == retries;
			if let Err(err) = self.storage.read_page(id, frame) {
				if last {
					if self.core.config.recovery_mode == RecoveryMode::Strict {
						panic!("Reading page {id} failed after {retries} retries: {err}");
					}
					return Err(CacheError::Io(id, err));
				}
				warn!("Reading page {id} failed, retrying ({}/{retries}): {err}", attempt + 1);
				continue;
			}
			match &self.verifier {
				None => return Ok(()),
				Some(verifier) if verifier.verify(id, frame) => return Ok(()),
				Some(_) if !last => {
					warn!(
						"Page {id} failed verification, retrying ({}/{retries})",
						attempt + 1
					);
				}
				Some(_) => (),
			}
		}

		match self.core.config.recovery_mode {
			RecoveryMode::Strict => panic!("Page {id} is corrupt after {retries} retries"),
			RecoveryMode::Report => Err(CacheError::CorruptPage(id)),
			RecoveryMode::BestEffort => {
				error!("Page {id} is corrupt; continuing with an empty page");
				frame.fill(0);
				Ok(())
			}
		}
	}

	/// Finishes a read issued by `issue_read`. On failure the page is
	/// dropped from the pool again, and any watchers go back to waiting on a
	/// sentinel.
	fn complete_read(
		&self,
		block: &Block,
		id: PageId,
		result: Result<(), CacheError>,
	) -> Result<(), CacheError> {
		Counters::drop_one(&self.core.counters.pending_reads);
		let Err(err) = result else {
			block.meta.lock().io_fix = IoFix::None;
			// Safety: `issue_read` took the latch exclusively.
			unsafe { block.latch.unlock_exclusive() };
			Counters::bump(&self.core.counters.pages_read);
			return Ok(());
		};

		error!("Failed to load page {id}: {err}");
		let mut lru = self.core.lru.lock();
		let mut partition = self.core.hash.write(id);
		let mut meta = block.meta.lock();
		partition.remove(&id);
		lru.remove(block.id());
		let watch_pins = mem::take(&mut meta.watch_pins);
		let sentinel = meta.watch_sentinel.take();
		self.core
			.reinstall_watch(&mut partition, id, watch_pins, sentinel);
		meta.set_state(PageState::RemoveHash);
		meta.io_fix = IoFix::None;
		mem::drop(meta);
		mem::drop(partition);
		mem::drop(lru);

		// Safety: `issue_read` took the latch exclusively.
		unsafe { block.latch.unlock_exclusive() };
		self.core.release_pins(block, watch_pins + 1);
		Err(err)
	}

	/// Puts a zero-filled page into the pool without reading it, and returns
	/// it latched exclusively. If the page is already in the pool, its frame
	/// is zero-filled instead.
	pub fn create(&self, id: PageId) -> Result<Block, CacheError> {
		let mut restarts = 0;
		loop {
			let block = self.allocate_block()?;
			block.meta.lock().set_state(PageState::Memory);
			// Safety: the descriptor is not reachable from anywhere.
			unsafe { block.frame_mut() }.fill(0);

			let mut lru = self.core.lru.lock();
			let mut partition = self.core.hash.write(id);
			let (watch_pins, sentinel) = match partition.get(&id).copied() {
				Some(HashEntry::Frame(fid)) => {
					let existing = self.core.block(fid);
					existing.pin();
					mem::drop(partition);
					mem::drop(lru);
					self.core.push_free(&block);

					self.wait_for_read(&existing);
					if existing.meta.lock().state() != PageState::FilePage {
						self.core.release_pin(&existing);
						restarts += 1;
						if restarts > MAX_FETCH_RESTARTS {
							return Err(CacheError::ReadAborted(id));
						}
						continue;
					}
					existing.latch.lock_exclusive();
					// Safety: the exclusive latch is held.
					unsafe { existing.frame_mut() }.fill(0);
					return Ok(existing);
				}
				Some(HashEntry::Watch(slot)) => (self.core.watch.take_pins(slot), Some(slot)),
				None => (0, None),
			};

			let mut meta = block.meta.lock();
			meta.id = Some(id);
			meta.set_state(PageState::FilePage);
			meta.watch_pins = watch_pins;
			meta.watch_sentinel = sentinel;
			block.pin_by(1 + watch_pins);
			block.set_access_time(0);
			let latched = block.latch.try_lock_exclusive();
			debug_assert!(latched, "Latch of an unreachable frame was taken");
			partition.insert(id, HashEntry::Frame(block.id()));
			lru.insert(block.id(), false);
			mem::drop(meta);
			mem::drop(partition);
			mem::drop(lru);

			Counters::bump(&self.core.counters.pages_created);
			return Ok(block);
		}
	}

	/// Reads a page in the background, unless it is already in the pool.
	/// The page is left in the old segment.
	pub fn prefetch(self: &Arc<Self>, id: PageId) {
		if matches!(self.core.hash.lookup(id), Some(HashEntry::Frame(_))) {
			return;
		}
		let instance = Arc::clone(self);
		self.dispatcher.spawn(move || {
			let request = FetchRequest {
				id,
				mode: FetchMode::Get,
				latch: LatchKind::None,
				track_access: false,
			};
			match instance.fetch(request) {
				Ok(block) => instance.core.release_pin(&block),
				Err(err) => error!("Read-ahead of page {id} failed: {err}"),
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use std::{
		thread,
		time::{Duration, Instant},
	};

	use crate::{
		page::PageState,
		pool::{tests::test_pool, BufferPoolConfig, Collaborators, FetchMode, Unlatched},
		storage::MockPageStorageApi,
		utils::test_helpers::page_id,
	};

	#[test]
	fn prefetch_reads_in_the_background() {
		// given
		let mut storage = MockPageStorageApi::new();
		storage.expect_read_page().returning(|id, buf| {
			buf.fill(id.page_no as u8);
			Ok(())
		});
		let mut config = BufferPoolConfig::for_tests(32);
		config.lru_old_min_len = 16;
		let pool = test_pool(&config, storage, Collaborators::default());
		for page_no in 0..20 {
			pool.get::<Unlatched>(page_id!(1, page_no), FetchMode::Get).unwrap();
		}
		let made_young = pool.stats().pages_made_young;

		// when
		pool.prefetch(page_id!(1, 100));
		let deadline = Instant::now() + Duration::from_secs(5);
		while pool.stats().pages_read < 21 {
			assert!(Instant::now() < deadline, "Read-ahead did not complete");
			thread::sleep(Duration::from_millis(1));
		}
		pool.prefetch(page_id!(1, 100));
		thread::sleep(Duration::from_millis(10));

		// then
		let stats = pool.stats();
		assert_eq!(stats.pages_read, 21);
		assert_eq!(stats.pages_made_young, made_young);
		assert_eq!(pool.page_state(page_id!(1, 100)), Some(PageState::FilePage));
		pool.validate();
	}
}
