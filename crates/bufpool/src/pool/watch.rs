use std::mem;

use log::warn;
use parking_lot::Mutex;

use super::{
	frames::Block,
	hash::{HashEntry, Partition},
	instance::PoolCore,
	CacheError,
};
use crate::page::{PageId, PageState};

#[derive(Debug)]
struct WatchSlot {
	state: PageState,
	id: Option<PageId>,
	pins: u32,
}

/// A fixed set of sentinel descriptors that stand in the hash index for
/// pages somebody waits for.
///
/// A slot is `PoolWatch` while free and `ZipPage` while claimed. It stays
/// claimed after the real page replaced it in the hash index, until the last
/// watcher is gone, so a failed load can put it back.
pub(crate) struct WatchRegistry {
	slots: Box<[Mutex<WatchSlot>]>,
}

pub(crate) enum WatchOutcome {
	/// The page is in the pool; the block was pinned.
	Found(Block),
	Watching,
}

impl WatchRegistry {
	pub fn new(num_slots: usize) -> Self {
		let slots = (0..num_slots)
			.map(|_| {
				Mutex::new(WatchSlot {
					state: PageState::PoolWatch,
					id: None,
					pins: 0,
				})
			})
			.collect();
		Self { slots }
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.slots.len()
	}

	fn claim(&self, id: PageId, pins: u32) -> Option<usize> {
		self.slots.iter().position(|slot| {
			let mut slot = slot.lock();
			if slot.state != PageState::PoolWatch {
				return false;
			}
			slot.state = PageState::ZipPage;
			slot.id = Some(id);
			slot.pins = pins;
			true
		})
	}

	fn add_pin(&self, index: usize) {
		self.slots[index].lock().pins += 1;
	}

	fn remove_pin(&self, index: usize) -> u32 {
		let mut slot = self.slots[index].lock();
		debug_assert!(slot.pins > 0);
		slot.pins -= 1;
		slot.pins
	}

	/// Hands the pins of a sentinel over to the page that replaces it. The
	/// slot stays claimed.
	pub fn take_pins(&self, index: usize) -> u32 {
		let mut slot = self.slots[index].lock();
		debug_assert_eq!(slot.state, PageState::ZipPage);
		mem::take(&mut slot.pins)
	}

	/// Gives the pins of a page whose load failed back to its sentinel.
	pub fn restore_pins(&self, index: usize, pins: u32) {
		let mut slot = self.slots[index].lock();
		debug_assert_eq!(slot.state, PageState::ZipPage);
		slot.pins = pins;
	}

	pub fn release(&self, index: usize) {
		let mut slot = self.slots[index].lock();
		debug_assert!(slot.state.can_become(PageState::PoolWatch));
		slot.state = PageState::PoolWatch;
		slot.id = None;
		slot.pins = 0;
	}

	pub fn in_use(&self) -> usize {
		self.slots
			.iter()
			.filter(|slot| slot.lock().state == PageState::ZipPage)
			.count()
	}

	pub fn slot_page(&self, index: usize) -> Option<PageId> {
		self.slots[index].lock().id
	}
}

impl PoolCore {
	/// Sets a watch on `id`, or pins the page if it is already in the pool.
	/// With `as_watcher`, that pin is counted as a watch pin, which
	/// `watch_unset` releases. Watch pins are only counted under the partition
	/// lock.
	pub fn watch_set(&self, id: PageId, as_watcher: bool) -> Result<WatchOutcome, CacheError> {
		let mut partition = self.hash.write(id);
		match partition.get(&id).copied() {
			Some(HashEntry::Frame(fid)) => {
				let block = self.chunks.block(fid);
				block.pin();
				if as_watcher {
					block.meta.lock().watch_pins += 1;
				}
				Ok(WatchOutcome::Found(block))
			}
			Some(HashEntry::Watch(slot)) => {
				self.watch.add_pin(slot);
				Ok(WatchOutcome::Watching)
			}
			None => {
				let slot = self
					.watch
					.claim(id, 1)
					.ok_or(CacheError::WatchSlotsExhausted(self.watch.len()))?;
				partition.insert(id, HashEntry::Watch(slot));
				Ok(WatchOutcome::Watching)
			}
		}
	}

	pub fn watch_occurred(&self, id: PageId) -> bool {
		matches!(self.hash.lookup(id), Some(HashEntry::Frame(_)))
	}

	pub fn watch_unset(&self, id: PageId) {
		let mut partition = self.hash.write(id);
		match partition.get(&id).copied() {
			Some(HashEntry::Watch(slot)) => {
				if self.watch.remove_pin(slot) == 0 {
					partition.remove(&id);
					self.watch.release(slot);
				}
			}
			Some(HashEntry::Frame(fid)) => {
				let block = self.chunks.block(fid);
				let mut meta = block.meta.lock();
				if meta.watch_pins == 0 {
					warn!("Tried to unset a watch on {id}, but there is none");
					return;
				}
				meta.watch_pins -= 1;
				if meta.watch_pins == 0 {
					if let Some(slot) = meta.watch_sentinel.take() {
						self.watch.release(slot);
					}
				}
				mem::drop(meta);
				mem::drop(partition);
				self.release_pin(&block);
			}
			None => warn!("Tried to unset a watch on {id}, but there is none"),
		}
	}

	/// Puts a sentinel back in place of a page whose load failed, so its
	/// watchers keep waiting. The caller drops the watch pins the descriptor
	/// held.
	pub(super) fn reinstall_watch(
		&self,
		partition: &mut Partition,
		id: PageId,
		watch_pins: u32,
		sentinel: Option<usize>,
	) {
		if watch_pins == 0 {
			if let Some(slot) = sentinel {
				self.watch.release(slot);
			}
			return;
		}
		let slot = match sentinel {
			Some(slot) => {
				self.watch.restore_pins(slot, watch_pins);
				Some(slot)
			}
			None => self.watch.claim(id, watch_pins),
		};
		match slot {
			Some(slot) => {
				partition.insert(id, HashEntry::Watch(slot));
			}
			None => {
				warn!("No watch slot left for the watchers of {id}; their watches are dropped");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use crate::utils::test_helpers::page_id;

	use super::*;

	#[test]
	fn slots_cycle_between_states() {
		// given
		let registry = WatchRegistry::new(2);

		// when
		let a = registry.claim(page_id!(1, 1), 1).unwrap();
		let b = registry.claim(page_id!(1, 2), 1).unwrap();
		let none = registry.claim(page_id!(1, 3), 1);
		registry.release(a);

		// then
		assert_ne!(a, b);
		assert!(none.is_none());
		assert_eq!(registry.in_use(), 1);
		assert_eq!(registry.slot_page(b), Some(page_id!(1, 2)));
	}

	#[test]
	fn pins_survive_handoff_and_restore() {
		// given
		let registry = WatchRegistry::new(1);
		let slot = registry.claim(page_id!(1, 1), 1).unwrap();
		registry.add_pin(slot);

		// when
		let pins = registry.take_pins(slot);
		registry.restore_pins(slot, pins);

		// then
		assert_eq!(pins, 2);
		assert_eq!(registry.remove_pin(slot), 1);
		assert_eq!(registry.in_use(), 1);
	}
}
