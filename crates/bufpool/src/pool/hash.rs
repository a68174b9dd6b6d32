use std::collections::HashMap;

use log::debug;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::frames::FrameId;
use crate::page::PageId;

/// What a page id maps to in the hash index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HashEntry {
	Frame(FrameId),
	/// A watch sentinel, by slot index.
	Watch(usize),
}

pub(crate) type Partition = HashMap<PageId, HashEntry>;

/// The page id index of one instance, split into independently locked
/// partitions.
pub(crate) struct PageHash {
	partitions: Box<[RwLock<Partition>]>,
}

impl PageHash {
	pub fn new(num_partitions: usize, num_frames: usize) -> Self {
		debug_assert!(num_partitions.is_power_of_two());
		let capacity = Self::partition_capacity(num_partitions, num_frames);
		let partitions = (0..num_partitions)
			.map(|_| RwLock::new(HashMap::with_capacity(capacity)))
			.collect();
		Self { partitions }
	}

	fn partition_capacity(num_partitions: usize, num_frames: usize) -> usize {
		(2 * num_frames).next_power_of_two() / num_partitions
	}

	#[inline]
	#[allow(clippy::cast_possible_truncation)]
	pub fn partition_index(&self, id: PageId) -> usize {
		(id.fold() >> 32) as usize & (self.partitions.len() - 1)
	}

	#[inline]
	pub fn read(&self, id: PageId) -> RwLockReadGuard<'_, Partition> {
		self.partitions[self.partition_index(id)].read()
	}

	#[inline]
	pub fn write(&self, id: PageId) -> RwLockWriteGuard<'_, Partition> {
		self.partitions[self.partition_index(id)].write()
	}

	pub fn lookup(&self, id: PageId) -> Option<HashEntry> {
		self.read(id).get(&id).copied()
	}

	/// Locks every partition in index order.
	pub fn lock_all(&self) -> Vec<RwLockWriteGuard<'_, Partition>> {
		self.partitions.iter().map(RwLock::write).collect()
	}

	/// Rebuilds every partition for a new number of frames. The caller holds
	/// every partition lock, as taken by `lock_all`.
	pub fn resize_locked(
		&self,
		partitions: &mut [RwLockWriteGuard<'_, Partition>],
		num_frames: usize,
	) {
		debug_assert_eq!(partitions.len(), self.partitions.len());
		let capacity = Self::partition_capacity(self.partitions.len(), num_frames);
		for partition in partitions.iter_mut() {
			let mut rebuilt = HashMap::with_capacity(capacity.max(partition.len()));
			rebuilt.extend(partition.drain());
			**partition = rebuilt;
		}
		debug!("Rebuilt page hash for {num_frames} frames");
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.partitions.iter().map(|p| p.read().len()).sum()
	}
}

#[cfg(test)]
mod tests {
	use crate::utils::test_helpers::page_id;

	use super::*;

	#[test]
	fn insert_and_lookup() {
		// given
		let hash = PageHash::new(4, 16);

		// when
		hash.write(page_id!(1, 2))
			.insert(page_id!(1, 2), HashEntry::Frame(FrameId(3)));
		hash.write(page_id!(2, 2))
			.insert(page_id!(2, 2), HashEntry::Watch(0));

		// then
		assert_eq!(hash.lookup(page_id!(1, 2)), Some(HashEntry::Frame(FrameId(3))));
		assert_eq!(hash.lookup(page_id!(2, 2)), Some(HashEntry::Watch(0)));
		assert_eq!(hash.lookup(page_id!(1, 3)), None);
		assert_eq!(hash.len(), 2);
	}

	#[test]
	fn resize_keeps_entries() {
		// given
		let hash = PageHash::new(2, 4);
		for i in 0..8 {
			hash.write(page_id!(1, i))
				.insert(page_id!(1, i), HashEntry::Frame(FrameId(i)));
		}

		// when
		let mut partitions = hash.lock_all();
		hash.resize_locked(&mut partitions, 64);
		drop(partitions);

		// then
		for i in 0..8 {
			assert_eq!(hash.lookup(page_id!(1, i)), Some(HashEntry::Frame(FrameId(i))));
		}
	}
}
