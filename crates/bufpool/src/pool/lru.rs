use std::sync::Arc;

use super::{
	frames::{ChunkTable, FrameId},
	list::IndexList,
};
use crate::consts::LRU_OLD_TOLERANCE;

/// The LRU list of one instance. The head holds the most recently used page;
/// the tail part of the list is the old segment, which holds pages that were
/// read in but not yet accessed often enough to be considered hot.
///
/// Below `old_min_len` pages there is no old segment and every page is young.
pub(crate) struct LruList {
	list: IndexList,
	chunks: Arc<ChunkTable>,
	/// The old page closest to the head.
	old_boundary: Option<FrameId>,
	old_len: usize,
	old_ratio: f64,
	old_min_len: usize,
}

impl LruList {
	pub fn new(chunks: Arc<ChunkTable>, old_ratio: f64, old_min_len: usize) -> Self {
		Self {
			list: IndexList::with_capacity(chunks.num_frames()),
			chunks,
			old_boundary: None,
			old_len: 0,
			old_ratio,
			old_min_len,
		}
	}

	pub fn grow(&mut self, num_frames: usize) {
		self.list.grow(num_frames);
	}

	pub fn truncate(&mut self, num_frames: usize) {
		self.list.truncate(num_frames);
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.list.len()
	}

	#[inline]
	pub fn old_len(&self) -> usize {
		self.old_len
	}

	#[inline]
	pub fn contains(&self, fid: FrameId) -> bool {
		self.list.contains(fid)
	}

	#[inline]
	pub fn list(&self) -> &IndexList {
		&self.list
	}

	/// Access to the underlying list for scanners that publish hazards.
	#[inline]
	pub fn list_mut(&mut self) -> &mut IndexList {
		&mut self.list
	}

	/// Links a page at the head of the list, or at the head of the old segment
	/// if `to_old` is set and there is an old segment.
	pub fn insert(&mut self, fid: FrameId, to_old: bool) {
		match self.old_boundary {
			Some(boundary) if to_old => {
				self.list.insert_before(boundary, fid);
				self.set_old(fid, true);
				self.old_boundary = Some(fid);
				self.old_len += 1;
				self.adjust();
			}
			_ => {
				self.list.push_front(fid);
				self.set_old(fid, false);
				if self.old_boundary.is_some() {
					self.adjust();
				} else if self.len() >= self.old_min_len {
					self.init_old();
				}
			}
		}
	}

	pub fn remove(&mut self, fid: FrameId) {
		if self.old_boundary == Some(fid) {
			self.old_boundary = self.list.next(fid);
		}
		if self.is_old(fid) {
			self.old_len -= 1;
		}
		self.list.remove(fid);
		self.set_old(fid, false);

		if self.len() < self.old_min_len {
			self.clear_old();
		} else if self.old_boundary.is_none() {
			self.init_old();
		} else {
			self.adjust();
		}
	}

	/// Moves a page to the head of the young segment.
	pub fn make_young(&mut self, fid: FrameId) {
		self.remove(fid);
		self.insert(fid, false);
	}

	/// Moves a page to the tail of the list, so it is evicted next.
	pub fn make_old(&mut self, fid: FrameId) {
		self.remove(fid);
		match self.old_boundary {
			Some(_) => {
				self.list.push_back(fid);
				self.set_old(fid, true);
				self.old_len += 1;
				if self.old_len == 1 {
					self.old_boundary = Some(fid);
				}
				self.adjust();
			}
			None => {
				self.list.push_back(fid);
				self.set_old(fid, false);
				if self.len() >= self.old_min_len {
					self.init_old();
				}
			}
		}
	}

	/// Puts `new` in the place of `old`, carrying the old flag over.
	pub fn replace(&mut self, old: FrameId, new: FrameId) {
		let was_old = self.is_old(old);
		self.list.replace(old, new);
		self.set_old(old, false);
		self.set_old(new, was_old);
		if self.old_boundary == Some(old) {
			self.old_boundary = Some(new);
		}
	}

	#[inline]
	fn is_old(&self, fid: FrameId) -> bool {
		self.chunks.block(fid).is_old()
	}

	#[inline]
	fn set_old(&self, fid: FrameId, old: bool) {
		self.chunks.block(fid).set_old(old);
	}

	#[allow(
		clippy::cast_possible_truncation,
		clippy::cast_sign_loss,
		clippy::cast_precision_loss
	)]
	fn target_old_len(&self) -> usize {
		(self.len() as f64 * self.old_ratio) as usize
	}

	/// Moves the boundary until the old segment is within tolerance of its
	/// target size.
	fn adjust(&mut self) {
		let Some(mut boundary) = self.old_boundary else {
			return;
		};
		let target = self.target_old_len();
		while self.old_len + LRU_OLD_TOLERANCE < target {
			let Some(prev) = self.list.prev(boundary) else {
				break;
			};
			self.set_old(prev, true);
			self.old_len += 1;
			boundary = prev;
		}
		while self.old_len > target + LRU_OLD_TOLERANCE && self.old_len > 1 {
			let Some(next) = self.list.next(boundary) else {
				break;
			};
			self.set_old(boundary, false);
			self.old_len -= 1;
			boundary = next;
		}
		self.old_boundary = Some(boundary);
	}

	fn init_old(&mut self) {
		let Some(tail) = self.list.tail() else {
			return;
		};
		self.set_old(tail, true);
		self.old_boundary = Some(tail);
		self.old_len = 1;
		self.adjust();
	}

	fn clear_old(&mut self) {
		if self.old_boundary.is_none() {
			return;
		}
		let mut cursor = self.old_boundary;
		while let Some(fid) = cursor {
			self.set_old(fid, false);
			cursor = self.list.next(fid);
		}
		self.old_boundary = None;
		self.old_len = 0;
	}

	/// Checks that the old flags agree with the boundary.
	pub fn validate(&self) {
		let mut in_old = false;
		let mut old_len = 0;
		for fid in self.list.iter() {
			if Some(fid) == self.old_boundary {
				in_old = true;
			}
			assert_eq!(self.is_old(fid), in_old, "Old flag of {fid} disagrees with the boundary");
			if in_old {
				old_len += 1;
			}
		}
		assert_eq!(old_len, self.old_len);
		if self.old_boundary.is_some() {
			let target = self.target_old_len();
			assert!(
				old_len + LRU_OLD_TOLERANCE >= target && old_len <= target + LRU_OLD_TOLERANCE,
				"Old segment of {old_len} pages strays from its target of {target}"
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn lru(frames: usize, old_min_len: usize) -> LruList {
		let chunks = Arc::new(ChunkTable::new(frames, 64));
		chunks.push(chunks.allocate_chunk(0).unwrap());
		LruList::new(chunks, 0.375, old_min_len)
	}

	#[test]
	fn old_segment_appears_at_min_len() {
		// given
		let mut lru = lru(16, 8);

		// when
		for i in 0..7 {
			lru.insert(FrameId(i), true);
		}
		let before = lru.old_len();
		lru.insert(FrameId(7), true);

		// then
		assert_eq!(before, 0);
		assert!((2..=4).contains(&lru.old_len()));
		lru.validate();
	}

	#[test]
	fn old_inserts_stay_behind_young_pages() {
		// given
		let mut lru = lru(32, 8);
		for i in 0..16 {
			lru.insert(FrameId(i), false);
		}

		// when
		lru.insert(FrameId(20), true);

		// then
		assert!(lru.chunks.block(FrameId(20)).is_old());
		assert_ne!(lru.list().head(), Some(FrameId(20)));
		lru.validate();
	}

	#[test]
	fn make_young_moves_to_head() {
		// given
		let mut lru = lru(32, 8);
		for i in 0..16 {
			lru.insert(FrameId(i), false);
		}
		let tail = lru.list().tail().unwrap();

		// when
		lru.make_young(tail);

		// then
		assert_eq!(lru.list().head(), Some(tail));
		assert!(!lru.chunks.block(tail).is_old());
		lru.validate();
	}

	#[test]
	fn shrinking_below_min_len_clears_old_flags() {
		// given
		let mut lru = lru(16, 8);
		for i in 0..8 {
			lru.insert(FrameId(i), false);
		}

		// when
		lru.remove(FrameId(3));

		// then
		assert_eq!(lru.old_len(), 0);
		assert!((0..8)
			.filter(|i| *i != 3)
			.all(|i| !lru.chunks.block(FrameId(i)).is_old()));
		lru.validate();
	}

	#[test]
	fn replace_carries_old_flag() {
		// given
		let mut lru = lru(32, 8);
		for i in 0..16 {
			lru.insert(FrameId(i), false);
		}
		let tail = lru.list().tail().unwrap();

		// when
		lru.replace(tail, FrameId(30));

		// then
		assert!(lru.chunks.block(FrameId(30)).is_old());
		assert!(!lru.contains(tail));
		lru.validate();
	}
}
