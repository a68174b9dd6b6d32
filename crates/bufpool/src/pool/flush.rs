use super::{
	frames::FrameId,
	list::{HazardSlot, IndexList},
};
use crate::page::LogPos;

/// Dirty pages ordered by their oldest modification. The head holds the most
/// recently dirtied page, the tail the page that has been dirty the longest.
#[derive(Debug)]
pub(crate) struct FlushList {
	list: IndexList,
	oldest_modification: Vec<Option<LogPos>>,
}

impl FlushList {
	pub fn new(num_frames: usize) -> Self {
		Self {
			list: IndexList::with_capacity(num_frames),
			oldest_modification: vec![None; num_frames],
		}
	}

	pub fn grow(&mut self, num_frames: usize) {
		self.list.grow(num_frames);
		if num_frames > self.oldest_modification.len() {
			self.oldest_modification.resize(num_frames, None);
		}
	}

	pub fn truncate(&mut self, num_frames: usize) {
		self.list.truncate(num_frames);
		self.oldest_modification.truncate(num_frames);
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.list.len()
	}

	#[inline]
	pub fn contains(&self, fid: FrameId) -> bool {
		self.list.contains(fid)
	}

	#[inline]
	pub fn oldest_modification(&self, fid: FrameId) -> Option<LogPos> {
		self.oldest_modification[fid.index()]
	}

	/// Links a page that just became dirty. Pages almost always get dirty in
	/// log order, so the search for the insert position starts at the head.
	pub fn insert_ordered(&mut self, fid: FrameId, lsn: LogPos) {
		self.oldest_modification[fid.index()] = Some(lsn);
		let anchor = self
			.list
			.iter()
			.find(|other| self.oldest_modification[other.index()].is_some_and(|pos| pos <= lsn));
		match anchor {
			Some(anchor) => self.list.insert_before(anchor, fid),
			None => self.list.push_back(fid),
		}
	}

	pub fn remove(&mut self, fid: FrameId) {
		self.list.remove(fid);
		self.oldest_modification[fid.index()] = None;
	}

	pub fn replace(&mut self, old: FrameId, new: FrameId) {
		self.list.replace(old, new);
		self.oldest_modification[new.index()] = self.oldest_modification[old.index()].take();
	}

	/// The smallest oldest modification of any dirty page.
	pub fn min(&self) -> Option<LogPos> {
		self.list.tail().and_then(|fid| self.oldest_modification(fid))
	}

	#[inline]
	pub fn tail(&self) -> Option<FrameId> {
		self.list.tail()
	}

	#[inline]
	pub fn prev(&self, fid: FrameId) -> Option<FrameId> {
		self.list.prev(fid)
	}

	pub fn acquire_hazard(&mut self, at: Option<FrameId>) -> HazardSlot {
		self.list.acquire_hazard(at)
	}

	pub fn hazard(&self, slot: HazardSlot) -> Option<FrameId> {
		self.list.hazard(slot)
	}

	pub fn set_hazard(&mut self, slot: HazardSlot, at: Option<FrameId>) {
		self.list.set_hazard(slot, at);
	}

	pub fn release_hazard(&mut self, slot: HazardSlot) {
		self.list.release_hazard(slot);
	}

	#[cfg(test)]
	pub fn iter(&self) -> impl Iterator<Item = FrameId> + '_ {
		self.list.iter()
	}

	/// Checks that the list is ordered from newest to oldest.
	pub fn validate(&self) {
		let mut newer = LogPos::MAX;
		for fid in self.list.iter() {
			let lsn = self
				.oldest_modification(fid)
				.expect("Flush list entry without an oldest modification");
			assert!(lsn <= newer, "Flush list out of order at {fid}");
			newer = lsn;
		}
	}
}
