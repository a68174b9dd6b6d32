use std::iter;

use super::frames::FrameId;

#[derive(Debug, Clone, Copy, Default)]
struct Link {
	prev: Option<FrameId>,
	next: Option<FrameId>,
	linked: bool,
}

/// Index of a published scan cursor within one list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HazardSlot(usize);

/// An intrusive doubly linked list over frame ids.
///
/// The links of every frame of the instance are stored in the list, so
/// membership tests and removals are constant time. Scanners that drop the
/// lock protecting the list in the middle of a scan publish their position as
/// a hazard pointer: removing the element a hazard points at re-points the
/// hazard to that element's predecessor.
#[derive(Debug, Default)]
pub(crate) struct IndexList {
	links: Vec<Link>,
	head: Option<FrameId>,
	tail: Option<FrameId>,
	len: usize,
	hazards: Vec<Hazard>,
}

#[derive(Debug, Clone, Copy)]
struct Hazard {
	in_use: bool,
	at: Option<FrameId>,
}

impl IndexList {
	pub fn with_capacity(num_frames: usize) -> Self {
		let mut list = Self::default();
		list.grow(num_frames);
		list
	}

	/// Makes room for the links of `num_frames` frames.
	pub fn grow(&mut self, num_frames: usize) {
		if num_frames > self.links.len() {
			self.links.resize(num_frames, Link::default());
		}
	}

	/// Drops the links of all frames from `num_frames` onwards. None of them
	/// may be linked.
	pub fn truncate(&mut self, num_frames: usize) {
		debug_assert!(
			self.links[num_frames.min(self.links.len())..]
				.iter()
				.all(|link| !link.linked),
			"Truncated a list that still links withdrawn frames"
		);
		self.links.truncate(num_frames);
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.len
	}

	#[inline]
	pub fn contains(&self, fid: FrameId) -> bool {
		self.links.get(fid.index()).is_some_and(|link| link.linked)
	}

	#[inline]
	pub fn head(&self) -> Option<FrameId> {
		self.head
	}

	#[inline]
	pub fn tail(&self) -> Option<FrameId> {
		self.tail
	}

	#[inline]
	pub fn next(&self, fid: FrameId) -> Option<FrameId> {
		self.links[fid.index()].next
	}

	#[inline]
	pub fn prev(&self, fid: FrameId) -> Option<FrameId> {
		self.links[fid.index()].prev
	}

	pub fn push_front(&mut self, fid: FrameId) {
		self.link(fid, None, self.head);
	}

	pub fn push_back(&mut self, fid: FrameId) {
		self.link(fid, self.tail, None);
	}

	pub fn insert_before(&mut self, anchor: FrameId, fid: FrameId) {
		debug_assert!(self.contains(anchor));
		self.link(fid, self.prev(anchor), Some(anchor));
	}

	pub fn pop_front(&mut self) -> Option<FrameId> {
		let fid = self.head?;
		self.remove(fid);
		Some(fid)
	}

	pub fn remove(&mut self, fid: FrameId) {
		debug_assert!(self.contains(fid), "Removed frame {fid} that is not in the list");
		let Link { prev, next, .. } = self.links[fid.index()];
		match prev {
			Some(prev) => self.links[prev.index()].next = next,
			None => self.head = next,
		}
		match next {
			Some(next) => self.links[next.index()].prev = prev,
			None => self.tail = prev,
		}
		self.links[fid.index()] = Link::default();
		self.len -= 1;

		for hazard in &mut self.hazards {
			if hazard.at == Some(fid) {
				hazard.at = prev;
			}
		}
	}

	/// Puts `new` into the position `old` holds, and moves hazards along.
	pub fn replace(&mut self, old: FrameId, new: FrameId) {
		debug_assert!(self.contains(old));
		debug_assert!(!self.contains(new));
		let link = self.links[old.index()];
		match link.prev {
			Some(prev) => self.links[prev.index()].next = Some(new),
			None => self.head = Some(new),
		}
		match link.next {
			Some(next) => self.links[next.index()].prev = Some(new),
			None => self.tail = Some(new),
		}
		self.links[new.index()] = link;
		self.links[old.index()] = Link::default();

		for hazard in &mut self.hazards {
			if hazard.at == Some(old) {
				hazard.at = Some(new);
			}
		}
	}

	/// Iterates from the head to the tail.
	pub fn iter(&self) -> impl Iterator<Item = FrameId> + '_ {
		iter::successors(self.head, |fid| self.next(*fid))
	}

	/// Publishes a scan cursor.
	pub fn acquire_hazard(&mut self, at: Option<FrameId>) -> HazardSlot {
		let hazard = Hazard { in_use: true, at };
		if let Some(index) = self.hazards.iter().position(|h| !h.in_use) {
			self.hazards[index] = hazard;
			return HazardSlot(index);
		}
		self.hazards.push(hazard);
		HazardSlot(self.hazards.len() - 1)
	}

	#[inline]
	pub fn hazard(&self, slot: HazardSlot) -> Option<FrameId> {
		self.hazards[slot.0].at
	}

	#[inline]
	pub fn set_hazard(&mut self, slot: HazardSlot, at: Option<FrameId>) {
		self.hazards[slot.0].at = at;
	}

	pub fn release_hazard(&mut self, slot: HazardSlot) {
		self.hazards[slot.0] = Hazard {
			in_use: false,
			at: None,
		};
		while self.hazards.last().is_some_and(|h| !h.in_use) {
			self.hazards.pop();
		}
	}

	fn link(&mut self, fid: FrameId, prev: Option<FrameId>, next: Option<FrameId>) {
		debug_assert!(!self.contains(fid), "Frame {fid} is already linked");
		self.links[fid.index()] = Link {
			prev,
			next,
			linked: true,
		};
		match prev {
			Some(prev) => self.links[prev.index()].next = Some(fid),
			None => self.head = Some(fid),
		}
		match next {
			Some(next) => self.links[next.index()].prev = Some(fid),
			None => self.tail = Some(fid),
		}
		self.len += 1;
	}
}
