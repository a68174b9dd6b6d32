use super::{frames::FrameId, list::IndexList};

/// Descriptors that hold no page, plus the descriptors withdrawn by a running
/// shrink.
///
/// While a shrink runs, every frame at or beyond `withdraw_from` that would
/// be freed is parked on the withdrawn list instead, so the chunks being
/// removed drain over time.
#[derive(Debug)]
pub(crate) struct FreeList {
	free: IndexList,
	withdrawn: IndexList,
	withdraw_from: Option<FrameId>,
}

impl FreeList {
	pub fn new(num_frames: usize) -> Self {
		Self {
			free: IndexList::with_capacity(num_frames),
			withdrawn: IndexList::with_capacity(num_frames),
			withdraw_from: None,
		}
	}

	pub fn grow(&mut self, num_frames: usize) {
		self.free.grow(num_frames);
		self.withdrawn.grow(num_frames);
	}

	pub fn truncate(&mut self, num_frames: usize) {
		self.free.truncate(num_frames);
		self.withdrawn.truncate(num_frames);
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.free.len()
	}

	#[inline]
	pub fn withdrawn_len(&self) -> usize {
		self.withdrawn.len()
	}

	#[inline]
	pub fn contains(&self, fid: FrameId) -> bool {
		self.free.contains(fid)
	}

	#[inline]
	pub fn is_withdrawn(&self, fid: FrameId) -> bool {
		self.withdrawn.contains(fid)
	}

	#[inline]
	pub fn should_withdraw(&self, fid: FrameId) -> bool {
		self.withdraw_from.is_some_and(|from| fid >= from)
	}

	/// Returns true if the frame went to the free list, false if it was
	/// withdrawn.
	pub fn push(&mut self, fid: FrameId) -> bool {
		if self.should_withdraw(fid) {
			self.withdrawn.push_front(fid);
			false
		} else {
			self.free.push_front(fid);
			true
		}
	}

	pub fn pop(&mut self) -> Option<FrameId> {
		self.free.pop_front()
	}

	/// Starts withdrawing every frame from `from` onwards, and moves the
	/// matching frames already in the free list over. Returns the number of
	/// frames moved.
	pub fn begin_withdraw(&mut self, from: FrameId) -> usize {
		self.withdraw_from = Some(from);
		self.drain_free()
	}

	/// Moves free frames in the withdraw area to the withdrawn list.
	pub fn drain_free(&mut self) -> usize {
		let doomed: Vec<_> = self
			.free
			.iter()
			.filter(|fid| self.should_withdraw(*fid))
			.collect();
		for fid in &doomed {
			self.free.remove(*fid);
			self.withdrawn.push_front(*fid);
		}
		doomed.len()
	}

	/// Ends a shrink. On rollback the withdrawn frames return to the free
	/// list; otherwise they are dropped together with their chunks.
	pub fn end_withdraw(&mut self, rollback: bool) -> Vec<FrameId> {
		self.withdraw_from = None;
		let mut ids = Vec::with_capacity(self.withdrawn.len());
		while let Some(fid) = self.withdrawn.pop_front() {
			if rollback {
				self.free.push_front(fid);
			}
			ids.push(fid);
		}
		ids
	}

	#[cfg(test)]
	pub fn iter(&self) -> impl Iterator<Item = FrameId> + '_ {
		self.free.iter()
	}

	#[cfg(test)]
	pub fn withdraw_from(&self) -> Option<FrameId> {
		self.withdraw_from
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn withdrawn_frames_skip_the_free_list() {
		// given
		let mut free = FreeList::new(10);
		for i in 0..8 {
			free.push(FrameId(i));
		}

		// when
		let moved = free.begin_withdraw(FrameId(6));
		let pushed = free.push(FrameId(9));

		// then
		assert_eq!(moved, 2);
		assert!(!pushed);
		assert_eq!(free.len(), 6);
		assert_eq!(free.withdrawn_len(), 3);
		assert!(free.iter().all(|fid| fid < FrameId(6)));
	}

	#[test]
	fn rollback_returns_withdrawn_frames() {
		// given
		let mut free = FreeList::new(10);
		for i in 0..10 {
			free.push(FrameId(i));
		}
		free.begin_withdraw(FrameId(5));

		// when
		let ids = free.end_withdraw(true);

		// then
		assert_eq!(ids.len(), 5);
		assert_eq!(free.len(), 10);
		assert_eq!(free.withdraw_from(), None);
	}
}
