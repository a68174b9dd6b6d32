use std::fmt;

/// Identifies a page on disk by its tablespace and its page number within
/// that space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
	pub space_id: u32,
	pub page_no: u32,
}

impl PageId {
	pub const fn new(space_id: u32, page_no: u32) -> Self {
		Self { space_id, page_no }
	}

	/// Hash fold used for partition selection.
	pub(crate) fn fold(self) -> u64 {
		let space = u64::from(self.space_id);
		let page = u64::from(self.page_no);
		((space << 20).wrapping_add(space).wrapping_add(page)).wrapping_mul(0x9E37_79B9_7F4A_7C15)
	}

	/// Hash fold used to pick a pool instance. Pages of the same 64-page
	/// extent always land in the same instance, so read-ahead of an extent
	/// stays local.
	pub(crate) fn instance_fold(self) -> u64 {
		Self::new(self.space_id, self.page_no >> 6).fold()
	}
}

impl fmt::Display for PageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "[space {}, page {}]", self.space_id, self.page_no)
	}
}

/// A position in the write-ahead log. The cache only ever compares log
/// positions, it never interprets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LogPos(pub u64);

impl LogPos {
	pub const ZERO: Self = Self(0);
	pub const MAX: Self = Self(u64::MAX);
}

impl fmt::Display for LogPos {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Lifecycle state of a page descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageState {
	/// In the free list (or withdrawn), holds no page.
	NotUsed,
	/// Taken off the free list, about to be assigned.
	ReadyForUse,
	/// Holds a file page and is reachable through the hash index.
	FilePage,
	/// Holds content that is not (yet) a hashed file page.
	Memory,
	/// Removed from the hash index, waiting for its last pin to go away.
	RemoveHash,
	/// A watch sentinel that is in use.
	ZipPage,
	/// Compressed-only dirty page. Compression lives outside the cache, so no
	/// descriptor is ever put into this state.
	ZipDirty,
	/// A watch sentinel that is free.
	PoolWatch,
}

impl PageState {
	/// The legal state transitions of a descriptor.
	pub(crate) fn can_become(self, next: PageState) -> bool {
		use PageState::*;
		matches!(
			(self, next),
			(NotUsed, ReadyForUse)
				| (ReadyForUse, FilePage)
				| (ReadyForUse, Memory)
				| (ReadyForUse, NotUsed)
				| (Memory, FilePage)
				| (Memory, NotUsed)
				| (FilePage, RemoveHash)
				| (RemoveHash, NotUsed)
				| (RemoveHash, ReadyForUse)
				| (PoolWatch, ZipPage)
				| (ZipPage, PoolWatch)
		)
	}
}

/// In-flight I/O on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IoFix {
	#[default]
	None,
	Read,
	Write,
	/// No I/O may start and the descriptor may not move.
	Pin,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extent_pages_share_instance_fold() {
		assert_eq!(
			PageId::new(3, 64).instance_fold(),
			PageId::new(3, 127).instance_fold()
		);
		assert_ne!(
			PageId::new(3, 63).instance_fold(),
			PageId::new(3, 64).instance_fold()
		);
	}

	#[test]
	fn state_transitions() {
		assert!(PageState::NotUsed.can_become(PageState::ReadyForUse));
		assert!(PageState::FilePage.can_become(PageState::RemoveHash));
		assert!(!PageState::NotUsed.can_become(PageState::FilePage));
		assert!(!PageState::FilePage.can_become(PageState::NotUsed));
		assert!(!PageState::PoolWatch.can_become(PageState::FilePage));
	}
}
