use std::{
	fmt,
	marker::PhantomData,
	mem::ManuallyDrop,
	ops::{Deref, DerefMut},
	ptr,
};

use parking_lot::lock_api::{RawRwLock as _, RawRwLockDowngrade};

use super::{frames::Block, instance::PoolCore};
use crate::page::{LogPos, PageId};

#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchKind {
	None,
	Shared,
	Exclusive,
}

mod sealed {
	pub trait Sealed {}
}

/// How a fetched page is latched. Implemented by [`Shared`], [`Exclusive`]
/// and [`Unlatched`].
pub trait LatchMode: sealed::Sealed {
	#[doc(hidden)]
	const KIND: LatchKind;
}

/// The frame is latched for reading.
#[derive(Debug)]
pub struct Shared;

/// The frame is latched for writing.
#[derive(Debug)]
pub struct Exclusive;

/// The page is only pinned; its content cannot be accessed.
#[derive(Debug)]
pub struct Unlatched;

impl sealed::Sealed for Shared {}
impl sealed::Sealed for Exclusive {}
impl sealed::Sealed for Unlatched {}

impl LatchMode for Shared {
	const KIND: LatchKind = LatchKind::Shared;
}

impl LatchMode for Exclusive {
	const KIND: LatchKind = LatchKind::Exclusive;
}

impl LatchMode for Unlatched {
	const KIND: LatchKind = LatchKind::None;
}

/// A page that is pinned in the pool and latched according to `L`. The pin
/// and the latch are released on drop.
pub struct PinnedPage<'a, L: LatchMode> {
	core: &'a PoolCore,
	block: Block,
	id: PageId,
	_mode: PhantomData<L>,
}

impl<'a, L: LatchMode> PinnedPage<'a, L> {
	/// The caller passes on a pin and a latch of kind `L::KIND` on `block`.
	pub(crate) fn new(core: &'a PoolCore, block: Block, id: PageId) -> Self {
		Self {
			core,
			block,
			id,
			_mode: PhantomData,
		}
	}

	#[inline]
	pub fn id(&self) -> PageId {
		self.id
	}

	/// Unpins and unlatches the page.
	pub fn release(self) {}

	fn into_parts(self) -> (&'a PoolCore, Block, PageId) {
		let this = ManuallyDrop::new(self);
		// Safety: `this` is never dropped, so the block is moved out exactly
		// once.
		let block = unsafe { ptr::read(&this.block) };
		(this.core, block, this.id)
	}
}

impl<'a> PinnedPage<'a, Exclusive> {
	/// Records a modification that was logged at `lsn`. The first
	/// modification links the page into the flush list.
	pub fn mark_dirty(&mut self, lsn: LogPos) {
		self.core.mark_dirty(&self.block, lsn);
	}

	/// Turns the exclusive latch into a shared one without letting another
	/// writer in.
	pub fn downgrade(self) -> PinnedPage<'a, Shared> {
		let (core, block, id) = self.into_parts();
		// Safety: the guard held the exclusive latch.
		unsafe { block.latch.downgrade() };
		PinnedPage::new(core, block, id)
	}
}

impl Deref for PinnedPage<'_, Shared> {
	type Target = [u8];

	fn deref(&self) -> &[u8] {
		// Safety: the shared latch is held.
		unsafe { self.block.frame() }
	}
}

impl Deref for PinnedPage<'_, Exclusive> {
	type Target = [u8];

	fn deref(&self) -> &[u8] {
		// Safety: the exclusive latch is held.
		unsafe { self.block.frame() }
	}
}

impl DerefMut for PinnedPage<'_, Exclusive> {
	fn deref_mut(&mut self) -> &mut [u8] {
		// Safety: the exclusive latch is held, and `&mut self` makes this the
		// only reference handed out.
		unsafe { self.block.frame_mut() }
	}
}

impl<L: LatchMode> fmt::Debug for PinnedPage<'_, L> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PinnedPage")
			.field("id", &self.id)
			.field("frame", &self.block.id())
			.field("latch", &L::KIND)
			.finish()
	}
}

impl<L: LatchMode> Drop for PinnedPage<'_, L> {
	fn drop(&mut self) {
		// Safety: the existence of this object guarantees the latch is owned by
		// the current context
		match L::KIND {
			LatchKind::None => (),
			LatchKind::Shared => unsafe { self.block.latch.unlock_shared() },
			LatchKind::Exclusive => unsafe { self.block.latch.unlock_exclusive() },
		}
		self.core.release_pin(&self.block);
	}
}
