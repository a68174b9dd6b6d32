//! The frame pool: page-aligned chunks of frames and the descriptors that go
//! with them.

use std::{
	alloc::{alloc_zeroed, dealloc, Layout},
	fmt, iter,
	ops::Deref,
	ptr::NonNull,
	slice,
	sync::{
		atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
		Arc,
	},
};

use log::debug;
use parking_lot::{lock_api::RawRwLock as _, Mutex, RawRwLock, RwLock};
use static_assertions::assert_impl_all;

use super::CacheError;
use crate::{
	consts::MAX_FRAME_ALIGNMENT,
	page::{IoFix, LogPos, PageId, PageState},
	storage::FrameAddress,
};

/// Stable index of a descriptor within one pool instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct FrameId(pub u32);

impl FrameId {
	#[inline]
	pub fn index(self) -> usize {
		self.0 as usize
	}

	#[inline]
	#[allow(clippy::cast_possible_truncation)]
	pub fn from_index(index: usize) -> Self {
		Self(index as u32)
	}
}

impl fmt::Display for FrameId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// Descriptor fields that are changed together under the descriptor mutex.
#[derive(Debug)]
pub(crate) struct DescriptorMeta {
	pub id: Option<PageId>,
	state: PageState,
	pub io_fix: IoFix,
	pub oldest_modification: Option<LogPos>,
	pub newest_modification: Option<LogPos>,
	/// Pins held on behalf of watchers, included in the pin count.
	pub watch_pins: u32,
	/// The sentinel this page replaced, kept until its watchers are gone.
	pub watch_sentinel: Option<usize>,
}

impl DescriptorMeta {
	fn new() -> Self {
		Self {
			id: None,
			state: PageState::NotUsed,
			io_fix: IoFix::None,
			oldest_modification: None,
			newest_modification: None,
			watch_pins: 0,
			watch_sentinel: None,
		}
	}

	#[inline]
	pub fn state(&self) -> PageState {
		self.state
	}

	pub fn set_state(&mut self, next: PageState) {
		debug_assert!(
			self.state.can_become(next),
			"Illegal descriptor transition {:?} -> {next:?}",
			self.state
		);
		self.state = next;
	}

	#[inline]
	pub fn is_dirty(&self) -> bool {
		self.oldest_modification.is_some()
	}

	/// Forgets the page this descriptor held.
	pub fn clear_page(&mut self) {
		self.id = None;
		self.io_fix = IoFix::None;
		self.oldest_modification = None;
		self.newest_modification = None;
		self.watch_pins = 0;
		self.watch_sentinel = None;
	}
}

pub(crate) struct Descriptor {
	pub meta: Mutex<DescriptorMeta>,
	pin_count: AtomicU32,
	old: AtomicBool,
	/// Milliseconds since the pool epoch of the first access, plus one; zero
	/// if the page has not been accessed since it was loaded.
	access_time: AtomicU64,
	/// Latch on the frame content.
	pub latch: RawRwLock,
}

impl Descriptor {
	fn new() -> Self {
		Self {
			meta: Mutex::new(DescriptorMeta::new()),
			pin_count: AtomicU32::new(0),
			old: AtomicBool::new(false),
			access_time: AtomicU64::new(0),
			latch: RawRwLock::INIT,
		}
	}

	/// Pins must only be added while the hash partition of the page is
	/// locked, or while the descriptor is otherwise unreachable.
	#[inline]
	pub fn pin(&self) {
		self.pin_by(1);
	}

	#[inline]
	pub fn pin_by(&self, n: u32) {
		self.pin_count.fetch_add(n, Ordering::AcqRel);
	}

	/// Returns the remaining pin count.
	#[inline]
	pub fn unpin_by(&self, n: u32) -> u32 {
		let prev = self.pin_count.fetch_sub(n, Ordering::AcqRel);
		debug_assert!(prev >= n, "Unpinned a descriptor that was not pinned");
		prev - n
	}

	#[inline]
	pub fn pin_count(&self) -> u32 {
		self.pin_count.load(Ordering::Acquire)
	}

	#[inline]
	pub fn is_old(&self) -> bool {
		self.old.load(Ordering::Relaxed)
	}

	/// Only the LRU list changes this flag.
	#[inline]
	pub fn set_old(&self, old: bool) {
		self.old.store(old, Ordering::Relaxed);
	}

	#[inline]
	pub fn access_time(&self) -> u64 {
		self.access_time.load(Ordering::Relaxed)
	}

	#[inline]
	pub fn set_access_time(&self, time: u64) {
		self.access_time.store(time, Ordering::Relaxed);
	}

	/// Records the first access; returns false if one was already recorded.
	#[inline]
	pub fn record_first_access(&self, time: u64) -> bool {
		self.access_time
			.compare_exchange(0, time, Ordering::Relaxed, Ordering::Relaxed)
			.is_ok()
	}
}

/// A page-aligned, zeroed allocation holding the frames of one chunk.
struct FrameBuffer {
	ptr: NonNull<u8>,
	layout: Layout,
}

// Safety: the buffer is only ever accessed through `Block`, which requires the
// caller to hold the frame latch or to own the descriptor exclusively.
unsafe impl Send for FrameBuffer {}

// Safety: see above.
unsafe impl Sync for FrameBuffer {}

impl FrameBuffer {
	fn allocate(size: usize, align: usize) -> Result<Self, CacheError> {
		let layout =
			Layout::from_size_align(size, align).map_err(|_| CacheError::OutOfMemory(size))?;
		if layout.size() == 0 {
			return Err(CacheError::OutOfMemory(size));
		}
		// Safety: the layout is not zero-sized.
		let ptr = unsafe { alloc_zeroed(layout) };
		let ptr = NonNull::new(ptr).ok_or(CacheError::OutOfMemory(size))?;
		Ok(Self { ptr, layout })
	}
}

impl Drop for FrameBuffer {
	fn drop(&mut self) {
		// Safety: `ptr` was allocated with exactly this layout.
		unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
	}
}

/// A contiguous run of frames with their descriptors; the unit of growth and
/// shrinking.
pub(crate) struct Chunk {
	first: FrameId,
	page_size: usize,
	frames: FrameBuffer,
	descriptors: Box<[Descriptor]>,
}

assert_impl_all!(Chunk: Send, Sync);

impl Chunk {
	pub fn allocate(first: FrameId, num_frames: usize, page_size: usize) -> Result<Self, CacheError> {
		let size = num_frames
			.checked_mul(page_size)
			.ok_or(CacheError::OutOfMemory(usize::MAX))?;
		let frames = FrameBuffer::allocate(size, page_size.min(MAX_FRAME_ALIGNMENT))?;
		let descriptors = iter::repeat_with(Descriptor::new)
			.take(num_frames)
			.collect();
		debug!("Allocated chunk of {num_frames} frames starting at {first}");
		Ok(Self {
			first,
			page_size,
			frames,
			descriptors,
		})
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.descriptors.len()
	}

	#[inline]
	pub fn first(&self) -> FrameId {
		self.first
	}

	pub fn frame_ids(&self) -> impl Iterator<Item = FrameId> {
		let start = self.first.index();
		(start..start + self.len()).map(FrameId::from_index)
	}

	#[inline]
	pub fn size_bytes(&self) -> usize {
		self.frames.layout.size()
	}
}

impl Drop for Chunk {
	fn drop(&mut self) {
		debug!(
			"Deallocated chunk of {} frames starting at {}",
			self.len(),
			self.first
		);
	}
}

/// A handle on one descriptor and its frame. Holding a block keeps the chunk
/// memory alive, even after the chunk was withdrawn.
#[derive(Clone)]
pub(crate) struct Block {
	chunk: Arc<Chunk>,
	slot: usize,
}

impl Block {
	#[inline]
	pub fn id(&self) -> FrameId {
		FrameId::from_index(self.chunk.first.index() + self.slot)
	}

	#[inline]
	fn frame_ptr(&self) -> *mut u8 {
		// Safety: `slot` is within the chunk, so the offset stays inside the
		// allocation.
		unsafe { self.chunk.frames.ptr.as_ptr().add(self.slot * self.chunk.page_size) }
	}

	#[inline]
	pub fn frame_address(&self) -> FrameAddress {
		FrameAddress(self.frame_ptr() as usize)
	}

	/// # Safety
	/// The caller must hold the frame latch in shared or exclusive mode, or
	/// otherwise guarantee that nobody writes to the frame.
	pub unsafe fn frame(&self) -> &[u8] {
		slice::from_raw_parts(self.frame_ptr(), self.chunk.page_size)
	}

	/// # Safety
	/// The caller must hold the frame latch exclusively, or own the
	/// descriptor while it is unreachable from the hash index.
	#[allow(clippy::mut_from_ref)]
	pub unsafe fn frame_mut(&self) -> &mut [u8] {
		slice::from_raw_parts_mut(self.frame_ptr(), self.chunk.page_size)
	}

	/// Overwrites the frame of a descriptor that holds no page.
	#[cfg(debug_assertions)]
	pub fn poison(&self) {
		// Safety: only called on descriptors that are unreachable and
		// unpinned.
		unsafe { self.frame_mut() }.fill(0xa5);
	}

	#[cfg(not(debug_assertions))]
	#[inline]
	pub fn poison(&self) {}
}

impl Deref for Block {
	type Target = Descriptor;

	#[inline]
	fn deref(&self) -> &Descriptor {
		&self.chunk.descriptors[self.slot]
	}
}

/// The chunks of one pool instance, indexed by frame id.
///
/// The table lock is only ever held for the duration of a lookup or an
/// update and never while acquiring another lock.
pub(crate) struct ChunkTable {
	chunks: RwLock<Vec<Arc<Chunk>>>,
	frames_per_chunk: usize,
	page_size: usize,
}

impl ChunkTable {
	pub fn new(frames_per_chunk: usize, page_size: usize) -> Self {
		Self {
			chunks: RwLock::new(Vec::new()),
			frames_per_chunk,
			page_size,
		}
	}

	#[inline]
	pub fn frames_per_chunk(&self) -> usize {
		self.frames_per_chunk
	}

	pub fn num_chunks(&self) -> usize {
		self.chunks.read().len()
	}

	pub fn num_frames(&self) -> usize {
		self.num_chunks() * self.frames_per_chunk
	}

	/// Allocates the chunk that would follow the `index`-th chunk.
	pub fn allocate_chunk(&self, index: usize) -> Result<Chunk, CacheError> {
		Chunk::allocate(
			FrameId::from_index(index * self.frames_per_chunk),
			self.frames_per_chunk,
			self.page_size,
		)
	}

	pub fn push(&self, chunk: Chunk) -> Arc<Chunk> {
		let mut chunks = self.chunks.write();
		debug_assert_eq!(
			chunk.first().index(),
			chunks.len() * self.frames_per_chunk
		);
		let chunk = Arc::new(chunk);
		chunks.push(Arc::clone(&chunk));
		chunk
	}

	/// Removes all chunks from `num_chunks` onwards and returns them.
	pub fn truncate(&self, num_chunks: usize) -> Vec<Arc<Chunk>> {
		let mut chunks = self.chunks.write();
		if num_chunks >= chunks.len() {
			return Vec::new();
		}
		chunks.split_off(num_chunks)
	}

	pub fn chunk(&self, index: usize) -> Option<Arc<Chunk>> {
		self.chunks.read().get(index).cloned()
	}

	pub fn try_block(&self, fid: FrameId) -> Option<Block> {
		let chunk_index = fid.index() / self.frames_per_chunk;
		let chunk = self.chunk(chunk_index)?;
		Some(Block {
			chunk,
			slot: fid.index() % self.frames_per_chunk,
		})
	}

	pub fn block(&self, fid: FrameId) -> Block {
		self.try_block(fid)
			.expect("Frame id refers to a chunk that is not part of the pool")
	}
}
