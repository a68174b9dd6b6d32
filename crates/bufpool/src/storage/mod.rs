use std::io;

use crc::Crc;
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[cfg(test)]
use mockall::automock;

use crate::page::{LogPos, PageId};

pub(crate) mod file;

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("Tablespace {0} does not exist")]
	UnknownSpace(u32),

	#[error("Page {0} lies beyond the end of its tablespace")]
	ShortRead(PageId),

	#[error(transparent)]
	Io(io::Error),
}

impl From<io::Error> for StorageError {
	fn from(value: io::Error) -> Self {
		Self::Io(value)
	}
}

/// The storage layer the pool reads pages from and writes pages to.
///
/// Calls are blocking; the pool decides on which thread they run and reports
/// their outcome to its own completion handlers.
#[cfg_attr(test, automock)]
pub trait PageStorageApi {
	fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<(), StorageError>;

	fn write_page(&self, id: PageId, buf: &[u8]) -> Result<(), StorageError>;

	fn space_exists(&self, space_id: u32) -> bool;
}

/// The part of the write-ahead log the pool depends on.
#[cfg_attr(test, automock)]
pub trait WalApi {
	/// Everything logged strictly before this position is durable. A dirty
	/// page may only be written once its newest modification is durable.
	fn oldest_unflushed_log_position(&self) -> LogPos;
}

/// A log that has nothing outstanding; every modification counts as durable.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnloggedWal;

impl WalApi for UnloggedWal {
	fn oldest_unflushed_log_position(&self) -> LogPos {
		LogPos::MAX
	}
}

/// Address of a frame in memory, for auxiliary caches keyed off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameAddress(pub usize);

#[cfg_attr(test, automock)]
pub trait EvictionHookApi {
	/// Called after a page has been unlinked from the pool, but before its
	/// frame is reused or withdrawn.
	fn before_evict(&self, id: PageId, frame: FrameAddress);
}

#[cfg_attr(test, automock)]
pub trait PageVerifier {
	fn verify(&self, id: PageId, page: &[u8]) -> bool;
}

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

#[derive(Debug, Immutable, KnownLayout, FromBytes, IntoBytes)]
#[repr(C, packed)]
struct PageTrailer {
	checksum: u32,
}

const TRAILER_SIZE: usize = std::mem::size_of::<PageTrailer>();

/// Verifies a CRC-32 stored in the last four bytes of a page. Pages that are
/// entirely zero have never been written and are accepted as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32Verifier;

impl Crc32Verifier {
	/// Stores the checksum of `page` in its trailer. Returns false if the
	/// page is too short to carry one.
	pub fn seal(page: &mut [u8]) -> bool {
		let Some(split) = page.len().checked_sub(TRAILER_SIZE) else {
			return false;
		};
		let trailer = PageTrailer {
			checksum: CRC32.checksum(&page[..split]),
		};
		trailer.write_to(&mut page[split..]).is_ok()
	}
}

impl PageVerifier for Crc32Verifier {
	fn verify(&self, _id: PageId, page: &[u8]) -> bool {
		if page.len() < TRAILER_SIZE {
			return false;
		}
		if page.iter().all(|b| *b == 0) {
			return true;
		}
		let split = page.len() - TRAILER_SIZE;
		let Ok(trailer) = PageTrailer::read_from_bytes(&page[split..]) else {
			return false;
		};
		let stored = trailer.checksum;
		stored == CRC32.checksum(&page[..split])
	}
}

#[cfg(test)]
mod tests {
	use crate::utils::test_helpers::page_id;

	use super::*;

	#[test]
	fn sealed_page_verifies() {
		// given
		let mut page = [7u8; 256];
		assert!(Crc32Verifier::seal(&mut page));

		// then
		assert!(Crc32Verifier.verify(page_id!(1, 2), &page));
	}

	#[test]
	fn corrupted_page_fails_verification() {
		// given
		let mut page = [7u8; 256];
		Crc32Verifier::seal(&mut page);

		// when
		page[10] = 8;

		// then
		assert!(!Crc32Verifier.verify(page_id!(1, 2), &page));
	}

	#[test]
	fn zero_page_verifies() {
		assert!(Crc32Verifier.verify(page_id!(1, 2), &[0; 256]));
	}

	#[test]
	fn page_shorter_than_the_trailer_is_not_sealed() {
		// given
		let mut page = [7u8; 3];

		// when
		let sealed = Crc32Verifier::seal(&mut page);

		// then
		assert!(!sealed);
		assert_eq!(page, [7u8; 3]);
		assert!(!Crc32Verifier.verify(page_id!(1, 2), &page));
	}
}
