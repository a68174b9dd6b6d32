use std::{
	collections::HashMap,
	fs::{self, File, OpenOptions},
	io,
	mem,
	os::unix::fs::FileExt,
	path::{Path, PathBuf},
	sync::Arc,
};

use parking_lot::RwLock;
use static_assertions::assert_impl_all;

use super::{PageStorageApi, StorageError};
use crate::page::PageId;

/// Stores every tablespace as one flat file of pages in a directory.
pub struct FileStorage {
	dir: PathBuf,
	page_size: usize,
	descriptors: RwLock<HashMap<u32, Arc<File>>>,
}

assert_impl_all!(FileStorage: Send, Sync);

impl FileStorage {
	pub fn open(dir: impl AsRef<Path>, page_size: usize) -> Result<Self, StorageError> {
		let dir = dir.as_ref().to_path_buf();
		fs::create_dir_all(&dir)?;
		Ok(Self {
			dir,
			page_size,
			descriptors: RwLock::new(HashMap::new()),
		})
	}

	/// Creates an empty tablespace file, or does nothing if it already exists.
	pub fn create_space(&self, space_id: u32) -> Result<(), StorageError> {
		let file = OpenOptions::new()
			.create(true)
			.truncate(false)
			.read(true)
			.write(true)
			.open(self.space_path(space_id))?;
		self.descriptors.write().insert(space_id, Arc::new(file));
		Ok(())
	}

	#[inline]
	pub fn page_size(&self) -> usize {
		self.page_size
	}

	fn space_path(&self, space_id: u32) -> PathBuf {
		self.dir.join(format!("space_{space_id}.pages"))
	}

	fn use_space(&self, space_id: u32) -> Result<Arc<File>, StorageError> {
		let descriptors = self.descriptors.read();
		if let Some(file) = descriptors.get(&space_id) {
			return Ok(Arc::clone(file));
		}
		mem::drop(descriptors);

		let file = match OpenOptions::new()
			.read(true)
			.write(true)
			.open(self.space_path(space_id))
		{
			Ok(file) => file,
			Err(err) if err.kind() == io::ErrorKind::NotFound => {
				return Err(StorageError::UnknownSpace(space_id))
			}
			Err(err) => return Err(err.into()),
		};
		let mut descriptors = self.descriptors.write();
		let file = descriptors
			.entry(space_id)
			.or_insert_with(|| Arc::new(file));
		Ok(Arc::clone(file))
	}

	fn page_offset(&self, id: PageId) -> u64 {
		u64::from(id.page_no) * self.page_size as u64
	}
}

impl PageStorageApi for FileStorage {
	fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<(), StorageError> {
		let file = self.use_space(id.space_id)?;
		match file.read_exact_at(buf, self.page_offset(id)) {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
				Err(StorageError::ShortRead(id))
			}
			Err(err) => Err(err.into()),
		}
	}

	fn write_page(&self, id: PageId, buf: &[u8]) -> Result<(), StorageError> {
		let file = self.use_space(id.space_id)?;
		file.write_all_at(buf, self.page_offset(id))?;
		Ok(())
	}

	fn space_exists(&self, space_id: u32) -> bool {
		self.descriptors.read().contains_key(&space_id) || self.space_path(space_id).is_file()
	}
}

#[cfg(test)]
mod tests {
	use tempfile::tempdir;

	use crate::utils::test_helpers::page_id;

	use super::*;

	#[test]
	fn write_and_read_page() {
		// given
		let dir = tempdir().unwrap();
		let storage = FileStorage::open(dir.path(), 64).unwrap();
		storage.create_space(3).unwrap();

		// when
		storage.write_page(page_id!(3, 2), &[42; 64]).unwrap();
		let mut buf = [0; 64];
		storage.read_page(page_id!(3, 2), &mut buf).unwrap();

		// then
		assert_eq!(buf, [42; 64]);
	}

	#[test]
	fn read_beyond_end_of_space() {
		// given
		let dir = tempdir().unwrap();
		let storage = FileStorage::open(dir.path(), 64).unwrap();
		storage.create_space(3).unwrap();

		// when
		let mut buf = [0; 64];
		let result = storage.read_page(page_id!(3, 9), &mut buf);

		// then
		assert!(matches!(result, Err(StorageError::ShortRead(id)) if id == page_id!(3, 9)));
	}

	#[test]
	fn unknown_space() {
		// given
		let dir = tempdir().unwrap();
		let storage = FileStorage::open(dir.path(), 64).unwrap();

		// when
		let mut buf = [0; 64];
		let result = storage.read_page(page_id!(8, 0), &mut buf);

		// then
		assert!(matches!(result, Err(StorageError::UnknownSpace(8))));
		assert!(!storage.space_exists(8));
	}

	#[test]
	fn reopened_storage_sees_existing_spaces() {
		// given
		let dir = tempdir().unwrap();
		FileStorage::open(dir.path(), 64)
			.unwrap()
			.create_space(5)
			.unwrap();

		// when
		let storage = FileStorage::open(dir.path(), 64).unwrap();

		// then
		assert!(storage.space_exists(5));
	}
}
