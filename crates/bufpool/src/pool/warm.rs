use std::{
	ffi::OsString,
	fs::{self, File},
	io::{self, BufRead, BufReader, BufWriter, Write},
	path::{Path, PathBuf},
};

use log::{info, warn};

use super::{BufferPool, CacheError};
use crate::{page::PageId, storage::PageStorageApi};

/// What [`BufferPool::load_warm_cache`] made of a dump file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmLoadReport {
	/// Distinct well-formed page ids in the file.
	pub listed: usize,
	pub malformed: usize,
	/// Pages of tablespaces that do not exist anymore.
	pub unknown_space: usize,
	/// Pages queued for read-ahead.
	pub prefetched: usize,
}

fn parse_line(line: &str) -> Option<PageId> {
	let (space_id, page_no) = line.split_once(',')?;
	Some(PageId::new(
		space_id.trim().parse().ok()?,
		page_no.trim().parse().ok()?,
	))
}

fn temp_path(path: &Path) -> PathBuf {
	let mut temp = OsString::from(path.as_os_str());
	temp.push(".tmp");
	PathBuf::from(temp)
}

fn write_ids(path: &Path, ids: &[PageId]) -> io::Result<()> {
	let temp = temp_path(path);
	let mut writer = BufWriter::new(File::create(&temp)?);
	for id in ids {
		writeln!(writer, "{},{}", id.space_id, id.page_no)?;
	}
	writer
		.into_inner()
		.map_err(io::IntoInnerError::into_error)?
		.sync_all()?;
	fs::rename(&temp, path)
}

impl<S: PageStorageApi + Send + Sync + 'static> BufferPool<S> {
	/// Writes the ids of all cached pages to `path`, one `space,page` pair per
	/// line, most recently used first within each instance. An existing file
	/// is only replaced once the new one is complete.
	///
	/// Returns the number of ids written.
	pub fn dump_warm_cache(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
		let path = path.as_ref();
		let ids: Vec<PageId> = self
			.instances
			.iter()
			.flat_map(|instance| instance.core.cached_pages())
			.collect();
		write_ids(path, &ids).map_err(CacheError::WarmCache)?;
		info!("Dumped {} page ids to {}", ids.len(), path.display());
		Ok(ids.len())
	}

	/// Reads a file written by [`dump_warm_cache`] and prefetches the pages it
	/// lists, in page id order, up to the capacity of the pool.
	///
	/// [`dump_warm_cache`]: BufferPool::dump_warm_cache
	pub fn load_warm_cache(&self, path: impl AsRef<Path>) -> Result<WarmLoadReport, CacheError> {
		let path = path.as_ref();
		let file = File::open(path).map_err(CacheError::WarmCache)?;
		let mut report = WarmLoadReport::default();

		let mut ids = Vec::new();
		for (line_no, line) in BufReader::new(file).lines().enumerate() {
			let line = line.map_err(CacheError::WarmCache)?;
			if line.trim().is_empty() {
				continue;
			}
			match parse_line(&line) {
				Some(id) => ids.push(id),
				None => {
					warn!("Skipping malformed line {} of {}: {line:?}", line_no + 1, path.display());
					report.malformed += 1;
				}
			}
		}
		ids.sort_unstable();
		ids.dedup();
		report.listed = ids.len();

		let capacity = self.size() / self.config.page_size;
		for id in ids {
			if report.prefetched == capacity {
				break;
			}
			if !self.storage.space_exists(id.space_id) {
				report.unknown_space += 1;
				continue;
			}
			self.prefetch(id);
			report.prefetched += 1;
		}

		if report.unknown_space > 0 {
			warn!(
				"Skipped {} pages of missing tablespaces in {}",
				report.unknown_space,
				path.display()
			);
		}
		info!(
			"Prefetching {} of {} pages listed in {}",
			report.prefetched,
			report.listed,
			path.display()
		);
		Ok(report)
	}
}
