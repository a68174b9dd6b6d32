pub const B: usize = 1;
pub const KIB: usize = 1024 * B;
pub const MIB: usize = 1024 * KIB;
pub const GIB: usize = 1024 * MIB;

#[cfg(test)]
pub(crate) mod test_helpers {
	macro_rules! page_id {
		($space:expr, $page:expr) => {
			$crate::page::PageId::new($space, $page)
		};
	}
	pub(crate) use page_id;

	macro_rules! log_pos {
		($pos:expr) => {
			$crate::page::LogPos($pos)
		};
	}
	pub(crate) use log_pos;
}
