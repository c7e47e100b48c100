use std::{os::unix::prelude::MetadataExt, path::Path};

/// Identity of an inode. Two paths with equal keys are hard links to the same file (or the same
/// directory reached twice).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FileKey {
	pub dev: u64,
	pub ino: u64,
}

impl FileKey {
	/// Does not follow symlinks
	pub fn from_path(path: &Path) -> std::io::Result<FileKey> {
		std::fs::symlink_metadata(path).map(|md| FileKey {
			dev: md.dev(),
			ino: md.ino(),
		})
	}

	/// Follows symlinks, so a `LATEST` link and the snapshot it names compare equal
	pub fn resolved(path: &Path) -> std::io::Result<FileKey> {
		std::fs::metadata(path).map(|md| FileKey {
			dev: md.dev(),
			ino: md.ino(),
		})
	}
}
