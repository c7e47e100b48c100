pub mod filekey;
pub mod linker;

use std::{
	io,
	path::{Path, PathBuf},
};

use nix::sys::stat::{lstat, Mode};

/// What a directory entry is, as far as snapshotting is concerned. Produced by a single `lstat()`
/// (plus a `readlink()` for symlinks), never following symlinks.
#[derive(Debug, PartialEq, Eq)]
pub enum EntryKind {
	Directory,
	RegularFile,
	/// Carries the link's target text verbatim
	Symlink(PathBuf),
	/// Devices, sockets, fifos and anything else we refuse to reproduce. Carries a short
	/// human-readable type name for warnings.
	Other(&'static str),
}

#[derive(Debug)]
pub struct Entry {
	pub kind: EntryKind,
	/// Permission bits, without the file type
	pub mode: Mode,
}

impl Entry {
	pub fn of(path: &Path) -> io::Result<Entry> {
		let st = lstat(path)?;

		// S_IFMT bit twiddling from https://man7.org/linux/man-pages/man7/inode.7.html
		let kind = match st.st_mode & libc::S_IFMT {
			libc::S_IFDIR => EntryKind::Directory,
			libc::S_IFREG => EntryKind::RegularFile,
			libc::S_IFLNK => EntryKind::Symlink(std::fs::read_link(path)?),
			libc::S_IFIFO => EntryKind::Other("fifo"),
			libc::S_IFSOCK => EntryKind::Other("socket"),
			libc::S_IFCHR => EntryKind::Other("character device"),
			libc::S_IFBLK => EntryKind::Other("block device"),
			_ => EntryKind::Other("unknown file type"),
		};

		Ok(Entry {
			kind,
			mode: Mode::from_bits_truncate(st.st_mode & !libc::S_IFMT),
		})
	}
}
