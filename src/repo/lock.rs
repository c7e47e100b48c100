use std::{
	fs::{File, OpenOptions},
	io::{Seek, Write},
	os::fd::AsRawFd,
	path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use log::debug;
use nix::{
	errno::Errno,
	fcntl::{flock, FlockArg},
};

pub const NAME: &str = ".histbackup.lock";

/// Exclusive advisory `flock()` on a snapshot root, held until dropped. Only one writer may add
/// snapshots to a root at a time.
#[derive(Debug)]
pub struct RootLock {
	// closing the file releases the lock
	_file: File,
	path: PathBuf,
}

impl RootLock {
	/// Fails straight away instead of waiting if another process holds the lock
	pub fn acquire(root: &Path) -> anyhow::Result<RootLock> {
		let path = root.join(NAME);
		let mut file = OpenOptions::new()
			.create(true)
			.write(true)
			.open(&path)
			.with_context(|| format!("opening lock file {path:?}"))?;

		match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
			Ok(()) => (),
			Err(Errno::EWOULDBLOCK) => {
				bail!("{root:?} is locked by another histbackup run ({path:?})")
			}
			Err(e) => return Err(e).with_context(|| format!("locking {path:?}")),
		}

		debug!("locked {path:?}");

		// informational only, the flock is what matters
		file.set_len(0)?;
		file.rewind()?;
		writeln!(file, "{}", std::process::id())?;

		Ok(RootLock { _file: file, path })
	}
}

impl Drop for RootLock {
	fn drop(&mut self) {
		debug!("unlocking {:?}", self.path);
	}
}
