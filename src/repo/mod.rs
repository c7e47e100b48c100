pub mod lock;
pub mod selector;
pub mod snapshot;

use std::{
	fs, io,
	os::unix::fs::symlink,
	path::PathBuf,
};

use log::{debug, info, warn};

use self::lock::RootLock;
use self::selector::{SourceKind, SourceSnapshot};
use self::snapshot::{Snapshot, SnapshotName, SnapshotState};

/// A directory of dated snapshots of one source tree, plus an optional `LATEST` symlink naming the
/// newest complete one
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotRoot(pub PathBuf);

impl SnapshotRoot {
	pub const LATEST: &'static str = "LATEST";

	pub fn is_valid(&self) -> bool {
		self.0.is_dir()
	}

	pub fn snapshot(&self, name: &SnapshotName) -> Snapshot {
		Snapshot(self.0.join(name))
	}

	pub fn state(&self, name: &SnapshotName, assume_complete: bool) -> io::Result<SnapshotState> {
		self.snapshot(name).state(assume_complete)
	}

	/// Directories and symlinks with snapshot names, oldest first. Everything else is ignored.
	pub fn list(&self) -> io::Result<Vec<SourceSnapshot>> {
		let mut result = Vec::new();
		for dentry in self.0.read_dir()? {
			let dentry = dentry?;
			let Some(name) = dentry.file_name().to_str().and_then(|s| s.parse().ok()) else {
				continue;
			};

			let file_type = dentry.file_type()?;
			let kind = if file_type.is_symlink() {
				SourceKind::Alias(fs::read_link(dentry.path())?.to_string_lossy().into_owned())
			} else if file_type.is_dir() {
				SourceKind::Directory
			} else {
				debug!("ignoring non-directory {:?}", dentry.path());
				continue;
			};

			result.push(SourceSnapshot { name, kind });
		}
		result.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(result)
	}

	/// Names a pull may consider done, oldest first. A root that doesn't exist yet has none.
	pub fn done_names(&self, assume_complete: bool) -> io::Result<Vec<SnapshotName>> {
		let entries = match self.list() {
			Ok(entries) => entries,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(e),
		};
		let mut result = Vec::new();
		for entry in entries {
			if self.state(&entry.name, assume_complete)?.is_done() {
				result.push(entry.name);
			}
		}
		Ok(result)
	}

	/// The snapshot named by the `LATEST` symlink, if there is one and it names a snapshot
	pub fn latest(&self) -> io::Result<Option<SnapshotName>> {
		let link = self.0.join(Self::LATEST);
		let target = match fs::read_link(&link) {
			Ok(target) => target,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
			Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
				warn!("{link:?} is not a symlink, ignoring it");
				return Ok(None);
			}
			Err(e) => return Err(e),
		};

		match target.file_name().and_then(|n| n.to_str()).map(str::parse) {
			Some(Ok(name)) => Ok(Some(name)),
			_ => {
				warn!("{link:?} points at {target:?}, which is not a snapshot name, ignoring it");
				Ok(None)
			}
		}
	}

	/// Repoints `LATEST` at `name` by renaming a fresh symlink over it, so readers never see it
	/// missing or half-written
	pub fn set_latest(&self, name: &SnapshotName) -> io::Result<()> {
		let tmp = self.0.join(format!(".{}.{}", Self::LATEST, std::process::id()));
		match fs::remove_file(&tmp) {
			Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
			_ => (),
		}
		symlink(name, &tmp)?;
		fs::rename(&tmp, self.0.join(Self::LATEST))?;
		info!("{:?}: {} -> {name}", self.0, Self::LATEST);
		Ok(())
	}

	/// Moves `LATEST` to `name` unless it already names something newer, or is something other
	/// than a symlink. Returns whether it moved.
	pub fn advance_latest(&self, name: &SnapshotName) -> io::Result<bool> {
		let link = self.0.join(Self::LATEST);
		match link.symlink_metadata() {
			Ok(meta) if !meta.file_type().is_symlink() => {
				warn!("{link:?} is not a symlink, leaving it alone");
				return Ok(false);
			}
			Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
			_ => (),
		}
		match self.latest()? {
			Some(current) if current >= *name => Ok(false),
			_ => self.set_latest(name).map(|()| true),
		}
	}

	pub fn lock(&self) -> anyhow::Result<RootLock> {
		RootLock::acquire(&self.0)
	}
}

#[cfg(test)]
mod test {
	use std::path::Path;

	use assert_fs::prelude::*;

	use super::*;

	fn name(s: &str) -> SnapshotName {
		s.parse().unwrap()
	}

	#[test]
	fn list_ignores_non_snapshots() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("2024-01-02").create_dir_all().unwrap();
		temp.child("2024-01-01").create_dir_all().unwrap();
		temp.child("notes").create_dir_all().unwrap();
		temp.child("2024-01-04").write_str("a file").unwrap();
		symlink("2024-01-02", temp.child("2024-01-03").path()).unwrap();
		symlink("2024-01-02", temp.child(SnapshotRoot::LATEST).path()).unwrap();

		let listed = SnapshotRoot(temp.path().to_owned()).list().unwrap();

		assert_eq!(
			listed,
			vec![
				SourceSnapshot {
					name: name("2024-01-01"),
					kind: SourceKind::Directory
				},
				SourceSnapshot {
					name: name("2024-01-02"),
					kind: SourceKind::Directory
				},
				SourceSnapshot {
					name: name("2024-01-03"),
					kind: SourceKind::Alias("2024-01-02".into())
				},
			]
		);
	}

	#[test]
	fn done_names_need_the_marker() {
		let temp = assert_fs::TempDir::new().unwrap();
		let root = SnapshotRoot(temp.path().to_owned());
		temp.child("2024-01-01").create_dir_all().unwrap();
		temp.child("2024-01-02").create_dir_all().unwrap();
		root.snapshot(&name("2024-01-01")).mark_complete().unwrap();

		assert_eq!(root.done_names(false).unwrap(), vec![name("2024-01-01")]);
		assert_eq!(
			root.done_names(true).unwrap(),
			vec![name("2024-01-01"), name("2024-01-02")]
		);
	}

	#[test]
	fn latest_only_moves_forward() {
		let temp = assert_fs::TempDir::new().unwrap();
		let root = SnapshotRoot(temp.path().to_owned());
		assert_eq!(root.latest().unwrap(), None);

		assert!(root.advance_latest(&name("2024-01-02")).unwrap());
		assert!(!root.advance_latest(&name("2024-01-01")).unwrap());
		assert_eq!(root.latest().unwrap(), Some(name("2024-01-02")));
		assert_eq!(
			fs::read_link(temp.child(SnapshotRoot::LATEST).path()).unwrap(),
			Path::new("2024-01-02")
		);

		assert!(root.advance_latest(&name("2024-01-03")).unwrap());
		assert_eq!(root.latest().unwrap(), Some(name("2024-01-03")));
	}

	#[test]
	fn latest_with_foreign_target_is_ignored() {
		let temp = assert_fs::TempDir::new().unwrap();
		symlink("elsewhere", temp.child(SnapshotRoot::LATEST).path()).unwrap();

		assert_eq!(SnapshotRoot(temp.path().to_owned()).latest().unwrap(), None);
	}

	#[test]
	fn latest_directory_is_left_alone() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("LATEST/keep").write_str("K").unwrap();
		let root = SnapshotRoot(temp.path().to_owned());

		assert!(!root.advance_latest(&name("2024-01-01")).unwrap());
		assert!(temp.child(SnapshotRoot::LATEST).path().is_dir());
		temp.child("LATEST/keep").assert("K");
	}
}
