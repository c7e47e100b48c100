use std::{
	fmt,
	fs::{self, OpenOptions},
	io::{self, Write},
	path::{Path, PathBuf},
	str::FromStr,
};

use anyhow::bail;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

/// A snapshot `NAME` is complete once `.NAME.complete` exists next to it. Kept outside the
/// snapshot so the snapshot stays an exact mirror of its source.
pub const MARKER_SUFFIX: &str = ".complete";

static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}(-[0-9]{2}:[0-9]{2}:[0-9]{2})?$")
		.expect("snapshot name pattern should compile")
});

/// A snapshot directory name, `YYYY-MM-DD[-HH:MM:SS]`. Lexicographic order is chronological
/// order, so the derived `Ord` is all we need.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotName(String);

impl SnapshotName {
	pub fn is_valid(name: &str) -> bool {
		NAME_PATTERN.is_match(name)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl FromStr for SnapshotName {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if !Self::is_valid(s) {
			bail!("{s:?} is not a YYYY-MM-DD[-HH:MM:SS] snapshot name");
		}
		Ok(SnapshotName(s.to_owned()))
	}
}

impl fmt::Display for SnapshotName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl AsRef<Path> for SnapshotName {
	fn as_ref(&self) -> &Path {
		Path::new(&self.0)
	}
}

/// How far along a snapshot at some name in a root is
#[derive(Debug, PartialEq, Eq)]
pub enum SnapshotState {
	Absent,
	/// A directory without the completion marker: a failed or interrupted run
	Incomplete,
	Complete,
	/// A symlink to a sibling snapshot, the usual way of recording an unchanged day
	Alias(PathBuf),
	/// Something that is neither a directory nor a symlink
	Foreign,
}

impl SnapshotState {
	/// Whether a pull can consider this name done
	pub fn is_done(&self) -> bool {
		matches!(self, SnapshotState::Complete | SnapshotState::Alias(_))
	}
}

#[derive(Debug)]
pub struct Snapshot(pub PathBuf);

impl Snapshot {
	pub fn state(&self, assume_complete: bool) -> io::Result<SnapshotState> {
		let md = match self.0.symlink_metadata() {
			Ok(md) => md,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(SnapshotState::Absent),
			Err(e) => return Err(e),
		};

		Ok(if md.file_type().is_symlink() {
			SnapshotState::Alias(fs::read_link(&self.0)?)
		} else if !md.is_dir() {
			SnapshotState::Foreign
		} else if assume_complete || self.marker_path().exists() {
			SnapshotState::Complete
		} else {
			SnapshotState::Incomplete
		})
	}

	fn marker_path(&self) -> PathBuf {
		let mut name = std::ffi::OsString::from(".");
		name.push(self.0.file_name().unwrap_or_default());
		name.push(MARKER_SUFFIX);
		self.0.with_file_name(name)
	}

	/// Records that the transfer into this snapshot finished successfully
	pub fn mark_complete(&self) -> io::Result<()> {
		let path = self.marker_path();
		debug!("writing completion marker {path:?}");
		let mut file = OpenOptions::new()
			.create(true)
			.write(true)
			.truncate(true)
			.open(path)?;
		writeln!(file, "{}", chrono::Local::now().to_rfc3339())?;
		file.sync_all()
	}

	/// Drops a marker left behind by a snapshot that has since been removed
	pub fn clear_marker(&self) -> io::Result<()> {
		match fs::remove_file(self.marker_path()) {
			Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
			_ => Ok(()),
		}
	}
}
