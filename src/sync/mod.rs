//! Creating snapshots by delegating the file transfer to an external tool

pub mod orchestrator;
pub mod pool;
pub mod rsync;

use std::{
	ffi::OsString,
	fmt,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use log::warn;

use crate::util::ext::PathExt;

/// A local path, or `host:path` as understood by rsync and ssh
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
	Local(PathBuf),
	Remote { host: String, path: PathBuf },
}

impl Location {
	/// Remote if a `:` comes before the first `/`, like rsync decides
	pub fn parse(arg: &str) -> Location {
		match arg.split_once(':') {
			Some((host, path)) if !host.is_empty() && !host.contains('/') => Location::Remote {
				host: host.to_owned(),
				path: PathBuf::from(path),
			},
			_ => Location::Local(PathBuf::from(arg)),
		}
	}

	pub fn join<P: AsRef<Path>>(&self, rel: P) -> Location {
		match self {
			Location::Local(path) => Location::Local(path.join(rel)),
			Location::Remote { host, path } => Location::Remote {
				host: host.clone(),
				path: path.join(rel),
			},
		}
	}

	pub fn path(&self) -> &Path {
		match self {
			Location::Local(path) | Location::Remote { path, .. } => path,
		}
	}

	/// The form passed to rsync, with a trailing slash so a directory's contents get copied
	pub fn to_transfer_arg(&self) -> OsString {
		match self {
			Location::Local(path) => path.with_trailing_slash(),
			Location::Remote { host, path } => {
				let mut arg = OsString::from(format!("{host}:"));
				arg.push(path.with_trailing_slash());
				arg
			}
		}
	}
}

impl fmt::Display for Location {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Location::Local(path) => write!(f, "{}", path.display()),
			Location::Remote { host, path } => write!(f, "{host}:{}", path.display()),
		}
	}
}

/// Everything one transfer needs. The destination is a directory that already exists, empty or
/// partially populated by an earlier attempt.
#[derive(Debug)]
pub struct TransferRequest<'a> {
	pub source: &'a Location,
	pub dest: &'a Path,
	/// Complete snapshots to hard link unchanged files from, best first
	pub link_dests: &'a [PathBuf],
	pub includes: &'a [String],
	pub excludes: &'a [String],
}

/// The external collaborator doing the actual copying. Mirrors `source` into `dest` exactly
/// (deleting extraneous files), preserving permissions, times, symlinks and hard links, and
/// hard links files identical to the same path in one of `link_dests` instead of copying them.
pub trait Transfer: Sync {
	fn transfer(&self, req: &TransferRequest, cancel: &Cancel) -> anyhow::Result<()>;

	/// Human-readable rendition of what [Transfer::transfer] would run, for dry runs and tracing
	fn describe(&self, req: &TransferRequest) -> String;
}

/// Set once on SIGINT/SIGTERM. Running transfers are stopped and no new work is started.
#[derive(Clone, Debug, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
	/// Only call once per process
	pub fn install() -> anyhow::Result<Cancel> {
		let cancel = Cancel::default();
		let flag = cancel.clone();
		ctrlc::set_handler(move || {
			if !flag.is_cancelled() {
				warn!("interrupted, stopping after cleaning up the current transfer");
			}
			flag.cancel();
		})?;
		Ok(cancel)
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst)
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}


#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn location_parsing() {
		assert_eq!(
			Location::parse("/backups/home"),
			Location::Local(PathBuf::from("/backups/home"))
		);
		assert_eq!(
			Location::parse("./2024-01-01-10:00:00"),
			Location::Local(PathBuf::from("./2024-01-01-10:00:00"))
		);
		assert_eq!(
			Location::parse("backup@nas:/srv/home"),
			Location::Remote {
				host: "backup@nas".into(),
				path: PathBuf::from("/srv/home")
			}
		);
	}

	#[test]
	fn transfer_args() {
		let remote = Location::parse("nas:/srv/home").join("2024-01-01");
		assert_eq!(remote.to_transfer_arg(), "nas:/srv/home/2024-01-01/");
		assert_eq!(remote.to_string(), "nas:/srv/home/2024-01-01");

		let local = Location::parse("/data");
		assert_eq!(local.to_transfer_arg(), "/data/");
	}

	#[test]
	fn cancel_is_shared_between_clones() {
		let cancel = Cancel::default();
		let other = cancel.clone();
		assert!(!other.is_cancelled());
		cancel.cancel();
		assert!(other.is_cancelled());
	}
}
