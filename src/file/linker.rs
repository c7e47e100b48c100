//! Mirrors a directory tree using hard links, the way `cp -al` would, but reporting and skipping
//! anything that isn't a directory, regular file or symlink.

use std::{
	fs, io,
	os::unix::fs::{symlink, PermissionsExt},
	path::Path,
};

use anyhow::{bail, Context};
use log::{debug, info, warn};
use nix::sys::stat::Mode;
use walkdir::WalkDir;

use super::{filekey::FileKey, Entry, EntryKind};
use crate::sync::Cancel;

#[derive(Clone, Debug)]
pub struct Linker {
	/// Fall back to a byte copy when `link()` fails, e.g. across filesystems
	pub copy: bool,
	/// Stops the walk when set. Whatever was linked so far stays.
	pub cancel: Cancel,
}

impl Default for Linker {
	fn default() -> Self {
		Linker {
			copy: true,
			cancel: Cancel::default(),
		}
	}
}

/// Per-kind tallies of one [Linker::link_tree] run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LinkReport {
	pub dirs: u64,
	pub linked: u64,
	pub copied: u64,
	pub symlinks: u64,
	/// Devices, sockets, fifos. Not failures.
	pub skipped: u64,
	pub failed: u64,
	/// The walk was cut short by [Linker::cancel]
	pub interrupted: bool,
}

impl LinkReport {
	pub fn is_clean(&self) -> bool {
		self.failed == 0 && !self.interrupted
	}
}

fn set_mode(path: &Path, mode: Mode) -> io::Result<()> {
	fs::set_permissions(path, fs::Permissions::from_mode(mode.bits()))
}

impl Linker {
	/// Creates `dest` as a mirror of `src`. `dest` must not exist.
	///
	/// Only problems with the two roots themselves are returned as errors. Anything going wrong
	/// for an individual entry is logged, counted in [LinkReport::failed], and the walk carries on.
	pub fn link_tree(&self, src: &Path, dest: &Path) -> anyhow::Result<LinkReport> {
		if !src.is_dir() {
			bail!("{src:?} is not a directory");
		}

		// symlink_metadata, so a dangling symlink in the way counts too
		if dest.symlink_metadata().is_ok() {
			bail!("{dest:?} already exists, refusing to merge into it");
		}

		let root_mode = Mode::from_bits_truncate(fs::metadata(src)?.permissions().mode());

		debug!("creating {dest:?}");
		fs::create_dir(dest).with_context(|| format!("creating {dest:?}"))?;
		let dest_key = FileKey::from_path(dest)?;

		let mut report = LinkReport::default();

		// Applied once the walk is done, deepest first, so read-only directories can still be
		// populated
		let mut dir_modes = vec![(dest.to_path_buf(), root_mode)];

		let mut walker = WalkDir::new(src)
			.min_depth(1)
			.sort_by_file_name()
			.into_iter()
			// dest may live inside src
			.filter_entry(|de| {
				!(de.file_type().is_dir()
					&& FileKey::from_path(de.path()).is_ok_and(|key| key == dest_key))
			});

		while let Some(entry) = walker.next() {
			if self.cancel.is_cancelled() {
				warn!("interrupted, leaving partial mirror {dest:?}");
				report.interrupted = true;
				break;
			}
			let entry = match entry {
				Ok(entry) => entry,
				Err(e) => {
					warn!("walking {src:?}: {e}");
					report.failed += 1;
					continue;
				}
			};

			let path = entry.path();
			let target = dest.join(path.strip_prefix(src)?);

			let meta = match Entry::of(path) {
				Ok(meta) => meta,
				Err(e) => {
					warn!("lstat {path:?}: {e}");
					report.failed += 1;
					continue;
				}
			};

			match meta.kind {
				EntryKind::Directory => match fs::create_dir(&target) {
					Ok(()) => {
						report.dirs += 1;
						dir_modes.push((target, meta.mode));
					}
					Err(e) => {
						warn!("mkdir {target:?}: {e}");
						report.failed += 1;
						walker.skip_current_dir();
					}
				},
				EntryKind::RegularFile => self.link_file(path, &target, meta.mode, &mut report),
				EntryKind::Symlink(text) => match symlink(&text, &target) {
					Ok(()) => report.symlinks += 1,
					Err(e) => {
						warn!("symlink {text:?} {target:?}: {e}");
						report.failed += 1;
					}
				},
				EntryKind::Other(kind) => {
					warn!("skipping {kind} {path:?}");
					report.skipped += 1;
				}
			}
		}

		for (dir, mode) in dir_modes.iter().rev() {
			if let Err(e) = set_mode(dir, *mode) {
				warn!("chmod {:o} {dir:?}: {e}", mode.bits());
			}
		}

		info!(
			"linked {src:?} to {dest:?}: {} dirs, {} links, {} copies, {} symlinks, {} skipped, {} \
			failed{}",
			report.dirs,
			report.linked,
			report.copied,
			report.symlinks,
			report.skipped,
			report.failed,
			if report.interrupted { ", interrupted" } else { "" }
		);

		Ok(report)
	}

	fn link_file(&self, src: &Path, target: &Path, mode: Mode, report: &mut LinkReport) {
		let link_err = match fs::hard_link(src, target) {
			Ok(()) => {
				report.linked += 1;
				return;
			}
			Err(e) => e,
		};

		if !self.copy {
			warn!("link {src:?} {target:?}: {link_err}");
			report.failed += 1;
			return;
		}

		debug!("link {src:?} failed ({link_err}), copying instead");
		match fs::copy(src, target) {
			Ok(_) => {
				report.copied += 1;
				if let Err(e) = set_mode(target, mode) {
					warn!("chmod {:o} {target:?}: {e}", mode.bits());
				}
			}
			Err(e) => {
				warn!("copy {src:?} {target:?}: {e}");
				report.failed += 1;
				match fs::remove_file(target) {
					Err(rm) if rm.kind() != io::ErrorKind::NotFound => {
						warn!("removing partial copy {target:?}: {rm}")
					}
					_ => (),
				}
			}
		}
	}
}
