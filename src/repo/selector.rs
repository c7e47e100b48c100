//! Decides which snapshots a pull has to create, and what each one may hard link against

use std::{collections::HashSet, io, path::PathBuf};

use log::{debug, info};

use super::{
	snapshot::{Snapshot, SnapshotName},
	SnapshotRoot,
};
use crate::{
	config::{ReferenceCfg, ReferenceKind},
	file::filekey::FileKey,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
	Directory,
	/// A symlink in the source root, carrying its target text
	Alias(String),
}

/// One entry of a source snapshot root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSnapshot {
	pub name: SnapshotName,
	pub kind: SourceKind,
}

/// Which source snapshots are candidates for pulling
#[derive(Clone, Debug)]
pub enum Selection {
	/// Exactly these, in this order
	Explicit(Vec<SnapshotName>),
	/// Every source snapshot not yet at the destination
	All,
	/// Source snapshots newer than the newest one already at the destination
	MissingTail,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Work {
	Transfer,
	/// Recreate the source's symlink to a sibling snapshot
	Alias(SnapshotName),
	/// The source has a symlink whose target is not a bare snapshot name
	BadAlias(String),
	/// Asked for explicitly, but the source doesn't have it
	NotInSource,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
	pub name: SnapshotName,
	pub work: Work,
}

#[derive(Clone, Debug)]
pub struct Selector {
	pub dest: SnapshotRoot,
	/// Other roots whose snapshots are offered as link references
	pub siblings: Vec<SnapshotRoot>,
	pub references: ReferenceCfg,
	pub assume_complete: bool,
}

impl Selector {
	pub fn new(dest: SnapshotRoot, references: ReferenceCfg) -> Selector {
		Selector {
			dest,
			siblings: Vec::new(),
			references,
			assume_complete: false,
		}
	}

	/// Work items for the snapshots in `sources` picked by `selection` that the destination doesn't
	/// have yet. `reverse` means newest first and is ignored for explicit selections.
	pub fn plan(
		&self,
		sources: &[SourceSnapshot],
		selection: &Selection,
		reverse: bool,
	) -> io::Result<Vec<WorkItem>> {
		let mut picked: Vec<(SnapshotName, Option<&SourceKind>)> = match selection {
			Selection::Explicit(names) => names
				.iter()
				.map(|name| {
					let found = sources.iter().find(|s| s.name == *name).map(|s| &s.kind);
					(name.clone(), found)
				})
				.collect(),
			Selection::All => sources
				.iter()
				.map(|s| (s.name.clone(), Some(&s.kind)))
				.collect(),
			Selection::MissingTail => {
				let newest = self.dest.done_names(self.assume_complete)?.pop();
				debug!("newest snapshot at {:?}: {newest:?}", self.dest.0);
				sources
					.iter()
					.filter(|s| newest.as_ref().map_or(true, |n| s.name > *n))
					.map(|s| (s.name.clone(), Some(&s.kind)))
					.collect()
			}
		};

		if !matches!(selection, Selection::Explicit(_)) {
			picked.sort_by(|a, b| a.0.cmp(&b.0));
			if reverse {
				picked.reverse();
			}
		}

		let mut result = Vec::new();
		for (name, kind) in picked {
			if self.dest.state(&name, self.assume_complete)?.is_done() {
				info!("{name}: already present in {:?}, skipping", self.dest.0);
				continue;
			}

			let work = match kind {
				None => Work::NotInSource,
				Some(SourceKind::Directory) => Work::Transfer,
				Some(SourceKind::Alias(target)) => match target.parse() {
					Ok(target) => Work::Alias(target),
					Err(_) => Work::BadAlias(target.clone()),
				},
			};
			result.push(WorkItem { name, work });
		}
		Ok(result)
	}

	/// `--link-dest` candidates for creating `name`, in configured priority order. Only complete
	/// snapshots qualify, each inode at most once, never `name` itself, and at most
	/// `references.max` of them.
	///
	/// Meant to be called right before the transfer, as earlier items of the same run change the
	/// answer.
	pub fn references(&self, name: &SnapshotName) -> io::Result<Vec<PathBuf>> {
		let done = self.dest.done_names(self.assume_complete)?;
		let own_key = FileKey::resolved(&self.dest.snapshot(name).0).ok();

		let mut seen: HashSet<FileKey> = HashSet::new();
		let mut result = Vec::new();

		for kind in &self.references.order {
			let candidates: Vec<PathBuf> = match kind {
				ReferenceKind::Previous => done
					.iter()
					.rev()
					.find(|n| *n < name)
					.map(|n| self.dest.snapshot(n).0)
					.into_iter()
					.collect(),
				ReferenceKind::Latest => self
					.dest
					.latest()?
					.filter(|n| n != name)
					.map(|n| self.dest.snapshot(&n).0)
					.into_iter()
					.collect(),
				ReferenceKind::Next => done
					.iter()
					.find(|n| *n > name)
					.map(|n| self.dest.snapshot(n).0)
					.into_iter()
					.collect(),
				ReferenceKind::SiblingSameDate => self
					.siblings
					.iter()
					.map(|root| root.snapshot(name).0)
					.collect(),
				ReferenceKind::SiblingLatest => {
					let mut paths = Vec::new();
					for root in &self.siblings {
						if let Some(n) = root.latest()? {
							paths.push(root.snapshot(&n).0);
						}
					}
					paths
				}
			};

			for path in candidates {
				if result.len() >= self.references.max {
					return Ok(result);
				}

				let snap = Snapshot(path);
				if !snap.0.is_dir() || !snap.state(self.assume_complete)?.is_done() {
					continue;
				}

				let key = FileKey::resolved(&snap.0)?;
				if Some(key) == own_key || !seen.insert(key) {
					continue;
				}

				debug!("{name}: link reference {:?} ({kind:?})", snap.0);
				result.push(snap.0);
			}
		}

		Ok(result)
	}
}
