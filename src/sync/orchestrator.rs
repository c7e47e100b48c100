//! Creates the snapshots a [Selector] planned, one at a time, under the destination root's lock

use std::{fmt, fs, os::unix::fs::symlink, path::PathBuf};

use anyhow::{bail, Context};
use log::{debug, error, info, warn};

use super::{Cancel, Location, Transfer, TransferRequest};
use crate::{
	file::linker::Linker,
	repo::{
		selector::{Selector, Work, WorkItem},
		snapshot::{SnapshotName, SnapshotState},
		SnapshotRoot,
	},
	EXIT_FAILURE,
};

/// Accumulated outcome of one or more runs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
	pub done: usize,
	pub skipped: usize,
	pub failed: usize,
	pub interrupted: bool,
}

impl Report {
	pub fn absorb(&mut self, other: Report) {
		self.done += other.done;
		self.skipped += other.skipped;
		self.failed += other.failed;
		self.interrupted |= other.interrupted;
	}

	pub fn is_success(&self) -> bool {
		self.failed == 0 && !self.interrupted
	}

	pub fn exit_code(&self) -> exitcode::ExitCode {
		if self.is_success() {
			exitcode::OK
		} else {
			EXIT_FAILURE
		}
	}
}

impl fmt::Display for Report {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{} done, {} skipped, {} failed",
			self.done, self.skipped, self.failed
		)?;
		if self.interrupted {
			write!(f, ", interrupted")?;
		}
		Ok(())
	}
}

/// Where the contents of a snapshot being created come from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
	/// Another snapshot root. Snapshot `NAME` is copied from `ROOT/NAME`.
	Snapshots(Location),
	/// A live tree, copied as a whole into whichever snapshot is being created
	Tree(Location),
}

impl Source {
	pub fn location(&self) -> &Location {
		match self {
			Source::Snapshots(l) | Source::Tree(l) => l,
		}
	}

	pub fn for_name(&self, name: &SnapshotName) -> Location {
		match self {
			Source::Snapshots(root) => root.join(name),
			Source::Tree(tree) => tree.clone(),
		}
	}
}

impl fmt::Display for Source {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.location())
	}
}

enum Outcome {
	Done,
	Skipped,
}

/// Everything needed to pull snapshots from one source root into one destination root
pub struct SyncContext<'a> {
	pub source: Source,
	/// Knows the destination root and how to pick link references
	pub selector: Selector,
	pub includes: Vec<String>,
	pub excludes: Vec<String>,
	/// Only report what would be done
	pub dry_run: bool,
	/// No per-snapshot status lines on stdout
	pub quiet: bool,
	pub transfer: &'a dyn Transfer,
	pub cancel: Cancel,
	/// Start new snapshots as a hard linked copy of `LATEST` instead of an empty directory
	pub prototype: bool,
}

impl SyncContext<'_> {
	pub fn dest(&self) -> &SnapshotRoot {
		&self.selector.dest
	}

	fn status(&self, name: &SnapshotName, msg: fmt::Arguments) {
		if !self.quiet {
			println!("{}/{name}: {msg}", self.dest().0.display());
		}
	}

	/// Works through `items` in order, carrying on past failures. Holds the destination's lock
	/// throughout, unless dry-running.
	pub fn run(&self, items: &[WorkItem]) -> Report {
		let mut report = Report::default();
		if items.is_empty() {
			info!("nothing to do for {:?}", self.dest().0);
			return report;
		}

		let _lock = if self.dry_run {
			None
		} else {
			match self.dest().lock() {
				Ok(lock) => Some(lock),
				Err(e) => {
					error!("{e:#}");
					report.failed = items.len();
					return report;
				}
			}
		};

		for item in items {
			if self.cancel.is_cancelled() {
				break;
			}
			match self.run_item(item) {
				Ok(Outcome::Done) => report.done += 1,
				Ok(Outcome::Skipped) => report.skipped += 1,
				Err(e) => {
					error!("{}/{}: {e:#}", self.dest().0.display(), item.name);
					report.failed += 1;
				}
			}
		}

		report.interrupted = self.cancel.is_cancelled();
		info!("{:?}: {report}", self.dest().0);
		report
	}

	fn run_item(&self, item: &WorkItem) -> anyhow::Result<Outcome> {
		match &item.work {
			Work::Transfer => self.transfer(&item.name),
			Work::Alias(target) => self.alias(&item.name, target),
			Work::BadAlias(target) => bail!(
				"{} is a symlink to {target:?}, which is not a snapshot name",
				self.source.for_name(&item.name)
			),
			Work::NotInSource => bail!("not present in {}", self.source),
		}
	}

	fn transfer(&self, name: &SnapshotName) -> anyhow::Result<Outcome> {
		let snap = self.dest().snapshot(name);
		let state = snap.state(self.selector.assume_complete)?;
		match state {
			ref s if s.is_done() => {
				self.status(name, format_args!("already present, skipping"));
				return Ok(Outcome::Skipped);
			}
			SnapshotState::Foreign => bail!("{:?} is in the way and not a directory", snap.0),
			SnapshotState::Incomplete => warn!("{name}: resuming incomplete snapshot {:?}", snap.0),
			_ => (),
		}

		let link_dests = self.selector.references(name)?;
		let source = self.source.for_name(name);
		let req = TransferRequest {
			source: &source,
			dest: &snap.0,
			link_dests: &link_dests,
			includes: &self.includes,
			excludes: &self.excludes,
		};

		if self.dry_run {
			self.status(
				name,
				format_args!(
					"would transfer from {source} with {} link references",
					link_dests.len()
				),
			);
			if !self.quiet {
				println!("\t{}", self.transfer.describe(&req));
			}
			return Ok(Outcome::Done);
		}

		if state == SnapshotState::Absent {
			snap.clear_marker()?;
			match self.prototype_for(name)? {
				Some(proto) => {
					let linker = Linker {
						cancel: self.cancel.clone(),
						..Linker::default()
					};
					let report = linker.link_tree(&proto, &snap.0)?;
					if report.interrupted {
						bail!("interrupted while starting from prototype {proto:?}");
					}
					if !report.is_clean() {
						warn!("{name}: {} entries of prototype {proto:?} failed", report.failed);
					}
				}
				None => fs::create_dir(&snap.0).with_context(|| format!("creating {:?}", snap.0))?,
			}
		}

		self.status(
			name,
			format_args!("transferring from {source} ({} link references)", link_dests.len()),
		);
		self.transfer.transfer(&req, &self.cancel).with_context(|| {
			format!("transfer failed, leaving incomplete {:?} for inspection", snap.0)
		})?;

		snap.mark_complete()?;
		// the snapshot itself is complete by now
		if let Err(e) = self.dest().advance_latest(name) {
			error!("{name}: updating {}: {e}", SnapshotRoot::LATEST);
		}
		self.status(name, format_args!("done"));
		Ok(Outcome::Done)
	}

	/// The complete `LATEST` snapshot, if prototypes are wanted and there is one
	fn prototype_for(&self, name: &SnapshotName) -> anyhow::Result<Option<PathBuf>> {
		if !self.prototype {
			return Ok(None);
		}
		let Some(latest) = self.dest().latest()? else {
			debug!("{name}: no LATEST to start from");
			return Ok(None);
		};
		let snap = self.dest().snapshot(&latest);
		match snap.state(self.selector.assume_complete)? {
			SnapshotState::Complete => Ok(Some(snap.0)),
			other => {
				warn!("{name}: not starting from LATEST {latest}, it is {other:?}");
				Ok(None)
			}
		}
	}

	/// Recreates a source symlink to a sibling snapshot instead of transferring
	fn alias(&self, name: &SnapshotName, target: &SnapshotName) -> anyhow::Result<Outcome> {
		let snap = self.dest().snapshot(name);
		match snap.state(self.selector.assume_complete)? {
			s if s.is_done() => {
				self.status(name, format_args!("already present, skipping"));
				return Ok(Outcome::Skipped);
			}
			SnapshotState::Absent => (),
			other => bail!("{:?} is in the way ({other:?})", snap.0),
		}

		if !self.dest().snapshot(target).0.exists() {
			warn!(
				"{name}: alias target {target} does not exist in {:?} yet",
				self.dest().0
			);
		}

		if self.dry_run {
			self.status(name, format_args!("would link to {target}"));
			return Ok(Outcome::Done);
		}

		symlink(target, &snap.0).with_context(|| format!("symlink {target} {:?}", snap.0))?;
		self.status(name, format_args!("-> {target}"));
		Ok(Outcome::Done)
	}
}

#[cfg(test)]
mod test {
	use std::{os::unix::fs::MetadataExt, path::Path};

	use assert_fs::prelude::*;
	use predicates::prelude::*;

	use super::*;
	use crate::{config::ReferenceCfg, repo::selector::Selection, sync::fake::FakeTransfer};

	fn name(s: &str) -> SnapshotName {
		s.parse().unwrap()
	}

	fn ino(p: &assert_fs::fixture::ChildPath) -> u64 {
		fs::symlink_metadata(p.path()).unwrap().ino()
	}

	fn context<'a>(temp: &assert_fs::TempDir, transfer: &'a FakeTransfer) -> SyncContext<'a> {
		temp.child("dest").create_dir_all().unwrap();
		SyncContext {
			source: Source::Snapshots(Location::Local(temp.child("src").path().to_owned())),
			selector: Selector::new(
				SnapshotRoot(temp.child("dest").path().to_owned()),
				ReferenceCfg::default(),
			),
			includes: Vec::new(),
			excludes: Vec::new(),
			dry_run: false,
			quiet: true,
			transfer,
			cancel: Cancel::default(),
			prototype: false,
		}
	}

	fn pull(ctx: &SyncContext, names: &[&str]) -> Report {
		let sources = SnapshotRoot(ctx.source.location().path().to_owned()).list().unwrap();
		let selection = Selection::Explicit(names.iter().map(|n| name(n)).collect());
		let items = ctx.selector.plan(&sources, &selection, false).unwrap();
		ctx.run(&items)
	}

	#[test]
	fn unchanged_files_share_inodes() {
		let temp = assert_fs::TempDir::new().unwrap();
		for day in ["2024-01-01", "2024-01-02"] {
			temp.child(format!("src/{day}/a.txt")).write_str("X").unwrap();
			temp.child(format!("src/{day}/logs/b.log")).write_str("Y").unwrap();
		}
		let fake = FakeTransfer::default();
		let ctx = context(&temp, &fake);

		let report = pull(&ctx, &["2024-01-01", "2024-01-02"]);

		assert_eq!(report.done, 2);
		assert_eq!(report.exit_code(), exitcode::OK);
		for rel in ["a.txt", "logs/b.log"] {
			assert_eq!(
				ino(&temp.child(format!("dest/2024-01-01/{rel}"))),
				ino(&temp.child(format!("dest/2024-01-02/{rel}")))
			);
		}
		assert_eq!(
			*fake.link_dests.lock().unwrap(),
			[vec![], vec![temp.child("dest/2024-01-01").path().to_owned()]]
		);
		assert_eq!(ctx.dest().latest().unwrap(), Some(name("2024-01-02")));
	}

	#[test]
	fn changed_files_get_new_inodes() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("src/2024-01-01/a.txt").write_str("X").unwrap();
		temp.child("src/2024-01-02/a.txt").write_str("Z").unwrap();
		let fake = FakeTransfer::default();
		let ctx = context(&temp, &fake);

		assert!(pull(&ctx, &["2024-01-01", "2024-01-02"]).is_success());

		let (old, new) = (temp.child("dest/2024-01-01/a.txt"), temp.child("dest/2024-01-02/a.txt"));
		assert_ne!(ino(&old), ino(&new));
		old.assert("X");
		new.assert("Z");
	}

	#[test]
	fn second_run_is_a_no_op() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("src/2024-01-01/a.txt").write_str("X").unwrap();
		let fake = FakeTransfer::default();
		let ctx = context(&temp, &fake);

		assert_eq!(pull(&ctx, &["2024-01-01"]).done, 1);
		let before = ino(&temp.child("dest/2024-01-01/a.txt"));

		assert_eq!(pull(&ctx, &["2024-01-01"]), Report::default());
		assert_eq!(fake.calls.lock().unwrap().len(), 1);
		assert_eq!(ino(&temp.child("dest/2024-01-01/a.txt")), before);
	}

	#[test]
	fn only_missing_dates_are_transferred() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("src/2024-01-01/a.txt").write_str("X").unwrap();
		temp.child("src/2024-01-02/a.txt").write_str("X").unwrap();
		let fake = FakeTransfer::default();
		let ctx = context(&temp, &fake);
		assert!(pull(&ctx, &["2024-01-01"]).is_success());

		let report = pull(&ctx, &["2024-01-01", "2024-01-02"]);

		assert_eq!(report.done, 1);
		assert_eq!(report.exit_code(), exitcode::OK);
		assert_eq!(
			*fake.calls.lock().unwrap(),
			[
				temp.child("dest/2024-01-01").path().to_owned(),
				temp.child("dest/2024-01-02").path().to_owned()
			]
		);
	}

	#[test]
	fn failed_transfer_is_left_incomplete_and_resumed() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("src/2024-01-01/a.txt").write_str("X").unwrap();
		temp.child("src/2024-01-02/a.txt").write_str("X").unwrap();
		temp.child("src/2024-01-02/b.txt").write_str("Y").unwrap();
		let fake = FakeTransfer::failing("2024-01-02");
		let ctx = context(&temp, &fake);

		let report = pull(&ctx, &["2024-01-01", "2024-01-02"]);

		assert_eq!((report.done, report.failed), (1, 1));
		assert_eq!(report.exit_code(), EXIT_FAILURE);
		temp.child("dest/2024-01-02").assert(predicate::path::is_dir());
		assert_eq!(
			ctx.dest().state(&name("2024-01-02"), false).unwrap(),
			SnapshotState::Incomplete
		);
		assert_eq!(ctx.dest().latest().unwrap(), Some(name("2024-01-01")));

		// not treated as done on the next run
		fake.fail.lock().unwrap().clear();
		let report = pull(&ctx, &["2024-01-02"]);
		assert_eq!(report.done, 1);
		temp.child("dest/2024-01-02/b.txt").assert("Y");
		assert_eq!(ctx.dest().latest().unwrap(), Some(name("2024-01-02")));
	}

	#[test]
	fn empty_source_gives_empty_snapshot() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("src/2024-01-01").create_dir_all().unwrap();
		let fake = FakeTransfer::default();
		let ctx = context(&temp, &fake);

		assert_eq!(pull(&ctx, &["2024-01-01"]).exit_code(), exitcode::OK);
		assert_eq!(
			fs::read_dir(temp.child("dest/2024-01-01").path()).unwrap().count(),
			0
		);
	}

	#[test]
	fn symlinks_are_reproduced_verbatim() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("src/2024-01-01/a.txt").write_str("X").unwrap();
		std::os::unix::fs::symlink("a.txt", temp.child("src/2024-01-01/link").path()).unwrap();
		let fake = FakeTransfer::default();
		let ctx = context(&temp, &fake);

		assert!(pull(&ctx, &["2024-01-01"]).is_success());

		assert_eq!(
			fs::read_link(temp.child("dest/2024-01-01/link").path()).unwrap(),
			Path::new("a.txt")
		);
	}

	#[test]
	fn fifos_are_left_out() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("src/2024-01-01/a.txt").write_str("X").unwrap();
		nix::unistd::mkfifo(
			temp.child("src/2024-01-01/pipe").path(),
			nix::sys::stat::Mode::S_IRWXU,
		)
		.unwrap();
		let fake = FakeTransfer::default();
		let ctx = context(&temp, &fake);

		assert!(pull(&ctx, &["2024-01-01"]).is_success());
		temp.child("dest/2024-01-01/a.txt").assert("X");
		temp.child("dest/2024-01-01/pipe").assert(predicate::path::missing());
	}

	#[test]
	fn aliases_are_recreated() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("src/2024-01-01/a.txt").write_str("X").unwrap();
		std::os::unix::fs::symlink("2024-01-01", temp.child("src/2024-01-02").path()).unwrap();
		std::os::unix::fs::symlink("2024-01-05", temp.child("src/2024-01-03").path()).unwrap();
		let fake = FakeTransfer::default();
		let ctx = context(&temp, &fake);

		let report = pull(&ctx, &["2024-01-01", "2024-01-02", "2024-01-03"]);

		// a dangling alias target only warrants a warning
		assert_eq!(report.done, 3);
		assert_eq!(fake.calls.lock().unwrap().len(), 1);
		assert_eq!(
			fs::read_link(temp.child("dest/2024-01-02").path()).unwrap(),
			Path::new("2024-01-01")
		);
		assert_eq!(
			fs::read_link(temp.child("dest/2024-01-03").path()).unwrap(),
			Path::new("2024-01-05")
		);
	}

	#[test]
	fn missing_source_date_fails_only_that_item() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("src/2024-01-02/a.txt").write_str("X").unwrap();
		let fake = FakeTransfer::default();
		let ctx = context(&temp, &fake);

		let report = pull(&ctx, &["2024-01-01", "2024-01-02"]);

		assert_eq!((report.done, report.failed), (1, 1));
		temp.child("dest/2024-01-01").assert(predicate::path::missing());
	}

	#[test]
	fn dry_run_changes_nothing() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("src/2024-01-01/a.txt").write_str("X").unwrap();
		let fake = FakeTransfer::default();
		let mut ctx = context(&temp, &fake);
		ctx.dry_run = true;

		assert_eq!(pull(&ctx, &["2024-01-01"]).done, 1);
		assert!(fake.calls.lock().unwrap().is_empty());
		assert_eq!(fs::read_dir(temp.child("dest").path()).unwrap().count(), 0);
	}

	#[test]
	fn cancelled_runs_stop_and_fail() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("src/2024-01-01/a.txt").write_str("X").unwrap();
		let fake = FakeTransfer::default();
		let ctx = context(&temp, &fake);
		ctx.cancel.cancel();

		let report = pull(&ctx, &["2024-01-01"]);

		assert!(report.interrupted);
		assert_eq!(report.exit_code(), EXIT_FAILURE);
		assert!(fake.calls.lock().unwrap().is_empty());
		assert_eq!(ctx.dest().latest().unwrap(), None);
	}

	#[test]
	fn prototype_starts_from_latest() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("src/2024-01-01/a.txt").write_str("X").unwrap();
		temp.child("src/2024-01-02/a.txt").write_str("X").unwrap();
		let fake = FakeTransfer::default();
		let mut ctx = context(&temp, &fake);
		ctx.prototype = true;
		ctx.selector.references.order.clear();

		assert!(pull(&ctx, &["2024-01-01", "2024-01-02"]).is_success());

		// shared even without link references, because the prototype already held the file
		assert_eq!(
			ino(&temp.child("dest/2024-01-01/a.txt")),
			ino(&temp.child("dest/2024-01-02/a.txt"))
		);
	}

	#[test]
	fn live_tree_source() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("live/a.txt").write_str("X").unwrap();
		let fake = FakeTransfer::default();
		let mut ctx = context(&temp, &fake);
		ctx.source = Source::Tree(Location::Local(temp.child("live").path().to_owned()));
		let items = [WorkItem {
			name: name("2024-01-01-10:00:00"),
			work: Work::Transfer,
		}];

		assert!(ctx.run(&items).is_success());
		temp.child("dest/2024-01-01-10:00:00/a.txt").assert("X");
	}

	#[test]
	fn legacy_latest_directory_does_not_fail_the_pull() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("src/2024-01-01/a.txt").write_str("X").unwrap();
		temp.child("dest/LATEST").create_dir_all().unwrap();
		let fake = FakeTransfer::default();
		let ctx = context(&temp, &fake);

		let report = pull(&ctx, &["2024-01-01"]);

		assert!(report.is_success());
		assert_eq!(report.done, 1);
		assert_eq!(
			ctx.dest().state(&name("2024-01-01"), false).unwrap(),
			SnapshotState::Complete
		);
		assert!(temp.child("dest/LATEST").path().is_dir());
	}

	#[test]
	fn held_lock_fails_the_run() {
		let temp = assert_fs::TempDir::new().unwrap();
		temp.child("src/2024-01-01/a.txt").write_str("X").unwrap();
		let fake = FakeTransfer::default();
		let ctx = context(&temp, &fake);
		let _held = ctx.dest().lock().unwrap();

		let report = pull(&ctx, &["2024-01-01"]);

		assert_eq!(report.failed, 1);
		temp.child("dest/2024-01-01").assert(predicate::path::missing());
	}
}
