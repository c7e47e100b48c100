use std::path::PathBuf;

use clap::Args;
use exitcode::ExitCode;
use log::error;

use crate::{
	cli::Session,
	repo::{
		selector::{Selection, Selector},
		snapshot::SnapshotName,
		SnapshotRoot,
	},
	sync::{
		orchestrator::{Source, SyncContext},
		rsync::Rsync,
		Location,
	},
	EXIT_FAILURE,
};

#[derive(Debug, Args)]
pub struct PullLocalArgs {
	/// Only print what would be done. This is the default, see --doit
	#[arg(short('n'), long, conflicts_with = "doit")]
	dry_run: bool,

	/// Actually pull
	#[arg(short('y'), long)]
	doit: bool,

	/// Newest first. Ignored when dates are given
	#[arg(short('r'), long)]
	reverse: bool,

	/// Show the rsync command lines and itemize their changes
	#[arg(short('x'), long)]
	trace: bool,

	/// Passed to rsync as --include
	#[arg(long)]
	include: Vec<String>,

	/// Passed to rsync as --exclude
	#[arg(long)]
	exclude: Vec<String>,

	/// Treat existing snapshot directories without a completion marker as complete
	#[arg(long)]
	assume_complete: bool,

	/// Snapshot root to pull from
	srcdir: PathBuf,

	/// Snapshot root to pull into
	dstdir: PathBuf,

	/// Snapshots to pull, in this order. Defaults to all the source has and the destination lacks
	dates: Vec<SnapshotName>,
}

impl PullLocalArgs {
	pub fn exec(self, session: &Session) -> anyhow::Result<ExitCode> {
		let mut missing = false;
		for dir in [&self.srcdir, &self.dstdir] {
			if !dir.is_dir() {
				error!("{dir:?} is not a directory");
				missing = true;
			}
		}
		if missing {
			return Ok(EXIT_FAILURE);
		}

		let source = SnapshotRoot(self.srcdir);
		let dest = SnapshotRoot(self.dstdir);

		let selection = if self.dates.is_empty() {
			Selection::All
		} else {
			Selection::Explicit(self.dates)
		};

		let mut selector = Selector::new(dest, session.config.references.clone());
		selector.assume_complete = self.assume_complete;
		let items = selector.plan(&source.list()?, &selection, self.reverse)?;

		let mut rsync = Rsync::new(&session.config.transfer);
		rsync.trace = self.trace;

		let mut excludes = self.exclude;
		excludes.extend(session.config.excludes_for(&selector.dest.0));

		let dry_run = !self.doit;
		let ctx = SyncContext {
			source: Source::Snapshots(Location::Local(source.0)),
			selector,
			includes: self.include,
			excludes,
			dry_run,
			quiet: session.quiet,
			transfer: &rsync,
			cancel: session.cancel.clone(),
			prototype: false,
		};

		let report = ctx.run(&items);
		if dry_run && !items.is_empty() && !session.quiet {
			println!("dry run, pass --doit to pull");
		}
		Ok(report.exit_code())
	}
}
