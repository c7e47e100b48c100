use std::path::PathBuf;

use clap::Args;
use exitcode::ExitCode;
use log::error;

use crate::{
	cli::Session,
	repo::{
		selector::{Selector, Work, WorkItem},
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
pub struct SnapArgs {
	/// Only print what would be done
	#[arg(short('n'), long)]
	dry_run: bool,

	/// Snapshot name, instead of the current local time
	#[arg(long)]
	name: Option<SnapshotName>,

	/// Start from a hard linked copy of LATEST instead of an empty directory. Careful: metadata
	/// changes rsync applies in place then also show up in older snapshots
	#[arg(long)]
	prototype: bool,

	/// Passed to rsync as --include
	#[arg(long)]
	include: Vec<String>,

	/// Passed to rsync as --exclude
	#[arg(long)]
	exclude: Vec<String>,

	/// Remote shell for host:path sources, as for rsync -e
	#[arg(short('e'), long)]
	rsh: Option<String>,

	/// Show the rsync command line and itemize its changes
	#[arg(short('x'), long)]
	trace: bool,

	/// Tree to snapshot, local or [user@]host:path
	source: String,

	/// Snapshot root to create the snapshot in
	root: PathBuf,
}

/// `YYYY-MM-DD-HH:MM:SS` of the current local time
fn now_name() -> anyhow::Result<SnapshotName> {
	Ok(chrono::Local::now()
		.format("%Y-%m-%d-%H:%M:%S")
		.to_string()
		.parse()?)
}

impl SnapArgs {
	pub fn exec(self, session: &Session) -> anyhow::Result<ExitCode> {
		let root = SnapshotRoot(self.root);
		if !root.is_valid() {
			error!("{:?} is not a directory", root.0);
			return Ok(EXIT_FAILURE);
		}

		let source = Location::parse(&self.source);
		if let Location::Local(path) = &source {
			if !path.is_dir() {
				error!("{path:?} is not a directory");
				return Ok(EXIT_FAILURE);
			}
		}

		let name = match self.name {
			Some(name) => name,
			None => now_name()?,
		};

		let mut rsync = Rsync::new(&session.config.transfer);
		rsync.rsh = self.rsh;
		rsync.trace = self.trace;

		let mut excludes = self.exclude;
		excludes.extend(session.config.excludes_for(&root.0));

		let ctx = SyncContext {
			source: Source::Tree(source),
			selector: Selector::new(root, session.config.references.clone()),
			includes: self.include,
			excludes,
			dry_run: self.dry_run,
			quiet: session.quiet,
			transfer: &rsync,
			cancel: session.cancel.clone(),
			prototype: self.prototype,
		};

		let items = [WorkItem {
			name,
			work: Work::Transfer,
		}];
		Ok(ctx.run(&items).exit_code())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn default_name_is_a_timestamp() {
		let name = now_name().unwrap();
		assert_eq!(name.as_str().len(), "YYYY-MM-DD-HH:MM:SS".len());
	}
}
