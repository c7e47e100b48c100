use std::{
	collections::BTreeMap,
	fs,
	path::{Component, Path, PathBuf},
};

use anyhow::Context;
use clap::Args;
use exitcode::ExitCode;
use glob::{MatchOptions, Pattern};
use log::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::{
	cli::{die, Session},
	remote::{self, ListedEntry},
	repo::{
		selector::{Selection, Selector, SourceKind, SourceSnapshot},
		snapshot::SnapshotName,
		SnapshotRoot,
	},
	sync::{
		orchestrator::{Source, SyncContext},
		pool::{self, Job},
		rsync::Rsync,
		Location,
	},
	util::ext::PathExt,
	EXIT_FAILURE, EXIT_USAGE,
};

const PATH_MATCH: MatchOptions = MatchOptions {
	case_sensitive: true,
	require_literal_separator: true,
	require_literal_leading_dot: true,
};

#[derive(Debug, Args)]
pub struct PullMissingArgs {
	/// Pull every snapshot a root lacks, not just those newer than its newest
	#[arg(short('a'), long)]
	all: bool,

	/// Remote shell for listing and pulling from [user@]host:path trees, as for rsync -e
	#[arg(short('e'), long)]
	rsh: Option<String>,

	/// Pull roots under different top-level directories in parallel
	#[arg(short('P'), long)]
	parallel: bool,

	/// Number of workers with --parallel
	#[arg(long, default_value_t = 4)]
	jobs: usize,

	/// Only print what would be done
	#[arg(short('n'), long)]
	dry_run: bool,

	/// Newest first
	#[arg(short('r'), long)]
	reverse: bool,

	/// Show the rsync command lines and itemize their changes
	#[arg(short('x'), long)]
	trace: bool,

	/// Treat existing snapshot directories without a completion marker as complete
	#[arg(long)]
	assume_complete: bool,

	/// Tree of snapshot roots to pull from, local or [user@]host:path
	other_tree: String,

	/// Tree of snapshot roots to pull into
	this_tree: PathBuf,

	/// Glob selecting the snapshot roots, relative to the trees, e.g. '*/home'
	subdir_pattern: String,

	/// Glob relative to each destination root's parent directory, selecting sibling roots whose
	/// snapshots are offered as link references, e.g. '*'
	matching_parent_pattern: Option<String>,
}

/// Directories and symlinks exactly `depth` levels below `dir`
fn list_local(dir: &Path, depth: usize) -> Vec<ListedEntry> {
	let mut result = Vec::new();
	for entry in WalkDir::new(dir).min_depth(depth).max_depth(depth) {
		let entry = match entry {
			Ok(entry) => entry,
			Err(e) => {
				warn!("walking {dir:?}: {e}");
				continue;
			}
		};
		let Ok(rel) = entry.path().strip_prefix(dir) else {
			continue;
		};
		let symlink = if entry.path_is_symlink() {
			match fs::read_link(entry.path()) {
				Ok(target) => Some(target.to_string_lossy().into_owned()),
				Err(e) => {
					warn!("readlink {:?}: {e}", entry.path());
					continue;
				}
			}
		} else if entry.file_type().is_dir() {
			None
		} else {
			continue;
		};
		result.push(ListedEntry {
			rel: rel.to_owned(),
			symlink,
		});
	}
	result
}

/// Groups listed snapshot entries by their root, keeping roots matching `pattern`
fn group_roots(
	entries: Vec<ListedEntry>,
	pattern: &Pattern,
) -> BTreeMap<PathBuf, Vec<SourceSnapshot>> {
	let mut roots: BTreeMap<PathBuf, Vec<SourceSnapshot>> = BTreeMap::new();
	for entry in entries {
		let (Some(root), Some(name)) = (entry.rel.parent(), entry.rel.file_name()) else {
			continue;
		};
		let Some(name) = name.to_str().and_then(|n| n.parse::<SnapshotName>().ok()) else {
			continue;
		};
		if !pattern.matches_path_with(root, PATH_MATCH) {
			continue;
		}
		let kind = match entry.symlink {
			None => SourceKind::Directory,
			Some(target) => SourceKind::Alias(target),
		};
		roots
			.entry(root.to_owned())
			.or_default()
			.push(SourceSnapshot { name, kind });
	}
	for snapshots in roots.values_mut() {
		snapshots.sort_by(|a, b| a.name.cmp(&b.name));
	}
	roots
}

/// Directories next to `dest` matching `pattern`, other than `dest` itself
fn siblings(dest: &Path, pattern: &str) -> anyhow::Result<Vec<SnapshotRoot>> {
	let Some(parent) = dest.parent() else {
		return Ok(Vec::new());
	};
	let full = format!("{}/{pattern}", Pattern::escape(&parent.to_string_lossy()));

	let mut result = Vec::new();
	for path in glob::glob_with(&full, PATH_MATCH)? {
		let path = path?;
		if path.is_dir() && path != dest {
			result.push(SnapshotRoot(path));
		}
	}
	debug!("siblings of {dest:?}: {result:?}");
	Ok(result)
}

impl PullMissingArgs {
	pub fn exec(self, session: &Session) -> anyhow::Result<ExitCode> {
		let pattern = Pattern::new(&self.subdir_pattern).unwrap_or_else(|e| {
			die(EXIT_USAGE, &format!("bad subdir pattern {:?}: {e}", self.subdir_pattern))
		});
		let depth = Path::new(&self.subdir_pattern)
			.components()
			.filter(|c| matches!(c, Component::Normal(_)))
			.count();
		if depth == 0 {
			die(EXIT_USAGE, "the subdir pattern must name at least one directory level");
		}
		if let Some(p) = &self.matching_parent_pattern {
			if let Err(e) = Pattern::new(p) {
				die(EXIT_USAGE, &format!("bad matching parent pattern {p:?}: {e}"));
			}
		}

		if !self.this_tree.is_dir() {
			error!("{:?} is not a directory", self.this_tree);
			return Ok(EXIT_FAILURE);
		}

		let other = Location::parse(&self.other_tree);
		let listed = match &other {
			Location::Local(path) => {
				if !path.is_dir() {
					error!("{path:?} is not a directory");
					return Ok(EXIT_FAILURE);
				}
				list_local(path, depth + 1)
			}
			Location::Remote { host, path } => remote::list_remote(
				&remote::ssh_template(self.rsh.as_deref()),
				host,
				path,
				depth + 1,
			)?,
		};

		let roots = group_roots(listed, &pattern);
		if roots.is_empty() {
			warn!("no snapshot roots in {other} match {:?}", self.subdir_pattern);
			return Ok(exitcode::OK);
		}

		let mut rsync = Rsync::new(&session.config.transfer);
		rsync.rsh = self.rsh.clone();
		rsync.trace = self.trace;

		let selection = if self.all {
			Selection::All
		} else {
			Selection::MissingTail
		};

		let mut jobs = Vec::new();
		for (rel, sources) in roots {
			let dest = SnapshotRoot(self.this_tree.join(&rel));
			if !dest.is_valid() {
				if self.dry_run {
					info!("would create {:?}", dest.0);
				} else {
					fs::create_dir_all(&dest.0)
						.with_context(|| format!("creating {:?}", dest.0))?;
					info!("created {:?}", dest.0);
				}
			}

			let mut selector = Selector::new(dest, session.config.references.clone());
			selector.assume_complete = self.assume_complete;
			if let Some(p) = &self.matching_parent_pattern {
				selector.siblings = siblings(&selector.dest.0, p)?;
			}

			let items = selector.plan(&sources, &selection, self.reverse)?;
			if items.is_empty() {
				debug!("{:?} is up to date", selector.dest.0);
				continue;
			}

			let group = selector
				.dest
				.0
				.first_component_below(&self.this_tree)
				.unwrap_or_default();
			let excludes = session.config.excludes_for(&selector.dest.0);
			jobs.push(Job {
				group,
				ctx: SyncContext {
					source: Source::Snapshots(other.join(&rel)),
					selector,
					includes: Vec::new(),
					excludes,
					dry_run: self.dry_run,
					quiet: session.quiet,
					transfer: &rsync,
					cancel: session.cancel.clone(),
					prototype: false,
				},
				items,
			});
		}

		let threads = if self.parallel { self.jobs } else { 1 };
		let report = pool::run(jobs, threads)?;
		info!("{report}");
		Ok(report.exit_code())
	}
}
