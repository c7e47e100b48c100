//! Runs the pulls of several snapshot roots, in parallel across groups but strictly one after the
//! other within a group

use std::collections::BTreeMap;

use anyhow::Context;
use log::{debug, info};
use rayon::prelude::*;

use super::orchestrator::{Report, SyncContext};
use crate::repo::selector::WorkItem;

/// The planned pull of one snapshot root
pub struct Job<'a> {
	/// Jobs sharing a group never run concurrently. Usually the top-level directory, i.e. the host.
	pub group: String,
	pub ctx: SyncContext<'a>,
	pub items: Vec<WorkItem>,
}

fn run_group(jobs: Vec<Job>) -> Report {
	let mut report = Report::default();
	for job in jobs {
		if job.ctx.cancel.is_cancelled() {
			report.interrupted = true;
			break;
		}
		report.absorb(job.ctx.run(&job.items));
	}
	report
}

/// Runs `jobs` on at most `threads` workers. Order within a group is the order in `jobs`.
pub fn run(jobs: Vec<Job>, threads: usize) -> anyhow::Result<Report> {
	let mut groups: BTreeMap<String, Vec<Job>> = BTreeMap::new();
	for job in jobs {
		groups.entry(job.group.clone()).or_default().push(job);
	}
	let groups: Vec<Vec<Job>> = groups.into_values().collect();

	if threads <= 1 || groups.len() <= 1 {
		debug!("running {} groups sequentially", groups.len());
		let mut report = Report::default();
		for group in groups {
			report.absorb(run_group(group));
		}
		return Ok(report);
	}

	info!("running {} groups on {threads} workers", groups.len());
	let pool = rayon::ThreadPoolBuilder::new()
		.num_threads(threads)
		.thread_name(|i| format!("histbackup-worker-{i}"))
		.build()
		.context("creating worker pool")?;

	Ok(pool.install(|| {
		groups
			.into_par_iter()
			.map(run_group)
			.reduce(Report::default, |mut a, b| {
				a.absorb(b);
				a
			})
	}))
}

#[cfg(test)]
mod test {
	use assert_fs::prelude::*;

	use super::*;
	use crate::{
		config::ReferenceCfg,
		repo::{
			selector::{Selection, Selector},
			SnapshotRoot,
		},
		sync::{fake::FakeTransfer, orchestrator::Source, Cancel, Location},
	};

	fn job<'a>(
		temp: &assert_fs::TempDir,
		tree: &str,
		transfer: &'a FakeTransfer,
		cancel: &Cancel,
	) -> Job<'a> {
		temp.child(format!("dest/{tree}")).create_dir_all().unwrap();
		let source = temp.child(format!("src/{tree}")).path().to_owned();
		let selector = Selector::new(
			SnapshotRoot(temp.child(format!("dest/{tree}")).path().to_owned()),
			ReferenceCfg::default(),
		);
		let sources = SnapshotRoot(source.clone()).list().unwrap();
		let items = selector.plan(&sources, &Selection::All, false).unwrap();
		Job {
			group: tree.split('/').next().unwrap().to_owned(),
			ctx: SyncContext {
				source: Source::Snapshots(Location::Local(source)),
				selector,
				includes: Vec::new(),
				excludes: Vec::new(),
				dry_run: false,
				quiet: true,
				transfer,
				cancel: cancel.clone(),
				prototype: false,
			},
			items,
		}
	}

	fn populate(temp: &assert_fs::TempDir) {
		for tree in ["host1/home", "host1/etc", "host2/home"] {
			for day in ["2024-01-01", "2024-01-02"] {
				temp.child(format!("src/{tree}/{day}/f")).write_str(tree).unwrap();
			}
		}
	}

	#[test]
	fn parallel_run_merges_reports() {
		let temp = assert_fs::TempDir::new().unwrap();
		populate(&temp);
		let fake = FakeTransfer::failing("2024-01-02");
		let cancel = Cancel::default();
		let jobs = ["host1/home", "host1/etc", "host2/home"]
			.iter()
			.map(|t| job(&temp, t, &fake, &cancel))
			.collect();

		let report = run(jobs, 4).unwrap();

		assert_eq!((report.done, report.failed), (3, 3));
		assert_eq!(fake.calls.lock().unwrap().len(), 6);
		temp.child("dest/host2/home/2024-01-01/f").assert("host2/home");
	}

	#[test]
	fn sequential_run_keeps_job_order() {
		let temp = assert_fs::TempDir::new().unwrap();
		populate(&temp);
		let fake = FakeTransfer::default();
		let cancel = Cancel::default();
		let jobs = ["host1/home", "host1/etc"]
			.iter()
			.map(|t| job(&temp, t, &fake, &cancel))
			.collect();

		let report = run(jobs, 1).unwrap();

		assert!(report.is_success());
		let calls = fake.calls.lock().unwrap();
		assert_eq!(calls.len(), 4);
		assert!(calls[0].starts_with(temp.child("dest/host1/home").path()));
		assert!(calls[3].starts_with(temp.child("dest/host1/etc").path()));
	}

	#[test]
	fn cancelled_groups_do_not_start() {
		let temp = assert_fs::TempDir::new().unwrap();
		populate(&temp);
		let fake = FakeTransfer::default();
		let cancel = Cancel::default();
		let jobs = ["host1/home", "host2/home"]
			.iter()
			.map(|t| job(&temp, t, &fake, &cancel))
			.collect();
		cancel.cancel();

		let report = run(jobs, 2).unwrap();

		assert!(report.interrupted);
		assert!(fake.calls.lock().unwrap().is_empty());
	}
}
