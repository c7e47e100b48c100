use std::{
	ffi::OsString,
	process::{Command, ExitStatus},
	thread,
	time::Duration,
};

use anyhow::{bail, Context};
use log::{debug, info, warn};
use nix::{
	sys::signal::{kill, Signal},
	unistd::Pid,
};

use super::{Cancel, Transfer, TransferRequest};
use crate::{config::TransferCfg, util::ext::PathExt};

/// rsync's "some files vanished before they could be transferred". Normal for live sources.
const EXIT_VANISHED: i32 = 24;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct Rsync {
	pub program: OsString,
	pub extra_args: Vec<String>,
	/// Remote shell for `host:path` sources, passed as `-e`. rsync falls back to `RSYNC_RSH`.
	pub rsh: Option<String>,
	/// Make rsync itemize what it does
	pub trace: bool,
}

impl Rsync {
	pub fn new(cfg: &TransferCfg) -> Rsync {
		Rsync {
			program: cfg.rsync.clone().into_os_string(),
			extra_args: cfg.extra_args.clone(),
			rsh: None,
			trace: false,
		}
	}

	pub fn command(&self, req: &TransferRequest) -> Command {
		let mut cmd = Command::new(&self.program);

		// archive, hard links, mirror deletions. Devices, fifos and sockets stay out of snapshots.
		cmd.args(["-aH", "--no-D", "--delete"]);
		if self.trace {
			cmd.args(["-v", "--itemize-changes"]);
		}
		if let Some(rsh) = &self.rsh {
			cmd.arg("-e").arg(rsh);
		}
		cmd.args(&self.extra_args);

		for link_dest in req.link_dests {
			// relative --link-dest paths are relative to the destination, so go absolute
			let absolute = std::fs::canonicalize(link_dest).unwrap_or_else(|_| link_dest.clone());
			let mut arg = OsString::from("--link-dest=");
			arg.push(absolute);
			cmd.arg(arg);
		}

		for pattern in req.includes {
			cmd.arg(format!("--include={pattern}"));
		}
		for pattern in req.excludes {
			cmd.arg(format!("--exclude={pattern}"));
		}

		cmd.arg(req.source.to_transfer_arg());
		cmd.arg(req.dest.with_trailing_slash());
		cmd
	}

	fn wait(child: &mut std::process::Child, cancel: &Cancel) -> anyhow::Result<ExitStatus> {
		let mut signalled = false;
		loop {
			if let Some(status) = child.try_wait()? {
				return Ok(status);
			}
			if cancel.is_cancelled() && !signalled {
				warn!("stopping rsync (pid {})", child.id());
				// SIGTERM lets rsync clean up its temporary files
				kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM)?;
				signalled = true;
			}
			thread::sleep(POLL_INTERVAL);
		}
	}
}

impl Transfer for Rsync {
	fn transfer(&self, req: &TransferRequest, cancel: &Cancel) -> anyhow::Result<()> {
		let mut cmd = self.command(req);
		if self.trace {
			info!("+ {}", self.describe(req));
		} else {
			debug!("running {cmd:?}");
		}

		let mut child = cmd
			.spawn()
			.with_context(|| format!("spawning {:?}", self.program))?;
		let status = Self::wait(&mut child, cancel)?;

		if cancel.is_cancelled() {
			bail!("interrupted ({status})");
		}
		match status.code() {
			Some(0) => Ok(()),
			Some(EXIT_VANISHED) => {
				warn!("some files vanished during the transfer to {:?}", req.dest);
				Ok(())
			}
			_ => bail!("{:?} failed: {status}", self.program),
		}
	}

	fn describe(&self, req: &TransferRequest) -> String {
		let cmd = self.command(req);
		std::iter::once(cmd.get_program())
			.chain(cmd.get_args())
			.map(|arg| crate::util::shell::quote(&arg.to_string_lossy()))
			.collect::<Vec<_>>()
			.join(" ")
	}
}
