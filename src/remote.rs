//! Running a snapshot on a backup host that pulls from us (or from a third host) through an ssh
//! reverse tunnel

use std::{
	path::{Path, PathBuf},
	process::{Command, Stdio},
	str::FromStr,
};

use anyhow::{bail, Context};
use log::{debug, info};

use crate::{util::shell, EXIT_FAILURE};

/// ssh's own exit status for connection and protocol failures
const SSH_FAILED: i32 = 255;

/// The remote shell template: `explicit`, else `$RSYNC_RSH`, else plain `ssh`
pub fn ssh_template(explicit: Option<&str>) -> Vec<String> {
	let template = match explicit {
		Some(t) => t.to_owned(),
		None => std::env::var("RSYNC_RSH").unwrap_or_else(|_| "ssh".to_owned()),
	};
	let words = shell::split(&template);
	if words.is_empty() {
		vec!["ssh".to_owned()]
	} else {
		words
	}
}

/// A directory or symlink found below some directory, possibly on another host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedEntry {
	/// Relative to the listed directory
	pub rel: PathBuf,
	/// Target text, for symlinks
	pub symlink: Option<String>,
}

impl ListedEntry {
	/// Parses one line of `find -printf '%y\t%P\t%l\n'`
	fn parse(line: &str) -> Option<ListedEntry> {
		let mut fields = line.splitn(3, '\t');
		let (kind, rel, target) = (fields.next()?, fields.next()?, fields.next().unwrap_or(""));
		match kind {
			"d" => Some(ListedEntry {
				rel: PathBuf::from(rel),
				symlink: None,
			}),
			"l" => Some(ListedEntry {
				rel: PathBuf::from(rel),
				symlink: Some(target.to_owned()),
			}),
			_ => None,
		}
	}
}

/// Directories and symlinks exactly `depth` levels below `dir` on `host`, via GNU find
pub fn list_remote(
	ssh: &[String],
	host: &str,
	dir: &Path,
	depth: usize,
) -> anyhow::Result<Vec<ListedEntry>> {
	let depth = depth.to_string();
	let dir = dir.display().to_string();
	let find = shell::join([
		"find",
		dir.as_str(),
		"-mindepth",
		depth.as_str(),
		"-maxdepth",
		depth.as_str(),
		"(",
		"-type",
		"d",
		"-o",
		"-type",
		"l",
		")",
		"-printf",
		r"%y\t%P\t%l\n",
	]);

	let mut cmd = Command::new(&ssh[0]);
	cmd.args(&ssh[1..]).arg(host).arg(find);
	debug!("listing with {cmd:?}");
	let output = cmd
		.stdin(Stdio::null())
		.output()
		.with_context(|| format!("spawning {:?}", ssh[0]))?;
	if !output.status.success() {
		bail!(
			"listing {host}:{dir} failed ({}): {}",
			output.status,
			String::from_utf8_lossy(&output.stderr).trim()
		);
	}

	Ok(String::from_utf8_lossy(&output.stdout)
		.lines()
		.filter_map(ListedEntry::parse)
		.collect())
}

/// `[user@]host:root`, the backup host and the snapshot root on it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteSpec {
	pub host: String,
	pub root: PathBuf,
}

impl FromStr for RemoteSpec {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> anyhow::Result<RemoteSpec> {
		match s.split_once(':') {
			Some((host, root)) if !host.is_empty() && !root.is_empty() => Ok(RemoteSpec {
				host: host.to_owned(),
				root: PathBuf::from(root),
			}),
			_ => bail!("{s:?} is not of the form [user@]host:root"),
		}
	}
}

/// A tunnel port unlikely to clash with a concurrent run from another process
pub fn default_tunnel_port() -> u16 {
	20000 + (std::process::id() % 10000) as u16
}

#[derive(Clone, Debug)]
pub struct RemoteSnap {
	/// ssh program and its options
	pub ssh: Vec<String>,
	pub target: RemoteSpec,
	/// The tree to back up, on this host or on `via`
	pub source: PathBuf,
	/// Relay host holding `source`, when it isn't us
	pub via: Option<String>,
	/// Port on the backup host's loopback that leads back to the source's sshd
	pub port: u16,
	/// The histbackup program on the backup host
	pub program: String,
	/// Passed on to the remote `snap`
	pub snap_args: Vec<String>,
}

impl RemoteSnap {
	fn ssh_command(&self) -> Command {
		let mut cmd = Command::new(&self.ssh[0]);
		cmd.args(&self.ssh[1..]);
		cmd
	}

	/// A no-op command, so an unreachable host is told apart from a failing snapshot
	pub fn probe_command(&self) -> Command {
		let mut cmd = self.ssh_command();
		cmd.args(["-o", "BatchMode=yes", &self.target.host, "true"]);
		cmd
	}

	/// What the backup host runs, as one string for its login shell
	pub fn remote_command_line(&self) -> String {
		let rsh = format!(
			"{} -p {} -o NoHostAuthenticationForLocalhost=yes",
			self.ssh[0], self.port
		);
		let mut words = vec![self.program.clone(), "snap".to_owned(), "--rsh".to_owned(), rsh];
		words.extend(self.snap_args.iter().cloned());
		words.push(format!("localhost:{}", self.source.display()));
		words.push(self.target.root.display().to_string());
		shell::join(words)
	}

	pub fn snap_command(&self) -> Command {
		let forward_to = self.via.as_deref().unwrap_or("localhost");
		let mut cmd = self.ssh_command();
		cmd.arg("-R")
			.arg(format!("{}:{forward_to}:22", self.port))
			.arg(&self.target.host)
			.arg(self.remote_command_line());
		cmd
	}

	/// Probes, then runs the snapshot. Returns the remote command's exit status.
	pub fn run(&self) -> anyhow::Result<exitcode::ExitCode> {
		let mut probe = self.probe_command();
		debug!("probing with {probe:?}");
		let status = probe
			.stdin(Stdio::null())
			.status()
			.with_context(|| format!("spawning {:?}", self.ssh[0]))?;
		if !status.success() {
			bail!("cannot connect to {} ({status})", self.target.host);
		}

		let mut cmd = self.snap_command();
		info!("running {cmd:?}");
		let status = cmd
			.stdin(Stdio::null())
			.status()
			.with_context(|| format!("spawning {:?}", self.ssh[0]))?;
		match status.code() {
			Some(SSH_FAILED) => bail!("lost connection to {}", self.target.host),
			Some(code) => Ok(code),
			None => {
				log::error!("remote snapshot on {} ended by {status}", self.target.host);
				Ok(EXIT_FAILURE)
			}
		}
	}
}
