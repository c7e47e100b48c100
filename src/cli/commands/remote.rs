use std::path::PathBuf;

use clap::Args;
use exitcode::ExitCode;

use crate::{
	cli::die,
	remote::{default_tunnel_port, ssh_template, RemoteSnap, RemoteSpec},
	EXIT_USAGE,
};

#[derive(Debug, Args)]
pub struct RemoteArgs {
	/// ssh command and options, instead of $RSYNC_RSH or plain ssh
	#[arg(short('e'), long)]
	rsh: Option<String>,

	/// Relay host holding SRC, when it isn't this one
	#[arg(long)]
	via: Option<String>,

	/// Port the tunnel listens on at the backup host. Defaults to one derived from our pid
	#[arg(long)]
	port: Option<u16>,

	/// histbackup on the backup host
	#[arg(long, default_value = "histbackup")]
	program: String,

	/// Passed on to the remote snap as --include
	#[arg(long)]
	include: Vec<String>,

	/// Passed on to the remote snap as --exclude
	#[arg(long)]
	exclude: Vec<String>,

	/// Backup host and snapshot root on it, as [user@]host:root
	target: String,

	/// Tree to snapshot, on this host or the --via one
	src: PathBuf,
}

impl RemoteArgs {
	pub fn exec(self) -> anyhow::Result<ExitCode> {
		let target: RemoteSpec = self
			.target
			.parse()
			.unwrap_or_else(|e| die(EXIT_USAGE, &format!("{e:#}")));

		let mut snap_args = Vec::new();
		for pattern in self.include {
			snap_args.extend(["--include".to_owned(), pattern]);
		}
		for pattern in self.exclude {
			snap_args.extend(["--exclude".to_owned(), pattern]);
		}

		let remote = RemoteSnap {
			ssh: ssh_template(self.rsh.as_deref()),
			target,
			source: self.src,
			via: self.via,
			port: self.port.unwrap_or_else(default_tunnel_port),
			program: self.program,
			snap_args,
		};
		remote.run()
	}
}
