//! Contains the argument handling and dispatch of the CLI

pub mod commands;

use std::{
	ffi::OsString,
	path::{Path, PathBuf},
};

use clap::{Args, Parser, Subcommand};
use exitcode::ExitCode;
use log::{debug, info};

use self::commands::{
	linktree::LinktreeArgs, pull_local::PullLocalArgs, pull_missing::PullMissingArgs,
	remote::RemoteArgs, snap::SnapArgs,
};
use crate::{config::Config, sync::Cancel};

// Structure based on the recommendations in
// https://rust-cli-recommendations.sunshowers.io/handling-arguments.html

#[derive(Parser)]
#[command(
    author,
    version,
    about,
    long_about,
    after_long_help = "\
    1. Logging: is controlled via the HISTBACKUP_LOG and HISTBACKUP_LOG_STYLE environment \
    variables. Set HISTBACKUP_LOG to error, warn, info, debug or trace to adjust verbosity. For \
    examples, see RUST_LOG mentions in https://docs.rs/env_logger/0.10.0/env_logger/\
    \n\
    \n\
    2. Configuration: read from --config, else $HISTBACKUP_CONFIG, else ~/.histbackup.toml if it \
    exists. It sets the link reference priority, per-destination excludes and the rsync binary.\
    \n\
    \n\
    3. Legacy names: invoked as histbackup-pull-local, histbackup-pull-missing, linktree, \
    rhistbackup or rrhistbackup (e.g. via a symlink), histbackup behaves like the matching \
    subcommand."
)]
pub struct Histbackup {
	#[clap(flatten)]
	pub global_opts: GlobalOpts,

	/// Configuration file, instead of $HISTBACKUP_CONFIG or ~/.histbackup.toml
	#[arg(long, global = true)]
	pub config: Option<PathBuf>,

	#[clap(subcommand)]
	command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Mirror a directory tree with hard links, like `cp -al`
	Linktree(LinktreeArgs),

	/// Create a new snapshot of a tree in a snapshot root
	Snap(SnapArgs),

	/// Pull the snapshots of one local snapshot root into another
	PullLocal(PullLocalArgs),

	/// Pull the snapshots of many snapshot roots, possibly from another host, into matching
	/// local ones
	PullMissing(PullMissingArgs),

	/// Have a backup host snapshot a tree of this (or a relay) host through an ssh tunnel
	Remote(RemoteArgs),
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
	/// Verbosity level, can be specified multiple times, equivalent to
	/// HISTBACKUP_LOG={info,debug,trace}
	#[arg(group="verbosity", long, short, global=true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Quiet mode, equivalent to HISTBACKUP_LOG=error. Also suppresses progress lines
	#[arg(group = "verbosity", long, short, global = true)]
	pub quiet: bool,

	/// Silent mode, equivalent to HISTBACKUP_LOG=off
	#[arg(group = "verbosity", long, short, global = true)]
	pub silent: bool,
}

/// What every subcommand gets handed besides its own arguments
pub struct Session {
	pub config: Config,
	pub cancel: Cancel,
	/// No progress lines on stdout
	pub quiet: bool,
}

impl Histbackup {
	pub fn exec(self) -> anyhow::Result<ExitCode> {
		self.init_logging();

		info!("version {} starting up", env!("CARGO_PKG_VERSION"));
		info!("log level set to {}", log::max_level());

		// remote only waits on ssh, which dies of SIGINT/SIGTERM with us at their defaults
		let cancel = match self.command {
			Command::Remote(_) => Cancel::default(),
			_ => Cancel::install()?,
		};
		let session = Session {
			config: Config::load(self.config.as_deref())?,
			cancel,
			quiet: self.global_opts.quiet || self.global_opts.silent,
		};

		use Command::*;
		let code = match self.command {
			Linktree(args) => args.exec(&session)?,
			Snap(args) => args.exec(&session)?,
			PullLocal(args) => args.exec(&session)?,
			PullMissing(args) => args.exec(&session)?,
			Remote(args) => args.exec()?,
		};

		info!("process exiting with status {code}");
		Ok(code)
	}

	fn init_logging(&self) {
		let mut logging_builder = env_logger::Builder::new();

		logging_builder
			.filter_level(log::LevelFilter::Warn)
			.format_timestamp_nanos()
			.parse_env(
				env_logger::Env::new()
					.filter("HISTBACKUP_LOG")
					.write_style("HISTBACKUP_LOG_STYLE"),
			);

		// Not using https://crates.io/crates/clap-verbosity-flag as the documentation suggests
		// it may not work with the [default -> env -> cli-args] override path
		let override_log_level = if self.global_opts.silent {
			Some(log::LevelFilter::Off)
		} else if self.global_opts.quiet {
			Some(log::LevelFilter::Error)
		} else {
			match self.global_opts.verbose {
				0 => None,
				1 => Some(log::LevelFilter::Info),
				2 => Some(log::LevelFilter::Debug),
				_ => Some(log::LevelFilter::Trace),
			}
		};

		if let Some(new_level) = override_log_level {
			logging_builder.filter_level(new_level);
		}

		logging_builder.init();
	}
}

/// Maps the legacy script names to subcommands, so e.g. a `histbackup-pull-local` symlink to the
/// binary behaves like `histbackup pull-local`
pub fn args_from_invocation<I: IntoIterator<Item = OsString>>(args: I) -> Vec<OsString> {
	let mut args: Vec<OsString> = args.into_iter().collect();
	let Some(argv0) = args.first() else {
		return args;
	};

	let invoked = Path::new(argv0)
		.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_default();
	let subcommand = match invoked.as_str() {
		"histbackup-pull-local" => "pull-local",
		"histbackup-pull-missing" => "pull-missing",
		"linktree" => "linktree",
		"rhistbackup" | "rrhistbackup" => "remote",
		_ => return args,
	};

	debug!("invoked as {invoked}, running {subcommand}");
	args.insert(1, subcommand.into());
	args
}

pub fn die(code: ExitCode, msg: &str) -> ! {
	log::error!("{}", msg);
	std::process::exit(code)
}
