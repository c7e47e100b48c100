use std::path::PathBuf;

use clap::Args;
use exitcode::ExitCode;

use crate::{cli::Session, file::linker::Linker, EXIT_FAILURE};

#[derive(Debug, Args)]
pub struct LinktreeArgs {
	/// Count files that can't be hard linked as failures instead of copying them
	#[arg(long)]
	no_copy: bool,

	/// Directory to mirror
	src: PathBuf,

	/// Mirror to create. Must not exist
	dest: PathBuf,
}

impl LinktreeArgs {
	pub fn exec(self, session: &Session) -> anyhow::Result<ExitCode> {
		let linker = Linker {
			copy: !self.no_copy,
			cancel: session.cancel.clone(),
		};
		let report = linker.link_tree(&self.src, &self.dest)?;

		Ok(if report.is_clean() {
			exitcode::OK
		} else {
			EXIT_FAILURE
		})
	}
}
