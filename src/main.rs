use clap::Parser;

use histbackup::cli::{args_from_invocation, Histbackup};

fn main() {
	let cli = Histbackup::parse_from(args_from_invocation(std::env::args_os()));

	let code = match cli.exec() {
		Ok(code) => code,
		Err(e) => {
			log::error!("{e:#}");
			histbackup::EXIT_FAILURE
		}
	};

	std::process::exit(code)
}
