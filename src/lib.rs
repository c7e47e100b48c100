pub mod cli;
pub mod config;
pub mod file;
pub mod remote;
pub mod repo;
pub mod sync;
pub mod util;

/// Exit status of a run in which at least one unit of work failed
pub const EXIT_FAILURE: exitcode::ExitCode = 1;

/// Exit status for usage errors. Matches what clap uses for malformed arguments.
pub const EXIT_USAGE: exitcode::ExitCode = 2;
