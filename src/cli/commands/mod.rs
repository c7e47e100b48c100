pub mod linktree;
pub mod pull_local;
pub mod pull_missing;
pub mod remote;
pub mod snap;
