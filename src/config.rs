//! Optional TOML configuration: `--config`, else `$HISTBACKUP_CONFIG`, else `~/.histbackup.toml`

use std::{
	io,
	path::{Path, PathBuf},
};

use anyhow::Context;
use log::{debug, trace};
use serde::Deserialize;

use crate::util::ext::PathExt;

pub const ENV_VAR: &str = "HISTBACKUP_CONFIG";
pub const DEFAULT_PATH: &str = "~/.histbackup.toml";

/// rsync refuses more than 20 `--link-dest` arguments
pub const MAX_REFERENCES: usize = 20;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
	pub references: ReferenceCfg,
	pub excludes: Vec<ExcludeCfg>,
	pub transfer: TransferCfg,
}

/// Where `--link-dest` candidates come from, in priority order
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceKind {
	/// Nearest earlier complete snapshot in the same root
	Previous,
	/// Target of the root's `LATEST`
	Latest,
	/// Nearest later complete snapshot in the same root, for reverse-order pulls
	Next,
	/// The same name in each sibling root
	SiblingSameDate,
	/// `LATEST` of each sibling root
	SiblingLatest,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReferenceCfg {
	pub max: usize,
	pub order: Vec<ReferenceKind>,
}

impl Default for ReferenceCfg {
	fn default() -> Self {
		use ReferenceKind::*;
		ReferenceCfg {
			max: MAX_REFERENCES,
			order: vec![Previous, Latest, Next, SiblingSameDate, SiblingLatest],
		}
	}
}

/// Extra `--exclude`s for destinations with a path component matching `component`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExcludeCfg {
	#[serde(deserialize_with = "de_pattern")]
	pub component: glob::Pattern,
	pub patterns: Vec<String>,
}

fn de_pattern<'de, D: serde::Deserializer<'de>>(de: D) -> Result<glob::Pattern, D::Error> {
	let s = String::deserialize(de)?;
	glob::Pattern::new(&s).map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferCfg {
	/// Program name or path of the transfer tool
	pub rsync: PathBuf,
	/// Passed to every invocation, before our own filters
	pub extra_args: Vec<String>,
}

impl Default for TransferCfg {
	fn default() -> Self {
		TransferCfg {
			rsync: PathBuf::from("rsync"),
			extra_args: Vec::new(),
		}
	}
}

impl Config {
	/// A missing file is only an error if it was asked for explicitly
	pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
		let (path, required) = match explicit {
			Some(p) => (p.tilde_expand(), true),
			None => match std::env::var_os(ENV_VAR) {
				Some(p) => (Path::new(&p).tilde_expand(), true),
				None => (Path::new(DEFAULT_PATH).tilde_expand(), false),
			},
		};

		let text = match std::fs::read_to_string(&path) {
			Ok(text) => text,
			Err(e) if e.kind() == io::ErrorKind::NotFound && !required => {
				debug!("no config at {path:?}, using defaults");
				return Ok(Config::default());
			}
			Err(e) => return Err(e).with_context(|| format!("reading config {path:?}")),
		};

		debug!("loading config {path:?}");
		let config: Config =
			toml::from_str(&text).with_context(|| format!("parsing config {path:?}"))?;
		config.validate().with_context(|| format!("in config {path:?}"))?;
		trace!("{config:?}");
		Ok(config)
	}

	pub fn validate(&self) -> anyhow::Result<()> {
		if self.references.max > MAX_REFERENCES {
			anyhow::bail!(
				"references.max = {} exceeds the transfer tool's limit of {MAX_REFERENCES}",
				self.references.max
			);
		}
		Ok(())
	}

	/// Excludes from every table entry whose component pattern matches a component of `dest`
	pub fn excludes_for(&self, dest: &Path) -> Vec<String> {
		let mut result = Vec::new();
		for rule in &self.excludes {
			let hit = dest
				.components()
				.filter_map(|c| c.as_os_str().to_str())
				.any(|c| rule.component.matches(c));
			if hit {
				debug!("{dest:?} matches exclude rule {:?}", rule.component.as_str());
				result.extend(rule.patterns.iter().cloned());
			}
		}
		result
	}
}
