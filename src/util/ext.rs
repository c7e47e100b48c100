use std::{
	ffi::OsString,
	os::unix::prelude::{OsStrExt, OsStringExt},
	path::{Path, PathBuf},
};

pub trait PathExt {
	fn tilde_expand(&self) -> PathBuf;
	/// The path with exactly one trailing `/`, which is how rsync is told to copy a directory's
	/// contents rather than the directory itself
	fn with_trailing_slash(&self) -> OsString;
	/// First normal component below `base`, e.g. the host directory of `base/host/tree`
	fn first_component_below(&self, base: &Path) -> Option<String>;
}

impl PathExt for Path {
	fn tilde_expand(&self) -> PathBuf {
		OsString::from_vec(tilde_expand::tilde_expand(self.as_os_str().as_bytes())).into()
	}

	fn with_trailing_slash(&self) -> OsString {
		let mut bytes = self.as_os_str().as_bytes().to_vec();
		while bytes.len() > 1 && bytes.last() == Some(&b'/') {
			bytes.pop();
		}
		if bytes.last() != Some(&b'/') {
			bytes.push(b'/');
		}
		OsString::from_vec(bytes)
	}

	fn first_component_below(&self, base: &Path) -> Option<String> {
		self.strip_prefix(base)
			.ok()?
			.components()
			.find_map(|c| match c {
				std::path::Component::Normal(c) => Some(c.to_string_lossy().into_owned()),
				_ => None,
			})
	}
}
