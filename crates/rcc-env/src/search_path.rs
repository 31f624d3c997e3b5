//! Ordered executable search path used to build an isolated `PATH`.
//!
//! Every operation returns a new [`SearchPath`]; the receiver is never
//! modified, so one captured system path can seed any number of
//! environment assemblies.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

#[cfg(windows)]
const PATH_LIST_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const PATH_LIST_SEPARATOR: &str = ":";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPath {
    entries: Vec<PathBuf>,
}

impl SearchPath {
    pub fn new<I, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    /// Capture the `PATH` inherited by this process.
    pub fn from_system_path() -> Self {
        match std::env::var_os("PATH") {
            Some(value) => Self::from_value(&value),
            None => Self::default(),
        }
    }

    /// Split a platform path-list value (as found in `PATH`).
    pub fn from_value(value: &OsStr) -> Self {
        Self::new(std::env::split_paths(value))
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry whose final component equals one of `names`.
    ///
    /// Matching is case-sensitive and only looks at the base name, so
    /// `remove(&["conda"])` drops `/opt/conda` but keeps `/opt/conda/bin`.
    pub fn remove(&self, names: &[&str]) -> Self {
        let kept = self.entries.iter().filter(|entry| {
            let base = entry.file_name().and_then(OsStr::to_str);
            !matches!(base, Some(base) if names.contains(&base))
        });
        Self::new(unique(kept.cloned()))
    }

    /// Put `dirs` in front of the current entries, keeping their order.
    ///
    /// An entry that already appears earlier in the result is not added
    /// again.
    pub fn prepend<I, P>(&self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let front = dirs.into_iter().map(Into::into);
        Self::new(unique(front.chain(self.entries.iter().cloned())))
    }

    /// Find `name` + one of `extensions` in the first entry that has it.
    ///
    /// Entries are scanned in order; inside an entry, extensions are tried
    /// in the given order. Pass `&[""]` on platforms without executable
    /// suffixes.
    pub fn which(&self, name: &str, extensions: &[&str]) -> Option<PathBuf> {
        self.entries.iter().find_map(|entry| {
            extensions
                .iter()
                .map(|extension| entry.join(format!("{}{}", name, extension)))
                .find(|candidate| candidate.is_file())
        })
    }

    /// Joined path list, e.g. `/env/bin:/usr/bin`.
    pub fn joined(&self) -> String {
        self.entries
            .iter()
            .map(|entry| entry.to_string_lossy())
            .collect::<Vec<_>>()
            .join(PATH_LIST_SEPARATOR)
    }

    /// Render as a `NAME=joined-path-list` environment entry.
    pub fn as_environmental(&self, name: &str) -> String {
        format!("{}={}", name, self.joined())
    }

    pub fn contains(&self, entry: &Path) -> bool {
        self.entries.iter().any(|existing| existing == entry)
    }
}

fn unique<I: IntoIterator<Item = PathBuf>>(entries: I) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();
    for entry in entries {
        if !result.contains(&entry) {
            result.push(entry);
        }
    }
    result
}
