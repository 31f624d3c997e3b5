//! Content fingerprints for installed environment trees.
//!
//! A fingerprint is a SHA-256 digest over a directory subtree where every
//! file contributes its raw name bytes and byte size (never its content)
//! and every subdirectory contributes its raw name followed by its own
//! fingerprint. Entries are sorted by name
//! before hashing, so two trees with the same shape hash identically no
//! matter what order the filesystem lists them in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Fixed-length digest of a directory subtree.
pub type Fingerprint = [u8; 32];

/// Folder path -> hex fingerprint, filled in for every visited directory.
pub type FingerprintIndex = HashMap<PathBuf, String>;

/// Folders regenerated at runtime whose contents must not affect identity.
fn is_dynamic_directory(folder: &Path, entry_name: &str) -> bool {
    let name = entry_name.to_lowercase();
    if name == "__pycache__" {
        return true;
    }
    let parent = folder
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    name == "gen" && parent == "comtypes"
}

/// Compute the fingerprint of `folder`.
///
/// When `collect` is given, the hex fingerprint of `folder` and of every
/// directory below it is recorded there. Any I/O error aborts the whole
/// computation; no partial digest is ever returned.
pub fn fingerprint(folder: &Path, mut collect: Option<&mut FingerprintIndex>) -> Result<Fingerprint> {
    let mut entries = std::fs::read_dir(folder)
        .with_context(|| format!("Failed to open {:?} for fingerprinting", folder))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("Failed to list {:?}", folder))?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut hasher = Sha256::new();
    for entry in entries {
        let raw_name = entry.file_name();
        let name = raw_name.to_string_lossy();
        // DirEntry::file_type does not follow symlinks, so links hash as files.
        let file_type = entry
            .file_type()
            .with_context(|| format!("Failed to stat {:?}", entry.path()))?;

        if file_type.is_dir() {
            if is_dynamic_directory(folder, &name) {
                continue;
            }
            let digest = fingerprint(&entry.path(), collect.as_deref_mut())?;
            hasher.update(raw_name.as_encoded_bytes());
            hasher.update(digest);
            continue;
        }

        let size = entry
            .metadata()
            .with_context(|| format!("Failed to stat {:?}", entry.path()))?
            .len();
        hasher.update(raw_name.as_encoded_bytes());
        hasher.update(format!(" -- {:x}", size).as_bytes());
    }

    let digest: Fingerprint = hasher.finalize().into();
    if let Some(index) = collect {
        index.insert(folder.to_path_buf(), hex::encode(digest));
    }
    Ok(digest)
}

/// Hex fingerprint of `folder`, shortened to the 16 characters used for
/// environment hash names.
pub fn short_fingerprint(folder: &Path) -> Result<String> {
    let digest = fingerprint(folder, None)?;
    Ok(hex::encode(&digest[..8]))
}
