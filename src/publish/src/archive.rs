//! Image set archive reading.
//!
//! An image set is one tar file or a directory tree containing several tar
//! files (split archives). The reader builds a file index mapping each
//! logical archive-relative path to the tar that carries it, then extracts
//! entries on demand, preserving their relative paths.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use tar::Archive;

use setmirror_core::error::{MirrorError, Result};

/// Index over one or many tar archives on disk.
#[derive(Debug, Default)]
pub struct ArchiveReader {
    /// Logical archive-relative path -> tar file that contains it
    index: HashMap<String, PathBuf>,
}

impl ArchiveReader {
    /// Build the file index for `path`, which is either a single tar file
    /// or a directory tree containing tar files.
    pub fn index(path: &Path) -> Result<Self> {
        let mut reader = ArchiveReader::default();

        let info = std::fs::metadata(path)?;
        if info.is_dir() {
            index_dir(path, &mut reader.index)?;
        } else {
            index_tar(path, &mut reader.index)?;
        }

        tracing::debug!(
            archive = %path.display(),
            entries = reader.index.len(),
            "Indexed image set archive"
        );
        Ok(reader)
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// True when the archive carries `logical`.
    pub fn contains(&self, logical: &str) -> bool {
        self.index.contains_key(logical)
    }

    /// True when any entry lives under `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        let want = normalize_prefix(prefix);
        self.index.keys().any(|k| k.starts_with(&want))
    }

    /// Extract one named entry into `dest`, preserving its relative path.
    ///
    /// Returns the path of the extracted file. A logical path missing from
    /// every tar yields [`MirrorError::ArchiveEntryNotFound`], which the
    /// blob reconciler branches on.
    pub fn extract(&self, logical: &str, dest: &Path) -> Result<PathBuf> {
        let tar_path = self
            .index
            .get(logical)
            .ok_or_else(|| MirrorError::ArchiveEntryNotFound {
                path: logical.to_string(),
            })?;

        let extracted = self.extract_matching(tar_path, dest, |entry| entry == logical)?;
        if extracted == 0 {
            // Index said the tar owns the entry but a re-read disagreed.
            return Err(MirrorError::ArchiveCorrupt {
                path: tar_path.display().to_string(),
                message: format!("indexed entry {} vanished", logical),
            });
        }

        let out = dest.join(logical);
        // The entry must be readable where the caller expects it.
        std::fs::metadata(&out)?;
        Ok(out)
    }

    /// Extract every entry under `prefix` into `dest`. Returns the number
    /// of files extracted; zero means the archive simply does not carry
    /// the tree, which is not an error.
    pub fn extract_prefix(&self, prefix: &str, dest: &Path) -> Result<usize> {
        let want = normalize_prefix(prefix);
        let tars: Vec<&PathBuf> = {
            let mut seen: Vec<&PathBuf> = self
                .index
                .iter()
                .filter(|(k, _)| k.starts_with(&want))
                .map(|(_, v)| v)
                .collect();
            seen.sort();
            seen.dedup();
            seen
        };

        let mut count = 0;
        for tar_path in tars {
            count += self.extract_matching(tar_path, dest, |entry| entry.starts_with(&want))?;
        }
        Ok(count)
    }

    /// Extract every entry except those under one of the `exclude`
    /// prefixes into `dest`. Used for the eager unpack of metadata and
    /// control files.
    pub fn unpack_all(&self, dest: &Path, exclude: &[&str]) -> Result<()> {
        let excluded: Vec<String> = exclude.iter().map(|p| normalize_prefix(p)).collect();
        let tars: Vec<&PathBuf> = {
            let mut seen: Vec<&PathBuf> = self.index.values().collect();
            seen.sort();
            seen.dedup();
            seen
        };

        for tar_path in tars {
            tracing::debug!(archive = %tar_path.display(), "Extracting archive");
            self.extract_matching(tar_path, dest, |entry| {
                !excluded.iter().any(|p| entry.starts_with(p.as_str()))
            })?;
        }
        Ok(())
    }

    /// Extract entries of one tar for which `want` returns true.
    fn extract_matching<F>(&self, tar_path: &Path, dest: &Path, want: F) -> Result<usize>
    where
        F: Fn(&str) -> bool,
    {
        std::fs::create_dir_all(dest)?;
        let file = File::open(tar_path)?;
        let mut archive = Archive::new(file);

        let mut count = 0;
        let entries = archive.entries().map_err(|e| MirrorError::ArchiveCorrupt {
            path: tar_path.display().to_string(),
            message: e.to_string(),
        })?;
        for entry in entries {
            let mut entry = entry.map_err(|e| MirrorError::ArchiveCorrupt {
                path: tar_path.display().to_string(),
                message: e.to_string(),
            })?;
            let name = entry_name(&entry, tar_path)?;
            if !want(&name) {
                continue;
            }
            entry.unpack_in(dest)?;
            if entry.header().entry_type().is_file() {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Logical name of a tar entry, normalized to forward slashes without a
/// leading `./`.
fn entry_name(entry: &tar::Entry<'_, File>, tar_path: &Path) -> Result<String> {
    let path = entry.path().map_err(|e| MirrorError::ArchiveCorrupt {
        path: tar_path.display().to_string(),
        message: e.to_string(),
    })?;
    let name = path.to_string_lossy().replace('\\', "/");
    Ok(name.trim_start_matches("./").to_string())
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    format!("{}/", trimmed)
}

/// Record every file entry of one tar into the index.
fn index_tar(tar_path: &Path, index: &mut HashMap<String, PathBuf>) -> Result<()> {
    let file = File::open(tar_path)?;
    let mut archive = Archive::new(file);

    let entries = archive.entries().map_err(|e| MirrorError::ArchiveCorrupt {
        path: tar_path.display().to_string(),
        message: e.to_string(),
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| MirrorError::ArchiveCorrupt {
            path: tar_path.display().to_string(),
            message: e.to_string(),
        })?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry_name(&entry, tar_path)?;
        index.insert(name, tar_path.to_path_buf());
    }
    Ok(())
}

/// Walk a directory tree indexing every `.tar` file found.
fn index_dir(dir: &Path, index: &mut HashMap<String, PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            index_dir(&path, index)?;
        } else if path.extension().map(|e| e == "tar").unwrap_or(false) {
            index_tar(&path, index)?;
        }
    }
    Ok(())
}
