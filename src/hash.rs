// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration content hashing.
//!
//! Change detection for the ACL, group, and policy-rule sources of a
//! project-config tree. Each source root follows a `{category}/{name}.{ext}`
//! layout, so the index hashes every file at exactly that depth and nothing
//! else. Digests are compared against the change cache to decide whether a
//! metadata push is due at all; they are never used to verify remote state.

use glob::glob;
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Content digests for every policy file under one configuration root.
///
/// A pure function of the filesystem contents at index time: hashing the
/// same tree twice yields the same index regardless of traversal order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HashIndex {
    digests: BTreeMap<PathBuf, String>,
}

impl HashIndex {
    /// Hash every file matching `{root}/*/*{extension}`.
    ///
    /// A missing root simply produces an empty index.
    ///
    /// # Errors
    ///
    /// - Return [`HashError::Pattern`] if the root produces an invalid glob
    ///   pattern.
    /// - Return [`HashError::Walk`] if a matched path cannot be visited.
    /// - Return [`HashError::ReadFile`] if a matched file cannot be read.
    pub fn index_dir(root: impl AsRef<Path>, extension: &str) -> Result<Self> {
        let pattern = format!("{}/*/*{}", root.as_ref().display(), extension);
        debug!("indexing configuration sources matching {pattern}");

        let mut digests = BTreeMap::new();
        for entry in glob(&pattern).map_err(|err| HashError::Pattern { source: err })? {
            let path = entry.map_err(|err| HashError::Walk { source: err })?;
            let contents = fs::read(&path).map_err(|err| HashError::ReadFile {
                source: err,
                path: path.clone(),
            })?;

            let digest = Sha256::digest(&contents);
            let digest = digest
                .iter()
                .map(|byte| format!("{byte:02x}"))
                .collect::<String>();
            digests.insert(path, digest);
        }

        Ok(Self { digests })
    }

    /// Entries whose path mentions `fragment`, in path order.
    pub fn matching(&self, fragment: &str) -> Vec<(&Path, &str)> {
        self.digests
            .iter()
            .filter(|(path, _)| path.to_string_lossy().contains(fragment))
            .map(|(path, digest)| (path.as_path(), digest.as_str()))
            .collect()
    }

    /// Number of indexed files.
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    /// Whether the index holds no files at all.
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

/// Configuration hashing error types.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// Configuration root produces an invalid glob pattern.
    #[error(transparent)]
    Pattern {
        #[from]
        source: glob::PatternError,
    },

    /// Matched path cannot be visited.
    #[error(transparent)]
    Walk {
        #[from]
        source: glob::GlobError,
    },

    /// Matched file cannot be read.
    #[error("failed to read configuration source {:?}", path.display())]
    ReadFile {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = HashError> = std::result::Result<T, E>;
