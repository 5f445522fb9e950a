// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Change cache.
//!
//! Regent's memory of prior runs: one small record per project of which
//! reconciliation steps have been confirmed against the remote side. The
//! cache is loaded once at the start of a run, mutated in memory while
//! projects are processed, and written back wholesale at the very end.
//! There is no per-field persistence, so a run that dies halfway loses its
//! own progress but can never corrupt the previously committed state of
//! other projects.
//!
//! A field is only ever assigned after the corresponding remote side effect
//! has been confirmed, never speculatively. The next run re-derives
//! whatever was left unconfirmed.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Persisted per-project reconciliation state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProjectRecord {
    /// Project is known to exist in the review service.
    pub project_created: bool,

    /// Initial history has been pushed to the review service.
    pub pushed_to_gerrit: bool,

    /// Digest of the last ACL source confirmed on the metadata ref.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acl_sha: Option<String>,

    /// Digest of the last group-definitions file applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups_sha: Option<String>,

    /// Digest of the last policy-rules source confirmed on the metadata ref.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_sha: Option<String>,

    /// Repository exists on the hosting side.
    pub created_in_github: bool,

    /// Hosting-side repository is linked to the review team.
    pub gerrit_in_team: bool,

    /// Last capability flags confirmed on the hosting side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_issues: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_wiki: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_downloads: Option<bool>,
}

/// Durable mapping from project name to reconciliation record.
#[derive(Debug)]
pub struct ProjectCache {
    path: PathBuf,
    records: BTreeMap<String, ProjectRecord>,
}

impl ProjectCache {
    /// Load the cache file at `path`.
    ///
    /// A missing file is a first run: every project starts from an empty
    /// record.
    ///
    /// # Errors
    ///
    /// - Return [`CacheError::ReadFile`] if the file exists but cannot be
    ///   read.
    /// - Return [`CacheError::Deserialize`] if the file holds malformed
    ///   JSON.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match fs::read_to_string(&path) {
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|err| CacheError::Deserialize {
                    source: err,
                    path: path.clone(),
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no cache file at {:?}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(err) => return Err(CacheError::ReadFile { source: err, path }),
        };

        Ok(Self { path, records })
    }

    /// Current record for `project`; empty record when never seen.
    pub fn record(&self, project: &str) -> ProjectRecord {
        self.records.get(project).cloned().unwrap_or_default()
    }

    /// Mutable record for `project`, created empty on first access.
    pub fn record_mut(&mut self, project: &str) -> &mut ProjectRecord {
        self.records.entry(project.to_owned()).or_default()
    }

    /// Serialize the whole table and atomically replace the cache file.
    ///
    /// The table is staged into a temporary file in the same directory and
    /// renamed over the target, so readers either see the previous table or
    /// the new one, never a truncated mix.
    ///
    /// # Errors
    ///
    /// - Return [`CacheError::Serialize`] if the table cannot be rendered.
    /// - Return [`CacheError::WriteFile`] if the staged file cannot be
    ///   written or persisted.
    pub fn flush(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        mkdirp::mkdirp(parent).map_err(|err| CacheError::WriteFile {
            source: err,
            path: self.path.clone(),
        })?;

        let contents =
            serde_json::to_string_pretty(&self.records).map_err(CacheError::Serialize)?;

        let mut staged = NamedTempFile::new_in(parent).map_err(|err| CacheError::WriteFile {
            source: err,
            path: self.path.clone(),
        })?;
        staged
            .write_all(contents.as_bytes())
            .map_err(|err| CacheError::WriteFile {
                source: err,
                path: self.path.clone(),
            })?;
        staged
            .persist(&self.path)
            .map_err(|err| CacheError::WriteFile {
                source: err.error,
                path: self.path.clone(),
            })?;

        info!("wrote cache file {:?}", self.path.display());
        Ok(())
    }
}

/// Change cache error types.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Cache file exists but cannot be read.
    #[error("failed to read cache file {:?}", path.display())]
    ReadFile {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Cache file holds malformed JSON.
    #[error("failed to parse cache file {:?}", path.display())]
    Deserialize {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },

    /// Cache table cannot be serialized.
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),

    /// Staged cache file cannot be written or persisted.
    #[error("failed to write cache file {:?}", path.display())]
    WriteFile {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn missing_cache_file_yields_empty_records() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let cache = ProjectCache::load(dir.path().join("project.cache"))?;

        assert_eq!(cache.record("openstack/nova"), ProjectRecord::default());

        Ok(())
    }

    #[test]
    fn flush_then_reload_round_trips_the_table() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("project.cache");

        let mut cache = ProjectCache::load(&path)?;
        {
            let record = cache.record_mut("openstack/nova");
            record.project_created = true;
            record.pushed_to_gerrit = true;
            record.acl_sha = Some("feedface".into());
        }
        cache.record_mut("openstack/glance").project_created = true;
        cache.flush()?;

        let reloaded = ProjectCache::load(&path)?;
        assert_eq!(reloaded.record("openstack/nova"), cache.record("openstack/nova"));
        assert_eq!(
            reloaded.record("openstack/glance"),
            cache.record("openstack/glance"),
        );
        assert_eq!(reloaded.record("openstack/cinder"), ProjectRecord::default());

        Ok(())
    }

    #[test]
    fn flush_replaces_the_previous_table_wholesale() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("project.cache");

        let mut cache = ProjectCache::load(&path)?;
        cache.record_mut("openstack/nova").project_created = true;
        cache.flush()?;

        let mut replacement = ProjectCache::load(&path)?;
        replacement.records.clear();
        replacement.record_mut("openstack/glance").project_created = true;
        replacement.flush()?;

        let reloaded = ProjectCache::load(&path)?;
        assert_eq!(reloaded.record("openstack/nova"), ProjectRecord::default());
        assert!(reloaded.record("openstack/glance").project_created);

        Ok(())
    }

    #[test]
    fn cache_file_uses_stable_field_names() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("project.cache");

        let mut cache = ProjectCache::load(&path)?;
        {
            let record = cache.record_mut("openstack/nova");
            record.project_created = true;
            record.acl_sha = Some("feedface".into());
            record.has_wiki = Some(false);
        }
        cache.flush()?;

        let contents = std::fs::read_to_string(&path)?;
        assert!(contents.contains("\"project-created\""));
        assert!(contents.contains("\"pushed-to-gerrit\""));
        assert!(contents.contains("\"acl-sha\""));
        assert!(contents.contains("\"has-wiki\""));

        Ok(())
    }
}
