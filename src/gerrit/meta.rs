// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Metadata branch transactions.
//!
//! Every project on the review server carries its access-control and
//! policy configuration on a special metadata ref (`refs/meta/config`),
//! editable only through an ordinary checkout/commit/push cycle. This
//! module wraps that cycle in a scoped transaction over a project's
//! working copy:
//!
//! 1. __Acquisition__ records the branch the working copy currently sits
//!    on, fetches the metadata ref into a local tracking ref, waits for
//!    the server to materialize `project.config` (it acknowledges project
//!    creation before writing the ref out), and force-creates a local
//!    `config` branch from it.
//! 2. The __body__ mutates the checked-out tree however it likes.
//! 3. __Release__ commits and pushes whatever the body left behind, then
//!    restores the original branch and deletes the `config` branch. The
//!    release phase runs on every exit path, so a working copy is never
//!    left sitting on the transactional branch for the next operation to
//!    trip over.
//!
//! Commit and push failures in the release phase are reported as a
//! [`MetaPush::Failed`] outcome rather than raised: callers must not treat
//! their source as applied, but the unwind has to finish regardless.

use crate::{
    config::GitIdentity,
    gerrit::{group_uuid, ReviewService},
    git::GitRunner,
    retry::{poll, Poll},
};

use regex::Regex;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, error, info, instrument, warn};

/// Local branch holding the checked-out metadata ref during a transaction.
const META_BRANCH: &str = "config";

/// Fetch refspec pinning the remote metadata ref to a local tracking ref.
const META_FETCH_REFSPEC: &str = "+refs/meta/config:refs/remotes/gerrit-meta/config";

/// Short name of the local tracking ref.
const META_TRACKING: &str = "remotes/gerrit-meta/config";

/// Branch restored when the original branch cannot be determined.
const FALLBACK_BRANCH: &str = "master";

const META_FETCH: Poll = Poll::new(10, Duration::from_secs(2));
const CONFIG_PRESENT: Poll = Poll::new(10, Duration::from_secs(2));

/// Outcome of the release phase of a metadata transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaPush {
    /// Working tree matched HEAD, nothing to push.
    Clean,

    /// Pending changes were committed and pushed.
    Pushed,

    /// Commit or push failed; the change never reached the remote.
    Failed,
}

impl MetaPush {
    /// Whether the remote is confirmed to match the local sources.
    pub fn confirmed(&self) -> bool {
        matches!(self, Self::Clean | Self::Pushed)
    }
}

/// Coordinates of one project's metadata ref.
#[derive(Clone, Copy, Debug)]
pub struct MetaTarget<'a> {
    pub workdir: &'a Path,
    pub project: &'a str,
    pub remote_url: &'a str,
    pub committer: &'a GitIdentity,
}

/// One checkout/modify/commit/push cycle against a project's metadata ref.
pub struct MetaConfig<'g, G: GitRunner> {
    git: &'g G,
    workdir: PathBuf,
    project: String,
    remote_url: String,
    committer: GitIdentity,
    original_branch: String,
}

impl<'g, G: GitRunner> MetaConfig<'g, G> {
    fn begin(git: &'g G, target: MetaTarget<'_>, fetch: Poll, present: Poll) -> Result<Self> {
        let head = git.git(target.workdir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        let original_branch = if head.ok() && !head.text.is_empty() {
            head.text.trim().to_owned()
        } else {
            FALLBACK_BRANCH.to_owned()
        };
        debug!("current branch is {original_branch}");

        let transaction = Self {
            git,
            workdir: target.workdir.to_path_buf(),
            project: target.project.to_owned(),
            remote_url: target.remote_url.to_owned(),
            committer: target.committer.clone(),
            original_branch,
        };
        transaction.fetch_meta_config(fetch, present)?;

        Ok(transaction)
    }

    /// Fetch and check out the remote metadata ref.
    ///
    /// Not idempotent: run once per working copy per transaction.
    fn fetch_meta_config(&self, fetch: Poll, present: Poll) -> Result<()> {
        // Poll for the metadata ref, as the server may not have written it
        // out for us yet.
        poll(fetch, |_| {
            match self
                .git
                .git_remote(&self.workdir, &["fetch", &self.remote_url, META_FETCH_REFSPEC])
            {
                Ok(fetched) if fetched.ok() => Some(()),
                _ => {
                    debug!(
                        "failed to fetch refs/meta/config for project: {}",
                        self.project
                    );
                    None
                }
            }
        })
        .ok_or_else(|| MetaError::FetchMetaRef {
            project: self.project.clone(),
        })?;

        // Poll for project.config, as the server may not have committed an
        // empty one yet.
        poll(present, |_| {
            match self
                .git
                .git_remote(&self.workdir, &["remote", "update", "--prune"])
            {
                Ok(updated) if updated.ok() => {}
                _ => {
                    warn!("failed to update remote: {}", self.remote_url);
                    return None;
                }
            }

            let listing = self
                .git
                .git(
                    &self.workdir,
                    &[
                        "ls-files",
                        &format!("--with-tree={META_TRACKING}"),
                        "project.config",
                    ],
                )
                .ok()?;
            if listing.ok() && listing.text.contains("project.config") {
                Some(())
            } else {
                debug!(
                    "failed to find project.config for project: {}",
                    self.project
                );
                None
            }
        })
        .ok_or_else(|| MetaError::ConfigMissing {
            project: self.project.clone(),
        })?;

        let checkout = self
            .git
            .git(&self.workdir, &["checkout", "-B", META_BRANCH, META_TRACKING])?;
        if !checkout.ok() {
            return Err(MetaError::CheckoutConfig {
                project: self.project.clone(),
            });
        }

        Ok(())
    }

    /// Copy `source` over `dest` in the working copy and stage it.
    ///
    /// Returns whether the copy actually changed the tree versus HEAD.
    ///
    /// # Errors
    ///
    /// - Return [`MetaError::MissingSource`] if `source` does not exist.
    /// - Return [`MetaError::CopySource`] if the copy itself fails.
    /// - Return [`MetaError::Stage`] if the staged add fails.
    pub fn stage_copy(&self, source: &Path, dest: &str) -> Result<bool> {
        if !source.is_file() {
            return Err(MetaError::MissingSource {
                path: source.to_path_buf(),
            });
        }

        fs::copy(source, self.workdir.join(dest)).map_err(|err| MetaError::CopySource {
            source: err,
            path: source.to_path_buf(),
        })?;

        let add = self.git.git(&self.workdir, &["add", dest])?;
        if !add.ok() {
            return Err(MetaError::Stage {
                file: dest.to_owned(),
                project: self.project.clone(),
            });
        }

        let status = self
            .git
            .git(&self.workdir, &["diff-index", "--quiet", "HEAD", "--"])?;
        Ok(!status.ok())
    }

    /// Resolve every group referenced by the staged `project.config` and
    /// stage a `groups` file mapping identifiers to names.
    ///
    /// # Errors
    ///
    /// - Return [`MetaError::ReadStagedConfig`] if the staged ACL cannot be
    ///   read back.
    /// - Return [`MetaError::Gerrit`] if a group cannot be resolved.
    /// - Return [`MetaError::WriteGroups`] / [`MetaError::Stage`] if the
    ///   mapping cannot be written or staged.
    pub fn stage_group_mapping(&self, service: &impl ReviewService) -> Result<()> {
        let acl_path = self.workdir.join("project.config");
        let contents =
            fs::read_to_string(&acl_path).map_err(|err| MetaError::ReadStagedConfig {
                source: err,
            })?;

        let reference = Regex::new(r"(?m)^.*\sgroup\s+(.*)$").expect("group reference pattern");
        let mut uuids = BTreeMap::new();
        for captures in reference.captures_iter(&contents) {
            let group = captures[1].trim();
            if uuids.contains_key(group) {
                continue;
            }

            let uuid = group_uuid(service, group).map_err(|err| {
                error!("unable to get UUID for group {group}");
                MetaError::Gerrit(err)
            })?;
            uuids.insert(group.to_owned(), uuid);
        }

        if uuids.is_empty() {
            return Ok(());
        }

        let mut mapping = String::new();
        for (group, uuid) in &uuids {
            mapping.push_str(&format!("{uuid}\t{group}\n"));
        }
        fs::write(self.workdir.join("groups"), mapping)
            .map_err(|err| MetaError::WriteGroups { source: err })?;

        let add = self.git.git(&self.workdir, &["add", "groups"])?;
        if !add.ok() {
            return Err(MetaError::Stage {
                file: "groups".to_owned(),
                project: self.project.clone(),
            });
        }

        Ok(())
    }

    /// Release phase: commit and push whatever the body left in the tree.
    fn push_meta_config(&self) -> MetaPush {
        let Ok(status) = self
            .git
            .git(&self.workdir, &["diff-index", "--quiet", "HEAD", "--"])
        else {
            return MetaPush::Failed;
        };
        if status.ok() {
            info!("no changes to push for project: {}", self.project);
            return MetaPush::Clean;
        }

        let author = format!("--author={}", self.committer);
        let committed = self.git.git(
            &self.workdir,
            &["commit", "-a", "-m", "Update project config.", &author],
        );
        match committed {
            Ok(committed) if committed.ok() => {}
            _ => {
                error!("failed to commit config for project: {}", self.project);
                return MetaPush::Failed;
            }
        }

        let pushed = self.git.git_remote(
            &self.workdir,
            &["push", &self.remote_url, "HEAD:refs/meta/config"],
        );
        match pushed {
            Ok(pushed) if pushed.ok() => {
                info!("pushed metadata config for project: {}", self.project);
                MetaPush::Pushed
            }
            _ => {
                error!("failed to push config for project: {}", self.project);
                MetaPush::Failed
            }
        }
    }

    /// Restore the working copy to its pre-transaction branch state and
    /// drop the temporary `config` branch. Failures here are logged; there
    /// is nothing left to unwind.
    fn cleanup(&self) {
        let restore = [
            vec!["reset", "--hard"],
            vec!["checkout", self.original_branch.as_str()],
            vec!["branch", "-D", META_BRANCH],
        ];
        for args in &restore {
            match self.git.git(&self.workdir, args) {
                Ok(output) if output.ok() => {}
                _ => warn!(
                    "cleanup step 'git {}' failed for project: {}",
                    args.join(" "),
                    self.project
                ),
            }
        }
    }
}

/// Run `body` inside a metadata transaction against `target`.
///
/// Acquisition failures are fatal and skip the body entirely. Once the
/// body has run, release and cleanup execute no matter how it exited; a
/// body error propagates only after the working copy is restored.
pub fn with_meta_config<G, F>(git: &G, target: MetaTarget<'_>, body: F) -> Result<MetaPush>
where
    G: GitRunner,
    F: FnOnce(&MetaConfig<'_, G>) -> Result<()>,
{
    with_meta_config_scheduled(git, target, META_FETCH, CONFIG_PRESENT, body)
}

pub(crate) fn with_meta_config_scheduled<G, F>(
    git: &G,
    target: MetaTarget<'_>,
    fetch: Poll,
    present: Poll,
    body: F,
) -> Result<MetaPush>
where
    G: GitRunner,
    F: FnOnce(&MetaConfig<'_, G>) -> Result<()>,
{
    let transaction = MetaConfig::begin(git, target, fetch, present)?;

    let outcome = body(&transaction);
    if let Err(error) = &outcome {
        warn!(
            "exception processing metadata for project {}: {error}",
            transaction.project
        );
    }

    let push = transaction.push_meta_config();
    transaction.cleanup();
    outcome?;

    Ok(push)
}

/// Push a project's access-control configuration to its metadata ref.
///
/// No-op (with a warning) when the ACL source is missing. When the copied
/// ACL actually changes the tree, every group it references is resolved to
/// a stable identifier and a generated mapping file rides along in the
/// same commit.
#[instrument(skip(git, service, target, acl_source))]
pub fn apply_acl_config<G: GitRunner, R: ReviewService>(
    git: &G,
    service: &R,
    target: MetaTarget<'_>,
    acl_source: &Path,
) -> Result<MetaPush> {
    if !acl_source.is_file() {
        warn!("ACL config was not found, {:?}", acl_source.display());
        return Ok(MetaPush::Clean);
    }

    with_meta_config(git, target, |transaction| {
        if !transaction.stage_copy(acl_source, "project.config")? {
            // Nothing was modified, so we're done.
            return Ok(());
        }
        transaction.stage_group_mapping(service)
    })
}

/// Push a project's policy-rules file to its metadata ref as `rules.pl`.
#[instrument(skip(git, target, rules_source))]
pub fn apply_rules<G: GitRunner>(
    git: &G,
    target: MetaTarget<'_>,
    rules_source: &Path,
) -> Result<MetaPush> {
    if !rules_source.is_file() {
        warn!("policy rules file was not found, {:?}", rules_source.display());
        return Ok(MetaPush::Clean);
    }

    with_meta_config(git, target, |transaction| {
        transaction.stage_copy(rules_source, "rules.pl")?;
        Ok(())
    })
}

/// Metadata transaction error types.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// Remote metadata ref never became fetchable.
    #[error("failed to fetch refs/meta/config for project {project}")]
    FetchMetaRef { project: String },

    /// Remote accepted the project but never materialized project.config.
    #[error("failed to find project.config for project {project}")]
    ConfigMissing { project: String },

    /// Local `config` branch cannot be created from the tracking ref.
    #[error("failed to checkout config for project {project}")]
    CheckoutConfig { project: String },

    /// Source file for a metadata push is absent.
    #[error("missing metadata source {:?}", path.display())]
    MissingSource { path: PathBuf },

    /// Source file cannot be copied into the working copy.
    #[error("failed to copy {:?} into working copy", path.display())]
    CopySource {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Copied file cannot be staged.
    #[error("failed to stage {file} for project {project}")]
    Stage { file: String, project: String },

    /// Staged project.config cannot be read back for group scanning.
    #[error("failed to read staged project.config")]
    ReadStagedConfig {
        #[source]
        source: std::io::Error,
    },

    /// Group mapping file cannot be written.
    #[error("failed to write group mapping file")]
    WriteGroups {
        #[source]
        source: std::io::Error,
    },

    /// Review service operation failed.
    #[error(transparent)]
    Gerrit(#[from] crate::gerrit::GerritError),

    /// Git invocation failed outright.
    #[error(transparent)]
    Git(#[from] crate::git::GitError),
}

/// Friendly result alias :3
type Result<T, E = MetaError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{gerrit::stub::StubReview, git::stub::StubGit};
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn committer() -> GitIdentity {
        "Project Creator <infra@example.org>".parse().unwrap()
    }

    fn fast() -> Poll {
        Poll::new(3, Duration::ZERO)
    }

    fn target<'a>(workdir: &'a Path, committer: &'a GitIdentity) -> MetaTarget<'a> {
        MetaTarget {
            workdir,
            project: "openstack/nova",
            remote_url: "ssh://reviewbot@review.example.org:29418/openstack/nova",
            committer,
        }
    }

    /// Ready a stub where acquisition succeeds on the first attempt.
    fn acquirable() -> StubGit {
        let git = StubGit::new();
        git.respond("rev-parse --abbrev-ref HEAD", 0, "main");
        git.respond("ls-files", 0, "project.config");
        git
    }

    #[test]
    fn transaction_restores_branch_after_clean_body() -> anyhow::Result<()> {
        let workdir = TempDir::new()?;
        let git = acquirable();
        let committer = committer();

        let push = with_meta_config(&git, target(workdir.path(), &committer), |_| Ok(()))?;

        assert_eq!(push, MetaPush::Clean);
        let calls = git.calls();
        assert!(calls.iter().any(|call| call == "checkout -B config remotes/gerrit-meta/config"));
        assert!(calls.iter().any(|call| call == "reset --hard"));
        assert!(calls.iter().any(|call| call == "checkout main"));
        assert_eq!(calls.last().unwrap(), "branch -D config");

        Ok(())
    }

    #[test]
    fn transaction_restores_branch_after_body_error() -> anyhow::Result<()> {
        let workdir = TempDir::new()?;
        let git = acquirable();
        let committer = committer();

        let result = with_meta_config(&git, target(workdir.path(), &committer), |_| {
            Err(MetaError::MissingSource {
                path: PathBuf::from("/nowhere"),
            })
        });

        assert!(result.is_err());
        let calls = git.calls();
        assert!(calls.iter().any(|call| call == "reset --hard"));
        assert!(calls.iter().any(|call| call == "checkout main"));
        assert_eq!(calls.last().unwrap(), "branch -D config");

        Ok(())
    }

    #[test]
    fn transaction_restores_branch_after_push_failure() -> anyhow::Result<()> {
        let workdir = TempDir::new()?;
        let git = acquirable();
        git.respond("diff-index", 1, "");
        git.respond("push", 1, "remote hung up");
        let committer = committer();

        let push = with_meta_config(&git, target(workdir.path(), &committer), |_| Ok(()))?;

        assert_eq!(push, MetaPush::Failed);
        let calls = git.calls();
        assert!(calls.iter().any(|call| call.starts_with("commit -a")));
        assert!(calls.iter().any(|call| call == "reset --hard"));
        assert!(calls.iter().any(|call| call == "checkout main"));
        assert_eq!(calls.last().unwrap(), "branch -D config");

        Ok(())
    }

    #[test]
    fn dirty_tree_is_committed_and_pushed() -> anyhow::Result<()> {
        let workdir = TempDir::new()?;
        let git = acquirable();
        git.respond("diff-index", 1, "");
        let committer = committer();

        let push = with_meta_config(&git, target(workdir.path(), &committer), |_| Ok(()))?;

        assert_eq!(push, MetaPush::Pushed);
        let commits = git.calls_containing("commit -a");
        assert_eq!(commits.len(), 1);
        assert!(commits[0].contains("--author=Project Creator <infra@example.org>"));
        assert_eq!(
            git.calls_containing("push").as_slice(),
            ["push ssh://reviewbot@review.example.org:29418/openstack/nova HEAD:refs/meta/config"],
        );

        Ok(())
    }

    #[test]
    fn fetch_exhaustion_is_fatal_and_skips_the_body() -> anyhow::Result<()> {
        let workdir = TempDir::new()?;
        let git = StubGit::new();
        git.respond("rev-parse --abbrev-ref HEAD", 0, "main");
        git.respond("fetch", 1, "fatal: couldn't find remote ref");
        let committer = committer();

        let mut entered = false;
        let result = with_meta_config_scheduled(
            &git,
            target(workdir.path(), &committer),
            fast(),
            fast(),
            |_| {
                entered = true;
                Ok(())
            },
        );

        assert!(matches!(result, Err(MetaError::FetchMetaRef { .. })));
        assert!(!entered);
        assert_eq!(git.calls_containing("fetch").len(), 3);

        Ok(())
    }

    #[test]
    fn missing_project_config_is_fatal() -> anyhow::Result<()> {
        let workdir = TempDir::new()?;
        let git = StubGit::new();
        git.respond("rev-parse --abbrev-ref HEAD", 0, "main");
        git.respond("ls-files", 0, "");
        let committer = committer();

        let result = with_meta_config_scheduled(
            &git,
            target(workdir.path(), &committer),
            fast(),
            fast(),
            |_| Ok(()),
        );

        assert!(matches!(result, Err(MetaError::ConfigMissing { .. })));

        Ok(())
    }

    #[test]
    fn fetch_retries_until_the_ref_materializes() -> anyhow::Result<()> {
        let workdir = TempDir::new()?;
        let git = acquirable();
        git.respond_once("fetch", 1, "fatal: couldn't find remote ref");
        git.respond_once("fetch", 1, "fatal: couldn't find remote ref");
        let committer = committer();

        let push = with_meta_config_scheduled(
            &git,
            target(workdir.path(), &committer),
            fast(),
            fast(),
            |_| Ok(()),
        )?;

        assert_eq!(push, MetaPush::Clean);
        assert_eq!(git.calls_containing("fetch").len(), 3);

        Ok(())
    }

    #[test]
    fn apply_acl_config_skips_missing_source() -> anyhow::Result<()> {
        let workdir = TempDir::new()?;
        let git = StubGit::new();
        let service = StubReview::new();
        let committer = committer();

        let push = apply_acl_config(
            &git,
            &service,
            target(workdir.path(), &committer),
            Path::new("/nowhere/nova.config"),
        )?;

        assert_eq!(push, MetaPush::Clean);
        assert!(git.calls().is_empty());

        Ok(())
    }

    #[test]
    fn apply_acl_config_stages_acl_and_group_mapping() -> anyhow::Result<()> {
        let workdir = TempDir::new()?;
        let sources = TempDir::new()?;
        let acl = sources.path().join("nova.config");
        std::fs::write(
            &acl,
            indoc! {"
                [access \"refs/heads/*\"]
                \tread = group nova-core
                \tlabel-Code-Review = -2..+2 group nova-core
                \tread = group Registered Users
            "},
        )?;

        let git = acquirable();
        git.respond("diff-index", 1, "");
        let service = StubReview::new().with_group("nova-core", "41818067");
        let committer = committer();

        let push = apply_acl_config(&git, &service, target(workdir.path(), &committer), &acl)?;

        assert_eq!(push, MetaPush::Pushed);
        assert!(workdir.path().join("project.config").exists());

        let mapping = std::fs::read_to_string(workdir.path().join("groups"))?;
        assert_eq!(
            mapping,
            "global:Registered-Users\tRegistered Users\n41818067\tnova-core\n",
        );
        assert!(git.calls().iter().any(|call| call == "add project.config"));
        assert!(git.calls().iter().any(|call| call == "add groups"));

        Ok(())
    }

    #[test]
    fn unchanged_acl_skips_group_resolution() -> anyhow::Result<()> {
        let workdir = TempDir::new()?;
        let sources = TempDir::new()?;
        let acl = sources.path().join("nova.config");
        std::fs::write(&acl, "[access]\n\tread = group nova-core\n")?;

        // diff-index stays clean: the copied ACL matches HEAD already.
        let git = acquirable();
        let service = StubReview::new();
        let committer = committer();

        let push = apply_acl_config(&git, &service, target(workdir.path(), &committer), &acl)?;

        assert_eq!(push, MetaPush::Clean);
        assert!(!workdir.path().join("groups").exists());
        assert!(service.created_groups.borrow().is_empty());

        Ok(())
    }

    #[test]
    fn apply_rules_copies_unconditionally() -> anyhow::Result<()> {
        let workdir = TempDir::new()?;
        let sources = TempDir::new()?;
        let rules = sources.path().join("nova.pl");
        std::fs::write(&rules, "submit_rule(submit(R)).\n")?;

        let git = acquirable();
        git.respond("diff-index", 1, "");
        let committer = committer();

        let push = apply_rules(&git, target(workdir.path(), &committer), &rules)?;

        assert_eq!(push, MetaPush::Pushed);
        assert!(workdir.path().join("rules.pl").exists());
        assert!(git.calls().iter().any(|call| call == "add rules.pl"));

        Ok(())
    }
}
