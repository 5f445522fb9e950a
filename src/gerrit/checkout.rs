// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Working copy reconciliation.
//!
//! Produce and maintain the local working copy of a declared project.
//! Three acquisition strategies are tried in priority order:
//!
//! 1. __Review-server-backed__: the review service already knows the
//!    project, so clone straight from it. A failed clone falls through to
//!    the next strategy; the service may claim the project exists while
//!    its refs are still unusable.
//! 2. __Upstream-import__: the project declares an upstream, so clone
//!    that, park its history under `refs/copy/heads/*`, and rewire the
//!    remotes so the review service becomes `origin` and the source
//!    becomes `upstream`. The push back to the review service is deferred
//!    to the caller, which gates it on an integrity check first.
//! 3. __Fresh-init__: nothing exists anywhere, so initialize an empty
//!    repository with a committed remote descriptor file.
//!
//! Whatever the path, the working copy ends up with the service's
//! committer identity so every generated commit carries it.

use crate::{config::GitIdentity, gerrit::ReviewService, git::GitRunner};

use git2::Repository;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, instrument, warn};

/// Refspec pushed after a first-time upstream import.
const IMPORT_REFSPEC: &str = "+refs/copy/heads/*:refs/heads/*";

/// Refspec pushed after initializing a brand new project.
const INITIAL_REFSPEC: &str = "HEAD:refs/heads/master";

/// Deferred push instruction produced by [`Checkout::make_local_copy`].
///
/// The push is deferred so the caller can run the integrity check before
/// anything reaches the review service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushSpec {
    refspec: &'static str,
}

impl PushSpec {
    /// Refspec to apply against the review remote.
    pub fn refspec(&self) -> &str {
        self.refspec
    }
}

/// Review-side coordinates of a project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReviewRemote {
    /// Git remote URL over the review transport.
    pub url: String,

    /// Review service SSH host, for the generated descriptor file.
    pub host: String,

    /// Review service SSH port, for the generated descriptor file.
    pub port: u16,
}

/// Working copy bound to one declared project.
pub struct Checkout<'g, G: GitRunner> {
    git: &'g G,
    project: String,
    workdir: PathBuf,
    upstream: Option<String>,
    remote: ReviewRemote,
    committer: GitIdentity,
}

impl<'g, G: GitRunner> Checkout<'g, G> {
    /// Construct new checkout handle.
    pub fn new(
        git: &'g G,
        project: impl Into<String>,
        workdir: impl Into<PathBuf>,
        upstream: Option<String>,
        remote: ReviewRemote,
        committer: GitIdentity,
    ) -> Self {
        Self {
            git,
            project: project.into(),
            workdir: workdir.into(),
            upstream,
            remote,
            committer,
        }
    }

    /// Working copy location.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Whether the working copy exists on disk.
    pub fn exists(&self) -> bool {
        self.workdir.exists()
    }

    /// Obtain a working copy for the project.
    ///
    /// Returns the refspec the caller must push once the working copy
    /// passes validation, or nothing when the review service already had a
    /// usable copy.
    ///
    /// # Errors
    ///
    /// - Return [`CheckoutError::CreateParent`] if the base location
    ///   cannot be created.
    /// - Return [`CheckoutError::Review`] if the project listing cannot be
    ///   fetched.
    /// - Return [`CheckoutError::Clone`] / [`CheckoutError::Command`] if
    ///   the selected strategy fails.
    #[instrument(skip(self, service))]
    pub fn make_local_copy(&self, service: &impl ReviewService) -> Result<Option<PushSpec>> {
        if let Some(parent) = self.workdir.parent() {
            mkdirp::mkdirp(parent).map_err(|err| CheckoutError::CreateParent {
                source: err,
                path: parent.to_path_buf(),
            })?;
        }

        let known = service
            .projects()
            .map_err(CheckoutError::Review)?
            .iter()
            .any(|name| name == &self.project);
        if known {
            match self.clone_from_review() {
                Ok(()) => return Ok(None),
                Err(error) => {
                    debug!(
                        "clone from review service failed ({error}), importing from upstream"
                    );
                }
            }
        }

        if let Some(upstream) = self.upstream.clone() {
            self.import_upstream(&upstream)?;
            return Ok(Some(PushSpec {
                refspec: IMPORT_REFSPEC,
            }));
        }

        self.init_new()?;
        Ok(Some(PushSpec {
            refspec: INITIAL_REFSPEC,
        }))
    }

    /// Strategy 1: the review service owns the project, clone it.
    fn clone_from_review(&self) -> Result<()> {
        let workdir = self.workdir.to_string_lossy().into_owned();
        let cloned = self
            .git
            .git_bare(&["clone", &self.remote.url, &workdir], true)?;
        if !cloned.ok() {
            return Err(CheckoutError::Clone {
                url: self.remote.url.clone(),
                output: cloned.text,
            });
        }

        if let Some(upstream) = &self.upstream {
            self.run_checked(&["remote", "add", "-f", "upstream", upstream], true)?;
        }
        self.set_committer()?;

        Ok(())
    }

    /// Strategy 2: first-time import of the declared upstream.
    ///
    /// Ongoing we want the review service to be `origin` and the source to
    /// be `upstream`, there only for tracking purposes.
    fn import_upstream(&self, upstream: &str) -> Result<()> {
        info!("importing {} from upstream {upstream}", self.project);
        let workdir = self.workdir.to_string_lossy().into_owned();
        let cloned = self.git.git_bare(&["clone", upstream, &workdir], true)?;
        if !cloned.ok() {
            return Err(CheckoutError::Clone {
                url: upstream.to_owned(),
                output: cloned.text,
            });
        }

        self.run_checked(
            &["fetch", "origin", "+refs/heads/*:refs/copy/heads/*"],
            true,
        )?;
        self.run_checked(&["remote", "rename", "origin", "upstream"], false)?;
        self.run_checked(&["remote", "add", "origin", &self.remote.url], false)?;
        self.set_committer()?;

        Ok(())
    }

    /// Strategy 3: nothing exists anywhere, start from scratch.
    fn init_new(&self) -> Result<()> {
        info!("initializing brand new project {}", self.project);
        mkdirp::mkdirp(&self.workdir).map_err(|err| CheckoutError::CreateParent {
            source: err,
            path: self.workdir.clone(),
        })?;

        let workdir = self.workdir.to_string_lossy().into_owned();
        self.run_checked_bare(&["init", &workdir])?;
        self.set_committer()?;
        self.run_checked(&["remote", "add", "origin", &self.remote.url], false)?;

        let descriptor = format!(
            "[gerrit]\nhost={}\nport={}\nproject={}.git\n",
            self.remote.host, self.remote.port, self.project,
        );
        let path = self.workdir.join(".gitreview");
        fs::write(&path, descriptor)
            .map_err(|err| CheckoutError::WriteDescriptor { source: err, path })?;
        self.run_checked(&["add", ".gitreview"], false)?;

        let author = format!("--author={}", self.committer);
        self.run_checked(&["commit", "-a", "-m", "Added .gitreview", &author], false)?;

        Ok(())
    }

    /// Full integrity check of the working copy.
    ///
    /// A zero-padded filemode passes native git but is rejected by the
    /// review service's backend, so that warning fails the check even on a
    /// clean exit status.
    pub fn fsck_repo(&self) -> Result<()> {
        let fsck = self.git.git(&self.workdir, &["fsck", "--full"])?;
        if !fsck.ok() || fsck.text.contains("zeroPaddedFilemode") {
            error!("git fsck of {:?} failed:\n{}", self.workdir.display(), fsck.text);
            return Err(CheckoutError::Fsck {
                path: self.workdir.clone(),
            });
        }

        Ok(())
    }

    /// Apply a deferred push spec, then push tags.
    ///
    /// Failures are logged and swallowed; the next run re-derives whatever
    /// is missing from the review service.
    #[instrument(skip(self, spec))]
    pub fn push_to_review(&self, spec: &PushSpec) {
        let pushed = self
            .git
            .git_remote(&self.workdir, &["push", &self.remote.url, spec.refspec()]);
        match pushed {
            Ok(pushed) if pushed.ok() => {}
            _ => {
                warn!("error pushing {} to the review service", self.project);
                return;
            }
        }

        let tags = self
            .git
            .git_remote(&self.workdir, &["push", "--tags", &self.remote.url]);
        match tags {
            Ok(tags) if tags.ok() => {}
            _ => warn!("error pushing {} tags to the review service", self.project),
        }
    }

    /// Mirror upstream branches into local branches and push everything to
    /// the review service.
    ///
    /// Any branch that exists on the upstream remote gets a same-named
    /// local branch, optionally namespaced under `prefix`. Push failures
    /// are logged and swallowed.
    #[instrument(skip(self))]
    pub fn sync_upstream(&self, prefix: Option<&str>) -> Result<()> {
        self.run_checked(&["remote", "update", "upstream", "--prune"], true)?;

        let branches = self.git.git(&self.workdir, &["branch", "-a"])?;
        for line in branches.text.lines() {
            let branch = line.trim().trim_start_matches("* ").trim();
            if branch.contains("->") {
                continue;
            }
            let Some(remote_branch) = branch.split_whitespace().next() else {
                continue;
            };
            let Some(local) = remote_branch.strip_prefix("remotes/upstream/") else {
                continue;
            };

            let local = match prefix {
                Some(prefix) => format!("{prefix}/{local}"),
                None => local.to_owned(),
            };

            // Check out an up to date copy of the branch so the push below
            // picks it up.
            self.run_checked(&["checkout", "-B", &local, remote_branch], false)?;
        }

        for args in [
            ["push", "origin", "refs/heads/*:refs/heads/*"],
            ["push", "origin", "--tags"],
        ] {
            match self.git.git_remote(&self.workdir, &args) {
                Ok(pushed) if pushed.ok() => {}
                _ => warn!("error pushing {} to the review service", self.project),
            }
        }

        Ok(())
    }

    /// Reconcile an existing working copy with the desired tracking state.
    ///
    /// Cleans untracked and ignored files first; prior runs may have left
    /// stale state behind. The `upstream` remote is added, re-pointed, or
    /// removed to match `track_upstream`, and the local default branch is
    /// reset to exactly match the review remote's default branch.
    #[instrument(skip(self))]
    pub fn update_local_copy(&self, track_upstream: bool) -> Result<()> {
        self.run_checked(&["clean", "-fdx"], false)?;

        let remotes = self.git.git(&self.workdir, &["remote"])?;
        let has_upstream_remote = remotes.text.lines().any(|name| name.trim() == "upstream");

        if track_upstream {
            let upstream = self
                .upstream
                .as_deref()
                .ok_or_else(|| CheckoutError::NoUpstream {
                    project: self.project.clone(),
                })?;
            if !has_upstream_remote {
                self.run_checked(&["remote", "add", "upstream", upstream], false)?;
            } else {
                self.run_checked(&["remote", "set-url", "upstream", upstream], false)?;
            }
            self.run_checked(&["remote", "update", "--prune"], true)?;
        } else if has_upstream_remote {
            self.run_checked(&["remote", "rm", "upstream"], false)?;
        }

        let head = self
            .git
            .git(&self.workdir, &["rev-parse", "--abbrev-ref", "origin/HEAD"])?;
        let origin_head = if head.ok() && !head.text.is_empty() {
            head.text.trim().to_owned()
        } else {
            "origin/master".to_owned()
        };
        let local_branch = origin_head.trim_start_matches("origin/").to_owned();

        self.run_checked(&["checkout", "-B", &local_branch, &origin_head], false)?;

        Ok(())
    }

    /// Description override provided by the working copy itself.
    ///
    /// A top-level `.description` file, when present and non-empty, wins
    /// over the declared description.
    pub fn description_override(&self) -> Option<String> {
        let text = fs::read_to_string(self.workdir.join(".description")).ok()?;
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_owned())
    }

    /// Ensure a bare mirror repository for the project exists under `root`.
    ///
    /// Never re-creates an existing mirror. A failed initialization is
    /// removed so the next run can retry from scratch.
    pub fn create_local_mirror(&self, root: &Path) -> Result<()> {
        let mirror = root.join(format!("{}.git", self.project));
        if mirror.exists() {
            return Ok(());
        }

        if let Some(parent) = mirror.parent() {
            mkdirp::mkdirp(parent).map_err(|err| CheckoutError::CreateParent {
                source: err,
                path: parent.to_path_buf(),
            })?;
        }

        if let Err(error) = Repository::init_bare(&mirror) {
            let _ = fs::remove_dir_all(&mirror);
            return Err(CheckoutError::Mirror {
                source: error,
                path: mirror,
            });
        }

        info!("created mirror repository {:?}", mirror.display());
        Ok(())
    }

    /// Rewrite the working copy's committer identity so every commit made
    /// here carries the service identity.
    fn set_committer(&self) -> Result<()> {
        info!(
            "changing author, username={}, email={}",
            self.committer.name, self.committer.email
        );
        self.run_checked(&["config", "user.name", &self.committer.name], false)?;
        self.run_checked(&["config", "user.email", &self.committer.email], false)?;
        Ok(())
    }

    fn run_checked(&self, args: &[&str], remote: bool) -> Result<()> {
        let output = if remote {
            self.git.git_remote(&self.workdir, args)?
        } else {
            self.git.git(&self.workdir, args)?
        };

        if !output.ok() {
            return Err(CheckoutError::Command {
                command: args.join(" "),
                output: output.text,
            });
        }

        Ok(())
    }

    fn run_checked_bare(&self, args: &[&str]) -> Result<()> {
        let output = self.git.git_bare(args, false)?;
        if !output.ok() {
            return Err(CheckoutError::Command {
                command: args.join(" "),
                output: output.text,
            });
        }

        Ok(())
    }
}

/// Working copy reconciliation error types.
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    /// Base location for the working copy cannot be created.
    #[error("failed to create directory {:?}", path.display())]
    CreateParent {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Clone did not produce a usable working copy.
    #[error("failed to clone {url}:\n{output}")]
    Clone { url: String, output: String },

    /// Git sub-command exited nonzero.
    #[error("git {command} failed:\n{output}")]
    Command { command: String, output: String },

    /// Integrity check failed; the working copy must not be imported.
    #[error("git fsck failed for {:?}, not importing", path.display())]
    Fsck { path: PathBuf },

    /// Remote descriptor file cannot be written.
    #[error("failed to write remote descriptor {:?}", path.display())]
    WriteDescriptor {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Project tracks upstream but declares none.
    #[error("project {project} tracks upstream but declares no upstream URL")]
    NoUpstream { project: String },

    /// Mirror repository cannot be initialized.
    #[error("failed to initialize mirror {:?}", path.display())]
    Mirror {
        #[source]
        source: git2::Error,
        path: PathBuf,
    },

    /// Review service listing failed.
    #[error(transparent)]
    Review(crate::gerrit::GerritError),

    /// Git invocation failed outright.
    #[error(transparent)]
    Git(#[from] crate::git::GitError),
}

/// Friendly result alias :3
type Result<T, E = CheckoutError> = std::result::Result<T, E>;
