// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Project reconciliation driver.
//!
//! Walks the declared project list in order and makes the remote side
//! match each declaration: the review service knows the project, the
//! initial history is pushed, a local bare mirror exists, the metadata
//! branch carries the declared ACLs and policy rules, declared groups
//! exist with their members, and the hosting side mirrors the declared
//! capabilities.
//!
//! Every step is gated on the change cache or on a content hash, so an
//! unchanged declaration costs nothing. A failing project is logged and
//! abandoned for the rest of the run; its cache record keeps only the
//! steps that were confirmed, so the next run retries exactly what is
//! missing. The cache itself is flushed once, after the last project.
//!
//! The second driver mode, [`Driver::track_upstream`], periodically
//! mirrors upstream branches and tags into the review service for
//! projects that opted into tracking. It treats the cache as read-only
//! and keeps working copies around between runs.

use crate::{
    cache::{CacheError, ProjectCache},
    config::{ProjectDeclaration, ProjectRegistry, Settings},
    gerrit::{
        checkout::{Checkout, CheckoutError, ReviewRemote},
        create_groups,
        meta::{apply_acl_config, apply_rules, MetaError, MetaTarget},
        GerritError, ReviewService,
    },
    git::GitRunner,
    github::{reconcile_repository, HostingError, HostingService},
    hash::{HashError, HashIndex},
};

use std::{collections::BTreeMap, fs, path::PathBuf};
use tracing::{info, instrument, warn};

/// Reconciliation driver over one loaded configuration.
pub struct Driver<'a, G, R, H>
where
    G: GitRunner,
    R: ReviewService,
    H: HostingService,
{
    settings: &'a Settings,
    registry: &'a ProjectRegistry,
    git: &'a G,
    review: &'a R,
    hosting: Option<&'a H>,
    cache: ProjectCache,
    acl_index: HashIndex,
    group_index: HashIndex,
    rules_index: HashIndex,
    descriptions: BTreeMap<String, String>,
    keep_workdirs: bool,
}

impl<'a, G, R, H> Driver<'a, G, R, H>
where
    G: GitRunner,
    R: ReviewService,
    H: HostingService,
{
    /// Construct new driver, indexing the configuration sources once.
    ///
    /// # Errors
    ///
    /// - Return [`DriverError::Hash`] if a configuration source cannot be
    ///   hashed.
    pub fn new(
        settings: &'a Settings,
        registry: &'a ProjectRegistry,
        git: &'a G,
        review: &'a R,
        hosting: Option<&'a H>,
        cache: ProjectCache,
        keep_workdirs: bool,
    ) -> Result<Self> {
        let acl_index = HashIndex::index_dir(&settings.acl_dir, ".config")?;
        let group_index = HashIndex::index_dir(&settings.group_dir, ".yaml")?;
        let rules_index = HashIndex::index_dir(&settings.rules_dir, ".pl")?;

        Ok(Self {
            settings,
            registry,
            git,
            review,
            hosting,
            cache,
            acl_index,
            group_index,
            rules_index,
            descriptions: BTreeMap::new(),
            keep_workdirs,
        })
    }

    /// Reconcile every declared project, in declaration order.
    ///
    /// A failing project is logged and abandoned; the run continues with
    /// the next declaration. The change cache is flushed once at the end.
    ///
    /// # Errors
    ///
    /// - Return [`DriverError::Cache`] if the final cache flush fails.
    pub fn run(&mut self, filter: &[String]) -> Result<()> {
        let registry = self.registry;
        for decl in registry.iter() {
            if !filter.is_empty() && !filter.iter().any(|name| name == &decl.project) {
                continue;
            }
            if decl.no_gerrit() {
                continue;
            }

            info!("processing project: {}", decl.project);
            if let Err(error) = self.reconcile_project(decl) {
                warn!("problems creating {}, moving on: {error}", decl.project);
            }

            if !self.keep_workdirs {
                let workdir = self.settings.workdir(&decl.project);
                if workdir.exists() {
                    let _ = fs::remove_dir_all(&workdir);
                }
            }
            info!("finished processing {}", decl.project);
        }

        self.cache.flush()?;
        Ok(())
    }

    /// Mirror upstream branches and tags into the review service for every
    /// project marked `track-upstream`.
    ///
    /// The change cache is consulted but never flushed, and working copies
    /// are kept for the next run.
    pub fn track_upstream(&mut self, filter: &[String]) -> Result<()> {
        let registry = self.registry;
        for decl in registry.iter() {
            if !filter.is_empty() && !filter.iter().any(|name| name == &decl.project) {
                continue;
            }
            if decl.no_gerrit() || !decl.track_upstream() {
                continue;
            }
            if !self.cache.record(&decl.project).pushed_to_gerrit {
                warn!(
                    "project {} has not been pushed to the review service yet, skipping",
                    decl.project
                );
                continue;
            }

            info!("processing project: {}", decl.project);
            if let Err(error) = self.sync_project(decl) {
                warn!("problems syncing {}, moving on: {error}", decl.project);
            }
            info!("finished processing {}", decl.project);
        }

        Ok(())
    }

    #[instrument(skip(self, decl), fields(project = %decl.project))]
    fn reconcile_project(&mut self, decl: &ProjectDeclaration) -> Result<()> {
        self.ensure_created(decl)?;

        let checkout = self.checkout(decl);
        self.ensure_pushed(decl, &checkout)?;
        checkout.create_local_mirror(&self.settings.local_git_dir)?;

        self.apply_acls(decl, &checkout)?;
        self.apply_group_definitions(decl)?;
        self.apply_rule_files(decl, &checkout)?;
        self.reconcile_hosting(decl)?;

        Ok(())
    }

    fn sync_project(&mut self, decl: &ProjectDeclaration) -> Result<()> {
        let checkout = self.checkout(decl);
        if !checkout.exists() {
            let _ = checkout.make_local_copy(self.review)?;
        } else {
            checkout.update_local_copy(decl.track_upstream())?;
        }

        checkout.fsck_repo()?;
        checkout.sync_upstream(decl.upstream_prefix.as_deref())?;

        Ok(())
    }

    /// The review service must know the project before anything else.
    ///
    /// The created flag is only cached once the service confirms the
    /// project; a creation failure abandons the project for this run so
    /// the next run retries it from scratch.
    fn ensure_created(&mut self, decl: &ProjectDeclaration) -> Result<()> {
        if self.cache.record(&decl.project).project_created {
            return Ok(());
        }

        if self
            .review
            .projects()?
            .iter()
            .any(|name| name == &decl.project)
        {
            info!("project {} already exists in the review service", decl.project);
            self.cache.record_mut(&decl.project).project_created = true;
            return Ok(());
        }

        match self.review.create_project(
            &decl.project,
            decl.description.as_deref(),
            decl.is_parent,
            decl.parent_project.as_deref(),
        ) {
            Ok(()) => {
                self.cache.record_mut(&decl.project).project_created = true;
                Ok(())
            }
            Err(error) => {
                self.cache.record_mut(&decl.project).project_created = false;
                Err(DriverError::CreateProject {
                    project: decl.project.clone(),
                    source: error,
                })
            }
        }
    }

    /// The project's initial history must reach the review service.
    fn ensure_pushed(
        &mut self,
        decl: &ProjectDeclaration,
        checkout: &Checkout<'a, G>,
    ) -> Result<()> {
        if self.cache.record(&decl.project).pushed_to_gerrit {
            return Ok(());
        }

        // We haven't pushed yet, so grab the repository again from
        // scratch; a partial prior attempt is not worth trusting.
        let workdir = self.settings.workdir(&decl.project);
        if workdir.exists() {
            fs::remove_dir_all(&workdir).map_err(|err| DriverError::DiscardWorkdir {
                source: err,
                path: workdir.clone(),
            })?;
        }

        let push_spec = checkout.make_local_copy(self.review)?;

        if let Some(description) = checkout.description_override() {
            self.descriptions.insert(decl.project.clone(), description);
        }

        checkout.fsck_repo()?;

        if let Some(spec) = &push_spec {
            checkout.push_to_review(spec);
        }
        self.cache.record_mut(&decl.project).pushed_to_gerrit = true;

        if self.settings.gerrit_replicate {
            self.review.replicate(&decl.project)?;
        }

        Ok(())
    }

    /// Hash-gated ACL application.
    fn apply_acls(&mut self, decl: &ProjectDeclaration, checkout: &Checkout<'a, G>) -> Result<()> {
        let acl_path = decl.acl_config_path(self.settings);
        let fragment = acl_path.to_string_lossy().into_owned();
        let due: Vec<(PathBuf, String)> = self
            .acl_index
            .matching(&fragment)
            .into_iter()
            .map(|(path, sha)| (path.to_path_buf(), sha.to_owned()))
            .collect();

        for (path, sha) in due {
            if self.cache.record(&decl.project).acl_sha.as_deref() == Some(sha.as_str()) {
                info!("{} has matching sha, skipping ACLs", decl.project);
                continue;
            }

            self.ensure_workdir(checkout)?;
            let remote_url = self.review.remote_url(&decl.project);
            let outcome = apply_acl_config(
                self.git,
                self.review,
                MetaTarget {
                    workdir: checkout.workdir(),
                    project: &decl.project,
                    remote_url: &remote_url,
                    committer: &self.settings.gerrit_committer,
                },
                &path,
            )?;

            if outcome.confirmed() {
                self.cache.record_mut(&decl.project).acl_sha = Some(sha);
            }
        }

        Ok(())
    }

    /// Hash-gated group-definitions application.
    fn apply_group_definitions(&mut self, decl: &ProjectDeclaration) -> Result<()> {
        let Some(groups) = &decl.groups else {
            return Ok(());
        };

        let due: Vec<(PathBuf, String)> = self
            .group_index
            .matching(groups)
            .into_iter()
            .map(|(path, sha)| (path.to_path_buf(), sha.to_owned()))
            .collect();

        for (path, sha) in due {
            if self.cache.record(&decl.project).groups_sha.as_deref() == Some(sha.as_str()) {
                info!("no changes to {} groups file", decl.project);
                continue;
            }

            create_groups(self.review, &path)?;
            self.cache.record_mut(&decl.project).groups_sha = Some(sha);
        }

        Ok(())
    }

    /// Hash-gated policy-rules application.
    fn apply_rule_files(
        &mut self,
        decl: &ProjectDeclaration,
        checkout: &Checkout<'a, G>,
    ) -> Result<()> {
        let Some(rules) = &decl.rules else {
            return Ok(());
        };

        let due: Vec<(PathBuf, String)> = self
            .rules_index
            .matching(rules)
            .into_iter()
            .map(|(path, sha)| (path.to_path_buf(), sha.to_owned()))
            .collect();

        for (path, sha) in due {
            if self.cache.record(&decl.project).rules_sha.as_deref() == Some(sha.as_str()) {
                info!("no changes to {} policy rules", decl.project);
                continue;
            }

            self.ensure_workdir(checkout)?;
            let remote_url = self.review.remote_url(&decl.project);
            let outcome = apply_rules(
                self.git,
                MetaTarget {
                    workdir: checkout.workdir(),
                    project: &decl.project,
                    remote_url: &remote_url,
                    committer: &self.settings.gerrit_committer,
                },
                &path,
            )?;

            if outcome.confirmed() {
                self.cache.record_mut(&decl.project).rules_sha = Some(sha);
            }
        }

        Ok(())
    }

    /// Hosting-side repository reconciliation, replicating again when
    /// anything was created over there.
    fn reconcile_hosting(&mut self, decl: &ProjectDeclaration) -> Result<()> {
        if !(decl.has_option("has-github") || self.settings.has_github) {
            return Ok(());
        }
        let Some(hosting) = self.hosting else {
            return Ok(());
        };

        let mut decl = decl.clone();
        if let Some(description) = self.descriptions.get(&decl.project) {
            decl.description = Some(description.clone());
        }

        let mut record = self.cache.record(&decl.project);
        let created = reconcile_repository(hosting, self.settings, &decl, &mut record)?;
        *self.cache.record_mut(&decl.project) = record;

        if created && self.settings.gerrit_replicate {
            self.review.replicate(&decl.project)?;
        }

        Ok(())
    }

    /// The metadata flows need a working copy on disk; later runs may
    /// start without one, working copies being transient.
    fn ensure_workdir(&self, checkout: &Checkout<'a, G>) -> Result<()> {
        if checkout.exists() {
            return Ok(());
        }

        let _ = checkout.make_local_copy(self.review)?;
        mkdirp::mkdirp(checkout.workdir()).map_err(|err| DriverError::DiscardWorkdir {
            source: err,
            path: checkout.workdir().to_path_buf(),
        })?;

        Ok(())
    }

    fn checkout(&self, decl: &ProjectDeclaration) -> Checkout<'a, G> {
        Checkout::new(
            self.git,
            decl.project.clone(),
            self.settings.workdir(&decl.project),
            decl.upstream.clone(),
            ReviewRemote {
                url: self.review.remote_url(&decl.project),
                host: self.settings.gerrit_host.clone(),
                port: self.settings.gerrit_port,
            },
            self.settings.gerrit_committer.clone(),
        )
    }
}

/// Reconciliation driver error types.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Review service refused to create the project.
    #[error("failed to create {project} in the review service")]
    CreateProject {
        project: String,
        #[source]
        source: GerritError,
    },

    /// Stale working copy cannot be discarded or recreated.
    #[error("failed to reset working copy {:?}", path.display())]
    DiscardWorkdir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Checkout(#[from] CheckoutError),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Gerrit(#[from] GerritError),

    #[error(transparent)]
    Hosting(#[from] HostingError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Hash(#[from] HashError),
}

/// Friendly result alias :3
type Result<T, E = DriverError> = std::result::Result<T, E>;
