// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Hosting-side repository reconciliation.
//!
//! Projects can carry a mirror repository on a hosting service. This
//! module keeps that side in line with the declaration: the repository
//! exists, its description/homepage/capability toggles match, and the
//! review service's team is linked to it. Only organizations the
//! configured credentials control are touched; everything else is left
//! alone silently.
//!
//! The change cache keeps reconciliation cheap: when the cached flags
//! already match the declaration, no network call is made at all.

use crate::{
    cache::ProjectRecord,
    config::{ProjectDeclaration, Settings},
};

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::{cell::OnceCell, fs, path::{Path, PathBuf}};
use tracing::{debug, info, instrument};

/// Team that links hosted repositories back to the review service.
const REVIEW_TEAM: &str = "gerrit";

/// Observable repository state on the hosting side.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct RepositoryInfo {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub homepage: Option<String>,

    #[serde(default)]
    pub has_issues: bool,

    #[serde(default)]
    pub has_wiki: bool,

    #[serde(default)]
    pub has_downloads: bool,
}

/// Requested repository settings for create and update calls.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RepositoryChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_issues: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_wiki: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_downloads: Option<bool>,
}

/// Layer of indirection for hosting service access.
pub trait HostingService {
    /// Organizations the configured credentials belong to.
    fn organizations(&self) -> Result<Vec<String>>;

    /// Observable state of a repository; [`None`] when it does not exist.
    fn repository(&self, org: &str, name: &str) -> Result<Option<RepositoryInfo>>;

    /// Create a repository in an organization.
    fn create_repository(
        &self,
        org: &str,
        name: &str,
        change: &RepositoryChange,
    ) -> Result<RepositoryInfo>;

    /// Update repository settings.
    fn update_repository(&self, org: &str, name: &str, change: &RepositoryChange) -> Result<()>;

    /// Names of teams already linked to a repository.
    fn repository_teams(&self, org: &str, name: &str) -> Result<Vec<String>>;

    /// Link a team to a repository.
    fn add_team_repository(&self, org: &str, team: &str, name: &str) -> Result<()>;
}

/// Reconcile a project's hosting-side repository with its declaration.
///
/// Returns whether anything was created (repository or team link), which
/// callers use to trigger another replication pass. Cached flags are only
/// assigned after the hosting side confirms the corresponding state.
#[instrument(skip(service, settings, decl, record), fields(project = %decl.project))]
pub fn reconcile_repository(
    service: &impl HostingService,
    settings: &Settings,
    decl: &ProjectDeclaration,
    record: &mut ProjectRecord,
) -> Result<bool> {
    let has_issues = decl.has_option("has-issues") || settings.has_issues;
    let has_downloads = decl.has_option("has-downloads") || settings.has_downloads;
    let has_wiki = decl.has_option("has-wiki") || settings.has_wiki;

    let needs_update = !record.created_in_github
        || !record.gerrit_in_team
        || record.has_issues.unwrap_or(settings.has_issues) != has_issues
        || record.has_downloads.unwrap_or(settings.has_downloads) != has_downloads
        || record.has_wiki.unwrap_or(settings.has_wiki) != has_wiki;
    if !needs_update {
        return Ok(false);
    }

    let (org, repo_name) = decl.org_and_repo();
    // We do not control this organization, leave the project alone.
    if !service
        .organizations()?
        .iter()
        .any(|known| known.eq_ignore_ascii_case(org))
    {
        debug!("organization {org} is not controlled by these credentials");
        return Ok(false);
    }

    let mut created = false;
    let homepage = decl.homepage.clone().or_else(|| settings.homepage.clone());

    info!("fetching hosting info about {repo_name}");
    let repo = match service.repository(org, repo_name)? {
        Some(repo) => repo,
        None => {
            info!("creating {repo_name} on the hosting service");
            created = true;
            service.create_repository(
                org,
                repo_name,
                &RepositoryChange {
                    description: None,
                    homepage: homepage.clone(),
                    has_issues: Some(has_issues),
                    has_wiki: Some(has_wiki),
                    has_downloads: Some(has_downloads),
                },
            )?
        }
    };

    record.created_in_github = true;
    record.has_issues = Some(has_issues);
    record.has_wiki = Some(has_wiki);
    record.has_downloads = Some(has_downloads);

    let mut change = RepositoryChange::default();
    if decl.description.is_some() && decl.description != repo.description {
        change.description = decl.description.clone();
    }
    if homepage.is_some() && homepage != repo.homepage {
        change.homepage = homepage;
    }
    if has_issues != repo.has_issues {
        change.has_issues = Some(has_issues);
    }
    if has_wiki != repo.has_wiki {
        change.has_wiki = Some(has_wiki);
    }
    if has_downloads != repo.has_downloads {
        change.has_downloads = Some(has_downloads);
    }
    if change != RepositoryChange::default() {
        info!("updating hosting repository info about {repo_name}");
        service.update_repository(org, repo_name, &change)?;
    }

    if !record.gerrit_in_team {
        if !service
            .repository_teams(org, repo_name)?
            .iter()
            .any(|team| team == REVIEW_TEAM)
        {
            info!("adding {REVIEW_TEAM} team to {repo_name}");
            service.add_team_repository(org, REVIEW_TEAM, repo_name)?;
        }
        record.gerrit_in_team = true;
        created = true;
    }

    Ok(created)
}

/// Hosting credentials file layout.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HostingCredentials {
    pub oauth_token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Hosting service client over the GitHub v3 REST API.
pub struct GithubClient {
    api: String,
    credentials: HostingCredentials,
    http: reqwest::blocking::Client,
    // Organization list is fetched once per client and reused for every
    // project of the run.
    orgs: OnceCell<Vec<String>>,
}

impl GithubClient {
    /// Construct new client from a credentials file.
    ///
    /// # Errors
    ///
    /// - Return [`HostingError::ReadCredentials`] if the file cannot be
    ///   read.
    /// - Return [`HostingError::ParseCredentials`] if the file holds
    ///   malformed TOML.
    /// - Return [`HostingError::Http`] if the HTTP client cannot be built.
    pub fn from_config(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| HostingError::ReadCredentials {
            source: err,
            path: path.to_path_buf(),
        })?;
        let credentials = toml::de::from_str(&contents)?;

        Ok(Self {
            api: "https://api.github.com".to_owned(),
            credentials,
            http: reqwest::blocking::Client::builder()
                .user_agent("regent")
                .build()?,
            orgs: OnceCell::new(),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::blocking::RequestBuilder {
        let builder = self.http.request(method, format!("{}/{path}", self.api));
        match &self.credentials.oauth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder.basic_auth(
                self.credentials.username.clone().unwrap_or_default(),
                self.credentials.password.clone(),
            ),
        }
    }

    fn json<T: serde::de::DeserializeOwned>(response: reqwest::blocking::Response) -> Result<T> {
        Ok(response.error_for_status()?.json()?)
    }
}

impl HostingService for GithubClient {
    fn organizations(&self) -> Result<Vec<String>> {
        if let Some(orgs) = self.orgs.get() {
            return Ok(orgs.clone());
        }

        #[derive(Deserialize)]
        struct Organization {
            login: String,
        }

        info!("fetching hosting organization list");
        let response = self.request(Method::GET, "user/orgs").send()?;
        let organizations: Vec<Organization> = Self::json(response)?;
        let organizations: Vec<String> = organizations
            .into_iter()
            .map(|organization| organization.login)
            .collect();

        let _ = self.orgs.set(organizations.clone());
        Ok(organizations)
    }

    fn repository(&self, org: &str, name: &str) -> Result<Option<RepositoryInfo>> {
        let response = self
            .request(Method::GET, &format!("repos/{org}/{name}"))
            .send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Ok(Some(Self::json(response)?))
    }

    fn create_repository(
        &self,
        org: &str,
        name: &str,
        change: &RepositoryChange,
    ) -> Result<RepositoryInfo> {
        let mut body = serde_json::to_value(change).expect("repository change serializes");
        body["name"] = serde_json::Value::String(name.to_owned());

        let response = self
            .request(Method::POST, &format!("orgs/{org}/repos"))
            .json(&body)
            .send()?;
        Self::json(response)
    }

    fn update_repository(&self, org: &str, name: &str, change: &RepositoryChange) -> Result<()> {
        let mut body = serde_json::to_value(change).expect("repository change serializes");
        body["name"] = serde_json::Value::String(name.to_owned());

        let response = self
            .request(Method::PATCH, &format!("repos/{org}/{name}"))
            .json(&body)
            .send()?;
        response.error_for_status()?;
        Ok(())
    }

    fn repository_teams(&self, org: &str, name: &str) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Team {
            name: String,
        }

        let response = self
            .request(Method::GET, &format!("repos/{org}/{name}/teams"))
            .send()?;
        let teams: Vec<Team> = Self::json(response)?;
        Ok(teams.into_iter().map(|team| team.name).collect())
    }

    fn add_team_repository(&self, org: &str, team: &str, name: &str) -> Result<()> {
        let response = self
            .request(
                Method::PUT,
                &format!("orgs/{org}/teams/{team}/repos/{org}/{name}"),
            )
            .send()?;
        response.error_for_status()?;
        Ok(())
    }
}

/// Hosting service error types.
#[derive(Debug, thiserror::Error)]
pub enum HostingError {
    /// Credentials file cannot be read.
    #[error("failed to read hosting credentials at {:?}", path.display())]
    ReadCredentials {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Credentials file holds malformed TOML.
    #[error(transparent)]
    ParseCredentials(#[from] toml::de::Error),

    /// HTTP transport failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Friendly result alias :3
pub type Result<T, E = HostingError> = std::result::Result<T, E>;


#[cfg(test)]
mod tests {
    use super::{stub::StubHosting, *};
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn settings() -> Settings {
        indoc! {r#"
            gerrit-host = "review.example.org"
            gerrit-user = "reviewbot"
            gerrit-key = "/srv/keys/review_rsa"
            gerrit-committer = "Project Creator <infra@example.org>"
            homepage = "https://example.org"
        "#}
        .parse()
        .unwrap()
    }

    fn declaration() -> ProjectDeclaration {
        ProjectDeclaration {
            project: "openstack/nova".into(),
            options: vec!["has-github".into(), "has-issues".into()],
            description: Some("Compute service".into()),
            ..Default::default()
        }
    }

    #[test]
    fn creates_missing_repository_and_links_team() -> Result<()> {
        let service = StubHosting::new("openstack");
        let mut record = ProjectRecord::default();

        let created = reconcile_repository(&service, &settings(), &declaration(), &mut record)?;

        assert!(created);
        assert_eq!(service.created.borrow().as_slice(), ["openstack/nova"]);
        assert!(record.created_in_github);
        assert!(record.gerrit_in_team);
        assert_eq!(record.has_issues, Some(true));
        assert_eq!(record.has_wiki, Some(false));
        assert!(service.teams.borrow()["openstack/nova"].contains(REVIEW_TEAM));

        Ok(())
    }

    #[test]
    fn matching_cache_skips_all_network_calls() -> Result<()> {
        let service = StubHosting::new("openstack");
        let mut record = ProjectRecord {
            created_in_github: true,
            gerrit_in_team: true,
            has_issues: Some(true),
            has_wiki: Some(false),
            has_downloads: Some(false),
            ..Default::default()
        };

        let created = reconcile_repository(&service, &settings(), &declaration(), &mut record)?;

        assert!(!created);
        assert_eq!(*service.org_fetches.borrow(), 0);

        Ok(())
    }

    #[test]
    fn uncontrolled_organization_is_left_alone() -> Result<()> {
        let service = StubHosting::new("someoneelse");
        let mut record = ProjectRecord::default();

        let created = reconcile_repository(&service, &settings(), &declaration(), &mut record)?;

        assert!(!created);
        assert!(service.created.borrow().is_empty());
        assert!(!record.created_in_github);

        Ok(())
    }

    #[test]
    fn drifted_settings_are_patched() -> Result<()> {
        let service = StubHosting::new("openstack").with_repo(
            "openstack",
            "nova",
            RepositoryInfo {
                description: Some("stale".into()),
                homepage: Some("https://example.org".into()),
                has_issues: false,
                has_wiki: false,
                has_downloads: false,
            },
        );
        let mut record = ProjectRecord::default();

        let created = reconcile_repository(&service, &settings(), &declaration(), &mut record)?;

        // Repository already existed; only the team link counts as created.
        assert!(created);
        assert!(service.created.borrow().is_empty());

        let updates = service.updated.borrow();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.description.as_deref(), Some("Compute service"));
        assert_eq!(updates[0].1.has_issues, Some(true));
        assert_eq!(updates[0].1.homepage, None);

        Ok(())
    }

    #[test]
    fn existing_team_link_is_not_relinked() -> Result<()> {
        let service = StubHosting::new("openstack").with_repo(
            "openstack",
            "nova",
            RepositoryInfo {
                description: Some("Compute service".into()),
                homepage: Some("https://example.org".into()),
                has_issues: true,
                has_wiki: false,
                has_downloads: false,
            },
        );
        service
            .teams
            .borrow_mut()
            .entry("openstack/nova".into())
            .or_default()
            .insert(REVIEW_TEAM.into());
        let mut record = ProjectRecord::default();

        let created = reconcile_repository(&service, &settings(), &declaration(), &mut record)?;

        // Team was already present remotely, but the cache flag flip still
        // reports a change so replication gets another pass.
        assert!(created);
        assert!(service.updated.borrow().is_empty());
        assert!(record.gerrit_in_team);

        Ok(())
    }
}
