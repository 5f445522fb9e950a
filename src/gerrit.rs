// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Review service client.
//!
//! Thin facade over the review server's project and group operations.
//! Administrative commands ride the SSH command channel (`gerrit
//! <sub-command>` executed on the server); group-membership mutations ride
//! the HTTP REST channel. Both are plain synchronous request/response
//! calls with no state machine of their own, so everything here stays a
//! wrapper: run the call, surface the outcome.
//!
//! The one wrinkle is group resolution. The server acknowledges group
//! creation before the group shows up in listings, so [`group_uuid`]
//! combines a live lookup, the fixed table of well-known system groups,
//! and a bounded re-poll after remote creation.

pub mod checkout;
pub mod meta;

use crate::retry::{poll, Poll};

use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Well-known system groups and their stable identifiers.
///
/// These never appear in group listings; their identifiers are fixed by
/// the review server itself.
const SYSTEM_GROUPS: [(&str, &str); 4] = [
    ("Anonymous Users", "global:Anonymous-Users"),
    ("Project Owners", "global:Project-Owners"),
    ("Registered Users", "global:Registered-Users"),
    ("Change Owner", "global:Change-Owner"),
];

const GROUP_RESOLVE: Poll = Poll::new(10, Duration::from_secs(1));

/// One row of the verbose group listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    pub uuid: String,
    pub description: String,
    pub owner: String,
}

/// Group definition from a group-definitions file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GroupSpec {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Account addresses to add as direct members.
    #[serde(default)]
    pub members: Vec<String>,

    /// Internal groups to include.
    #[serde(default)]
    pub subgroups: Vec<String>,

    /// External directory groups to include, stored without their
    /// `ldap:` prefix.
    #[serde(default)]
    pub ldap_groups: Vec<String>,
}

/// Layer of indirection for review server access.
pub trait ReviewService {
    /// Names of every project the server knows.
    fn projects(&self) -> Result<Vec<String>>;

    /// Create a project.
    fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
        is_parent: bool,
        parent: Option<&str>,
    ) -> Result<()>;

    /// Trigger replication of a project to its mirrors.
    fn replicate(&self, name: &str) -> Result<()>;

    /// Verbose group listing keyed by group name.
    fn groups(&self) -> Result<BTreeMap<String, GroupInfo>>;

    /// Create a group visible to all registered users.
    fn create_group(&self, name: &str, description: Option<&str>) -> Result<()>;

    /// Add direct members to a group.
    fn add_group_members(&self, group: &str, members: &[String]) -> Result<()>;

    /// Include internal groups in a group.
    fn add_included_groups(&self, group: &str, groups: &[String]) -> Result<()>;

    /// Include external (directory-backed) groups in a group, one call per
    /// identifier.
    fn add_external_groups(&self, group: &str, ids: &[String]) -> Result<()>;

    /// Git remote URL for a project over the review transport.
    fn remote_url(&self, project: &str) -> String;
}

/// Resolve a group name to its stable identifier.
///
/// Single live lookup first, then the well-known system-group table, then
/// remote creation followed by a bounded re-poll for the asynchronous
/// propagation of the new group.
///
/// # Errors
///
/// - Return [`GerritError::GroupResolve`] if the group never becomes
///   resolvable.
#[instrument(skip(service))]
pub fn group_uuid(service: &impl ReviewService, name: &str) -> Result<String> {
    resolve_group_uuid(service, name, GROUP_RESOLVE)
}

pub(crate) fn resolve_group_uuid(
    service: &impl ReviewService,
    name: &str,
    schedule: Poll,
) -> Result<String> {
    if let Some(info) = service.groups()?.get(name) {
        return Ok(info.uuid.clone());
    }

    if let Some((_, uuid)) = SYSTEM_GROUPS.iter().find(|(known, _)| *known == name) {
        return Ok((*uuid).to_owned());
    }

    info!("group {name} does not exist yet, creating it");
    service.create_group(name, None)?;

    poll(schedule, |_| {
        service
            .groups()
            .ok()
            .and_then(|groups| groups.get(name).map(|info| info.uuid.clone()))
    })
    .ok_or_else(|| GerritError::GroupResolve {
        group: name.to_owned(),
    })
}

/// Apply a group-definitions file.
///
/// Creates each declared group when absent, then pushes direct members,
/// internal subgroups, and `ldap:`-prefixed external groups.
///
/// # Errors
///
/// - Return [`GerritError::ReadGroups`] if the file cannot be read.
/// - Return [`GerritError::ParseGroups`] if the file holds malformed YAML.
#[instrument(skip(service, path))]
pub fn create_groups(service: &impl ReviewService, path: &Path) -> Result<()> {
    let contents = fs::read_to_string(path).map_err(|err| GerritError::ReadGroups {
        source: err,
        path: path.to_path_buf(),
    })?;
    let specs: Vec<GroupSpec> = serde_yaml::from_str(&contents)?;

    for spec in specs {
        let existing = service.groups()?;
        if !existing.contains_key(&spec.name) {
            service.create_group(&spec.name, spec.description.as_deref())?;
        }

        if !spec.members.is_empty() {
            service.add_group_members(&spec.name, &spec.members)?;
        }

        if !spec.subgroups.is_empty() {
            service.add_included_groups(&spec.name, &spec.subgroups)?;
        }

        if !spec.ldap_groups.is_empty() {
            let ids: Vec<String> = spec
                .ldap_groups
                .iter()
                .map(|group| format!("ldap:{group}"))
                .collect();
            service.add_external_groups(&spec.name, &ids)?;
        }
    }

    Ok(())
}

/// Review server client over SSH and REST.
pub struct GerritClient {
    host: String,
    port: u16,
    user: String,
    key: PathBuf,
    rest: Option<GerritRest>,
}

impl GerritClient {
    /// Construct new client from run settings.
    ///
    /// The REST channel is only available when both an HTTP base URL and an
    /// HTTP password are configured; group-membership operations error out
    /// without it.
    ///
    /// # Errors
    ///
    /// - Return [`GerritError::Http`] if the HTTP client cannot be built.
    pub fn new(settings: &crate::config::Settings) -> Result<Self> {
        let rest = match (&settings.gerrit_url, &settings.gerrit_http_password) {
            (Some(url), Some(password)) => Some(GerritRest {
                base: url.trim_end_matches('/').to_owned(),
                user: settings.gerrit_user.clone(),
                password: password.clone(),
                http: reqwest::blocking::Client::builder().build()?,
            }),
            _ => None,
        };

        Ok(Self {
            host: settings.gerrit_host.clone(),
            port: settings.gerrit_port,
            user: settings.gerrit_user.clone(),
            key: settings.gerrit_key.clone(),
            rest,
        })
    }

    fn gerrit_command(&self, args: &[&str]) -> Result<String> {
        let mut command = Command::new("ssh");
        command
            .arg("-i")
            .arg(&self.key)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg(format!("{}@{}", self.user, self.host))
            .arg("gerrit");
        command.args(args);

        info!(
            "executing command: ssh {}@{} gerrit {}",
            self.user,
            self.host,
            args.join(" ")
        );
        let output = command
            .output()
            .map_err(|err| GerritError::Spawn { source: err })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(GerritError::Command {
                command: args.join(" "),
                output: if stderr.is_empty() { stdout } else { stderr },
            });
        }

        Ok(stdout)
    }

    fn rest(&self) -> Result<&GerritRest> {
        self.rest.as_ref().ok_or(GerritError::RestUnconfigured)
    }
}

impl ReviewService for GerritClient {
    fn projects(&self) -> Result<Vec<String>> {
        Ok(self
            .gerrit_command(&["ls-projects"])?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    #[instrument(skip(self, description))]
    fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
        is_parent: bool,
        parent: Option<&str>,
    ) -> Result<()> {
        let mut args: Vec<String> = vec!["create-project".into()];
        if is_parent {
            args.push("--permissions-only".into());
        }
        if let Some(parent) = parent {
            args.push("--parent".into());
            args.push(parent.into());
        }
        if let Some(description) = description {
            args.push("--description".into());
            args.push(shell_quote(description));
        }
        args.push(name.into());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.gerrit_command(&args)?;
        Ok(())
    }

    fn replicate(&self, name: &str) -> Result<()> {
        self.gerrit_command(&["replication", "start", name])?;
        Ok(())
    }

    fn groups(&self) -> Result<BTreeMap<String, GroupInfo>> {
        let listing = self.gerrit_command(&["ls-groups", "-v"])?;
        Ok(parse_group_listing(&listing))
    }

    #[instrument(skip(self, description))]
    fn create_group(&self, name: &str, description: Option<&str>) -> Result<()> {
        let mut args: Vec<String> = vec!["create-group".into(), "--visible-to-all".into()];
        if let Some(description) = description {
            args.push("--description".into());
            args.push(shell_quote(description));
        }
        args.push(shell_quote(name));

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.gerrit_command(&args)?;
        Ok(())
    }

    fn add_group_members(&self, group: &str, members: &[String]) -> Result<()> {
        let path = format!("groups/{}/members.add", encode_segment(group));
        self.rest()?
            .post_json(&path, serde_json::json!({ "members": members }))
    }

    fn add_included_groups(&self, group: &str, groups: &[String]) -> Result<()> {
        let path = format!("groups/{}/groups", encode_segment(group));
        self.rest()?
            .post_json(&path, serde_json::json!({ "groups": groups }))
    }

    fn add_external_groups(&self, group: &str, ids: &[String]) -> Result<()> {
        for id in ids {
            let path = format!(
                "groups/{}/groups/{}",
                encode_segment(group),
                encode_segment(id)
            );
            self.rest()?.put(&path)?;
        }
        Ok(())
    }

    fn remote_url(&self, project: &str) -> String {
        format!(
            "ssh://{}@{}:{}/{}",
            self.user, self.host, self.port, project
        )
    }
}

/// Review server REST channel.
struct GerritRest {
    base: String,
    user: String,
    password: String,
    http: reqwest::blocking::Client,
}

impl GerritRest {
    fn post_json(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let response = self
            .http
            .post(self.url(path))
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()?;
        self.check(path, response)
    }

    fn put(&self, path: &str) -> Result<()> {
        let response = self
            .http
            .put(self.url(path))
            .basic_auth(&self.user, Some(&self.password))
            .send()?;
        self.check(path, response)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/a/{}", self.base, path)
    }

    fn check(&self, path: &str, response: reqwest::blocking::Response) -> Result<()> {
        use reqwest::StatusCode;

        match response.status() {
            status if status.is_success() => Ok(()),
            // The server returns 404 while a freshly created group is still
            // propagating; the next run picks the change up again.
            StatusCode::NOT_FOUND => {
                debug!("{path} returned 404, ignoring");
                Ok(())
            }
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                warn!(
                    "{path} rejected with status {}, leaving membership as-is",
                    response.status()
                );
                Ok(())
            }
            status => Err(GerritError::Status {
                path: path.to_owned(),
                status: status.as_u16(),
            }),
        }
    }
}

fn parse_group_listing(listing: &str) -> BTreeMap<String, GroupInfo> {
    let mut groups = BTreeMap::new();
    for line in listing.lines() {
        let mut columns = line.split('\t');
        let Some(name) = columns.next().map(str::trim) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        let info = GroupInfo {
            name: name.to_owned(),
            uuid: columns.next().unwrap_or_default().to_owned(),
            description: columns.next().unwrap_or_default().to_owned(),
            owner: columns.next().unwrap_or_default().to_owned(),
        };
        groups.insert(info.name.clone(), info);
    }

    groups
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn encode_segment(value: &str) -> String {
    value.replace('%', "%25").replace(' ', "%20").replace('/', "%2F")
}

/// Review service error types.
#[derive(Debug, thiserror::Error)]
pub enum GerritError {
    /// SSH command channel cannot be launched.
    #[error("failed to launch ssh command channel")]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    /// Remote command exited nonzero.
    #[error("gerrit {command} failed:\n{output}")]
    Command { command: String, output: String },

    /// REST channel transport failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// REST channel returned an unexpected status.
    #[error("REST call {path} returned status {status}")]
    Status { path: String, status: u16 },

    /// Group-membership operation requested without a configured REST
    /// channel.
    #[error("no REST endpoint configured for group membership operations")]
    RestUnconfigured,

    /// Group never became resolvable.
    #[error("unable to resolve UUID for group {group}")]
    GroupResolve { group: String },

    /// Group-definitions file cannot be read.
    #[error("failed to read group definitions at {:?}", path.display())]
    ReadGroups {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Group-definitions file holds malformed YAML.
    #[error(transparent)]
    ParseGroups(#[from] serde_yaml::Error),
}

/// Friendly result alias :3
pub type Result<T, E = GerritError> = std::result::Result<T, E>;


#[cfg(test)]
mod tests {
    use super::{stub::StubReview, *};
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn parse_verbose_group_listing() {
        let listing = indoc! {"
            nova-core\t41818067\tCore reviewers\tnova-core\t41818067\ttrue
            Administrators\tf3a06b44\tGerrit Site Administrators\tAdministrators\tf3a06b44\tfalse
        "};

        let groups = parse_group_listing(listing);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups["nova-core"].uuid, "41818067");
        assert_eq!(groups["Administrators"].description, "Gerrit Site Administrators");
    }

    #[test]
    fn group_uuid_prefers_live_listing() -> Result<()> {
        let service = StubReview::new().with_group("nova-core", "41818067");

        assert_eq!(resolve_group_uuid(&service, "nova-core", fast())?, "41818067");
        assert!(service.created_groups.borrow().is_empty());

        Ok(())
    }

    #[test]
    fn group_uuid_consults_system_table_before_creating() -> Result<()> {
        let service = StubReview::new();

        let uuid = resolve_group_uuid(&service, "Registered Users", fast())?;

        assert_eq!(uuid, "global:Registered-Users");
        assert!(service.created_groups.borrow().is_empty());

        Ok(())
    }

    #[test]
    fn group_uuid_creates_then_repolls() -> Result<()> {
        let service = StubReview::new();

        let uuid = resolve_group_uuid(&service, "nova-core", fast())?;

        assert_eq!(uuid, "uuid-nova-core");
        assert_eq!(service.created_groups.borrow().as_slice(), ["nova-core"]);

        Ok(())
    }

    #[test]
    fn group_uuid_exhaustion_is_an_error() {
        let service = StubReview::new();
        service.groups_materialize.set(false);

        let result = resolve_group_uuid(&service, "nova-core", fast());

        assert!(matches!(
            result,
            Err(GerritError::GroupResolve { group }) if group == "nova-core"
        ));
    }

    #[test]
    fn create_groups_pushes_membership() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nova.yaml");
        std::fs::write(
            &path,
            indoc! {r#"
                - name: nova-core
                  description: Core reviewers
                  members:
                    - alice@example.org
                    - bob@example.org
                  subgroups:
                    - nova-drivers
                  ldap-groups:
                    - cn=nova,ou=groups
            "#},
        )?;

        let service = StubReview::new();
        create_groups(&service, &path)?;

        assert_eq!(service.created_groups.borrow().as_slice(), ["nova-core"]);
        assert_eq!(
            service.member_calls.borrow().as_slice(),
            [(
                "nova-core".to_string(),
                vec!["alice@example.org".to_string(), "bob@example.org".to_string()],
            )],
        );
        assert_eq!(
            service.include_calls.borrow().as_slice(),
            [("nova-core".to_string(), vec!["nova-drivers".to_string()])],
        );
        assert_eq!(
            service.external_calls.borrow().as_slice(),
            [(
                "nova-core".to_string(),
                vec!["ldap:cn=nova,ou=groups".to_string()],
            )],
        );

        Ok(())
    }

    #[test]
    fn create_groups_skips_existing_groups() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nova.yaml");
        std::fs::write(&path, "- name: nova-core\n")?;

        let service = StubReview::new().with_group("nova-core", "41818067");
        create_groups(&service, &path)?;

        assert!(service.created_groups.borrow().is_empty());

        Ok(())
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain words"), "'plain words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn encode_segment_escapes_url_separators() {
        assert_eq!(encode_segment("nova core"), "nova%20core");
        assert_eq!(encode_segment("a/b"), "a%2Fb");
        assert_eq!(encode_segment("50%"), "50%25");
    }

    fn fast() -> Poll {
        Poll::new(3, Duration::ZERO)
    }
}
