// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout for the two configuration files regent reads out of
//! the project-config directory: the defaults file `regent.toml`, and the
//! declared project list `projects.yaml`. Both are parsed once at startup
//! into plain structs; every defaultable field resolves through an explicit
//! default function rather than layered lookups at use sites.
//!
//! # Defaults File
//!
//! The defaults file carries the coordinates of the review service, the
//! committer identity used for generated commits, the local directory
//! roots, and the default capability toggles that project declarations can
//! override.
//!
//! # Project List
//!
//! The project list is an ordered YAML sequence, one entry per managed
//! project. Entry order is processing order. An entry's `options` list
//! holds free-form flags; the well-known ones have accessor methods.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Default settings for a run.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Settings {
    /// Review service SSH host.
    pub gerrit_host: String,

    /// Review service SSH port.
    #[serde(default = "default_gerrit_port")]
    pub gerrit_port: u16,

    /// Review service account used for every remote operation.
    pub gerrit_user: String,

    /// Review service HTTP base URL, for the REST channel.
    #[serde(default)]
    pub gerrit_url: Option<String>,

    /// HTTP password for the REST channel.
    #[serde(default)]
    pub gerrit_http_password: Option<String>,

    /// SSH private key for the command and git transports.
    pub gerrit_key: PathBuf,

    /// Committer identity for generated commits.
    pub gerrit_committer: GitIdentity,

    /// Trigger replication after pushes.
    #[serde(default = "default_gerrit_replicate")]
    pub gerrit_replicate: bool,

    /// Fallback homepage for hosted repositories.
    #[serde(default)]
    pub homepage: Option<String>,

    /// Reconcile hosting-side repositories by default.
    #[serde(default = "default_has_github")]
    pub has_github: bool,

    /// Default hosting-side capability toggles.
    #[serde(default)]
    pub has_issues: bool,
    #[serde(default)]
    pub has_wiki: bool,
    #[serde(default)]
    pub has_downloads: bool,

    /// Root of the local bare mirrors.
    #[serde(default = "default_local_git_dir")]
    pub local_git_dir: PathBuf,

    /// Root of transient working copies and the cache file.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// ACL sources, relative to the project-config directory.
    #[serde(default = "default_acl_dir")]
    pub acl_dir: PathBuf,

    /// Group-definition sources, relative to the project-config directory.
    #[serde(default = "default_group_dir")]
    pub group_dir: PathBuf,

    /// Policy-rule sources, relative to the project-config directory.
    #[serde(default = "default_rules_dir")]
    pub rules_dir: PathBuf,

    /// Hosting-service credentials file.
    #[serde(default = "default_github_config")]
    pub github_config: PathBuf,
}

fn default_gerrit_port() -> u16 {
    29418
}

fn default_gerrit_replicate() -> bool {
    true
}

fn default_has_github() -> bool {
    true
}

fn default_local_git_dir() -> PathBuf {
    PathBuf::from("/var/lib/git")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/regent")
}

fn default_acl_dir() -> PathBuf {
    PathBuf::from("acls")
}

fn default_group_dir() -> PathBuf {
    PathBuf::from("groups")
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("rules")
}

fn default_github_config() -> PathBuf {
    PathBuf::from("/etc/github/github.secure.toml")
}

impl Settings {
    /// Load `regent.toml` from the project-config directory at `root`.
    ///
    /// The source directories for ACLs, groups, and rules are anchored to
    /// `root` unless declared absolute.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ReadSettings`] if the file cannot be read.
    /// - Return [`ConfigError::DeserializeSettings`] if parsing fails.
    /// - Return [`ConfigError::ShellExpansion`] if a path field cannot be
    ///   expanded.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let path = root.as_ref().join("regent.toml");
        let contents = fs::read_to_string(&path).map_err(|err| ConfigError::ReadSettings {
            source: err,
            path: path.clone(),
        })?;

        let mut settings: Settings = contents.parse()?;
        settings.acl_dir = root.as_ref().join(&settings.acl_dir);
        settings.group_dir = root.as_ref().join(&settings.group_dir);
        settings.rules_dir = root.as_ref().join(&settings.rules_dir);

        Ok(settings)
    }

    /// Cache file location inside the cache directory.
    pub fn cache_file(&self) -> PathBuf {
        self.cache_dir.join("project.cache")
    }

    /// Transient working copy location for a project.
    pub fn workdir(&self, project: &str) -> PathBuf {
        self.cache_dir.join(project)
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings =
            toml::de::from_str(data).map_err(ConfigError::DeserializeSettings)?;

        // INVARIANT: Perform shell expansion on every path field.
        settings.gerrit_key = expand_path(&settings.gerrit_key)?;
        settings.local_git_dir = expand_path(&settings.local_git_dir)?;
        settings.cache_dir = expand_path(&settings.cache_dir)?;
        settings.github_config = expand_path(&settings.github_config)?;

        Ok(settings)
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(raw.as_ref()).map_err(ConfigError::ShellExpansion)?;
    Ok(PathBuf::from(expanded.into_owned()))
}

/// Committer identity in `Name <address>` form.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl FromStr for GitIdentity {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (name, email) = value
            .rsplit_once(" <")
            .and_then(|(name, rest)| rest.strip_suffix('>').map(|email| (name, email)))
            .filter(|(name, email)| !name.is_empty() && !email.is_empty())
            .ok_or_else(|| ConfigError::Committer {
                value: value.to_owned(),
            })?;

        Ok(Self {
            name: name.to_owned(),
            email: email.to_owned(),
        })
    }
}

impl TryFrom<String> for GitIdentity {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GitIdentity> for String {
    fn from(identity: GitIdentity) -> Self {
        identity.to_string()
    }
}

impl Display for GitIdentity {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{} <{}>", self.name, self.email)
    }
}

/// One declared project.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectDeclaration {
    /// Hierarchical project name in `org/name` form.
    pub project: String,

    /// Free-form option flags.
    #[serde(default)]
    pub options: Vec<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub homepage: Option<String>,

    /// External repository this project tracks and imports from.
    #[serde(default)]
    pub upstream: Option<String>,

    /// Namespace prefix for branches mirrored from upstream.
    #[serde(default)]
    pub upstream_prefix: Option<String>,

    /// Explicit ACL source; defaults to `{acl_dir}/{project}.config`.
    #[serde(default)]
    pub acl_config: Option<PathBuf>,

    /// Group-definitions source name.
    #[serde(default)]
    pub groups: Option<String>,

    /// Policy-rules source name.
    #[serde(default)]
    pub rules: Option<String>,

    /// Project to inherit access rights from.
    #[serde(default)]
    pub parent_project: Option<String>,

    /// Whether this project only exists to carry permissions for others.
    #[serde(default)]
    pub is_parent: bool,
}

impl ProjectDeclaration {
    /// Whether `option` appears in the declaration's option list.
    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|entry| entry == option)
    }

    /// Project opts out of review-service management entirely.
    pub fn no_gerrit(&self) -> bool {
        self.has_option("no-gerrit")
    }

    /// Project mirrors branches and tags from its upstream.
    pub fn track_upstream(&self) -> bool {
        self.has_option("track-upstream")
    }

    /// ACL source path for this project.
    pub fn acl_config_path(&self, settings: &Settings) -> PathBuf {
        match &self.acl_config {
            Some(path) => path.clone(),
            None => settings.acl_dir.join(format!("{}.config", self.project)),
        }
    }

    /// Hosting-side organization and repository names.
    pub fn org_and_repo(&self) -> (&str, &str) {
        match self.project.split_once('/') {
            Some((org, repo)) => (org, repo),
            None => (self.project.as_str(), self.project.as_str()),
        }
    }
}

/// Declared project list, in declaration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProjectRegistry {
    declarations: Vec<ProjectDeclaration>,
}

impl ProjectRegistry {
    /// Load `projects.yaml` at `path`.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ReadProjects`] if the file cannot be read.
    /// - Return [`ConfigError::DeserializeProjects`] if parsing fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents =
            fs::read_to_string(path.as_ref()).map_err(|err| ConfigError::ReadProjects {
                source: err,
                path: path.as_ref().to_path_buf(),
            })?;
        contents.parse()
    }

    /// Iterate declarations in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, ProjectDeclaration> {
        self.declarations.iter()
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}

impl FromStr for ProjectRegistry {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let declarations: Vec<ProjectDeclaration> =
            serde_yaml::from_str(data).map_err(ConfigError::DeserializeProjects)?;
        Ok(Self { declarations })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Settings file cannot be read.
    #[error("failed to read settings at {:?}", path.display())]
    ReadSettings {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Settings file cannot be deserialized.
    #[error(transparent)]
    DeserializeSettings(#[from] toml::de::Error),

    /// Project list cannot be read.
    #[error("failed to read project list at {:?}", path.display())]
    ReadProjects {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Project list cannot be deserialized.
    #[error(transparent)]
    DeserializeProjects(#[from] serde_yaml::Error),

    /// Shell expansion failed on a configured path.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Committer identity is not in `Name <address>` form.
    #[error("malformed committer identity {value:?}")]
    Committer { value: String },
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use simple_test_case::test_case;

    #[sealed_test(env = [("REVIEW_KEY_DIR", "/srv/keys")])]
    fn deserialize_settings_with_defaults() -> anyhow::Result<()> {
        let settings: Settings = indoc! {r#"
            gerrit-host = "review.example.org"
            gerrit-user = "reviewbot"
            gerrit-key = "$REVIEW_KEY_DIR/review_rsa"
            gerrit-committer = "Project Creator <infra@example.org>"
        "#}
        .parse()?;

        assert_eq!(settings.gerrit_host, "review.example.org");
        assert_eq!(settings.gerrit_port, 29418);
        assert_eq!(settings.gerrit_key, PathBuf::from("/srv/keys/review_rsa"));
        assert_eq!(settings.gerrit_committer.name, "Project Creator");
        assert_eq!(settings.gerrit_committer.email, "infra@example.org");
        assert!(settings.gerrit_replicate);
        assert!(settings.has_github);
        assert!(!settings.has_issues);
        assert_eq!(settings.local_git_dir, PathBuf::from("/var/lib/git"));
        assert_eq!(settings.cache_dir, PathBuf::from("/var/lib/regent"));
        assert_eq!(settings.acl_dir, PathBuf::from("acls"));

        Ok(())
    }

    #[test]
    fn settings_reject_unknown_fields() {
        let result = indoc! {r#"
            gerrit-host = "review.example.org"
            gerrit-user = "reviewbot"
            gerrit-key = "/srv/keys/review_rsa"
            gerrit-committer = "Project Creator <infra@example.org>"
            gerrit-hostname = "typo.example.org"
        "#}
        .parse::<Settings>();

        assert!(result.is_err());
    }

    #[test_case("Project Creator <infra@example.org>", "Project Creator", "infra@example.org"; "plain identity")]
    #[test_case("O'Brien, Team <team@example.org>", "O'Brien, Team", "team@example.org"; "punctuated name")]
    #[test]
    fn parse_committer_identity(raw: &str, name: &str, email: &str) {
        let identity: GitIdentity = raw.parse().unwrap();

        self::assert_eq!(identity.name, name);
        self::assert_eq!(identity.email, email);
        self::assert_eq!(identity.to_string(), raw);
    }

    #[test_case("Project Creator"; "no address")]
    #[test_case("<infra@example.org>"; "no name")]
    #[test_case("Project Creator <infra@example.org"; "unterminated address")]
    #[test]
    fn reject_malformed_committer_identity(raw: &str) {
        assert!(raw.parse::<GitIdentity>().is_err());
    }

    #[test]
    fn deserialize_project_registry() -> anyhow::Result<()> {
        let registry: ProjectRegistry = indoc! {r#"
            - project: openstack/nova
              options:
                - track-upstream
                - has-github
              description: Compute service
              upstream: https://git.example.org/nova.git
              upstream-prefix: upstream
            - project: openstack/infra-specs
              options:
                - no-gerrit
        "#}
        .parse()?;

        assert_eq!(registry.len(), 2);

        let nova = registry.iter().next().unwrap();
        assert_eq!(nova.project, "openstack/nova");
        assert!(nova.track_upstream());
        assert!(nova.has_option("has-github"));
        assert!(!nova.no_gerrit());
        assert_eq!(nova.upstream_prefix.as_deref(), Some("upstream"));

        let specs = registry.iter().nth(1).unwrap();
        assert!(specs.no_gerrit());

        Ok(())
    }

    #[test]
    fn acl_config_path_defaults_to_project_layout() -> anyhow::Result<()> {
        let settings: Settings = indoc! {r#"
            gerrit-host = "review.example.org"
            gerrit-user = "reviewbot"
            gerrit-key = "/srv/keys/review_rsa"
            gerrit-committer = "Project Creator <infra@example.org>"
            acl-dir = "/etc/regent/acls"
        "#}
        .parse()?;

        let declared = ProjectDeclaration {
            project: "openstack/nova".into(),
            ..Default::default()
        };
        assert_eq!(
            declared.acl_config_path(&settings),
            PathBuf::from("/etc/regent/acls/openstack/nova.config"),
        );

        let overridden = ProjectDeclaration {
            project: "openstack/nova".into(),
            acl_config: Some(PathBuf::from("/srv/special.config")),
            ..Default::default()
        };
        assert_eq!(
            overridden.acl_config_path(&settings),
            PathBuf::from("/srv/special.config"),
        );

        Ok(())
    }

    #[test]
    fn org_and_repo_split() {
        let nested = ProjectDeclaration {
            project: "openstack/nova".into(),
            ..Default::default()
        };
        assert_eq!(nested.org_and_repo(), ("openstack", "nova"));

        let flat = ProjectDeclaration {
            project: "nova".into(),
            ..Default::default()
        };
        assert_eq!(flat.org_and_repo(), ("nova", "nova"));
    }
}
