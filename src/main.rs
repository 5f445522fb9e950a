// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use regent::{
    cache::ProjectCache,
    config::{ProjectRegistry, Settings},
    gerrit::GerritClient,
    git::{SshWrapper, SystemGit},
    github::GithubClient,
    path::default_project_config_dir,
    reconcile::Driver,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::exit};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  regent manage [options] [project]...\n  regent track-upstream [options] [project]...",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        match self.command {
            Command::Manage(opts) => run_manage(opts),
            Command::TrackUpstream(opts) => run_track_upstream(opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Reconcile declared projects against the review service.
    #[command(override_usage = "regent manage [options] [project]...")]
    Manage(ManageOptions),

    /// Mirror upstream branches and tags into the review service.
    #[command(override_usage = "regent track-upstream [options] [project]...")]
    TrackUpstream(TrackUpstreamOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ManageOptions {
    /// Name of project(s) to process; every declared project when empty.
    #[arg(value_name = "project")]
    pub projects: Vec<String>,

    /// Do not remove temporary working copies.
    #[arg(long)]
    pub nocleanup: bool,

    /// Location of the project-config directory.
    #[arg(long, value_name = "dir")]
    pub project_config_dir: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct TrackUpstreamOptions {
    /// Name of project(s) to process; every declared project when empty.
    #[arg(value_name = "project")]
    pub projects: Vec<String>,

    /// Location of the project-config directory.
    #[arg(long, value_name = "dir")]
    pub project_config_dir: Option<PathBuf>,
}

fn main() {
    let layer = fmt::layer().compact();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn load_configuration(config_dir: Option<PathBuf>) -> Result<(Settings, ProjectRegistry)> {
    let root = match config_dir {
        Some(dir) => dir,
        None => default_project_config_dir()?,
    };

    let settings = Settings::load(&root)
        .with_context(|| format!("failed to load settings from {:?}", root.display()))?;
    let registry = ProjectRegistry::load(root.join("projects.yaml"))
        .with_context(|| format!("failed to load project list from {:?}", root.display()))?;

    Ok((settings, registry))
}

fn run_manage(opts: ManageOptions) -> Result<()> {
    let (settings, registry) = load_configuration(opts.project_config_dir)?;

    let ssh = SshWrapper::new(&settings.gerrit_user, &settings.gerrit_key)?;
    let git = SystemGit::new(Some(ssh));
    let review = GerritClient::new(&settings)?;
    let cache = ProjectCache::load(settings.cache_file())?;

    let hosting = if settings.has_github
        || registry.iter().any(|decl| decl.has_option("has-github"))
    {
        Some(GithubClient::from_config(&settings.github_config)?)
    } else {
        None
    };

    let mut driver = Driver::new(
        &settings,
        &registry,
        &git,
        &review,
        hosting.as_ref(),
        cache,
        opts.nocleanup,
    )?;
    driver.run(&opts.projects)?;

    Ok(())
}

fn run_track_upstream(opts: TrackUpstreamOptions) -> Result<()> {
    let (settings, registry) = load_configuration(opts.project_config_dir)?;

    let ssh = SshWrapper::new(&settings.gerrit_user, &settings.gerrit_key)?;
    let git = SystemGit::new(Some(ssh));
    let review = GerritClient::new(&settings)?;
    let cache = ProjectCache::load(settings.cache_file())?;

    let hosting: Option<&GithubClient> = None;
    let mut driver = Driver::new(
        &settings,
        &registry,
        &git,
        &review,
        hosting,
        cache,
        true,
    )?;
    driver.track_upstream(&opts.projects)?;

    Ok(())
}
