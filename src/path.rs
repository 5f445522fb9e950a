// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that need to be
//! interacted with, or managed in some way.

use std::path::PathBuf;

/// Determine default absolute path to the project-config directory.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/regent` as the default
/// location of `regent.toml` and `projects.yaml` when no explicit directory
/// is given on the command line. Does not check if the path returned
/// actually exists.
///
/// # Errors
///
/// - Return [`NoConfigHome`] if the configuration directory path cannot be
///   determined.
pub fn default_project_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("regent"))
        .ok_or(NoConfigHome)
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoConfigHome;

/// Friendly result alias :3
pub type Result<T, E = NoConfigHome> = std::result::Result<T, E>;
