// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Git subprocess primitive.
//!
//! Everything regent does to a repository's contents goes through the
//! system Git binary bound to an explicit `--git-dir`/`--work-tree` pair,
//! so a working copy can be driven without ever changing the process
//! working directory. Remote operations against the review service ride
//! SSH with a fixed key, injected through a generated `GIT_SSH` wrapper
//! script shared read-only by every invocation of one run.
//!
//! A non-zero exit status is an ordinary outcome here, not an error;
//! callers decide what a failed sub-command means. Only failure to launch
//! the binary itself surfaces as an error.

use std::{ffi::OsString, io::Write, path::Path, process::Command};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// Captured outcome of one git invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GitOutput {
    /// Process exit code, `-1` when terminated by a signal.
    pub code: i32,

    /// Combined stdout and stderr, trailing newlines chomped.
    pub text: String,
}

impl GitOutput {
    /// Whether the sub-command exited cleanly.
    pub fn ok(&self) -> bool {
        self.code == 0
    }
}

/// Layer of indirection for git invocation.
pub trait GitRunner {
    /// Run a git sub-command bound to the repository at `workdir`.
    fn git(&self, workdir: &Path, args: &[&str]) -> Result<GitOutput>;

    /// Like [`GitRunner::git`], with the review transport environment
    /// applied.
    fn git_remote(&self, workdir: &Path, args: &[&str]) -> Result<GitOutput>;

    /// Run git without binding to an existing working tree (clone, init).
    fn git_bare(&self, args: &[&str], remote: bool) -> Result<GitOutput>;
}

/// Git invocation through the system binary.
#[derive(Debug)]
pub struct SystemGit {
    ssh: Option<SshWrapper>,
}

impl SystemGit {
    /// Construct new system git runner.
    pub fn new(ssh: Option<SshWrapper>) -> Self {
        Self { ssh }
    }

    fn run(&self, args: Vec<OsString>, remote: bool) -> Result<GitOutput> {
        let mut command = Command::new("git");
        command.args(&args);
        if remote {
            if let Some(ssh) = &self.ssh {
                command.env("GIT_SSH", ssh.path());
            }
        }

        let rendered = args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        info!("executing command: git {rendered}");

        let output = command
            .output()
            .map_err(|err| GitError::Spawn { source: err })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr.as_ref());
        }

        // INVARIANT: Chomp trailing newlines.
        let text = text.trim_end_matches(['\r', '\n']).to_string();
        let code = output.status.code().unwrap_or(-1);

        if !text.is_empty() {
            if code == 0 {
                info!("output:\n{text}");
            } else {
                warn!("output:\n{text}");
            }
        }

        Ok(GitOutput { code, text })
    }
}

impl GitRunner for SystemGit {
    fn git(&self, workdir: &Path, args: &[&str]) -> Result<GitOutput> {
        self.run(bind_args(workdir, args), false)
    }

    fn git_remote(&self, workdir: &Path, args: &[&str]) -> Result<GitOutput> {
        self.run(bind_args(workdir, args), true)
    }

    fn git_bare(&self, args: &[&str], remote: bool) -> Result<GitOutput> {
        self.run(args.iter().map(OsString::from).collect(), remote)
    }
}

fn bind_args(workdir: &Path, args: &[&str]) -> Vec<OsString> {
    let mut bound: Vec<OsString> = vec![
        format!("--git-dir={}", workdir.join(".git").display()).into(),
        format!("--work-tree={}", workdir.display()).into(),
    ];
    bound.extend(args.iter().map(OsString::from));
    bound
}

/// Generated `GIT_SSH` wrapper script.
///
/// Fixes the private key, login name, and host-key checking policy for
/// every git-over-ssh invocation of a run. The script lives in a temporary
/// file that is removed when the wrapper is dropped.
#[derive(Debug)]
pub struct SshWrapper {
    script: NamedTempFile,
}

impl SshWrapper {
    /// Generate the wrapper script for the given login and key.
    ///
    /// # Errors
    ///
    /// - Return [`GitError::Wrapper`] if the script cannot be written or
    ///   marked executable.
    pub fn new(user: &str, key: impl AsRef<Path>) -> Result<Self> {
        let mut script = tempfile::Builder::new()
            .prefix("regent-ssh-")
            .suffix(".sh")
            .tempfile()
            .map_err(|err| GitError::Wrapper { source: err })?;

        writeln!(script, "#!/bin/sh")
            .and_then(|()| {
                writeln!(
                    script,
                    "exec ssh -i {} -l {} -o \"StrictHostKeyChecking no\" \"$@\"",
                    key.as_ref().display(),
                    user,
                )
            })
            .and_then(|()| script.flush())
            .map_err(|err| GitError::Wrapper { source: err })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o755);
            script
                .as_file()
                .set_permissions(permissions)
                .map_err(|err| GitError::Wrapper { source: err })?;
        }

        Ok(Self { script })
    }

    /// Absolute path of the wrapper script.
    pub fn path(&self) -> &Path {
        self.script.path()
    }
}

/// Git invocation error types.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// Git binary cannot be launched at all.
    #[error("failed to launch git")]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    /// SSH wrapper script cannot be generated.
    #[error("failed to generate ssh wrapper script")]
    Wrapper {
        #[source]
        source: std::io::Error,
    },
}

/// Friendly result alias :3
pub type Result<T, E = GitError> = std::result::Result<T, E>;


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn git_output_ok_tracks_exit_code() {
        assert!(GitOutput {
            code: 0,
            text: String::new()
        }
        .ok());
        assert!(!GitOutput {
            code: 128,
            text: String::new()
        }
        .ok());
    }

    #[test]
    fn bind_args_prepends_gitdir_and_worktree() {
        let bound = bind_args(Path::new("/tmp/scratch/project"), &["status"]);
        let rendered: Vec<String> = bound
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();

        assert_eq!(
            rendered,
            vec![
                "--git-dir=/tmp/scratch/project/.git".to_string(),
                "--work-tree=/tmp/scratch/project".to_string(),
                "status".to_string(),
            ],
        );
    }

    #[test]
    fn ssh_wrapper_script_fixes_key_and_login() -> anyhow::Result<()> {
        let wrapper = SshWrapper::new("reviewbot", "/etc/keys/review_rsa")?;
        let contents = std::fs::read_to_string(wrapper.path())?;

        assert!(contents.starts_with("#!/bin/sh\n"));
        assert!(contents.contains("-i /etc/keys/review_rsa"));
        assert!(contents.contains("-l reviewbot"));
        assert!(contents.contains("StrictHostKeyChecking no"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(wrapper.path())?.permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        Ok(())
    }

    #[test]
    fn ssh_wrapper_script_removed_on_drop() -> anyhow::Result<()> {
        let wrapper = SshWrapper::new("reviewbot", "/etc/keys/review_rsa")?;
        let path = wrapper.path().to_path_buf();
        assert!(path.exists());

        drop(wrapper);
        assert!(!path.exists());

        Ok(())
    }
}
