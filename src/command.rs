//! Typed access to external programs.
//!
//! Every interaction with the operating system (network manager, signals,
//! process lookup) goes through [`CommandRunner`], so callers always get the
//! exit status and captured stderr and can decide themselves whether a failure
//! is worth surfacing.

use anyhow::{Context, Result, bail};
use log::debug;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::process::Stdio;
use tokio::process::Command;
use trait_variant::make;

/// Captured result of a finished external command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Convert a non-zero exit into an error carrying status and stderr
    ///
    /// # Arguments
    /// * `label` - Human readable name of the operation, used in the error message
    ///
    /// # Returns
    /// The captured stdout on success
    pub fn ensure_success(self, label: &str) -> Result<String> {
        if !self.success() {
            let status = self
                .status
                .map_or_else(|| "signal".to_string(), |code| code.to_string());
            bail!(
                "failed to {label}: exit status {status}: {}",
                self.stderr.trim()
            );
        }

        Ok(self.stdout)
    }
}

#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait CommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs commands on the host via `tokio::process`
#[derive(Clone, Debug, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!("exec {program} {}", args.join(" "));

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .context(format!("failed to execute {program}"))?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Convenience for building argument vectors from string literals
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
