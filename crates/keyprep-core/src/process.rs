//! External process execution.
//!
//! Every tool the subsystem shells out to (`security`, `openssl`) goes
//! through [`CommandRunner`] so the signing code can be exercised without
//! a macOS host.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{KeyprepError, Result};

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code (`-1` when terminated by a signal).
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given stderr.
    pub fn failure(status_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status_code,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runs external programs to completion.
///
/// Arguments may contain passwords; implementations must not log them.
/// Argument lists are visible to other local users through `ps`, so secrets
/// should travel through `env` wherever the tool can read them from there.
/// The `security` tool has no such option for keychain and PKCS#12
/// passwords, which is why those are generated per build or short-lived.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and additional environment variables,
    /// capturing its output.
    async fn run_with_env(
        &self,
        program: &str,
        args: &[String],
        env: &[(&str, &str)],
    ) -> Result<CommandOutput>;

    /// Runs `program` with `args` and captures its output.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.run_with_env(program, args, &[]).await
    }

    /// Like [`CommandRunner::run_checked`], with additional environment
    /// variables.
    async fn run_checked_with_env(
        &self,
        program: &str,
        args: &[String],
        env: &[(&str, &str)],
    ) -> Result<CommandOutput> {
        let output = self.run_with_env(program, args, env).await?;
        if !output.is_success() {
            return Err(KeyprepError::ExternalTool {
                program: program.to_string(),
                subcommand: subcommand(args).to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Runs `program` and fails with the trimmed stderr on a non-zero exit.
    async fn run_checked(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.run_checked_with_env(program, args, &[]).await
    }
}

/// Runs commands on the host via `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run_with_env(
        &self,
        program: &str,
        args: &[String],
        env: &[(&str, &str)],
    ) -> Result<CommandOutput> {
        tracing::debug!("Running {} {}", program, subcommand(args));

        let output = Command::new(program)
            .args(args)
            .envs(env.iter().copied())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| KeyprepError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// First argument of an invocation, the only part safe to log.
pub fn subcommand(args: &[String]) -> &str {
    args.first().map(String::as_str).unwrap_or("")
}
