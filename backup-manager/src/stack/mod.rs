//! Access to the running container stack.
//!
//! Everything the snapshot and restore code needs from the container runtime
//! goes through [`Stack`], so both can run against a fake in tests.

pub mod compose;

use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use compose::ComposeStack;

/// A command run inside a service container.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub service: String,
    pub args: Vec<String>,
    /// Passed through the environment, never on the command line
    pub env: Vec<(String, String)>,
    /// Feed this file to the command's stdin
    pub stdin: Option<PathBuf>,
    /// Stream the command's stdout into this file instead of capturing it
    pub stdout: Option<PathBuf>,
    pub timeout: Duration,
}

impl ExecRequest {
    pub fn new<I, S>(service: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service: service.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            stdin: None,
            stdout: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn stdin(mut self, path: &Path) -> Self {
        self.stdin = Some(path.to_path_buf());
        self
    }

    pub fn stdout(mut self, path: &Path) -> Self {
        self.stdout = Some(path.to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Name of the program being run, for log and error messages.
    pub fn program(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Short failure description: exit status plus the last stderr line.
    pub fn failure_reason(&self) -> String {
        let detail = self
            .stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .or_else(|| self.stdout.lines().rev().find(|l| !l.trim().is_empty()))
            .unwrap_or("no output")
            .trim()
            .to_string();
        match self.status {
            Some(code) => format!("exited with {}: {}", code, detail),
            None => format!("terminated by signal: {}", detail),
        }
    }
}

#[async_trait]
pub trait Stack: Send + Sync {
    /// Run a command inside a running service container.
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput>;

    /// Copy a file out of a service container.
    async fn copy_from(
        &self,
        service: &str,
        container_path: &str,
        host_path: &Path,
        timeout: Duration,
    ) -> Result<()>;

    /// Copy a file into a service container.
    async fn copy_to(
        &self,
        service: &str,
        host_path: &Path,
        container_path: &str,
        timeout: Duration,
    ) -> Result<()>;

    async fn stop(&self, services: &[String]) -> Result<()>;

    /// Start (or create) the given services, detached.
    async fn start(&self, services: &[String]) -> Result<()>;

    /// Bring the whole stack up, detached.
    async fn up_all(&self) -> Result<()>;
}
