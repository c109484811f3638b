//! [`Stack`] implementation that shells out to `docker compose`.

use super::{ExecOutput, ExecRequest, Stack};
use crate::config::StackConfig;
use crate::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

pub struct ComposeStack {
    command: Vec<String>,
    project_dir: PathBuf,
    compose_file: Option<PathBuf>,
    project_name: Option<String>,
    /// Bound for stop/start/up
    lifecycle_timeout: Duration,
}

impl ComposeStack {
    pub fn new(config: &StackConfig, lifecycle_timeout: Duration) -> Result<Self> {
        if config.compose_command.is_empty() {
            return Err(BackupError::Configuration(
                "stack.compose_command must not be empty".into(),
            ));
        }

        Ok(Self {
            command: config.compose_command.clone(),
            project_dir: config.project_dir.clone(),
            compose_file: config.compose_file.clone(),
            project_name: config.project_name.clone(),
            lifecycle_timeout,
        })
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        if let Some(file) = &self.compose_file {
            cmd.arg("-f").arg(file);
        }
        if let Some(project) = &self.project_name {
            cmd.arg("-p").arg(project);
        }
        cmd.current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, mut cmd: Command, timeout: Duration, what: &str) -> Result<ExecOutput> {
        let child = cmd.spawn().map_err(|e| {
            BackupError::Command(format!("{}: cannot start {}: {}", what, self.command[0], e))
        })?;

        // On timeout the child is dropped and killed
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BackupError::Command(format!(
                    "{} timed out after {}s",
                    what,
                    timeout.as_secs()
                )))
            }
        };

        let output = ExecOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        debug!(what, status = ?output.status, "Compose command finished");
        Ok(output)
    }

    async fn run_checked(&self, cmd: Command, timeout: Duration, what: &str) -> Result<()> {
        let output = self.run(cmd, timeout, what).await?;
        if output.success() {
            Ok(())
        } else {
            Err(BackupError::Command(format!("{} {}", what, output.failure_reason())))
        }
    }
}

#[async_trait]
impl Stack for ComposeStack {
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        let mut cmd = self.base_command();
        cmd.arg("exec").arg("-T");
        for (key, value) in &request.env {
            // `-e KEY` makes compose take the value from its own environment
            cmd.arg("-e").arg(key);
            cmd.env(key, value);
        }
        cmd.arg(&request.service).args(&request.args);

        if let Some(path) = &request.stdin {
            cmd.stdin(Stdio::from(std::fs::File::open(path)?));
        }
        if let Some(path) = &request.stdout {
            cmd.stdout(Stdio::from(std::fs::File::create(path)?));
        }

        let what = format!("{} in {}", request.program(), request.service);
        self.run(cmd, request.timeout, &what).await
    }

    async fn copy_from(
        &self,
        service: &str,
        container_path: &str,
        host_path: &Path,
        timeout: Duration,
    ) -> Result<()> {
        let mut cmd = self.base_command();
        cmd.arg("cp")
            .arg(format!("{}:{}", service, container_path))
            .arg(host_path);
        self.run_checked(cmd, timeout, &format!("copy from {}", service))
            .await
    }

    async fn copy_to(
        &self,
        service: &str,
        host_path: &Path,
        container_path: &str,
        timeout: Duration,
    ) -> Result<()> {
        let mut cmd = self.base_command();
        cmd.arg("cp")
            .arg(host_path)
            .arg(format!("{}:{}", service, container_path));
        self.run_checked(cmd, timeout, &format!("copy to {}", service))
            .await
    }

    async fn stop(&self, services: &[String]) -> Result<()> {
        info!(?services, "Stopping services");
        let mut cmd = self.base_command();
        cmd.arg("stop").args(services);
        self.run_checked(cmd, self.lifecycle_timeout, "compose stop")
            .await
    }

    async fn start(&self, services: &[String]) -> Result<()> {
        info!(?services, "Starting services");
        let mut cmd = self.base_command();
        cmd.arg("up").arg("-d").args(services);
        self.run_checked(cmd, self.lifecycle_timeout, "compose up")
            .await
    }

    async fn up_all(&self) -> Result<()> {
        info!("Starting full stack");
        let mut cmd = self.base_command();
        cmd.arg("up").arg("-d");
        self.run_checked(cmd, self.lifecycle_timeout, "compose up")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack_with(command: &[&str]) -> ComposeStack {
        let config = StackConfig {
            compose_command: command.iter().map(|s| s.to_string()).collect(),
            project_dir: std::env::temp_dir(),
            ..StackConfig::default()
        };
        ComposeStack::new(&config, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_empty_command_rejected() {
        let config = StackConfig {
            compose_command: vec![],
            ..StackConfig::default()
        };
        assert!(ComposeStack::new(&config, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_exec_builds_compose_arguments() {
        // `echo` stands in for docker compose and prints the argv it received
        let stack = stack_with(&["echo", "compose"]);
        let output = stack
            .exec(ExecRequest::new("postgres", ["pg_isready", "-t", "5"]).env("PGPASSWORD", "pw"))
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(
            output.stdout.trim(),
            "compose exec -T -e PGPASSWORD postgres pg_isready -t 5"
        );
        assert!(!output.stdout.contains("pw "));
    }

    #[tokio::test]
    async fn test_exec_streams_stdout_to_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("dump.sql");
        let stack = stack_with(&["echo"]);
        stack
            .exec(ExecRequest::new("postgres", ["pg_dump"]).stdout(&out))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&out).unwrap().trim(),
            "exec -T postgres pg_dump"
        );
    }

    #[tokio::test]
    async fn test_exec_timeout() {
        // Trailing compose arguments land in $0.. and are ignored
        let stack = stack_with(&["sh", "-c", "sleep 5"]);
        let err = stack
            .exec(ExecRequest::new("svc", Vec::<String>::new()).timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_failed_lifecycle_command_is_error() {
        let stack = stack_with(&["false"]);
        assert!(stack.stop(&["api".to_string()]).await.is_err());
    }
}
