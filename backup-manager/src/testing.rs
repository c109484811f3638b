//! Test doubles shared by the unit tests.

use crate::archive::{seal, ArchiveName, ArtifactKind, BackupKind, StagedArtifact};
use crate::config::Config;
use crate::credentials::LiveCredentials;
use crate::health::HealthProbe;
use crate::snapshot::SnapshotSettings;
use crate::stack::{ExecOutput, ExecRequest, Stack};
use crate::transport::{RemoteEntry, RemoteStore};
use crate::{BackupError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const ENV_FILE: &str = "POSTGRES_USER=app\nPOSTGRES_PASSWORD=live-secret\nPOSTGRES_DB=appdb\nREDIS_PASSWORD=cache-secret\n";

pub fn credentials() -> LiveCredentials {
    let vars: HashMap<String, String> = ENV_FILE
        .lines()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    LiveCredentials::from_vars(&vars).unwrap()
}

pub fn fast_settings() -> SnapshotSettings {
    SnapshotSettings {
        connect_timeout: Duration::from_secs(1),
        operation_timeout: Duration::from_secs(5),
        cache_save_wait: Duration::from_millis(50),
        cache_poll_interval: Duration::from_millis(5),
        min_vector_store_bytes: 16,
    }
}

/// Config rooted in `root`, with a live env file and no waiting.
pub fn test_config(root: &Path) -> Config {
    let env_file = root.join("stack.env");
    std::fs::write(&env_file, ENV_FILE).unwrap();

    let mut config = Config::default();
    config.backup.root_dir = root.to_path_buf();
    config.backup.cache_save_wait_secs = 0;
    config.backup.cache_poll_interval_secs = 0;
    config.backup.min_vector_store_bytes = 16;
    config.stack.project_dir = root.to_path_buf();
    config.stack.env_file = env_file;
    config.stack.health_attempts = 1;
    config.stack.health_interval_secs = 0;
    config
}

/// Seal an archive with the given artifacts outside the catalog.
pub fn write_archive(root: &Path, artifacts: &[(ArtifactKind, &str)]) -> PathBuf {
    let dir = root.join("incoming");
    std::fs::create_dir_all(&dir).unwrap();
    let staging = tempfile::TempDir::new_in(&dir).unwrap();

    let staged: Vec<StagedArtifact> = artifacts
        .iter()
        .map(|(kind, content)| {
            let path = staging.path().join(kind.file_name());
            std::fs::write(&path, content).unwrap();
            StagedArtifact { kind: *kind, path }
        })
        .collect();

    let name = ArchiveName::new(BackupKind::Full, Utc::now());
    seal(staging.path(), &dir, &name, "test-host", &staged, 3)
        .unwrap()
        .path
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    env: Vec<(String, Vec<(String, String)>)>,
    last_save: i64,
    psql_commands: Vec<String>,
    imported_sql: Option<String>,
    vector_restored: Option<Vec<u8>>,
    copied_into: HashMap<String, Vec<u8>>,
}

/// In-memory stand-in for the compose stack.
pub struct FakeStack {
    database_up: bool,
    cache_save_completes: bool,
    import_fails: bool,
    vector_payload: Vec<u8>,
    state: Mutex<FakeState>,
}

impl FakeStack {
    pub fn healthy() -> Self {
        Self {
            database_up: true,
            cache_save_completes: true,
            import_fails: false,
            vector_payload: vec![7u8; 4096],
            state: Mutex::new(FakeState {
                last_save: 1_760_000_000,
                ..FakeState::default()
            }),
        }
    }

    pub fn with_database_down(mut self) -> Self {
        self.database_up = false;
        self
    }

    pub fn with_cache_save_stuck(mut self) -> Self {
        self.cache_save_completes = false;
        self
    }

    pub fn with_import_failure(mut self) -> Self {
        self.import_fails = true;
        self
    }

    pub fn with_vector_payload(mut self, payload: Vec<u8>) -> Self {
        self.vector_payload = payload;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Every environment variable passed to `program`.
    pub fn env_seen(&self, program: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .unwrap()
            .env
            .iter()
            .filter(|(p, _)| p == program)
            .flat_map(|(_, env)| env.clone())
            .collect()
    }

    pub fn psql_commands(&self) -> Vec<String> {
        self.state.lock().unwrap().psql_commands.clone()
    }

    pub fn imported_sql(&self) -> Option<String> {
        self.state.lock().unwrap().imported_sql.clone()
    }

    pub fn restored_vector_payload(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().vector_restored.clone()
    }

    pub fn copied_into(&self, service: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().copied_into.get(service).cloned()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

fn output(status: i32, stdout: &str, stderr: &str) -> ExecOutput {
    ExecOutput {
        status: Some(status),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl Stack for FakeStack {
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        self.record(format!("exec {} {}", request.service, request.args.join(" ")));
        let mut state = self.state.lock().unwrap();
        state
            .env
            .push((request.program().to_string(), request.env.clone()));

        let stdin = match &request.stdin {
            Some(path) => Some(std::fs::read(path)?),
            None => None,
        };

        let result = match request.program() {
            "pg_isready" if self.database_up => output(0, "accepting connections", ""),
            "pg_isready" => output(2, "", "no response"),
            "pg_dump" => {
                if let Some(path) = &request.stdout {
                    std::fs::write(path, "CREATE TABLE notes (id int, body text);\nINSERT INTO notes VALUES (1, 'hello');\n")?;
                }
                output(0, "", "")
            }
            "psql" => match stdin {
                Some(_) if self.import_fails => output(3, "", "ERROR:  syntax error at or near \"BROKEN\""),
                Some(sql) => {
                    state.imported_sql = Some(String::from_utf8_lossy(&sql).to_string());
                    output(0, "", "")
                }
                None => {
                    if let Some(pos) = request.args.iter().position(|a| a == "-c") {
                        if let Some(sql) = request.args.get(pos + 1) {
                            state.psql_commands.push(sql.clone());
                        }
                    }
                    output(0, "", "")
                }
            },
            "redis-cli" => match request.args.get(1).map(String::as_str) {
                Some("PING") => output(0, "PONG\n", ""),
                Some("LASTSAVE") => output(0, &format!("{}\n", state.last_save), ""),
                Some("BGSAVE") => {
                    if self.cache_save_completes {
                        state.last_save += 1;
                    }
                    output(0, "Background saving started\n", "")
                }
                _ => output(1, "", "ERR unknown command"),
            },
            "test" => output(0, "", ""),
            "tar" => {
                if let Some(path) = &request.stdout {
                    std::fs::write(path, &self.vector_payload)?;
                }
                output(0, "", "")
            }
            "sh" => {
                state.vector_restored = stdin;
                output(0, "", "")
            }
            other => output(127, "", &format!("{}: not found", other)),
        };
        Ok(result)
    }

    async fn copy_from(
        &self,
        service: &str,
        container_path: &str,
        host_path: &Path,
        _timeout: Duration,
    ) -> Result<()> {
        self.record(format!("copy-from {} {}", service, container_path));
        std::fs::write(host_path, b"REDIS0011-fake")?;
        Ok(())
    }

    async fn copy_to(
        &self,
        service: &str,
        host_path: &Path,
        container_path: &str,
        _timeout: Duration,
    ) -> Result<()> {
        self.record(format!("copy-to {} {}", service, container_path));
        let content = std::fs::read(host_path)?;
        self.state
            .lock()
            .unwrap()
            .copied_into
            .insert(service.to_string(), content);
        Ok(())
    }

    async fn stop(&self, services: &[String]) -> Result<()> {
        self.record(format!("stop {}", services.join(" ")));
        Ok(())
    }

    async fn start(&self, services: &[String]) -> Result<()> {
        self.record(format!("start {}", services.join(" ")));
        Ok(())
    }

    async fn up_all(&self) -> Result<()> {
        self.record("up-all".to_string());
        Ok(())
    }
}

/// A remote that is never reachable.
pub struct FailingStore;

#[async_trait]
impl RemoteStore for FailingStore {
    fn describe(&self) -> String {
        "unreachable-remote".to_string()
    }

    async fn upload(&self, _local: &Path, _remote_name: &str) -> Result<()> {
        Err(BackupError::Transfer("connection refused".into()))
    }

    async fn download(&self, _remote_name: &str, _local: &Path) -> Result<()> {
        Err(BackupError::Transfer("connection refused".into()))
    }

    async fn exists(&self, _remote_name: &str) -> Result<bool> {
        Err(BackupError::Transfer("connection refused".into()))
    }

    async fn list(&self) -> Result<Vec<RemoteEntry>> {
        Err(BackupError::Transfer("connection refused".into()))
    }

    async fn delete(&self, _remote_name: &str) -> Result<()> {
        Err(BackupError::Transfer("connection refused".into()))
    }
}

/// Health probe that turns healthy on a given attempt.
pub struct ScriptedHealth {
    healthy_from: Option<u32>,
    attempts: AtomicU32,
}

impl ScriptedHealth {
    pub fn healthy_after(attempt: u32) -> Self {
        Self {
            healthy_from: Some(attempt),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn never() -> Self {
        Self {
            healthy_from: None,
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl HealthProbe for ScriptedHealth {
    fn target(&self) -> String {
        "http://app.test/health".to_string()
    }

    async fn check(&self) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.healthy_from {
            Some(from) if attempt >= from => Ok(()),
            _ => Err(BackupError::service_unavailable(self.target(), "HTTP 503")),
        }
    }
}
