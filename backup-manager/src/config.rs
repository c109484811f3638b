//! Configuration management for the backup manager.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`STACK_BACKUP__<SECTION>__<KEY>`). The result is validated once and then
//! treated as immutable for the rest of the run.

use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/stack-backup/config.toml";

const ENV_PREFIX: &str = "STACK_BACKUP";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    /// Remote retention target (absent = local-only backups)
    #[serde(default)]
    pub remote: Option<RemoteConfig>,

    #[serde(default)]
    pub stack: StackConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Root of the local backup tree (`scheduled/` and `manual/` live below it)
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// zstd level for sealed archives (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Upper bound for reachability probes
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound for a single dump/copy/import command
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// How long to wait for the cache's background save
    #[serde(default = "default_cache_save_wait")]
    pub cache_save_wait_secs: u64,

    #[serde(default = "default_cache_poll_interval")]
    pub cache_poll_interval_secs: u64,

    /// Vector-store payloads smaller than this are treated as failed
    #[serde(default = "default_min_vector_store_bytes")]
    pub min_vector_store_bytes: u64,

    /// A run lock older than this is considered abandoned
    #[serde(default = "default_lock_max_age")]
    pub lock_max_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_local_days")]
    pub local_days: u32,

    #[serde(default = "default_remote_days")]
    pub remote_days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    /// SFTP over SSH with key authentication
    Ssh,
    /// A mounted directory (NFS, external disk)
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_kind")]
    pub kind: RemoteKind,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default)]
    pub user: Option<String>,

    /// Remote directory receiving the archives
    pub path: PathBuf,

    /// Private key used for authentication
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    #[serde(default = "default_remote_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Keep the local copy after a successful transfer
    #[serde(default)]
    pub keep_local: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Compose invocation, e.g. `["docker", "compose"]` or `["docker-compose"]`
    #[serde(default = "default_compose_command")]
    pub compose_command: Vec<String>,

    /// Directory commands are run from
    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,

    #[serde(default)]
    pub compose_file: Option<PathBuf>,

    #[serde(default)]
    pub project_name: Option<String>,

    /// The stack's env file; source of live credentials and the config artifact
    #[serde(default = "default_env_file")]
    pub env_file: PathBuf,

    #[serde(default = "default_database_service")]
    pub database_service: String,

    #[serde(default = "default_cache_service")]
    pub cache_service: String,

    #[serde(default = "default_vector_store_service")]
    pub vector_store_service: String,

    /// Application services stopped while state is replaced
    #[serde(default = "default_app_services")]
    pub app_services: Vec<String>,

    #[serde(default = "default_cache_dump_path")]
    pub cache_dump_path: String,

    #[serde(default = "default_vector_store_dir")]
    pub vector_store_dir: String,

    /// `user:group` that owns the vector-store directory inside its container
    #[serde(default = "default_vector_store_owner")]
    pub vector_store_owner: String,

    #[serde(default = "default_health_url")]
    pub health_url: String,

    #[serde(default = "default_health_attempts")]
    pub health_attempts: u32,

    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Operation log file (defaults to `<root_dir>/stack-backup.log`)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default values
fn default_root_dir() -> PathBuf {
    PathBuf::from("/var/backups/stack")
}

fn default_compression_level() -> i32 {
    3
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_operation_timeout() -> u64 {
    3600
}

fn default_cache_save_wait() -> u64 {
    60
}

fn default_cache_poll_interval() -> u64 {
    2
}

fn default_min_vector_store_bytes() -> u64 {
    1024
}

fn default_lock_max_age() -> u64 {
    6 * 3600
}

fn default_local_days() -> u32 {
    7
}

fn default_remote_days() -> u32 {
    30
}

fn default_remote_kind() -> RemoteKind {
    RemoteKind::Ssh
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_connect_timeout() -> u64 {
    30
}

fn default_compose_command() -> Vec<String> {
    vec!["docker".to_string(), "compose".to_string()]
}

fn default_project_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_env_file() -> PathBuf {
    PathBuf::from(".env")
}

fn default_database_service() -> String {
    "postgres".to_string()
}

fn default_cache_service() -> String {
    "redis".to_string()
}

fn default_vector_store_service() -> String {
    "qdrant".to_string()
}

fn default_app_services() -> Vec<String> {
    vec!["api".to_string(), "worker".to_string(), "beat".to_string()]
}

fn default_cache_dump_path() -> String {
    "/data/dump.rdb".to_string()
}

fn default_vector_store_dir() -> String {
    "/qdrant/storage".to_string()
}

fn default_vector_store_owner() -> String {
    "root:root".to_string()
}

fn default_health_url() -> String {
    "http://localhost:8000/health".to_string()
}

fn default_health_attempts() -> u32 {
    30
}

fn default_health_interval() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            compression_level: default_compression_level(),
            connect_timeout_secs: default_connect_timeout(),
            operation_timeout_secs: default_operation_timeout(),
            cache_save_wait_secs: default_cache_save_wait(),
            cache_poll_interval_secs: default_cache_poll_interval(),
            min_vector_store_bytes: default_min_vector_store_bytes(),
            lock_max_age_secs: default_lock_max_age(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            local_days: default_local_days(),
            remote_days: default_remote_days(),
        }
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            compose_command: default_compose_command(),
            project_dir: default_project_dir(),
            compose_file: None,
            project_name: None,
            env_file: default_env_file(),
            database_service: default_database_service(),
            cache_service: default_cache_service(),
            vector_store_service: default_vector_store_service(),
            app_services: default_app_services(),
            cache_dump_path: default_cache_dump_path(),
            vector_store_dir: default_vector_store_dir(),
            vector_store_owner: default_vector_store_owner(),
            health_url: default_health_url(),
            health_attempts: default_health_attempts(),
            health_interval_secs: default_health_interval(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file layered with environment overrides.
    ///
    /// Without an explicit path the default location is used if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let settings = ::config::Config::builder()
            .add_source(
                ::config::File::from(file.as_path())
                    .format(::config::FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| BackupError::Configuration(format!("{}: {}", file.display(), e)))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BackupError::Configuration(format!("{}: {}", file.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| BackupError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would only fail halfway through a run.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.backup.root_dir.as_os_str().is_empty() {
            problems.push("backup.root_dir must not be empty".to_string());
        }
        if !(1..=22).contains(&self.backup.compression_level) {
            problems.push(format!(
                "backup.compression_level must be between 1 and 22 (got {})",
                self.backup.compression_level
            ));
        }
        if self.backup.connect_timeout_secs == 0 || self.backup.operation_timeout_secs == 0 {
            problems.push("backup timeouts must be greater than zero".to_string());
        }
        if self.backup.cache_poll_interval_secs == 0 {
            problems.push("backup.cache_poll_interval_secs must be greater than zero".to_string());
        }
        if self.stack.compose_command.is_empty() {
            problems.push("stack.compose_command must not be empty".to_string());
        }
        if self.stack.health_attempts == 0 {
            problems.push("stack.health_attempts must be at least 1".to_string());
        }

        if let Some(remote) = &self.remote {
            if remote.path.as_os_str().is_empty() {
                problems.push("remote.path must not be empty".to_string());
            }
            if remote.kind == RemoteKind::Ssh {
                if remote.host.as_deref().map_or(true, str::is_empty) {
                    problems.push("remote.host is required for ssh remotes".to_string());
                }
                if remote.user.as_deref().map_or(true, str::is_empty) {
                    problems.push("remote.user is required for ssh remotes".to_string());
                }
                match &remote.key_path {
                    None => problems.push("remote.key_path is required for ssh remotes".to_string()),
                    Some(key) if !key.exists() => problems.push(format!(
                        "remote.key_path {} does not exist",
                        key.display()
                    )),
                    Some(_) => {}
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BackupError::Configuration(problems.join("; ")))
        }
    }

    /// Operation log file location.
    pub fn log_file(&self) -> PathBuf {
        self.log
            .file
            .clone()
            .unwrap_or_else(|| self.backup.root_dir.join("stack-backup.log"))
    }

    /// Env file resolved against the compose project directory.
    pub fn env_file(&self) -> PathBuf {
        if self.stack.env_file.is_absolute() {
            self.stack.env_file.clone()
        } else {
            self.stack.project_dir.join(&self.stack.env_file)
        }
    }
}

impl BackupConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn lock_max_age(&self) -> Duration {
        Duration::from_secs(self.lock_max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.remote.is_none());
        assert_eq!(config.retention.local_days, 7);
        assert_eq!(config.retention.remote_days, 30);
        assert_eq!(config.stack.database_service, "postgres");
    }

    #[test]
    fn test_parse_full_file() {
        let key = NamedTempFile::new().unwrap();
        let content = format!(
            r#"
[backup]
root_dir = "/srv/backups"
compression_level = 9

[retention]
local_days = 3
remote_days = 60

[remote]
kind = "ssh"
host = "backup.example.com"
user = "backup"
path = "/data/stack"
key_path = "{}"
keep_local = true

[stack]
app_services = ["api", "celery"]
"#,
            key.path().display()
        );

        let config = Config::from_toml(&content).unwrap();
        assert_eq!(config.backup.root_dir, PathBuf::from("/srv/backups"));
        assert_eq!(config.backup.compression_level, 9);
        assert_eq!(config.retention.local_days, 3);
        let remote = config.remote.unwrap();
        assert_eq!(remote.kind, RemoteKind::Ssh);
        assert_eq!(remote.port, 22);
        assert!(remote.keep_local);
        assert_eq!(config.stack.app_services, vec!["api", "celery"]);
    }

    #[test]
    fn test_ssh_remote_requires_host_user_and_key() {
        let content = r#"
[remote]
kind = "ssh"
path = "/data/stack"
"#;
        let err = Config::from_toml(content).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, BackupError::Configuration(_)));
        assert!(message.contains("remote.host"));
        assert!(message.contains("remote.user"));
        assert!(message.contains("remote.key_path"));
    }

    #[test]
    fn test_directory_remote_needs_only_path() {
        let content = r#"
[remote]
kind = "directory"
path = "/mnt/offsite"
"#;
        let config = Config::from_toml(content).unwrap();
        assert_eq!(config.remote.unwrap().kind, RemoteKind::Directory);
    }

    #[test]
    fn test_invalid_compression_level_rejected() {
        let content = "[backup]\ncompression_level = 40\n";
        assert!(matches!(
            Config::from_toml(content),
            Err(BackupError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[retention]").unwrap();
        writeln!(file, "local_days = 1").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.retention.local_days, 1);
        assert_eq!(config.retention.remote_days, 30);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let err = Config::load(Some(Path::new("/nonexistent/stack-backup.toml"))).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_log_file_defaults_under_root() {
        let config = Config::default();
        assert_eq!(
            config.log_file(),
            PathBuf::from("/var/backups/stack/stack-backup.log")
        );
    }
}
