//! Live service credentials, read from the stack's current env file.
//!
//! Restores always connect with these values. Nothing in an archive
//! (including its `config.env` artifact) is ever used as a credential source.

use crate::{BackupError, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseCredentials {
    pub user: String,
    pub password: String,
    pub name: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct LiveCredentials {
    /// Absent when the env file has neither `POSTGRES_USER` nor `POSTGRES_PASSWORD`
    pub database: Option<DatabaseCredentials>,
    pub cache_password: Option<String>,
    pub vector_store_api_key: Option<String>,
}

impl LiveCredentials {
    /// Read credentials from an env file (`KEY=value` lines, as docker compose uses).
    pub fn load(env_file: &Path) -> Result<Self> {
        let iter = dotenvy::from_path_iter(env_file).map_err(|e| {
            BackupError::Configuration(format!(
                "cannot read env file {}: {}",
                env_file.display(),
                e
            ))
        })?;

        let mut vars = HashMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| {
                BackupError::Configuration(format!("invalid env file {}: {}", env_file.display(), e))
            })?;
            vars.insert(key, value);
        }

        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let non_empty = |key: &str| vars.get(key).filter(|v| !v.is_empty()).cloned();

        let database = match (non_empty("POSTGRES_USER"), non_empty("POSTGRES_PASSWORD")) {
            (Some(user), Some(password)) => {
                // Postgres images default the database name to the user name
                let name = non_empty("POSTGRES_DB").unwrap_or_else(|| user.clone());
                Some(DatabaseCredentials {
                    user,
                    password,
                    name,
                })
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(BackupError::Configuration("POSTGRES_PASSWORD is not set".into()))
            }
            (None, Some(_)) => {
                return Err(BackupError::Configuration("POSTGRES_USER is not set".into()))
            }
        };

        Ok(Self {
            database,
            cache_password: non_empty("REDIS_PASSWORD"),
            vector_store_api_key: non_empty("QDRANT__SERVICE__API_KEY")
                .or_else(|| non_empty("QDRANT_API_KEY")),
        })
    }

    /// Database credentials, for operations that touch the database.
    pub fn require_database(&self) -> Result<&DatabaseCredentials> {
        self.database.as_ref().ok_or_else(|| {
            BackupError::Configuration(
                "POSTGRES_USER and POSTGRES_PASSWORD are not set in the live env file".into(),
            )
        })
    }
}

impl fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("user", &self.user)
            .field("password", &"****")
            .field("name", &self.name)
            .finish()
    }
}

impl fmt::Debug for LiveCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveCredentials")
            .field("database", &self.database)
            .field("cache_password", &self.cache_password.as_ref().map(|_| "****"))
            .field(
                "vector_store_api_key",
                &self.vector_store_api_key.as_ref().map(|_| "****"),
            )
            .finish()
    }
}
