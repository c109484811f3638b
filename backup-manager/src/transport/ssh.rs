//! SFTP remote store with key authentication.
//!
//! libssh2 is blocking, so every operation opens its own session inside
//! `spawn_blocking`. The configured timeout bounds connecting and each
//! individual protocol call, not the whole transfer.

use super::{RemoteEntry, RemoteStore};
use crate::{BackupError, Result};
use async_trait::async_trait;
use ssh2::{ErrorCode, RenameFlags, Session, Sftp};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// sftp status code for a missing file
const SFTP_NO_SUCH_FILE: i32 = 2;

#[derive(Debug, Clone)]
pub struct SshStore {
    host: String,
    port: u16,
    user: String,
    key_path: PathBuf,
    remote_dir: PathBuf,
    timeout: Duration,
}

impl SshStore {
    pub fn new(
        host: String,
        port: u16,
        user: String,
        key_path: PathBuf,
        remote_dir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            host,
            port,
            user,
            key_path,
            remote_dir,
            timeout,
        }
    }

    fn connect(&self) -> Result<Session> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| BackupError::Transfer(format!("cannot resolve {}: {}", self.host, e)))?
            .next()
            .ok_or_else(|| BackupError::Transfer(format!("no address for {}", self.host)))?;

        let tcp = TcpStream::connect_timeout(&addr, self.timeout).map_err(|e| {
            BackupError::Transfer(format!("cannot connect to {}:{}: {}", self.host, self.port, e))
        })?;

        let mut sess = Session::new().map_err(ssh_error("session"))?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout(u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX));
        sess.handshake().map_err(ssh_error("handshake"))?;
        sess.userauth_pubkey_file(&self.user, None, &self.key_path, None)
            .map_err(ssh_error("authentication"))?;

        if !sess.authenticated() {
            return Err(BackupError::Transfer(format!(
                "authentication as {} on {} failed",
                self.user, self.host
            )));
        }

        debug!(host = %self.host, user = %self.user, "SSH session established");
        Ok(sess)
    }

    fn sftp(&self) -> Result<Sftp> {
        self.connect()?.sftp().map_err(ssh_error("sftp"))
    }

    fn remote_path(&self, name: &str) -> PathBuf {
        self.remote_dir.join(name)
    }

    /// Run a blocking sftp operation off the async runtime.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SshStore, &Sftp) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let sftp = store.sftp()?;
            op(&store, &sftp)
        })
        .await?
    }
}

fn ssh_error(context: &'static str) -> impl Fn(ssh2::Error) -> BackupError {
    move |e| BackupError::Transfer(format!("ssh {}: {}", context, e))
}

fn is_missing(error: &ssh2::Error) -> bool {
    error.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE)
}

fn ensure_dir(sftp: &Sftp, dir: &Path) -> Result<()> {
    match sftp.stat(dir) {
        Ok(_) => Ok(()),
        Err(e) if is_missing(&e) => sftp.mkdir(dir, 0o750).map_err(ssh_error("mkdir")),
        Err(e) => Err(ssh_error("stat")(e)),
    }
}

#[async_trait]
impl RemoteStore for SshStore {
    fn describe(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.remote_dir.display())
    }

    async fn upload(&self, local: &Path, remote_name: &str) -> Result<()> {
        let local = local.to_path_buf();
        let remote_name = remote_name.to_string();
        self.blocking(move |store, sftp| {
            ensure_dir(sftp, &store.remote_dir)?;
            let target = store.remote_path(&remote_name);
            let partial = store.remote_path(&format!("{}.partial", remote_name));

            let mut reader = BufReader::new(File::open(&local)?);
            let mut remote = sftp.create(&partial).map_err(ssh_error("create"))?;
            std::io::copy(&mut reader, &mut remote)?;
            remote.fsync().map_err(ssh_error("fsync"))?;
            drop(remote);

            sftp.rename(
                &partial,
                &target,
                Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE),
            )
            .map_err(ssh_error("rename"))
        })
        .await
    }

    async fn download(&self, remote_name: &str, local: &Path) -> Result<()> {
        let local = local.to_path_buf();
        let remote_name = remote_name.to_string();
        self.blocking(move |store, sftp| {
            let mut remote = sftp
                .open(&store.remote_path(&remote_name))
                .map_err(ssh_error("open"))?;
            let mut writer = BufWriter::new(File::create(&local)?);
            std::io::copy(&mut remote, &mut writer)?;
            Ok(())
        })
        .await
    }

    async fn exists(&self, remote_name: &str) -> Result<bool> {
        let remote_name = remote_name.to_string();
        self.blocking(move |store, sftp| match sftp.stat(&store.remote_path(&remote_name)) {
            Ok(_) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(ssh_error("stat")(e)),
        })
        .await
    }

    async fn list(&self) -> Result<Vec<RemoteEntry>> {
        self.blocking(move |store, sftp| {
            let listing = match sftp.readdir(&store.remote_dir) {
                Ok(listing) => listing,
                Err(e) if is_missing(&e) => return Ok(Vec::new()),
                Err(e) => return Err(ssh_error("readdir")(e)),
            };

            let mut entries: Vec<RemoteEntry> = listing
                .into_iter()
                .filter(|(_, stat)| stat.is_file())
                .filter_map(|(path, stat)| {
                    let file_name = path.file_name()?.to_string_lossy().to_string();
                    Some(RemoteEntry {
                        file_name,
                        size_bytes: stat.size,
                    })
                })
                .collect();
            entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
            Ok(entries)
        })
        .await
    }

    async fn delete(&self, remote_name: &str) -> Result<()> {
        let remote_name = remote_name.to_string();
        self.blocking(move |store, sftp| match sftp.unlink(&store.remote_path(&remote_name)) {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(ssh_error("unlink")(e)),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(host: &str, port: u16) -> SshStore {
        SshStore::new(
            host.to_string(),
            port,
            "backup".to_string(),
            PathBuf::from("/nonexistent/id_ed25519"),
            PathBuf::from("/data/stack"),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            store("backup.example.com", 22).describe(),
            "backup@backup.example.com:/data/stack"
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transfer_error() {
        // Nothing listens on port 1 of the loopback interface
        let err = store("127.0.0.1", 1).exists("x").await.unwrap_err();
        assert!(matches!(err, BackupError::Transfer(_)));
        assert_eq!(err.exit_code(), 5);
    }
}
