//! Crontab entry for scheduled backups.
//!
//! The entry is a single line tagged with [`CRON_MARKER`]; every other line
//! of the user's crontab is left untouched.

use crate::archive::BackupKind;
use crate::{BackupError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

pub const CRON_MARKER: &str = "# stack-backup";

const CRONTAB_TIMEOUT: Duration = Duration::from_secs(30);

const CRON_MACROS: [&str; 8] = [
    "@reboot", "@yearly", "@annually", "@monthly", "@weekly", "@daily", "@midnight", "@hourly",
];

/// Accept a classic five-field expression or one of the `@` macros.
pub fn validate_cron(expr: &str) -> Result<()> {
    let expr = expr.trim();
    if expr.starts_with('@') {
        return if CRON_MACROS.contains(&expr) {
            Ok(())
        } else {
            Err(BackupError::Configuration(format!("unknown cron macro: {}", expr)))
        };
    }

    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(BackupError::Configuration(format!(
            "cron expression must have 5 fields, got {}: {:?}",
            fields.len(),
            expr
        )));
    }

    for field in fields {
        let valid = field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | ',' | '-' | '/'));
        if !valid {
            return Err(BackupError::Configuration(format!(
                "invalid cron field {:?} in {:?}",
                field, expr
            )));
        }
    }
    Ok(())
}

/// A scheduled `backup` invocation.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub cron: String,
    pub kind: BackupKind,
    pub binary: PathBuf,
    pub config: Option<PathBuf>,
}

impl ScheduleEntry {
    pub fn new(cron: &str, kind: BackupKind, binary: PathBuf, config: Option<PathBuf>) -> Result<Self> {
        validate_cron(cron)?;
        Ok(Self {
            cron: cron.trim().to_string(),
            kind,
            binary,
            config,
        })
    }

    /// The crontab line. Output goes to the operation log, not to cron mail.
    pub fn line(&self) -> String {
        let mut command = shell_quote(&self.binary);
        if let Some(config) = &self.config {
            command.push_str(" --config ");
            command.push_str(&shell_quote(config));
        }
        format!(
            "{} {} backup {} --scheduled >/dev/null 2>&1 {}",
            self.cron, command, self.kind, CRON_MARKER
        )
    }
}

fn shell_quote(path: &Path) -> String {
    let s = path.to_string_lossy();
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

fn is_ours(line: &str) -> bool {
    line.trim_end().ends_with(CRON_MARKER)
}

/// Drop any existing tagged line and append `entry`, if given.
pub fn merge_crontab(existing: &str, entry: Option<&str>) -> String {
    let mut lines: Vec<&str> = existing.lines().filter(|l| !is_ours(l)).collect();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    if let Some(entry) = entry {
        lines.push(entry);
    }

    let mut merged = lines.join("\n");
    if !merged.is_empty() {
        // cron ignores a last line without a newline
        merged.push('\n');
    }
    merged
}

/// The tagged line of a crontab, if present.
pub fn find_entry(crontab: &str) -> Option<String> {
    crontab.lines().find(|l| is_ours(l)).map(str::to_string)
}

/// Access to the invoking user's crontab through the `crontab` binary.
pub struct Crontab {
    program: PathBuf,
}

impl Default for Crontab {
    fn default() -> Self {
        Self {
            program: PathBuf::from("crontab"),
        }
    }
}

impl Crontab {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn read(&self) -> Result<String> {
        let child = Command::new(&self.program)
            .arg("-l")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackupError::Command(format!("cannot run {}: {}", self.program.display(), e)))?;

        let output = tokio::time::timeout(CRONTAB_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| BackupError::Command("crontab -l timed out".into()))??;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("no crontab") {
            debug!("No crontab installed yet");
            return Ok(String::new());
        }
        Err(BackupError::Command(format!("crontab -l failed: {}", stderr.trim())))
    }

    async fn write(&self, content: &str) -> Result<()> {
        let mut child = Command::new(&self.program)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackupError::Command(format!("cannot run {}: {}", self.program.display(), e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(CRONTAB_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| BackupError::Command("crontab - timed out".into()))??;
        if !output.status.success() {
            return Err(BackupError::Command(format!(
                "crontab rejected the new table: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Install or replace the tagged entry. Returns the installed line.
    pub async fn install(&self, entry: &ScheduleEntry) -> Result<String> {
        let line = entry.line();
        let existing = self.read().await?;
        self.write(&merge_crontab(&existing, Some(&line))).await?;
        info!(cron = %entry.cron, kind = %entry.kind, "Scheduled backup installed");
        Ok(line)
    }

    /// Remove the tagged entry. Returns whether one was present.
    pub async fn remove(&self) -> Result<bool> {
        let existing = self.read().await?;
        if find_entry(&existing).is_none() {
            return Ok(false);
        }
        self.write(&merge_crontab(&existing, None)).await?;
        info!("Scheduled backup removed");
        Ok(true)
    }

    pub async fn show(&self) -> Result<Option<String>> {
        Ok(find_entry(&self.read().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn entry() -> ScheduleEntry {
        ScheduleEntry::new(
            "0 3 * * *",
            BackupKind::Full,
            PathBuf::from("/usr/local/bin/stack-backup"),
            Some(PathBuf::from("/etc/stack backup/config.toml")),
        )
        .unwrap()
    }

    #[test]
    fn test_validate_cron() {
        assert!(validate_cron("0 3 * * *").is_ok());
        assert!(validate_cron("*/15 1-5 * jan mon,fri").is_ok());
        assert!(validate_cron("@daily").is_ok());
        assert!(validate_cron("0 3 * *").is_err());
        assert!(validate_cron("0 3 * * * *").is_err());
        assert!(validate_cron("0 3 * * *; rm -rf /").is_err());
        assert!(validate_cron("@sometimes").is_err());
    }

    #[test]
    fn test_line_quotes_paths() {
        assert_eq!(
            entry().line(),
            "0 3 * * * /usr/local/bin/stack-backup --config '/etc/stack backup/config.toml' \
             backup full --scheduled >/dev/null 2>&1 # stack-backup"
        );
    }

    #[test]
    fn test_merge_keeps_foreign_lines() {
        let existing = "MAILTO=ops\n0 1 * * * /usr/bin/other\n5 2 * * * old # stack-backup\n";
        let merged = merge_crontab(existing, Some("0 3 * * * new # stack-backup"));
        assert_eq!(
            merged,
            "MAILTO=ops\n0 1 * * * /usr/bin/other\n0 3 * * * new # stack-backup\n"
        );

        let removed = merge_crontab(&merged, None);
        assert_eq!(removed, "MAILTO=ops\n0 1 * * * /usr/bin/other\n");
        assert_eq!(merge_crontab("", None), "");
    }

    #[test]
    fn test_find_entry() {
        assert_eq!(
            find_entry("0 1 * * * x\n0 3 * * * y # stack-backup\n").as_deref(),
            Some("0 3 * * * y # stack-backup")
        );
        assert!(find_entry("0 1 * * * x\n").is_none());
    }

    /// A fake `crontab` that keeps its table in a file next to the script.
    fn fake_crontab(dir: &Path) -> PathBuf {
        let script = dir.join("crontab");
        let table = dir.join("table");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nif [ \"$1\" = \"-l\" ]; then\n  [ -f '{0}' ] || {{ echo 'no crontab for test' >&2; exit 1; }}\n  cat '{0}'\nelse\n  cat > '{0}'\nfi\n",
                table.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[tokio::test]
    async fn test_install_show_remove() {
        let dir = TempDir::new().unwrap();
        let crontab = Crontab::with_program(fake_crontab(dir.path()));

        assert!(crontab.show().await.unwrap().is_none());
        assert!(!crontab.remove().await.unwrap());

        let line = crontab.install(&entry()).await.unwrap();
        assert_eq!(crontab.show().await.unwrap(), Some(line));

        // Reinstalling replaces instead of duplicating
        crontab.install(&entry()).await.unwrap();
        let table = std::fs::read_to_string(dir.path().join("table")).unwrap();
        assert_eq!(table.matches(CRON_MARKER).count(), 1);

        assert!(crontab.remove().await.unwrap());
        assert!(crontab.show().await.unwrap().is_none());
    }
}
