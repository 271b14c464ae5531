//! Appliance configuration export
//!
//! Archives the configuration database (and optionally the password
//! encryption seed) into `config-export-<host>-<version>-<timestamp>.tar`
//! inside a dataset that is itself replicated off-box, then prunes exports
//! of the same host older than the retention period.

use crate::config::ExportConfig;
use chrono::{DateTime, Local};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tar::Builder;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const ARCHIVE_PREFIX: &str = "config-export-";
const ARCHIVE_SUFFIX: &str = ".tar";
const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Exporting the configuration requires root privileges")]
    NotRoot,
    #[error("Destination directory does not exist: {0}")]
    DestinationMissing(PathBuf),
    #[error("Failed to write {path}: {source}")]
    Archive { path: PathBuf, source: io::Error },
}

/// Parameters of one export run
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub destination: PathBuf,
    pub include_secret: bool,
    pub retention_days: u64,
}

#[derive(Debug, Default)]
pub struct ExportReport {
    pub archive: PathBuf,
    pub archived: Vec<String>,
    pub missing: Vec<String>,
    pub pruned: Vec<PathBuf>,
}

pub struct ConfigExporter {
    source_dir: PathBuf,
    database_file: String,
    secret_file: String,
    version_file: PathBuf,
    hostname: String,
}

impl ConfigExporter {
    pub fn new(config: &ExportConfig) -> Self {
        Self {
            source_dir: config.source_dir.clone(),
            database_file: config.database_file.clone(),
            secret_file: config.secret_file.clone(),
            version_file: config.version_file.clone(),
            hostname: local_hostname(),
        }
    }

    /// Override the host name used in archive names
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn export(
        &self,
        request: &ExportRequest,
        now: DateTime<Local>,
    ) -> Result<ExportReport, ExportError> {
        let destination = fs::canonicalize(&request.destination)
            .ok()
            .filter(|path| path.is_dir())
            .ok_or_else(|| ExportError::DestinationMissing(request.destination.clone()))?;

        let version = read_version(&self.version_file);
        let archive = destination.join(archive_name(&self.hostname, &version, now));
        info!("Starting export to {}", archive.display());

        let mut files = vec![self.database_file.as_str()];
        if request.include_secret {
            files.push(self.secret_file.as_str());
        }

        let (archived, missing) = match self.write_archive(&archive, &files) {
            Ok(result) => result,
            Err(source) => {
                if let Err(e) = fs::remove_file(&archive) {
                    debug!("No partial archive to remove: {}", e);
                }
                return Err(ExportError::Archive {
                    path: archive,
                    source,
                });
            }
        };
        info!("Configuration exported ({} files)", archived.len());

        let retention_secs = request.retention_days.saturating_mul(SECONDS_PER_DAY);
        let retention = Duration::from_secs(retention_secs);
        let pruned = prune_exports(&destination, &self.hostname, retention, now.into());

        Ok(ExportReport {
            archive,
            archived,
            missing,
            pruned,
        })
    }

    fn write_archive(
        &self,
        archive: &Path,
        files: &[&str],
    ) -> io::Result<(Vec<String>, Vec<String>)> {
        let mut builder = Builder::new(File::create(archive)?);
        let mut archived = Vec::new();
        let mut missing = Vec::new();

        for name in files {
            let path = self.source_dir.join(name);
            if path.is_file() {
                builder.append_path_with_name(&path, name)?;
                archived.push(name.to_string());
            } else {
                warn!("{} not found in {}", name, self.source_dir.display());
                missing.push(name.to_string());
            }
        }

        builder.into_inner()?.sync_all()?;
        Ok((archived, missing))
    }
}

/// Fail unless running with an effective uid of 0
pub fn ensure_root() -> Result<(), ExportError> {
    #[cfg(unix)]
    {
        if nix::unistd::Uid::effective().is_root() {
            return Ok(());
        }
    }
    Err(ExportError::NotRoot)
}

pub fn archive_name(hostname: &str, version: &str, now: DateTime<Local>) -> String {
    format!(
        "{}{}-{}-{}{}",
        ARCHIVE_PREFIX,
        hostname,
        version,
        now.format("%Y%m%d%H%M%S"),
        ARCHIVE_SUFFIX
    )
}

/// Release name from the appliance version file
///
/// `TrueNAS-13.0-U6.1` yields `13.0`; a value without dashes is used as is.
pub fn parse_version(content: &str) -> String {
    let content = content.trim();
    match content.split('-').nth(1) {
        Some(field) if !field.is_empty() => field.to_string(),
        _ if !content.is_empty() && !content.contains('-') => content.to_string(),
        _ => "unknown".to_string(),
    }
}

fn read_version(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(content) => parse_version(&content),
        Err(e) => {
            debug!("Cannot read {}: {}", path.display(), e);
            "unknown".to_string()
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Delete this host's exports last modified before `now - retention`.
///
/// Failures on individual files are logged and skipped.
pub fn prune_exports(
    destination: &Path,
    hostname: &str,
    retention: Duration,
    now: SystemTime,
) -> Vec<PathBuf> {
    info!(
        "Cleaning up exports in {} older than {} days",
        destination.display(),
        retention.as_secs() / SECONDS_PER_DAY
    );

    let cutoff = now.checked_sub(retention).unwrap_or(SystemTime::UNIX_EPOCH);
    let prefix = format!("{}{}-", ARCHIVE_PREFIX, hostname);

    let entries = match fs::read_dir(destination) {
        Ok(entries) => entries,
        Err(e) => {
            error!("Cannot list {}: {}", destination.display(), e);
            return Vec::new();
        }
    };

    let mut pruned = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(&prefix) || !name.ends_with(ARCHIVE_SUFFIX) {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                warn!("Cannot stat {}: {}", name, e);
                continue;
            }
        };
        if modified >= cutoff {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => {
                info!("Deleted old export: {}", name);
                pruned.push(entry.path());
            }
            Err(e) => error!("Error deleting {}: {}", name, e),
        }
    }

    pruned.sort();
    pruned
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn exporter(source: &TempDir) -> ConfigExporter {
        ConfigExporter::new(&ExportConfig {
            source_dir: source.path().to_path_buf(),
            version_file: source.path().join("version"),
            ..ExportConfig::default()
        })
        .with_hostname("nas01")
    }

    fn archive_entries(path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    fn backdate(path: &Path, days: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(days * SECONDS_PER_DAY))
            .unwrap();
    }

    #[test]
    fn test_archive_name() {
        let now = Local.with_ymd_and_hms(2025, 3, 9, 1, 2, 3).unwrap();
        assert_eq!(
            archive_name("nas01", "13.0", now),
            "config-export-nas01-13.0-20250309010203.tar"
        );
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("TrueNAS-13.0-U6.1\n"), "13.0");
        assert_eq!(parse_version("25.04.1"), "25.04.1");
        assert_eq!(parse_version(""), "unknown");
        assert_eq!(parse_version("TrueNAS-"), "unknown");
    }

    #[test]
    fn test_export_with_secret() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("freenas-v1.db"), b"sqlite").unwrap();
        fs::write(source.path().join("pwenc_secret"), b"seed").unwrap();
        fs::write(source.path().join("version"), "TrueNAS-13.0-U6.1").unwrap();

        let request = ExportRequest {
            destination: dest.path().to_path_buf(),
            include_secret: true,
            retention_days: 5,
        };
        let report = exporter(&source).export(&request, Local::now()).unwrap();

        let name = report.archive.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("config-export-nas01-13.0-"));
        assert_eq!(report.archived, vec!["freenas-v1.db", "pwenc_secret"]);
        assert!(report.missing.is_empty());
        assert!(report.pruned.is_empty());
        assert_eq!(
            archive_entries(&report.archive),
            vec!["freenas-v1.db", "pwenc_secret"]
        );
    }

    #[test]
    fn test_export_skips_missing_files() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("freenas-v1.db"), b"sqlite").unwrap();

        let request = ExportRequest {
            destination: dest.path().to_path_buf(),
            include_secret: true,
            retention_days: 5,
        };
        let report = exporter(&source).export(&request, Local::now()).unwrap();

        assert_eq!(report.archived, vec!["freenas-v1.db"]);
        assert_eq!(report.missing, vec!["pwenc_secret"]);
        assert!(report.archive.to_string_lossy().contains("-unknown-"));
    }

    #[test]
    fn test_export_without_secret_leaves_it_out() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("freenas-v1.db"), b"sqlite").unwrap();
        fs::write(source.path().join("pwenc_secret"), b"seed").unwrap();

        let request = ExportRequest {
            destination: dest.path().to_path_buf(),
            include_secret: false,
            retention_days: 5,
        };
        let report = exporter(&source).export(&request, Local::now()).unwrap();
        assert_eq!(archive_entries(&report.archive), vec!["freenas-v1.db"]);
    }

    #[test]
    fn test_export_missing_destination() {
        let source = TempDir::new().unwrap();
        let request = ExportRequest {
            destination: source.path().join("no-such-dataset"),
            include_secret: false,
            retention_days: 5,
        };
        let result = exporter(&source).export(&request, Local::now());
        assert!(matches!(result, Err(ExportError::DestinationMissing(_))));
    }

    #[test]
    fn test_export_with_huge_retention_keeps_everything() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("freenas-v1.db"), b"sqlite").unwrap();
        let old = dest.path().join("config-export-nas01-13.0-20240101000000.tar");
        fs::write(&old, b"x").unwrap();
        backdate(&old, 400);

        let request = ExportRequest {
            destination: dest.path().to_path_buf(),
            include_secret: false,
            retention_days: u64::MAX,
        };
        let report = exporter(&source).export(&request, Local::now()).unwrap();

        assert!(report.pruned.is_empty());
        assert!(old.exists());
    }

    #[test]
    fn test_prune_only_old_exports_of_this_host() {
        let dest = TempDir::new().unwrap();
        let old = dest.path().join("config-export-nas01-13.0-20240101000000.tar");
        let fresh = dest.path().join("config-export-nas01-13.0-20991231000000.tar");
        let other_host = dest.path().join("config-export-nas02-13.0-20240101000000.tar");
        let unrelated = dest.path().join("notes.txt");
        for path in [&old, &fresh, &other_host, &unrelated] {
            fs::write(path, b"x").unwrap();
        }
        backdate(&old, 10);
        backdate(&other_host, 10);
        backdate(&unrelated, 10);

        let pruned = prune_exports(
            dest.path(),
            "nas01",
            Duration::from_secs(5 * SECONDS_PER_DAY),
            SystemTime::now(),
        );

        assert_eq!(pruned, vec![old.clone()]);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other_host.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_prune_missing_directory_is_empty() {
        let dest = TempDir::new().unwrap();
        let pruned = prune_exports(
            &dest.path().join("gone"),
            "nas01",
            Duration::ZERO,
            SystemTime::now(),
        );
        assert!(pruned.is_empty());
    }

    #[test]
    fn test_export_error_display() {
        assert_eq!(
            ExportError::NotRoot.to_string(),
            "Exporting the configuration requires root privileges"
        );
    }
}
