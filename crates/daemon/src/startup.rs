//! Startup checks module for the seed daemon
//!
//! Provides preflight checks run before the pipeline accepts work:
//! - Every data directory exists and is writable
//! - Leftovers from an interrupted run are swept away
//!
//! Any failure here is fatal.

use crate::config::Config;
use crate::pipeline::is_partial_name;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

const PROBE_FILE: &str = ".seed-daemon-probe";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Directory {path} is not usable: {source}")]
    DirectoryUnusable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Orphan sweep of {path} failed: {source}")]
    Sweep {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What the orphan sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Half-received staging files
    pub partial_files: usize,
    /// Job directories left empty
    pub empty_dirs: usize,
    /// Descriptor temp files that were never renamed
    pub temp_descriptors: usize,
}

/// Create `path` if needed and prove a file can be written into it.
pub fn ensure_writable_dir(path: &Path) -> Result<(), StartupError> {
    let unusable = |source| StartupError::DirectoryUnusable {
        path: path.to_path_buf(),
        source,
    };

    fs::create_dir_all(path).map_err(unusable)?;
    let probe = path.join(PROBE_FILE);
    fs::write(&probe, b"ok").map_err(unusable)?;
    fs::remove_file(&probe).map_err(unusable)?;
    Ok(())
}

/// Remove partial downloads and empty job directories under `seed_dir`,
/// plus stray descriptor temp files under `torrent_dir`.
pub fn sweep_orphans(seed_dir: &Path, torrent_dir: &Path) -> io::Result<SweepReport> {
    let mut report = SweepReport::default();

    if seed_dir.exists() {
        // contents_first visits a directory after everything inside it
        for entry in WalkDir::new(seed_dir).min_depth(1).contents_first(true) {
            let entry = entry.map_err(io::Error::from)?;
            let path = entry.path();

            if entry.file_type().is_file() {
                let is_partial = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(is_partial_name);
                if is_partial {
                    fs::remove_file(path)?;
                    report.partial_files += 1;
                }
            } else if entry.file_type().is_dir() && is_empty_dir(path)? {
                fs::remove_dir(path)?;
                report.empty_dirs += 1;
            }
        }
    }

    if torrent_dir.exists() {
        for entry in WalkDir::new(torrent_dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(io::Error::from)?;
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if entry.file_type().is_file() && name.starts_with('.') && name.ends_with(".tmp") {
                fs::remove_file(entry.path())?;
                report.temp_descriptors += 1;
            }
        }
    }

    Ok(report)
}

fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Run all startup checks in order
///
/// 1. Seed, descriptor and store directories are writable
/// 2. The inbox directory, when configured, is writable
/// 3. Orphans from a previous run are swept
pub fn run_startup_checks(cfg: &Config) -> Result<SweepReport, StartupError> {
    ensure_writable_dir(&cfg.paths.seed_dir)?;
    ensure_writable_dir(&cfg.paths.torrent_dir)?;
    if let Some(parent) = cfg.paths.store_path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_writable_dir(parent)?;
        }
    }
    if let Some(inbox) = &cfg.paths.inbox_dir {
        ensure_writable_dir(inbox)?;
    }

    let report = sweep_orphans(&cfg.paths.seed_dir, &cfg.paths.torrent_dir).map_err(|source| {
        StartupError::Sweep {
            path: cfg.paths.seed_dir.clone(),
            source,
        }
    })?;

    if report == SweepReport::default() {
        info!("Startup checks passed");
    } else {
        warn!(
            partial_files = report.partial_files,
            empty_dirs = report.empty_dirs,
            temp_descriptors = report.temp_descriptors,
            "Removed leftovers from a previous run"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{pattern, Harness};
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> Config {
        let mut cfg = Config::default();
        cfg.paths.seed_dir = dir.path().join("seeds");
        cfg.paths.torrent_dir = dir.path().join("torrents");
        cfg.paths.store_path = dir.path().join("state").join("outcomes.jsonl");
        cfg
    }

    #[test]
    fn test_startup_creates_directories() {
        let dir = TempDir::new().unwrap();
        let cfg = config_in(&dir);

        let report = run_startup_checks(&cfg).unwrap();

        assert_eq!(report, SweepReport::default());
        assert!(cfg.paths.seed_dir.is_dir());
        assert!(cfg.paths.torrent_dir.is_dir());
        assert!(dir.path().join("state").is_dir());
        assert!(!cfg.paths.seed_dir.join(PROBE_FILE).exists());
    }

    #[test]
    fn test_unusable_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        let mut cfg = config_in(&dir);
        cfg.paths.seed_dir = blocker.join("seeds");

        let err = run_startup_checks(&cfg).unwrap_err();
        assert!(matches!(err, StartupError::DirectoryUnusable { .. }));
    }

    #[test]
    fn test_sweep_removes_partials_and_empty_job_dirs() {
        let dir = TempDir::new().unwrap();
        let seeds = dir.path().join("seeds");
        let torrents = dir.path().join("torrents");

        let interrupted = seeds.join("job-1");
        fs::create_dir_all(&interrupted).unwrap();
        fs::write(interrupted.join(".a.bin.part"), b"half").unwrap();

        let finished = seeds.join("job-2");
        fs::create_dir_all(&finished).unwrap();
        fs::write(finished.join("b.bin"), b"done").unwrap();

        fs::create_dir_all(seeds.join("job-3")).unwrap();

        fs::create_dir_all(&torrents).unwrap();
        fs::write(torrents.join(".abc.job-1.tmp"), b"d").unwrap();
        fs::write(torrents.join("abc.torrent"), b"d").unwrap();

        let report = sweep_orphans(&seeds, &torrents).unwrap();

        assert_eq!(
            report,
            SweepReport {
                partial_files: 1,
                empty_dirs: 2,
                temp_descriptors: 1,
            }
        );
        assert!(!interrupted.exists());
        assert!(finished.join("b.bin").exists());
        assert!(seeds.is_dir());
        assert!(torrents.join("abc.torrent").exists());
    }

    #[tokio::test]
    async fn test_sweep_keeps_published_file_named_like_partial() {
        let h = Harness::new(1, None);
        let handle = h.submit_bytes("backup.part", pattern(4096, 11));
        h.wait_for_finals(1).await;
        assert!(h.outcome_for(&handle).is_success());
        let data = h.job_dir(&handle).join("backup.part");
        assert!(data.exists());

        let report = sweep_orphans(
            &h.dir.path().join("seeds"),
            &h.dir.path().join("torrents"),
        )
        .unwrap();

        assert_eq!(report, SweepReport::default());
        assert!(data.exists());
    }

    #[test]
    fn test_sweep_of_missing_dirs_is_noop() {
        let dir = TempDir::new().unwrap();
        let report = sweep_orphans(&dir.path().join("nope"), &dir.path().join("nada")).unwrap();
        assert_eq!(report, SweepReport::default());
    }
}
