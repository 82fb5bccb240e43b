//! `.hist` freshness marker.
//!
//! A small JSON document in the project directory that remembers the last
//! unpacked kernel archive and the hash of the last seen GDB script.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

pub const HISTORY_FILE: &str = ".hist";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_archive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gdb_script_sha256: Option<String>,
}

impl History {
    /// Load the marker; a missing or unreadable marker starts empty.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let bytes =
            fs::read(path).with_context(|| format!("reading history '{}'", path.display()))?;
        match serde_json::from_slice(&bytes) {
            Ok(history) => Ok(history),
            Err(e) => {
                tracing::warn!("ignoring malformed history {}: {}", path.display(), e);
                Ok(Self::default())
            }
        }
    }

    /// Write the marker via a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("serializing history")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("writing history '{}'", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("renaming '{}' to '{}'", tmp.display(), path.display()))?;
        Ok(())
    }

    pub fn archive_matches(&self, archive: &str) -> bool {
        self.last_archive.as_deref() == Some(archive)
    }

    pub fn record_archive(&mut self, archive: &str) {
        self.last_archive = Some(archive.to_string());
    }

    /// True when a different GDB script hash is on record.
    pub fn gdb_script_changed(&self, sha256: &str) -> bool {
        matches!(&self.gdb_script_sha256, Some(old) if old != sha256)
    }

    /// Store the GDB script hash. True when it replaced a different hash.
    pub fn update_gdb_script(&mut self, sha256: &str) -> bool {
        let changed = self.gdb_script_changed(sha256);
        self.gdb_script_sha256 = Some(sha256.to_string());
        changed
    }
}

/// Streaming SHA-256 of a file, lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_marker_is_empty() {
        let tmp = TempDir::new().unwrap();
        let h = History::load(&tmp.path().join(HISTORY_FILE)).unwrap();
        assert_eq!(h, History::default());
    }

    #[test]
    fn marker_round_trips_through_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(HISTORY_FILE);
        let mut h = History::default();
        h.record_archive("kernel/linux-5.15.tar.gz");
        h.save(&path).unwrap();

        let loaded = History::load(&path).unwrap();
        assert!(loaded.archive_matches("kernel/linux-5.15.tar.gz"));
        assert!(!loaded.archive_matches("kernel/linux-6.1.tar.gz"));
    }

    #[test]
    fn malformed_marker_starts_fresh() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(HISTORY_FILE);
        fs::write(&path, "kernel/linux-5.15.tar.gz").unwrap();
        assert_eq!(History::load(&path).unwrap(), History::default());
    }

    #[test]
    fn gdb_script_change_detection() {
        let mut h = History::default();
        assert!(!h.update_gdb_script("aaa"));
        assert!(!h.update_gdb_script("aaa"));
        assert!(h.update_gdb_script("bbb"));
        assert_eq!(h.gdb_script_sha256.as_deref(), Some("bbb"));
    }

    #[test]
    fn sha256_matches_known_digest() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("script");
        fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
