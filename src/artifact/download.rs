//! Kernel source archive download (stage 1).

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::sections::KernelDlConfig;
use crate::error::LabError;
use crate::process::Cmd;

const COMMIT_MARKER: &str = "commit/?id=";

/// HTTP access used by the downloader.
pub trait Fetch {
    fn fetch_text(&self, uri: &str) -> Result<String>;

    /// Download `uri` to `dest`. `dest` may be partially written on error.
    fn download(&self, uri: &str, dest: &Path) -> Result<()>;
}

/// [`Fetch`] via `curl`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Curl;

impl Fetch for Curl {
    fn fetch_text(&self, uri: &str) -> Result<String> {
        let out = Cmd::new("curl")
            .args(["-fsSL", uri])
            .error_msg(format!("fetching {}", uri))
            .run()?;
        Ok(out.stdout)
    }

    fn download(&self, uri: &str, dest: &Path) -> Result<()> {
        Cmd::new("curl")
            .args(["-fL", "--progress-bar", "-o"])
            .arg(dest)
            .arg(uri)
            .error_msg(format!("downloading {}", uri))
            .run_interactive()?;
        Ok(())
    }
}

/// Resolved kernel source selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDownloader {
    /// Version, tag or commit used in the archive name.
    pub choice: String,
    pub uri: String,
    pub archive: PathBuf,
}

impl KernelDownloader {
    /// Resolve the kernel choice: mmp > tag > commit > latest commit.
    pub fn resolve(cfg: &KernelDlConfig, fetch: &dyn Fetch) -> Result<Self> {
        let (choice, uri) = if let Some(mmp) = &cfg.mmp {
            (mmp.clone(), mmp_uri(&cfg.mmp_uri, mmp)?)
        } else {
            let choice = match (&cfg.tag, &cfg.commit) {
                (Some(tag), _) => tag.clone(),
                (None, Some(commit)) => commit.clone(),
                (None, None) => latest_commit(cfg, fetch)?,
            };
            let uri = format!("{}{}.tar.gz", cfg.snap_uri, choice);
            (choice, uri)
        };
        tracing::info!("using kernel (version/tag/commit) {}", choice);
        tracing::debug!("kernel snapshot: {}", uri);

        let archive = cfg.kernel_dl_path.join(format!("linux-{}.tar.gz", choice));
        Ok(Self {
            choice,
            uri,
            archive,
        })
    }

    pub fn is_present(&self) -> bool {
        self.archive.is_file()
    }

    /// Download unless already present; returns the archive path.
    pub fn run(&self, fetch: &dyn Fetch) -> Result<PathBuf> {
        if self.is_present() {
            tracing::info!("kernel archive already present, skipping download");
            return Ok(self.archive.clone());
        }
        if let Some(dir) = self.archive.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating download directory '{}'", dir.display()))?;
        }

        tracing::info!("downloading {}, this may take a while", self.uri);
        let partial = self.archive.with_extension("gz.part");
        if let Err(e) = fetch.download(&self.uri, &partial) {
            let _ = fs::remove_file(&partial);
            return Err(LabError::Artifact(format!("downloading {}: {:#}", self.uri, e)).into());
        }
        fs::rename(&partial, &self.archive).with_context(|| {
            format!(
                "moving '{}' to '{}'",
                partial.display(),
                self.archive.display()
            )
        })?;
        Ok(self.archive.clone())
    }
}

fn mmp_uri(template: &str, mmp: &str) -> Result<String> {
    let parts: Vec<&str> = mmp.split('.').collect();
    let [major, minor, patch] = parts.as_slice() else {
        return Err(LabError::Configuration(format!(
            "mmp '{}' is not of the form major.minor.patch",
            mmp
        ))
        .into());
    };
    Ok(template
        .replace("KMAJOR", major)
        .replace("KMINOR", minor)
        .replace("KPATCH", patch))
}

fn latest_commit(cfg: &KernelDlConfig, fetch: &dyn Fetch) -> Result<String> {
    let page = fetch
        .fetch_text(&cfg.commit_uri)
        .with_context(|| format!("resolving latest commit from {}", cfg.commit_uri))?;
    let commit = scrape_commit(&page).ok_or_else(|| {
        LabError::Artifact(format!("no commit id found at {}", cfg.commit_uri))
    })?;
    tracing::debug!("found latest commit: {}", commit);
    Ok(commit)
}

/// First `commit/?id=<hex>` reference in an HTML page.
fn scrape_commit(page: &str) -> Option<String> {
    page.match_indices(COMMIT_MARKER).find_map(|(idx, _)| {
        let id: String = page[idx + COMMIT_MARKER.len()..]
            .chars()
            .take_while(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
            .collect();
        (!id.is_empty()).then_some(id)
    })
}
