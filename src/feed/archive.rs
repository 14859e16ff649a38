//! Archive feeds: remote public-inbox sources published over HTTP.
//!
//! The upstream advertises its epoch repositories through a gzipped
//! JSON manifest (`manifest.js.gz`) mapping repository paths to
//! metadata including a content fingerprint. Rollover (upstream
//! starting a new epoch) shows up as a new path in the manifest and
//! is answered by a shallow mirror clone of the new epoch.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::feed::{git, FeedCore, STATUS_INITIALIZED, STATUS_NOCHANGE, STATUS_UPDATED};

/// Timeout for manifest fetches.
const MANIFEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One repository entry in the upstream manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRepo {
    pub description: Option<String>,
    pub reference: Option<String>,
    pub modified: Option<i64>,
    pub fingerprint: Option<String>,
}

/// The manifest maps repository paths like `/lkml/git/0.git` to
/// repository metadata.
pub type Manifest = BTreeMap<String, ManifestRepo>;

/// Epoch list saved to `epochs.json` after each update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EpochInfo {
    pub epoch: u64,
    pub path: String,
    pub fpr: String,
}

/// Extract the numbered epochs from a manifest, sorted numerically.
/// Paths whose final component does not parse as `<n>.git` are logged
/// and skipped.
pub fn epochs_from_manifest(manifest: &Manifest) -> Vec<EpochInfo> {
    let mut epochs = Vec::new();
    for (path, repo) in manifest {
        let last = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
        let stem = last.trim_end_matches(".git");
        match stem.parse::<u64>() {
            Ok(epoch) => epochs.push(EpochInfo {
                epoch,
                path: path.clone(),
                fpr: repo.fingerprint.clone().unwrap_or_default(),
            }),
            Err(_) => log::warn!("invalid epoch path in manifest: {}", path),
        }
    }
    epochs.sort_by_key(|e| e.epoch);
    epochs
}

pub struct ArchiveFeed {
    pub core: FeedCore,
    feed_url: String,
    client: reqwest::Client,
}

impl ArchiveFeed {
    pub fn new(
        feed_key: impl Into<String>,
        feed_dir: impl Into<PathBuf>,
        feed_url: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        let feed_url: String = feed_url.into();
        Self {
            core: FeedCore::new(feed_key, feed_dir),
            feed_url: feed_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }

    fn epoch_repo_url(&self, epoch: u64) -> String {
        format!("{}/git/{}.git", self.feed_url, epoch)
    }

    /// Fetch and decompress the upstream manifest.
    pub async fn get_manifest(&self) -> Result<Manifest> {
        let url = format!("{}/manifest.js.gz", self.feed_url);
        log::debug!("fetching manifest from {}", url);

        let response = self
            .client
            .get(&url)
            .timeout(MANIFEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Remote(format!("manifest fetch failed: {}", e)))?;
        let compressed = response.bytes().await?;

        log::debug!("decompressing manifest ({} bytes)", compressed.len());
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut json = String::new();
        decoder
            .read_to_string(&mut json)
            .map_err(|e| Error::Remote(format!("manifest is not valid gzip: {}", e)))?;

        let manifest: Manifest = serde_json::from_str(&json)
            .map_err(|e| Error::Remote(format!("manifest is not valid JSON: {}", e)))?;
        log::debug!("manifest loaded: {} repositories", manifest.len());
        Ok(manifest)
    }

    /// Fetch the manifest and reduce it to the epoch list.
    pub async fn get_epochs(&self) -> Result<Vec<EpochInfo>> {
        let manifest = self.get_manifest().await?;
        let epochs = epochs_from_manifest(&manifest);
        if epochs.is_empty() {
            return Err(Error::PublicInbox(format!(
                "no epochs advertised by {}",
                self.feed_url
            )));
        }
        Ok(epochs)
    }

    fn epochs_file(&self) -> PathBuf {
        self.core.feed_dir.join("epochs.json")
    }

    pub fn store_epochs_info(&self, epochs: &[EpochInfo]) -> Result<()> {
        std::fs::create_dir_all(&self.core.feed_dir)?;
        std::fs::write(self.epochs_file(), serde_json::to_string_pretty(epochs)?)?;
        Ok(())
    }

    pub fn load_epochs_info(&self) -> Result<Vec<EpochInfo>> {
        let path = self.epochs_file();
        if !path.exists() {
            return Err(Error::State(format!(
                "epochs file {} does not exist",
                path.display()
            )));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(&path)?)?)
    }

    /// First contact with a feed: clone the newest epoch shallowly and
    /// record the feed state. Delivery state is intentionally not
    /// created here; the orchestrator tip-initializes every bound
    /// delivery in the same cycle.
    async fn initialize(&mut self) -> Result<u8> {
        let epochs = self.get_epochs().await?;
        let newest = epochs.last().expect("get_epochs is nonempty");

        let tgt_dir = self.core.gitdir(newest.epoch);
        log::info!(
            "initializing feed {} at epoch {}",
            self.core.feed_key,
            newest.epoch
        );
        git::clone_epoch(&self.epoch_repo_url(newest.epoch), &tgt_dir).await?;

        self.store_epochs_info(&epochs)?;
        self.core.save_feed_state(newest.epoch, None, true)?;
        Ok(STATUS_INITIALIZED)
    }

    /// Refresh the feed: pull the working epoch, detect tip movement
    /// against the saved feed state, and clone any new epoch the
    /// manifest advertises.
    pub async fn update_feed(&mut self) -> Result<u8> {
        if self.core.find_epochs().is_err() {
            return self.initialize().await;
        }

        let epochs = self.get_epochs().await?;
        let working = self.core.get_highest_epoch()?;

        git::update_remote(&self.core.gitdir(working)).await?;
        let new_tip = self.core.top_commit(working)?.unwrap_or_default();

        let mut status = 0u8;
        match self.core.load_feed_state() {
            Ok(state) => {
                if state.latest_commit != new_tip {
                    status |= STATUS_UPDATED;
                }
            }
            Err(_) => {
                // Primed directory without feed state (pre-feed-state
                // layouts): treat as updated so deliveries run and the
                // cursors bound the replay.
                log::debug!(
                    "no feed state for {}, treating update as a change",
                    self.core.feed_key
                );
                status |= STATUS_UPDATED;
            }
        }

        // Fingerprint changes on a known epoch without tip movement
        // hint at upstream history rewrites; enumeration handles those
        // through rebase recovery.
        if let Ok(saved) = self.load_epochs_info() {
            let saved_fpr = saved.iter().find(|e| e.epoch == working).map(|e| &e.fpr);
            let remote_fpr = epochs.iter().find(|e| e.epoch == working).map(|e| &e.fpr);
            if let (Some(saved_fpr), Some(remote_fpr)) = (saved_fpr, remote_fpr) {
                if saved_fpr != remote_fpr && status & STATUS_UPDATED == 0 {
                    log::debug!(
                        "fingerprint changed for epoch {} of {} without tip movement",
                        working,
                        self.core.feed_key
                    );
                }
            }
        }

        let remote_highest = epochs.last().expect("get_epochs is nonempty");
        if remote_highest.epoch > working {
            log::info!(
                "new epoch detected for {}: {}",
                self.core.feed_key,
                remote_highest.epoch
            );
            git::clone_epoch(
                &self.epoch_repo_url(remote_highest.epoch),
                &self.core.gitdir(remote_highest.epoch),
            )
            .await?;
            status |= STATUS_UPDATED;
        }

        if status == 0 {
            status = STATUS_NOCHANGE;
        }

        self.store_epochs_info(&epochs)?;
        let highest = self.core.get_highest_epoch()?;
        self.core.save_feed_state(highest, None, true)?;
        Ok(status)
    }
}
