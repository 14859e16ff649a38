//! Tracked-thread manifest.
//!
//! Tracked threads are ephemeral deliveries: each entry pairs a lei
//! thread search with a target and labels, and is mapped into the
//! delivery map during every pull cycle. Entries with no new messages
//! for 30 days auto-transition to inactive and stop being mapped until
//! resumed.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Auto-expire threads with no new messages after this many days.
pub const EXPIRE_DAYS: i64 = 30;

const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    /// Updated during pull.
    Active,
    /// Auto-expired; skipped during pull.
    Inactive,
    /// User-requested pause; skipped during pull.
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedThread {
    #[serde(skip)]
    pub track_id: String,
    pub msgid: String,
    pub subject: String,
    pub target: String,
    pub labels: Vec<String>,
    pub lei_path: PathBuf,
    pub created: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub last_new_message: DateTime<Utc>,
    pub status: TrackStatus,
    pub message_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestFile {
    version: u32,
    threads: BTreeMap<String, TrackedThread>,
}

/// Derive a filesystem-safe track id from a message id.
pub fn track_id_for_msgid(msgid: &str) -> String {
    let stripped = msgid.trim().trim_matches(|c| c == '<' || c == '>');
    let sanitized: String = stripped
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized.chars().take(40).collect()
}

pub struct TrackingManifest {
    manifest_path: PathBuf,
    lei_base_dir: PathBuf,
    threads: BTreeMap<String, TrackedThread>,
}

impl TrackingManifest {
    /// Load the manifest from the data directory; a missing or
    /// unreadable file starts fresh.
    pub fn load(data_dir: &Path) -> Self {
        let manifest_path = data_dir.join("tracking.json");
        let lei_base_dir = data_dir.join("lei");
        let mut manifest = Self {
            manifest_path,
            lei_base_dir,
            threads: BTreeMap::new(),
        };

        let Ok(content) = std::fs::read_to_string(&manifest.manifest_path) else {
            log::debug!("no tracking manifest found, starting fresh");
            return manifest;
        };
        match serde_json::from_str::<ManifestFile>(&content) {
            Ok(file) => {
                if file.version != MANIFEST_VERSION {
                    log::warn!(
                        "tracking manifest version mismatch (got {}, expected {})",
                        file.version,
                        MANIFEST_VERSION
                    );
                }
                manifest.threads = file.threads;
                for (track_id, thread) in manifest.threads.iter_mut() {
                    thread.track_id = track_id.clone();
                }
                log::debug!(
                    "loaded {} tracked threads from manifest",
                    manifest.threads.len()
                );
            }
            Err(e) => log::warn!("failed to load tracking manifest: {}", e),
        }
        manifest
    }

    /// Atomic save via temp file + rename.
    fn save(&self) -> Result<()> {
        let parent = self
            .manifest_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let file = ManifestFile {
            version: MANIFEST_VERSION,
            threads: self.threads.clone(),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(serde_json::to_string_pretty(&file)?.as_bytes())?;
        tmp.persist(&self.manifest_path)
            .map_err(|e| Error::Io(e.error))?;
        log::debug!("saved tracking manifest with {} threads", self.threads.len());
        Ok(())
    }

    /// Where the lei search for a track id lives.
    pub fn lei_path_for(&self, track_id: &str) -> PathBuf {
        self.lei_base_dir.join(track_id)
    }

    pub fn add_thread(
        &mut self,
        track_id: &str,
        msgid: &str,
        subject: &str,
        target: &str,
        labels: Vec<String>,
        lei_path: PathBuf,
    ) -> Result<&TrackedThread> {
        let now = Utc::now();
        let thread = TrackedThread {
            track_id: track_id.to_string(),
            msgid: msgid.to_string(),
            subject: subject.to_string(),
            target: target.to_string(),
            labels,
            lei_path,
            created: now,
            last_update: now,
            last_new_message: now,
            status: TrackStatus::Active,
            message_count: 0,
        };
        self.threads.insert(track_id.to_string(), thread);
        self.save()?;
        log::info!("started tracking thread {}: {}", track_id, subject);
        Ok(&self.threads[track_id])
    }

    pub fn remove_thread(&mut self, track_id: &str) -> Result<TrackedThread> {
        let thread = self.threads.remove(track_id).ok_or_else(|| {
            Error::Configuration(format!("tracked thread '{}' not found", track_id))
        })?;
        self.save()?;
        log::info!("stopped tracking thread {}", track_id);
        Ok(thread)
    }

    pub fn pause_thread(&mut self, track_id: &str) -> Result<()> {
        let thread = self.threads.get_mut(track_id).ok_or_else(|| {
            Error::Configuration(format!("tracked thread '{}' not found", track_id))
        })?;
        thread.status = TrackStatus::Paused;
        self.save()?;
        log::info!("paused tracking for thread {}", track_id);
        Ok(())
    }

    pub fn resume_thread(&mut self, track_id: &str) -> Result<()> {
        let thread = self.threads.get_mut(track_id).ok_or_else(|| {
            Error::Configuration(format!("tracked thread '{}' not found", track_id))
        })?;
        thread.status = TrackStatus::Active;
        thread.last_new_message = Utc::now();
        self.save()?;
        log::info!("resumed tracking for thread {}", track_id);
        Ok(())
    }

    pub fn get_thread(&self, track_id: &str) -> Option<&TrackedThread> {
        self.threads.get(track_id)
    }

    pub fn get_thread_by_msgid(&self, msgid: &str) -> Option<&TrackedThread> {
        self.threads.values().find(|t| t.msgid == msgid)
    }

    pub fn all_threads(&self) -> impl Iterator<Item = &TrackedThread> {
        self.threads.values()
    }

    pub fn active_threads(&self) -> impl Iterator<Item = &TrackedThread> {
        self.threads
            .values()
            .filter(|t| t.status == TrackStatus::Active)
    }

    /// Transition active threads with no new messages inside the
    /// expiry window to inactive. Returns the expired track ids.
    pub fn check_and_expire_threads(&mut self) -> Result<Vec<String>> {
        let cutoff = Utc::now() - Duration::days(EXPIRE_DAYS);
        let mut expired = Vec::new();

        for (track_id, thread) in self.threads.iter_mut() {
            if thread.status == TrackStatus::Active && thread.last_new_message < cutoff {
                thread.status = TrackStatus::Inactive;
                expired.push(track_id.clone());
                log::info!(
                    "auto-expired thread {} (no activity since {})",
                    track_id,
                    thread.last_new_message.date_naive()
                );
            }
        }

        if !expired.is_empty() {
            self.save()?;
        }
        Ok(expired)
    }

    /// Refresh activity counters after a pull cycle delivered
    /// `new_messages` messages for this thread.
    pub fn update_activity(&mut self, track_id: &str, new_messages: u64) -> Result<()> {
        let thread = self.threads.get_mut(track_id).ok_or_else(|| {
            Error::Configuration(format!("tracked thread '{}' not found", track_id))
        })?;
        let now = Utc::now();
        thread.last_update = now;
        if new_messages > 0 {
            thread.last_new_message = now;
            thread.message_count += new_messages;
        }
        self.save()
    }
}
