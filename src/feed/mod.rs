//! Feed engine: public-inbox sources and their on-disk state.
//!
//! A feed owns a directory containing one bare git repository per
//! epoch (`git/<n>.git`), a feed-level state file, and per-delivery
//! cursor and ledger files. Two variants share the same surface:
//! [`archive::ArchiveFeed`] mirrors a remote archive over HTTP and
//! [`search::SearchFeed`] wraps repositories maintained by `lei`.
//!
//! State files under the feed directory:
//!
//! - `korgalore.lock`: advisory lock serializing all mutation
//! - `korgalore.feed`: feed tip and update bookkeeping
//! - `korgalore.<delivery>.info`: per-epoch delivery cursors
//! - `korgalore.<delivery>.failed`: JSON-lines retry ledger
//! - `korgalore.<delivery>.rejected`: JSON-lines rejection ledger

pub mod archive;
pub mod git;
pub mod search;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use fs4::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::RawMessage;

pub use archive::ArchiveFeed;
pub use search::SearchFeed;

pub const STATUS_UPDATED: u8 = 1;
pub const STATUS_INITIALIZED: u8 = 2;
pub const STATUS_NOCHANGE: u8 = 4;

/// Retry window for failed deliveries, in seconds. A failed commit
/// older than this is moved to the rejected ledger and never retried.
pub const RETRY_FAILED_INTERVAL: i64 = 5 * 24 * 3600;

/// Feed-level state, written after every successful update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedState {
    pub last_update: String,
    pub update_successful: bool,
    pub latest_commit: String,
    pub highest_epoch: u64,
}

/// Per-epoch delivery cursor. `last` is the most recent commit known
/// to be delivered; `subject`/`msgid`/`commit_date` anchor rebase
/// recovery when `last` stops resolving.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EpochCursor {
    pub last: String,
    pub commit_date: String,
    pub subject: String,
    pub msgid: String,
}

/// Delivery state file: epoch number (as string) to cursor.
pub type DeliveryInfo = BTreeMap<String, EpochCursor>;

/// One line of the failed ledger:
/// `[epoch, commit, first_failure, retry_count]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedEntry(pub u64, pub String, pub String, pub u32);

/// One line of the rejected ledger: `[epoch, commit]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectedEntry(pub u64, pub String);

fn parse_first_failure(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    // Tolerate naive timestamps from older ledgers.
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Shared state and on-disk protocol of both feed variants.
pub struct FeedCore {
    pub feed_key: String,
    pub feed_dir: PathBuf,
    lock: RefCell<Option<File>>,
    branch_cache: RefCell<HashMap<PathBuf, String>>,
}

impl FeedCore {
    pub fn new(feed_key: impl Into<String>, feed_dir: impl Into<PathBuf>) -> Self {
        Self {
            feed_key: feed_key.into(),
            feed_dir: feed_dir.into(),
            lock: RefCell::new(None),
            branch_cache: RefCell::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Paths and locking

    pub fn state_file(&self, delivery: Option<&str>, suffix: &str) -> PathBuf {
        match delivery {
            Some(name) => self.feed_dir.join(format!("korgalore.{}.{}", name, suffix)),
            None => self.feed_dir.join(format!("korgalore.{}", suffix)),
        }
    }

    pub fn gitdir(&self, epoch: u64) -> PathBuf {
        self.feed_dir.join("git").join(format!("{}.git", epoch))
    }

    /// Acquire the exclusive advisory lock over the feed directory,
    /// waiting if another process holds it. Idempotent within one
    /// process instance.
    pub fn feed_lock(&self) -> Result<()> {
        if self.lock.borrow().is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.feed_dir)?;
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.feed_dir.join("korgalore.lock"))?;
        if file.try_lock_exclusive().is_err() {
            log::info!("waiting on feed lock for {}", self.feed_key);
            file.lock_exclusive()?;
        }
        *self.lock.borrow_mut() = Some(file);
        Ok(())
    }

    pub fn feed_unlock(&self) -> Result<()> {
        match self.lock.borrow_mut().take() {
            Some(file) => {
                let _ = file.unlock();
                Ok(())
            }
            None => Err(Error::State(format!(
                "feed {} is not locked",
                self.feed_key
            ))),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.borrow().is_some()
    }

    // ------------------------------------------------------------------
    // Epoch discovery

    /// Numerically sorted epochs present under `git/`.
    pub fn find_epochs(&self) -> Result<Vec<u64>> {
        let epochs_dir = self.feed_dir.join("git");
        let mut epochs = Vec::new();
        if let Ok(entries) = fs::read_dir(&epochs_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if !entry.path().is_dir() {
                    continue;
                }
                let Some(stem) = name.strip_suffix(".git") else {
                    continue;
                };
                match stem.parse::<u64>() {
                    Ok(epoch) => epochs.push(epoch),
                    Err(_) => log::debug!("invalid epoch directory: {}", name),
                }
            }
        }
        if epochs.is_empty() {
            return Err(Error::PublicInbox(format!(
                "no existing epochs found in {}",
                epochs_dir.display()
            )));
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    pub fn get_highest_epoch(&self) -> Result<u64> {
        Ok(*self.find_epochs()?.last().expect("nonempty"))
    }

    fn branch_for(&self, gitdir: &Path, repo: &gix::Repository) -> String {
        if let Some(branch) = self.branch_cache.borrow().get(gitdir) {
            return branch.clone();
        }
        let branch = git::default_branch(repo);
        self.branch_cache
            .borrow_mut()
            .insert(gitdir.to_path_buf(), branch.clone());
        branch
    }

    /// The tip of an epoch, or `None` when it has no commits yet.
    pub fn top_commit(&self, epoch: u64) -> Result<Option<String>> {
        let gitdir = self.gitdir(epoch);
        let repo = git::open_repo(&gitdir)?;
        let branch = self.branch_for(&gitdir, &repo);
        Ok(git::top_commit(&repo, &branch))
    }

    /// Raw message bytes stored at a commit in the given epoch.
    pub fn get_message_at_commit(&self, epoch: u64, commit: &str) -> Result<Vec<u8>> {
        let repo = git::open_repo(&self.gitdir(epoch))?;
        git::message_at_commit(&repo, commit)
    }

    // ------------------------------------------------------------------
    // Feed state

    pub fn load_feed_state(&self) -> Result<FeedState> {
        let path = self.feed_dir.join("korgalore.feed");
        if !path.exists() {
            return Err(Error::State(format!(
                "feed state not found: {}",
                path.display()
            )));
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    pub fn save_feed_state(
        &self,
        highest_epoch: u64,
        latest_commit: Option<String>,
        success: bool,
    ) -> Result<()> {
        let latest_commit = match latest_commit {
            Some(commit) => commit,
            None => self.top_commit(highest_epoch)?.unwrap_or_default(),
        };
        let state = FeedState {
            last_update: Utc::now().format(git::COMMIT_DATE_FORMAT).to_string(),
            update_successful: success,
            latest_commit,
            highest_epoch,
        };
        fs::write(
            self.feed_dir.join("korgalore.feed"),
            serde_json::to_string_pretty(&state)?,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Legacy migration

    /// Copy a legacy single-file state into the per-delivery name, then
    /// park the legacy file under a `.pre-migration` suffix so it is
    /// only migrated once. Runs under the feed lock.
    fn migrate_legacy_file(&self, delivery: &str, suffix: &str) -> Result<bool> {
        let new_path = self.state_file(Some(delivery), suffix);
        if new_path.exists() {
            return Ok(false);
        }
        let legacy = self.state_file(None, suffix);
        if !legacy.exists() {
            return Ok(false);
        }

        log::debug!(
            "migrating legacy {} to {}",
            legacy.display(),
            new_path.display()
        );
        fs::copy(&legacy, &new_path)?;

        let archived = PathBuf::from(format!("{}.pre-migration", legacy.display()));
        if archived.exists() {
            log::info!(
                "migrated {} to per-delivery format (archive already exists, legacy file kept)",
                legacy.display()
            );
        } else {
            fs::rename(&legacy, &archived)?;
            log::info!(
                "migrated {} to per-delivery format: {}",
                legacy.display(),
                new_path.display()
            );
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Delivery cursors

    pub fn load_delivery_info(&self, delivery: &str) -> Result<Option<DeliveryInfo>> {
        self.migrate_legacy_file(delivery, "info")?;
        let path = self.state_file(Some(delivery), "info");
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(&path)?)?))
    }

    /// Write the cursor for one epoch. With `commit = None` the epoch
    /// tip is used; an empty epoch records an empty cursor. With
    /// `message = None` the message is read back from the commit; a
    /// commit without a message file gets placeholder anchors.
    pub fn save_delivery_cursor(
        &self,
        delivery: &str,
        epoch: u64,
        commit: Option<&str>,
        message: Option<&RawMessage>,
    ) -> Result<()> {
        let gitdir = self.gitdir(epoch);
        let repo = git::open_repo(&gitdir)?;
        let branch = self.branch_for(&gitdir, &repo);

        let last = match commit {
            Some(commit) => commit.to_string(),
            None => git::top_commit(&repo, &branch).unwrap_or_default(),
        };

        let cursor = if last.is_empty() {
            EpochCursor {
                last: String::new(),
                commit_date: String::new(),
                subject: "(no subject)".to_string(),
                msgid: "(no message-id)".to_string(),
            }
        } else {
            let commit_date = git::commit_date(&repo, &last)?;
            let fetched;
            let msg = match message {
                Some(msg) => Some(msg),
                None => match git::message_at_commit(&repo, &last) {
                    Ok(raw) => {
                        fetched = RawMessage::new(raw);
                        Some(&fetched)
                    }
                    Err(Error::State(_)) => None,
                    Err(e) => return Err(e),
                },
            };
            EpochCursor {
                last,
                commit_date,
                subject: msg
                    .map(|m| m.subject_or_default().to_string())
                    .unwrap_or_else(|| "(no subject)".to_string()),
                msgid: msg
                    .map(|m| m.message_id_or_default().to_string())
                    .unwrap_or_else(|| "(no message-id)".to_string()),
            }
        };

        let mut info = self.load_delivery_info(delivery)?.unwrap_or_default();
        info.insert(epoch.to_string(), cursor);
        fs::write(
            self.state_file(Some(delivery), "info"),
            serde_json::to_string_pretty(&info)?,
        )?;
        Ok(())
    }

    /// Create delivery state for a fresh subscription: at the tip
    /// (default), or before the first commit of the working epoch
    /// (`from_start`), in which case the next enumeration delivers the
    /// entire epoch.
    pub fn init_delivery_state(&self, delivery: &str, from_start: bool) -> Result<()> {
        let epoch = self.get_highest_epoch()?;
        if from_start {
            self.save_delivery_cursor(delivery, epoch, Some(""), None)
        } else {
            self.save_delivery_cursor(delivery, epoch, None, None)
        }
    }

    // ------------------------------------------------------------------
    // New-commit enumeration

    /// Ordered new commits for a delivery as `(epoch, commit)` pairs,
    /// spanning an epoch rollover when one happened.
    pub fn get_latest_commits_for_delivery(
        &self,
        delivery: &str,
    ) -> Result<Vec<(u64, String)>> {
        let Some(info) = self.load_delivery_info(delivery)? else {
            // New delivery on an already-primed feed: start at the tip
            // and deliver only what arrives from here on.
            log::info!(
                "initializing new delivery state file: korgalore.{}.info",
                delivery
            );
            self.init_delivery_state(delivery, false)?;
            return Ok(Vec::new());
        };

        let working_epoch = info
            .keys()
            .filter_map(|k| k.parse::<u64>().ok())
            .max()
            .ok_or_else(|| {
                Error::State(format!(
                    "delivery state for {} has no epoch entries",
                    delivery
                ))
            })?;

        let mut result: Vec<(u64, String)> = self
            .new_commits_in_epoch(delivery, working_epoch, &info)?
            .into_iter()
            .map(|commit| (working_epoch, commit))
            .collect();

        // Rollover: a higher epoch exists on disk without a cursor
        // entry; everything in it is new.
        let highest = self.get_highest_epoch()?;
        if highest > working_epoch {
            let gitdir = self.gitdir(highest);
            let repo = git::open_repo(&gitdir)?;
            let branch = self.branch_for(&gitdir, &repo);
            let all = git::commits_since(&repo, &branch, None)?;
            result.extend(all.commits.into_iter().map(|commit| (highest, commit)));
        }

        Ok(result)
    }

    fn new_commits_in_epoch(
        &self,
        delivery: &str,
        epoch: u64,
        info: &DeliveryInfo,
    ) -> Result<Vec<String>> {
        let cursor = info.get(&epoch.to_string()).ok_or_else(|| {
            Error::State(format!(
                "delivery state for {} has no entry for epoch {}",
                delivery, epoch
            ))
        })?;

        let gitdir = self.gitdir(epoch);
        let repo = git::open_repo(&gitdir)?;
        let branch = self.branch_for(&gitdir, &repo);

        if cursor.last.is_empty() {
            // The epoch was empty when the cursor was written.
            return Ok(git::commits_since(&repo, &branch, None)?.commits);
        }

        let listed = git::commits_since(&repo, &branch, Some(&cursor.last))?;
        if listed.cursor_found {
            return Ok(listed.commits);
        }

        log::debug!(
            "cursor {} not found in epoch {}, trying to recover after rebase",
            cursor.last,
            epoch
        );
        match self.recover_after_rebase(delivery, epoch, cursor)? {
            Some(recovered) => {
                Ok(git::commits_since(&repo, &branch, Some(&recovered))?.commits)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Find a new cursor for a commit that no longer resolves: list
    /// commits from the saved commit date forward and match on
    /// (subject, message-id). Falls back to the first commit at or
    /// after the date; returns `None` when there is nothing to replay
    /// (the cursor was reanchored at the tip).
    fn recover_after_rebase(
        &self,
        delivery: &str,
        epoch: u64,
        cursor: &EpochCursor,
    ) -> Result<Option<String>> {
        let date = DateTime::parse_from_str(&cursor.commit_date, git::COMMIT_DATE_FORMAT)
            .map_err(|_| {
                Error::State(format!(
                    "no usable commit_date in delivery state for {}",
                    delivery
                ))
            })?;
        log::debug!("last processed commit date: {}", cursor.commit_date);

        let gitdir = self.gitdir(epoch);
        let repo = git::open_repo(&gitdir)?;
        let branch = self.branch_for(&gitdir, &repo);

        let candidates = match git::commits_since_date(&repo, &branch, &date) {
            Ok(candidates) => candidates,
            Err(e) => {
                log::warn!(
                    "could not list commits to recover after rebase ({}), reanchoring at tip",
                    e
                );
                self.save_delivery_cursor(delivery, epoch, None, None)?;
                return Ok(None);
            }
        };

        if candidates.is_empty() {
            self.save_delivery_cursor(delivery, epoch, None, None)?;
            return Ok(None);
        }

        let mut matched: Option<(String, RawMessage)> = None;
        for candidate in &candidates {
            let raw = match git::message_at_commit(&repo, candidate) {
                Ok(raw) => raw,
                Err(Error::State(_)) => continue,
                Err(e) => return Err(e),
            };
            let msg = RawMessage::new(raw);
            if msg.subject_or_default() == cursor.subject
                && msg.message_id_or_default() == cursor.msgid
            {
                log::debug!("recovered exact matching commit after rebase: {}", candidate);
                matched = Some((candidate.clone(), msg));
                break;
            }
        }

        let (last, msg) = match matched {
            Some(found) => found,
            None => {
                let first = candidates[0].clone();
                log::error!("could not find exact commit after rebase");
                log::error!("resuming from first possible commit after date: {}", first);
                let msg = match git::message_at_commit(&repo, &first) {
                    Ok(raw) => RawMessage::new(raw),
                    Err(_) => RawMessage::new(Vec::new()),
                };
                (first, msg)
            }
        };

        self.save_delivery_cursor(delivery, epoch, Some(&last), Some(&msg))?;
        Ok(Some(last))
    }

    // ------------------------------------------------------------------
    // Failure ledger

    pub fn get_failed_commits_for_delivery(&self, delivery: &str) -> Result<Vec<(u64, String)>> {
        self.migrate_legacy_file(delivery, "failed")?;
        let entries: Vec<FailedEntry> =
            read_jsonl(&self.state_file(Some(delivery), "failed"))?;
        Ok(entries.into_iter().map(|e| (e.0, e.1)).collect())
    }

    /// Record a failed attempt: create the entry, bump the retry
    /// count, or promote it to the rejected ledger once the retry
    /// window has elapsed.
    pub fn mark_failed_delivery(&self, delivery: &str, epoch: u64, commit: &str) -> Result<()> {
        self.migrate_legacy_file(delivery, "failed")?;
        let failed_path = self.state_file(Some(delivery), "failed");
        let mut entries: Vec<FailedEntry> = read_jsonl(&failed_path)?;
        let now = Utc::now();

        match entries
            .iter()
            .position(|e| e.0 == epoch && e.1 == commit)
        {
            Some(pos) => {
                let expired = parse_first_failure(&entries[pos].2)
                    .map(|first| (now - first).num_seconds() > RETRY_FAILED_INTERVAL)
                    .unwrap_or(true);
                if expired {
                    let entry = entries.remove(pos);
                    append_jsonl(
                        &self.state_file(Some(delivery), "rejected"),
                        &RejectedEntry(entry.0, entry.1.clone()),
                    )?;
                    log::warn!(
                        "rejecting commit {} for delivery {} after retry window expired",
                        entry.1,
                        delivery
                    );
                } else {
                    entries[pos].3 += 1;
                }
                write_jsonl(&failed_path, &entries)?;
            }
            None => {
                append_jsonl(
                    &failed_path,
                    &FailedEntry(epoch, commit.to_string(), now.to_rfc3339(), 1),
                )?;
            }
        }
        Ok(())
    }

    /// Promote entries whose retry window elapsed to the rejected
    /// ledger without another attempt. Returns the entries that are
    /// still eligible for retry.
    pub fn reject_expired_failures(&self, delivery: &str) -> Result<Vec<(u64, String)>> {
        self.migrate_legacy_file(delivery, "failed")?;
        let failed_path = self.state_file(Some(delivery), "failed");
        let entries: Vec<FailedEntry> = read_jsonl(&failed_path)?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut keep = Vec::new();
        let mut remaining = Vec::new();
        for entry in entries {
            let expired = parse_first_failure(&entry.2)
                .map(|first| (now - first).num_seconds() > RETRY_FAILED_INTERVAL)
                .unwrap_or(true);
            if expired {
                append_jsonl(
                    &self.state_file(Some(delivery), "rejected"),
                    &RejectedEntry(entry.0, entry.1.clone()),
                )?;
                log::warn!(
                    "rejecting commit {} for delivery {} after retry window expired",
                    entry.1,
                    delivery
                );
            } else {
                remaining.push((entry.0, entry.1.clone()));
                keep.push(entry);
            }
        }
        write_jsonl(&failed_path, &keep)?;
        Ok(remaining)
    }

    /// Record a successful delivery: advance the cursor and, when the
    /// commit was being retried, drop it from the failed ledger.
    pub fn mark_successful_delivery(
        &self,
        delivery: &str,
        epoch: u64,
        commit: &str,
        message: &RawMessage,
        was_failing: bool,
    ) -> Result<()> {
        if was_failing {
            let failed_path = self.state_file(Some(delivery), "failed");
            let mut entries: Vec<FailedEntry> = read_jsonl(&failed_path)?;
            let before = entries.len();
            entries.retain(|e| !(e.0 == epoch && e.1 == commit));
            if entries.len() != before {
                write_jsonl(&failed_path, &entries)?;
            }
        }
        self.save_delivery_cursor(delivery, epoch, Some(commit), Some(message))
    }

    /// Drop an empty failed ledger file.
    pub fn cleanup_failed_state(&self, delivery: &str) -> Result<()> {
        let path = self.state_file(Some(delivery), "failed");
        if path.exists() {
            let entries: Vec<FailedEntry> = read_jsonl(&path)?;
            if entries.is_empty() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// JSON-lines helpers

pub fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(line)?);
    }
    Ok(entries)
}

/// Rewrite a JSON-lines file; an empty list removes the file.
pub fn write_jsonl<T: Serialize>(path: &Path, entries: &[T]) -> Result<()> {
    if entries.is_empty() {
        if path.exists() {
            fs::remove_file(path)?;
        }
        return Ok(());
    }
    let mut out = String::new();
    for entry in entries {
        out.push_str(&serde_json::to_string(entry)?);
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

pub fn append_jsonl<T: Serialize>(path: &Path, entry: &T) -> Result<()> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(serde_json::to_string(entry)?.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

// ----------------------------------------------------------------------
// Feed variants behind one surface

pub enum Feed {
    Archive(ArchiveFeed),
    Search(SearchFeed),
}

impl Feed {
    pub fn core(&self) -> &FeedCore {
        match self {
            Feed::Archive(feed) => &feed.core,
            Feed::Search(feed) => &feed.core,
        }
    }

    pub fn feed_key(&self) -> &str {
        &self.core().feed_key
    }

    pub fn feed_url(&self) -> &str {
        match self {
            Feed::Archive(feed) => feed.feed_url(),
            Feed::Search(feed) => feed.feed_url(),
        }
    }

    /// Refresh the feed from its source. Returns a bitmask over
    /// `STATUS_UPDATED`, `STATUS_INITIALIZED` and `STATUS_NOCHANGE`.
    pub async fn update_feed(&mut self) -> Result<u8> {
        match self {
            Feed::Archive(feed) => feed.update_feed().await,
            Feed::Search(feed) => feed.update_feed().await,
        }
    }

    pub fn feed_lock(&self) -> Result<()> {
        self.core().feed_lock()
    }

    pub fn feed_unlock(&self) -> Result<()> {
        self.core().feed_unlock()
    }

    pub fn get_latest_commits_for_delivery(&self, delivery: &str) -> Result<Vec<(u64, String)>> {
        self.core().get_latest_commits_for_delivery(delivery)
    }

    pub fn get_message_at_commit(&self, epoch: u64, commit: &str) -> Result<Vec<u8>> {
        self.core().get_message_at_commit(epoch, commit)
    }

    pub fn get_failed_commits_for_delivery(&self, delivery: &str) -> Result<Vec<(u64, String)>> {
        self.core().get_failed_commits_for_delivery(delivery)
    }

    pub fn reject_expired_failures(&self, delivery: &str) -> Result<Vec<(u64, String)>> {
        self.core().reject_expired_failures(delivery)
    }

    pub fn mark_failed_delivery(&self, delivery: &str, epoch: u64, commit: &str) -> Result<()> {
        self.core().mark_failed_delivery(delivery, epoch, commit)
    }

    pub fn mark_successful_delivery(
        &self,
        delivery: &str,
        epoch: u64,
        commit: &str,
        message: &RawMessage,
        was_failing: bool,
    ) -> Result<()> {
        self.core()
            .mark_successful_delivery(delivery, epoch, commit, message, was_failing)
    }

    pub fn save_delivery_cursor(
        &self,
        delivery: &str,
        epoch: u64,
        commit: Option<&str>,
        message: Option<&RawMessage>,
    ) -> Result<()> {
        self.core()
            .save_delivery_cursor(delivery, epoch, commit, message)
    }

    pub fn init_delivery_state(&self, delivery: &str, from_start: bool) -> Result<()> {
        self.core().init_delivery_state(delivery, from_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_core(tmp: &TempDir) -> FeedCore {
        let feed_dir = tmp.path().join("test-feed");
        fs::create_dir_all(feed_dir.join("git/0.git")).unwrap();
        FeedCore::new("test-feed", feed_dir)
    }

    #[test]
    fn test_read_missing_jsonl_is_empty() {
        let tmp = TempDir::new().unwrap();
        let entries: Vec<FailedEntry> =
            read_jsonl(&tmp.path().join("nonexistent.jsonl")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_jsonl_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.jsonl");
        let entries = vec![
            FailedEntry(1, "abc123".into(), "2024-01-01T00:00:00+00:00".into(), 1),
            FailedEntry(2, "def456".into(), "2024-01-02T00:00:00+00:00".into(), 2),
        ];
        write_jsonl(&path, &entries).unwrap();
        let read: Vec<FailedEntry> = read_jsonl(&path).unwrap();
        assert_eq!(read, entries);
    }

    #[test]
    fn test_write_empty_jsonl_removes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.jsonl");
        fs::write(&path, "[1, \"abc\"]\n").unwrap();
        write_jsonl::<FailedEntry>(&path, &[]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_append_jsonl() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.jsonl");
        append_jsonl(&path, &RejectedEntry(1, "abc123".into())).unwrap();
        append_jsonl(&path, &RejectedEntry(2, "def456".into())).unwrap();
        let read: Vec<RejectedEntry> = read_jsonl(&path).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0], RejectedEntry(1, "abc123".into()));
    }

    #[test]
    fn test_new_failure_creates_entry() {
        let tmp = TempDir::new().unwrap();
        let core = make_core(&tmp);
        core.mark_failed_delivery("d1", 0, "abc123").unwrap();

        let entries: Vec<FailedEntry> =
            read_jsonl(&core.state_file(Some("d1"), "failed")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, 0);
        assert_eq!(entries[0].1, "abc123");
        assert_eq!(entries[0].3, 1);
    }

    #[test]
    fn test_repeated_failure_increments_retry() {
        let tmp = TempDir::new().unwrap();
        let core = make_core(&tmp);
        let path = core.state_file(Some("d1"), "failed");
        write_jsonl(
            &path,
            &[FailedEntry(0, "abc123".into(), Utc::now().to_rfc3339(), 3)],
        )
        .unwrap();

        core.mark_failed_delivery("d1", 0, "abc123").unwrap();

        let entries: Vec<FailedEntry> = read_jsonl(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].3, 4);
    }

    #[test]
    fn test_expired_failure_moves_to_rejected() {
        let tmp = TempDir::new().unwrap();
        let core = make_core(&tmp);
        let failed_path = core.state_file(Some("d1"), "failed");
        let old = Utc::now() - chrono::Duration::seconds(RETRY_FAILED_INTERVAL + 3600);
        write_jsonl(
            &failed_path,
            &[FailedEntry(0, "abc123".into(), old.to_rfc3339(), 10)],
        )
        .unwrap();

        core.mark_failed_delivery("d1", 0, "abc123").unwrap();

        let failed: Vec<FailedEntry> = read_jsonl(&failed_path).unwrap();
        assert!(failed.is_empty());
        let rejected: Vec<RejectedEntry> =
            read_jsonl(&core.state_file(Some("d1"), "rejected")).unwrap();
        assert_eq!(rejected, vec![RejectedEntry(0, "abc123".into())]);
        // Removing the last failed entry deletes the file.
        assert!(!failed_path.exists());
    }

    #[test]
    fn test_multiple_failures_only_updates_matching() {
        let tmp = TempDir::new().unwrap();
        let core = make_core(&tmp);
        let path = core.state_file(Some("d1"), "failed");
        let now = Utc::now().to_rfc3339();
        write_jsonl(
            &path,
            &[
                FailedEntry(0, "abc123".into(), now.clone(), 1),
                FailedEntry(0, "def456".into(), now.clone(), 2),
                FailedEntry(1, "ghi789".into(), now, 3),
            ],
        )
        .unwrap();

        core.mark_failed_delivery("d1", 0, "def456").unwrap();

        let entries: Vec<FailedEntry> = read_jsonl(&path).unwrap();
        assert_eq!(entries.len(), 3);
        let by_commit: BTreeMap<&str, u32> =
            entries.iter().map(|e| (e.1.as_str(), e.3)).collect();
        assert_eq!(by_commit["abc123"], 1);
        assert_eq!(by_commit["def456"], 3);
        assert_eq!(by_commit["ghi789"], 3);
    }

    #[test]
    fn test_reject_expired_failures_without_attempt() {
        let tmp = TempDir::new().unwrap();
        let core = make_core(&tmp);
        let failed_path = core.state_file(Some("d1"), "failed");
        let old = Utc::now() - chrono::Duration::seconds(RETRY_FAILED_INTERVAL + 86400);
        write_jsonl(
            &failed_path,
            &[
                FailedEntry(0, "stale".into(), old.to_rfc3339(), 7),
                FailedEntry(0, "recent".into(), Utc::now().to_rfc3339(), 1),
            ],
        )
        .unwrap();

        let remaining = core.reject_expired_failures("d1").unwrap();
        assert_eq!(remaining, vec![(0, "recent".to_string())]);

        let rejected: Vec<RejectedEntry> =
            read_jsonl(&core.state_file(Some("d1"), "rejected")).unwrap();
        assert_eq!(rejected, vec![RejectedEntry(0, "stale".into())]);

        let failed: Vec<FailedEntry> = read_jsonl(&failed_path).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].1, "recent");
    }

    #[test]
    fn test_get_failed_commits() {
        let tmp = TempDir::new().unwrap();
        let core = make_core(&tmp);
        assert!(core.get_failed_commits_for_delivery("none").unwrap().is_empty());

        write_jsonl(
            &core.state_file(Some("d1"), "failed"),
            &[
                FailedEntry(0, "abc123".into(), Utc::now().to_rfc3339(), 1),
                FailedEntry(1, "def456".into(), Utc::now().to_rfc3339(), 2),
            ],
        )
        .unwrap();

        let failed = core.get_failed_commits_for_delivery("d1").unwrap();
        assert_eq!(
            failed,
            vec![(0, "abc123".to_string()), (1, "def456".to_string())]
        );
    }

    #[test]
    fn test_cleanup_failed_state() {
        let tmp = TempDir::new().unwrap();
        let core = make_core(&tmp);
        let path = core.state_file(Some("d1"), "failed");

        fs::write(&path, "").unwrap();
        core.cleanup_failed_state("d1").unwrap();
        assert!(!path.exists());

        write_jsonl(
            &path,
            &[FailedEntry(0, "abc123".into(), Utc::now().to_rfc3339(), 1)],
        )
        .unwrap();
        core.cleanup_failed_state("d1").unwrap();
        assert!(path.exists());

        core.cleanup_failed_state("missing").unwrap();
    }

    #[test]
    fn test_find_epochs_sorted_and_filtered() {
        let tmp = TempDir::new().unwrap();
        let feed_dir = tmp.path().join("feed");
        for name in ["2.git", "0.git", "1.git", "not_an_epoch.git", "random"] {
            fs::create_dir_all(feed_dir.join("git").join(name)).unwrap();
        }
        let core = FeedCore::new("feed", &feed_dir);
        assert_eq!(core.find_epochs().unwrap(), vec![0, 1, 2]);
        assert_eq!(core.get_highest_epoch().unwrap(), 2);
    }

    #[test]
    fn test_no_epochs_is_public_inbox_error() {
        let tmp = TempDir::new().unwrap();
        let feed_dir = tmp.path().join("feed");
        fs::create_dir_all(feed_dir.join("git")).unwrap();
        let core = FeedCore::new("feed", &feed_dir);
        assert!(matches!(
            core.find_epochs().unwrap_err(),
            Error::PublicInbox(_)
        ));
    }

    #[test]
    fn test_lock_cycle() {
        let tmp = TempDir::new().unwrap();
        let core = make_core(&tmp);
        assert!(!core.is_locked());
        core.feed_lock().unwrap();
        assert!(core.is_locked());
        // Re-locking is idempotent.
        core.feed_lock().unwrap();
        core.feed_unlock().unwrap();
        assert!(!core.is_locked());
    }

    #[test]
    fn test_unlock_without_lock_is_state_error() {
        let tmp = TempDir::new().unwrap();
        let core = make_core(&tmp);
        assert!(matches!(core.feed_unlock().unwrap_err(), Error::State(_)));
    }

    #[test]
    fn test_lock_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let core = FeedCore::new("fresh", tmp.path().join("does-not-exist-yet"));
        core.feed_lock().unwrap();
        assert!(core.feed_dir.join("korgalore.lock").exists());
        core.feed_unlock().unwrap();
    }

    #[test]
    fn test_legacy_info_migration() {
        let tmp = TempDir::new().unwrap();
        let core = make_core(&tmp);
        let legacy = core.state_file(None, "info");
        let legacy_content = r#"{"0": {"last": "abc", "commit_date": "2024-01-01 00:00:00 +0000", "subject": "s", "msgid": "<m@x>"}}"#;
        fs::write(&legacy, legacy_content).unwrap();

        let info = core.load_delivery_info("d1").unwrap().unwrap();
        assert_eq!(info["0"].last, "abc");

        // Legacy file parked, per-delivery file present.
        assert!(!legacy.exists());
        assert!(core.feed_dir.join("korgalore.info.pre-migration").exists());
        assert!(core.state_file(Some("d1"), "info").exists());

        // A second delivery migrating later finds only the archive.
        let info2 = core.load_delivery_info("d2").unwrap();
        assert!(info2.is_none());
    }

    #[test]
    fn test_feed_state_round_trip() {
        let tmp = TempDir::new().unwrap();
        let core = make_core(&tmp);
        assert!(matches!(
            core.load_feed_state().unwrap_err(),
            Error::State(_)
        ));

        core.save_feed_state(3, Some("abc123".into()), true).unwrap();
        let state = core.load_feed_state().unwrap();
        assert_eq!(state.highest_epoch, 3);
        assert_eq!(state.latest_commit, "abc123");
        assert!(state.update_successful);
    }

    #[test]
    fn test_first_failure_parsing() {
        assert!(parse_first_failure("2024-01-01T00:00:00+00:00").is_some());
        assert!(parse_first_failure("2024-01-01T00:00:00").is_some());
        assert!(parse_first_failure("garbage").is_none());
    }
}
