//! Pipeline orchestrator: the pull cycle.
//!
//! One cycle builds the delivery map, locks every unique feed, retries
//! previously failed commits, updates the feeds, enumerates new
//! commits per delivery, delivers them grouped by target, persists the
//! cursors and ledgers, and unlocks. Errors inside the per-commit loop
//! land in the retry ledger; errors outside it are logged and skip to
//! the next feed or target.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use sha2::{Digest, Sha256};

use crate::bozofilter::Bozofilter;
use crate::config::{Config, TargetConfig};
use crate::error::{Error, Result};
use crate::feed::{
    ArchiveFeed, Feed, SearchFeed, STATUS_INITIALIZED, STATUS_UPDATED,
};
use crate::message::RawMessage;
use crate::targets::{DeliveryContext, ImportOutcome, Target};
use crate::tracking::TrackingManifest;

/// Abort a target after this many consecutive failures.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Normalize a feed URL into a stable key used for the on-disk
/// directory and internal tracking.
pub fn normalize_feed_key(feed_url: &str) -> String {
    if let Some(list) = feed_url.strip_prefix("https://lore.kernel.org/") {
        return list.trim_matches('/').to_string();
    }
    if feed_url.starts_with("lei:") {
        return feed_url.to_string();
    }

    let without_scheme = feed_url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let re = regex::Regex::new(r"[^a-zA-Z0-9_.-]").expect("valid pattern");
    let sanitized = re
        .replace_all(without_scheme, "-")
        .trim_matches(|c| c == '-' || c == '.' || c == '/')
        .to_string();

    if sanitized.len() > 200 {
        let mut hasher = Sha256::new();
        hasher.update(feed_url.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::new();
        for byte in digest.iter().take(8) {
            let _ = write!(hex, "{:02x}", byte);
        }
        log::debug!("feed URL too long, using hash-based directory name");
        return format!("feed-{}", hex);
    }
    sanitized
}

/// Expand strftime directives against the local clock. Invalid
/// directives are a configuration error rather than a panic.
pub fn expand_subfolder(template: &str) -> Result<String> {
    let mut out = String::new();
    write!(out, "{}", Local::now().format(template)).map_err(|_| {
        Error::Configuration(format!("invalid subfolder template: {}", template))
    })?;
    Ok(out)
}

struct DeliveryBinding {
    feed_key: String,
    target_name: String,
    labels: Vec<String>,
    subfolder: Option<String>,
    subfolder_template: Option<String>,
    tracked: bool,
}

/// What happened to one commit.
enum CommitOutcome {
    Delivered(Option<String>),
    /// Sender was bozofiltered; marked successful, never handed over.
    Bozoed,
    /// Commit has no message file; skipped without touching state.
    SkippedState,
    /// Recorded in the failed ledger.
    Failed,
}

#[derive(Debug, Default)]
pub struct PullOutcome {
    /// Delivered message counts per delivery name.
    pub changes: BTreeMap<String, u64>,
    /// Unique Message-IDs delivered this cycle.
    pub unique_msgids: HashSet<String>,
}

pub struct PullOptions {
    pub no_update: bool,
    pub force: bool,
    pub delivery: Option<String>,
}

pub struct Pipeline {
    config: Config,
    config_dir: PathBuf,
    data_dir: PathBuf,
    interactive: bool,
    client: reqwest::Client,
    bozofilter: Bozofilter,
    cancel: Arc<AtomicBool>,
    feeds: HashMap<String, Feed>,
    targets: HashMap<String, Target>,
    bindings: BTreeMap<String, DeliveryBinding>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        config_dir: PathBuf,
        data_dir: PathBuf,
        interactive: bool,
    ) -> Result<Self> {
        if let Some(id) = &config.main.user_agent_plus {
            crate::set_user_agent_plus(id);
        }
        let client = reqwest::Client::builder()
            .user_agent(crate::user_agent())
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))?;
        let bozofilter = Bozofilter::load(&config_dir);

        Ok(Self {
            config,
            config_dir,
            data_dir,
            interactive,
            client,
            bozofilter,
            cancel: Arc::new(AtomicBool::new(false)),
            feeds: HashMap::new(),
            targets: HashMap::new(),
            bindings: BTreeMap::new(),
        })
    }

    /// Flag checked between commits; set from a signal handler to stop
    /// the current target's iteration.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve a delivery's `feed` value (name or direct URL) to a URL.
    fn resolve_feed_url(&self, feed_value: &str) -> Result<String> {
        if feed_value.starts_with("https:") || feed_value.starts_with("lei:") {
            return Ok(feed_value.to_string());
        }
        let feed = self.config.feeds.get(feed_value).ok_or_else(|| {
            log::error!(
                "feed \"{}\" not found in configuration. Known feeds: {}",
                feed_value,
                self.config
                    .feeds
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            Error::Configuration(format!(
                "feed \"{}\" not found in configuration",
                feed_value
            ))
        })?;
        if feed.url.is_empty() {
            return Err(Error::Configuration(format!(
                "feed \"{}\" has no URL configured",
                feed_value
            )));
        }
        Ok(feed.url.clone())
    }

    /// Look up or construct the feed for a URL; one live instance per
    /// key for the process lifetime.
    async fn ensure_feed(&mut self, feed_url: &str) -> Result<String> {
        let feed_key = normalize_feed_key(feed_url);
        if self.feeds.contains_key(&feed_key) {
            return Ok(feed_key);
        }

        let feed = if feed_url.starts_with("https:") {
            let feed_dir = self.data_dir.join(&feed_key);
            Feed::Archive(ArchiveFeed::new(
                feed_key.clone(),
                feed_dir,
                feed_url,
                self.client.clone(),
            ))
        } else if feed_url.starts_with("lei:") {
            Feed::Search(SearchFeed::new(feed_key.clone(), feed_url).await?)
        } else {
            return Err(Error::Configuration(format!(
                "unknown feed type for delivery: {}",
                feed_url
            )));
        };

        self.feeds.insert(feed_key.clone(), feed);
        Ok(feed_key)
    }

    fn ensure_target(&mut self, target_name: &str) -> Result<()> {
        if self.targets.contains_key(target_name) {
            return Ok(());
        }
        let cfg = self.config.targets.get(target_name).ok_or_else(|| {
            Error::Configuration(format!(
                "target \"{}\" not found in configuration",
                target_name
            ))
        })?;
        let target = Target::from_config(target_name, cfg, &self.config_dir, self.interactive)?;
        self.targets.insert(target_name.to_string(), target);
        Ok(())
    }

    /// Validate one delivery's labels/subfolder against its target
    /// kind and expand the strftime template.
    fn subfolder_for(
        &self,
        delivery_name: &str,
        target_name: &str,
        subfolder: Option<&str>,
    ) -> Result<(Option<String>, Option<String>)> {
        let Some(template) = subfolder else {
            return Ok((None, None));
        };
        let is_maildir = matches!(
            self.config.targets.get(target_name),
            Some(TargetConfig::Maildir { .. })
        );
        if template.contains('%') && !is_maildir {
            return Err(Error::Configuration(format!(
                "delivery \"{}\": strftime subfolder templates are only supported for maildir targets",
                delivery_name
            )));
        }
        let expanded = expand_subfolder(template)?;
        Ok((Some(expanded), Some(template.to_string())))
    }

    /// Build the delivery map for the named subset (or everything).
    async fn map_deliveries(&mut self, names: &[String]) -> Result<()> {
        log::debug!("mapping deliveries to their feeds and targets");
        for name in names {
            let details = self.config.deliveries.get(name).cloned().ok_or_else(|| {
                Error::Configuration(format!("delivery \"{}\" not found in configuration", name))
            })?;

            if details.feed.is_empty() {
                return Err(Error::Configuration(format!(
                    "no feed specified for delivery: {}",
                    name
                )));
            }
            if details.target.is_empty() {
                return Err(Error::Configuration(format!(
                    "no target specified for delivery: {}",
                    name
                )));
            }
            for label in &details.labels {
                if label.contains('%') {
                    return Err(Error::Configuration(format!(
                        "delivery \"{}\": labels must not contain '%': {}",
                        name, label
                    )));
                }
            }

            let feed_url = self.resolve_feed_url(&details.feed)?;
            let feed_key = self.ensure_feed(&feed_url).await?;
            self.ensure_target(&details.target)?;

            let (subfolder, subfolder_template) =
                self.subfolder_for(name, &details.target, details.subfolder.as_deref())?;

            let labels = if details.labels.is_empty() {
                self.targets[&details.target]
                    .default_labels()
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            } else {
                details.labels.clone()
            };

            self.bindings.insert(
                name.clone(),
                DeliveryBinding {
                    feed_key,
                    target_name: details.target.clone(),
                    labels,
                    subfolder,
                    subfolder_template,
                    tracked: false,
                },
            );
        }
        Ok(())
    }

    /// Map active tracked threads as ephemeral deliveries.
    async fn map_tracked_threads(&mut self, manifest: &mut TrackingManifest) -> Result<Vec<String>> {
        let expired = manifest.check_and_expire_threads()?;
        for track_id in &expired {
            log::info!("tracked thread {} went inactive", track_id);
        }

        let threads: Vec<_> = manifest
            .active_threads()
            .map(|t| {
                (
                    t.track_id.clone(),
                    t.target.clone(),
                    t.labels.clone(),
                    t.lei_path.clone(),
                )
            })
            .collect();

        let mut mapped = Vec::new();
        for (track_id, target_name, labels, lei_path) in threads {
            if !lei_path.exists() {
                log::warn!(
                    "lei search for tracked thread {} is missing at {}",
                    track_id,
                    lei_path.display()
                );
                continue;
            }
            if let Err(e) = self.ensure_target(&target_name) {
                log::warn!("skipping tracked thread {}: {}", track_id, e);
                continue;
            }

            let feed = SearchFeed::for_existing_search(
                normalize_feed_key(&format!("lei:{}", lei_path.display())),
                &lei_path,
            );
            let feed_key = feed.core.feed_key.clone();
            self.feeds
                .entry(feed_key.clone())
                .or_insert(Feed::Search(feed));

            self.bindings.insert(
                track_id.clone(),
                DeliveryBinding {
                    feed_key,
                    target_name,
                    labels,
                    subfolder: None,
                    subfolder_template: None,
                    tracked: true,
                },
            );
            mapped.push(track_id);
        }
        Ok(mapped)
    }

    /// Re-expand retained subfolder templates so a long-running
    /// process rolls into new date-based folders.
    fn refresh_subfolder_expansions(&mut self) -> Result<()> {
        for binding in self.bindings.values_mut() {
            if let Some(template) = &binding.subfolder_template {
                binding.subfolder = Some(expand_subfolder(template)?);
            }
        }
        Ok(())
    }

    fn lock_all_feeds(&self) -> Result<()> {
        for feed in self.feeds.values() {
            feed.feed_lock()?;
        }
        Ok(())
    }

    fn unlock_all_feeds(&self) {
        for feed in self.feeds.values() {
            if feed.core().is_locked() {
                if let Err(e) = feed.feed_unlock() {
                    log::warn!("failed to unlock feed {}: {}", feed.feed_key(), e);
                }
            }
        }
    }

    /// Retry every ledgered failure across all mapped deliveries.
    async fn retry_all_failed_deliveries(&mut self) -> Result<()> {
        let mut retry_list: Vec<(String, u64, String)> = Vec::new();
        for (name, binding) in &self.bindings {
            let feed = &self.feeds[&binding.feed_key];
            // Entries past the retry window are rejected outright,
            // without another attempt.
            let to_retry = feed.reject_expired_failures(name)?;
            if to_retry.is_empty() {
                log::debug!("no failed commits to retry for delivery: {}", name);
                continue;
            }
            for (epoch, commit) in to_retry {
                retry_list.push((name.clone(), epoch, commit));
            }
        }
        if retry_list.is_empty() {
            log::debug!("no failed commits to retry for any delivery");
            return Ok(());
        }

        log::info!("retrying {} previously failed commits", retry_list.len());
        for (name, epoch, commit) in retry_list {
            if let Err(e) = self.deliver_one(&name, epoch, &commit, true).await {
                // Fatal target problems end the retry pass for this
                // commit but must not kill the whole cycle.
                log::error!("retry of {} failed: {}", commit, e);
            }
        }
        Ok(())
    }

    /// Update every unique feed; returns (updated, initialized) key
    /// sets. A feed whose update fails is logged and skipped.
    async fn update_all_feeds(&mut self) -> (Vec<String>, Vec<String>) {
        let mut updated = Vec::new();
        let mut initialized = Vec::new();

        let keys: Vec<String> = self.feeds.keys().cloned().collect();
        for feed_key in keys {
            let feed = self.feeds.get_mut(&feed_key).expect("feed exists");
            match feed.update_feed().await {
                Ok(status) => {
                    if status & STATUS_UPDATED != 0 {
                        updated.push(feed_key.clone());
                    }
                    if status & STATUS_INITIALIZED != 0 {
                        initialized.push(feed_key.clone());
                    }
                }
                Err(e) => {
                    log::error!("failed to update feed {}: {}", feed_key, e);
                }
            }
        }

        for feed_key in &initialized {
            log::info!("initialized new feed: {}", feed_key);
        }
        (updated, initialized)
    }

    /// Deliver one commit. `Err` is returned only for fatal
    /// configuration/authentication problems that abort the target.
    async fn deliver_one(
        &mut self,
        delivery_name: &str,
        epoch: u64,
        commit: &str,
        was_failing: bool,
    ) -> Result<CommitOutcome> {
        let binding = &self.bindings[delivery_name];
        let feed_key = binding.feed_key.clone();
        let target_name = binding.target_name.clone();
        let labels = binding.labels.clone();
        let subfolder = binding.subfolder.clone();

        let feed = &self.feeds[&feed_key];
        let target = self
            .targets
            .get_mut(&target_name)
            .expect("target was mapped");

        let raw = match feed.get_message_at_commit(epoch, commit) {
            Ok(raw) => raw,
            Err(Error::State(e)) => {
                // Non-message commit (e.g. a deletion marker).
                log::debug!("skipping commit {}: {}", commit, e);
                return Ok(CommitOutcome::SkippedState);
            }
            Err(e) => {
                log::debug!(
                    "failed to read commit {} from epoch {}: {}",
                    commit,
                    epoch,
                    e
                );
                feed.mark_failed_delivery(delivery_name, epoch, commit)?;
                return Ok(CommitOutcome::Failed);
            }
        };
        let msg = RawMessage::new(raw);

        if let Err(e) = target.connect().await {
            if e.is_fatal_for_delivery() {
                return Err(e);
            }
            log::debug!(
                "failed to deliver commit {} from epoch {}: {}",
                commit,
                epoch,
                e
            );
            feed.mark_failed_delivery(delivery_name, epoch, commit)?;
            if !was_failing {
                feed.save_delivery_cursor(delivery_name, epoch, Some(commit), Some(&msg))?;
            }
            return Ok(CommitOutcome::Failed);
        }

        if let Some(from) = msg.from_header() {
            if self.bozofilter.is_bozofied(from) {
                log::debug!("skipping bozofied sender: {}", from);
                // Marked successful so it is never retried.
                feed.mark_successful_delivery(delivery_name, epoch, commit, &msg, was_failing)?;
                return Ok(CommitOutcome::Bozoed);
            }
        }

        log::debug!(" -> {}", msg.subject_or_default());
        let ctx = DeliveryContext {
            feed_name: &feed_key,
            delivery_name,
            labels: &labels,
            subfolder: subfolder.as_deref(),
        };

        match target.import_message(&msg, &ctx).await {
            Ok(ImportOutcome::Delivered(_)) | Ok(ImportOutcome::Skipped) => {
                feed.mark_successful_delivery(delivery_name, epoch, commit, &msg, was_failing)?;
                Ok(CommitOutcome::Delivered(
                    msg.message_id().map(str::to_string),
                ))
            }
            Err(e) if e.is_fatal_for_delivery() => Err(e),
            Err(e) => {
                log::debug!(
                    "failed to deliver commit {} from epoch {}: {}",
                    commit,
                    epoch,
                    e
                );
                feed.mark_failed_delivery(delivery_name, epoch, commit)?;
                // Anchor the cursor on a fresh failure so rebase
                // recovery has a subject and message-id to match on.
                if !was_failing {
                    feed.save_delivery_cursor(delivery_name, epoch, Some(commit), Some(&msg))?;
                }
                Ok(CommitOutcome::Failed)
            }
        }
    }

    /// Run one pull cycle.
    pub async fn perform_pull(&mut self, opts: &PullOptions) -> Result<PullOutcome> {
        let delivery_names: Vec<String> = match &opts.delivery {
            Some(name) => {
                if !self.config.deliveries.contains_key(name) {
                    return Err(Error::Configuration(format!(
                        "delivery \"{}\" not found in configuration",
                        name
                    )));
                }
                vec![name.clone()]
            }
            None => self.config.deliveries.keys().cloned().collect(),
        };

        // The delivery map is rebuilt from scratch every cycle; feeds
        // and their locks are cached for the process lifetime.
        self.bindings.clear();
        self.map_deliveries(&delivery_names).await?;

        let mut manifest = TrackingManifest::load(&self.data_dir);
        if opts.delivery.is_none() {
            self.map_tracked_threads(&mut manifest).await?;
        }

        self.refresh_subfolder_expansions()?;
        self.lock_all_feeds()?;

        let outcome = self.run_locked_cycle(opts).await;

        self.unlock_all_feeds();

        let outcome = outcome?;

        // Refresh tracked-thread activity from the delivered counts.
        let tracked: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, b)| b.tracked)
            .map(|(name, _)| name.clone())
            .collect();
        for track_id in tracked {
            let delivered = outcome.changes.get(&track_id).copied().unwrap_or(0);
            if let Err(e) = manifest.update_activity(&track_id, delivered) {
                log::warn!("failed to update tracking activity for {}: {}", track_id, e);
            }
        }

        // Connection caches are not recoverable across cycles;
        // credentials are file-backed and are.
        self.targets.clear();

        Ok(outcome)
    }

    /// Everything that must happen under the feed locks.
    async fn run_locked_cycle(&mut self, opts: &PullOptions) -> Result<PullOutcome> {
        self.retry_all_failed_deliveries().await?;

        let updated_feeds = if opts.no_update {
            log::debug!("no-update flag set, skipping feed updates");
            Vec::new()
        } else {
            let (updated, initialized) = self.update_all_feeds().await;

            // Tip-initialize delivery state for every delivery bound
            // to a feed that was just created, so the next cycle
            // delivers only genuinely new commits.
            for (name, binding) in &self.bindings {
                if initialized.contains(&binding.feed_key) {
                    let feed = &self.feeds[&binding.feed_key];
                    if let Err(e) = feed.init_delivery_state(name, false) {
                        log::error!(
                            "failed to initialize delivery state for {}: {}",
                            name,
                            e
                        );
                    }
                }
            }
            updated
        };

        let run_deliveries: Vec<String> = if opts.force {
            log::debug!("force flag set, treating all feeds as updated");
            self.bindings.keys().cloned().collect()
        } else {
            log::debug!("updated feeds: {}", updated_feeds.join(", "));
            self.bindings
                .iter()
                .filter(|(_, b)| updated_feeds.contains(&b.feed_key))
                .map(|(name, _)| name.clone())
                .collect()
        };
        log::debug!("deliveries to run: {}", run_deliveries.join(", "));

        let mut outcome = PullOutcome::default();
        if run_deliveries.is_empty() {
            return Ok(outcome);
        }

        // Group the worklist by target so each connection is opened
        // once and closed when its batch is done.
        let mut by_target: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in &run_deliveries {
            let target_name = self.bindings[name].target_name.clone();
            by_target.entry(target_name).or_default().push(name.clone());
        }

        for (target_name, delivery_names) in by_target {
            log::debug!("processing deliveries for target: {}", target_name);

            let mut run_list: Vec<(String, u64, String)> = Vec::new();
            for name in &delivery_names {
                let feed = &self.feeds[&self.bindings[name].feed_key];
                match feed.get_latest_commits_for_delivery(name) {
                    Ok(commits) => {
                        if commits.is_empty() {
                            log::debug!("no new commits for delivery: {}", name);
                        }
                        for (epoch, commit) in commits {
                            run_list.push((name.clone(), epoch, commit));
                        }
                    }
                    Err(e) => {
                        log::error!("failed to enumerate commits for {}: {}", name, e);
                    }
                }
            }
            if run_list.is_empty() {
                log::debug!("no deliveries with new commits for target: {}", target_name);
                continue;
            }
            log::debug!(
                "delivering {} messages to target: {}",
                run_list.len(),
                target_name
            );

            let mut consecutive_failures: u32 = 0;
            for (name, epoch, commit) in run_list {
                if self.cancel.load(Ordering::Relaxed) {
                    log::warn!("pull interrupted, stopping deliveries to {}", target_name);
                    break;
                }
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    log::error!(
                        "aborting deliveries to target \"{}\" due to repeated failures",
                        target_name
                    );
                    break;
                }

                match self.deliver_one(&name, epoch, &commit, false).await {
                    Ok(CommitOutcome::Delivered(msgid)) => {
                        consecutive_failures = 0;
                        *outcome.changes.entry(name).or_insert(0) += 1;
                        if let Some(msgid) = msgid {
                            outcome.unique_msgids.insert(msgid);
                        }
                    }
                    Ok(CommitOutcome::Bozoed) | Ok(CommitOutcome::SkippedState) => {}
                    Ok(CommitOutcome::Failed) => {
                        consecutive_failures += 1;
                    }
                    Err(e) => {
                        log::error!(
                            "aborting deliveries to target \"{}\": {}",
                            target_name,
                            e
                        );
                        break;
                    }
                }
            }

            if let Some(target) = self.targets.get_mut(&target_name) {
                target.disconnect().await;
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lore_feed_key() {
        assert_eq!(
            normalize_feed_key("https://lore.kernel.org/lkml"),
            "lkml"
        );
        assert_eq!(
            normalize_feed_key("https://lore.kernel.org/netdev/"),
            "netdev"
        );
    }

    #[test]
    fn test_lei_feed_key_kept_verbatim() {
        assert_eq!(
            normalize_feed_key("lei:/home/user/.local/share/korgalore/lei/t1"),
            "lei:/home/user/.local/share/korgalore/lei/t1"
        );
    }

    #[test]
    fn test_other_url_sanitized() {
        assert_eq!(
            normalize_feed_key("https://example.com/archives/list"),
            "example.com-archives-list"
        );
    }

    #[test]
    fn test_very_long_url_hashed() {
        let url = format!("https://example.com/{}", "x".repeat(300));
        let key = normalize_feed_key(&url);
        assert!(key.starts_with("feed-"));
        assert_eq!(key.len(), "feed-".len() + 16);
        // Stable across calls.
        assert_eq!(key, normalize_feed_key(&url));
    }

    #[test]
    fn test_expand_subfolder() {
        let expanded = expand_subfolder("%Y/%m").unwrap();
        let parts: Vec<&str> = expanded.split('/').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 4);
        assert!(parts[0].parse::<u32>().is_ok());
        assert!(parts[1].parse::<u32>().is_ok());

        assert_eq!(expand_subfolder("archive").unwrap(), "archive");
    }
}
