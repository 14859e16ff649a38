//! Search feeds: local repositories maintained by `lei`.
//!
//! A `lei:<path>` feed wraps the v2 output directory of a saved lei
//! search. The external tool owns cloning and fetching; our update
//! pass asks `lei up` to refresh the search and then inspects the
//! repositories exactly like the archive variant. Search feeds
//! normally have a single epoch and never roll over in practice, but
//! a new epoch directory appearing is still honored.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{Error, Result};
use crate::feed::{FeedCore, STATUS_INITIALIZED, STATUS_NOCHANGE, STATUS_UPDATED};

const LEICMD: &str = "lei";

/// Run a lei command and return `(status, stdout)`.
pub async fn run_lei_command(args: &[&str]) -> Result<(i32, Vec<u8>)> {
    log::debug!("running lei command: lei {}", args.join(" "));
    let output = Command::new(LEICMD)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::PublicInbox(format!(
                    "lei command '{}' not found. Is it installed?",
                    LEICMD
                ))
            } else {
                Error::PublicInbox(format!("failed to run lei: {}", e))
            }
        })?;
    Ok((output.status.code().unwrap_or(-1), output.stdout))
}

/// The v2 output paths of all saved lei searches.
pub async fn known_searches() -> Result<Vec<String>> {
    let (status, stdout) = run_lei_command(&["ls-search", "-l", "-f", "json"]).await?;
    if status != 0 {
        return Err(Error::PublicInbox(format!(
            "lei ls-search failed: {}",
            String::from_utf8_lossy(&stdout).trim()
        )));
    }
    let parsed: Vec<serde_json::Value> = serde_json::from_slice(&stdout)
        .map_err(|e| Error::PublicInbox(format!("lei ls-search output is not JSON: {}", e)))?;

    let mut searches = Vec::new();
    for entry in parsed {
        let Some(output) = entry.get("output").and_then(|v| v.as_str()) else {
            continue;
        };
        if let Some(path) = output.strip_prefix("v2:") {
            searches.push(path.to_string());
        }
    }
    Ok(searches)
}

pub struct SearchFeed {
    pub core: FeedCore,
    feed_url: String,
}

impl SearchFeed {
    /// Wrap a `lei:<path>` feed. The path must be one of lei's known
    /// v2 searches.
    pub async fn new(feed_key: impl Into<String>, lei_url: impl Into<String>) -> Result<Self> {
        let feed_url: String = lei_url.into();
        let path = feed_url
            .strip_prefix("lei:")
            .ok_or_else(|| {
                Error::Configuration(format!("not a lei feed URL: {}", feed_url))
            })?
            .to_string();

        let known = known_searches().await?;
        if !known.iter().any(|s| s == &path) {
            return Err(Error::Configuration(format!(
                "lei search '{}' is not known",
                path
            )));
        }

        Ok(Self {
            core: FeedCore::new(feed_key, PathBuf::from(path)),
            feed_url,
        })
    }

    /// Wrap a search directory that is already known to exist, e.g. a
    /// tracked-thread search this process created itself.
    pub fn for_existing_search(feed_key: impl Into<String>, search_dir: &Path) -> Self {
        Self {
            core: FeedCore::new(feed_key, search_dir),
            feed_url: format!("lei:{}", search_dir.display()),
        }
    }

    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }

    /// Ask lei to refresh the search, then detect changes from the
    /// repositories on disk.
    pub async fn update_feed(&mut self) -> Result<u8> {
        log::debug!("updating lei search: {}", self.core.feed_dir.display());
        let ua = format!("--user-agent={}", crate::user_agent());
        let dir = self.core.feed_dir.to_string_lossy().to_string();
        let (status, stdout) = run_lei_command(&["up", ua.as_str(), dir.as_str()]).await?;
        if status != 0 {
            return Err(Error::PublicInbox(format!(
                "lei up failed for {}: {}",
                dir,
                String::from_utf8_lossy(&stdout).trim()
            )));
        }

        let highest = self.core.get_highest_epoch()?;
        let tip = self.core.top_commit(highest)?.unwrap_or_default();

        let Ok(state) = self.core.load_feed_state() else {
            log::debug!(
                "no existing feed state found, initializing feed: {}",
                self.core.feed_key
            );
            self.core.save_feed_state(highest, Some(tip), true)?;
            return Ok(STATUS_INITIALIZED);
        };

        let mut status = 0u8;
        if highest > state.highest_epoch {
            log::debug!(
                "new epoch detected for lei search {}: {}",
                self.core.feed_key,
                highest
            );
            status |= STATUS_UPDATED;
        }
        if tip != state.latest_commit {
            status |= STATUS_UPDATED;
        }
        if status == 0 {
            status = STATUS_NOCHANGE;
        }

        self.core.save_feed_state(highest, Some(tip), true)?;
        Ok(status)
    }
}

/// Create a lei search following a whole thread by message id:
/// `lei q mid:<msgid> --threads --only https://lore.kernel.org/all -o v2:<path>`.
pub async fn create_thread_search(msgid: &str, output_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let ua = format!("--user-agent={}", crate::user_agent());
    let query = format!("mid:{}", msgid);
    let out = format!("v2:{}", output_path.display());
    let args = [
        "q",
        ua.as_str(),
        query.as_str(),
        "--threads",
        "--only",
        "https://lore.kernel.org/all",
        "-o",
        out.as_str(),
    ];
    let (status, stdout) = run_lei_command(&args).await?;
    if status != 0 {
        return Err(Error::PublicInbox(format!(
            "lei q failed for {}: {}",
            msgid,
            String::from_utf8_lossy(&stdout).trim()
        )));
    }
    Ok(())
}

/// Remove a search from lei's tracking and delete its data.
pub async fn forget_search(search_path: &Path) -> Result<()> {
    let dir = search_path.to_string_lossy().to_string();
    let (status, stdout) = run_lei_command(&["forget-search", dir.as_str()]).await?;
    if status != 0 {
        return Err(Error::PublicInbox(format!(
            "lei forget-search failed for {}: {}",
            dir,
            String::from_utf8_lossy(&stdout).trim()
        )));
    }
    Ok(())
}
