//! Git plumbing for public-inbox epoch repositories.
//!
//! Local reads (commit walks, blob extraction, branch detection) go
//! through `gix` against the bare epoch repositories. Network
//! operations (the initial mirror clone and the per-cycle remote
//! update) shell out to `git(1)` so the wire traffic carries the
//! standard `GIT_HTTP_USER_AGENT` and git's own transport behavior.

use std::path::Path;
use std::process::Stdio;

use chrono::{DateTime, FixedOffset, Utc};
use gix::ObjectId;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::error::{Error, Result};

/// Date format used by git `%ci` and by the state files.
pub const COMMIT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

static GIT_VERSION: OnceCell<String> = OnceCell::const_new();

pub struct GitOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl GitOutput {
    pub fn ok(&self) -> bool {
        self.status == 0
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

async fn git_version() -> Result<String> {
    GIT_VERSION
        .get_or_try_init(|| async {
            let output = Command::new("git")
                .arg("version")
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| map_spawn_error(e, "git"))?;
            let text = String::from_utf8_lossy(&output.stdout);
            // "git version 2.43.0"
            Ok(text
                .split_whitespace()
                .nth(2)
                .unwrap_or("unknown")
                .to_string())
        })
        .await
        .map(|v| v.clone())
}

fn map_spawn_error(err: std::io::Error, cmd: &str) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::Git(format!("command '{}' not found. Is it installed?", cmd))
    } else {
        Error::Git(format!("failed to run '{}': {}", cmd, err))
    }
}

/// Run a git command, optionally chdir'ed into `topdir`.
pub async fn run_git_command(topdir: Option<&Path>, args: &[&str]) -> Result<GitOutput> {
    let mut cmd = Command::new("git");
    if let Some(dir) = topdir {
        cmd.arg("-C").arg(dir);
    }
    cmd.args(args);
    cmd.env(
        "GIT_HTTP_USER_AGENT",
        crate::git_http_user_agent(&git_version().await?),
    );
    cmd.stdin(Stdio::null());

    log::debug!("running git command: git {}", args.join(" "));

    let output = cmd.output().await.map_err(|e| map_spawn_error(e, "git"))?;
    Ok(GitOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Shallow-mirror an epoch repository into `tgt_dir`.
pub async fn clone_epoch(repo_url: &str, tgt_dir: &Path) -> Result<()> {
    if tgt_dir.exists() {
        return Err(Error::Git(format!(
            "destination directory {} already exists",
            tgt_dir.display()
        )));
    }
    if let Some(parent) = tgt_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tgt = tgt_dir.to_string_lossy().to_string();
    let output = run_git_command(
        None,
        &["clone", "--mirror", "--depth=1", repo_url, &tgt],
    )
    .await?;
    if !output.ok() {
        return Err(Error::Git(format!(
            "git clone of {} failed: {}",
            repo_url,
            output.stderr_text()
        )));
    }
    Ok(())
}

/// Pull the working epoch: `remote update origin --prune`.
pub async fn update_remote(gitdir: &Path) -> Result<()> {
    let output = run_git_command(Some(gitdir), &["remote", "update", "origin", "--prune"]).await?;
    if !output.ok() {
        return Err(Error::Git(format!(
            "git remote update failed in {}: {}",
            gitdir.display(),
            output.stderr_text()
        )));
    }
    Ok(())
}

pub fn open_repo(gitdir: &Path) -> Result<gix::Repository> {
    gix::open(gitdir)
        .map_err(|e| Error::Git(format!("failed to open {}: {}", gitdir.display(), e)))
}

/// Detect the default branch: symbolic HEAD, then the first local
/// branch, then `master`.
pub fn default_branch(repo: &gix::Repository) -> String {
    if let Ok(Some(head)) = repo.head_ref() {
        return head.name().shorten().to_string();
    }

    if let Ok(platform) = repo.references() {
        if let Ok(branches) = platform.local_branches() {
            for branch in branches.flatten() {
                return branch.name().shorten().to_string();
            }
        }
    }

    log::warn!(
        "could not detect default branch in {}, falling back to 'master'",
        repo.path().display()
    );
    "master".to_string()
}

fn branch_tip(repo: &gix::Repository, branch: &str) -> Option<ObjectId> {
    let reference = repo.find_reference(branch).ok()?;
    reference.target().try_id().map(|id| id.to_owned())
}

/// The tip commit of a branch, or `None` for an empty repository.
pub fn top_commit(repo: &gix::Repository, branch: &str) -> Option<String> {
    branch_tip(repo, branch).map(|id| id.to_hex().to_string())
}

/// Whether `hash` resolves to a commit object in this repository.
pub fn commit_exists(repo: &gix::Repository, hash: &str) -> bool {
    let Ok(oid) = ObjectId::from_hex(hash.as_bytes()) else {
        return false;
    };
    repo.find_object(oid)
        .ok()
        .and_then(|obj| obj.try_into_commit().ok())
        .is_some()
}

pub struct RevList {
    /// New commits, oldest first.
    pub commits: Vec<String>,
    /// Whether the `since` cursor was found on the ancestry path. A
    /// missing cursor means the branch history was rewritten.
    pub cursor_found: bool,
}

/// Commits on the ancestry path from `since` (exclusive) to the branch
/// tip, oldest first. With `since = None`, every commit of the branch.
pub fn commits_since(
    repo: &gix::Repository,
    branch: &str,
    since: Option<&str>,
) -> Result<RevList> {
    let Some(tip) = branch_tip(repo, branch) else {
        // Empty repository: nothing to enumerate.
        return Ok(RevList {
            commits: Vec::new(),
            cursor_found: since.is_none(),
        });
    };

    if let Some(since) = since {
        if tip.to_hex().to_string() == since {
            return Ok(RevList {
                commits: Vec::new(),
                cursor_found: true,
            });
        }
    }

    let walk = repo
        .rev_walk([tip])
        .all()
        .map_err(|e| Error::Git(format!("failed to start commit walk: {}", e)))?;

    let mut commits = Vec::new();
    let mut cursor_found = since.is_none();
    for info in walk {
        let info = info.map_err(|e| Error::Git(format!("commit walk failed: {}", e)))?;
        let hash = info.id.to_hex().to_string();
        if since == Some(hash.as_str()) {
            cursor_found = true;
            break;
        }
        commits.push(hash);
    }

    commits.reverse();
    Ok(RevList {
        commits,
        cursor_found,
    })
}

fn find_commit<'a>(repo: &'a gix::Repository, hash: &str) -> Result<gix::Commit<'a>> {
    let oid = ObjectId::from_hex(hash.as_bytes())
        .map_err(|e| Error::Git(format!("invalid commit hash {}: {}", hash, e)))?;
    repo.find_object(oid)
        .map_err(|e| Error::Git(format!("failed to find commit {}: {}", hash, e)))?
        .try_into_commit()
        .map_err(|e| Error::Git(format!("object {} is not a commit: {}", hash, e)))
}

/// The commit timestamp in the commit's own offset.
pub fn commit_datetime(repo: &gix::Repository, hash: &str) -> Result<DateTime<FixedOffset>> {
    let commit = find_commit(repo, hash)?;
    let time = commit
        .time()
        .map_err(|e| Error::Git(format!("failed to read commit time of {}: {}", hash, e)))?;
    let offset = FixedOffset::east_opt(time.offset)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"));
    let dt = DateTime::<Utc>::from_timestamp(time.seconds, 0)
        .ok_or_else(|| Error::Git(format!("commit {} has an invalid timestamp", hash)))?;
    Ok(dt.with_timezone(&offset))
}

/// The commit date formatted the way the state files store it.
pub fn commit_date(repo: &gix::Repository, hash: &str) -> Result<String> {
    Ok(commit_datetime(repo, hash)?
        .format(COMMIT_DATE_FORMAT)
        .to_string())
}

/// Commits on the branch with commit time at or after `date`, oldest
/// first. Used by rebase recovery to find cursor candidates.
pub fn commits_since_date(
    repo: &gix::Repository,
    branch: &str,
    date: &DateTime<FixedOffset>,
) -> Result<Vec<String>> {
    let all = commits_since(repo, branch, None)?;
    let cutoff = date.timestamp();

    let mut result = Vec::new();
    for hash in all.commits {
        let commit = find_commit(repo, &hash)?;
        let time = commit
            .time()
            .map_err(|e| Error::Git(format!("failed to read commit time of {}: {}", hash, e)))?;
        if time.seconds >= cutoff {
            result.push(hash);
        }
    }
    Ok(result)
}

/// The raw message blob (`m` file) in the commit's tree. A commit
/// without an `m` file (e.g. a deletion marker) is a state error,
/// distinct from git failures.
pub fn message_at_commit(repo: &gix::Repository, hash: &str) -> Result<Vec<u8>> {
    let commit = find_commit(repo, hash)?;
    let tree = commit
        .tree()
        .map_err(|e| Error::Git(format!("failed to get tree of {}: {}", hash, e)))?;

    for entry in tree.iter() {
        let entry = entry.map_err(|e| Error::Git(format!("failed to iterate tree: {}", e)))?;
        if entry.filename() == "m" && entry.mode().is_blob() {
            let blob = entry
                .object()
                .map_err(|e| Error::Git(format!("failed to read blob: {}", e)))?
                .try_into_blob()
                .map_err(|e| Error::Git(format!("object is not a blob: {}", e)))?;
            return Ok(blob.data.to_vec());
        }
    }

    Err(Error::State(format!(
        "commit {} does not have a message file",
        hash
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args([
                "-c",
                "user.email=test@example.com",
                "-c",
                "user.name=Test",
            ])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .expect("git runs");
        assert!(status.success(), "git {:?} failed", args);
    }

    fn make_inbox_repo(tmp: &TempDir, messages: &[&str]) -> PathBuf {
        let dir = tmp.path().join("repo");
        std::fs::create_dir_all(&dir).unwrap();
        let status = std::process::Command::new("git")
            .args(["init", "-b", "master"])
            .arg(&dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success());
        for (i, body) in messages.iter().enumerate() {
            std::fs::write(dir.join("m"), body).unwrap();
            git(&dir, &["add", "m"]);
            git(&dir, &["commit", "-m", &format!("message {}", i)]);
        }
        dir
    }

    #[test]
    fn test_top_commit_and_walk_order() {
        let tmp = TempDir::new().unwrap();
        let dir = make_inbox_repo(
            &tmp,
            &[
                "Message-ID: <1@x>\nSubject: one\n\nbody1\n",
                "Message-ID: <2@x>\nSubject: two\n\nbody2\n",
                "Message-ID: <3@x>\nSubject: three\n\nbody3\n",
            ],
        );
        let repo = open_repo(&dir).unwrap();
        let branch = default_branch(&repo);
        assert_eq!(branch, "master");

        let all = commits_since(&repo, &branch, None).unwrap();
        assert_eq!(all.commits.len(), 3);
        assert!(all.cursor_found);

        let tip = top_commit(&repo, &branch).unwrap();
        assert_eq!(all.commits.last().unwrap(), &tip);

        // Enumerate since the first commit: two newer commits remain.
        let since = &all.commits[0];
        let newer = commits_since(&repo, &branch, Some(since)).unwrap();
        assert!(newer.cursor_found);
        assert_eq!(newer.commits, all.commits[1..].to_vec());

        // Tip cursor: nothing new.
        let none = commits_since(&repo, &branch, Some(&tip)).unwrap();
        assert!(none.cursor_found);
        assert!(none.commits.is_empty());
    }

    #[test]
    fn test_unknown_cursor_reports_missing() {
        let tmp = TempDir::new().unwrap();
        let dir = make_inbox_repo(&tmp, &["Message-ID: <1@x>\n\nbody\n"]);
        let repo = open_repo(&dir).unwrap();
        let listed = commits_since(
            &repo,
            "master",
            Some("0000000000000000000000000000000000000000"),
        )
        .unwrap();
        assert!(!listed.cursor_found);
        assert_eq!(listed.commits.len(), 1);
    }

    #[test]
    fn test_message_at_commit() {
        let tmp = TempDir::new().unwrap();
        let dir = make_inbox_repo(&tmp, &["Message-ID: <1@x>\nSubject: hi\n\nbody\n"]);
        let repo = open_repo(&dir).unwrap();
        let tip = top_commit(&repo, "master").unwrap();

        let raw = message_at_commit(&repo, &tip).unwrap();
        assert!(raw.starts_with(b"Message-ID: <1@x>"));

        assert!(commit_exists(&repo, &tip));
        assert!(!commit_exists(
            &repo,
            "0000000000000000000000000000000000000000"
        ));
    }

    #[test]
    fn test_commit_without_message_file_is_state_error() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("repo");
        std::fs::create_dir_all(&dir).unwrap();
        let status = std::process::Command::new("git")
            .args(["init", "-b", "master"])
            .arg(&dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success());
        std::fs::write(dir.join("other"), "not a message").unwrap();
        git(&dir, &["add", "other"]);
        git(&dir, &["commit", "-m", "deletion marker"]);

        let repo = open_repo(&dir).unwrap();
        let tip = top_commit(&repo, "master").unwrap();
        let err = message_at_commit(&repo, &tip).unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[test]
    fn test_commit_date_round_trips() {
        let tmp = TempDir::new().unwrap();
        let dir = make_inbox_repo(&tmp, &["Message-ID: <1@x>\n\nbody\n"]);
        let repo = open_repo(&dir).unwrap();
        let tip = top_commit(&repo, "master").unwrap();

        let formatted = commit_date(&repo, &tip).unwrap();
        let parsed = DateTime::parse_from_str(&formatted, COMMIT_DATE_FORMAT).unwrap();
        let direct = commit_datetime(&repo, &tip).unwrap();
        assert_eq!(parsed.timestamp(), direct.timestamp());

        let candidates = commits_since_date(&repo, "master", &parsed).unwrap();
        assert_eq!(candidates, vec![tip]);
    }
}
