//! Shared fixtures: public-inbox-shaped git repositories built with
//! the real git binary.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub struct InboxFixture {
    /// Work tree used to author commits.
    pub work_dir: PathBuf,
    /// The feed directory holding `git/<n>.git` epochs.
    pub feed_dir: PathBuf,
    counter: u32,
}

fn run_git(dir: &Path, envs: &[(&str, &str)], args: &[&str]) {
    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(dir)
        .args(["-c", "user.email=test@example.com", "-c", "user.name=Test"])
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for (key, value) in envs {
        cmd.env(key, value);
    }
    let status = cmd.status().expect("git is available");
    assert!(status.success(), "git {:?} failed in {:?}", args, dir);
}

impl InboxFixture {
    /// Create a feed directory with one epoch repository (epoch 0).
    pub fn new(base: &Path) -> Self {
        let work_dir = base.join("work-0");
        let feed_dir = base.join("feed");
        std::fs::create_dir_all(&work_dir).unwrap();
        std::fs::create_dir_all(feed_dir.join("git")).unwrap();

        let status = Command::new("git")
            .args(["init", "-b", "master"])
            .arg(&work_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success());

        let mut fixture = Self {
            work_dir,
            feed_dir,
            counter: 0,
        };
        fixture.clone_epoch(0);
        fixture
    }

    fn work_dir_for(&self, epoch: u64) -> PathBuf {
        if epoch == 0 {
            self.work_dir.clone()
        } else {
            self.work_dir
                .parent()
                .unwrap()
                .join(format!("work-{}", epoch))
        }
    }

    fn clone_epoch(&self, epoch: u64) {
        let bare = self.feed_dir.join("git").join(format!("{}.git", epoch));
        let status = Command::new("git")
            .args(["clone", "--bare", "--quiet"])
            .arg(self.work_dir_for(epoch))
            .arg(&bare)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success());
    }

    /// Author a message commit in the given epoch's work tree and sync
    /// the epoch repository. Returns the new commit hash.
    pub fn add_message(&mut self, epoch: u64, msgid: &str, subject: &str) -> String {
        self.counter += 1;
        let work = self.work_dir_for(epoch);
        let body = format!(
            "From: sender@example.com\nMessage-ID: {}\nSubject: {}\n\nbody {}\n",
            msgid, subject, self.counter
        );
        std::fs::write(work.join("m"), body).unwrap();

        // Deterministic, strictly increasing commit timestamps.
        let date = format!("2026-01-01T00:{:02}:{:02}+00:00", self.counter / 60, self.counter % 60);
        let envs = [
            ("GIT_AUTHOR_DATE", date.as_str()),
            ("GIT_COMMITTER_DATE", date.as_str()),
        ];
        run_git(&work, &envs, &["add", "m"]);
        run_git(&work, &envs, &["commit", "-m", subject]);
        self.sync_epoch(epoch);
        self.tip(epoch)
    }

    /// Author a message from a specific sender.
    pub fn add_message_from(
        &mut self,
        epoch: u64,
        msgid: &str,
        subject: &str,
        from: &str,
    ) -> String {
        self.counter += 1;
        let work = self.work_dir_for(epoch);
        let body = format!(
            "From: {}\nMessage-ID: {}\nSubject: {}\n\nbody {}\n",
            from, msgid, subject, self.counter
        );
        std::fs::write(work.join("m"), body).unwrap();
        let date = format!("2026-01-01T00:{:02}:{:02}+00:00", self.counter / 60, self.counter % 60);
        let envs = [
            ("GIT_AUTHOR_DATE", date.as_str()),
            ("GIT_COMMITTER_DATE", date.as_str()),
        ];
        run_git(&work, &envs, &["add", "m"]);
        run_git(&work, &envs, &["commit", "-m", subject]);
        self.sync_epoch(epoch);
        self.tip(epoch)
    }

    /// Start a new epoch repository with its own work tree.
    pub fn start_epoch(&mut self, epoch: u64) {
        let work = self.work_dir_for(epoch);
        std::fs::create_dir_all(&work).unwrap();
        let status = Command::new("git")
            .args(["init", "-b", "master"])
            .arg(&work)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success());
        self.clone_epoch(epoch);
    }

    /// Rewind the epoch's work tree to `commit`, dropping everything
    /// after it, then sync. Re-adding messages afterwards simulates an
    /// upstream rebase.
    pub fn rewind_to(&mut self, epoch: u64, commit: &str) {
        let work = self.work_dir_for(epoch);
        run_git(&work, &[], &["reset", "--hard", commit]);
        self.sync_epoch(epoch);
    }

    fn sync_epoch(&self, epoch: u64) {
        let bare = self.feed_dir.join("git").join(format!("{}.git", epoch));
        run_git(&bare, &[], &["fetch", "--quiet", "origin", "+master:master"]);
    }

    pub fn tip(&self, epoch: u64) -> String {
        let output = Command::new("git")
            .arg("-C")
            .arg(self.work_dir_for(epoch))
            .args(["rev-parse", "master"])
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }
}
