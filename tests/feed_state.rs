//! Feed engine integration tests over real git repositories.

mod common;

use common::InboxFixture;
use fs4::FileExt;
use korgalore::feed::{FeedCore, RETRY_FAILED_INTERVAL};
use korgalore::message::RawMessage;
use tempfile::TempDir;

fn core_for(fixture: &InboxFixture) -> FeedCore {
    FeedCore::new("test-feed", &fixture.feed_dir)
}

fn deliver_all(core: &FeedCore, delivery: &str) -> Vec<(u64, String)> {
    let commits = core.get_latest_commits_for_delivery(delivery).unwrap();
    for (epoch, commit) in &commits {
        let raw = core.get_message_at_commit(*epoch, commit).unwrap();
        let msg = RawMessage::new(raw);
        core.mark_successful_delivery(delivery, *epoch, commit, &msg, false)
            .unwrap();
    }
    commits
}

#[test]
fn test_from_start_delivers_whole_epoch_in_order() {
    let tmp = TempDir::new().unwrap();
    let mut fixture = InboxFixture::new(tmp.path());
    let c1 = fixture.add_message(0, "<1@x>", "first");
    let c2 = fixture.add_message(0, "<2@x>", "second");
    let c3 = fixture.add_message(0, "<3@x>", "third");

    let core = core_for(&fixture);
    core.init_delivery_state("inbox", true).unwrap();

    let commits = core.get_latest_commits_for_delivery("inbox").unwrap();
    assert_eq!(
        commits,
        vec![(0, c1.clone()), (0, c2.clone()), (0, c3.clone())]
    );
}

#[test]
fn test_cursor_advances_and_enumeration_drains() {
    let tmp = TempDir::new().unwrap();
    let mut fixture = InboxFixture::new(tmp.path());
    fixture.add_message(0, "<1@x>", "first");
    let tip = fixture.add_message(0, "<2@x>", "second");

    let core = core_for(&fixture);
    core.init_delivery_state("inbox", true).unwrap();
    let delivered = deliver_all(&core, "inbox");
    assert_eq!(delivered.len(), 2);

    // Cursor is at the tip with the anchor metadata recorded.
    let info = core.load_delivery_info("inbox").unwrap().unwrap();
    let cursor = &info["0"];
    assert_eq!(cursor.last, tip);
    assert_eq!(cursor.subject, "second");
    assert_eq!(cursor.msgid, "<2@x>");
    assert!(!cursor.commit_date.is_empty());

    // Nothing left to enumerate.
    assert!(core
        .get_latest_commits_for_delivery("inbox")
        .unwrap()
        .is_empty());

    // A new commit shows up alone.
    let c3 = fixture.add_message(0, "<3@x>", "third");
    assert_eq!(
        core.get_latest_commits_for_delivery("inbox").unwrap(),
        vec![(0, c3)]
    );
}

#[test]
fn test_new_delivery_on_primed_feed_initializes_at_tip() {
    let tmp = TempDir::new().unwrap();
    let mut fixture = InboxFixture::new(tmp.path());
    fixture.add_message(0, "<1@x>", "old message");
    let tip = fixture.add_message(0, "<2@x>", "newest");

    let core = core_for(&fixture);
    // No delivery state yet: the first enumeration creates it at the
    // tip and reports nothing to deliver (no history replay).
    let commits = core.get_latest_commits_for_delivery("fresh").unwrap();
    assert!(commits.is_empty());

    let info = core.load_delivery_info("fresh").unwrap().unwrap();
    assert_eq!(info["0"].last, tip);

    // The next new commit is picked up normally.
    let c3 = fixture.add_message(0, "<3@x>", "after subscribe");
    assert_eq!(
        core.get_latest_commits_for_delivery("fresh").unwrap(),
        vec![(0, c3)]
    );
}

#[test]
fn test_epoch_rollover_spans_both_epochs_in_order() {
    let tmp = TempDir::new().unwrap();
    let mut fixture = InboxFixture::new(tmp.path());
    fixture.add_message(0, "<1@x>", "first");
    let core = core_for(&fixture);
    core.init_delivery_state("inbox", true).unwrap();
    deliver_all(&core, "inbox");

    // Tail commit in the old epoch, then a rollover with two commits.
    let tail = fixture.add_message(0, "<2@x>", "old epoch tail");
    fixture.start_epoch(1);
    let n1 = fixture.add_message(1, "<3@x>", "new epoch one");
    let n2 = fixture.add_message(1, "<4@x>", "new epoch two");

    let commits = core.get_latest_commits_for_delivery("inbox").unwrap();
    assert_eq!(
        commits,
        vec![(0, tail), (1, n1), (1, n2.clone())]
    );

    // After delivering, the info file has entries for both epochs.
    deliver_all(&core, "inbox");
    let info = core.load_delivery_info("inbox").unwrap().unwrap();
    assert!(info.contains_key("0"));
    assert_eq!(info["1"].last, n2);

    // The working epoch is now 1; nothing further to enumerate.
    assert!(core
        .get_latest_commits_for_delivery("inbox")
        .unwrap()
        .is_empty());
}

#[test]
fn test_rebase_recovery_resumes_without_duplicates() {
    let tmp = TempDir::new().unwrap();
    let mut fixture = InboxFixture::new(tmp.path());
    let a = fixture.add_message(0, "<a@x>", "message a");
    let b = fixture.add_message(0, "<b@x>", "message b");

    let core = core_for(&fixture);
    core.init_delivery_state("inbox", true).unwrap();
    deliver_all(&core, "inbox");

    // Upstream rewrites history: b is replaced by a commit with the
    // same subject and message-id but a new hash, and a new message
    // lands on top.
    fixture.rewind_to(0, &a);
    let b_new = fixture.add_message(0, "<b@x>", "message b");
    let c = fixture.add_message(0, "<c@x>", "message c");
    assert_ne!(b, b_new);

    let commits = core.get_latest_commits_for_delivery("inbox").unwrap();
    // Only the genuinely new commit is replayed.
    assert_eq!(commits, vec![(0, c)]);

    // The cursor was reanchored onto the replacement commit.
    let info = core.load_delivery_info("inbox").unwrap().unwrap();
    assert_eq!(info["0"].msgid, "<b@x>");
}

#[test]
fn test_failed_then_successful_retry_clears_ledger() {
    let tmp = TempDir::new().unwrap();
    let mut fixture = InboxFixture::new(tmp.path());
    fixture.add_message(0, "<1@x>", "first");
    let core = core_for(&fixture);
    core.init_delivery_state("inbox", true).unwrap();

    let commits = core.get_latest_commits_for_delivery("inbox").unwrap();
    let (epoch, commit) = commits[0].clone();

    core.mark_failed_delivery("inbox", epoch, &commit).unwrap();
    assert_eq!(
        core.get_failed_commits_for_delivery("inbox").unwrap(),
        vec![(epoch, commit.clone())]
    );

    // Within the retry window the entry stays and the count grows.
    core.mark_failed_delivery("inbox", epoch, &commit).unwrap();
    let failed_file = core.state_file(Some("inbox"), "failed");
    assert!(failed_file.exists());

    // A successful retry removes the entry and deletes the file.
    let raw = core.get_message_at_commit(epoch, &commit).unwrap();
    core.mark_successful_delivery("inbox", epoch, &commit, &RawMessage::new(raw), true)
        .unwrap();
    assert!(core
        .get_failed_commits_for_delivery("inbox")
        .unwrap()
        .is_empty());
    assert!(!failed_file.exists());

    let info = core.load_delivery_info("inbox").unwrap().unwrap();
    assert_eq!(info["0"].last, commit);
}

#[test]
fn test_retry_window_sanity() {
    // Five days, matching the documented rejection policy.
    assert_eq!(RETRY_FAILED_INTERVAL, 5 * 24 * 3600);
}

#[test]
fn test_feed_lock_is_exclusive_across_handles() {
    let tmp = TempDir::new().unwrap();
    let fixture = InboxFixture::new(tmp.path());
    let core = core_for(&fixture);
    core.feed_lock().unwrap();

    // A second process cannot take the lock while we hold it.
    let lock_path = fixture.feed_dir.join("korgalore.lock");
    let contender = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .unwrap();
    assert!(contender.try_lock_exclusive().is_err());

    core.feed_unlock().unwrap();
    assert!(contender.try_lock_exclusive().is_ok());
    contender.unlock().unwrap();
}
