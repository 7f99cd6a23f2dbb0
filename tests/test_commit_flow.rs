// End-to-end coverage of the commit state machine: guard rejections, the
// durable job path, replay safety and enqueue-failure rollback.

mod common;

use common::{harness, wait_for_job_settled, ScriptedCommitter};
use denbox::session::{CommitStatus, SessionError, StoreError};
use tempfile::tempdir;

#[tokio::test]
async fn commit_happy_path_completes_both_records() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), ScriptedCommitter::default());

    let job_id = h.service.commit_session("p1", "s1").await.unwrap();
    assert!(!job_id.is_empty());
    wait_for_job_settled(&h.jobs).await;

    let session = h.store.get_session("s1").unwrap();
    assert_eq!(session.commit_status, CommitStatus::Completed);
    assert_eq!(session.base_commit.as_deref(), Some("base000"));
    assert_eq!(session.applied_commit.as_deref(), Some("applied111"));
    assert!(session.commit_error.is_none());

    let workspace = h.store.get_workspace("w1").unwrap();
    assert_eq!(workspace.commit_status, CommitStatus::Completed);
    assert!(workspace.commit_error.is_none());
}

#[tokio::test]
async fn workspace_in_progress_guard_message() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), ScriptedCommitter::default());
    h.store
        .mutate_workspace::<_, (), StoreError>("w1", |w| {
            w.commit_status = CommitStatus::Committing;
            Ok(())
        })
        .unwrap();

    let err = h.service.commit_session("p1", "s1").await.unwrap_err();
    assert!(err.to_string().contains("already in progress for workspace"));
    assert!(err.to_string().contains("committing"));

    // rejection leaves the session side untouched
    let session = h.store.get_session("s1").unwrap();
    assert_eq!(session.commit_status, CommitStatus::None);
    assert!(session.base_commit.is_none());
}

#[tokio::test]
async fn session_in_progress_guard_message() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), ScriptedCommitter::default());
    h.store
        .mutate_session::<_, (), StoreError>("s1", |s| {
            s.commit_status = CommitStatus::Pending;
            Ok(())
        })
        .unwrap();

    let err = h.service.commit_session("p1", "s1").await.unwrap_err();
    assert!(err.to_string().contains("already in progress for session"));
}

#[tokio::test]
async fn already_committed_guard_message() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), ScriptedCommitter::default());
    h.store
        .mutate_session::<_, (), StoreError>("s1", |s| {
            s.commit_status = CommitStatus::Completed;
            Ok(())
        })
        .unwrap();

    let err = h.service.commit_session("p1", "s1").await.unwrap_err();
    assert!(err.to_string().contains("already committed"));
}

#[tokio::test]
async fn failed_commit_permits_a_new_cycle() {
    let dir = tempdir().unwrap();
    let h = harness(
        dir.path(),
        ScriptedCommitter {
            commit_result: Err("index locked".to_string()),
            ..Default::default()
        },
    );

    h.service.commit_session("p1", "s1").await.unwrap();
    wait_for_job_settled(&h.jobs).await;
    assert_eq!(
        h.store.get_session("s1").unwrap().commit_status,
        CommitStatus::Failed
    );

    // a failed cycle does not block the next request
    h.service.commit_session("p1", "s1").await.unwrap();
}

#[tokio::test]
async fn perform_commit_without_base_fails_both_records() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), ScriptedCommitter::default());

    // state as if a commit was requested but the base capture never landed
    h.store
        .mutate_workspace::<_, (), StoreError>("w1", |w| {
            w.commit_status = CommitStatus::Pending;
            Ok(())
        })
        .unwrap();
    h.store
        .mutate_session::<_, (), StoreError>("s1", |s| {
            s.commit_status = CommitStatus::Pending;
            s.base_commit = None;
            Ok(())
        })
        .unwrap();

    h.service.perform_commit("p1", "s1").await.unwrap();

    let session = h.store.get_session("s1").unwrap();
    let workspace = h.store.get_workspace("w1").unwrap();
    assert_eq!(session.commit_status, CommitStatus::Failed);
    assert_eq!(workspace.commit_status, CommitStatus::Failed);
    assert_eq!(session.commit_error.as_deref(), Some("No base commit set"));
    assert_eq!(workspace.commit_error.as_deref(), Some("No base commit set"));
}

#[tokio::test]
async fn perform_commit_replay_is_a_no_op() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), ScriptedCommitter::default());

    h.service.commit_session("p1", "s1").await.unwrap();
    wait_for_job_settled(&h.jobs).await;
    let settled = h.store.get_session("s1").unwrap();
    assert_eq!(settled.commit_status, CommitStatus::Completed);

    // replay, as after a crash between handler completion and file removal
    h.service.perform_commit("p1", "s1").await.unwrap();

    let after = h.store.get_session("s1").unwrap();
    assert_eq!(after.commit_status, CommitStatus::Completed);
    assert_eq!(after.applied_commit, settled.applied_commit);
}

#[tokio::test]
async fn enqueue_failure_reverts_statuses_and_base() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), ScriptedCommitter::default());

    // stray payload file: the workspace lock is already held
    std::fs::write(dir.path().join("jobs/workspace-w1.json"), b"{}").unwrap();

    let err = h.service.commit_session("p1", "s1").await.unwrap_err();
    assert!(matches!(err, SessionError::Enqueue(_)));

    let session = h.store.get_session("s1").unwrap();
    let workspace = h.store.get_workspace("w1").unwrap();
    assert_eq!(session.commit_status, CommitStatus::None);
    assert_eq!(workspace.commit_status, CommitStatus::None);
    assert!(session.base_commit.is_none());
}

#[tokio::test]
async fn base_capture_failure_also_reverts() {
    let dir = tempdir().unwrap();
    let h = harness(
        dir.path(),
        ScriptedCommitter {
            base: None,
            ..Default::default()
        },
    );

    let err = h.service.commit_session("p1", "s1").await.unwrap_err();
    assert!(matches!(err, SessionError::Git(_)));

    let session = h.store.get_session("s1").unwrap();
    assert_eq!(session.commit_status, CommitStatus::None);
    assert_eq!(
        h.store.get_workspace("w1").unwrap().commit_status,
        CommitStatus::None
    );
    assert!(session.base_commit.is_none());
}
