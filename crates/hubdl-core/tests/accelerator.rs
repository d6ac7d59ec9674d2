mod support;

use hubdl_core::QueueRequest;
use hubdl_types::{DuplicateAction, RepoRef, TaskStatus};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use support::*;

#[tokio::test]
async fn test_pause_and_resume_keep_the_job_group() {
    let dir = tempfile::tempdir().unwrap();
    let rpc = FakeRpc::new("active");
    let files = vec![lfs_file("a.bin", b"aaaa"), lfs_file("b/c.bin", b"cc")];
    let core = core_with(dir.path(), accelerator_settings(50), files, rpc.clone()).await;

    let id = core
        .queue_download(QueueRequest::new(RepoRef::model("org/model")))
        .await
        .unwrap();
    assert!(core.start_download(&id).await.unwrap());
    let gids = core.accelerator_jobs(&id).unwrap();
    assert_eq!(gids.len(), 2);

    let task = wait_for(&core, &id, |t| t.current_file.is_some()).await;
    assert_eq!(task.total_files, 2);
    assert_eq!(task.total_bytes, 6);

    assert!(core.pause_download(&id).await.unwrap());
    assert_eq!(core.get_task(&id).unwrap().status, TaskStatus::Paused);
    for gid in &gids {
        assert_eq!(rpc.status_of(gid).as_deref(), Some("paused"));
    }

    assert!(core.resume_download(&id).await.unwrap());
    assert_eq!(core.accelerator_jobs(&id).unwrap(), gids);
    assert_eq!(rpc.add_calls.load(Ordering::SeqCst), 1, "no new jobs on resume");
    for gid in &gids {
        assert_eq!(rpc.status_of(gid).as_deref(), Some("active"));
    }
    assert_eq!(core.get_task(&id).unwrap().status, TaskStatus::Downloading);
}

#[tokio::test]
async fn test_cancel_removes_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let rpc = FakeRpc::new("active");
    let core = core_with(
        dir.path(),
        accelerator_settings(50),
        vec![lfs_file("a.bin", b"a")],
        rpc.clone(),
    )
    .await;

    let id = core
        .queue_download(QueueRequest::new(RepoRef::model("org/model")))
        .await
        .unwrap();
    core.start_download(&id).await.unwrap();
    let gids = core.accelerator_jobs(&id).unwrap();

    assert!(core.cancel_download(&id).await.unwrap());
    assert_eq!(core.get_task(&id).unwrap().status, TaskStatus::Cancelled);
    assert!(core.accelerator_jobs(&id).is_none());

    // Removal is fire-and-forget
    for _ in 0..100 {
        if rpc.status_of(&gids[0]).as_deref() == Some("removed") {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("jobs were never removed");
}

#[tokio::test]
async fn test_completed_jobs_are_verified() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("d");
    let target = base.join("models--org--model");
    std::fs::create_dir_all(&target).unwrap();
    std::fs::write(target.join("weights.bin"), b"hello").unwrap();

    let core = core_with(
        dir.path(),
        accelerator_settings(50),
        vec![lfs_file("weights.bin", b"hello")],
        FakeRpc::new("complete"),
    )
    .await;

    let mut request = QueueRequest::new(RepoRef::model("org/model"));
    request.target_dir = Some(base);
    request.on_duplicate = DuplicateAction::Overwrite;
    let id = core.queue_download(request).await.unwrap();
    core.start_download(&id).await.unwrap();

    let task = wait_for(&core, &id, |t| t.status.is_finished()).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result_path, Some(target));
    assert_eq!(task.progress, 100.0);
    assert!(core.accelerator_jobs(&id).is_none());

    let result = core.verify_task(&id).await.unwrap();
    assert!(result.is_valid);
    assert_eq!(result.valid_files, vec!["weights.bin".to_string()]);
}

#[tokio::test]
async fn test_corrupted_download_fails_with_counts() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("d");
    let target = base.join("models--org--model");
    std::fs::create_dir_all(&target).unwrap();
    std::fs::write(target.join("weights.bin"), b"hellO").unwrap();

    let files = vec![lfs_file("weights.bin", b"hello"), lfs_file("extra.bin", b"x")];
    let core = core_with(dir.path(), accelerator_settings(50), files, FakeRpc::new("complete")).await;

    let mut request = QueueRequest::new(RepoRef::model("org/model"));
    request.target_dir = Some(base);
    request.on_duplicate = DuplicateAction::Overwrite;
    let id = core.queue_download(request).await.unwrap();
    core.start_download(&id).await.unwrap();

    let task = wait_for(&core, &id, |t| t.status.is_finished()).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(
        task.error_message.as_deref(),
        Some("Verification failed: 1 files corrupted, 1 files missing")
    );

    // A failed task can be restarted in place
    assert!(core.start_download(&id).await.unwrap());
}

#[tokio::test]
async fn test_job_errors_are_aggregated() {
    let dir = tempfile::tempdir().unwrap();
    let core = core_with(
        dir.path(),
        accelerator_settings(50),
        vec![lfs_file("a.bin", b"a"), lfs_file("b.bin", b"b")],
        FakeRpc::failing("3", "Resource not found"),
    )
    .await;

    let id = core
        .queue_download(QueueRequest::new(RepoRef::model("org/model")))
        .await
        .unwrap();
    core.start_download(&id).await.unwrap();

    let task = wait_for(&core, &id, |t| t.status.is_finished()).await;
    assert_eq!(task.status, TaskStatus::Failed);
    let message = task.error_message.unwrap();
    assert!(message.starts_with("Accelerator error: GID "));
    assert_eq!(message.matches("Code 3 - Resource not found").count(), 2);
    assert!(core.accelerator_jobs(&id).is_none());
}

#[tokio::test]
async fn test_cancel_during_listing_submits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let rpc = FakeRpc::new("active");
    let listing = Arc::new(SlowListing {
        delay: Duration::from_millis(300),
        files: vec![lfs_file("a.bin", b"a")],
    });
    let core = core_with_metadata(dir.path(), accelerator_settings(50), listing, rpc.clone()).await;

    let id = core
        .queue_download(QueueRequest::new(RepoRef::model("org/model")))
        .await
        .unwrap();
    let (started, cancelled) = tokio::join!(core.start_download(&id), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        core.cancel_download(&id).await
    });
    assert!(!started.unwrap());
    assert!(cancelled.unwrap());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(core.get_task(&id).unwrap().status, TaskStatus::Cancelled);
    assert!(core.accelerator_jobs(&id).is_none());
    assert_eq!(rpc.add_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_during_submission_removes_the_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let rpc = FakeRpc::slow("active", Duration::from_millis(300));
    let files = vec![lfs_file("a.bin", b"a"), lfs_file("b.bin", b"b")];
    let core = core_with(dir.path(), accelerator_settings(50), files, rpc.clone()).await;

    let id = core
        .queue_download(QueueRequest::new(RepoRef::model("org/model")))
        .await
        .unwrap();
    let (started, cancelled) = tokio::join!(core.start_download(&id), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        core.cancel_download(&id).await
    });
    assert!(!started.unwrap());
    assert!(cancelled.unwrap());

    // Nothing polls the jobs, so the task stays where cancel left it
    tokio::time::sleep(Duration::from_millis(200)).await;
    let task = core.get_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.accelerator_jobs.is_empty());
    assert!(core.accelerator_jobs(&id).is_none());
    assert_eq!(rpc.job_statuses(), vec!["removed".to_string(); 2]);
}

#[tokio::test]
async fn test_pause_during_submission_keeps_paused_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let rpc = FakeRpc::slow("active", Duration::from_millis(300));
    let core = core_with(
        dir.path(),
        accelerator_settings(50),
        vec![lfs_file("a.bin", b"a")],
        rpc.clone(),
    )
    .await;

    let id = core
        .queue_download(QueueRequest::new(RepoRef::model("org/model")))
        .await
        .unwrap();
    let (started, paused) = tokio::join!(core.start_download(&id), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        core.pause_download(&id).await
    });
    assert!(!started.unwrap());
    assert!(paused.unwrap());

    let gids = core.accelerator_jobs(&id).expect("paused group is kept");
    assert_eq!(rpc.job_statuses(), vec!["paused".to_string()]);
    let task = core.get_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.accelerator_jobs, gids);

    assert!(core.resume_download(&id).await.unwrap());
    assert_eq!(rpc.add_calls.load(Ordering::SeqCst), 1, "no new jobs on resume");
    assert_eq!(rpc.status_of(&gids[0]).as_deref(), Some("active"));
    assert_eq!(core.get_task(&id).unwrap().status, TaskStatus::Downloading);
}

#[tokio::test]
async fn test_paused_job_group_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let rpc = FakeRpc::new("active");
    let files = vec![lfs_file("a.bin", b"aaaa"), lfs_file("b.bin", b"bb")];

    let (id, gids) = {
        let core = core_with(dir.path(), accelerator_settings(50), files.clone(), rpc.clone()).await;
        let id = core
            .queue_download(QueueRequest::new(RepoRef::model("org/model")))
            .await
            .unwrap();
        assert!(core.start_download(&id).await.unwrap());
        let gids = core.accelerator_jobs(&id).unwrap();
        assert!(core.pause_download(&id).await.unwrap());
        core.shutdown().await;
        (id, gids)
    };

    // Same daemon, new process
    let core = core_with(dir.path(), accelerator_settings(50), files, rpc.clone()).await;
    let task = core.get_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.accelerator_jobs, gids);
    assert_eq!(core.accelerator_jobs(&id), Some(gids.clone()));

    assert!(core.resume_download(&id).await.unwrap());
    assert_eq!(rpc.add_calls.load(Ordering::SeqCst), 1, "the old jobs were resumed");
    for gid in &gids {
        assert_eq!(rpc.status_of(gid).as_deref(), Some("active"));
    }
}
