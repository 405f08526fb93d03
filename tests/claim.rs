#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::{assert_err, assert_none, assert_ok};
use insta::assert_compact_json_snapshot;
use jobstash::{JobOptions, Queue, QueueConfig, QueueError, WorkerOptions};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::sleep;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use tempfile::TempDir;

    /// Open a queue backed by a fresh temporary database file.
    ///
    /// The `TempDir` must stay alive for the duration of the test.
    pub(super) async fn open_queue() -> anyhow::Result<(Queue, TempDir)> {
        let dir = tempfile::tempdir()?;
        let queue = Queue::open(QueueConfig {
            db_path: dir.path().join("queue.db"),
        })
        .await?;
        Ok((queue, dir))
    }

    /// Worker registrations are process-wide, so every test uses its own
    /// names.
    pub(super) fn unique_name(prefix: &str) -> String {
        format!("{prefix}-{}", uuid::Uuid::new_v4())
    }
}

#[tokio::test]
async fn priority_and_concurrency_drive_batch_selection() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;
    let worker_a = test_utils::unique_name("batch-a");
    let worker_b = test_utils::unique_name("batch-b");

    queue.add_worker(
        &worker_a,
        |_id, _payload| async { Ok(()) },
        WorkerOptions::new().concurrency(3),
    )?;
    queue.add_worker(
        &worker_b,
        |_id, _payload| async { Ok(()) },
        WorkerOptions::new().concurrency(2),
    )?;

    let inserts = [
        (&worker_a, json!({ "r": 1 }), 0),
        (&worker_b, json!({ "d": "1" }), 3),
        (&worker_a, json!({ "r": 2 }), 0),
        (&worker_b, json!({ "d": "2" }), 5),
        (&worker_b, json!({ "d": "3" }), 3),
        (&worker_a, json!({ "r": 3 }), 0),
        (&worker_a, json!({ "r": 4 }), 0),
    ];
    for (name, payload, priority) in inserts {
        let options = JobOptions {
            priority,
            ..JobOptions::default()
        };
        queue.create_job(name, payload, options, false).await?;
        // Space inserts so `created` breaks priority ties deterministically.
        sleep(Duration::from_millis(25)).await;
    }

    // Pivot is the priority-5 job; its worker allows two concurrent jobs,
    // and the second slot goes to the earlier of the priority-3 pair.
    let batch = queue.get_concurrent_jobs(-1, 0).await?;
    let payloads: Vec<Value> = batch
        .iter()
        .map(|job| job.json_payload().unwrap())
        .collect();
    assert_compact_json_snapshot!(payloads, @r#"[{"d": "2"}, {"d": "1"}]"#);

    // Exactly the claimed rows carry the active flag.
    assert!(batch.iter().all(|job| job.active));
    let claimed: Vec<&str> = batch.iter().map(|job| job.id.as_str()).collect();
    for row in queue.get_jobs(true).await? {
        assert_eq!(row.active, claimed.contains(&row.id.as_str()));
    }

    Ok(())
}

#[tokio::test]
async fn claimed_jobs_are_not_reselected() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;
    let worker = test_utils::unique_name("reselect");
    queue.add_worker(
        &worker,
        |_id, _payload| async { Ok(()) },
        WorkerOptions::new(),
    )?;

    queue
        .create_job(&worker, json!({ "n": 1 }), JobOptions::default(), false)
        .await?;
    sleep(Duration::from_millis(5)).await;
    queue
        .create_job(&worker, json!({ "n": 2 }), JobOptions::default(), false)
        .await?;

    let first = queue.get_concurrent_jobs(-1, 0).await?;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].json_payload()?, json!({ "n": 1 }));

    let second = queue.get_concurrent_jobs(-1, 0).await?;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].json_payload()?, json!({ "n": 2 }));

    assert!(queue.get_concurrent_jobs(-1, 0).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn zero_jobs_limit_claims_nothing() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;
    let worker = test_utils::unique_name("zero-limit");

    queue
        .create_job(&worker, json!({}), JobOptions::default(), false)
        .await?;

    assert!(queue.get_concurrent_jobs(0, 0).await?.is_empty());
    let rows = queue.get_jobs(true).await?;
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].active);

    Ok(())
}

#[tokio::test]
async fn lifespan_claims_exclude_unfitting_timeouts() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;
    let worker = test_utils::unique_name("lifespan-fit");
    queue.add_worker(
        &worker,
        |_id, _payload| async { Ok(()) },
        WorkerOptions::new().concurrency(3),
    )?;

    for timeout in [0, 600, 400] {
        let options = JobOptions {
            timeout,
            ..JobOptions::default()
        };
        queue
            .create_job(&worker, json!({ "timeout": timeout }), options, false)
            .await?;
        sleep(Duration::from_millis(5)).await;
    }

    // With 1000 ms remaining, only a timeout below 501 ms fits; a job
    // without a timeout never fits a lifespan-bounded run.
    let batch = queue.get_concurrent_jobs(-1, 1_000).await?;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].timeout, 400);

    // An expired lifespan claims nothing.
    assert!(queue.get_concurrent_jobs(-1, -1).await?.is_empty());

    // A window smaller than the shutdown buffer claims nothing either.
    assert!(queue.get_concurrent_jobs(-1, 400).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn explicit_zero_timeout_is_preserved() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;
    let worker = test_utils::unique_name("zero-timeout");

    let options = JobOptions {
        timeout: 0,
        ..JobOptions::default()
    };
    let id = queue.create_job(&worker, json!({}), options, false).await?;

    let rows = queue.get_jobs(true).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
    assert_eq!(rows[0].timeout, 0);

    Ok(())
}

#[tokio::test]
async fn default_options_populate_the_row() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;
    let worker = test_utils::unique_name("defaults");

    queue
        .create_job(&worker, json!({ "k": "v" }), JobOptions::default(), false)
        .await?;

    let rows = queue.get_jobs(true).await?;
    assert_eq!(rows.len(), 1);
    let job = &rows[0];
    assert_eq!(job.priority, 0);
    assert_eq!(job.timeout, 25_000);
    assert_eq!(job.retry_delay, 0);
    assert_eq!(job.next_valid_time, job.created);
    assert!(!job.active);
    assert_none!(job.failed);
    let data = job.job_data()?;
    assert_eq!(data.attempts, 1);
    assert_none!(data.failed_attempts);
    assert_none!(data.errors);

    Ok(())
}

#[tokio::test]
async fn create_job_validates_options() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;
    let worker = test_utils::unique_name("validation");

    let error = assert_err!(
        queue
            .create_job("", json!({}), JobOptions::default(), false)
            .await
    );
    assert!(matches!(error, QueueError::InvalidArgument(_)));

    for options in [
        JobOptions {
            timeout: -1,
            ..JobOptions::default()
        },
        JobOptions {
            attempts: -1,
            ..JobOptions::default()
        },
        JobOptions {
            retry_delay: -1,
            ..JobOptions::default()
        },
    ] {
        let error = assert_err!(queue.create_job(&worker, json!({}), options, false).await);
        assert!(matches!(error, QueueError::InvalidArgument(_)));
    }

    assert!(queue.get_jobs(true).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn add_worker_validates_registration() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;

    let error = assert_err!(queue.add_worker(
        "",
        |_id, _payload| async { Ok(()) },
        WorkerOptions::new()
    ));
    assert!(matches!(error, QueueError::InvalidArgument(_)));

    let error = assert_err!(queue.add_worker(
        &test_utils::unique_name("no-slots"),
        |_id, _payload| async { Ok(()) },
        WorkerOptions::new().concurrency(0)
    ));
    assert!(matches!(error, QueueError::InvalidArgument(_)));

    Ok(())
}

#[tokio::test]
async fn flush_queue_removes_everything() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;

    for n in 0..3 {
        let worker = test_utils::unique_name("flush-all");
        queue
            .create_job(&worker, json!({ "n": n }), JobOptions::default(), false)
            .await?;
    }
    assert_eq!(queue.get_jobs(true).await?.len(), 3);

    queue.flush_queue(None).await?;
    assert!(queue.get_jobs(true).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn flush_queue_by_name_only_removes_matching_jobs() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;
    let keep = test_utils::unique_name("flush-keep");
    let discard = test_utils::unique_name("flush-drop");

    queue
        .create_job(&keep, json!({}), JobOptions::default(), false)
        .await?;
    queue
        .create_job(&discard, json!({}), JobOptions::default(), false)
        .await?;

    queue.flush_queue(Some(&discard)).await?;
    let rows = queue.get_jobs(true).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, keep);

    // Flushing a name with no rows is a no-op.
    queue
        .flush_queue(Some(&test_utils::unique_name("flush-unknown")))
        .await?;
    assert_eq!(queue.get_jobs(true).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn flush_job_removes_a_single_row() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;
    let worker = test_utils::unique_name("flush-one");

    let first = queue
        .create_job(&worker, json!({ "n": 1 }), JobOptions::default(), false)
        .await?;
    let second = queue
        .create_job(&worker, json!({ "n": 2 }), JobOptions::default(), false)
        .await?;

    queue.flush_job(&first).await?;
    let rows = queue.get_jobs(true).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, second);

    // Flushing an id twice is a no-op.
    queue.flush_job(&first).await?;
    assert_eq!(queue.get_jobs(true).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn jobs_survive_reopening_the_store() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = QueueConfig {
        db_path: dir.path().join("queue.db"),
    };
    let worker = test_utils::unique_name("durable");

    let queue = Queue::open(config.clone()).await?;
    let id = assert_ok!(
        queue
            .create_job(&worker, json!({ "keep": true }), JobOptions::default(), false)
            .await
    );
    queue.close().await;

    let reopened = Queue::open(config).await?;
    let rows = reopened.get_jobs(true).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
    assert_eq!(rows[0].json_payload()?, json!({ "keep": true }));

    Ok(())
}
