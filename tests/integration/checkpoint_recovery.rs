//! Recovery from damaged, foreign, stale and contended checkpoints.

use super::support::Fixture;
use genworker::checkpoint::{checkpoint_key, Checkpoint, CheckpointClient};
use genworker::config::CheckpointConfig;
use genworker::export::ExportPipeline;
use genworker::job::JobStatus;
use genworker::store::{BlobStore, PutOutcome};
use genworker::types::now_millis;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn corrupt_checkpoint_restarts_from_zero() {
    let fx = Fixture::new();
    fx.submit("j", 100.0, 5);
    let put = fx
        .backends
        .blobs
        .put(&checkpoint_key("j"), b"{not a checkpoint", None)
        .unwrap();
    assert!(matches!(put, PutOutcome::Written(_)));

    let worker = fx.worker("w1");
    worker.run_once(CancellationToken::new()).await.unwrap();

    assert_eq!(fx.inference.calls(), 5);
    let job = fx.job("j");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_generated, 5);
}

#[tokio::test]
async fn checkpoint_of_another_job_is_ignored() {
    let fx = Fixture::new();
    fx.submit("j", 100.0, 4);
    let mut foreign = Checkpoint::zero("other");
    foreign.records_generated = 40;
    foreign.resume_cursor = 40;
    let bytes = serde_json::to_vec(&foreign).unwrap();
    fx.backends
        .blobs
        .put(&checkpoint_key("j"), &bytes, None)
        .unwrap();

    let worker = fx.worker("w1");
    worker.run_once(CancellationToken::new()).await.unwrap();

    assert_eq!(fx.inference.calls(), 4);
    assert_eq!(fx.job("j").records_generated, 4);
}

#[tokio::test]
async fn batch_written_before_a_lost_checkpoint_save_is_kept() {
    let fx = Fixture::with_interval(3);
    fx.submit("j", 100.0, 6);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    fx.inference.on_call(5, move || trigger.cancel());

    let first = fx.worker("w1");
    first.run_once(cancel).await.unwrap();
    assert_eq!(fx.job("j").records_generated, 5);

    // Rewind the checkpoint to before batch 1, as if the save after writing
    // it never landed.
    let key = checkpoint_key("j");
    let stored = fx.backends.blobs.get(&key).unwrap().unwrap();
    let mut rewound = Checkpoint::zero("j");
    rewound.records_generated = 3;
    rewound.resume_cursor = 3;
    rewound.current_batch_number = 1;
    let bytes = serde_json::to_vec(&rewound).unwrap();
    fx.backends
        .blobs
        .put(&key, &bytes, Some(stored.version))
        .unwrap();

    let second = fx.worker("w2");
    let lapsed = now_millis() + fx.config.worker.lease().as_millis() as u64 + 1_000;
    second.coordinator().requeue_expired(lapsed).unwrap();
    second.run_once(CancellationToken::new()).await.unwrap();

    assert_eq!(fx.inference.calls(), 6);
    let job = fx.job("j");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_generated, 6);

    let pipeline = ExportPipeline::new(fx.backends.batches.clone());
    let seeds: HashSet<u64> = pipeline
        .load_all_batches("j")
        .unwrap()
        .flat_map(|batch| batch.unwrap().records)
        .map(|record| record.seed_index)
        .collect();
    assert_eq!(seeds, (0..6).collect::<HashSet<u64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_savers_converge_on_the_furthest_progress() {
    let fx = Fixture::new();
    let client = Arc::new(CheckpointClient::new(
        fx.backends.blobs.clone(),
        CheckpointConfig {
            max_attempts: 64,
            backoff_ms: 1,
        },
    ));

    let mut handles = Vec::new();
    for writer in 0..4u64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let mut checkpoint = client.load("shared").unwrap();
            for step in 1..=10u64 {
                let progress = (writer * 10 + step).max(checkpoint.records_generated);
                checkpoint.records_generated = progress;
                checkpoint.resume_cursor = progress;
                client.save(&mut checkpoint).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stored = client.load("shared").unwrap();
    assert_eq!(stored.records_generated, 40);
    assert_eq!(stored.resume_cursor, 40);
}
