//! Shutdown mid-job loses at most the records since the last checkpoint,
//! and a later claimant resumes without regenerating checkpointed work.

use super::support::Fixture;
use genworker::checkpoint::CheckpointClient;
use genworker::config::PreemptionConfig;
use genworker::export::ExportPipeline;
use genworker::job::JobStatus;
use genworker::preemption::{PreemptionHandler, PreemptionState};
use genworker::store::BatchSink;
use genworker::types::now_millis;
use genworker::worker::{JobOutcome, RunReport};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn shutdown_checkpoints_progress_and_leaves_job_running() {
    let fx = Fixture::new();
    fx.submit("long", 1_000.0, 120);

    let deadline_hit = Arc::new(AtomicBool::new(false));
    let flag = deadline_hit.clone();
    let handler = Arc::new(
        PreemptionHandler::new(&PreemptionConfig::default())
            .with_deadline_action(Arc::new(move || flag.store(true, Ordering::SeqCst))),
    );
    let on_signal = handler.clone();
    fx.inference.on_call(73, move || {
        on_signal.request_shutdown("SIGTERM");
    });

    let worker = fx.worker("w1");
    let report = worker.run_once(handler.token()).await.unwrap();
    handler.mark_terminated();

    let RunReport::Finished { job_id, outcome } = report else {
        panic!("expected a finished attempt, got {:?}", report);
    };
    assert_eq!(job_id, "long");
    let JobOutcome::Preempted { records_generated } = outcome else {
        panic!("expected preemption, got {:?}", outcome);
    };
    assert!((50..=73).contains(&records_generated));
    assert_eq!(handler.state(), PreemptionState::Terminated);
    assert!(!deadline_hit.load(Ordering::SeqCst));

    let checkpoints = CheckpointClient::new(fx.backends.blobs.clone(), fx.config.checkpoint.clone());
    let checkpoint = checkpoints.load("long").unwrap();
    assert!((50..=73).contains(&checkpoint.records_generated));
    assert_eq!(checkpoint.records_generated, records_generated);

    let job = fx.job("long");
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.records_generated, records_generated);
}

#[tokio::test]
async fn resumed_job_completes_without_regenerating_records() {
    let fx = Fixture::new();
    fx.submit("long", 1_000.0, 120);

    let first_cancel = CancellationToken::new();
    let trigger = first_cancel.clone();
    fx.inference.on_call(73, move || trigger.cancel());

    let first = fx.worker("w1");
    first.run_once(first_cancel).await.unwrap();
    let checkpointed = fx.job("long").records_generated;
    assert_eq!(fx.inference.calls(), 73);

    // The first process is gone; its lease lapses.
    let second = fx.worker("w2");
    let lapsed = now_millis() + fx.config.worker.lease().as_millis() as u64 + 1_000;
    assert_eq!(
        second.coordinator().requeue_expired(lapsed).unwrap(),
        vec!["long".to_string()]
    );
    assert_eq!(fx.job("long").status, JobStatus::Queued);

    let report = second.run_once(CancellationToken::new()).await.unwrap();
    let RunReport::Finished {
        outcome: JobOutcome::Completed {
            records_generated, ..
        },
        ..
    } = report
    else {
        panic!("expected completion, got {:?}", report);
    };
    assert_eq!(records_generated, 120);
    assert_eq!(fx.inference.calls() as u64, 73 + (120 - checkpointed));

    let job = fx.job("long");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.owner, "w2");
    assert_eq!(job.cost_accumulated, fx.inference.calls() as f64);

    let pipeline = ExportPipeline::new(fx.backends.batches.clone());
    let mut indices = HashSet::new();
    for batch in pipeline.load_all_batches("long").unwrap() {
        for record in batch.unwrap().records {
            assert!(indices.insert(record.seed_index), "seed {} exported twice", record.seed_index);
        }
    }
    assert_eq!(indices, (0..120).collect::<HashSet<u64>>());
    assert_eq!(fx.backends.batches.list_batches("long").unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn cancelled_token_before_claim_work_leaves_progress_untouched() {
    let fx = Fixture::new();
    fx.submit("never", 100.0, 10);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let worker = fx.worker("w1");
    let report = worker.run_once(cancel).await.unwrap();
    assert!(matches!(
        report,
        RunReport::Finished {
            outcome: JobOutcome::Preempted { records_generated: 0 },
            ..
        }
    ));
    assert_eq!(fx.inference.calls(), 0);
    assert_eq!(fx.job("never").status, JobStatus::Running);
}
