//! End-to-end attempts through `Worker::run_once`.

use super::support::Fixture;
use genworker::error::{InferenceError, WorkerError};
use genworker::job::{JobStatus, TemplateRef};
use genworker::store::{BatchSink, JobStore};
use genworker::worker::{JobOutcome, RunReport};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn empty_queue_is_idle() {
    let fx = Fixture::new();
    let worker = fx.worker("w1");
    assert_eq!(
        worker.run_once(CancellationToken::new()).await.unwrap(),
        RunReport::Idle
    );
}

#[tokio::test]
async fn completes_checkpoints_and_exports() {
    let fx = Fixture::with_interval(3);
    fx.submit("j", 100.0, 7);

    let worker = fx.worker("w1");
    let report = worker.run_once(CancellationToken::new()).await.unwrap();
    let RunReport::Finished {
        outcome: JobOutcome::Completed {
            records_generated,
            export,
        },
        ..
    } = report
    else {
        panic!("expected completion, got {:?}", report);
    };
    assert_eq!(records_generated, 7);
    assert_eq!(export.total_records, 7);
    assert_eq!(export.batches, 3);
    assert_eq!(export.artifacts.len(), 1);
    assert_eq!(export.artifacts[0].name, "records.jsonl");

    assert_eq!(fx.backends.batches.list_batches("j").unwrap(), vec![0, 1, 2]);

    let job = fx.job("j");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_generated, 7);
    assert_eq!(job.cost_accumulated, 7.0);
    assert!(fx.backends.jobs.running_entries().unwrap().is_empty());

    let path = fx.backends.batches.export_path("j", "records.jsonl").unwrap();
    let contents = std::fs::read_to_string(path).unwrap();
    let ids: HashSet<String> = contents
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["record_id"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(ids.len(), 7);

    // Seeds cycle once the target exceeds the seed set.
    let prompts = fx.inference.prompts.lock().clone();
    assert_eq!(prompts[0], "Write about rust (0)");
    assert_eq!(prompts[3], "Write about rust (3)");
}

#[tokio::test]
async fn access_denied_fails_the_job_with_reason() {
    let fx = Fixture::new();
    fx.submit("denied", 100.0, 20);
    fx.inference
        .fail_call(5, InferenceError::AccessDenied("key revoked".into()));

    let worker = fx.worker("w1");
    let err = worker.run_once(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, WorkerError::FatalAuth(_)));
    assert_eq!(fx.inference.calls(), 5);

    let job = fx.job("denied");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.records_generated, 4);
    let reason = job.failure_reason.unwrap();
    assert!(reason.contains("key revoked"), "reason was {}", reason);
}

#[tokio::test]
async fn consecutive_failures_stall_the_job() {
    let fx = Fixture::new();
    fx.submit("stalled", 100.0, 20);
    for call in 2..=4 {
        fx.inference
            .fail_call(call, InferenceError::ModelError("overloaded".into()));
    }

    let worker = fx.worker("w1");
    let err = worker.run_once(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, WorkerError::GenerationStalled(3)));

    let job = fx.job("stalled");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.records_generated, 1);
}

#[tokio::test]
async fn isolated_failures_are_skipped() {
    let fx = Fixture::new();
    fx.submit("bumpy", 100.0, 10);
    fx.inference
        .fail_call(3, InferenceError::ValidationError("bad output".into()));
    fx.inference
        .fail_call(7, InferenceError::RateLimited("later".into()));

    let worker = fx.worker("w1");
    worker.run_once(CancellationToken::new()).await.unwrap();

    let job = fx.job("bumpy");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_generated, 8);
}

#[tokio::test]
async fn cancellation_is_observed_at_the_next_checkpoint() {
    let fx = Fixture::with_interval(3);
    fx.submit("c", 100.0, 30);
    let jobs = fx.backends.jobs.clone();
    fx.inference.on_call(4, move || {
        jobs.request_cancel("c").unwrap();
    });

    let worker = fx.worker("w1");
    let report = worker.run_once(CancellationToken::new()).await.unwrap();
    assert!(matches!(
        report,
        RunReport::Finished {
            outcome: JobOutcome::Cancelled {
                records_generated: 6
            },
            ..
        }
    ));

    let job = fx.job("c");
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.records_generated, 6);
}

#[tokio::test]
async fn queued_job_cancelled_before_claim_is_never_run() {
    let fx = Fixture::new();
    fx.submit("c", 100.0, 5);
    fx.backends.jobs.request_cancel("c").unwrap();

    let worker = fx.worker("w1");
    assert_eq!(
        worker.run_once(CancellationToken::new()).await.unwrap(),
        RunReport::Idle
    );
    assert_eq!(fx.job("c").status, JobStatus::Cancelled);
}

#[tokio::test]
async fn unknown_template_fails_the_job() {
    let fx = Fixture::new();
    let mut request = fx.request("t", 100.0, 5);
    request.template = TemplateRef {
        id: "missing".to_string(),
        version: "9".to_string(),
    };
    fx.submit_request(request);

    let worker = fx.worker("w1");
    let err = worker.run_once(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, WorkerError::TemplateError(_)));
    assert_eq!(fx.job("t").status, JobStatus::Failed);
    assert_eq!(fx.inference.calls(), 0);
}

#[tokio::test]
async fn terminal_jobs_are_not_reclaimed() {
    let fx = Fixture::new();
    fx.submit("once", 100.0, 2);

    let worker = fx.worker("w1");
    worker.run_once(CancellationToken::new()).await.unwrap();
    assert_eq!(
        worker.run_once(CancellationToken::new()).await.unwrap(),
        RunReport::Idle
    );
    assert_eq!(fx.inference.calls(), 2);
}
