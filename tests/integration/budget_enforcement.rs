//! Spend never runs past the budget by more than one record.

use super::support::Fixture;
use genworker::job::{JobStatus, TemplateRef};
use genworker::store::CostLedgerStore;
use genworker::worker::{JobOutcome, RunReport};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn stops_at_budget_and_records_terminal_status() {
    let fx = Fixture::new();
    fx.submit("capped", 10.0, 100);
    let worker = fx.worker("w1");

    let report = worker.run_once(CancellationToken::new()).await.unwrap();
    assert_eq!(
        report,
        RunReport::Finished {
            job_id: "capped".to_string(),
            outcome: JobOutcome::BudgetExceeded {
                records_generated: 10
            },
        }
    );
    assert_eq!(fx.inference.calls(), 10);

    let job = fx.job("capped");
    assert_eq!(job.status, JobStatus::BudgetExceeded);
    assert_eq!(job.records_generated, 10);
    assert_eq!(job.cost_accumulated, 10.0);

    let latest = fx.backends.ledger.latest("capped").unwrap().unwrap();
    assert_eq!(latest.cumulative_estimate, 10.0);
}

#[tokio::test]
async fn multi_invocation_records_overshoot_by_at_most_one_record() {
    let fx = Fixture::new();
    let mut request = fx.request("two-step", 5.0, 100);
    request.template = TemplateRef {
        id: "labelled".to_string(),
        version: "1".to_string(),
    };
    fx.submit_request(request);
    fx.inference.reply_containing("Tone of:", "calm");

    let worker = fx.worker("w1");
    worker.run_once(CancellationToken::new()).await.unwrap();

    // Two invocations per record: the gate admits records at spend 0, 2 and 4.
    let job = fx.job("two-step");
    assert_eq!(job.status, JobStatus::BudgetExceeded);
    assert_eq!(job.records_generated, 3);
    assert_eq!(job.cost_accumulated, 6.0);
    assert!(job.cost_accumulated < job.budget_limit + 2.0);
}

#[tokio::test]
async fn zero_budget_generates_nothing() {
    let fx = Fixture::new();
    fx.submit("free", 0.0, 5);

    let worker = fx.worker("w1");
    worker.run_once(CancellationToken::new()).await.unwrap();

    assert_eq!(fx.inference.calls(), 0);
    let job = fx.job("free");
    assert_eq!(job.status, JobStatus::BudgetExceeded);
    assert_eq!(job.records_generated, 0);
}

#[tokio::test]
async fn failed_invocations_cost_nothing() {
    let fx = Fixture::new();
    fx.submit("flaky", 100.0, 6);
    fx.inference.fail_call(
        2,
        genworker::error::InferenceError::RateLimited("slow down".into()),
    );

    let worker = fx.worker("w1");
    worker.run_once(CancellationToken::new()).await.unwrap();

    let job = fx.job("flaky");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_generated, 5);
    assert_eq!(job.cost_accumulated, 5.0);
}
