//! Concurrent claimants must never share a job.

use super::support::Fixture;
use genworker::job::{Job, JobStatus};
use genworker::queue::JobQueueCoordinator;
use genworker::store::BatchSink;
use genworker::types::now_millis;
use genworker::worker::{JobOutcome, RunReport};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn coordinator(fx: &Fixture, owner: String) -> JobQueueCoordinator {
    JobQueueCoordinator::new(fx.backends.jobs.clone(), owner, Duration::from_secs(60), 4)
}

#[test]
fn single_job_is_claimed_by_exactly_one_worker() {
    let fx = Fixture::new();
    fx.submit("only", 10.0, 1);

    let claimants = 8;
    let barrier = Barrier::new(claimants);
    let results: Vec<Option<Job>> = thread::scope(|s| {
        let handles: Vec<_> = (0..claimants)
            .map(|i| {
                let coordinator = coordinator(&fx, format!("w{}", i));
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    coordinator.claim_next().unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let claimed: Vec<Job> = results.into_iter().flatten().collect();
    assert_eq!(claimed.len(), 1);

    let stored = fx.job("only");
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.owner, claimed[0].owner);
}

#[test]
fn every_job_is_handed_out_once_under_contention() {
    let fx = Fixture::new();
    for i in 0..20 {
        fx.submit(&format!("job-{:02}", i), 10.0, 1);
    }

    let claimants = 4;
    let barrier = Barrier::new(claimants);
    let mut claimed: Vec<String> = thread::scope(|s| {
        let handles: Vec<_> = (0..claimants)
            .map(|i| {
                let coordinator = coordinator(&fx, format!("w{}", i));
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let mut mine = Vec::new();
                    while let Some(job) = coordinator.claim_next().unwrap() {
                        mine.push(job.job_id);
                    }
                    mine
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    // A lost race ends a claimant's loop early; drain what is left.
    let drain = coordinator(&fx, "drain".to_string());
    while let Some(job) = drain.claim_next().unwrap() {
        claimed.push(job.job_id);
    }

    let unique: HashSet<&String> = claimed.iter().collect();
    assert_eq!(unique.len(), claimed.len(), "a job was claimed twice");
    assert_eq!(claimed.len(), 20);
}

#[test]
fn claims_follow_enqueue_order() {
    let fx = Fixture::new();
    fx.submit("first", 10.0, 1);
    std::thread::sleep(Duration::from_millis(2));
    fx.submit("second", 10.0, 1);

    let c = coordinator(&fx, "w".to_string());
    assert_eq!(c.claim_next().unwrap().unwrap().job_id, "first");
    assert_eq!(c.claim_next().unwrap().unwrap().job_id, "second");
    assert!(c.claim_next().unwrap().is_none());
}

/// While the given call is served, lapse every lease and let `w2` claim.
fn steal_on_call(fx: &Fixture, call: usize) {
    let thief = Arc::new(coordinator(fx, "w2".to_string()));
    fx.inference.on_call(call, move || {
        let later = now_millis() + 24 * 60 * 60 * 1000;
        assert_eq!(thief.requeue_expired(later).unwrap().len(), 1);
        assert!(thief.claim_next().unwrap().is_some());
    });
}

#[tokio::test]
async fn worker_that_lost_its_lease_stops_at_next_flush() {
    let fx = Fixture::with_interval(3);
    fx.submit("j", 100.0, 10);
    steal_on_call(&fx, 5);

    let worker = fx.worker("w1");
    let report = worker.run_once(CancellationToken::new()).await.unwrap();
    assert_eq!(
        report,
        RunReport::Finished {
            job_id: "j".to_string(),
            outcome: JobOutcome::ClaimLost { records_generated: 3 },
        }
    );
    assert_eq!(fx.inference.calls(), 6);

    // Only the batch flushed before the takeover exists, and the job record
    // still belongs to the new claimant.
    assert_eq!(fx.backends.batches.list_batches("j").unwrap(), vec![0]);
    let job = fx.job("j");
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.owner, "w2");
    assert_eq!(job.records_generated, 3);
}

#[tokio::test]
async fn lost_lease_is_noticed_between_flushes() {
    let mut fx = Fixture::new();
    fx.config.worker.lease_secs = 0;
    fx.submit("j", 100.0, 10);
    steal_on_call(&fx, 2);

    let worker = fx.worker("w1");
    let report = worker.run_once(CancellationToken::new()).await.unwrap();
    assert!(matches!(
        report,
        RunReport::Finished {
            outcome: JobOutcome::ClaimLost { records_generated: 0 },
            ..
        }
    ));
    assert_eq!(fx.inference.calls(), 2);
    assert!(fx.backends.batches.list_batches("j").unwrap().is_empty());
    assert_eq!(fx.job("j").owner, "w2");
}
