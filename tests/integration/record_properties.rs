//! Property-based tests for identifiers and cost estimates

use genworker::checkpoint::{merge, Checkpoint, Merged};
use genworker::config::PricingConfig;
use genworker::types::record_id;
use proptest::prelude::*;

/// Record ids depend only on job and seed index
#[test]
fn record_id_is_stable_and_distinct() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &("[a-z0-9-]{1,16}", any::<u64>(), any::<u64>()),
            |(job_id, a, b)| {
                let first = record_id(&job_id, a);
                prop_assert_eq!(&first, &record_id(&job_id, a));
                prop_assert_eq!(first.len(), 32);
                prop_assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
                if a != b {
                    prop_assert_ne!(first, record_id(&job_id, b));
                }
                Ok(())
            },
        )
        .unwrap();
}

proptest! {
    #[test]
    fn invocation_cost_grows_with_text(prompt in ".{0,200}", extra in ".{1,50}") {
        let pricing = PricingConfig::default();
        let short = pricing.invocation_cost(&prompt, "");
        let long = pricing.invocation_cost(&format!("{}{}", prompt, extra), "");
        prop_assert!(short.amount >= 0.0);
        prop_assert!(long.amount >= short.amount);
        prop_assert_eq!(short.invocations, 1);
    }

    #[test]
    fn merged_checkpoint_never_loses_progress(local in 0u64..1_000, remote in 0u64..1_000) {
        let mut mine = Checkpoint::zero("j");
        mine.records_generated = local;
        let mut theirs = Checkpoint::zero("j");
        theirs.records_generated = remote;

        let kept = match merge(mine, theirs) {
            Merged::Remote(c) | Merged::Local(c) => c.records_generated,
        };
        prop_assert_eq!(kept, local.max(remote));
    }
}
