use ofs_model::{BreakerConfig, RemoteError, TransientKind};
use ofs_resilience::{CircuitBreaker, CircuitStatus};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Ok,
    Transient,
    Permission,
    ShedLocally,
}

fn outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        Just(Outcome::Ok),
        Just(Outcome::Transient),
        Just(Outcome::Permission),
        Just(Outcome::ShedLocally),
    ]
}

proptest! {
    /// Without the clock moving, the breaker is open exactly when some run
    /// of counted failures reached the threshold. Permission errors reset the
    /// run like successes; locally shed calls leave it untouched.
    #[test]
    fn opens_only_after_threshold_consecutive_counted_failures(
        outcomes in prop::collection::vec(outcome(), 0..40),
    ) {
        let config = BreakerConfig::default();
        let threshold = config.failure_threshold;
        let breaker = CircuitBreaker::new(config);

        let mut run = 0u32;
        let mut should_open = false;
        for o in &outcomes {
            match o {
                Outcome::Ok => {
                    breaker.record_success();
                    run = 0;
                }
                Outcome::Permission => {
                    breaker.record_failure(&RemoteError::Permission("403".into()));
                    run = 0;
                }
                Outcome::ShedLocally => breaker.record_failure(&RemoteError::Overloaded(8)),
                Outcome::Transient => {
                    breaker.record_failure(&RemoteError::transient(TransientKind::Server, "500"));
                    run += 1;
                }
            }
            if run >= threshold {
                should_open = true;
            }
        }

        let expected = if should_open { CircuitStatus::Open } else { CircuitStatus::Closed };
        prop_assert_eq!(breaker.status(), expected);
    }
}
