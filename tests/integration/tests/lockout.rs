//! Attempt protection integration tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jans_auth::{AttemptLedger, Escalation, LockoutPolicy};
use jans_core::metrics::names;
use jans_script::{
    ExternalScriptContext, NativeScriptFactory, ScriptModule, ScriptResult, ScriptSignal,
    StopResult,
};
use jans_server::{AuthenticationOutcome, AuthenticationRequest};

use crate::common::{TestEnv, DIRECTORY, DIRECTORY_BIND_SCRIPT};

fn alice_policy() -> LockoutPolicy {
    LockoutPolicy {
        max_failures: 5,
        failure_window_secs: 60,
        base_lockout_secs: 30,
        escalation: Escalation::Doubling {
            max_lockout_secs: 3_600,
        },
        ..LockoutPolicy::default()
    }
}

/// Five failures inside a minute lock alice for the base duration; the next
/// failure after the lock expired escalates.
#[tokio::test(start_paused = true)]
async fn test_alice_lockout_escalates() -> anyhow::Result<()> {
    let ledger = AttemptLedger::new(alice_policy())?;

    for attempt in 1..=4 {
        assert!(ledger.record_failure("alice").is_none(), "attempt {attempt}");
        tokio::time::advance(Duration::from_secs(5)).await;
    }
    let before = Utc::now();
    let until = ledger.record_failure("alice").expect("fifth failure locks");
    assert!(until >= before + chrono::Duration::seconds(30));
    assert!(ledger.is_locked("alice"));

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(!ledger.is_locked("alice"), "lock expires after the base duration");

    let before = Utc::now();
    let until = ledger.record_failure("alice").expect("sixth failure locks again");
    assert!(until >= before + chrono::Duration::seconds(60));
    Ok(())
}

/// Escalated durations never shrink and stop at the cap.
#[tokio::test(start_paused = true)]
async fn test_escalation_is_monotonic_up_to_cap() -> anyhow::Result<()> {
    let ledger = AttemptLedger::new(LockoutPolicy {
        max_failures: 1,
        base_lockout_secs: 10,
        escalation: Escalation::Doubling {
            max_lockout_secs: 45,
        },
        ..LockoutPolicy::default()
    })?;

    let mut previous = Duration::ZERO;
    for _ in 0..5 {
        let before = Utc::now();
        let until = ledger.record_failure("carol").expect("every failure locks");
        let duration = (until - before).to_std()?;
        assert!(duration + Duration::from_secs(1) >= previous);
        assert!(duration <= Duration::from_secs(46));
        previous = duration;
        tokio::time::advance(duration + Duration::from_secs(1)).await;
    }
    assert!(previous >= Duration::from_secs(44));
    Ok(())
}

/// A locked principal is refused before the directory is consulted.
#[tokio::test]
async fn test_locked_principal_is_refused_with_valid_password() -> anyhow::Result<()> {
    let config = format!("[lockout]\nmax_failures = 3\nbase_lockout_secs = 300\n{DIRECTORY}{DIRECTORY_BIND_SCRIPT}");
    let env = TestEnv::start(&config).await?;
    let auth = env.engine.authentication();

    for _ in 0..2 {
        let outcome = auth
            .authenticate(AuthenticationRequest::new("alice", "rabbit-hole"))
            .await;
        assert!(matches!(outcome, AuthenticationOutcome::Denied { .. }), "{outcome:?}");
    }
    let third = auth
        .authenticate(AuthenticationRequest::new("alice", "rabbit-hole"))
        .await;
    assert!(matches!(third, AuthenticationOutcome::Locked { .. }), "{third:?}");

    let opened_before = env.connector.opened_count();
    let refused = auth
        .authenticate(AuthenticationRequest::new("alice", "wonderland"))
        .await;
    assert!(matches!(refused, AuthenticationOutcome::Locked { .. }));
    assert_eq!(env.connector.opened_count(), opened_before);
    assert_eq!(env.metrics.count(names::AUTH_LOCKED_REJECT), 1);

    // Other principals are unaffected.
    let bob = auth
        .authenticate(AuthenticationRequest::new("bob", "builder"))
        .await;
    assert!(bob.is_allowed(), "{bob:?}");

    env.stop().await;
    Ok(())
}

/// A directory outage yields a retryable answer and no recorded failure.
#[tokio::test]
async fn test_directory_outage_is_not_a_failed_attempt() -> anyhow::Result<()> {
    let config = format!("[lockout]\nmax_failures = 1\n{DIRECTORY}{DIRECTORY_BIND_SCRIPT}");
    let env = TestEnv::start(&config).await?;
    env.connector.set_reachable(crate::common::LDAP_A, false);
    env.connector.set_reachable(crate::common::LDAP_B, false);

    let outcome = env
        .engine
        .authentication()
        .authenticate(AuthenticationRequest::new("alice", "wonderland"))
        .await;
    assert!(
        matches!(outcome, AuthenticationOutcome::Unavailable { .. }),
        "{outcome:?}"
    );
    assert!(env.engine.ledger().snapshot("alice").is_none());
    assert!(!env.engine.ledger().is_locked("alice"));

    env.stop().await;
    Ok(())
}

/// Password check that answers slowly, slower still for the right password.
#[derive(Debug)]
struct SlowGate {
    evaluated: Arc<AtomicUsize>,
}

#[async_trait]
impl ScriptModule for SlowGate {
    async fn initialize(&mut self, _: &BTreeMap<String, String>) -> ScriptResult<()> {
        Ok(())
    }

    async fn invoke(
        &self,
        _method: &str,
        ctx: &mut ExternalScriptContext,
    ) -> ScriptResult<ScriptSignal> {
        self.evaluated.fetch_add(1, Ordering::SeqCst);
        if ctx.credential() == Some("wonderland") {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(ScriptSignal::Success)
        } else {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(ScriptSignal::Stop(StopResult::deny("bad password")))
        }
    }
}

async fn slow_gate_env(max_failures: u32) -> anyhow::Result<(TestEnv, Arc<AtomicUsize>)> {
    let evaluated = Arc::new(AtomicUsize::new(0));
    let native = Arc::new(NativeScriptFactory::new());
    {
        let evaluated = Arc::clone(&evaluated);
        native.register("slow-gate", move |_, _| {
            Box::new(SlowGate {
                evaluated: Arc::clone(&evaluated),
            })
        });
    }
    let config = format!(
        "[lockout]\nmax_failures = {max_failures}\nbase_lockout_secs = 300\n\n\
         [[scripts]]\nname = \"slow\"\nscript_type = \"person-authentication\"\n\
         source = {{ engine = \"native\", code = \"slow-gate\" }}\n"
    );
    let env = TestEnv::start_with(&config, native).await?;
    Ok((env, evaluated))
}

/// A burst of parallel guesses gets no more evaluations than the failures
/// the principal has left, and a correct guess at the end of it is refused.
#[tokio::test]
async fn test_parallel_guesses_cannot_outrun_the_lock() -> anyhow::Result<()> {
    let (env, evaluated) = slow_gate_env(3).await?;
    let auth = env.engine.authentication();

    let mut attempts: Vec<_> = (0..19)
        .map(|n| auth.authenticate(AuthenticationRequest::new("alice", format!("guess-{n}"))))
        .collect();
    attempts.push(auth.authenticate(AuthenticationRequest::new("alice", "wonderland")));
    let outcomes = futures::future::join_all(attempts).await;

    assert!(evaluated.load(Ordering::SeqCst) <= 3);
    assert!(outcomes.iter().all(|o| !o.is_allowed()), "{outcomes:?}");
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, AuthenticationOutcome::Throttled)));
    assert!(env.engine.ledger().is_locked("alice"));
    assert_eq!(env.engine.ledger().snapshot("alice").map(|s| s.failures_in_window), Some(3));
    assert!(env.metrics.count(names::AUTH_THROTTLED) >= 16);

    env.stop().await;
    Ok(())
}

/// A correct password already in flight when the lock lands is refused, and
/// the lock stays.
#[tokio::test]
async fn test_lock_set_during_evaluation_wins_over_success() -> anyhow::Result<()> {
    let (env, evaluated) = slow_gate_env(2).await?;
    let auth = env.engine.authentication();

    let right = auth.authenticate(AuthenticationRequest::new("alice", "wonderland"));
    let wrong = auth.authenticate(AuthenticationRequest::new("alice", "rabbit-hole"));
    let ledger = env.engine.ledger().clone();
    let lock_meanwhile = async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        ledger.record_failure("alice")
    };
    let (right, wrong, locked) = futures::join!(right, wrong, lock_meanwhile);

    assert_eq!(evaluated.load(Ordering::SeqCst), 2);
    assert!(matches!(wrong, AuthenticationOutcome::Denied { .. }), "{wrong:?}");
    assert!(locked.is_some());
    assert!(matches!(right, AuthenticationOutcome::Locked { .. }), "{right:?}");
    assert!(env.engine.ledger().is_locked("alice"));

    env.stop().await;
    Ok(())
}
