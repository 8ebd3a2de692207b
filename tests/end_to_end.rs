//! End-to-end scenarios wiring the Executor, proof recorder, consensus
//! evaluator, and rate engine together, matching the concrete literal
//! scenarios named in the specification's testable-properties section.

use std::time::Duration;

use sandrun::error::RateLimitError;
use sandrun::job::{InterpreterTag, ResourceLimits, SecurityTier};
use sandrun::proof::{ConsensusEvaluator, Session, Verbosity};
use sandrun::rate_limiter::{LimitKind, RateEngine, RateLimit, SubjectQuota};
use sandrun::sandbox::Executor;
use sandrun::worker_identity::WorkerIdentity;

#[tokio::test]
async fn hello_world_admits_and_produces_a_valid_proof() {
    let executor = Executor::new();
    let identity = WorkerIdentity::generate();
    let code = b"print('Hello, World!')";

    let mut session = Session::start("job-hello", code, Verbosity::Standard);
    session.record_step("job.started", &[], "ok").unwrap();

    let outcome = executor
        .execute(
            "job-hello",
            code,
            InterpreterTag::Python,
            ResourceLimits::default(),
            SecurityTier::Minimal,
            false,
            &[],
        )
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(String::from_utf8_lossy(&outcome.stdout), "Hello, World!\n");
    assert!(!outcome.timed_out);

    session
        .record_step("job.finished", &[outcome.exit_code.to_string()], "exited")
        .unwrap();
    let proof = session.generate_proof(&identity, "{}").unwrap();
    assert!(proof.chain_is_valid());
    assert!(proof.signature_is_valid());
}

#[tokio::test]
async fn sleep_beyond_wall_limit_is_killed_within_expected_window() {
    let executor = Executor::new();
    let limits = ResourceLimits {
        max_wall_seconds: 2,
        ..ResourceLimits::default()
    };

    let start = std::time::Instant::now();
    let outcome = executor
        .execute(
            "job-sleep",
            b"import time\ntime.sleep(5)",
            InterpreterTag::Python,
            limits,
            SecurityTier::Minimal,
            false,
            &[],
        )
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert!(outcome.timed_out);
    assert!(outcome.exit_code < 0);
    assert!(outcome.stdout.is_empty());
    assert!(elapsed >= Duration::from_millis(1900) && elapsed <= Duration::from_secs(3));
}

#[tokio::test]
async fn file_size_cap_violation_reports_failure_and_no_output_file() {
    let executor = Executor::new();
    let limits = ResourceLimits {
        max_output_file_bytes: 1024 * 1024,
        ..ResourceLimits::default()
    };

    let code = b"with open('big.bin', 'wb') as f:\n    f.write(b'x' * (2 * 1024 * 1024))\n";
    let outcome = executor
        .execute(
            "job-fsize",
            code,
            InterpreterTag::Python,
            limits,
            SecurityTier::Minimal,
            false,
            &[],
        )
        .await
        .unwrap();

    assert_ne!(outcome.exit_code, 0);
    assert!(outcome.output_files.is_empty());
}

#[tokio::test]
async fn identical_code_on_two_nodes_reaches_full_consensus() {
    let node_a = WorkerIdentity::generate();
    let node_b = WorkerIdentity::generate();
    let code = b"print('deterministic')";

    let build = |identity: &WorkerIdentity| {
        let mut session = Session::start("job-consensus", code, Verbosity::Standard);
        session.enable_deterministic_mode();
        session.record_step("exec", &["print".to_string()], "ok").unwrap();
        session.generate_proof(identity, "{}").unwrap()
    };

    let proof_a = build(&node_a);
    let proof_b = build(&node_b);
    assert_eq!(proof_a.final_hash, proof_b.final_hash);

    let evaluator = ConsensusEvaluator::default();
    let result = evaluator.validate(&[proof_a, proof_b]).unwrap();

    assert!(result.is_valid);
    assert_eq!(result.confidence, 1.0);
    assert_eq!(result.agreeing_nodes.len(), 2);
}

#[tokio::test]
async fn burst_of_fifteen_requests_admits_exactly_ten_then_recovers() {
    let engine = RateEngine::new();
    engine
        .set_quota(
            "subject-a",
            SubjectQuota {
                limits: vec![RateLimit::new(
                    LimitKind::RequestsPerSecond,
                    10,
                    Duration::from_secs(1),
                )],
                priority: 0,
                premium: false,
            },
        )
        .await;

    let mut admitted = 0;
    let mut denied = 0;
    for _ in 0..15 {
        match engine.acquire("subject-a", LimitKind::RequestsPerSecond, 1).await {
            Ok(()) => admitted += 1,
            Err(RateLimitError::Exceeded { retry_after, .. }) => {
                denied += 1;
                assert!(retry_after > Duration::ZERO);
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(admitted, 10);
    assert_eq!(denied, 5);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(
        engine
            .acquire("subject-a", LimitKind::RequestsPerSecond, 1)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn banned_ip_is_denied_for_the_ban_duration_then_recovers() {
    let engine = RateEngine::new();
    engine.ban("192.0.2.1", Duration::from_secs(2)).await;

    assert!(engine.is_banned("192.0.2.1").await);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(engine.is_banned("192.0.2.1").await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!engine.is_banned("192.0.2.1").await);
}
