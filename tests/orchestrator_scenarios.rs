mod common;

use common::inline_case;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vm_harness::catalog::Catalog;
use vm_harness::compare::Verdict;
use vm_harness::engine::MockEngine;
use vm_harness::extract::Extractor;
use vm_harness::orchestrator::retry::{RecordingSleeper, RetryPolicy};
use vm_harness::orchestrator::state::{CaseState, FailureKind};
use vm_harness::orchestrator::Orchestrator;
use vm_harness::pool::{PoolConfig, SessionPool};
use vm_harness::report::{RunReport, RunVerdict};
use vm_harness::runner::{RunnerConfig, ScriptRunner};

fn orchestrator(engine: &MockEngine, pool: PoolConfig, runner: RunnerConfig) -> Orchestrator {
    let concurrency = pool.capacity;
    Orchestrator::new(
        SessionPool::new(Arc::new(engine.clone()), pool),
        ScriptRunner::new(runner),
        Extractor::default(),
        concurrency,
    )
    .with_sleeper(Arc::new(RecordingSleeper::new()))
}

fn default_orchestrator(engine: &MockEngine) -> Orchestrator {
    orchestrator(
        engine,
        PoolConfig {
            acquire_timeout: Duration::from_millis(500),
            ..PoolConfig::default()
        },
        RunnerConfig::default(),
    )
}

fn run(orch: &Orchestrator, cases: Vec<vm_harness::catalog::VerificationCase>) -> RunReport {
    let catalog = Catalog::from_cases(cases).expect("catalog");
    orch.run(&catalog)
}

fn assert_no_leaks(engine: &MockEngine, orch: &Orchestrator) {
    let pool = orch.pool().stats();
    assert_eq!(pool.leased, 0, "leases outstanding: {pool:?}");
    assert_eq!(pool.acquired, pool.released, "unbalanced pool: {pool:?}");
    assert!(pool.peak_leased <= pool.capacity);
    let engine_stats = engine.stats();
    assert_eq!(engine_stats.live, 0, "sessions left open: {engine_stats:?}");
    assert_eq!(engine_stats.opened, engine_stats.closed);
}

#[test]
fn beam_within_tolerance_passes() {
    let engine = MockEngine::default();
    let orch = default_orchestrator(&engine);
    let report = run(
        &orch,
        vec![inline_case(
            "beam-bend-1",
            &["/COM,cantilever", "MAX_STRESS = 390.0"],
            &[("max_stress", 387.28)],
        )],
    );
    assert_eq!(report.verdict, RunVerdict::Pass);
    assert_eq!(report.exit_code(), 0);
    let result = &report.cases[0].results[0];
    assert_eq!(result.verdict, Verdict::Pass);
    assert_eq!(result.computed, Some(390.0));
    let ratio = result.ratio.expect("ratio");
    assert!((ratio - 1.0070).abs() < 1e-4, "ratio {ratio}");
    assert_no_leaks(&engine, &orch);
}

#[test]
fn beam_outside_tolerance_fails() {
    let engine = MockEngine::default();
    let orch = default_orchestrator(&engine);
    let report = run(
        &orch,
        vec![inline_case(
            "beam-bend-1",
            &["MAX_STRESS = 420.0"],
            &[("max_stress", 387.28)],
        )],
    );
    let case = report.case("beam-bend-1").expect("case");
    assert_eq!(case.final_state, CaseState::Done);
    assert_eq!(case.verdict, RunVerdict::Fail);
    let result = &case.results[0];
    assert_eq!(result.verdict, Verdict::Fail);
    let ratio = result.ratio.expect("ratio");
    assert!((ratio - 1.0847).abs() < 1e-4, "ratio {ratio}");
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn label_without_reply_is_missing_and_fails_case() {
    let engine = MockEngine::default();
    let orch = default_orchestrator(&engine);
    let report = run(
        &orch,
        vec![inline_case(
            "two-labels",
            &["SIG_X = 100.0"],
            &[("sig_x", 100.0), ("sig_y", 50.0)],
        )],
    );
    let case = &report.cases[0];
    assert_eq!(case.final_state, CaseState::Done);
    assert_eq!(case.verdict, RunVerdict::Fail);
    assert_eq!(case.results.len(), 2);
    assert_eq!(case.results[0].verdict, Verdict::Pass);
    assert_eq!(case.results[1].verdict, Verdict::Missing);
    assert_eq!(case.results[1].computed, None);
    assert_eq!(report.summary.missing, 1);
}

#[test]
fn third_case_waits_for_a_release_instead_of_failing() {
    let engine = MockEngine::builder()
        .command_latency("SOLVE", Duration::from_millis(50))
        .build();
    // Three workers so all cases contend for two sessions at once.
    let orch = Orchestrator::new(
        SessionPool::new(
            Arc::new(engine.clone()),
            PoolConfig {
                capacity: 2,
                acquire_timeout: Duration::from_millis(100),
                ..PoolConfig::default()
            },
        ),
        ScriptRunner::default(),
        Extractor::default(),
        3,
    )
    .with_retry(RetryPolicy::no_retry())
    .with_sleeper(Arc::new(RecordingSleeper::new()));

    let cases = (1..=3)
        .map(|n| inline_case(&format!("vm{n}"), &["A = 1.0", "SOLVE"], &[("a", 1.0)]))
        .collect();
    let start = Instant::now();
    let report = run(&orch, cases);
    let elapsed = start.elapsed();

    assert_eq!(report.verdict, RunVerdict::Pass, "{report:#?}");
    assert!(report
        .cases
        .iter()
        .all(|case| case.failure.is_none() && case.attempts == 1));
    assert!(elapsed >= Duration::from_millis(100), "elapsed {elapsed:?}");
    let stats = orch.pool().stats();
    assert_eq!(stats.peak_leased, 2);
    assert!(engine.stats().peak_live <= 2);
    assert_no_leaks(&engine, &orch);
}

#[test]
fn acquire_failure_fails_case_at_acquiring() {
    let engine = MockEngine::builder().refuse_opens().build();
    let orch = default_orchestrator(&engine);
    let report = run(&orch, vec![inline_case("vm1", &["A = 1"], &[("a", 1.0)])]);
    let case = &report.cases[0];
    let failure = case.failure.as_ref().expect("failure");
    assert_eq!(failure.stage, CaseState::Acquiring);
    assert_eq!(failure.kind, FailureKind::PoolExhausted);
    assert_eq!(case.attempts, 3);
    assert_eq!(case.results[0].verdict, Verdict::Error);
    assert_eq!(report.exit_code(), 2);
    assert_no_leaks(&engine, &orch);
}

#[test]
fn engine_fault_fails_case_at_running() {
    let engine = MockEngine::builder().fault_on("SOLVE").build();
    let orch = default_orchestrator(&engine);
    let report = run(
        &orch,
        vec![
            inline_case("faulty", &["SOLVE"], &[("a", 1.0)]),
            inline_case("healthy", &["A = 1.0"], &[("a", 1.0)]),
        ],
    );
    let faulty = report.case("faulty").expect("faulty");
    let failure = faulty.failure.as_ref().expect("failure");
    assert_eq!(failure.stage, CaseState::Running);
    assert_eq!(failure.kind, FailureKind::EngineError);
    assert_eq!(faulty.results[0].verdict, Verdict::Error);

    let healthy = report.case("healthy").expect("healthy");
    assert_eq!(healthy.verdict, RunVerdict::Pass);
    assert_eq!(report.exit_code(), 1);
    assert!(orch.pool().stats().evicted >= 3);
    assert_no_leaks(&engine, &orch);
}

#[test]
fn script_timeout_fails_case_and_evicts_session() {
    let engine = MockEngine::default();
    let orch = orchestrator(
        &engine,
        PoolConfig::default(),
        RunnerConfig {
            timeout: Duration::from_millis(30),
            ..RunnerConfig::default()
        },
    );
    let report = run(&orch, vec![inline_case("slow", &["/WAIT,10"], &[("a", 1.0)])]);
    let case = &report.cases[0];
    let failure = case.failure.as_ref().expect("failure");
    assert_eq!(failure.stage, CaseState::Running);
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert_eq!(case.attempts, 1);
    assert_no_leaks(&engine, &orch);
}

#[test]
fn lost_session_is_reported_as_disconnected() {
    let engine = MockEngine::default();
    let orch = default_orchestrator(&engine);
    let report = run(&orch, vec![inline_case("exits", &["/EXIT", "A = 1"], &[("a", 1.0)])]);
    let case = &report.cases[0];
    let failure = case.failure.as_ref().expect("failure");
    assert_eq!(failure.kind, FailureKind::Disconnected);
    assert_eq!(case.attempts, 3);
    assert_no_leaks(&engine, &orch);
}

#[test]
fn unexpected_reply_fails_case_at_extracting() {
    let engine = MockEngine::builder()
        .reply_override("*STATUS,A", &[" NAME  VALUE  TYPE", " OTHER  2.0  SCALAR"])
        .build();
    let orch = default_orchestrator(&engine);
    let report = run(&orch, vec![inline_case("desync", &["A = 1"], &[("a", 1.0)])]);
    let case = &report.cases[0];
    let failure = case.failure.as_ref().expect("failure");
    assert_eq!(failure.stage, CaseState::Extracting);
    assert_eq!(failure.kind, FailureKind::UnexpectedShape);
    assert_eq!(case.results[0].verdict, Verdict::Missing);
    // No case reached comparison.
    assert_eq!(report.exit_code(), 2);
    assert_no_leaks(&engine, &orch);
}

#[test]
fn cancelled_run_records_every_case_without_leaks() {
    let engine = MockEngine::default();
    let orch = default_orchestrator(&engine);
    orch.cancel_token().cancel();
    let report = run(
        &orch,
        vec![
            inline_case("vm1", &["A = 1"], &[("a", 1.0)]),
            inline_case("vm2", &["A = 1"], &[("a", 1.0), ("b", 2.0)]),
        ],
    );
    assert!(report.aborted);
    assert_eq!(report.summary.cases, 2);
    assert_eq!(report.summary.results, 3);
    assert!(report
        .results()
        .all(|result| result.verdict == Verdict::Missing));
    assert_eq!(engine.stats().opened, 0);
    assert_no_leaks(&engine, &orch);
}

#[test]
fn cancel_during_run_lets_in_flight_cases_finish() {
    let engine = MockEngine::builder()
        .command_latency("SOLVE", Duration::from_millis(80))
        .build();
    let orch = default_orchestrator(&engine);
    let cancel = orch.cancel_token();
    let cases = (1..=4)
        .map(|n| inline_case(&format!("vm{n}"), &["A = 1.0", "SOLVE"], &[("a", 1.0)]))
        .collect();

    let report = thread::scope(|scope| {
        scope.spawn(move || {
            thread::sleep(Duration::from_millis(30));
            cancel.cancel();
        });
        run(&orch, cases)
    });

    assert!(report.aborted);
    for id in ["vm1", "vm2"] {
        let case = report.case(id).expect("in-flight case");
        assert_eq!(case.final_state, CaseState::Done, "{id}: {case:?}");
        assert_eq!(case.verdict, RunVerdict::Pass);
    }
    for id in ["vm3", "vm4"] {
        let case = report.case(id).expect("unstarted case");
        assert_eq!(case.final_state, CaseState::Failed);
        assert_eq!(
            case.failure.as_ref().map(|failure| failure.kind),
            Some(FailureKind::Aborted)
        );
        assert_eq!(case.results[0].verdict, Verdict::Missing);
    }
    assert_eq!(orch.pool().stats().acquired, 2);
    assert_eq!(engine.stats().opened, 2);
    assert_no_leaks(&engine, &orch);
}

#[test]
fn every_expectation_gets_exactly_one_result() {
    let engine = MockEngine::builder().fault_on_first("SOLVE", 1).build();
    let orch = default_orchestrator(&engine).with_retry(RetryPolicy::no_retry());
    let cases = vec![
        inline_case("vm1", &["SOLVE", "A = 1"], &[("a", 1.0), ("b", 2.0)]),
        inline_case("vm2", &["B = 2", "C = 3"], &[("b", 2.0), ("c", 3.0), ("d", 4.0)]),
        inline_case("vm3", &["D = 4"], &[("d", 4.0)]),
    ];
    let expected: Vec<(String, String)> = cases
        .iter()
        .flat_map(|case| {
            case.expected
                .iter()
                .map(|value| (case.id.clone(), value.label.clone()))
                .collect::<Vec<_>>()
        })
        .collect();
    let report = run(&orch, cases);
    let actual: Vec<(String, String)> = report
        .results()
        .map(|result| (result.case_id.clone(), result.label.clone()))
        .collect();
    assert_eq!(actual, expected);
    assert_eq!(report.summary.results, 6);
}
