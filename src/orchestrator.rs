//! Drives every case of a catalog through the session pool.
//!
//! Cases run on a fixed set of scoped worker threads, `concurrency` of them,
//! pulling from a shared index. Each case walks the state machine in
//! [`state`]; a failed case degrades only its own results. The pool's
//! capacity still bounds how many cases hold a session at once.
pub mod cancel;
pub mod retry;
pub mod state;

use crate::catalog::{Catalog, Script, VerificationCase};
use crate::compare::Verdict;
use crate::extract::Extractor;
use crate::pool::{PoolError, SessionPool};
use crate::report::{CaseReport, ComparisonResult, ReportAggregator, RunReport, RunVerdict};
use crate::runner::{ExecutionTrace, RunError, ScriptRunner};
use crate::util::duration_ms;
use cancel::CancelToken;
use retry::{RetryPolicy, Sleeper, ThreadSleeper};
use state::{CaseMachine, CaseState, FailureKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

enum AttemptError {
    Pool(PoolError),
    Run(RunError),
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Pool(_) => true,
            Self::Run(err) => err.is_transient(),
        }
    }

    fn kind(&self) -> FailureKind {
        match self {
            Self::Pool(_) => FailureKind::PoolExhausted,
            Self::Run(RunError::Engine(_)) => FailureKind::EngineError,
            Self::Run(RunError::Timeout { .. }) => FailureKind::Timeout,
            Self::Run(RunError::Disconnected(_)) => FailureKind::Disconnected,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Pool(err) => err.to_string(),
            Self::Run(err) => err.to_string(),
        }
    }
}

pub struct Orchestrator {
    pool: SessionPool,
    runner: ScriptRunner,
    extractor: Extractor,
    concurrency: usize,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancelToken,
    fail_fast: bool,
}

impl Orchestrator {
    pub fn new(
        pool: SessionPool,
        runner: ScriptRunner,
        extractor: Extractor,
        concurrency: usize,
    ) -> Self {
        Self {
            pool,
            runner,
            extractor,
            concurrency: concurrency.max(1),
            retry: RetryPolicy::default(),
            sleeper: Arc::new(ThreadSleeper),
            cancel: CancelToken::new(),
            fail_fast: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Abort the run after the first case that does not pass.
    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run every case and build the report.
    pub fn run(&self, catalog: &Catalog) -> RunReport {
        let start = Instant::now();
        let aggregator = ReportAggregator::new(self.pool.engine_description(), catalog.cases());
        self.execute(catalog, &aggregator);
        self.pool.close_idle();
        let report = aggregator.finish(self.cancel.is_cancelled());
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            cases = report.summary.cases,
            results = report.summary.results,
            verdict = %report.verdict,
            aborted = report.aborted,
            "verification run complete"
        );
        report
    }

    /// Run every case, recording each outcome into `aggregator`. Cases never
    /// started because of an abort are recorded as aborted.
    pub fn execute(&self, catalog: &Catalog, aggregator: &ReportAggregator) {
        let cases = catalog.cases();
        let next = AtomicUsize::new(0);
        let workers = self.concurrency.min(cases.len());
        tracing::debug!(
            workers,
            capacity = self.pool.capacity(),
            cases = cases.len(),
            "dispatching cases"
        );

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    let Some(case) = cases.get(idx) else {
                        break;
                    };
                    let report = self.run_case(case);
                    if self.fail_fast && report.verdict != RunVerdict::Pass {
                        tracing::warn!(case_id = %case.id, "fail-fast: aborting remaining cases");
                        self.cancel.cancel();
                    }
                    aggregator.record_case(report);
                });
            }
        });

        let claimed = next.load(Ordering::SeqCst).min(cases.len());
        tracing::debug!(
            claimed,
            recorded = aggregator.recorded(),
            unstarted = cases.len() - claimed,
            "workers finished"
        );
        for case in &cases[claimed..] {
            aggregator.record_case(CaseReport::aborted(case));
        }
    }

    /// Walk one case through the state machine to a terminal state.
    pub fn run_case(&self, case: &VerificationCase) -> CaseReport {
        let start = Instant::now();
        let mut machine = CaseMachine::new(&case.id);
        if self.cancel.is_cancelled() {
            return CaseReport::aborted(case);
        }

        let script = match case.load_script() {
            Ok(script) => self.with_queries(script, case),
            Err(err) => {
                let failure = machine.fail(FailureKind::Script, err.to_string());
                return failed_report(case, failure, Verdict::Error, 0, start);
            }
        };

        let mut attempt = 0u32;
        let trace = loop {
            attempt += 1;
            machine.advance(CaseState::Acquiring);
            match self.attempt(&mut machine, &script) {
                Ok(trace) => break trace,
                Err(err) => {
                    let retry = err.is_transient()
                        && self.retry.allows_retry_after(attempt)
                        && !self.cancel.is_cancelled();
                    if retry {
                        let delay = self.retry.backoff(attempt);
                        tracing::warn!(
                            case_id = %case.id,
                            attempt,
                            delay_ms = delay.as_millis(),
                            error = %err.message(),
                            "transient failure; retrying case"
                        );
                        self.sleeper.sleep(delay);
                        continue;
                    }
                    let failure = machine.fail(err.kind(), err.message());
                    return failed_report(case, failure, Verdict::Error, attempt, start);
                }
            }
        };

        machine.advance(CaseState::Extracting);
        let extractions = match self.extractor.extract(case, &trace) {
            Ok(extractions) => extractions,
            Err(err) => {
                let failure = machine.fail(FailureKind::UnexpectedShape, err.to_string());
                return failed_report(case, failure, Verdict::Missing, attempt, start);
            }
        };

        machine.advance(CaseState::Comparing);
        let results = case
            .expected
            .iter()
            .zip(extractions)
            .map(|(expected, extraction)| {
                ComparisonResult::compared(&case.id, expected, extraction.value, extraction.note)
            })
            .collect();
        machine.advance(CaseState::Done);
        CaseReport::new(
            &case.id,
            CaseState::Done,
            None,
            attempt,
            duration_ms(start.elapsed()),
            results,
        )
    }

    fn with_queries(&self, mut script: Script, case: &VerificationCase) -> Script {
        for query in self.extractor.queries(case) {
            script.push(query);
        }
        script
    }

    /// One acquire-and-run attempt. The lease is released before returning.
    fn attempt(
        &self,
        machine: &mut CaseMachine,
        script: &Script,
    ) -> Result<ExecutionTrace, AttemptError> {
        let mut lease = self.pool.acquire().map_err(AttemptError::Pool)?;
        machine.advance(CaseState::Running);
        self.runner.run(&mut lease, script).map_err(AttemptError::Run)
    }
}

fn failed_report(
    case: &VerificationCase,
    failure: state::CaseFailure,
    verdict: Verdict,
    attempts: u32,
    start: Instant,
) -> CaseReport {
    let note = format!("{}: {}", failure.kind.as_str(), failure.message);
    let results = case
        .expected
        .iter()
        .map(|expected| ComparisonResult::unavailable(&case.id, expected, verdict, note.clone()))
        .collect();
    CaseReport::new(
        &case.id,
        CaseState::Failed,
        Some(failure),
        attempts,
        duration_ms(start.elapsed()),
        results,
    )
}
