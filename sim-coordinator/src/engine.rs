//! Test-phase execution engine.
//!
//! [`RunSuiteTask`] drives every test of the suite through the phases in
//! [`TestPhase`] order, one test at a time or all tests concurrently. In
//! parallel mode the phases up to the configured sync boundary are held at a
//! [`PhaseBarrier`] until every test has completed them.
//!
//! A test that is aborted, either by fail-fast or because one of its workers
//! died, skips straight to the teardown phases.

use crate::error::DispatchResult;
use crate::failure::{FailureContainer, FailureListener};
use crate::listeners::{sleep_abortable, AbortSignal, PhaseBarrier, TestPhaseListeners, WaitOutcome};
use crate::registry::{ComponentRegistry, TestData};
use crate::remote_client::RemoteDispatch;
use futures_util::future::join_all;
use sim_core::RunConfiguration;
use sim_types::{FailureRecord, Operation, TestPhase};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(180);

/// Turns critical failures into abort signals.
struct AbortController {
    fail_fast: bool,
    global: AbortSignal,
    tests: BTreeMap<String, AbortSignal>,
}

impl AbortController {
    fn new(fail_fast: bool, tests: &[TestData]) -> Self {
        Self {
            fail_fast,
            global: AbortSignal::new(),
            tests: tests
                .iter()
                .map(|t| (t.test_case.id.clone(), AbortSignal::new()))
                .collect(),
        }
    }

    fn test_signal(&self, test_id: &str) -> AbortSignal {
        self.tests.get(test_id).cloned().unwrap_or_default()
    }
}

impl FailureListener for AbortController {
    fn on_failure(&self, failure: &FailureRecord, is_critical: bool) {
        if !is_critical {
            return;
        }
        if self.fail_fast && !self.global.is_triggered() {
            tracing::warn!("Critical failure with fail-fast enabled, aborting all tests");
            self.global.trigger();
        }
        // A dead worker never reports completion, so the tests it takes part
        // in cannot finish.
        if failure.failure_type.is_worker_gone() {
            match failure.test_id.as_deref().and_then(|id| self.tests.get(id)) {
                Some(signal) => signal.trigger(),
                None => self.tests.values().for_each(AbortSignal::trigger),
            }
        }
    }
}

/// Runs a test suite against the registered workers.
pub struct RunSuiteTask {
    config: Arc<RunConfiguration>,
    registry: Arc<ComponentRegistry>,
    failures: Arc<FailureContainer>,
    listeners: Arc<TestPhaseListeners>,
    dispatch: Arc<dyn RemoteDispatch>,
    teardown_timeout: Duration,
}

impl std::fmt::Debug for RunSuiteTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSuiteTask")
            .field("config", &self.config)
            .field("teardown_timeout", &self.teardown_timeout)
            .finish_non_exhaustive()
    }
}

impl RunSuiteTask {
    /// Create the task.
    pub fn new(
        config: Arc<RunConfiguration>,
        registry: Arc<ComponentRegistry>,
        failures: Arc<FailureContainer>,
        listeners: Arc<TestPhaseListeners>,
        dispatch: Arc<dyn RemoteDispatch>,
    ) -> Self {
        Self {
            config,
            registry,
            failures,
            listeners,
            dispatch,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }

    /// Bound on each teardown wait of an aborted test.
    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    /// Run every test, then terminate the workers.
    ///
    /// An error from creating a test is returned after the workers have
    /// been terminated.
    pub async fn run(&self) -> DispatchResult<()> {
        let tests = self.registry.tests();
        let controller = Arc::new(AbortController::new(self.config.fail_fast, &tests));
        self.failures.add_listener(controller.clone());
        for failure in self.failures.failures() {
            controller.on_failure(&failure, self.failures.is_critical(failure.failure_type));
        }

        let mode = if self.config.parallel { "parallel" } else { "sequential" };
        self.dispatch
            .log_on_all_agents(&format!(
                "Starting run of {} tests ({}, duration={}s)",
                tests.len(),
                mode,
                self.config.duration.as_secs()
            ))
            .await;
        let started = Instant::now();

        let result = if self.config.parallel {
            self.run_parallel(&tests, &controller).await
        } else {
            self.run_sequential(&tests, &controller).await
        };

        self.dispatch.terminate_workers(true).await;
        self.dispatch
            .log_on_all_agents(&format!(
                "Finished run of {} tests in {}s",
                tests.len(),
                started.elapsed().as_secs()
            ))
            .await;
        result
    }

    async fn run_sequential(
        &self,
        tests: &[TestData],
        controller: &AbortController,
    ) -> DispatchResult<()> {
        for (position, test) in tests.iter().enumerate() {
            self.runner(test, controller, None).run().await?;

            let remaining = tests.len() - position - 1;
            if self.config.fail_fast && self.failures.has_critical_failure() && remaining > 0 {
                tracing::warn!(
                    "Aborting suite after {} due to critical failure, skipping {} tests",
                    test.test_case.id,
                    remaining
                );
                break;
            }
        }
        Ok(())
    }

    async fn run_parallel(
        &self,
        tests: &[TestData],
        controller: &AbortController,
    ) -> DispatchResult<()> {
        let barrier = Arc::new(PhaseBarrier::new(
            tests.iter().map(|test| test.test_case.id.clone()),
        ));
        let runs = tests
            .iter()
            .map(|test| self.runner(test, controller, Some(barrier.clone())))
            .collect::<Vec<_>>();
        let results = join_all(runs.iter().map(|runner| runner.run())).await;
        results.into_iter().collect()
    }

    fn runner<'a>(
        &'a self,
        test: &TestData,
        controller: &AbortController,
        barrier: Option<Arc<PhaseBarrier>>,
    ) -> TestCaseRunner<'a> {
        TestCaseRunner {
            test: test.clone(),
            config: &self.config,
            registry: &self.registry,
            listeners: &self.listeners,
            dispatch: self.dispatch.as_ref(),
            global_abort: controller.global.clone(),
            test_abort: controller.test_signal(&test.test_case.id),
            barrier,
            left_barrier: AtomicBool::new(false),
            teardown_timeout: self.teardown_timeout,
        }
    }
}

/// Drives a single test through its phases.
struct TestCaseRunner<'a> {
    test: TestData,
    config: &'a RunConfiguration,
    registry: &'a ComponentRegistry,
    listeners: &'a TestPhaseListeners,
    dispatch: &'a dyn RemoteDispatch,
    global_abort: AbortSignal,
    test_abort: AbortSignal,
    barrier: Option<Arc<PhaseBarrier>>,
    left_barrier: AtomicBool,
    teardown_timeout: Duration,
}

impl TestCaseRunner<'_> {
    fn id(&self) -> &str {
        &self.test.test_case.id
    }

    fn is_aborted(&self) -> bool {
        self.global_abort.is_triggered() || self.test_abort.is_triggered()
    }

    fn leave_barrier(&self) {
        if let Some(barrier) = &self.barrier {
            if !self.left_barrier.swap(true, Ordering::SeqCst) {
                barrier.leave(self.id());
            }
        }
    }

    async fn run(&self) -> DispatchResult<()> {
        let result = self.run_phases().await;
        if result.is_err() {
            self.leave_barrier();
        }
        result
    }

    async fn run_phases(&self) -> DispatchResult<()> {
        self.dispatch
            .log_on_all_agents(&format!("Starting test {}", self.id()))
            .await;
        self.dispatch
            .send_to_all_workers(&Operation::CreateTest {
                test_index: self.test.test_index,
                test_case: self.test.test_case.clone(),
            })
            .await?;

        let mut aborted = self.is_aborted();
        if aborted {
            tracing::warn!(
                "Test {} aborted before its first phase, proceeding to teardown",
                self.id()
            );
            self.leave_barrier();
        }
        for phase in TestPhase::ALL {
            if phase.is_verify() && !self.config.verify_enabled {
                continue;
            }
            if aborted && !phase.is_teardown() {
                continue;
            }

            let outcome = self.execute_phase(phase, aborted).await?;
            if !aborted && (outcome == WaitOutcome::Aborted || self.is_aborted()) {
                tracing::warn!("Test {} aborted in {}, proceeding to teardown", self.id(), phase);
                aborted = true;
                self.leave_barrier();
                continue;
            }

            if !aborted && self.config.is_synced(phase) {
                if let Some(barrier) = &self.barrier {
                    let aborts = [&self.global_abort, &self.test_abort];
                    if barrier.arrive_and_wait(self.id(), phase, &aborts).await
                        == WaitOutcome::Aborted
                    {
                        tracing::warn!("Test {} aborted at {} barrier", self.id(), phase);
                        aborted = true;
                        self.leave_barrier();
                    }
                }
            }
        }

        if aborted {
            tracing::warn!("Test {} was aborted", self.id());
        } else {
            tracing::info!("Test {} completed", self.id());
        }
        Ok(())
    }

    async fn execute_phase(&self, phase: TestPhase, aborted: bool) -> DispatchResult<WaitOutcome> {
        tracing::info!("Test {} starting {}", self.id(), phase.desc());
        match phase {
            TestPhase::Run => self.run_timed(TestPhase::Run, self.config.duration).await,
            TestPhase::LocalWarmup if !self.config.warmup.is_zero() => {
                self.run_timed(TestPhase::LocalWarmup, self.config.warmup).await
            }
            _ => {
                let operation = Operation::StartTestPhase { phase };
                if phase.is_global() {
                    self.dispatch
                        .send_to_test_on_first_worker(self.id(), &operation)
                        .await?;
                } else {
                    self.dispatch
                        .send_to_test_on_all_workers(self.id(), &operation)
                        .await?;
                }
                Ok(self.await_phase(phase, aborted).await)
            }
        }
    }

    /// Start the run (or a timed warmup), let it go for `duration`, stop it
    /// and wait for the workers to report the phase complete.
    async fn run_timed(&self, phase: TestPhase, duration: Duration) -> DispatchResult<WaitOutcome> {
        let warmup = phase != TestPhase::Run;
        let targets = self.config.target.select(&self.registry.worker_roles());
        self.dispatch
            .send_to_test_on_all_workers(self.id(), &Operation::StartTest { warmup, targets })
            .await?;

        let aborts = [&self.global_abort, &self.test_abort];
        let limit = (!duration.is_zero()).then_some(duration);
        let outcome = if self.config.wait_for_test_case && !warmup {
            self.listeners
                .await_phase(self.test.test_index, phase, self.expected(phase), limit, &aborts)
                .await
        } else {
            match limit {
                Some(duration) => sleep_abortable(duration, &aborts).await,
                None => WaitOutcome::Completed,
            }
        };
        if outcome == WaitOutcome::TimedOut {
            tracing::info!("Test {} reached its duration limit", self.id());
        }

        if limit.is_some() {
            self.dispatch
                .send_to_test_on_all_workers(self.id(), &Operation::StopTest)
                .await?;
        }
        if outcome == WaitOutcome::Aborted {
            return Ok(outcome);
        }
        Ok(self.await_phase(phase, false).await)
    }

    fn expected(&self, phase: TestPhase) -> usize {
        if phase.is_global() {
            1
        } else {
            self.registry.worker_count()
        }
    }

    async fn await_phase(&self, phase: TestPhase, aborted: bool) -> WaitOutcome {
        let expected = self.expected(phase);
        let outcome = if aborted {
            // Abort signals have already fired; bound the wait instead.
            self.listeners
                .await_phase(self.test.test_index, phase, expected, Some(self.teardown_timeout), &[])
                .await
        } else {
            let aborts = [&self.global_abort, &self.test_abort];
            self.listeners
                .await_phase(self.test.test_index, phase, expected, None, &aborts)
                .await
        };
        match outcome {
            WaitOutcome::Completed => {
                tracing::info!("Test {} completed {}", self.id(), phase.desc())
            }
            WaitOutcome::TimedOut => {
                tracing::warn!("Test {} timed out waiting for {}", self.id(), phase.desc())
            }
            WaitOutcome::Aborted => {}
        }
        outcome
    }
}
