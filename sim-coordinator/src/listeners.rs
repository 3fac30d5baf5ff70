//! Phase completion signals, abort signals and the cross-test barrier.
//!
//! Every blocking wait in the phase engine resolves to a [`WaitOutcome`], so
//! a legitimate completion can be told apart from a timeout or an abort.

use dashmap::DashMap;
use sim_types::TestPhase;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited signal fired.
    Completed,
    /// The time limit elapsed first.
    TimedOut,
    /// An abort signal fired first.
    Aborted,
}

impl WaitOutcome {
    /// True for [`WaitOutcome::Completed`].
    pub fn is_completed(self) -> bool {
        self == WaitOutcome::Completed
    }
}

/// One-shot, cloneable cancellation flag.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Later calls have no effect.
    pub fn trigger(&self) {
        self.tx.send_if_modified(|aborted| {
            let changed = !*aborted;
            *aborted = true;
            changed
        });
    }

    /// True once triggered.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal fires.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for can only end by matching.
        let _ = rx.wait_for(|aborted| *aborted).await;
    }
}

type PhaseCounts = BTreeMap<TestPhase, usize>;

/// Per-test completion counters, keyed by `(test index, phase)`.
#[derive(Debug, Default)]
pub struct TestPhaseListeners {
    tests: DashMap<u32, Arc<watch::Sender<PhaseCounts>>>,
}

impl TestPhaseListeners {
    /// Create an empty listener set.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, test_index: u32) -> Arc<watch::Sender<PhaseCounts>> {
        self.tests
            .entry(test_index)
            .or_insert_with(|| Arc::new(watch::channel(PhaseCounts::new()).0))
            .clone()
    }

    /// Count one completion notification.
    pub fn update_phase_completion(&self, test_index: u32, phase: TestPhase) {
        tracing::debug!("Test {} completed {}", test_index, phase);
        self.sender(test_index).send_modify(|counts| {
            *counts.entry(phase).or_insert(0) += 1;
        });
    }

    /// Wait until `expected` completions of `phase` have arrived.
    ///
    /// With a `timeout` the wait gives up after that long. Any of the
    /// `aborts` firing ends the wait early.
    pub async fn await_phase(
        &self,
        test_index: u32,
        phase: TestPhase,
        expected: usize,
        timeout: Option<Duration>,
        aborts: &[&AbortSignal],
    ) -> WaitOutcome {
        let mut rx = self.sender(test_index).subscribe();
        let completed = async move {
            let _ = rx
                .wait_for(|counts| counts.get(&phase).copied().unwrap_or(0) >= expected)
                .await;
        };
        wait_abortable(completed, timeout, aborts).await
    }
}

/// Sleep for `duration` unless one of `aborts` fires first.
pub async fn sleep_abortable(duration: Duration, aborts: &[&AbortSignal]) -> WaitOutcome {
    wait_abortable(tokio::time::sleep(duration), None, aborts).await
}

/// Run `signal` against a timeout and a set of abort signals.
async fn wait_abortable<F>(
    signal: F,
    timeout: Option<Duration>,
    aborts: &[&AbortSignal],
) -> WaitOutcome
where
    F: std::future::Future<Output = ()>,
{
    if aborts.iter().any(|a| a.is_triggered()) {
        return WaitOutcome::Aborted;
    }
    let aborted = async {
        if aborts.is_empty() {
            std::future::pending::<()>().await;
        } else {
            let triggered = aborts.iter().map(|a| Box::pin(a.triggered()));
            futures_util::future::select_all(triggered).await;
        }
    };
    let limit = async {
        match timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = signal => WaitOutcome::Completed,
        _ = limit => WaitOutcome::TimedOut,
        _ = aborted => WaitOutcome::Aborted,
    }
}

#[derive(Debug, Clone, Default)]
struct BarrierState {
    parties: BTreeSet<String>,
    arrivals: BTreeMap<TestPhase, BTreeSet<String>>,
}

impl BarrierState {
    fn released(&self, phase: TestPhase) -> bool {
        self.arrivals
            .get(&phase)
            .is_some_and(|arrived| self.parties.is_subset(arrived))
    }
}

/// Barrier that holds parallel tests at a phase until all have reached it.
///
/// Parties are identified by test id. A test that aborts calls
/// [`PhaseBarrier::leave`]; its arrivals are withdrawn so the remaining
/// tests still wait for each other and no longer wait for it.
#[derive(Debug)]
pub struct PhaseBarrier {
    tx: watch::Sender<BarrierState>,
}

impl PhaseBarrier {
    /// Barrier for the given tests.
    pub fn new<I, S>(parties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, _) = watch::channel(BarrierState {
            parties: parties.into_iter().map(Into::into).collect(),
            arrivals: BTreeMap::new(),
        });
        Self { tx }
    }

    /// Arrive at `phase` as `party` and wait for the other tests.
    pub async fn arrive_and_wait(
        &self,
        party: &str,
        phase: TestPhase,
        aborts: &[&AbortSignal],
    ) -> WaitOutcome {
        self.tx.send_modify(|state| {
            state
                .arrivals
                .entry(phase)
                .or_default()
                .insert(party.to_string());
        });
        let mut rx = self.tx.subscribe();
        let released = async move {
            let _ = rx.wait_for(|state| state.released(phase)).await;
        };
        wait_abortable(released, None, aborts).await
    }

    /// Stop taking part; later barriers no longer wait for `party`.
    pub fn leave(&self, party: &str) {
        self.tx.send_modify(|state| {
            state.parties.remove(party);
            for arrived in state.arrivals.values_mut() {
                arrived.remove(party);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn phase_completes_after_expected_count() {
        let listeners = Arc::new(TestPhaseListeners::new());
        let waiter = {
            let listeners = listeners.clone();
            tokio::spawn(async move {
                listeners
                    .await_phase(1, TestPhase::Setup, 2, Some(Duration::from_secs(5)), &[])
                    .await
            })
        };

        listeners.update_phase_completion(1, TestPhase::Setup);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        listeners.update_phase_completion(1, TestPhase::Setup);

        assert_eq!(waiter.await.unwrap(), WaitOutcome::Completed);
        assert_eq!(
            listeners
                .await_phase(2, TestPhase::Setup, 1, Some(Duration::from_millis(10)), &[])
                .await,
            WaitOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn completion_before_wait_is_not_lost() {
        let listeners = TestPhaseListeners::new();
        listeners.update_phase_completion(3, TestPhase::Run);
        let outcome = listeners
            .await_phase(3, TestPhase::Run, 1, Some(Duration::from_millis(10)), &[])
            .await;
        assert_eq!(outcome, WaitOutcome::Completed);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let listeners = TestPhaseListeners::new();
        let outcome = listeners
            .await_phase(1, TestPhase::Run, 1, Some(Duration::from_millis(20)), &[])
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn abort_wakes_a_blocked_wait() {
        let listeners = Arc::new(TestPhaseListeners::new());
        let abort = AbortSignal::new();
        let waiter = {
            let listeners = listeners.clone();
            let abort = abort.clone();
            tokio::spawn(async move {
                listeners
                    .await_phase(1, TestPhase::Run, 1, None, &[&abort])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        abort.trigger();
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Aborted);
    }

    #[tokio::test]
    async fn abort_interrupts_sleep() {
        let abort = AbortSignal::new();
        abort.trigger();
        abort.trigger();
        assert!(abort.is_triggered());
        assert_eq!(
            sleep_abortable(Duration::from_secs(60), &[&abort]).await,
            WaitOutcome::Aborted
        );
        assert_eq!(
            sleep_abortable(Duration::from_millis(1), &[&AbortSignal::new()]).await,
            WaitOutcome::Completed
        );
    }

    #[tokio::test]
    async fn abortable_sleep_watches_every_signal() {
        let first = AbortSignal::new();
        let second = AbortSignal::new();
        let sleeper = {
            let (first, second) = (first.clone(), second.clone());
            tokio::spawn(async move {
                sleep_abortable(Duration::from_secs(60), &[&first, &second]).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        second.trigger();
        assert_eq!(sleeper.await.unwrap(), WaitOutcome::Aborted);
        assert_eq!(
            sleep_abortable(Duration::from_millis(1), &[]).await,
            WaitOutcome::Completed
        );
    }

    #[tokio::test]
    async fn barrier_releases_when_all_arrive() {
        let barrier = Arc::new(PhaseBarrier::new(["a", "b"]));
        let first = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.arrive_and_wait("a", TestPhase::Setup, &[]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!first.is_finished());

        let second = barrier.arrive_and_wait("b", TestPhase::Setup, &[]).await;
        assert_eq!(second, WaitOutcome::Completed);
        assert_eq!(first.await.unwrap(), WaitOutcome::Completed);
    }

    #[tokio::test]
    async fn leaving_releases_the_barrier() {
        let barrier = Arc::new(PhaseBarrier::new(["a", "b"]));
        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.arrive_and_wait("a", TestPhase::Run, &[]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        barrier.leave("b");
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Completed);
    }

    #[tokio::test]
    async fn leaver_arrival_does_not_release_the_others() {
        let barrier = Arc::new(PhaseBarrier::new(["a", "b", "c"]));
        let abort_a = AbortSignal::new();
        let a = {
            let (barrier, abort_a) = (barrier.clone(), abort_a.clone());
            tokio::spawn(async move {
                barrier
                    .arrive_and_wait("a", TestPhase::Setup, &[&abort_a])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        abort_a.trigger();
        assert_eq!(a.await.unwrap(), WaitOutcome::Aborted);
        barrier.leave("a");

        let b = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.arrive_and_wait("b", TestPhase::Setup, &[]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!b.is_finished(), "b passed Setup before c arrived");

        let c = barrier.arrive_and_wait("c", TestPhase::Setup, &[]).await;
        assert_eq!(c, WaitOutcome::Completed);
        assert_eq!(b.await.unwrap(), WaitOutcome::Completed);
    }

    #[tokio::test]
    async fn leaving_twice_is_harmless() {
        let barrier = PhaseBarrier::new(["a", "b"]);
        barrier.leave("b");
        barrier.leave("b");
        barrier.leave("unknown");
        assert_eq!(
            barrier.arrive_and_wait("a", TestPhase::Setup, &[]).await,
            WaitOutcome::Completed
        );
    }
}
