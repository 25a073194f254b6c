//! Admission control for in-flight commands.
//!
//! The gate admits work while open, refuses new work once draining starts,
//! and reports drained when the in-flight count reaches zero. Check-and-admit
//! and leave/transition happen under one lock so no admission can slip past
//! the start of a drain.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Open,
    Draining,
    Closed,
}

impl GateState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("admission rejected: gate is {}", .state.as_str())]
pub struct AdmissionRejected {
    pub state: GateState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    TimedOut { in_flight: usize },
}

#[derive(Debug)]
struct GateCounters {
    state: GateState,
    in_flight: usize,
}

#[derive(Debug)]
struct GateInner {
    counters: Mutex<GateCounters>,
    state_tx: watch::Sender<GateState>,
}

impl GateInner {
    fn counters(&self) -> std::sync::MutexGuard<'_, GateCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn leave(&self) {
        let mut counters = self.counters();
        counters.in_flight = counters.in_flight.saturating_sub(1);
        if counters.state == GateState::Draining && counters.in_flight == 0 {
            counters.state = GateState::Closed;
            self.state_tx.send_replace(GateState::Closed);
            tracing::debug!("admission gate drained");
        }
    }
}

/// Shared handle to the gate. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionGate {
    pub fn new() -> Self {
        let (state_tx, _state_rx) = watch::channel(GateState::Open);
        Self {
            inner: Arc::new(GateInner {
                counters: Mutex::new(GateCounters {
                    state: GateState::Open,
                    in_flight: 0,
                }),
                state_tx,
            }),
        }
    }

    /// Admits one unit of work. The returned permit leaves the gate on drop.
    pub fn try_enter(&self) -> Result<AdmissionPermit, AdmissionRejected> {
        let mut counters = self.inner.counters();
        if counters.state != GateState::Open {
            return Err(AdmissionRejected {
                state: counters.state,
            });
        }
        counters.in_flight += 1;
        Ok(AdmissionPermit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Stops admitting new work. Idempotent.
    pub fn begin_drain(&self) {
        let mut counters = self.inner.counters();
        if counters.state != GateState::Open {
            return;
        }
        counters.state = if counters.in_flight == 0 {
            GateState::Closed
        } else {
            GateState::Draining
        };
        self.inner.state_tx.send_replace(counters.state);
        tracing::info!(
            in_flight = counters.in_flight,
            state = counters.state.as_str(),
            "admission gate stopped admitting commands"
        );
    }

    /// Waits until every admitted permit has been released, or `timeout`.
    ///
    /// Before [`AdmissionGate::begin_drain`] this waits for the drain to start
    /// as well, since an open gate is never drained.
    pub async fn await_drain(&self, timeout: Duration) -> DrainOutcome {
        let mut state_rx = self.inner.state_tx.subscribe();
        let closed = tokio::time::timeout(timeout, async move {
            state_rx
                .wait_for(|state| *state == GateState::Closed)
                .await
                .is_ok()
        })
        .await;
        match closed {
            Ok(true) => DrainOutcome::Drained,
            _ => DrainOutcome::TimedOut {
                in_flight: self.in_flight(),
            },
        }
    }

    pub fn state(&self) -> GateState {
        self.inner.counters().state
    }

    pub fn in_flight(&self) -> usize {
        self.inner.counters().in_flight
    }
}

/// Proof of admission. Released exactly once, on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    inner: Arc<GateInner>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.inner.leave();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::{AdmissionGate, DrainOutcome, GateState};

    #[test]
    fn unit_open_gate_admits_and_counts_permits() {
        let gate = AdmissionGate::new();
        let first = gate.try_enter().expect("admit");
        let second = gate.try_enter().expect("admit");
        assert_eq!(gate.in_flight(), 2);
        drop(first);
        assert_eq!(gate.in_flight(), 1);
        drop(second);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.state(), GateState::Open);
    }

    #[test]
    fn unit_begin_drain_with_nothing_in_flight_closes_immediately() {
        let gate = AdmissionGate::new();
        gate.begin_drain();
        assert_eq!(gate.state(), GateState::Closed);
        let rejected = gate.try_enter().expect_err("closed gate");
        assert_eq!(rejected.state, GateState::Closed);
    }

    #[test]
    fn functional_begin_drain_is_idempotent() {
        let gate = AdmissionGate::new();
        let permit = gate.try_enter().expect("admit");
        gate.begin_drain();
        gate.begin_drain();
        assert_eq!(gate.state(), GateState::Draining);
        drop(permit);
        assert_eq!(gate.state(), GateState::Closed);
        gate.begin_drain();
        assert_eq!(gate.state(), GateState::Closed);
    }

    #[tokio::test]
    async fn functional_await_drain_returns_after_last_permit_released() {
        let gate = AdmissionGate::new();
        let permits = (0..3)
            .map(|_| gate.try_enter().expect("admit"))
            .collect::<Vec<_>>();
        gate.begin_drain();
        assert!(gate.try_enter().is_err());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.await_drain(Duration::from_secs(5)).await })
        };
        for permit in permits {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(!waiter.is_finished());
            drop(permit);
        }
        assert_eq!(waiter.await.expect("join"), DrainOutcome::Drained);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn regression_await_drain_times_out_with_stuck_permit() {
        let gate = AdmissionGate::new();
        let _stuck = gate.try_enter().expect("admit");
        gate.begin_drain();
        let outcome = gate.await_drain(Duration::from_millis(20)).await;
        assert_eq!(outcome, DrainOutcome::TimedOut { in_flight: 1 });
    }

    #[tokio::test]
    async fn unit_await_drain_after_close_returns_immediately() {
        let gate = AdmissionGate::new();
        gate.begin_drain();
        let outcome = gate.await_drain(Duration::from_millis(1)).await;
        assert_eq!(outcome, DrainOutcome::Drained);
    }

    #[test]
    fn integration_no_admission_is_observed_after_begin_drain_returns() {
        let gate = AdmissionGate::new();
        let drained = Arc::new(AtomicBool::new(false));
        let late_admissions = Arc::new(AtomicUsize::new(0));
        let workers = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let drained = Arc::clone(&drained);
                let late_admissions = Arc::clone(&late_admissions);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        // Read the flag first: if it was set before the attempt,
                        // any admission is a violation.
                        let drain_started = drained.load(Ordering::SeqCst);
                        if let Ok(permit) = gate.try_enter() {
                            if drain_started {
                                late_admissions.fetch_add(1, Ordering::SeqCst);
                            }
                            drop(permit);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        std::thread::sleep(Duration::from_millis(1));
        gate.begin_drain();
        drained.store(true, Ordering::SeqCst);

        for worker in workers {
            worker.join().expect("worker");
        }
        assert_eq!(late_admissions.load(Ordering::SeqCst), 0);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.state(), GateState::Closed);
    }
}
