//! Per-command cancellation and deadline propagation.

use std::time::Duration;

use tokio::{sync::watch, time::Instant};

/// Carries the lifecycle cancel signal and an optional deadline into
/// collaborator calls.
#[derive(Debug, Clone)]
pub struct CommandContext {
    cancel_rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl CommandContext {
    pub fn new(cancel_rx: watch::Receiver<bool>) -> Self {
        Self {
            cancel_rx,
            deadline: None,
        }
    }

    /// A context that is never cancelled and has no deadline.
    pub fn detached() -> Self {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        Self::new(cancel_rx)
    }

    /// Derives a child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) => existing.min(candidate),
            None => candidate,
        };
        Self {
            cancel_rx: self.cancel_rx.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Resolves once cancellation is raised. Pends forever if the sender is
    /// gone without ever cancelling.
    pub async fn cancelled(&self) {
        let mut cancel_rx = self.cancel_rx.clone();
        let sender_closed = cancel_rx.wait_for(|cancelled| *cancelled).await.is_err();
        if sender_closed {
            std::future::pending::<()>().await;
        }
    }

    /// Resolves once the deadline passes. Pends forever without a deadline.
    pub async fn deadline_elapsed(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }
}
