//! Startup, event dispatch and graceful shutdown of the command session.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::{JoinHandle, JoinSet},
};

use crate::{
    admission_gate::{AdmissionGate, DrainOutcome},
    allow_list::AllowList,
    collaborators::{CommandSource, InboundCommand, IssueTracker},
    command_context::CommandContext,
    command_session::{CommandEvent, CommandOutcome, CommandSession, CommandSessionConfig},
    credential_registry::CredentialRegistry,
    credential_storage::{CredentialStorage, StorageError},
};

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct SessionLifecycleConfig {
    pub drain_timeout: Duration,
    /// Extra wait after raising cancellation on a timed-out drain.
    pub cancel_grace: Duration,
}

impl Default for SessionLifecycleConfig {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every admitted command released its permit.
    pub drained: bool,
    /// The drain timed out and cancellation was raised.
    pub cancelled: bool,
    pub remaining_in_flight: usize,
    /// The final registry flush succeeded.
    pub flushed: bool,
}

pub struct SessionLifecycle {
    session: Arc<CommandSession>,
    config: SessionLifecycleConfig,
    cancel_tx: watch::Sender<bool>,
}

impl SessionLifecycle {
    /// Loads the registry and assembles the session. A corrupt credential
    /// store is returned as an error; a missing one starts empty.
    pub fn start(
        storage: Arc<dyn CredentialStorage>,
        tracker: Arc<dyn IssueTracker>,
        allow_list: Arc<AllowList>,
        session_config: CommandSessionConfig,
        config: SessionLifecycleConfig,
    ) -> Result<Self, StorageError> {
        let registry = Arc::new(CredentialRegistry::load(storage)?);
        let session = CommandSession::new(
            session_config,
            AdmissionGate::new(),
            registry,
            tracker,
            allow_list,
        );
        Ok(Self::from_session(Arc::new(session), config))
    }

    pub fn from_session(session: Arc<CommandSession>, config: SessionLifecycleConfig) -> Self {
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        Self {
            session,
            config,
            cancel_tx,
        }
    }

    pub fn session(&self) -> &Arc<CommandSession> {
        &self.session
    }

    pub fn gate(&self) -> &AdmissionGate {
        self.session.gate()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Handles one inbound command on its own task.
    pub fn dispatch(&self, command: InboundCommand) -> JoinHandle<CommandOutcome> {
        tokio::spawn(self.command_task(command))
    }

    fn command_task(
        &self,
        command: InboundCommand,
    ) -> impl Future<Output = CommandOutcome> + Send + 'static {
        let session = Arc::clone(&self.session);
        let event =
            CommandEvent::from_inbound(command, CommandContext::new(self.cancel_tx.subscribe()));
        async move { session.handle(event).await }
    }

    /// Reads commands until `shutdown` resolves or the source ends, then
    /// drains, flushes and disconnects.
    pub async fn run<S>(&self, source: &mut S, shutdown: impl Future<Output = ()>) -> ShutdownReport
    where
        S: CommandSource + ?Sized,
    {
        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received");
                    break;
                }
                next = source.next_command() => match next {
                    Ok(Some(command)) => {
                        tasks.spawn(self.command_task(command));
                    }
                    Ok(None) => {
                        tracing::info!("command source closed");
                        break;
                    }
                    Err(error) => {
                        tracing::warn!(error = %format!("{error:#}"), "command source failed");
                        break;
                    }
                },
            }
            while let Some(joined) = tasks.try_join_next() {
                log_task_result(joined);
            }
        }

        let report = self.shutdown().await;
        // Gated work is drained by now; ungated replies and late rejections
        // get one grace period to go out.
        let settled = tokio::time::timeout(self.config.cancel_grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_task_result(joined);
            }
        })
        .await;
        if settled.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                "aborting commands that outlived shutdown"
            );
            tasks.shutdown().await;
        }
        if let Err(error) = source.disconnect().await {
            tracing::warn!(error = %format!("{error:#}"), "chat transport disconnect failed");
        }
        report
    }

    /// Stops admission, waits for in-flight commands, then flushes the registry.
    pub async fn shutdown(&self) -> ShutdownReport {
        let gate = self.session.gate();
        gate.begin_drain();
        let mut report = ShutdownReport::default();

        match gate.await_drain(self.config.drain_timeout).await {
            DrainOutcome::Drained => report.drained = true,
            DrainOutcome::TimedOut { in_flight } => {
                tracing::warn!(
                    in_flight,
                    drain_timeout = ?self.config.drain_timeout,
                    "drain timed out; cancelling in-flight commands"
                );
                self.cancel_tx.send_replace(true);
                report.cancelled = true;
                match gate.await_drain(self.config.cancel_grace).await {
                    DrainOutcome::Drained => report.drained = true,
                    DrainOutcome::TimedOut { in_flight } => {
                        tracing::warn!(in_flight, "commands still running after cancellation");
                        report.remaining_in_flight = in_flight;
                    }
                }
            }
        }

        match self.session.registry().flush_all().await {
            Ok(outcome) => {
                tracing::debug!(?outcome, "final credential flush complete");
                report.flushed = true;
            }
            Err(error) => {
                tracing::error!(error = %error, "final credential flush failed");
            }
        }
        tracing::info!(
            drained = report.drained,
            cancelled = report.cancelled,
            remaining_in_flight = report.remaining_in_flight,
            flushed = report.flushed,
            "command session stopped"
        );
        report
    }
}

fn log_task_result(joined: Result<CommandOutcome, tokio::task::JoinError>) {
    if let Err(error) = joined {
        if error.is_panic() {
            tracing::error!(error = %error, "command task panicked");
        }
    }
}
