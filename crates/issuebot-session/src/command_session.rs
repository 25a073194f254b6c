//! Per-event command handling.
//!
//! Every gated command holds an [`AdmissionPermit`] for its whole execution,
//! including the upstream token check performed by `register`. Credential
//! resolution happens before argument parsing. The session is the only place
//! that turns typed failures into user-facing replies.

use std::{future::Future, sync::Arc, time::Duration};

use crate::{
    admission_gate::{AdmissionGate, AdmissionPermit},
    allow_list::AllowList,
    argument_parser::parse_issue_arguments,
    collaborators::{InboundCommand, IssueRequest, IssueTracker, ReplySink, TrackerError},
    command_context::CommandContext,
    command_router::{parse_bot_command, render_help_text, BotCommand},
    credential::{CredentialSecret, UserId},
    credential_registry::{CredentialRegistry, FlushTicket, RegistryError},
};


pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(8);

const SHUTTING_DOWN_REPLY: &str = "I'm shutting down, please retry shortly.";
const CANCELLED_REPLY: &str =
    "I'm shutting down and your request was interrupted, please retry shortly.";
const NOT_AUTHORIZED_REPLY: &str = "You are not authorized to use this bot.";
const NOT_REGISTERED_REPLY: &str = "You must register first, see `help` command";
const USAGE_REPLY: &str = "Usage: new \"repo\" \"issue title\" \"issue body\"";
const TRACKER_FAILED_REPLY: &str =
    "There was an error with the GitHub interface... Check 1) the repo name 2) the logs";
const TIMED_OUT_REPLY: &str = "Your request timed out";
const ALREADY_REGISTERED_REPLY: &str = "User already registered, please unregister first.";
const MISSING_TOKEN_REPLY: &str = "You must specify a token";
const INVALID_TOKEN_REPLY: &str = "Token didn't work";
const UNREGISTERED_REPLY: &str = "If you had registered, you are no longer.";

#[derive(Debug, Clone)]
pub struct CommandSessionConfig {
    /// Owner used when the repository field is a bare name.
    pub default_owner: String,
    pub command_timeout: Duration,
}

impl CommandSessionConfig {
    pub fn new(default_owner: impl Into<String>) -> Self {
        Self {
            default_owner: default_owner.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// One inbound command bound to its context and reply sink.
#[derive(Clone)]
pub struct CommandEvent {
    pub user_id: UserId,
    pub text: String,
    pub context: CommandContext,
    pub reply: Arc<dyn ReplySink>,
}

impl CommandEvent {
    pub fn from_inbound(command: InboundCommand, context: CommandContext) -> Self {
        Self {
            user_id: command.user_id,
            text: command.text,
            context,
            reply: command.reply,
        }
    }
}

impl std::fmt::Debug for CommandEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEvent")
            .field("user_id", &self.user_id)
            .field("text_bytes", &self.text.len())
            .field("context", &self.context)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    IssueCreated { url: String },
    Registered { login: String },
    Unregistered,
    HelpShown,
    Usage,
    RejectedShuttingDown,
    NotAuthorized,
    NotRegistered,
    BadArguments,
    AlreadyRegistered,
    MissingToken,
    InvalidToken,
    TimedOut,
    Cancelled,
    TrackerFailed,
}

impl CommandOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IssueCreated { .. } => "issue_created",
            Self::Registered { .. } => "registered",
            Self::Unregistered => "unregistered",
            Self::HelpShown => "help_shown",
            Self::Usage => "usage",
            Self::RejectedShuttingDown => "rejected_shutting_down",
            Self::NotAuthorized => "not_authorized",
            Self::NotRegistered => "not_registered",
            Self::BadArguments => "bad_arguments",
            Self::AlreadyRegistered => "already_registered",
            Self::MissingToken => "missing_token",
            Self::InvalidToken => "invalid_token",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::TrackerFailed => "tracker_failed",
        }
    }
}

enum BoundedCall<T> {
    Completed(Result<T, TrackerError>),
    TimedOut,
    Cancelled,
}

async fn run_bounded<T>(
    ctx: &CommandContext,
    call: impl Future<Output = Result<T, TrackerError>>,
) -> BoundedCall<T> {
    let bounded = tokio::select! {
        biased;
        result = call => BoundedCall::Completed(result),
        _ = ctx.cancelled() => BoundedCall::Cancelled,
        _ = ctx.deadline_elapsed() => BoundedCall::TimedOut,
    };
    match bounded {
        BoundedCall::Completed(Err(error)) => classify_failure(ctx, error),
        other => other,
    }
}

/// A tracker that honours `ctx` fails on its own when the deadline passes or
/// shutdown cancels it; those failures are not tracker errors.
fn classify_failure<T>(ctx: &CommandContext, error: TrackerError) -> BoundedCall<T> {
    if ctx.is_cancelled() {
        tracing::debug!(error = %error, "tracker call ended by cancellation");
        return BoundedCall::Cancelled;
    }
    let deadline_passed = ctx.remaining() == Some(Duration::ZERO);
    if deadline_passed || matches!(error, TrackerError::Cancelled(_)) {
        tracing::debug!(error = %error, "tracker call ended at its deadline");
        return BoundedCall::TimedOut;
    }
    BoundedCall::Completed(Err(error))
}

pub struct CommandSession {
    config: CommandSessionConfig,
    gate: AdmissionGate,
    registry: Arc<CredentialRegistry>,
    tracker: Arc<dyn IssueTracker>,
    allow_list: Arc<AllowList>,
}

impl CommandSession {
    pub fn new(
        config: CommandSessionConfig,
        gate: AdmissionGate,
        registry: Arc<CredentialRegistry>,
        tracker: Arc<dyn IssueTracker>,
        allow_list: Arc<AllowList>,
    ) -> Self {
        Self {
            config,
            gate,
            registry,
            tracker,
            allow_list,
        }
    }

    pub fn config(&self) -> &CommandSessionConfig {
        &self.config
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<CredentialRegistry> {
        &self.registry
    }

    pub fn allow_list(&self) -> &Arc<AllowList> {
        &self.allow_list
    }

    pub async fn handle(&self, event: CommandEvent) -> CommandOutcome {
        let outcome = match parse_bot_command(&event.text) {
            BotCommand::Help => {
                deliver_reply(&event, &render_help_text()).await;
                CommandOutcome::HelpShown
            }
            BotCommand::Unknown { command } => {
                tracing::debug!(user_id = %event.user_id, command = %command, "unknown bot command");
                deliver_reply(&event, &render_help_text()).await;
                CommandOutcome::Usage
            }
            command => match self.gate.try_enter() {
                Ok(permit) => self.handle_admitted(&event, command, permit).await,
                Err(rejected) => {
                    tracing::info!(
                        user_id = %event.user_id,
                        gate_state = rejected.state.as_str(),
                        "command rejected during shutdown"
                    );
                    deliver_error(&event, SHUTTING_DOWN_REPLY).await;
                    CommandOutcome::RejectedShuttingDown
                }
            },
        };
        tracing::debug!(
            user_id = %event.user_id,
            outcome = outcome.as_str(),
            "command handled"
        );
        outcome
    }

    async fn handle_admitted(
        &self,
        event: &CommandEvent,
        command: BotCommand,
        _permit: AdmissionPermit,
    ) -> CommandOutcome {
        if !self.allow_list.permits(&event.user_id) {
            tracing::info!(user_id = %event.user_id, "user is not on the allow-list");
            deliver_error(event, NOT_AUTHORIZED_REPLY).await;
            return CommandOutcome::NotAuthorized;
        }
        match command {
            BotCommand::NewIssue { arguments } => self.create_issue(event, &arguments).await,
            BotCommand::Register { token } => self.register(event, token).await,
            BotCommand::Unregister => self.unregister(event).await,
            BotCommand::Help | BotCommand::Unknown { .. } => {
                deliver_reply(event, &render_help_text()).await;
                CommandOutcome::Usage
            }
        }
    }

    async fn create_issue(&self, event: &CommandEvent, arguments: &str) -> CommandOutcome {
        let Some(credential) = self.registry.lookup(&event.user_id) else {
            tracing::info!(user_id = %event.user_id, "issue request from unregistered user");
            deliver_error(event, NOT_REGISTERED_REPLY).await;
            return CommandOutcome::NotRegistered;
        };

        let parsed = match parse_issue_arguments(arguments) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::info!(
                    user_id = %event.user_id,
                    reason = error.reason().as_str(),
                    "rejected issue arguments"
                );
                tracing::debug!(user_id = %event.user_id, arguments, "raw rejected arguments");
                deliver_error(event, USAGE_REPLY).await;
                return CommandOutcome::BadArguments;
            }
        };
        let (repo_field, title, body) = parsed.into_parts();
        let Some((owner, repo)) = resolve_repository(&repo_field, &self.config.default_owner)
        else {
            tracing::info!(user_id = %event.user_id, "rejected malformed repository field");
            deliver_error(event, USAGE_REPLY).await;
            return CommandOutcome::BadArguments;
        };
        let request = IssueRequest {
            owner,
            repo,
            title,
            body,
        };

        tracing::info!(
            user_id = %event.user_id,
            owner = %request.owner,
            repo = %request.repo,
            "creating issue"
        );
        let ctx = event.context.with_timeout(self.config.command_timeout);
        match run_bounded(&ctx, self.tracker.create_issue(&ctx, &credential, &request)).await {
            BoundedCall::Completed(Ok(created)) => {
                tracing::info!(user_id = %event.user_id, url = %created.url, "issue created");
                deliver_reply(event, &format!("Issue created: {}", created.url)).await;
                CommandOutcome::IssueCreated { url: created.url }
            }
            BoundedCall::Completed(Err(error)) => {
                tracing::info!(
                    user_id = %event.user_id,
                    owner = %request.owner,
                    repo = %request.repo,
                    error = %error,
                    "issue tracker call failed"
                );
                deliver_error(event, TRACKER_FAILED_REPLY).await;
                CommandOutcome::TrackerFailed
            }
            BoundedCall::TimedOut => {
                tracing::info!(
                    user_id = %event.user_id,
                    timeout = ?self.config.command_timeout,
                    "issue tracker call timed out"
                );
                deliver_error(event, TIMED_OUT_REPLY).await;
                CommandOutcome::TimedOut
            }
            BoundedCall::Cancelled => {
                tracing::info!(user_id = %event.user_id, "issue tracker call cancelled by shutdown");
                deliver_error(event, CANCELLED_REPLY).await;
                CommandOutcome::Cancelled
            }
        }
    }

    async fn register(&self, event: &CommandEvent, token: Option<String>) -> CommandOutcome {
        let Some(secret) = token.and_then(CredentialSecret::new) else {
            deliver_error(event, MISSING_TOKEN_REPLY).await;
            return CommandOutcome::MissingToken;
        };
        if self.registry.contains(&event.user_id) {
            tracing::info!(user_id = %event.user_id, "user is already registered");
            deliver_error(event, ALREADY_REGISTERED_REPLY).await;
            return CommandOutcome::AlreadyRegistered;
        }

        let ctx = event.context.with_timeout(self.config.command_timeout);
        let identity =
            match run_bounded(&ctx, self.tracker.verify_credential(&ctx, &secret)).await {
                BoundedCall::Completed(Ok(identity)) => identity,
                BoundedCall::Completed(Err(error)) => {
                    tracing::info!(
                        user_id = %event.user_id,
                        error = %error,
                        "credential verification failed"
                    );
                    deliver_error(event, INVALID_TOKEN_REPLY).await;
                    return CommandOutcome::InvalidToken;
                }
                BoundedCall::TimedOut => {
                    tracing::info!(user_id = %event.user_id, "credential verification timed out");
                    deliver_error(event, TIMED_OUT_REPLY).await;
                    return CommandOutcome::TimedOut;
                }
                BoundedCall::Cancelled => {
                    deliver_error(event, CANCELLED_REPLY).await;
                    return CommandOutcome::Cancelled;
                }
            };

        match self.registry.register(event.user_id.clone(), secret) {
            Ok(ticket) => {
                tracing::info!(
                    user_id = %event.user_id,
                    login = %identity.login,
                    "user registered"
                );
                self.await_flush(&ctx, ticket).await;
                deliver_reply(
                    event,
                    &format!(
                        "User successfully registered: {}, {}",
                        identity.display_name(),
                        identity.login
                    ),
                )
                .await;
                CommandOutcome::Registered {
                    login: identity.login,
                }
            }
            Err(RegistryError::AlreadyRegistered(_)) => {
                tracing::info!(user_id = %event.user_id, "concurrent registration won by another request");
                deliver_error(event, ALREADY_REGISTERED_REPLY).await;
                CommandOutcome::AlreadyRegistered
            }
        }
    }

    async fn unregister(&self, event: &CommandEvent) -> CommandOutcome {
        let ticket = self.registry.unregister(&event.user_id);
        tracing::info!(user_id = %event.user_id, "user unregistered");
        let ctx = event.context.with_timeout(self.config.command_timeout);
        self.await_flush(&ctx, ticket).await;
        deliver_reply(event, UNREGISTERED_REPLY).await;
        CommandOutcome::Unregistered
    }

    async fn await_flush(&self, ctx: &CommandContext, ticket: FlushTicket) {
        if !self.registry.is_dirty() {
            return;
        }
        let wait = ctx.remaining().unwrap_or(self.config.command_timeout);
        if let Err(error) = self.registry.schedule_flush(ticket).wait(wait).await {
            tracing::warn!(
                version = ticket.version(),
                error = %error,
                "credential store flush failed; in-memory registry kept"
            );
        }
    }
}

/// Splits `owner/name`, or pairs a bare `name` with `default_owner`.
fn resolve_repository(field: &str, default_owner: &str) -> Option<(String, String)> {
    let field = field.trim();
    let (owner, name) = match field.split_once('/') {
        Some((owner, name)) => (owner.trim(), name.trim()),
        None => (default_owner.trim(), field),
    };
    let valid = |part: &str| {
        !part.is_empty() && !part.contains('/') && !part.chars().any(char::is_whitespace)
    };
    if valid(owner) && valid(name) {
        Some((owner.to_string(), name.to_string()))
    } else {
        None
    }
}

async fn deliver_reply(event: &CommandEvent, text: &str) {
    if let Err(error) = event.reply.reply(text).await {
        tracing::warn!(user_id = %event.user_id, error = %error, "failed to deliver reply");
    }
}

async fn deliver_error(event: &CommandEvent, text: &str) {
    if let Err(error) = event.reply.report_error(text).await {
        tracing::warn!(user_id = %event.user_id, error = %error, "failed to deliver error reply");
    }
}
