//! Seams to the chat transport and the issue tracker.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    command_context::CommandContext,
    credential::{Credential, CredentialSecret, UserId},
};

/// Issue to file on behalf of a registered user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    pub owner: String,
    pub repo: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedIssue {
    pub url: String,
}

/// Tracker account a credential authenticates as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerIdentity {
    pub login: String,
    pub name: Option<String>,
}

impl TrackerIdentity {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.login)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("tracker rejected the credential")]
    Unauthorized,
    #[error("repository {owner}/{repo} was not found")]
    RepositoryNotFound { owner: String, repo: String },
    #[error("owner {0} was not found")]
    OwnerNotFound(String),
    #[error("tracker returned http {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("tracker api error: {0}")]
    Api(String),
    #[error("tracker transport error: {0}")]
    Transport(String),
    #[error("tracker returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("tracker call abandoned: {0}")]
    Cancelled(&'static str),
}

/// Issue tracker operations consumed by the command session.
///
/// Implementations should observe `ctx` at their own checkpoints. The session
/// races every call against the context's deadline and cancel signal, so a
/// call that ignores it is abandoned rather than awaited.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_issue(
        &self,
        ctx: &CommandContext,
        credential: &Credential,
        request: &IssueRequest,
    ) -> Result<CreatedIssue, TrackerError>;

    async fn verify_credential(
        &self,
        ctx: &CommandContext,
        secret: &CredentialSecret,
    ) -> Result<TrackerIdentity, TrackerError>;
}

/// Reply channel bound to the originating conversation.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn reply(&self, text: &str) -> anyhow::Result<()>;

    async fn report_error(&self, text: &str) -> anyhow::Result<()>;
}

/// One chat message addressed to the bot.
#[derive(Clone)]
pub struct InboundCommand {
    pub user_id: UserId,
    pub text: String,
    pub reply: Arc<dyn ReplySink>,
}

impl fmt::Debug for InboundCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundCommand")
            .field("user_id", &self.user_id)
            .field("text_bytes", &self.text.len())
            .finish()
    }
}

/// Event source side of the chat transport.
#[async_trait]
pub trait CommandSource: Send {
    /// Returns `Ok(None)` when the transport has no further events.
    async fn next_command(&mut self) -> anyhow::Result<Option<InboundCommand>>;

    async fn disconnect(&mut self) -> anyhow::Result<()>;
}
