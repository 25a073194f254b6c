//! Command session subsystem for the issue-filing chat bot.
//!
//! Hosts the quoted-argument parser, the per-user credential registry and its
//! durable file storage, the admission gate used for graceful drain, and the
//! command session/lifecycle that compose them around the chat transport and
//! issue tracker collaborators.

pub mod admission_gate;
pub mod allow_list;
pub mod argument_parser;
pub mod collaborators;
pub mod command_context;
pub mod command_router;
pub mod command_session;
pub mod credential;
pub mod credential_registry;
pub mod credential_storage;
pub mod session_lifecycle;

pub use admission_gate::{AdmissionGate, AdmissionPermit, AdmissionRejected, DrainOutcome, GateState};
pub use allow_list::AllowList;
pub use argument_parser::{
    escape_phrase, parse_issue_arguments, render_issue_arguments, BadArgumentsReason,
    ParseError, ParsedArguments,
};
pub use collaborators::{
    CommandSource, CreatedIssue, InboundCommand, IssueRequest, IssueTracker, ReplySink,
    TrackerError, TrackerIdentity,
};
pub use command_context::CommandContext;
pub use command_router::{parse_bot_command, BotCommand};
pub use command_session::{CommandEvent, CommandOutcome, CommandSession, CommandSessionConfig};
pub use credential::{Credential, CredentialSecret, UserId};
pub use credential_registry::{
    CredentialRegistry, FlushError, FlushHandle, FlushOutcome, FlushTicket, RegistryError,
};
pub use credential_storage::{
    CredentialStorage, JsonFileCredentialStorage, StorageError, StoredCredentials,
    CREDENTIAL_STORE_SCHEMA_VERSION,
};
pub use session_lifecycle::{SessionLifecycle, SessionLifecycleConfig, ShutdownReport};
