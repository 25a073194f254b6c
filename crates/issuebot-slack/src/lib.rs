//! Slack Socket Mode implementation of the chat transport collaborator.

mod slack_api_client;
mod slack_command_source;
mod slack_socket_events;

pub use slack_api_client::{SlackApiClient, SlackPostedMessage, DEFAULT_SLACK_API_BASE};
pub use slack_command_source::{SlackCommandSource, SlackReplySink, DEFAULT_PROCESSED_EVENT_CAP};
