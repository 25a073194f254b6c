use std::{path::PathBuf, time::Duration};

use clap::Parser;

pub const DEFAULT_AUTH_FILE: &str = "./userlist";
pub const DEFAULT_SLACK_APP_TOKEN_FILE: &str = "./slack_app_token";
pub const DEFAULT_SLACK_BOT_TOKEN_FILE: &str = "./slack_token";
pub const DEFAULT_GITHUB_TOKEN_FILE: &str = "./github_token";
pub const DEFAULT_CREDENTIAL_STORE: &str = "./usertokens.json";

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "issuebot",
    version,
    about = "Slack bot that files GitHub issues on behalf of registered users"
)]
pub struct Cli {
    #[arg(
        long = "org",
        env = "ISSUEBOT_ORG",
        default_value = "",
        help = "GitHub organization (or user) that owns repositories named without an owner"
    )]
    pub org: String,

    #[arg(
        long = "auth-file",
        env = "ISSUEBOT_AUTH_FILE",
        default_value = DEFAULT_AUTH_FILE,
        help = "File listing Slack user ids allowed to use the bot, one per line (empty file allows everyone)"
    )]
    pub auth_file: PathBuf,

    #[arg(
        long = "slack-app-token",
        env = "ISSUEBOT_SLACK_APP_TOKEN",
        hide_env_values = true,
        help = "Slack Socket Mode app token (xapp-...)"
    )]
    pub slack_app_token: Option<String>,

    #[arg(
        long = "slack-app-token-file",
        env = "ISSUEBOT_SLACK_APP_TOKEN_FILE",
        help = "File containing the Slack app token [default: ./slack_app_token]"
    )]
    pub slack_app_token_file: Option<PathBuf>,

    #[arg(
        long = "slack-bot-token",
        env = "ISSUEBOT_SLACK_BOT_TOKEN",
        hide_env_values = true,
        help = "Slack bot token for the Web API (xoxb-...)"
    )]
    pub slack_bot_token: Option<String>,

    #[arg(
        long = "slack-bot-token-file",
        env = "ISSUEBOT_SLACK_BOT_TOKEN_FILE",
        help = "File containing the Slack bot token [default: ./slack_token]"
    )]
    pub slack_bot_token_file: Option<PathBuf>,

    #[arg(
        long = "github-token",
        env = "ISSUEBOT_GITHUB_TOKEN",
        hide_env_values = true,
        help = "GitHub token used for the startup organization check"
    )]
    pub github_token: Option<String>,

    #[arg(
        long = "github-token-file",
        env = "ISSUEBOT_GITHUB_TOKEN_FILE",
        help = "File containing the GitHub token [default: ./github_token]"
    )]
    pub github_token_file: Option<PathBuf>,

    #[arg(
        long = "credential-store",
        env = "ISSUEBOT_CREDENTIAL_STORE",
        default_value = DEFAULT_CREDENTIAL_STORE,
        help = "JSON file persisting registered user tokens"
    )]
    pub credential_store: PathBuf,

    #[arg(
        long = "command-timeout-ms",
        env = "ISSUEBOT_COMMAND_TIMEOUT_MS",
        default_value_t = 8_000,
        value_parser = parse_positive_u64,
        help = "Upper bound for each GitHub call made on behalf of a command"
    )]
    pub command_timeout_ms: u64,

    #[arg(
        long = "drain-timeout-ms",
        env = "ISSUEBOT_DRAIN_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "How long shutdown waits for in-flight commands before cancelling them"
    )]
    pub drain_timeout_ms: u64,

    #[arg(
        long = "request-timeout-ms",
        env = "ISSUEBOT_REQUEST_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        help = "HTTP client timeout for Slack and GitHub requests"
    )]
    pub request_timeout_ms: u64,

    #[arg(
        long = "slack-api-base",
        env = "ISSUEBOT_SLACK_API_BASE",
        default_value = "https://slack.com/api",
        help = "Slack Web API base URL"
    )]
    pub slack_api_base: String,

    #[arg(
        long = "github-api-base",
        env = "ISSUEBOT_GITHUB_API_BASE",
        default_value = "https://api.github.com",
        help = "GitHub API base URL (GraphQL endpoint is <base>/graphql)"
    )]
    pub github_api_base: String,

    #[arg(
        long = "slack-processed-event-cap",
        env = "ISSUEBOT_SLACK_PROCESSED_EVENT_CAP",
        default_value_t = 1_024,
        value_parser = parse_positive_usize,
        help = "Maximum Slack event keys remembered for duplicate delivery protection"
    )]
    pub slack_processed_event_cap: usize,

    #[arg(
        long = "skip-org-check",
        env = "ISSUEBOT_SKIP_ORG_CHECK",
        default_value_t = false,
        help = "Skip the startup check that the organization is reachable with the GitHub token"
    )]
    pub skip_org_check: bool,
}

impl Cli {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
