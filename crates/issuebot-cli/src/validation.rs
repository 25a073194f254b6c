use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::cli_args::{
    Cli, DEFAULT_GITHUB_TOKEN_FILE, DEFAULT_SLACK_APP_TOKEN_FILE, DEFAULT_SLACK_BOT_TOKEN_FILE,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid flags: {}", .problems.join("; "))]
    InvalidFlags { problems: Vec<String> },
}

impl ConfigError {
    pub fn problems(&self) -> &[String] {
        match self {
            Self::InvalidFlags { problems } => problems,
        }
    }
}

/// Where a secret comes from: given inline or read from a file.
#[derive(Clone, PartialEq, Eq)]
pub enum TokenSource {
    Inline(String),
    File(PathBuf),
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline(_) => f.write_str("Inline(<redacted>)"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSources {
    pub slack_app: TokenSource,
    pub slack_bot: TokenSource,
    pub github: TokenSource,
}

/// Checks cross-flag constraints clap cannot express and reports every problem at once.
pub fn validate_cli(cli: &Cli) -> Result<TokenSources, ConfigError> {
    let mut problems = Vec::new();

    let org = cli.org.trim();
    if org.is_empty() {
        problems.push("--org is required".to_string());
    } else if org.contains('/') || org.chars().any(char::is_whitespace) {
        problems.push(format!(
            "--org '{org}' must be a bare organization or user login"
        ));
    }

    for (flag, value) in [
        ("--slack-api-base", cli.slack_api_base.as_str()),
        ("--github-api-base", cli.github_api_base.as_str()),
    ] {
        if !(value.starts_with("http://") || value.starts_with("https://")) {
            problems.push(format!("{flag} must be an http(s) URL, got '{value}'"));
        }
    }

    let slack_app = token_source(
        "slack app token",
        "--slack-app-token",
        cli.slack_app_token.as_deref(),
        cli.slack_app_token_file.as_deref(),
        DEFAULT_SLACK_APP_TOKEN_FILE,
        &mut problems,
    );
    let slack_bot = token_source(
        "slack bot token",
        "--slack-bot-token",
        cli.slack_bot_token.as_deref(),
        cli.slack_bot_token_file.as_deref(),
        DEFAULT_SLACK_BOT_TOKEN_FILE,
        &mut problems,
    );
    let github = token_source(
        "github token",
        "--github-token",
        cli.github_token.as_deref(),
        cli.github_token_file.as_deref(),
        DEFAULT_GITHUB_TOKEN_FILE,
        &mut problems,
    );

    if !problems.is_empty() {
        return Err(ConfigError::InvalidFlags { problems });
    }
    Ok(TokenSources {
        slack_app,
        slack_bot,
        github,
    })
}

fn token_source(
    label: &str,
    flag: &str,
    value: Option<&str>,
    file: Option<&Path>,
    default_file: &str,
    problems: &mut Vec<String>,
) -> TokenSource {
    match (value, file) {
        (Some(_), Some(_)) => {
            problems.push(format!(
                "{label}: {flag} and {flag}-file cannot be used together"
            ));
            TokenSource::File(PathBuf::from(default_file))
        }
        (Some(value), None) if value.trim().is_empty() => {
            problems.push(format!("{label}: {flag} cannot be empty"));
            TokenSource::Inline(String::new())
        }
        (Some(value), None) => TokenSource::Inline(value.to_string()),
        (None, Some(path)) => TokenSource::File(path.to_path_buf()),
        (None, None) => TokenSource::File(PathBuf::from(default_file)),
    }
}
