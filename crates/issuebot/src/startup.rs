use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use issuebot_cli::{load_allow_list, load_token, validate_cli, Cli};
use issuebot_github::GithubGraphqlClient;
use issuebot_session::{
    AllowList, CommandSessionConfig, CredentialSecret, JsonFileCredentialStorage,
    SessionLifecycle, SessionLifecycleConfig,
};
use issuebot_slack::{SlackApiClient, SlackCommandSource};

use crate::shutdown_signals::{shutdown_signal, spawn_allow_list_reloader};

pub(crate) async fn run_bot(cli: Cli) -> Result<()> {
    let sources = validate_cli(&cli)?;
    let org = cli.org.trim().to_string();
    let slack_app_token = load_token("slack app token", &sources.slack_app)?;
    let slack_bot_token = load_token("slack bot token", &sources.slack_bot)?;

    let github = Arc::new(GithubGraphqlClient::new(
        &cli.github_api_base,
        cli.request_timeout_ms,
    )?);
    if cli.skip_org_check {
        tracing::info!(org = %org, "skipping github organization check");
    } else {
        let github_token = load_token("github token", &sources.github)?;
        let secret =
            CredentialSecret::new(github_token).ok_or_else(|| anyhow!("github token is empty"))?;
        let login = github
            .check_owner(&secret, &org)
            .await
            .with_context(|| format!("github organization check for '{org}' failed"))?;
        tracing::info!(org = %login, "github organization is accessible");
    }

    let allow_list = Arc::new(AllowList::new(load_allow_list(&cli.auth_file)?));
    if allow_list.is_empty() {
        tracing::info!(path = %cli.auth_file.display(), "allow-list is empty; every user is admitted");
    } else {
        tracing::info!(
            path = %cli.auth_file.display(),
            users = allow_list.len(),
            "allow-list loaded"
        );
    }

    let storage = Arc::new(JsonFileCredentialStorage::new(&cli.credential_store));
    let session_config = CommandSessionConfig {
        default_owner: org.clone(),
        command_timeout: cli.command_timeout(),
    };
    let lifecycle_config = SessionLifecycleConfig {
        drain_timeout: cli.drain_timeout(),
        ..SessionLifecycleConfig::default()
    };
    let lifecycle = match SessionLifecycle::start(
        storage,
        github,
        Arc::clone(&allow_list),
        session_config,
        lifecycle_config,
    ) {
        Ok(lifecycle) => lifecycle,
        Err(error) => {
            tracing::error!(
                path = %cli.credential_store.display(),
                error = %error,
                "credential store cannot be loaded"
            );
            return Err(anyhow::Error::new(error).context(format!(
                "failed to load credential store {}",
                cli.credential_store.display()
            )));
        }
    };
    tracing::info!(
        path = %cli.credential_store.display(),
        users = lifecycle.session().registry().len(),
        "credential registry loaded"
    );

    let slack = Arc::new(SlackApiClient::new(
        &cli.slack_api_base,
        &slack_app_token,
        &slack_bot_token,
        cli.request_timeout_ms,
    )?);
    let mut source = SlackCommandSource::connect(slack, cli.slack_processed_event_cap)
        .await
        .context("failed to connect slack socket mode")?;

    let reloader = spawn_allow_list_reloader(Arc::clone(&allow_list), cli.auth_file.clone())?;
    tracing::info!(org = %org, "issuebot started");
    let report = lifecycle.run(&mut source, shutdown_signal()).await;
    if let Some(reloader) = reloader {
        reloader.abort();
    }

    tracing::info!(
        drained = report.drained,
        cancelled = report.cancelled,
        remaining_in_flight = report.remaining_in_flight,
        flushed = report.flushed,
        "issuebot stopped"
    );
    if !report.flushed {
        tracing::warn!(
            path = %cli.credential_store.display(),
            "final credential flush failed; recent registrations may be lost"
        );
    }
    Ok(())
}
