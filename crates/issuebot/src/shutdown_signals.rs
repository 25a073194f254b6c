use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use issuebot_cli::load_allow_list;
use issuebot_session::AllowList;
use tokio::task::JoinHandle;

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => log_ctrl_c(result).await,
                    _ = terminate.recv() => tracing::info!("SIGTERM received; shutting down"),
                }
                return;
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to install SIGTERM handler");
            }
        }
    }
    log_ctrl_c(tokio::signal::ctrl_c().await).await;
}

async fn log_ctrl_c(result: std::io::Result<()>) {
    match result {
        Ok(()) => tracing::info!("interrupt received; shutting down"),
        Err(error) => {
            // Without a handler only the source ending can stop the bot.
            tracing::warn!(error = %error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}

/// Reloads the allow-list on every SIGHUP until aborted.
#[cfg(unix)]
pub(crate) fn spawn_allow_list_reloader(
    allow_list: Arc<AllowList>,
    path: PathBuf,
) -> Result<Option<JoinHandle<()>>> {
    use anyhow::Context;
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    Ok(Some(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            reload_allow_list(&allow_list, &path);
        }
    })))
}

#[cfg(not(unix))]
pub(crate) fn spawn_allow_list_reloader(
    _allow_list: Arc<AllowList>,
    _path: PathBuf,
) -> Result<Option<JoinHandle<()>>> {
    Ok(None)
}

/// Swaps in the file's current contents; on failure the previous list stays active.
pub(crate) fn reload_allow_list(allow_list: &AllowList, path: &Path) -> bool {
    match load_allow_list(path) {
        Ok(users) => {
            let count = users.len();
            allow_list.replace(users);
            tracing::info!(path = %path.display(), users = count, "allow-list reloaded");
            true
        }
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %format!("{error:#}"),
                "allow-list reload failed; keeping previous list"
            );
            false
        }
    }
}
