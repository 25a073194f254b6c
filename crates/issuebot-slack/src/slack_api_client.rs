//! Slack Web API calls used by the Socket Mode transport.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};

pub const DEFAULT_SLACK_API_BASE: &str = "https://slack.com/api";

/// Every Web API reply carries `ok` and, on failure, an `error` code next to
/// the method-specific fields.
#[derive(Debug, Deserialize)]
struct SlackEnvelope<T> {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    fields: T,
}

impl<T> SlackEnvelope<T> {
    fn into_fields(self, method: &str) -> Result<T> {
        if !self.ok {
            bail!(
                "slack {method} rejected the call: {}",
                self.error.as_deref().unwrap_or("no error code")
            );
        }
        Ok(self.fields)
    }
}

#[derive(Debug, Deserialize)]
struct AuthTestFields {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectionsOpenFields {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostMessageFields {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackPostedMessage {
    pub channel: String,
    pub ts: String,
}

#[derive(Debug, Clone, Copy)]
enum SlackToken {
    /// `xapp-` token; only opens Socket Mode connections.
    App,
    /// `xoxb-` token for everything else.
    Bot,
}

#[derive(Clone)]
pub struct SlackApiClient {
    http: reqwest::Client,
    api_base: String,
    app_token: String,
    bot_token: String,
}

impl SlackApiClient {
    pub fn new(
        api_base: &str,
        app_token: &str,
        bot_token: &str,
        request_timeout_ms: u64,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("issuebot"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to build slack http client")?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            app_token: app_token.trim().to_string(),
            bot_token: bot_token.trim().to_string(),
        })
    }

    /// Returns the bot's own user id, used to drop self-authored events.
    pub async fn resolve_bot_user_id(&self) -> Result<String> {
        let fields: AuthTestFields = self.call("auth.test", SlackToken::Bot, None).await?;
        fields
            .user_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow!("slack auth.test reply has no user_id"))
    }

    /// Requests a fresh Socket Mode websocket URL.
    pub async fn open_socket_connection(&self) -> Result<String> {
        let fields: ConnectionsOpenFields = self
            .call("apps.connections.open", SlackToken::App, None)
            .await?;
        fields
            .url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| anyhow!("slack apps.connections.open reply has no url"))
    }

    pub async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<SlackPostedMessage> {
        let mut payload = json!({
            "channel": channel,
            "text": text,
            "mrkdwn": true,
            "unfurl_links": false,
            "unfurl_media": false,
        });
        if let Some(thread_ts) = thread_ts.map(str::trim).filter(|ts| !ts.is_empty()) {
            payload["thread_ts"] = json!(thread_ts);
        }

        let fields: PostMessageFields = self
            .call("chat.postMessage", SlackToken::Bot, Some(&payload))
            .await?;
        let ts = fields
            .ts
            .ok_or_else(|| anyhow!("slack chat.postMessage reply has no ts"))?;
        Ok(SlackPostedMessage {
            channel: fields.channel.unwrap_or_else(|| channel.to_string()),
            ts,
        })
    }

    async fn call<T>(&self, method: &str, token: SlackToken, payload: Option<&Value>) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let token = match token {
            SlackToken::App => &self.app_token,
            SlackToken::Bot => &self.bot_token,
        };
        let mut request = self
            .http
            .post(format!("{}/{method}", self.api_base))
            .bearer_auth(token);
        if let Some(payload) = payload {
            request = request.json(payload);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("slack {method} request failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "slack {method} answered http {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 320)
            );
        }
        response
            .json::<SlackEnvelope<T>>()
            .await
            .with_context(|| format!("failed to decode slack {method} reply"))?
            .into_fields(method)
    }
}

fn truncate_for_error(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
