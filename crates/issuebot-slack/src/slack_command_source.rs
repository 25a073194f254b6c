//! Socket Mode event source and `chat.postMessage` reply sink.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use issuebot_session::{CommandSource, InboundCommand, ReplySink, UserId};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

use crate::{
    slack_api_client::SlackApiClient,
    slack_socket_events::{normalize_socket_envelope, parse_socket_envelope, ProcessedEventKeys},
};

pub const DEFAULT_PROCESSED_EVENT_CAP: usize = 1024;

type SlackSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Replies into the channel (and thread, if any) a command came from.
pub struct SlackReplySink {
    client: Arc<SlackApiClient>,
    channel_id: String,
    thread_ts: Option<String>,
}

impl SlackReplySink {
    pub fn new(client: Arc<SlackApiClient>, channel_id: String, thread_ts: Option<String>) -> Self {
        Self {
            client,
            channel_id,
            thread_ts,
        }
    }
}

#[async_trait]
impl ReplySink for SlackReplySink {
    async fn reply(&self, text: &str) -> Result<()> {
        self.client
            .post_message(&self.channel_id, text, self.thread_ts.as_deref())
            .await?;
        Ok(())
    }

    async fn report_error(&self, text: &str) -> Result<()> {
        self.client
            .post_message(
                &self.channel_id,
                &format!("*Error:* {text}"),
                self.thread_ts.as_deref(),
            )
            .await?;
        Ok(())
    }
}

pub struct SlackCommandSource {
    client: Arc<SlackApiClient>,
    bot_user_id: String,
    socket: Option<SlackSocket>,
    processed: ProcessedEventKeys,
}

impl SlackCommandSource {
    /// Resolves the bot identity and opens the first socket.
    pub async fn connect(client: Arc<SlackApiClient>, processed_event_cap: usize) -> Result<Self> {
        let bot_user_id = client.resolve_bot_user_id().await?;
        tracing::info!(bot_user_id = %bot_user_id, "slack bot identity resolved");
        let mut source = Self {
            client,
            bot_user_id,
            socket: None,
            processed: ProcessedEventKeys::new(processed_event_cap),
        };
        source.open_socket().await?;
        Ok(source)
    }

    pub fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    async fn open_socket(&mut self) -> Result<()> {
        let url = self.client.open_socket_connection().await?;
        let (stream, _response) = connect_async(url.as_str())
            .await
            .context("failed to connect slack socket mode websocket")?;
        self.socket = Some(stream);
        tracing::info!("slack socket connected");
        Ok(())
    }

    async fn close_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(error) = socket.close(None).await {
                tracing::debug!(error = %error, "slack socket close failed");
            }
        }
    }
}

async fn ack_envelope(socket: &mut SlackSocket, envelope_id: &str) -> Result<()> {
    let ack = json!({ "envelope_id": envelope_id }).to_string();
    socket
        .send(WsMessage::Text(ack.into()))
        .await
        .context("failed to send slack socket ack")
}

#[async_trait]
impl CommandSource for SlackCommandSource {
    async fn next_command(&mut self) -> Result<Option<InboundCommand>> {
        loop {
            let Some(socket) = self.socket.as_mut() else {
                self.open_socket().await?;
                continue;
            };
            let message = match socket.next().await {
                Some(Ok(message)) => message,
                Some(Err(error)) => {
                    tracing::warn!(error = %error, "slack socket read failed; reconnecting");
                    self.socket = None;
                    continue;
                }
                None => {
                    tracing::info!("slack socket closed; reconnecting");
                    self.socket = None;
                    continue;
                }
            };
            if let WsMessage::Close(frame) = &message {
                tracing::info!(frame = ?frame, "slack socket close frame received; reconnecting");
                self.socket = None;
                continue;
            }

            let envelope = match parse_socket_envelope(message) {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(error) => {
                    tracing::warn!(error = %format!("{error:#}"), "dropping undecodable slack envelope");
                    continue;
                }
            };
            if let Some(envelope_id) = envelope.envelope_id.as_deref() {
                ack_envelope(socket, envelope_id).await?;
            }

            match envelope.envelope_type.as_str() {
                "hello" => {
                    tracing::debug!("slack socket hello received");
                    continue;
                }
                "disconnect" => {
                    tracing::info!(
                        reason = envelope.reason.as_deref().unwrap_or("unspecified"),
                        "slack requested socket refresh"
                    );
                    self.close_socket().await;
                    continue;
                }
                _ => {}
            }

            let event = match normalize_socket_envelope(&envelope, &self.bot_user_id) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(error) => {
                    tracing::warn!(error = %format!("{error:#}"), "dropping malformed slack event");
                    continue;
                }
            };
            if !self.processed.mark_processed(&event.key) {
                tracing::debug!(key = %event.key, "skipping redelivered slack event");
                continue;
            }
            tracing::debug!(
                kind = event.kind.as_str(),
                channel_id = %event.channel_id,
                user_id = %event.user_id,
                "slack command received"
            );
            let reply = SlackReplySink::new(
                Arc::clone(&self.client),
                event.channel_id,
                event.thread_ts,
            );
            return Ok(Some(InboundCommand {
                user_id: UserId::new(event.user_id),
                text: event.text,
                reply: Arc::new(reply),
            }));
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut socket) = self.socket.take() {
            socket
                .close(None)
                .await
                .context("failed to close slack socket")?;
            tracing::info!("slack socket disconnected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::{SinkExt, StreamExt};
    use httpmock::prelude::*;
    use issuebot_session::{CommandSource, ReplySink};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::{SlackCommandSource, SlackReplySink};
    use crate::slack_api_client::SlackApiClient;

    fn event_envelope(envelope_id: &str, event_id: &str, text: &str) -> String {
        json!({
            "envelope_id": envelope_id,
            "type": "events_api",
            "payload": {
                "type": "event_callback",
                "event_id": event_id,
                "event_time": 1,
                "event": {
                    "type": "app_mention",
                    "user": "U1",
                    "text": text,
                    "channel": "C1",
                    "ts": format!("{event_id}.1")
                }
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn integration_socket_source_acks_dedupes_and_yields_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/auth.test");
            then.status(200)
                .json_body(json!({ "ok": true, "user_id": "UBOT" }));
        });
        let open = server.mock(|when, then| {
            when.method(POST).path("/apps.connections.open");
            then.status(200)
                .json_body(json!({ "ok": true, "url": format!("ws://{address}/") }));
        });

        let socket_server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
            for frame in [
                json!({ "type": "hello" }).to_string(),
                event_envelope("env-1", "Ev1", "<@UBOT> help"),
                event_envelope("env-2", "Ev1", "<@UBOT> help"),
                event_envelope("env-3", "Ev2", "<@UBOT> unregister"),
            ] {
                ws.send(WsMessage::Text(frame.into())).await.expect("send");
            }
            let mut acks = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    WsMessage::Text(text) => {
                        let ack: serde_json::Value =
                            serde_json::from_str(&text).expect("ack json");
                        acks.push(ack["envelope_id"].as_str().unwrap_or_default().to_string());
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            acks
        });

        let client = Arc::new(
            SlackApiClient::new(&server.base_url(), "xapp-test", "xoxb-test", 2_000)
                .expect("client"),
        );
        let mut source = SlackCommandSource::connect(client, 16)
            .await
            .expect("connect");
        assert_eq!(source.bot_user_id(), "UBOT");

        let first = source
            .next_command()
            .await
            .expect("next")
            .expect("command");
        assert_eq!(first.user_id.as_str(), "U1");
        assert_eq!(first.text, "help");

        let second = source
            .next_command()
            .await
            .expect("next")
            .expect("command");
        assert_eq!(second.text, "unregister");

        source.disconnect().await.expect("disconnect");
        let acks = socket_server.await.expect("socket server");
        assert_eq!(acks, vec!["env-1", "env-2", "env-3"]);
        open.assert_calls(1);
    }

    #[tokio::test]
    async fn functional_reply_sink_posts_errors_with_prefix_into_thread() {
        let server = MockServer::start();
        let post = server.mock(|when, then| {
            when.method(POST)
                .path("/chat.postMessage")
                .json_body_includes(json!({
                    "channel": "C1",
                    "text": "*Error:* Your request timed out",
                    "thread_ts": "9.1"
                }).to_string());
            then.status(200)
                .json_body(json!({ "ok": true, "channel": "C1", "ts": "9.2" }));
        });
        let client = Arc::new(
            SlackApiClient::new(&server.base_url(), "xapp-test", "xoxb-test", 2_000)
                .expect("client"),
        );
        let sink = SlackReplySink::new(client, "C1".to_string(), Some("9.1".to_string()));
        sink.report_error("Your request timed out")
            .await
            .expect("post error");
        post.assert_calls(1);
    }
}
