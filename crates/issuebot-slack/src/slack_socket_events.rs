//! Socket Mode envelope decoding and event normalization.

use std::collections::{HashSet, VecDeque};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SlackSocketEnvelope {
    #[serde(default)]
    pub(crate) envelope_id: Option<String>,
    #[serde(rename = "type")]
    pub(crate) envelope_type: String,
    #[serde(default)]
    pub(crate) reason: Option<String>,
    #[serde(default)]
    pub(crate) payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlackEventKind {
    AppMention,
    DirectMessage,
}

impl SlackEventKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::AppMention => "app_mention",
            Self::DirectMessage => "message.im",
        }
    }
}

/// A message addressed to the bot, with the bot mention stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlackInboundEvent {
    pub(crate) key: String,
    pub(crate) kind: SlackEventKind,
    pub(crate) channel_id: String,
    pub(crate) user_id: String,
    pub(crate) text: String,
    pub(crate) thread_ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackEventCallbackEnvelope {
    #[serde(rename = "type")]
    callback_type: String,
    event_id: String,
    event: SlackEventPayload,
}

#[derive(Debug, Deserialize)]
struct SlackEventPayload {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    channel_type: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
}

/// Decodes a data frame; control frames yield `None`.
pub(crate) fn parse_socket_envelope(message: WsMessage) -> Result<Option<SlackSocketEnvelope>> {
    let raw = match message {
        WsMessage::Text(text) => text.as_str().to_owned(),
        WsMessage::Binary(bytes) => {
            String::from_utf8(bytes.to_vec()).context("socket frame is not valid utf-8")?
        }
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_) | WsMessage::Frame(_) => {
            return Ok(None);
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .context("socket frame is not a slack envelope")
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// Keeps `app_mention` and direct-message events written by someone other
/// than the bot; everything else is `Ok(None)`.
pub(crate) fn normalize_socket_envelope(
    envelope: &SlackSocketEnvelope,
    bot_user_id: &str,
) -> Result<Option<SlackInboundEvent>> {
    if envelope.envelope_type != "events_api" {
        return Ok(None);
    }
    let callback: SlackEventCallbackEnvelope = serde_json::from_value(envelope.payload.clone())
        .context("events_api payload is not an event callback")?;
    if callback.callback_type != "event_callback" {
        return Ok(None);
    }

    let SlackEventPayload {
        event_type,
        subtype,
        bot_id,
        user,
        text,
        channel,
        channel_type,
        ts,
        thread_ts,
    } = callback.event;
    // Edits, deletions and bot posts arrive as subtyped messages.
    if subtype.is_some() || bot_id.is_some() {
        return Ok(None);
    }
    let (Some(user_id), Some(channel_id), Some(message_ts)) =
        (non_blank(user), non_blank(channel), non_blank(ts))
    else {
        return Ok(None);
    };
    if user_id == bot_user_id {
        return Ok(None);
    }

    let is_direct = channel_type.as_deref() == Some("im") || channel_id.starts_with('D');
    let kind = match event_type.as_str() {
        "app_mention" => SlackEventKind::AppMention,
        "message" if is_direct => SlackEventKind::DirectMessage,
        _ => return Ok(None),
    };

    Ok(Some(SlackInboundEvent {
        key: [callback.event_id.as_str(), &channel_id, &message_ts].join(":"),
        kind,
        text: normalize_command_text(text.as_deref().unwrap_or_default(), bot_user_id),
        channel_id,
        user_id,
        thread_ts,
    }))
}

/// Strips a leading bot mention and undoes Slack's `&`, `<` and `>` escaping.
pub(crate) fn normalize_command_text(raw: &str, bot_user_id: &str) -> String {
    let raw = raw.trim_start();
    let body = raw
        .strip_prefix("<@")
        .and_then(|rest| rest.strip_prefix(bot_user_id))
        .and_then(|rest| rest.strip_prefix('>'))
        .unwrap_or(raw);
    body.trim()
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Bounded memory of delivered event keys; Slack re-sends unacknowledged envelopes.
#[derive(Debug)]
pub(crate) struct ProcessedEventKeys {
    order: VecDeque<String>,
    index: HashSet<String>,
    cap: usize,
}

impl ProcessedEventKeys {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            index: HashSet::new(),
            cap: cap.max(1),
        }
    }

    /// Returns false when `key` was already seen.
    pub(crate) fn mark_processed(&mut self, key: &str) -> bool {
        if self.index.contains(key) {
            return false;
        }
        self.order.push_back(key.to_string());
        self.index.insert(key.to_string());
        while self.order.len() > self.cap {
            if let Some(removed) = self.order.pop_front() {
                self.index.remove(&removed);
            }
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.index.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::{
        normalize_command_text, normalize_socket_envelope, parse_socket_envelope,
        ProcessedEventKeys, SlackEventKind, SlackSocketEnvelope,
    };

    fn events_api(event: serde_json::Value) -> SlackSocketEnvelope {
        SlackSocketEnvelope {
            envelope_id: Some("env-1".to_string()),
            envelope_type: "events_api".to_string(),
            reason: None,
            payload: json!({
                "type": "event_callback",
                "event_id": "Ev1",
                "event_time": 1,
                "event": event,
            }),
        }
    }

    #[test]
    fn unit_app_mention_is_normalized_and_mention_stripped() {
        let envelope = events_api(json!({
            "type": "app_mention",
            "user": "U1",
            "text": "<@UBOT> new \"r\" \"a &amp; b\" \"x &lt; y\"",
            "channel": "C1",
            "ts": "1.1"
        }));
        let event = normalize_socket_envelope(&envelope, "UBOT")
            .expect("normalize")
            .expect("event");
        assert_eq!(event.kind, SlackEventKind::AppMention);
        assert_eq!(event.kind.as_str(), "app_mention");
        assert_eq!(event.key, "Ev1:C1:1.1");
        assert_eq!(event.user_id, "U1");
        assert_eq!(event.text, "new \"r\" \"a & b\" \"x < y\"");
        assert_eq!(event.thread_ts, None);
    }

    #[test]
    fn functional_direct_message_is_accepted_but_channel_chatter_is_not() {
        let dm = events_api(json!({
            "type": "message",
            "channel_type": "im",
            "user": "U1",
            "text": "help",
            "channel": "D1",
            "ts": "2.1",
            "thread_ts": "2.0"
        }));
        let event = normalize_socket_envelope(&dm, "UBOT")
            .expect("normalize")
            .expect("event");
        assert_eq!(event.kind, SlackEventKind::DirectMessage);
        assert_eq!(event.thread_ts.as_deref(), Some("2.0"));

        let chatter = events_api(json!({
            "type": "message",
            "channel_type": "channel",
            "user": "U1",
            "text": "new \"r\" \"t\" \"b\"",
            "channel": "C1",
            "ts": "3.1"
        }));
        assert!(normalize_socket_envelope(&chatter, "UBOT")
            .expect("normalize")
            .is_none());
    }

    #[test]
    fn regression_bot_and_edited_messages_are_ignored() {
        for event in [
            json!({ "type": "message", "channel_type": "im", "user": "UBOT", "text": "hi", "channel": "D1", "ts": "1" }),
            json!({ "type": "message", "channel_type": "im", "bot_id": "B1", "user": "U2", "text": "hi", "channel": "D1", "ts": "1" }),
            json!({ "type": "message", "subtype": "message_changed", "channel_type": "im", "user": "U1", "channel": "D1", "ts": "1" }),
        ] {
            assert!(normalize_socket_envelope(&events_api(event), "UBOT")
                .expect("normalize")
                .is_none());
        }
    }

    #[test]
    fn unit_non_event_envelopes_are_ignored() {
        let hello = SlackSocketEnvelope {
            envelope_id: None,
            envelope_type: "hello".to_string(),
            reason: None,
            payload: json!({}),
        };
        assert!(normalize_socket_envelope(&hello, "UBOT")
            .expect("normalize")
            .is_none());
    }

    #[test]
    fn unit_parse_socket_envelope_handles_control_frames() {
        assert!(parse_socket_envelope(WsMessage::Ping(Vec::new().into()))
            .expect("ping")
            .is_none());
        let envelope = parse_socket_envelope(WsMessage::Text(
            r#"{"type":"disconnect","reason":"refresh_requested"}"#.into(),
        ))
        .expect("parse")
        .expect("envelope");
        assert_eq!(envelope.envelope_type, "disconnect");
        assert_eq!(envelope.reason.as_deref(), Some("refresh_requested"));
        assert!(parse_socket_envelope(WsMessage::Text("not json".into())).is_err());
    }

    #[test]
    fn unit_normalize_command_text_only_strips_leading_mention() {
        assert_eq!(normalize_command_text("  <@UBOT>   help ", "UBOT"), "help");
        assert_eq!(
            normalize_command_text("say <@UBOT> help", "UBOT"),
            "say <@UBOT> help"
        );
    }

    #[test]
    fn regression_processed_event_keys_are_capped() {
        let mut keys = ProcessedEventKeys::new(2);
        assert!(keys.mark_processed("a"));
        assert!(!keys.mark_processed("a"));
        assert!(keys.mark_processed("b"));
        assert!(keys.mark_processed("c"));
        assert!(!keys.contains("a"));
        assert!(keys.contains("b"));
        assert!(keys.contains("c"));
    }
}
