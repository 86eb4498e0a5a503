//! Wire types for the Slack Web and Events APIs.

use serde::{Deserialize, Serialize};

// Request/response types for the Web API

/// Layout block as accepted by chat.postMessage / chat.update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Section { text: TextObject },
    Divider,
    Actions { elements: Vec<ButtonElement> },
}

impl Block {
    pub fn section_mrkdwn(text: impl Into<String>) -> Self {
        Block::Section {
            text: TextObject::mrkdwn(text),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextObject {
    Mrkdwn { text: String },
    PlainText { text: String },
}

impl TextObject {
    pub fn mrkdwn(text: impl Into<String>) -> Self {
        TextObject::Mrkdwn { text: text.into() }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        TextObject::PlainText { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TextObject::Mrkdwn { text } | TextObject::PlainText { text } => text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ButtonElement {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: TextObject,
    pub action_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ButtonElement {
    pub fn with_value(
        label: impl Into<String>,
        action_id: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            kind: "button".to_string(),
            text: TextObject::plain(label),
            action_id: action_id.into(),
            value: Some(value.into()),
            url: None,
        }
    }

    pub fn link(
        label: impl Into<String>,
        action_id: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            kind: "button".to_string(),
            text: TextObject::plain(label),
            action_id: action_id.into(),
            value: None,
            url: Some(url.into()),
        }
    }
}

#[derive(Serialize)]
pub(crate) struct PostMessageRequest<'a> {
    pub channel: &'a str,
    pub text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks: Option<&'a [Block]>,
}

#[derive(Serialize)]
pub(crate) struct UpdateMessageRequest<'a> {
    pub channel: &'a str,
    pub ts: &'a str,
    pub text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks: Option<&'a [Block]>,
}

#[derive(Serialize)]
pub(crate) struct ReactionRequest<'a> {
    pub channel: &'a str,
    pub timestamp: &'a str,
    pub name: &'a str,
}

#[derive(Deserialize)]
pub(crate) struct ApiResponse {
    pub ok: bool,
    pub error: Option<String>,
    pub ts: Option<String>,
    pub channel: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct RepliesResponse {
    pub ok: bool,
    pub error: Option<String>,
    pub messages: Option<Vec<MessageEvent>>,
}

/// A successfully posted or updated message.
#[derive(Debug, Clone)]
pub struct PostedMessage {
    pub channel: String,
    pub ts: String,
}

// Events API payloads

/// Top-level body delivered to the events endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventEnvelope {
    /// Endpoint ownership handshake; echo the challenge back.
    UrlVerification { challenge: String },
    EventCallback { event: ChatEvent },
}

/// Inner event we act on. Mentions and thread replies share the shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    AppMention(MessageEvent),
    Message(MessageEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MessageEvent {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub text: String,
    pub ts: String,
    /// Absent in conversations.replies items; always set on delivered events.
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub thread_ts: Option<String>,
    /// Set when the author is a bot; those events are never dispatched.
    #[serde(default)]
    pub bot_id: Option<String>,
    /// Message subtype (edits, joins); anything but a plain message is skipped.
    #[serde(default)]
    pub subtype: Option<String>,
}

impl MessageEvent {
    /// The thread a reply belongs to: explicit parent, else the message itself.
    pub fn thread_root(&self) -> &str {
        self.thread_ts.as_deref().unwrap_or(&self.ts)
    }

    pub fn is_actionable(&self) -> bool {
        self.bot_id.is_none() && self.subtype.is_none() && self.user.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_kit_serializes_to_wire_shape() {
        let blocks = vec![
            Block::section_mrkdwn("*hello*"),
            Block::Divider,
            Block::Actions {
                elements: vec![ButtonElement::with_value("Run", "action_0", "echo hi")],
            },
        ];
        let json = serde_json::to_value(&blocks).unwrap();

        assert_eq!(json[0]["type"], "section");
        assert_eq!(json[0]["text"]["type"], "mrkdwn");
        assert_eq!(json[1]["type"], "divider");
        assert_eq!(json[2]["type"], "actions");
        assert_eq!(json[2]["elements"][0]["type"], "button");
        assert_eq!(json[2]["elements"][0]["text"]["type"], "plain_text");
        assert_eq!(json[2]["elements"][0]["value"], "echo hi");
    }

    #[test]
    fn link_button_has_url_and_no_value() {
        let button = ButtonElement::link("Edit", "edit_branch", "https://example.com/tree/b");
        let json = serde_json::to_value(&button).unwrap();
        assert_eq!(json["url"], "https://example.com/tree/b");
        assert!(json.get("value").is_none());
    }

    #[test]
    fn event_envelope_parses_url_verification() {
        let body = r#"{"type":"url_verification","challenge":"abc123"}"#;
        let envelope: EventEnvelope = serde_json::from_str(body).unwrap();
        assert!(matches!(
            envelope,
            EventEnvelope::UrlVerification { challenge } if challenge == "abc123"
        ));
    }

    #[test]
    fn event_envelope_parses_app_mention() {
        let body = r#"{
            "type": "event_callback",
            "event": {
                "type": "app_mention",
                "user": "U123",
                "text": "<@B0> fix the tests",
                "ts": "1700000000.000100",
                "channel": "C9",
                "thread_ts": "1699999999.000001"
            }
        }"#;
        let envelope: EventEnvelope = serde_json::from_str(body).unwrap();
        let EventEnvelope::EventCallback { event } = envelope else {
            panic!("expected event_callback");
        };
        let ChatEvent::AppMention(message) = event else {
            panic!("expected app_mention");
        };
        assert_eq!(message.user.as_deref(), Some("U123"));
        assert_eq!(message.thread_root(), "1699999999.000001");
        assert!(message.is_actionable());
    }

    #[test]
    fn unknown_event_types_parse_as_other() {
        let body = r#"{"type":"event_callback","event":{"type":"reaction_added"}}"#;
        let envelope: EventEnvelope = serde_json::from_str(body).unwrap();
        let EventEnvelope::EventCallback { event } = envelope else {
            panic!("expected event_callback");
        };
        assert!(matches!(event, ChatEvent::Other));
    }

    #[test]
    fn thread_root_falls_back_to_own_ts() {
        let message = MessageEvent {
            ts: "1700000000.000100".into(),
            channel: "C9".into(),
            ..Default::default()
        };
        assert_eq!(message.thread_root(), "1700000000.000100");
    }

    #[test]
    fn bot_and_subtype_messages_are_not_actionable() {
        let bot = MessageEvent {
            user: Some("U1".into()),
            bot_id: Some("B1".into()),
            ts: "1.0".into(),
            channel: "C1".into(),
            ..Default::default()
        };
        assert!(!bot.is_actionable());

        let edited = MessageEvent {
            user: Some("U1".into()),
            subtype: Some("message_changed".into()),
            ts: "1.0".into(),
            channel: "C1".into(),
            ..Default::default()
        };
        assert!(!edited.is_actionable());
    }
}
