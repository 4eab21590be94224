//! Best-effort decoder for the game's inner `ChatMsg` documents.
//!
//! Message bodies carry an escaped XML document of the form
//! `<ChatMsg Type="8"><From>alice</From><Msg>hello</Msg></ChatMsg>`.
//! Decoding is structural only: failures are ignored and the decoded form
//! is emitted at debug level.

use std::fmt;

use tracing::debug;

use crate::xml::Element;

/// The chat channel a message was sent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMsgKind {
    Global,
    Event,
    Whisper,
    Group,
    Unknown,
}

impl From<u32> for ChatMsgKind {
    fn from(value: u32) -> Self {
        match value {
            0 => ChatMsgKind::Global,
            1 => ChatMsgKind::Event,
            3 => ChatMsgKind::Whisper,
            8 => ChatMsgKind::Group,
            _ => ChatMsgKind::Unknown,
        }
    }
}

impl fmt::Display for ChatMsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChatMsgKind::Global => "global",
            ChatMsgKind::Event => "event",
            ChatMsgKind::Whisper => "whisper",
            ChatMsgKind::Group => "group",
            ChatMsgKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A decoded chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMsg {
    pub kind: ChatMsgKind,
    pub from: String,
    pub msg: String,
}

/// Decode a message body; `None` when it is not a `ChatMsg` document.
pub fn decode(body: &str) -> Option<ChatMsg> {
    let doc = Element::parse(body).ok()?;
    if doc.name.local != "ChatMsg" {
        return None;
    }
    let kind = match doc.attr("Type") {
        Some(raw) => raw.parse::<u32>().ok()?.into(),
        None => ChatMsgKind::from(0),
    };
    Some(ChatMsg {
        kind,
        from: doc.child("From").map(|c| c.text.clone()).unwrap_or_default(),
        msg: doc.child("Msg").map(|c| c.text.clone()).unwrap_or_default(),
    })
}

/// Decode and log a message body. Parse failures are silently dropped;
/// there is no feedback into routing.
pub fn process_message(body: &str) {
    if let Some(chat) = decode(body) {
        debug!(kind = %chat.kind, from = %chat.from, msg = %chat.msg, "chat message");
    }
}
