//! Inbound room message as seen by the bot.

/// `msgtype` of an inbound `m.room.message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Notice,
    Text,
    Other,
}

impl MessageKind {
    pub fn from_msgtype(msgtype: &str) -> Self {
        match msgtype {
            "m.notice" => MessageKind::Notice,
            "m.text" => MessageKind::Text,
            _ => MessageKind::Other,
        }
    }
}

/// A message posted in a room the bot is joined to.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub room_id: String,
    pub sender: String,
    pub body: String,
    pub kind: MessageKind,
}
