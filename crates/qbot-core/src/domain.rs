use serde::{Deserialize, Serialize};

/// Group open id (opaque string issued by the platform).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

/// User open id (opaque string issued by the platform).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

/// Message id, used for reply threading.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

/// Event id, used when replying to a dispatched event instead of a message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

/// Outbound message kind, as the platform numbers them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MsgType {
    #[default]
    Text = 0,
    Markdown = 2,
    /// Rich media (image, file) referenced by a prior upload.
    Media = 7,
}

/// Options for an outbound message. Sending is not idempotent; retry policy
/// belongs to the caller.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub msg_type: MsgType,
    /// Message being replied to, if any.
    pub reply_to_msg_id: Option<MessageId>,
    /// Event being replied to, if any.
    pub event_id: Option<EventId>,
    /// Markdown payload, required by the platform when `msg_type` is
    /// [`MsgType::Markdown`].
    pub markdown: Option<serde_json::Value>,
    /// Media reference (`{file_info}` from a prior upload), required by the
    /// platform when `msg_type` is [`MsgType::Media`].
    pub media: Option<serde_json::Value>,
}
