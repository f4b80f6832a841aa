//! OneBot v11 event envelope and message segments.
//!
//! Events arrive as JSON frames. `messagePostFormat` is expected to be
//! `array`; a plain-string `message` is accepted best-effort and wrapped into
//! a single text segment (structured media fields are lost in that form).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub card: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// One message segment: `{type, data}`. Data shapes vary by implementation,
/// so fields are probed through accessors instead of a rigid schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Segment {
    pub fn text(content: &str) -> Self {
        Self {
            kind: "text".to_string(),
            data: serde_json::json!({ "text": content }),
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn is_media(&self) -> bool {
        matches!(self.kind.as_str(), "image" | "video" | "record" | "file")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Segments(Vec<Segment>),
    Text(String),
}

impl Default for MessageBody {
    fn default() -> Self {
        Self::Segments(Vec::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotEvent {
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub self_id: Option<i64>,
    pub post_type: String,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub sub_type: Option<String>,
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub message: MessageBody,
    #[serde(default)]
    pub raw_message: Option<String>,
    #[serde(default)]
    pub sender: Option<Sender>,
}

impl BotEvent {
    pub fn is_message(&self) -> bool {
        self.post_type == "message"
    }

    /// Segment view of the message body; the string form becomes one text
    /// segment.
    pub fn segments(&self) -> Vec<Segment> {
        match &self.message {
            MessageBody::Segments(segments) => segments.clone(),
            MessageBody::Text(text) => vec![Segment::text(text)],
        }
    }

    /// Joined plain text of all text segments.
    pub fn plain_text(&self) -> String {
        self.segments()
            .iter()
            .filter(|segment| segment.kind == "text")
            .filter_map(|segment| segment.str_field("text").map(str::to_string))
            .collect::<Vec<_>>()
            .join("")
            .trim()
            .to_string()
    }

    /// Whether any segment @-mentions the given account.
    pub fn mentions(&self, self_id: i64) -> bool {
        self.segments().iter().any(|segment| {
            segment.kind == "at"
                && segment
                    .str_field("qq")
                    .is_some_and(|qq| qq == self_id.to_string() || qq == "all")
        })
    }

    /// Canonical route for a message event, or `None` for non-message events
    /// and disabled/unroutable kinds.
    pub fn route(&self, enable_guilds: bool) -> Option<String> {
        if !self.is_message() {
            return None;
        }
        let route = match self.message_type.as_deref()? {
            "private" => format!("user:{}", self.user_id?),
            "group" => format!("group:{}", self.group_id?),
            "guild" if enable_guilds => {
                format!("guild:{}:{}", self.guild_id.as_ref()?, self.channel_id.as_ref()?)
            }
            _ => return None,
        };
        crate::route::is_valid_qq_route(&route).then_some(route)
    }
}
