use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A single piece of message content.
///
/// Image bytes only ever live in memory. Before a block reaches durable
/// storage its [`ImageSource::Bytes`] is swapped for an [`ImageSource::Blob`]
/// reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ContentBlock>,
    },
    Image {
        format: String,
        source: ImageSource,
    },
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Prompt-cache boundary marker. Never persisted.
    CachePoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    Bytes {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Blob {
        key: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn image_bytes(format: impl Into<String>, data: Vec<u8>) -> Self {
        ContentBlock::Image {
            format: format.into(),
            source: ImageSource::Bytes { data },
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, ContentBlock::ToolUse { .. })
    }

    pub fn is_reasoning(&self) -> bool {
        matches!(self, ContentBlock::Reasoning { .. })
    }

    pub fn is_cache_point(&self) -> bool {
        matches!(self, ContentBlock::CachePoint)
    }

    /// True if this block, or any block nested in a tool result, carries raw
    /// image bytes.
    pub fn has_inline_bytes(&self) -> bool {
        match self {
            ContentBlock::Image {
                source: ImageSource::Bytes { .. },
                ..
            } => true,
            ContentBlock::ToolResult { content, .. } => content.iter().any(Self::has_inline_bytes),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

impl FromStr for ChatRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ChatRole::User),
            "assistant" => Ok(ChatRole::Assistant),
            other => Err(Error::Database(format!("unknown role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: ChatRole::User,
            content,
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content,
        }
    }

    /// Tool-use requests in the order the model emitted them.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }
}

/// Kind of record stored in a conversation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    UserMessage,
    ToolUse,
    ToolResult,
    Assistant,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::UserMessage => "userMessage",
            MessageType::ToolUse => "toolUse",
            MessageType::ToolResult => "toolResult",
            MessageType::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "userMessage" => Ok(MessageType::UserMessage),
            "toolUse" => Ok(MessageType::ToolUse),
            "toolResult" => Ok(MessageType::ToolResult),
            "assistant" => Ok(MessageType::Assistant),
            other => Err(Error::Database(format!("unknown message type '{other}'"))),
        }
    }
}

/// One durable entry of a conversation log.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub conversation_id: String,
    /// Zero-padded millisecond timestamp; sorts lexicographically.
    pub sequence_key: String,
    pub role: ChatRole,
    pub message_type: MessageType,
    pub content: Vec<ContentBlock>,
    /// May be negative after a usage correction.
    pub token_count: i64,
    pub author_user_id: Option<String>,
}

impl MessageRecord {
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Token usage reported by the inference backend for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    /// Prompt size as seen by the model, cached portions included.
    pub fn prompt_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.cache_write_tokens
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
