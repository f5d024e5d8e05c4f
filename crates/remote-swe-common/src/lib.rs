pub mod content;
pub mod error;

pub use content::{
    ChatMessage, ChatRole, ContentBlock, ImageSource, MessageRecord, MessageType, TokenUsage,
};
pub use error::{Error, ErrorKind, Result};
