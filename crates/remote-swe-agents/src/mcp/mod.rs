mod manager;

pub use manager::{McpToolInfo, McpToolProvider};
