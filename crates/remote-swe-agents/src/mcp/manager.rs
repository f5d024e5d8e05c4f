use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use remote_swe_common::{ContentBlock, Error, Result};
use remote_swe_config::McpServerConfig;
use rmcp::ServiceExt;
use rmcp::model::CallToolRequestParams;
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::TokioChildProcess;
use serde_json::{Value, json};
use tokio::process::Command;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};

use crate::providers::ToolDefinition;
use crate::tools::ExternalToolProvider;

/// Cached info about a tool discovered from an MCP server.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub server: String,
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// A live connection to one MCP server.
struct McpConnection {
    service: RunningService<RoleClient, ()>,
    tools: Vec<McpToolInfo>,
    timeout: Duration,
}

/// Exposes the tools of configured MCP servers to the dispatcher.
///
/// Servers are spawned lazily on first use. A server that fails to start is
/// logged and skipped; the rest stay available.
pub struct McpToolProvider {
    servers: Vec<(String, McpServerConfig)>,
    connections: RwLock<HashMap<String, McpConnection>>,
    started: OnceCell<()>,
}

impl McpToolProvider {
    pub fn new(servers: HashMap<String, McpServerConfig>) -> Self {
        let mut servers: Vec<(String, McpServerConfig)> = servers
            .into_iter()
            .filter(|(_, config)| config.is_enabled())
            .collect();
        servers.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            servers,
            connections: RwLock::new(HashMap::new()),
            started: OnceCell::new(),
        }
    }

    pub fn server_names(&self) -> Vec<&str> {
        self.servers.iter().map(|(name, _)| name.as_str()).collect()
    }

    async fn ensure_started(&self) {
        self.started
            .get_or_init(|| async {
                for (name, config) in &self.servers {
                    match connect(name, config).await {
                        Ok(conn) => {
                            self.connections.write().await.insert(name.clone(), conn);
                        }
                        Err(e) => warn!("skipping MCP server '{name}': {e}"),
                    }
                }
            })
            .await;
    }

    /// Tool info for every connected server.
    pub async fn tool_info(&self) -> Vec<McpToolInfo> {
        self.ensure_started().await;
        let conns = self.connections.read().await;
        let mut tools: Vec<McpToolInfo> =
            conns.values().flat_map(|c| c.tools.iter().cloned()).collect();
        tools.sort_by(|a, b| (&a.server, &a.name).cmp(&(&b.server, &b.name)));
        tools
    }
}

async fn connect(name: &str, config: &McpServerConfig) -> Result<McpConnection> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);
    for (k, v) in &config.env {
        cmd.env(k, v);
    }

    let transport = TokioChildProcess::new(cmd)
        .map_err(|e| Error::Mcp(format!("failed to spawn MCP server '{name}': {e}")))?;

    let timeout_secs = config.timeout_secs();
    let service = tokio::time::timeout(Duration::from_secs(timeout_secs), ().serve(transport))
        .await
        .map_err(|_| {
            Error::Mcp(format!(
                "MCP server '{name}' handshake timed out after {timeout_secs}s"
            ))
        })?
        .map_err(|e| Error::Mcp(format!("MCP server '{name}' handshake failed: {e}")))?;

    let mcp_tools = service
        .list_all_tools()
        .await
        .map_err(|e| Error::Mcp(format!("failed to list tools from '{name}': {e}")))?;

    let tools: Vec<McpToolInfo> = mcp_tools
        .into_iter()
        .map(|t| McpToolInfo {
            server: name.to_string(),
            name: t.name.to_string(),
            description: t.description.map(|d| d.to_string()),
            input_schema: serde_json::to_value(&*t.input_schema).unwrap_or_else(|_| json!({})),
        })
        .collect();

    info!(
        "MCP server '{name}' connected: {} tool(s) discovered",
        tools.len()
    );

    Ok(McpConnection {
        service,
        tools,
        timeout: Duration::from_secs(timeout_secs),
    })
}

/// Map MCP result content (`text` / base64 `image`) onto content blocks.
fn content_from_result(result: &Value) -> Result<Vec<ContentBlock>> {
    let items = result["content"].as_array().cloned().unwrap_or_default();
    let mut blocks = Vec::with_capacity(items.len());
    for item in &items {
        match item["type"].as_str() {
            Some("text") => {
                blocks.push(ContentBlock::text(item["text"].as_str().unwrap_or_default()));
            }
            Some("image") => {
                let data = item["data"]
                    .as_str()
                    .ok_or_else(|| Error::Mcp("image content without data".into()))?;
                let bytes = BASE64
                    .decode(data)
                    .map_err(|e| Error::Mcp(format!("invalid image data: {e}")))?;
                let format = item["mimeType"]
                    .as_str()
                    .and_then(|m| m.split('/').nth(1))
                    .unwrap_or("png");
                blocks.push(ContentBlock::image_bytes(format, bytes));
            }
            other => {
                return Err(Error::Mcp(format!(
                    "unsupported MCP content type: {}",
                    other.unwrap_or("<missing>")
                )));
            }
        }
    }
    Ok(blocks)
}

#[async_trait]
impl ExternalToolProvider for McpToolProvider {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        Ok(self
            .tool_info()
            .await
            .into_iter()
            .map(|t| ToolDefinition {
                description: t.description.unwrap_or_else(|| t.name.clone()),
                name: t.name,
                input_schema: t.input_schema,
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, input: Value) -> Result<Vec<ContentBlock>> {
        self.ensure_started().await;
        let conns = self.connections.read().await;
        let (server, conn) = conns
            .iter()
            .find(|(_, c)| c.tools.iter().any(|t| t.name == name))
            .ok_or_else(|| Error::Mcp(format!("no MCP server provides tool '{name}'")))?;

        let arguments = match input {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(Error::Mcp(format!(
                    "MCP tool arguments must be an object, got: {other}"
                )));
            }
        };
        let params: CallToolRequestParams =
            serde_json::from_value(json!({ "name": name, "arguments": arguments }))?;

        let result = tokio::time::timeout(conn.timeout, conn.service.call_tool(params))
            .await
            .map_err(|_| Error::Mcp(format!("tool '{name}' on '{server}' timed out")))?
            .map_err(|e| Error::Mcp(format!("tool '{name}' on '{server}' failed: {e}")))?;

        content_from_result(&serde_json::to_value(&result)?)
    }

    async fn shutdown(&self) {
        let conns: HashMap<String, McpConnection> =
            std::mem::take(&mut *self.connections.write().await);
        for (name, conn) in conns {
            info!("disconnecting MCP server '{name}'");
            if let Err(e) = conn.service.cancel().await {
                warn!("error cancelling MCP server '{name}': {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_text_and_image_content() {
        let result = json!({
            "content": [
                { "type": "text", "text": "page loaded" },
                { "type": "image", "data": BASE64.encode([1u8, 2, 3]), "mimeType": "image/jpeg" }
            ],
            "isError": false
        });
        let blocks = content_from_result(&result).expect("map");
        assert_eq!(blocks[0], ContentBlock::text("page loaded"));
        assert_eq!(blocks[1], ContentBlock::image_bytes("jpeg", vec![1, 2, 3]));
    }

    #[test]
    fn rejects_unknown_content() {
        let result = json!({ "content": [{ "type": "resource", "resource": {} }] });
        assert!(content_from_result(&result).is_err());
    }

    #[tokio::test]
    async fn unreachable_server_is_skipped() {
        let mut servers = HashMap::new();
        servers.insert(
            "broken".to_string(),
            McpServerConfig {
                command: "/nonexistent/mcp-server-binary".into(),
                args: Vec::new(),
                env: HashMap::new(),
                enabled: None,
                timeout_secs: Some(1),
            },
        );
        let provider = McpToolProvider::new(servers);
        assert_eq!(provider.server_names(), vec!["broken"]);
        assert!(provider.list_tools().await.expect("list").is_empty());
        assert!(provider.call_tool("anything", json!({})).await.is_err());
    }
}
