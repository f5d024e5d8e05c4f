use std::sync::Arc;

use remote_swe_common::{ChatMessage, ContentBlock, Error, Result};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ExternalToolProvider, Tool, ToolContext, ToolOutput};
use crate::prompt::render_tool_result;
use crate::providers::ToolDefinition;

/// Result of one tool invocation, correlated by tool-use id.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecution {
    pub tool_use_id: String,
    pub name: String,
    pub succeeded: bool,
    pub content: Vec<ContentBlock>,
}

/// Routes tool-use requests to external providers or the local registry.
pub struct ToolDispatcher {
    local: Vec<Arc<dyn Tool>>,
    external: Option<Arc<dyn ExternalToolProvider>>,
    external_tools: OnceCell<Vec<ToolDefinition>>,
}

impl Default for ToolDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self {
            local: Vec::new(),
            external: None,
            external_tools: OnceCell::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        info!("registered tool: {}", tool.name());
        self.local.push(tool);
    }

    pub fn with_external(mut self, provider: Arc<dyn ExternalToolProvider>) -> Self {
        self.external = Some(provider);
        self
    }

    /// External tool list, discovered on first use and kept for the process.
    async fn external_tools(&self) -> &[ToolDefinition] {
        let Some(provider) = &self.external else {
            return &[];
        };
        self.external_tools
            .get_or_init(|| async {
                match provider.list_tools().await {
                    Ok(tools) => {
                        info!("discovered {} external tool(s)", tools.len());
                        tools
                    }
                    Err(e) => {
                        warn!("external tool discovery failed, continuing without: {e}");
                        Vec::new()
                    }
                }
            })
            .await
    }

    /// Everything the model may call: external tools first, then local ones.
    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = self.external_tools().await.to_vec();
        defs.extend(self.local.iter().map(|t| t.describe()));
        defs
    }

    fn find_local(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.local.iter().find(|t| t.name() == name)
    }

    async fn invoke(
        &self,
        context: &ToolContext,
        name: &str,
        input: &serde_json::Value,
    ) -> Result<ToolOutput> {
        if let Some(provider) = &self.external {
            if self.external_tools().await.iter().any(|t| t.name == name) {
                return provider
                    .call_tool(name, input.clone())
                    .await
                    .map(ToolOutput::Blocks);
            }
        }

        let tool = self
            .find_local(name)
            .ok_or_else(|| Error::Tool(format!("tool {name} is not found")))?;
        validate_input(&tool.input_schema(), input)?;
        tool.invoke(context, input.clone()).await
    }

    /// Run one tool-use request. Failures become error text, never an `Err`.
    pub async fn execute(
        &self,
        context: &ToolContext,
        tool_use_id: &str,
        name: &str,
        input: &serde_json::Value,
        force_report: bool,
    ) -> ToolExecution {
        info!("using tool {name} ({tool_use_id})");
        let (succeeded, content) = match self.invoke(context, name, input).await {
            Ok(ToolOutput::Text(text)) => (
                true,
                vec![ContentBlock::text(render_tool_result(&text, force_report))],
            ),
            Ok(ToolOutput::Blocks(blocks)) => (true, blocks),
            Err(e) => {
                warn!("tool {name} failed: {e}");
                (
                    false,
                    vec![ContentBlock::text(format!(
                        "Error occurred when using tool {name}: {}",
                        error_detail(&e)
                    ))],
                )
            }
        };
        ToolExecution {
            tool_use_id: tool_use_id.to_string(),
            name: name.to_string(),
            succeeded,
            content,
        }
    }

    /// Execute every tool-use request in `message`, in order, and combine the
    /// results into a single user message. Returns `Error::Cancelled` without
    /// invoking the next tool once `cancel` fires.
    pub async fn execute_turn(
        &self,
        context: &ToolContext,
        message: &ChatMessage,
        force_report: bool,
        cancel: &CancellationToken,
    ) -> Result<(ChatMessage, Vec<ToolExecution>)> {
        let mut executions = Vec::new();
        for (id, name, input) in message.tool_uses() {
            if cancel.is_cancelled() {
                info!("skipping tool {name} ({id}): loop cancelled");
                return Err(Error::Cancelled);
            }
            executions.push(self.execute(context, id, name, input, force_report).await);
        }
        if executions.is_empty() {
            return Err(Error::Agent("model requested tools but sent no tool use".into()));
        }

        let content = executions
            .iter()
            .map(|e| ContentBlock::ToolResult {
                tool_use_id: e.tool_use_id.clone(),
                content: e.content.clone(),
            })
            .collect();
        Ok((ChatMessage::user(content), executions))
    }

    pub async fn shutdown(&self) {
        if let Some(provider) = &self.external {
            provider.shutdown().await;
        }
    }
}

fn error_detail(error: &Error) -> String {
    match error {
        Error::Tool(msg) | Error::Mcp(msg) | Error::Agent(msg) => msg.clone(),
        other => other.to_string(),
    }
}

fn validate_input(schema: &serde_json::Value, input: &serde_json::Value) -> Result<()> {
    let validator = jsonschema::Validator::new(schema)
        .map_err(|e| Error::Tool(format!("invalid tool schema: {e}")))?;
    if validator.is_valid(input) {
        return Ok(());
    }
    let errors: Vec<String> = validator.iter_errors(input).map(|e| e.to_string()).collect();
    Err(Error::Tool(format!("invalid input: {}", errors.join("; "))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::OutboundHooks;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopHooks;

    #[async_trait]
    impl OutboundHooks for NoopHooks {
        async fn send_final_answer(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn send_progress(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn reset_idle_timer(&self, _: &str) {}
    }

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo the input"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn invoke(&self, _: &ToolContext, input: serde_json::Value) -> Result<ToolOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::text(input["text"].as_str().unwrap_or_default()))
        }
    }

    struct FakeExternal {
        calls: AtomicUsize,
        lists: AtomicUsize,
    }

    #[async_trait]
    impl ExternalToolProvider for FakeExternal {
        async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ToolDefinition {
                name: "echo".into(),
                description: "remote echo".into(),
                input_schema: json!({"type": "object"}),
            }])
        }
        async fn call_tool(&self, _: &str, _: serde_json::Value) -> Result<Vec<ContentBlock>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ContentBlock::text("from external")])
        }
    }

    fn context() -> ToolContext {
        ToolContext {
            conversation_id: "c1".into(),
            hooks: Arc::new(NoopHooks),
        }
    }

    fn local_dispatcher() -> (ToolDispatcher, Arc<Echo>) {
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let mut dispatcher = ToolDispatcher::new();
        dispatcher.register(echo.clone());
        (dispatcher, echo)
    }

    fn text_of(execution: &ToolExecution) -> &str {
        match &execution.content[0] {
            ContentBlock::Text { text } => text,
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_text_results_are_rendered() {
        let (dispatcher, _) = local_dispatcher();
        let execution = dispatcher
            .execute(&context(), "t1", "echo", &json!({"text": "hi"}), false)
            .await;
        assert!(execution.succeeded);
        assert!(text_of(&execution).starts_with("<result>\nhi\n</result>"));
    }

    #[tokio::test]
    async fn unknown_tool_is_a_tool_level_error() {
        let (dispatcher, _) = local_dispatcher();
        let execution = dispatcher
            .execute(&context(), "t1", "deploy", &json!({}), false)
            .await;
        assert!(!execution.succeeded);
        assert_eq!(
            text_of(&execution),
            "Error occurred when using tool deploy: tool deploy is not found"
        );
    }

    #[tokio::test]
    async fn schema_violation_skips_invocation() {
        let (dispatcher, echo) = local_dispatcher();
        let execution = dispatcher
            .execute(&context(), "t1", "echo", &json!({"text": 42}), false)
            .await;
        assert!(!execution.succeeded);
        assert!(text_of(&execution).contains("invalid input"));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn external_provider_wins_and_is_discovered_once() {
        let (dispatcher, echo) = local_dispatcher();
        let external = Arc::new(FakeExternal {
            calls: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
        });
        let dispatcher = dispatcher.with_external(external.clone());

        for _ in 0..3 {
            let execution = dispatcher
                .execute(&context(), "t1", "echo", &json!({"text": "x"}), false)
                .await;
            assert_eq!(text_of(&execution), "from external");
        }
        assert_eq!(dispatcher.definitions().await.len(), 2);
        assert_eq!(external.lists.load(Ordering::SeqCst), 1);
        assert_eq!(external.calls.load(Ordering::SeqCst), 3);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn turn_results_are_combined_in_request_order() {
        let (dispatcher, _) = local_dispatcher();
        let message = ChatMessage::assistant(vec![
            ContentBlock::ToolUse {
                id: "a".into(),
                name: "echo".into(),
                input: json!({"text": "one"}),
            },
            ContentBlock::ToolUse {
                id: "b".into(),
                name: "missing".into(),
                input: json!({}),
            },
        ]);
        let (result, executions) = dispatcher
            .execute_turn(&context(), &message, false, &CancellationToken::new())
            .await
            .expect("turn");

        assert_eq!(executions.len(), 2);
        let ids: Vec<&str> = result
            .content
            .iter()
            .map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => tool_use_id.as_str(),
                other => panic!("unexpected block {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(!executions[1].succeeded);
    }

    #[tokio::test]
    async fn turn_without_tool_use_is_fatal() {
        let (dispatcher, _) = local_dispatcher();
        let message = ChatMessage::assistant(vec![ContentBlock::text("no tools")]);
        let result = dispatcher
            .execute_turn(&context(), &message, false, &CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancelled_turn_invokes_no_tool() {
        let (dispatcher, echo) = local_dispatcher();
        let message = ChatMessage::assistant(vec![ContentBlock::ToolUse {
            id: "a".into(),
            name: "echo".into(),
            input: json!({"text": "one"}),
        }]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = dispatcher
            .execute_turn(&context(), &message, false, &cancel)
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }
}
