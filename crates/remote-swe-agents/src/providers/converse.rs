use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use remote_swe_common::{
    ChatMessage, ChatRole, ContentBlock, Error, ImageSource, Result, TokenUsage,
};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    InferenceBackend, InferenceRequest, InferenceResponse, ModelTarget, StopReason, ToolChoice,
};

/// Bedrock runtime `Converse` API over HTTPS with bearer-token auth.
pub struct ConverseBackend {
    client: Client,
    base_url: Option<String>,
}

impl Default for ConverseBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ConverseBackend {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: None,
        }
    }

    /// Send every request to `base_url` instead of the regional endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn endpoint(&self, target: &ModelTarget) -> String {
        let base = self
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://bedrock-runtime.{}.amazonaws.com", target.region));
        let model: String = url::form_urlencoded::byte_serialize(target.model_id.as_bytes()).collect();
        format!("{base}/model/{model}/converse")
    }
}

#[async_trait]
impl InferenceBackend for ConverseBackend {
    fn backend_id(&self) -> &str {
        "bedrock-converse"
    }

    async fn converse(
        &self,
        target: &ModelTarget,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse> {
        let body = build_request_body(request)?;
        let url = self.endpoint(target);
        debug!("POST {url} ({} messages)", request.messages.len());

        let mut http = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(key) = &target.api_key {
            http = http.bearer_auth(key);
        }

        let response = http
            .send()
            .await
            .map_err(|e| Error::Inference(format!("network error: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_type = response
                .headers()
                .get("x-amzn-errortype")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_error(status.as_u16(), &error_type, &text));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| Error::Inference(format!("invalid response body: {e}")))?;
        parse_response(&raw)
    }
}

fn classify_error(status: u16, error_type: &str, body: &str) -> Error {
    let throttled = status == 429
        || error_type.contains("ThrottlingException")
        || body.contains("ThrottlingException");
    if throttled {
        Error::Throttled(format!("status={status}: {body}"))
    } else {
        Error::Inference(format!("converse failed: status={status}, body={body}"))
    }
}

pub(crate) fn build_request_body(request: &InferenceRequest) -> Result<Value> {
    let messages = request
        .messages
        .iter()
        .map(message_to_wire)
        .collect::<Result<Vec<_>>>()?;
    let system = request
        .system
        .iter()
        .map(block_to_wire)
        .collect::<Result<Vec<_>>>()?;

    let mut body = json!({
        "messages": messages,
        "system": system,
    });

    if let Some(max_tokens) = request.max_tokens {
        body["inferenceConfig"] = json!({ "maxTokens": max_tokens });
    }

    if let Some(config) = &request.tool_config {
        let mut tools: Vec<Value> = config
            .tools
            .iter()
            .map(|t| {
                json!({
                    "toolSpec": {
                        "name": t.name,
                        "description": t.description,
                        "inputSchema": { "json": t.input_schema }
                    }
                })
            })
            .collect();
        if config.cache_point {
            tools.push(json!({ "cachePoint": { "type": "default" } }));
        }
        let mut tool_config = json!({ "tools": tools });
        if let Some(choice) = &config.tool_choice {
            tool_config["toolChoice"] = match choice {
                ToolChoice::Auto => json!({ "auto": {} }),
                ToolChoice::Any => json!({ "any": {} }),
                ToolChoice::Tool { name } => json!({ "tool": { "name": name } }),
            };
        }
        body["toolConfig"] = tool_config;
    }

    if let Some(reasoning) = request.reasoning {
        body["additionalModelRequestFields"] = json!({
            "reasoning_config": {
                "type": "enabled",
                "budget_tokens": reasoning.budget_tokens
            }
        });
    }

    Ok(body)
}

fn message_to_wire(message: &ChatMessage) -> Result<Value> {
    let content = message
        .content
        .iter()
        .map(block_to_wire)
        .collect::<Result<Vec<_>>>()?;
    Ok(json!({
        "role": message.role.as_str(),
        "content": content,
    }))
}

fn block_to_wire(block: &ContentBlock) -> Result<Value> {
    Ok(match block {
        ContentBlock::Text { text } => json!({ "text": text }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "toolUse": { "toolUseId": id, "name": name, "input": input }
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => {
            let inner = content
                .iter()
                .map(block_to_wire)
                .collect::<Result<Vec<_>>>()?;
            json!({ "toolResult": { "toolUseId": tool_use_id, "content": inner } })
        }
        ContentBlock::Image { format, source } => match source {
            ImageSource::Bytes { data } => json!({
                "image": { "format": format, "source": { "bytes": BASE64.encode(data) } }
            }),
            ImageSource::Blob { key } => {
                return Err(Error::Inference(format!(
                    "image {key} was not rehydrated before sending"
                )));
            }
        },
        ContentBlock::Reasoning { text, signature } => {
            let mut reasoning_text = json!({ "text": text });
            if let Some(signature) = signature {
                reasoning_text["signature"] = json!(signature);
            }
            json!({ "reasoningContent": { "reasoningText": reasoning_text } })
        }
        ContentBlock::CachePoint => json!({ "cachePoint": { "type": "default" } }),
    })
}

pub(crate) fn parse_response(raw: &Value) -> Result<InferenceResponse> {
    let stop_reason = raw["stopReason"]
        .as_str()
        .map(StopReason::parse)
        .ok_or_else(|| Error::Inference("response is missing stopReason".into()))?;

    let message = match raw["output"].get("message") {
        Some(message) if !message.is_null() => Some(message_from_wire(message)?),
        _ => None,
    };

    let usage = raw.get("usage").filter(|u| u.is_object()).map(|u| TokenUsage {
        input_tokens: u["inputTokens"].as_u64().unwrap_or(0),
        output_tokens: u["outputTokens"].as_u64().unwrap_or(0),
        cache_read_tokens: u["cacheReadInputTokens"].as_u64().unwrap_or(0),
        cache_write_tokens: u["cacheWriteInputTokens"].as_u64().unwrap_or(0),
    });

    Ok(InferenceResponse {
        stop_reason,
        message,
        usage,
    })
}

fn message_from_wire(raw: &Value) -> Result<ChatMessage> {
    let role = match raw["role"].as_str() {
        Some("user") => ChatRole::User,
        Some("assistant") | None => ChatRole::Assistant,
        Some(other) => return Err(Error::Inference(format!("unknown role '{other}'"))),
    };
    let content = raw["content"]
        .as_array()
        .map(|blocks| blocks.iter().map(block_from_wire).collect::<Result<Vec<_>>>())
        .transpose()?
        .unwrap_or_default();
    Ok(ChatMessage { role, content })
}

fn block_from_wire(raw: &Value) -> Result<ContentBlock> {
    if let Some(text) = raw.get("text").and_then(Value::as_str) {
        return Ok(ContentBlock::text(text));
    }
    if let Some(tool_use) = raw.get("toolUse") {
        return Ok(ContentBlock::ToolUse {
            id: tool_use["toolUseId"].as_str().unwrap_or_default().to_string(),
            name: tool_use["name"].as_str().unwrap_or_default().to_string(),
            input: tool_use.get("input").cloned().unwrap_or(Value::Null),
        });
    }
    if let Some(reasoning) = raw.get("reasoningContent") {
        let text = &reasoning["reasoningText"];
        return Ok(ContentBlock::Reasoning {
            text: text["text"].as_str().unwrap_or_default().to_string(),
            signature: text["signature"].as_str().map(str::to_string),
        });
    }
    if let Some(image) = raw.get("image") {
        let data = image["source"]["bytes"]
            .as_str()
            .ok_or_else(|| Error::Inference("image block without bytes".into()))?;
        let data = BASE64
            .decode(data)
            .map_err(|e| Error::Inference(format!("invalid image bytes: {e}")))?;
        return Ok(ContentBlock::image_bytes(
            image["format"].as_str().unwrap_or("png"),
            data,
        ));
    }
    if raw.get("cachePoint").is_some() {
        return Ok(ContentBlock::CachePoint);
    }
    Err(Error::Inference(format!("unsupported content block: {raw}")))
}
