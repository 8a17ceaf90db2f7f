//! Gemini `generateContent` client.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::error::{ReplError, ReplResult};
use crate::types::{Message, Role, TokenUsage, ToolDefinition};

use super::{GenerationConfig, Provider, ProviderResponse, ResponsePart};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.into(),
        }
    }

    /// Point the client at a different endpoint (proxies, tests).
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    fn build_body(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        config: &GenerationConfig,
    ) -> Value {
        // System messages become the systemInstruction; tool results ride
        // as user-role turns, which is how the API expects function output
        // to come back when not using its native tool-result parts.
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let contents: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({
                    "role": role,
                    "parts": [{"text": m.content}],
                })
            })
            .collect();

        let mut body = json!({ "contents": contents });

        if !system.is_empty() {
            body["systemInstruction"] = json!({
                "parts": [{"text": system.join("\n\n")}],
            });
        }

        if !tools.is_empty() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }

        let mut generation = serde_json::Map::new();
        if let Some(temperature) = config.temperature {
            generation.insert("temperature".into(), json!(temperature));
        }
        if let Some(max) = config.max_output_tokens {
            generation.insert("maxOutputTokens".into(), json!(max));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        body
    }

    async fn post(&self, model: &str, body: &Value) -> ReplResult<Value> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }
        Ok(response.json().await?)
    }
}

fn map_status(status: StatusCode, body: String) -> ReplError {
    match status.as_u16() {
        429 => ReplError::Throttled(body),
        401 | 403 => ReplError::Unauthorized(body),
        // Quota exhaustion sometimes arrives as a 400 with this status.
        400 if body.contains("RESOURCE_EXHAUSTED") => ReplError::Throttled(body),
        400 => ReplError::BadRequest(body),
        500..=599 => ReplError::Transient(format!("Gemini API {status}: {body}")),
        _ => ReplError::Provider(format!("Gemini API {status}: {body}")),
    }
}

fn parse_response(data: &Value) -> ReplResult<ProviderResponse> {
    let parts = data
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| ReplError::Provider(format!("no candidates in response: {data}")))?;

    let mut out = Vec::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            out.push(ResponsePart::Text(text.to_string()));
        } else if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            out.push(ResponsePart::FunctionCall { name, args });
        }
    }

    let usage = data.get("usageMetadata").map(|u| {
        TokenUsage::new(
            u.get("promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
            u.get("candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
        )
    });

    Ok(ProviderResponse { parts: out, usage })
}

#[async_trait]
impl Provider for GeminiProvider {
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        config: &GenerationConfig,
    ) -> ReplResult<ProviderResponse> {
        let body = self.build_body(messages, tools, config);
        tracing::debug!(model = %config.model, messages = messages.len(), "gemini generate");
        let data = self.post(&config.model, &body).await?;
        parse_response(&data)
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Value,
        temperature: f32,
        model: &str,
    ) -> ReplResult<Value> {
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": temperature,
                "responseMimeType": "application/json",
                "responseSchema": schema,
            },
        });
        let data = self.post(model, &body).await?;
        let text = data
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ReplError::MalformedDecision(format!("no text part in structured response: {data}"))
            })?;
        serde_json::from_str(text)
            .map_err(|e| ReplError::MalformedDecision(format!("invalid JSON from model: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;

    #[test]
    fn build_body_maps_roles() {
        let provider = GeminiProvider::new("k");
        let messages = vec![
            Message::system("be terse"),
            Message::user("hi"),
            Message::assistant("hello"),
            Message::tool("read_file: contents"),
        ];
        let body = provider.build_body(
            &messages,
            &[],
            &GenerationConfig::for_model("gemini-2.0-flash-lite"),
        );

        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user"); // tool result rides as user
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "be terse"
        );
    }

    #[test]
    fn build_body_declares_tools() {
        let provider = GeminiProvider::new("k");
        let body = provider.build_body(
            &[Message::user("list files")],
            &ToolCall::definitions(),
            &GenerationConfig::for_model("gemini-2.0-flash-lite"),
        );
        let declarations = body["tools"][0]["functionDeclarations"].as_array().unwrap();
        assert_eq!(declarations.len(), 3);
        assert_eq!(declarations[1]["name"], "read_file");
        assert_eq!(
            declarations[1]["parameters"]["required"][0],
            "file_path"
        );
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            ReplError::Throttled(_)
        ));
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, String::new()),
            ReplError::Unauthorized(_)
        ));
        assert!(matches!(
            map_status(StatusCode::FORBIDDEN, String::new()),
            ReplError::Unauthorized(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, "bad field".into()),
            ReplError::BadRequest(_)
        ));
        assert!(matches!(
            map_status(
                StatusCode::BAD_REQUEST,
                r#"{"status":"RESOURCE_EXHAUSTED"}"#.into()
            ),
            ReplError::Throttled(_)
        ));
        assert!(matches!(
            map_status(StatusCode::SERVICE_UNAVAILABLE, String::new()),
            ReplError::Transient(_)
        ));
        assert!(matches!(
            map_status(StatusCode::IM_A_TEAPOT, String::new()),
            ReplError::Provider(_)
        ));
    }

    #[test]
    fn parse_response_text_and_calls() {
        let data = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "reading now"},
                        {"functionCall": {"name": "read_file", "args": {"file_path": "README.md"}}},
                    ],
                },
            }],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 8},
        });
        let resp = parse_response(&data).unwrap();
        assert_eq!(resp.text(), "reading now");
        let calls = resp.function_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "read_file");
        assert_eq!(calls[0].1["file_path"], "README.md");
        assert_eq!(resp.usage.unwrap().total(), 20);
    }

    #[test]
    fn parse_response_without_candidates_errors() {
        let err = parse_response(&json!({"promptFeedback": {}})).unwrap_err();
        assert!(matches!(err, ReplError::Provider(_)));
    }
}
