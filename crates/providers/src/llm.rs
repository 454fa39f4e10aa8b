//! OpenAI-compatible streaming chat client
//!
//! One-shot `POST {base_url}/chat/completions` with `stream: true`; the
//! response body is server-sent events whose `data:` payloads carry content
//! deltas and tool-call deltas, terminated by `data: [DONE]`. Cancellation
//! drops the response body, which closes the connection.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use voiceloop_config::LlmSettings;
use voiceloop_core::{
    CancellationToken, ChatEvent, ChatMessage, ChatOutcome, ChatProvider, ChatStream, Error,
    FinishReason, GenerationParams, Result, Role, Token, ToolCall,
};

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

impl From<ChatMessage> for WireMessage {
    fn from(message: ChatMessage) -> Self {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        Self {
            role,
            content: message.content,
        }
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Chat provider over an OpenAI-compatible endpoint
pub struct OpenAiChatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChatProvider {
    pub fn new(settings: &LlmSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    async fn open(
        &self,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
        cancel: CancellationToken,
    ) -> Result<ChatStream> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: messages.into_iter().map(WireMessage::from).collect(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::LlmFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat completion rejected");
            return Err(Error::LlmFailed(format!("{status}: {body}")));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(read_sse(response, tx, cancel));
        Ok(ChatStream { events: rx })
    }
}

/// Accumulates tool-call deltas by index
#[derive(Default)]
struct ToolCallBuilder {
    calls: Vec<ToolCall>,
}

impl ToolCallBuilder {
    fn apply(&mut self, delta: ToolCallDelta) {
        while self.calls.len() <= delta.index {
            self.calls.push(ToolCall {
                id: String::new(),
                name: String::new(),
                arguments: String::new(),
            });
        }
        let call = &mut self.calls[delta.index];
        if let Some(id) = delta.id {
            call.id = id;
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                call.name = name;
            }
            if let Some(arguments) = function.arguments {
                call.arguments.push_str(&arguments);
            }
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls
    }
}

async fn read_sse(
    response: reqwest::Response,
    tx: mpsc::Sender<ChatEvent>,
    cancel: CancellationToken,
) {
    let mut body = response.bytes_stream();
    let mut line_buf = String::new();
    let mut index = 0u32;
    let mut finish = FinishReason::Stop;
    let mut tools = ToolCallBuilder::default();

    loop {
        let chunk = tokio::select! {
            // dropping the body aborts the HTTP stream well inside 100 ms
            _ = cancel.cancelled() => return,
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                line_buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = line_buf.find('\n') {
                    let line: String = line_buf.drain(..=pos).collect();
                    let line = line.trim();
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        let _ = tx
                            .send(ChatEvent::Done(ChatOutcome {
                                finish,
                                tool_calls: tools.finish(),
                            }))
                            .await;
                        return;
                    }
                    match serde_json::from_str::<StreamChunk>(payload) {
                        Ok(chunk) => {
                            for choice in chunk.choices {
                                if let Some(text) = choice.delta.content {
                                    if !text.is_empty() {
                                        let token = Token::new(text, index);
                                        index += 1;
                                        if tx.send(ChatEvent::Token(token)).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                if let Some(deltas) = choice.delta.tool_calls {
                                    for delta in deltas {
                                        tools.apply(delta);
                                    }
                                }
                                if let Some(reason) = choice.finish_reason {
                                    finish = match reason.as_str() {
                                        "length" => FinishReason::Length,
                                        "tool_calls" => FinishReason::ToolCalls,
                                        _ => FinishReason::Stop,
                                    };
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed stream chunk");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                // tokens already delivered stay valid; the turn decides what
                // to do with the partial reply
                let _ = tx
                    .send(ChatEvent::Error(Error::LlmInterrupted(e.to_string())))
                    .await;
                return;
            }
            None => {
                // stream ended without [DONE]; treat as a normal stop
                let _ = tx
                    .send(ChatEvent::Done(ChatOutcome {
                        finish,
                        tool_calls: tools.finish(),
                    }))
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roles_are_lowercase() {
        let wire: WireMessage = ChatMessage::system("s").into();
        assert_eq!(wire.role, "system");
        let wire: WireMessage = ChatMessage::assistant("a").into();
        assert_eq!(wire.role, "assistant");
    }

    #[test]
    fn tool_call_builder_accumulates_deltas() {
        let mut builder = ToolCallBuilder::default();
        builder.apply(ToolCallDelta {
            index: 0,
            id: Some("call_1".into()),
            function: Some(FunctionDelta {
                name: Some("lookup".into()),
                arguments: Some("{\"q\":".into()),
            }),
        });
        builder.apply(ToolCallDelta {
            index: 0,
            id: None,
            function: Some(FunctionDelta {
                name: None,
                arguments: Some("\"x\"}".into()),
            }),
        });
        let calls = builder.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "lookup");
        assert_eq!(calls[0].arguments, "{\"q\":\"x\"}");
    }

    #[test]
    fn stream_chunk_parses_delta_content() {
        let payload = r#"{"choices":[{"delta":{"content":" hi"},"finish_reason":null}]}"#;
        let chunk: StreamChunk = serde_json::from_str(payload).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some(" hi"));
    }

    #[test]
    fn request_serializes_stream_flag() {
        let request = ChatCompletionRequest {
            model: "m",
            messages: vec![ChatMessage::user("hello").into()],
            temperature: 0.7,
            max_tokens: 100,
            stream: true,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"stream\":true"));
        assert!(json.contains("\"role\":\"user\""));
    }
}
