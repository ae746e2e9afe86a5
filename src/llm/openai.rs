//! OpenAI chat completions over HTTP, streamed as server-sent events.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::error::{LlmError, RetrievalError};
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionStream, FinishReason, LlmProvider, Role,
    StreamEvent, TokenUsage, ToolCall,
};
use crate::retrieval::Embedder;

const PROVIDER: &str = "openai";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible chat and embeddings client.
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    embedding_model: String,
}

impl OpenAiProvider {
    pub fn new(
        client: reqwest::Client,
        api_key: SecretString,
        model: impl Into<String>,
        embedding_model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model: model.into(),
            embedding_model: embedding_model.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(message_to_json).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }

    /// POST `body` to `{base_url}/{path}`, mapping transport and status errors.
    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("{path}: {e}"),
            })?;
        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status.as_u16() {
        401 | 403 => Err(LlmError::AuthFailed {
            provider: PROVIDER.to_string(),
        }),
        429 => {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            Err(LlmError::RateLimited {
                provider: PROVIDER.to_string(),
                retry_after,
            })
        }
        _ => {
            let text = response.text().await.unwrap_or_default();
            let detail: String = text.chars().take(300).collect();
            Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("HTTP {status}: {detail}"),
            })
        }
    }
}

fn message_to_json(msg: &ChatMessage) -> Value {
    match msg.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.as_deref().unwrap_or_default(),
            "content": msg.content,
        }),
        Role::Assistant if !msg.tool_calls.is_empty() => {
            let calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|call| {
                    let arguments = match &call.arguments {
                        Value::String(raw) => raw.clone(),
                        other => other.to_string(),
                    };
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": arguments },
                    })
                })
                .collect();
            let content = if msg.content.is_empty() {
                Value::Null
            } else {
                Value::String(msg.content.clone())
            };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        role => json!({ "role": role.as_str(), "content": msg.content }),
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, LlmError> {
        let body = self.request_body(&request);
        tracing::debug!(
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Starting streaming completion"
        );
        let response = self.post("chat/completions", &body).await?;
        let bytes: BoxStream<'static, Result<Vec<u8>, reqwest::Error>> = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Ok(sse_events(bytes))
    }
}

#[async_trait]
impl Embedder for OpenAiProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let body = json!({ "model": self.embedding_model, "input": text });
        let failed = |reason: String| RetrievalError::EmbeddingFailed { reason };

        let response = self
            .post("embeddings", &body)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| failed(format!("invalid embeddings response: {e}")))?;
        let embedding = value["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| failed("embeddings response has no data".to_string()))?;
        embedding
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| failed("non-numeric embedding value".to_string()))
            })
            .collect()
    }
}

struct SseState {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: ChunkDecoder,
    pending: VecDeque<Result<StreamEvent, LlmError>>,
    exhausted: bool,
}

/// Turn a raw SSE byte stream into completion events.
fn sse_events(body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>) -> CompletionStream {
    let state = SseState {
        body,
        decoder: ChunkDecoder::default(),
        pending: VecDeque::new(),
        exhausted: false,
    };
    let stream = futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.exhausted {
                return None;
            }
            let decoded = match st.body.next().await {
                Some(Ok(chunk)) => st.decoder.push(&chunk),
                Some(Err(e)) => Err(LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: format!("stream interrupted: {e}"),
                }),
                None => {
                    st.exhausted = true;
                    st.decoder.finish()
                }
            };
            match decoded {
                Ok(events) => st.pending.extend(events.into_iter().map(Ok)),
                Err(e) => {
                    st.exhausted = true;
                    st.pending.push_back(Err(e));
                }
            }
            if st.decoder.is_done() {
                st.exhausted = true;
            }
        }
    });
    Box::pin(stream)
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Incremental decoder for OpenAI's streaming chat format.
///
/// Bytes may be split anywhere, including inside a UTF-8 sequence; lines are
/// only decoded once complete. Tool call fragments are accumulated by index
/// and emitted whole when the response finishes.
#[derive(Debug, Default)]
pub(crate) struct ChunkDecoder {
    buffer: Vec<u8>,
    tool_calls: BTreeMap<u64, PartialToolCall>,
    finish_reason: Option<String>,
    done: bool,
}

impl ChunkDecoder {
    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<Vec<StreamEvent>, LlmError> {
        let mut events = Vec::new();
        if self.done {
            return Ok(events);
        }
        self.buffer.extend_from_slice(bytes);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.handle_line(&line, &mut events)?;
            if self.done {
                self.buffer.clear();
                break;
            }
        }
        Ok(events)
    }

    /// Called when the byte stream ends.
    pub(crate) fn finish(&mut self) -> Result<Vec<StreamEvent>, LlmError> {
        let mut events = Vec::new();
        if self.done {
            return Ok(events);
        }
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.handle_line(&rest, &mut events)?;
            if self.done {
                return Ok(events);
            }
        }
        if self.finish_reason.is_none() {
            return Err(LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: "stream ended before the model finished".to_string(),
            });
        }
        self.finalize(&mut events);
        Ok(events)
    }

    fn handle_line(&mut self, raw: &[u8], events: &mut Vec<StreamEvent>) -> Result<(), LlmError> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(data) = line.strip_prefix("data:") else {
            // blank separators, comments, `event:` and `id:` fields
            return Ok(());
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            self.finalize(events);
            return Ok(());
        }

        let chunk: Value = serde_json::from_str(data).map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("malformed stream chunk: {e}"),
        })?;

        if let Some(error) = chunk.get("error") {
            let reason = error["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason,
            });
        }

        if let Some(choice) = chunk["choices"].get(0) {
            let delta = &choice["delta"];
            if let Some(text) = delta["content"].as_str()
                && !text.is_empty()
            {
                events.push(StreamEvent::TextDelta(text.to_string()));
            }
            if let Some(calls) = delta["tool_calls"].as_array() {
                for call in calls {
                    self.accumulate_tool_call(call);
                }
            }
            if let Some(reason) = choice["finish_reason"].as_str() {
                self.finish_reason = Some(reason.to_string());
            }
        }

        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            events.push(StreamEvent::Usage(TokenUsage {
                input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            }));
        }
        Ok(())
    }

    fn accumulate_tool_call(&mut self, fragment: &Value) {
        let index = fragment["index"].as_u64().unwrap_or(0);
        let entry = self.tool_calls.entry(index).or_default();
        if let Some(id) = fragment["id"].as_str() {
            entry.id = Some(id.to_string());
        }
        if let Some(name) = fragment["function"]["name"].as_str() {
            entry.name.push_str(name);
        }
        if let Some(args) = fragment["function"]["arguments"].as_str() {
            entry.arguments.push_str(args);
        }
    }

    fn finalize(&mut self, events: &mut Vec<StreamEvent>) {
        self.done = true;
        let calls = std::mem::take(&mut self.tool_calls);
        let had_calls = !calls.is_empty();
        for (index, call) in calls {
            let arguments = if call.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.arguments)
                    .unwrap_or_else(|_| Value::String(call.arguments.clone()))
            };
            events.push(StreamEvent::ToolCall(ToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{index}")),
                name: call.name,
                arguments,
            }));
        }
        let reason = match self.finish_reason.as_deref() {
            Some(reason) => FinishReason::from_openai(reason),
            None if had_calls => FinishReason::ToolUse,
            None => FinishReason::Stop,
        };
        events.push(StreamEvent::Finish(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ToolDefinition;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn text_chunk(text: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({ "choices": [{ "index": 0, "delta": { "content": text }, "finish_reason": null }] })
        )
    }

    fn finish_chunk(reason: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({ "choices": [{ "index": 0, "delta": {}, "finish_reason": reason }] })
        )
    }

    fn decode_all(decoder: &mut ChunkDecoder, input: &str) -> Vec<StreamEvent> {
        let mut events = decoder.push(input.as_bytes()).unwrap();
        events.extend(decoder.finish().unwrap());
        events
    }

    fn provider(server: &MockServer) -> OpenAiProvider {
        OpenAiProvider::new(
            reqwest::Client::new(),
            SecretString::from("sk-test".to_string()),
            "gpt-4o-mini",
            "text-embedding-3-small",
        )
        .with_base_url(server.uri())
    }

    #[test]
    fn decodes_text_then_finish() {
        let input = format!(
            "{}{}{}data: [DONE]\n\n",
            text_chunk("Hej"),
            text_chunk(" med dig"),
            finish_chunk("stop")
        );
        let events = decode_all(&mut ChunkDecoder::default(), &input);
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Hej".to_string()),
                StreamEvent::TextDelta(" med dig".to_string()),
                StreamEvent::Finish(FinishReason::Stop),
            ]
        );
    }

    #[test]
    fn lines_split_across_chunks_including_utf8() {
        let input = format!("{}{}data: [DONE]\n", text_chunk("Københavns"), finish_chunk("stop"));
        let bytes = input.as_bytes();
        let mut decoder = ChunkDecoder::default();
        let mut events = Vec::new();
        // feed one byte at a time so "ø" is split
        for b in bytes {
            events.extend(decoder.push(std::slice::from_ref(b)).unwrap());
        }
        assert!(decoder.is_done());
        assert_eq!(events[0], StreamEvent::TextDelta("Københavns".to_string()));
        assert_eq!(events.last(), Some(&StreamEvent::Finish(FinishReason::Stop)));
    }

    #[test]
    fn tool_call_fragments_are_assembled() {
        let fragments = [
            json!({ "choices": [{ "delta": { "tool_calls": [{ "index": 0, "id": "call_a", "function": { "name": "modifyRoadmap", "arguments": "" } }] } }] }),
            json!({ "choices": [{ "delta": { "tool_calls": [{ "index": 0, "function": { "arguments": "{\"action\":\"hide\"," } }] } }] }),
            json!({ "choices": [{ "delta": { "tool_calls": [{ "index": 0, "function": { "arguments": "\"stepId\":\"health\"}" } }] } }] }),
            json!({ "choices": [{ "delta": {}, "finish_reason": "tool_calls" }] }),
            json!({ "choices": [], "usage": { "prompt_tokens": 12, "completion_tokens": 7 } }),
        ];
        let mut input = String::new();
        for f in &fragments {
            input.push_str(&format!("data: {f}\n\n"));
        }
        input.push_str("data: [DONE]\n\n");

        let events = decode_all(&mut ChunkDecoder::default(), &input);
        assert_eq!(
            events,
            vec![
                StreamEvent::Usage(TokenUsage {
                    input_tokens: 12,
                    output_tokens: 7
                }),
                StreamEvent::ToolCall(ToolCall {
                    id: "call_a".to_string(),
                    name: "modifyRoadmap".to_string(),
                    arguments: json!({ "action": "hide", "stepId": "health" }),
                }),
                StreamEvent::Finish(FinishReason::ToolUse),
            ]
        );
    }

    #[test]
    fn unparseable_arguments_are_kept_raw() {
        let input = format!(
            "data: {}\n\n{}",
            json!({ "choices": [{ "delta": { "tool_calls": [{ "index": 0, "id": "c", "function": { "name": "modifyRoadmap", "arguments": "{not json" } }] } }] }),
            finish_chunk("tool_calls")
        );
        let events = decode_all(&mut ChunkDecoder::default(), &input);
        match &events[0] {
            StreamEvent::ToolCall(call) => {
                assert_eq!(call.arguments, Value::String("{not json".to_string()))
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn eof_without_finish_is_an_error() {
        let mut decoder = ChunkDecoder::default();
        decoder.push(text_chunk("partial").as_bytes()).unwrap();
        assert!(matches!(
            decoder.finish(),
            Err(LlmError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn error_payload_mid_stream() {
        let mut decoder = ChunkDecoder::default();
        let err = decoder
            .push(b"data: {\"error\":{\"message\":\"overloaded\"}}\n")
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn request_body_shape() {
        let p = OpenAiProvider::new(
            reqwest::Client::new(),
            SecretString::from("k".to_string()),
            "gpt-4o-mini",
            "emb",
        );
        let request = CompletionRequest::new(vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![ToolCall {
                    id: "call_1".to_string(),
                    name: "modifyRoadmap".to_string(),
                    arguments: json!({ "action": "show", "stepId": "cpr" }),
                }],
            ),
            ChatMessage::tool_result("call_1", "modifyRoadmap", "ok"),
        ])
        .with_tools(vec![ToolDefinition {
            name: "modifyRoadmap".to_string(),
            description: "d".to_string(),
            parameters: json!({ "type": "object" }),
        }]);
        let body = p.request_body(&request);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][2]["content"], Value::Null);
        let args = body["messages"][2]["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(args).unwrap(),
            json!({ "action": "show", "stepId": "cpr" })
        );
        assert_eq!(body["messages"][3]["tool_call_id"], "call_1");
        assert_eq!(body["tools"][0]["function"]["name"], "modifyRoadmap");
    }

    #[tokio::test]
    async fn streams_from_server() {
        let server = MockServer::start().await;
        let sse = format!(
            "{}{}{}data: [DONE]\n\n",
            text_chunk("Velkommen"),
            text_chunk("!"),
            finish_chunk("stop")
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({ "model": "gpt-4o-mini", "stream": true })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let stream = provider(&server)
            .stream_completion(CompletionRequest::new(vec![ChatMessage::user("hej")]))
            .await
            .unwrap();
        let events: Vec<StreamEvent> = stream.map(|e| e.unwrap()).collect().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Velkommen".to_string()),
                StreamEvent::TextDelta("!".to_string()),
                StreamEvent::Finish(FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let result = provider(&server)
            .stream_completion(CompletionRequest::new(vec![ChatMessage::user("hej")]))
            .await;
        assert!(matches!(result, Err(LlmError::AuthFailed { .. })));
    }

    #[tokio::test]
    async fn rate_limit_reads_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;
        let result = provider(&server)
            .stream_completion(CompletionRequest::new(vec![ChatMessage::user("hej")]))
            .await;
        match result {
            Err(LlmError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected rate limit error"),
        }
    }

    #[tokio::test]
    async fn server_error_is_request_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
            .mount(&server)
            .await;
        let result = provider(&server)
            .stream_completion(CompletionRequest::new(vec![ChatMessage::user("hej")]))
            .await;
        match result {
            Err(LlmError::RequestFailed { reason, .. }) => assert!(reason.contains("503")),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn embeds_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(json!({ "model": "text-embedding-3-small" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "embedding": [0.25, -0.5, 1.0], "index": 0 }]
            })))
            .mount(&server)
            .await;
        let embedding = provider(&server).embed("CPR registration").await.unwrap();
        assert_eq!(embedding, vec![0.25, -0.5, 1.0]);
    }
}
