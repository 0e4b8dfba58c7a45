//! Streaming client for OpenAI-compatible chat completion endpoints.
//!
//! Data flow:
//! ```text
//! POST /v1/chat/completions (stream=true) → SSE bytes → SseDecoder → ChunkParser → AgentItem
//! ```

use std::collections::HashSet;
use std::time::Duration;

use chatrelay_core::config::AgentConfig;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tracing::debug;

use super::{Agent, AgentError, AgentItem, AgentStream, ThreadContext};

/// Stage tag for answer text.
pub const ANSWER_STAGE: &str = "agent";
/// Stage tag for reasoning traces of reasoning models.
pub const REASONING_STAGE: &str = "reasoning";

/// Connection settings for [`OpenAiAgent`].
#[derive(Debug, Clone)]
pub struct OpenAiAgentConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub system_prompt: String,
    pub request_timeout: Duration,
}

impl From<&AgentConfig> for OpenAiAgentConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            system_prompt: config.system_prompt.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

/// Agent backed by a single streamed chat completion per turn.
///
/// Conversation history lives in the external checkpoint store; only the
/// system prompt and the new user message are sent upstream.
#[derive(Debug, Clone)]
pub struct OpenAiAgent {
    http: reqwest::Client,
    url: String,
    model: String,
    system_prompt: String,
}

impl OpenAiAgent {
    pub fn new(config: &OpenAiAgentConfig) -> Result<Self, AgentError> {
        if config.base_url.is_empty() {
            return Err(AgentError::Config("base_url is empty".into()));
        }
        if config.model.is_empty() {
            return Err(AgentError::Config("model is empty".into()));
        }

        let mut headers = HeaderMap::new();
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| AgentError::Config("Invalid API key format".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        // reqwest is built with rustls-no-provider; `Err` means already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            url: format!("{}/v1/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
        })
    }

    pub fn completions_url(&self) -> &str {
        &self.url
    }

    fn request_body(&self, thread: &ThreadContext, message: &str) -> Value {
        json!({
            "model": self.model,
            "stream": true,
            "user": thread.thread_id,
            "messages": [
                { "role": "system", "content": self.system_prompt },
                { "role": "user", "content": message },
            ],
        })
    }
}

impl Agent for OpenAiAgent {
    fn stream(&self, thread: &ThreadContext, message: &str) -> AgentStream {
        let request = self.http.post(&self.url).json(&self.request_body(thread, message));
        let stream_id = thread.stream_id.clone();

        let stream = async_stream::stream! {
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    yield Err(AgentError::Http(e));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                yield Err(AgentError::Status { status: status.as_u16(), body });
                return;
            }

            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            let mut parser = ChunkParser::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(AgentError::Stream(e.to_string()));
                        return;
                    }
                };

                for data in decoder.push(&chunk) {
                    if data.trim() == "[DONE]" {
                        debug!(stream_id = %stream_id, "Upstream completion finished");
                        return;
                    }
                    match parser.parse(&data) {
                        Ok(items) => {
                            for item in items {
                                yield Ok(item);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }

            // Some servers close the body without a trailing blank line.
            if let Some(data) = decoder.finish().filter(|d| d.trim() != "[DONE]") {
                match parser.parse(&data) {
                    Ok(items) => {
                        for item in items {
                            yield Ok(item);
                        }
                    }
                    Err(e) => yield Err(e),
                }
            }
        };

        Box::pin(stream)
    }
}

/// Splits an SSE byte stream into the `data` payloads of complete events.
#[derive(Debug, Default)]
struct SseDecoder {
    buf: Vec<u8>,
    data: String,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(std::mem::take(&mut self.data));
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(data.strip_prefix(' ').unwrap_or(data));
            }
            // Other fields (event:, id:, retry:, comments) are not used upstream.
        }

        events
    }

    fn finish(&mut self) -> Option<String> {
        let line = String::from_utf8_lossy(&std::mem::take(&mut self.buf)).into_owned();
        if let Some(data) = line.trim_end_matches(['\n', '\r']).strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(data.strip_prefix(' ').unwrap_or(data));
        }
        (!self.data.is_empty()).then(|| std::mem::take(&mut self.data))
    }
}

/// Maps completion chunks to agent items.
#[derive(Debug, Default)]
struct ChunkParser {
    /// Tool call indices already reported for the current message.
    seen_tools: HashSet<u64>,
}

impl ChunkParser {
    fn parse(&mut self, data: &str) -> Result<Vec<AgentItem>, AgentError> {
        let chunk: Value =
            serde_json::from_str(data).map_err(|e| AgentError::Decode(e.to_string()))?;

        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_string);
            return Err(AgentError::Stream(message));
        }

        let mut items = Vec::new();
        let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
            // Usage-only chunk.
            return Ok(items);
        };

        for choice in choices {
            if let Some(delta) = choice.get("delta") {
                if let Some(reasoning) = delta.get("reasoning_content").and_then(Value::as_str)
                    && !reasoning.is_empty()
                {
                    items.push(AgentItem::chunk(REASONING_STAGE, reasoning));
                }

                if let Some(content) = delta.get("content").and_then(Value::as_str)
                    && !content.is_empty()
                {
                    items.push(AgentItem::chunk(ANSWER_STAGE, content));
                }

                if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                    let names = self.new_tool_names(calls);
                    if !names.is_empty() {
                        items.push(AgentItem::ToolCalls { names });
                    }
                }
            }

            if choice
                .get("finish_reason")
                .is_some_and(|reason| !reason.is_null())
            {
                self.seen_tools.clear();
                items.push(AgentItem::MessageEnded);
            }
        }

        Ok(items)
    }

    /// Tool names are only present on the first delta of each call index.
    fn new_tool_names(&mut self, calls: &[Value]) -> Vec<String> {
        let mut names = Vec::new();
        for call in calls {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            let name = call
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !name.is_empty() && self.seen_tools.insert(index) {
                names.push(name.to_string());
            }
        }
        names
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> OpenAiAgentConfig {
        OpenAiAgentConfig {
            base_url: base_url.into(),
            model: "test-model".into(),
            api_key: Some("sk-test".into()),
            system_prompt: "Be brief.".into(),
            request_timeout: Duration::from_secs(5),
        }
    }

    // =========================================================================
    // Construction
    // =========================================================================

    #[test]
    fn empty_base_url_returns_config_error() {
        let err = OpenAiAgent::new(&config("")).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn empty_model_returns_config_error() {
        let mut cfg = config("http://localhost:1");
        cfg.model = String::new();
        assert!(matches!(
            OpenAiAgent::new(&cfg).unwrap_err(),
            AgentError::Config(_)
        ));
    }

    #[test]
    fn trailing_slash_stripped_from_base_url() {
        let agent = OpenAiAgent::new(&config("https://api.example.com/")).unwrap();
        assert_eq!(agent.completions_url(), "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn request_body_carries_system_prompt_and_message() {
        let agent = OpenAiAgent::new(&config("https://api.example.com")).unwrap();
        let thread = ThreadContext {
            thread_id: "t1".into(),
            stream_id: "s1".into(),
            last_activity: 0,
        };
        let body = agent.request_body(&thread, "hi there");
        assert_eq!(body["stream"], true);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["messages"][0]["content"], "Be brief.");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "hi there");
    }

    // =========================================================================
    // SSE decoding
    // =========================================================================

    #[test]
    fn decoder_handles_events_split_across_reads() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert!(decoder.push(b":1}\r\n").is_empty());
        let events = decoder.push(b"\r\ndata: [DONE]\n\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn decoder_joins_multiline_data_and_skips_other_fields() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b": ping\nevent: x\ndata: one\ndata: two\n\n");
        assert_eq!(events, vec!["one\ntwo".to_string()]);
    }

    #[test]
    fn decoder_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn decoder_keeps_multibyte_chars_split_across_reads() {
        let mut decoder = SseDecoder::default();
        let bytes = "data: привет\n\n".as_bytes();
        let (head, tail) = bytes.split_at(8);
        assert!(decoder.push(head).is_empty());
        assert_eq!(decoder.push(tail), vec!["привет".to_string()]);
    }

    // =========================================================================
    // Chunk parsing
    // =========================================================================

    #[test]
    fn parser_maps_content_and_reasoning_to_stages() {
        let mut parser = ChunkParser::default();
        let items = parser
            .parse(r#"{"choices":[{"delta":{"reasoning_content":"hmm","content":"Hel"}}]}"#)
            .unwrap();
        assert_eq!(
            items,
            vec![
                AgentItem::chunk(REASONING_STAGE, "hmm"),
                AgentItem::chunk(ANSWER_STAGE, "Hel"),
            ]
        );
    }

    #[test]
    fn parser_reports_each_tool_once() {
        let mut parser = ChunkParser::default();
        let first = parser
            .parse(
                r#"{"choices":[{"delta":{"tool_calls":[
                    {"index":0,"function":{"name":"web_search","arguments":""}},
                    {"index":1,"function":{"name":"similarity_search"}}]}}]}"#,
            )
            .unwrap();
        assert_eq!(
            first,
            vec![AgentItem::ToolCalls {
                names: vec!["web_search".into(), "similarity_search".into()]
            }]
        );

        // Argument deltas for the same index carry no name.
        let rest = parser
            .parse(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":1}"}}]}}]}"#)
            .unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn parser_emits_message_ended_on_finish_reason() {
        let mut parser = ChunkParser::default();
        let items = parser
            .parse(r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#)
            .unwrap();
        assert_eq!(
            items,
            vec![AgentItem::chunk(ANSWER_STAGE, "lo"), AgentItem::MessageEnded]
        );

        let none = parser
            .parse(r#"{"choices":[{"delta":{},"finish_reason":null}]}"#)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn parser_ignores_usage_only_chunks() {
        let mut parser = ChunkParser::default();
        assert!(parser.parse(r#"{"usage":{"total_tokens":3}}"#).unwrap().is_empty());
    }

    #[test]
    fn parser_surfaces_upstream_errors() {
        let mut parser = ChunkParser::default();
        let err = parser
            .parse(r#"{"error":{"message":"rate limited"}}"#)
            .unwrap_err();
        assert!(matches!(err, AgentError::Stream(msg) if msg == "rate limited"));

        assert!(matches!(
            parser.parse("not json").unwrap_err(),
            AgentError::Decode(_)
        ));
    }
}
