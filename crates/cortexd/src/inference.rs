//! Inference client abstraction for alert enrichment.
//!
//! One `generate` call per prompt; no conversation state. Backends:
//! - local: llama.cpp server (`POST /completion`)
//! - claude: Anthropic messages API (`POST /v1/messages`)
//! - openai: chat completions (`POST /v1/chat/completions`)
//!
//! Every failure comes back as `InferenceResult { success: false, .. }`,
//! never as a panic or an `Err` the caller has to unwrap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub use crate::config::BackendKind;
use crate::config::LlmConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLAUDE_ENDPOINT: &str = "https://api.anthropic.com";
const CLAUDE_DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_ENDPOINT: &str = "https://api.openai.com";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

const LOCAL_SYSTEM_PROMPT: &str = "You are a helpful Linux system administrator AI. \
     Give direct, actionable advice. Do not ask questions or request clarification. \
     Just provide the answer.";

/// Fragments the local models tend to echo back from the prompt
const ECHO_PATTERNS: &[&str] = &[
    "Please provide",
    "Please note",
    "Please give",
    "You are a",
    "As a Linux",
    "As an AI",
    "I'd be happy to",
    "Here's my response",
    "Here is my response",
    "Let me help",
    "I can help",
    "(2-3 sentences",
    "sentences max)",
    "Be specific and concise",
    "brief, actionable",
    "Hint:",
    "Note:",
];

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>, config: &LlmConfig) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl InferenceResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum InferenceError {
    #[error("API key not available (set {0})")]
    MissingKey(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("request timeout after {0} seconds")]
    Timeout(u64),

    #[error("HTTP {0} from {1}")]
    Status(u16, &'static str),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("backend returned empty output")]
    Empty,
}

/// Anything that can turn a prompt into text
pub trait InferenceClient: Send + Sync {
    fn generate(&self, request: &InferenceRequest) -> InferenceResult;

    fn backend(&self) -> BackendKind;
}

/// Blocking HTTP client for the three supported backends
pub struct HttpInferenceClient {
    kind: BackendKind,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    api_key_env: String,
    timeout_secs: u64,
    client: reqwest::blocking::Client,
}

impl HttpInferenceClient {
    pub fn new(config: &LlmConfig) -> Result<Self, InferenceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::Http(format!("failed to create HTTP client: {}", e)))?;

        let api_key = if config.api_key_env.is_empty() {
            None
        } else {
            std::env::var(&config.api_key_env)
                .ok()
                .filter(|k| !k.trim().is_empty())
        };

        Ok(Self {
            kind: config.backend,
            endpoint: resolve_endpoint(config.backend, &config.endpoint),
            model: resolve_model(config.backend, &config.model),
            api_key,
            api_key_env: config.api_key_env.clone(),
            timeout_secs: config.timeout_secs,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn api_key(&self) -> Result<&str, InferenceError> {
        self.api_key.as_deref().ok_or_else(|| {
            let var = if self.api_key_env.is_empty() {
                "llm.api_key_env"
            } else {
                self.api_key_env.as_str()
            };
            InferenceError::MissingKey(var.to_string())
        })
    }

    fn send(
        &self,
        request: reqwest::blocking::RequestBuilder,
        label: &'static str,
    ) -> Result<Value, InferenceError> {
        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout(self.timeout_secs)
            } else {
                InferenceError::Http(format!("request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            return Err(InferenceError::Status(response.status().as_u16(), label));
        }

        response
            .json()
            .map_err(|e| InferenceError::InvalidResponse(format!("failed to parse body: {}", e)))
    }

    fn call_local(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        let url = format!("{}/completion", self.endpoint);
        let prompt = format!(
            "<s>[INST] <<SYS>>\n{}\n<</SYS>>\n\n{} [/INST]",
            LOCAL_SYSTEM_PROMPT, request.prompt
        );
        let body = json!({
            "prompt": prompt,
            "n_predict": request.max_tokens,
            "temperature": request.temperature,
            "stop": ["</s>", "[INST]", "[/INST]"],
        });

        let resp = self.send(self.client.post(&url).json(&body), "llama-server")?;

        if let Some(err) = resp.get("error") {
            return Err(InferenceError::InvalidResponse(err.to_string()));
        }
        let content = resp
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                InferenceError::InvalidResponse("missing content in llama-server response".into())
            })?;

        Ok(clean_local_output(content))
    }

    fn call_claude(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        let key = self.api_key()?;
        let url = format!("{}/v1/messages", self.endpoint);
        let body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{"role": "user", "content": request.prompt}],
        });

        let resp = self.send(
            self.client
                .post(&url)
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body),
            "Claude API",
        )?;

        resp.get("content")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| InferenceError::InvalidResponse("missing content[0].text".into()))
    }

    fn call_openai(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        let key = self.api_key()?;
        let url = format!("{}/v1/chat/completions", self.endpoint);
        let body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{"role": "user", "content": request.prompt}],
        });

        let resp = self.send(
            self.client.post(&url).bearer_auth(key).json(&body),
            "OpenAI API",
        )?;

        resp.get("choices")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| {
                InferenceError::InvalidResponse("missing choices[0].message.content".into())
            })
    }
}

impl InferenceClient for HttpInferenceClient {
    fn generate(&self, request: &InferenceRequest) -> InferenceResult {
        let outcome = match self.kind {
            BackendKind::Local => self.call_local(request),
            BackendKind::Claude => self.call_claude(request),
            BackendKind::OpenAi => self.call_openai(request),
            BackendKind::None => return InferenceResult::failed("no inference backend configured"),
        };

        match outcome {
            Ok(text) if text.is_empty() => InferenceResult::failed(InferenceError::Empty.to_string()),
            Ok(text) => InferenceResult::ok(text),
            Err(e) => {
                debug!("[INFERENCE] {} call failed: {}", self.kind.as_str(), e);
                InferenceResult::failed(e.to_string())
            }
        }
    }

    fn backend(&self) -> BackendKind {
        self.kind
    }
}

fn resolve_endpoint(kind: BackendKind, configured: &str) -> String {
    let configured = configured.trim().trim_end_matches('/');
    let is_local_default = configured.is_empty() || configured == "http://127.0.0.1:8085";
    match kind {
        BackendKind::Claude if is_local_default => CLAUDE_ENDPOINT.to_string(),
        BackendKind::OpenAi if is_local_default => OPENAI_ENDPOINT.to_string(),
        BackendKind::Local if configured.is_empty() => "http://127.0.0.1:8085".to_string(),
        _ => configured.to_string(),
    }
}

fn resolve_model(kind: BackendKind, configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }
    match kind {
        BackendKind::Claude => CLAUDE_DEFAULT_MODEL.to_string(),
        BackendKind::OpenAi => OPENAI_DEFAULT_MODEL.to_string(),
        _ => String::new(),
    }
}

/// Drop blank lines and lines echoing instruction text, then trim
pub fn clean_local_output(raw: &str) -> String {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !ECHO_PATTERNS.iter().any(|p| line.contains(p)))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Select the client once at startup. `none` or a construction failure
/// yields no client and alerts stay plain.
pub fn build_client(config: &LlmConfig) -> Option<Arc<dyn InferenceClient>> {
    if config.backend == BackendKind::None {
        info!("[INFERENCE] No backend configured, alerts will not be enriched");
        return None;
    }

    match HttpInferenceClient::new(config) {
        Ok(client) => {
            if matches!(config.backend, BackendKind::Claude | BackendKind::OpenAi)
                && client.api_key.is_none()
            {
                warn!(
                    "[INFERENCE] {} backend selected but no API key found in ${}",
                    config.backend.as_str(),
                    config.api_key_env
                );
            }
            info!(
                "[INFERENCE] Using {} backend at {}",
                config.backend.as_str(),
                client.endpoint()
            );
            Some(Arc::new(client))
        }
        Err(e) => {
            warn!("[INFERENCE] Backend unavailable: {}", e);
            None
        }
    }
}

/// Scripted client for tests
pub struct FakeInferenceClient {
    responses: Mutex<Vec<InferenceResult>>,
    call_count: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    delay: Duration,
}

impl FakeInferenceClient {
    /// Returns the responses in order; the last one repeats
    pub fn new(responses: Vec<InferenceResult>) -> Self {
        Self {
            responses: Mutex::new(responses),
            call_count: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn always_ok(output: &str) -> Self {
        Self::new(vec![InferenceResult::ok(output)])
    }

    pub fn always_failing(error: &str) -> Self {
        Self::new(vec![InferenceResult::failed(error)])
    }

    /// Sleep this long inside every `generate` call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl InferenceClient for FakeInferenceClient {
    fn generate(&self, request: &InferenceRequest) -> InferenceResult {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.prompt.clone());

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        match responses.len() {
            0 => InferenceResult::failed(InferenceError::Empty.to_string()),
            1 => responses[0].clone(),
            _ => responses.remove(0),
        }
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InferenceRequest {
        InferenceRequest::new("CPU usage is 97%", &LlmConfig::default())
    }

    #[test]
    fn test_request_uses_config_limits() {
        let req = request();
        assert_eq!(req.max_tokens, 150);
        assert!((req.temperature - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn test_clean_local_output_strips_echoes() {
        let raw = "As an AI, I can suggest:\n\n  Check `top` for the busiest process.\nNote: be careful\nThen restart it.  \n";
        assert_eq!(
            clean_local_output(raw),
            "Check `top` for the busiest process.\nThen restart it."
        );
        assert_eq!(clean_local_output("Please provide more details"), "");
    }

    #[test]
    fn test_resolve_endpoint_defaults() {
        assert_eq!(resolve_endpoint(BackendKind::Claude, "http://127.0.0.1:8085"), CLAUDE_ENDPOINT);
        assert_eq!(resolve_endpoint(BackendKind::OpenAi, ""), OPENAI_ENDPOINT);
        assert_eq!(
            resolve_endpoint(BackendKind::OpenAi, "http://proxy.local:9000/"),
            "http://proxy.local:9000"
        );
        assert_eq!(resolve_endpoint(BackendKind::Local, ""), "http://127.0.0.1:8085");
    }

    #[test]
    fn test_build_client_none_backend() {
        assert!(build_client(&LlmConfig::default()).is_none());
    }

    #[test]
    fn test_missing_key_is_a_failed_result() {
        let config = LlmConfig {
            backend: BackendKind::Claude,
            api_key_env: "CORTEXD_TEST_KEY_THAT_IS_NOT_SET".to_string(),
            ..LlmConfig::default()
        };
        let client = HttpInferenceClient::new(&config).unwrap();
        let result = client.generate(&request());
        assert!(!result.success);
        assert!(result.error.unwrap().contains("CORTEXD_TEST_KEY_THAT_IS_NOT_SET"));
    }

    #[test]
    fn test_unreachable_local_backend_fails_cleanly() {
        let config = LlmConfig {
            backend: BackendKind::Local,
            // Port 9 (discard) on loopback is almost never listening
            endpoint: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            ..LlmConfig::default()
        };
        let client = build_client(&config).unwrap();
        assert_eq!(client.backend(), BackendKind::Local);
        let result = client.generate(&request());
        assert!(!result.success);
        assert!(result.output.is_empty());
        assert!(result.error.is_some());
    }

    /// Serve one canned HTTP response on loopback; yields the raw request
    fn one_shot_server(status: &str, body: &str) -> (String, std::thread::JoinHandle<String>) {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );

        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });

        (endpoint, handle)
    }

    fn http_client(backend: BackendKind, endpoint: &str) -> HttpInferenceClient {
        let config = LlmConfig {
            backend,
            endpoint: endpoint.to_string(),
            api_key_env: String::new(),
            timeout_secs: 5,
            ..LlmConfig::default()
        };
        let mut client = HttpInferenceClient::new(&config).unwrap();
        client.api_key = Some("test-key".to_string());
        client
    }

    #[test]
    fn test_local_completion_is_cleaned() {
        let (endpoint, server) = one_shot_server(
            "200 OK",
            r#"{"content": "As an AI, here is advice:\n\nKill the runaway process with `kill -15`.\n"}"#,
        );
        let result = http_client(BackendKind::Local, &endpoint).generate(&request());
        let raw = server.join().unwrap();

        assert!(result.success);
        assert_eq!(result.output, "Kill the runaway process with `kill -15`.");
        assert!(raw.starts_with("POST /completion"));
        assert!(raw.contains("n_predict"));
        assert!(raw.contains("CPU usage is 97%"));
    }

    #[test]
    fn test_claude_messages_text() {
        let (endpoint, server) = one_shot_server(
            "200 OK",
            r#"{"content": [{"type": "text", "text": "  Check `top` for the hot process.  "}]}"#,
        );
        let result = http_client(BackendKind::Claude, &endpoint).generate(&request());
        let raw = server.join().unwrap().to_ascii_lowercase();

        assert!(result.success);
        assert_eq!(result.output, "Check `top` for the hot process.");
        assert!(raw.starts_with("post /v1/messages"));
        assert!(raw.contains("x-api-key: test-key"));
        assert!(raw.contains("anthropic-version: 2023-06-01"));
    }

    #[test]
    fn test_openai_choice_content() {
        let (endpoint, server) = one_shot_server(
            "200 OK",
            r#"{"choices": [{"message": {"role": "assistant", "content": "Clear the apt cache."}}]}"#,
        );
        let result = http_client(BackendKind::OpenAi, &endpoint).generate(&request());
        let raw = server.join().unwrap().to_ascii_lowercase();

        assert!(result.success);
        assert_eq!(result.output, "Clear the apt cache.");
        assert!(raw.starts_with("post /v1/chat/completions"));
        assert!(raw.contains("authorization: bearer test-key"));
    }

    #[test]
    fn test_non_success_status() {
        let (endpoint, server) = one_shot_server("503 Service Unavailable", r#"{"error": "busy"}"#);
        let err = http_client(BackendKind::OpenAi, &endpoint)
            .call_openai(&request())
            .unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, InferenceError::Status(503, "OpenAI API")));
        assert_eq!(err.to_string(), "HTTP 503 from OpenAI API");
    }

    #[test]
    fn test_missing_text_is_invalid_response() {
        let (endpoint, server) = one_shot_server("200 OK", r#"{"content": []}"#);
        let result = http_client(BackendKind::Claude, &endpoint).generate(&request());
        server.join().unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("content[0].text"));
    }

    #[test]
    fn test_fake_client_sequence() {
        let client = FakeInferenceClient::new(vec![
            InferenceResult::ok("first"),
            InferenceResult::failed("down"),
        ]);

        assert_eq!(client.generate(&request()).output, "first");
        let second = client.generate(&request());
        assert!(!second.success);
        // Last response repeats
        assert!(!client.generate(&request()).success);
        assert_eq!(client.call_count(), 3);
        assert_eq!(client.prompts()[0], "CPU usage is 97%");
    }
}
