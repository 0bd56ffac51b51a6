//! Text-generation capability: structured prompt in, schema-checked data out.

use crate::config::AiSettings;
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// One request to the model: instructions, the structured input and, when the
/// answer must be JSON, the schema it has to satisfy.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub name: &'static str,
    pub instructions: String,
    pub input: Value,
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("AI service is not configured (set AI_ENDPOINT and AI_API_KEY).")]
    NotConfigured,
    #[error("AI service timed out.")]
    Timeout,
    #[error("Network error: {0}")]
    Network(String),
    #[error("AI service returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Unexpected AI response: {0}")]
    InvalidResponse(String),
}

impl InferenceError {
    /// Transport failures, throttling and server errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            InferenceError::Timeout | InferenceError::Network(_) => true,
            InferenceError::Http { status, .. } => *status == 429 || *status >= 500,
            InferenceError::NotConfigured | InferenceError::InvalidResponse(_) => false,
        }
    }
}

pub trait InferenceClient: Send + Sync {
    /// Raw completion text for `prompt`.
    fn complete(&self, prompt: &Prompt) -> Result<String, InferenceError>;

    fn is_configured(&self) -> bool {
        true
    }
}

/// Tagged result of one generation. Every component decides what the non-`Ok`
/// variants mean for it.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Ok(T),
    Empty,
    SchemaInvalid(String),
    Unavailable(String),
}

/// Take the JSON body out of a markdown code block if the model wrapped it in one.
fn strip_code_fence(response: &str) -> &str {
    if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    }
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Run `prompt` and deserialize the answer into `T`. A response that does not
/// fit `T` is `SchemaInvalid` and is not retried.
pub fn generate_structured<T: DeserializeOwned>(
    client: &dyn InferenceClient,
    prompt: &Prompt,
) -> Outcome<T> {
    let text = match client.complete(prompt) {
        Ok(text) => text,
        Err(e) => return Outcome::Unavailable(e.to_string()),
    };
    let body = strip_code_fence(&text);
    if body.is_empty() {
        return Outcome::Empty;
    }
    match serde_json::from_str::<T>(body) {
        Ok(value) => Outcome::Ok(value),
        Err(e) => Outcome::SchemaInvalid(format!("{} in: {}", e, preview(body))),
    }
}

/// Run `prompt` for a plain-text answer.
pub fn generate_text(client: &dyn InferenceClient, prompt: &Prompt) -> Outcome<String> {
    match client.complete(prompt) {
        Ok(text) if text.trim().is_empty() => Outcome::Empty,
        Ok(text) => Outcome::Ok(text),
        Err(e) => Outcome::Unavailable(e.to_string()),
    }
}

/// OpenAI-compatible chat-completions client.
pub struct HttpInferenceClient {
    settings: AiSettings,
}

impl HttpInferenceClient {
    pub fn new(settings: AiSettings) -> Self {
        Self { settings }
    }
}

fn request_body(model: &str, prompt: &Prompt) -> Value {
    let mut body = json!({
        "model": model,
        "temperature": 0,
        "messages": [
            { "role": "system", "content": prompt.instructions },
            { "role": "user", "content": prompt.input.to_string() },
        ],
    });
    if let Some(schema) = &prompt.output_schema {
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": { "name": prompt.name, "strict": true, "schema": schema },
        });
    }
    body
}

/// `choices[0].message.content` of a chat-completions response.
fn completion_text(response: &Value) -> Option<String> {
    response
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
}

fn send_once(client: &Client, url: &str, key: &str, body: &Value) -> Result<String, InferenceError> {
    let response = client
        .post(url)
        .bearer_auth(key)
        .json(body)
        .send()
        .map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout
            } else if e.is_connect() {
                InferenceError::Network("Check your internet connection and try again.".to_string())
            } else {
                InferenceError::Network(e.to_string())
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(InferenceError::Http {
            status: status.as_u16(),
            body: if body.is_empty() {
                "Invalid key or endpoint?".to_string()
            } else {
                preview(&body)
            },
        });
    }

    let json: Value = response.json().map_err(|e| {
        if e.is_timeout() {
            InferenceError::Timeout
        } else {
            InferenceError::InvalidResponse(format!("Invalid JSON: {}", e))
        }
    })?;
    completion_text(&json)
        .ok_or_else(|| InferenceError::InvalidResponse("no choices[0].message.content".to_string()))
}

impl InferenceClient for HttpInferenceClient {
    fn complete(&self, prompt: &Prompt) -> Result<String, InferenceError> {
        let (endpoint, key) = match (&self.settings.endpoint, &self.settings.api_key) {
            (Some(endpoint), Some(key)) => (endpoint, key),
            _ => return Err(InferenceError::NotConfigured),
        };
        let client = Client::builder()
            .timeout(self.settings.timeout)
            .build()
            .map_err(|e| InferenceError::Network(e.to_string()))?;
        let url = format!("{}/chat/completions", endpoint);
        let body = request_body(&self.settings.model, prompt);
        let max_attempts = self.settings.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match send_once(&client, &url, key, &body) {
                Ok(text) => {
                    log::debug!("[inference] {} answered on attempt {}", prompt.name, attempt);
                    return Ok(text);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    log::warn!(
                        "[inference] {} attempt {}/{} failed, retrying: {}",
                        prompt.name,
                        attempt,
                        max_attempts,
                        e
                    );
                    std::thread::sleep(Duration::from_millis(250 * attempt as u64));
                }
                Err(e) => {
                    log::warn!("[inference] {} failed: {}", prompt.name, e);
                    return Err(e);
                }
            }
        }
    }

    fn is_configured(&self) -> bool {
        self.settings.is_configured()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedInference;
    use serde::Deserialize;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Answer {
        value: String,
    }

    fn prompt(schema: Option<Value>) -> Prompt {
        Prompt {
            name: "answer",
            instructions: "Answer.".to_string(),
            input: json!({ "q": "x" }),
            output_schema: schema,
        }
    }

    #[test]
    fn structured_outcomes_are_tagged() {
        let client = ScriptedInference::new(vec![
            Ok("```json\n{\"value\": \"Acme\"}\n```".to_string()),
            Ok("   ".to_string()),
            Ok("{\"other\": 1}".to_string()),
            Err(InferenceError::Timeout),
        ]);
        let p = prompt(None);
        assert_eq!(
            generate_structured::<Answer>(&client, &p),
            Outcome::Ok(Answer { value: "Acme".to_string() })
        );
        assert_eq!(generate_structured::<Answer>(&client, &p), Outcome::Empty);
        assert!(matches!(
            generate_structured::<Answer>(&client, &p),
            Outcome::SchemaInvalid(_)
        ));
        assert!(matches!(
            generate_structured::<Answer>(&client, &p),
            Outcome::Unavailable(_)
        ));
    }

    #[test]
    fn text_outcomes_treat_blank_as_empty() {
        let client = ScriptedInference::new(vec![Ok("\n".to_string()), Ok("B1: x".to_string())]);
        let p = prompt(None);
        assert_eq!(generate_text(&client, &p), Outcome::Empty);
        assert_eq!(generate_text(&client, &p), Outcome::Ok("B1: x".to_string()));
    }

    #[test]
    fn request_carries_schema_only_when_given() {
        let schema = json!({ "type": "object" });
        let with = request_body("m", &prompt(Some(schema.clone())));
        assert_eq!(with["response_format"]["json_schema"]["schema"], schema);
        assert_eq!(with["response_format"]["json_schema"]["name"], "answer");
        assert_eq!(with["messages"][1]["content"], "{\"q\":\"x\"}");

        let without = request_body("m", &prompt(None));
        assert!(without.get("response_format").is_none());
    }

    #[test]
    fn retry_policy_covers_transport_and_server_errors() {
        assert!(InferenceError::Timeout.is_retryable());
        assert!(InferenceError::Http { status: 429, body: String::new() }.is_retryable());
        assert!(InferenceError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(!InferenceError::Http { status: 401, body: String::new() }.is_retryable());
        assert!(!InferenceError::InvalidResponse(String::new()).is_retryable());
    }

    #[test]
    fn unconfigured_client_fails_without_network() {
        let client = HttpInferenceClient::new(AiSettings::default());
        assert!(!client.is_configured());
        assert_eq!(client.complete(&prompt(None)), Err(InferenceError::NotConfigured));
    }

    /// Serve one canned HTTP response per connection.
    fn serve(responses: Vec<(u16, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for (status, body) in responses {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream);
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                        content_length = v.trim().parse().unwrap();
                    }
                }
                let mut request_body = vec![0u8; content_length];
                reader.read_exact(&mut request_body).unwrap();
                let mut stream = reader.into_inner();
                write!(
                    stream,
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                )
                .unwrap();
            }
        });
        format!("http://{}", addr)
    }

    fn settings(endpoint: String, max_attempts: u32) -> AiSettings {
        AiSettings {
            endpoint: Some(endpoint),
            api_key: Some("sk-test".to_string()),
            max_attempts,
            timeout: Duration::from_secs(5),
            ..AiSettings::default()
        }
    }

    #[test]
    fn retries_server_errors_then_returns_content() {
        let ok = json!({ "choices": [{ "message": { "content": "{\"value\":\"Acme\"}" } }] });
        let endpoint = serve(vec![(503, String::new()), (200, ok.to_string())]);
        let client = HttpInferenceClient::new(settings(endpoint, 2));
        assert_eq!(client.complete(&prompt(None)).unwrap(), "{\"value\":\"Acme\"}");
    }

    #[test]
    fn client_errors_are_not_retried() {
        let endpoint = serve(vec![(401, "{\"error\":\"bad key\"}".to_string())]);
        let client = HttpInferenceClient::new(settings(endpoint, 3));
        match client.complete(&prompt(None)) {
            Err(InferenceError::Http { status, body }) => {
                assert_eq!(status, 401);
                assert!(body.contains("bad key"));
            }
            other => panic!("expected HTTP error, got {:?}", other),
        }
    }
}
