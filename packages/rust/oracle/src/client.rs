//! Bounded-concurrency gateway to the judgment oracle.
//!
//! One [`OracleClient`] is shared by the whole run. Every call — regardless of
//! which stage or recursion branch issues it — takes a permit from a single
//! semaphore, so the fan-out of the recursive taxonomy build can never put
//! more than `max_workers` requests in flight at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use errata_shared::{ErrataError, OracleSettings, Result};

use crate::prompts::PromptLibrary;

// ---------------------------------------------------------------------------
// Oracle contract
// ---------------------------------------------------------------------------

/// Outcome of one oracle call.
///
/// Transport failures and timeouts are captured here (`success == false`)
/// rather than surfaced as errors — the caller decides whether a failed
/// judgment is fatal to its sub-problem.
#[derive(Debug, Clone, Serialize)]
pub struct OracleResponse {
    /// Judge model that produced (or was asked for) the judgment.
    pub model: String,
    /// The fully rendered prompt.
    pub prompt: String,
    /// Template the prompt was rendered from.
    pub template: String,
    /// Whether a judgment was obtained.
    pub success: bool,
    /// Raw judgment text, when successful.
    pub content: Option<String>,
    /// Full provider response, opaque to the pipeline.
    pub full_response: Option<Value>,
    /// Failure description, when unsuccessful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The judgment oracle, as seen by the pipeline stages.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Render `template_name` with `vars` and request a judgment, optionally
    /// constrained to the named response schema. Never fails — transport
    /// problems come back as `success == false`.
    async fn infer(
        &self,
        template_name: &str,
        vars: &Value,
        schema_name: Option<&str>,
    ) -> OracleResponse;

    /// The judge model identifier.
    fn model_name(&self) -> &str;

    /// Number of judgments requested so far (cache replays issue none).
    fn calls(&self) -> u64;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Oracle client for OpenAI-compatible chat-completions endpoints.
pub struct OracleClient {
    settings: OracleSettings,
    api_key: String,
    client: reqwest::Client,
    gate: Semaphore,
    prompts: PromptLibrary,
    calls: AtomicU64,
}

impl OracleClient {
    /// Build a client, reading the API key from the configured env var.
    pub fn new(settings: OracleSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.api_key_env).map_err(|_| {
            ErrataError::config(format!(
                "oracle API key not found. Set the {} environment variable.",
                settings.api_key_env
            ))
        })?;
        Self::with_api_key(settings, api_key)
    }

    /// Build a client with an explicit API key.
    pub fn with_api_key(settings: OracleSettings, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| ErrataError::Oracle(format!("failed to build HTTP client: {e}")))?;

        let gate = Semaphore::new(settings.max_workers);

        Ok(Self {
            settings,
            api_key,
            client,
            gate,
            prompts: PromptLibrary::new(),
            calls: AtomicU64::new(0),
        })
    }

    /// The chat-completions endpoint under the configured base URL.
    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.as_str().trim_end_matches('/')
        )
    }

    fn failure(&self, prompt: String, template: &str, error: String) -> OracleResponse {
        warn!(template, error = %error, "oracle call failed");
        OracleResponse {
            model: self.settings.model.clone(),
            prompt,
            template: template.to_string(),
            success: false,
            content: None,
            full_response: None,
            error: Some(error),
        }
    }
}

#[async_trait]
impl Oracle for OracleClient {
    async fn infer(
        &self,
        template_name: &str,
        vars: &Value,
        schema_name: Option<&str>,
    ) -> OracleResponse {
        let prompt = match self.prompts.render(template_name, vars) {
            Ok(prompt) => prompt,
            Err(e) => return self.failure(String::new(), template_name, e.to_string()),
        };

        let mut body = json!({
            "model": self.settings.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": self.settings.max_tokens,
        });

        if let Some(name) = schema_name {
            match self.prompts.schema(name) {
                Some(schema) => {
                    body["response_format"] = json!({
                        "type": "json_schema",
                        "json_schema": {"name": "schema", "schema": schema},
                    });
                }
                None => warn!(schema = name, "unknown response schema, sending without one"),
            }
        }

        // Worker gate: the sole backpressure mechanism for the whole run.
        let _permit = self.gate.acquire().await.expect("oracle gate closed");
        self.calls.fetch_add(1, Ordering::Relaxed);
        debug!(template = template_name, "sending oracle request");

        let response = match self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return self.failure(prompt, template_name, e.to_string()),
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return self.failure(prompt, template_name, format!("HTTP {status}: {detail}"));
        }

        let full: Value = match response.json().await {
            Ok(full) => full,
            Err(e) => return self.failure(prompt, template_name, e.to_string()),
        };

        let content = full
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string);

        if content.is_none() {
            return self.failure(prompt, template_name, "response has no content".into());
        }

        OracleResponse {
            model: self.settings.model.clone(),
            prompt,
            template: template_name.to_string(),
            success: true,
            content,
            full_response: Some(full),
            error: None,
        }
    }

    fn model_name(&self) -> &str {
        &self.settings.model
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_settings(base: &str) -> OracleSettings {
        OracleSettings {
            base_url: url::Url::parse(base).unwrap(),
            model: "test-judge".into(),
            max_workers: 4,
            timeout_secs: 5,
            ..Default::default()
        }
    }

    fn completion_body(content: &str) -> Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "model": "test-judge",
        })
    }

    #[tokio::test]
    async fn successful_call_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion_body(r#"{"clusters":[]}"#)),
            )
            .mount(&server)
            .await;

        let client =
            OracleClient::with_api_key(test_settings(&server.uri()), "key".into()).unwrap();
        let vars = json!({
            "data_type": "error_title",
            "data": [["Slip", 1]],
            "max_num_clusters": 3,
            "cluster_name_length": 5,
            "cluster_description_length": 30,
        });
        let response = client
            .infer("taxonomy_generation", &vars, Some("generate_taxonomy"))
            .await;

        assert!(response.success);
        assert_eq!(response.content.as_deref(), Some(r#"{"clusters":[]}"#));
        assert_eq!(response.template, "taxonomy_generation");
        assert!(response.prompt.contains("Slip"));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn server_error_becomes_failure_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client =
            OracleClient::with_api_key(test_settings(&server.uri()), "key".into()).unwrap();
        let vars = json!({"data_type": "error_title", "data": [], "max_num_clusters": 3,
            "cluster_name_length": 5, "cluster_description_length": 30});
        let response = client.infer("taxonomy_generation", &vars, None).await;

        assert!(!response.success);
        assert!(response.content.is_none());
        assert!(response.error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn missing_content_becomes_failure_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let client =
            OracleClient::with_api_key(test_settings(&server.uri()), "key".into()).unwrap();
        let vars = json!({"data_type": "error_title", "data": [], "max_num_clusters": 3,
            "cluster_name_length": 5, "cluster_description_length": 30});
        let response = client.infer("taxonomy_generation", &vars, None).await;

        assert!(!response.success);
        assert!(response.error.unwrap().contains("no content"));
    }

    #[tokio::test]
    async fn unknown_template_becomes_failure_result() {
        let server = MockServer::start().await;
        let client =
            OracleClient::with_api_key(test_settings(&server.uri()), "key".into()).unwrap();
        let response = client.infer("not_a_template", &json!({}), None).await;

        assert!(!response.success);
        assert!(response.error.unwrap().contains("not_a_template"));
        // Nothing was sent.
        assert_eq!(client.calls(), 0);
    }
}
