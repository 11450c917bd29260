use std::time::Duration;

use anyhow::{Context, Result};
use async_openai::error::{ApiError, OpenAIError};
use async_openai::types::{CreateCompletionRequestArgs, Stop};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::debug;

use crate::config::DirectionConfig;
use crate::error::GenerationFailure;
use crate::models::PromptInput;

/// Builds prompt text, dispatches it to a completion endpoint, and parses
/// the raw response into one string per sample.
///
/// Implementations never retry; retry policy belongs to the engine.
#[async_trait]
pub trait PromptFactory: Send + Sync {
    async fn generate(
        &self,
        input: &PromptInput,
        n_samples: usize,
    ) -> Result<Vec<String>, GenerationFailure>;
}

/// Prompt factory backed by an OpenAI-compatible text-completion endpoint
/// (e.g. vLLM).
pub struct OpenAiCompletionFactory {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f64,
    max_tokens: u32,
    example_separator: String,
    request_timeout: Duration,
    /// Global admission control: bounds in-flight requests across all
    /// calls issued through this factory instance.
    permits: Semaphore,
}

impl OpenAiCompletionFactory {
    pub fn new(config: &DirectionConfig, example_separator: &str) -> Result<Self> {
        let mut openai_config = OpenAIConfig::new().with_api_base(&config.api_endpoint);
        if let Some(env_var) = &config.env_var_api_key {
            let api_key = std::env::var(env_var)
                .with_context(|| format!("Environment variable {env_var} not found"))?;
            openai_config = openai_config.with_api_key(api_key);
        }

        // The client would otherwise retry rate-limited requests on its
        // own; a zero backoff window surfaces them to the engine instead.
        let no_retry = backoff::ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::ZERO))
            .build();

        Ok(Self {
            client: Client::with_config(openai_config).with_backoff(no_retry),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            example_separator: example_separator.to_string(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            permits: Semaphore::new(config.max_concurrent_requests),
        })
    }

    /// Renders the literal prompt: instruction line, few-shot pairs joined
    /// by the example separator, then the datapoint content.
    fn render_prompt(&self, input: &PromptInput) -> String {
        let mut prompt = String::new();
        if !input.instruction.is_empty() {
            prompt.push_str(&input.instruction);
            prompt.push('\n');
        }
        for example in &input.few_shot {
            prompt.push_str(&example.input);
            prompt.push_str(&example.output);
            prompt.push_str(&self.example_separator);
        }
        prompt.push_str(&input.content);
        prompt
    }
}

#[async_trait]
impl PromptFactory for OpenAiCompletionFactory {
    async fn generate(
        &self,
        input: &PromptInput,
        n_samples: usize,
    ) -> Result<Vec<String>, GenerationFailure> {
        if n_samples == 0 {
            return Ok(Vec::new());
        }

        let prompt = self.render_prompt(input);
        // OpenAI-compatible endpoints accept at most four stop sequences.
        let mut stop_tokens = input.stop_tokens.clone();
        stop_tokens.truncate(4);

        let request = CreateCompletionRequestArgs::default()
            .model(&self.model)
            .prompt(prompt)
            .n(n_samples as u8)
            .temperature(self.temperature as f32)
            .max_tokens(self.max_tokens as u16)
            .stop(Stop::StringArray(stop_tokens.clone()))
            .build()
            .map_err(|e| GenerationFailure::MalformedResponse(e.to_string()))?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GenerationFailure::Transport("request limiter closed".to_string()))?;

        debug!(model = %self.model, n_samples, "dispatching completion request");
        let response = match timeout(
            self.request_timeout,
            self.client.completions().create(request),
        )
        .await
        {
            Err(_) => {
                return Err(GenerationFailure::Transport(format!(
                    "request timed out after {:?}",
                    self.request_timeout
                )));
            }
            Ok(Err(error)) => return Err(classify_endpoint_error(error)),
            Ok(Ok(response)) => response,
        };

        if response.choices.len() < n_samples {
            return Err(GenerationFailure::MalformedResponse(format!(
                "endpoint returned {} completions, expected {n_samples}",
                response.choices.len()
            )));
        }

        Ok(response
            .choices
            .into_iter()
            .take(n_samples)
            .map(|choice| truncate_at_stop_tokens(choice.text, &stop_tokens))
            .collect())
    }
}

/// Maps endpoint failures onto the failure taxonomy.
fn classify_endpoint_error(error: OpenAIError) -> GenerationFailure {
    match error {
        OpenAIError::Reqwest(e) => {
            if e.status() == Some(StatusCode::TOO_MANY_REQUESTS) {
                GenerationFailure::RateLimited
            } else {
                GenerationFailure::Transport(e.to_string())
            }
        }
        OpenAIError::ApiError(api) => {
            if is_rate_limit(&api) {
                GenerationFailure::RateLimited
            } else {
                GenerationFailure::Transport(api.message)
            }
        }
        OpenAIError::JSONDeserialize(e) => GenerationFailure::MalformedResponse(e.to_string()),
        other => GenerationFailure::Transport(other.to_string()),
    }
}

fn is_rate_limit(error: &ApiError) -> bool {
    let code_matches = error
        .code
        .as_ref()
        .map(|code| code.as_str())
        .is_some_and(|code| code.contains("rate_limit"));
    code_matches || error.message.to_lowercase().contains("rate limit")
}

/// Cuts the text before the earliest occurrence of any stop token.
fn truncate_at_stop_tokens(mut text: String, stop_tokens: &[String]) -> String {
    for token in stop_tokens {
        if let Some(idx) = text.find(token.as_str()) {
            text.truncate(idx);
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FewShotExample;
    use mockito::Matcher;
    use serde_json::json;

    fn direction_config(api_endpoint: &str) -> DirectionConfig {
        DirectionConfig {
            api_endpoint: api_endpoint.to_string(),
            model: "codemodel-7b".to_string(),
            env_var_api_key: None,
            temperature: 0.8,
            max_tokens: 64,
            n_samples: 2,
            max_concurrent_requests: 10,
            request_timeout_secs: 5,
        }
    }

    fn prompt_input() -> PromptInput {
        PromptInput {
            instruction: "Describe the code.".to_string(),
            few_shot: vec![FewShotExample {
                input: "code-1\nDescription: ".to_string(),
                output: "does a thing".to_string(),
            }],
            content: "code-2\nDescription: ".to_string(),
            stop_tokens: vec!["\n\n".to_string()],
        }
    }

    fn completion_body(texts: &[&str]) -> String {
        let choices: Vec<_> = texts
            .iter()
            .enumerate()
            .map(|(index, text)| {
                json!({
                    "text": text,
                    "index": index,
                    "logprobs": null,
                    "finish_reason": "stop",
                })
            })
            .collect();
        json!({
            "id": "cmpl-1",
            "object": "text_completion",
            "created": 0,
            "model": "codemodel-7b",
            "choices": choices,
            "usage": {"prompt_tokens": 7, "completion_tokens": 11, "total_tokens": 18},
        })
        .to_string()
    }

    #[test]
    fn test_render_prompt_joins_few_shot_with_separator() {
        let factory =
            OpenAiCompletionFactory::new(&direction_config("http://localhost:1/v1"), "\n\n")
                .unwrap();
        assert_eq!(
            factory.render_prompt(&prompt_input()),
            "Describe the code.\ncode-1\nDescription: does a thing\n\ncode-2\nDescription: "
        );
    }

    #[test]
    fn test_render_prompt_skips_empty_instruction() {
        let factory =
            OpenAiCompletionFactory::new(&direction_config("http://localhost:1/v1"), "\n\n")
                .unwrap();
        let mut input = prompt_input();
        input.instruction = String::new();
        input.few_shot = vec![];
        assert_eq!(factory.render_prompt(&input), "code-2\nDescription: ");
    }

    #[test]
    fn test_truncate_at_stop_tokens() {
        let tokens = vec!["\n\n".to_string(), "END".to_string()];
        assert_eq!(
            truncate_at_stop_tokens("keep this\n\ndrop this".to_string(), &tokens),
            "keep this"
        );
        assert_eq!(
            truncate_at_stop_tokens("keep END\n\ndrop".to_string(), &tokens),
            "keep "
        );
        assert_eq!(
            truncate_at_stop_tokens("no stops here".to_string(), &tokens),
            "no stops here"
        );
    }

    #[tokio::test]
    async fn test_generate_returns_truncated_samples_in_order() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/completions")
            .match_body(Matcher::PartialJson(json!({
                "model": "codemodel-7b",
                "n": 2,
                "prompt": "Describe the code.\ncode-1\nDescription: does a thing\n\ncode-2\nDescription: ",
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion_body(&["first\n\ntrailing", "second"]))
            .create_async()
            .await;

        let factory = OpenAiCompletionFactory::new(&direction_config(&server.url()), "\n\n").unwrap();
        let samples = factory.generate(&prompt_input(), 2).await.unwrap();
        assert_eq!(samples, vec!["first".to_string(), "second".to_string()]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_generate_zero_samples_makes_no_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/completions")
            .expect(0)
            .create_async()
            .await;

        let factory = OpenAiCompletionFactory::new(&direction_config(&server.url()), "\n\n").unwrap();
        let samples = factory.generate(&prompt_input(), 0).await.unwrap();
        assert!(samples.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limit_is_classified() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/completions")
            .with_status(429)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "error": {
                        "message": "Rate limit reached for requests",
                        "type": "requests",
                        "param": null,
                        "code": "rate_limit_exceeded",
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let factory = OpenAiCompletionFactory::new(&direction_config(&server.url()), "\n\n").unwrap();
        let failure = factory.generate(&prompt_input(), 1).await.unwrap_err();
        assert!(matches!(failure, GenerationFailure::RateLimited));
    }

    #[tokio::test]
    async fn test_fewer_completions_than_requested_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion_body(&["only one"]))
            .create_async()
            .await;

        let factory = OpenAiCompletionFactory::new(&direction_config(&server.url()), "\n\n").unwrap();
        let failure = factory.generate(&prompt_input(), 3).await.unwrap_err();
        assert!(matches!(failure, GenerationFailure::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_undecodable_body_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/completions")
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_body("it's not json")
            .create_async()
            .await;

        let factory = OpenAiCompletionFactory::new(&direction_config(&server.url()), "\n\n").unwrap();
        let failure = factory.generate(&prompt_input(), 1).await.unwrap_err();
        assert!(matches!(failure, GenerationFailure::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport() {
        // Nothing listens on port 1.
        let factory =
            OpenAiCompletionFactory::new(&direction_config("http://127.0.0.1:1/v1"), "\n\n")
                .unwrap();
        let failure = factory.generate(&prompt_input(), 1).await.unwrap_err();
        assert!(matches!(failure, GenerationFailure::Transport(_)));
    }

    #[test]
    fn test_is_rate_limit_matches_code_and_message() {
        let by_code = ApiError {
            message: "slow down".to_string(),
            r#type: None,
            param: None,
            code: Some("rate_limit_exceeded".to_string()),
        };
        assert!(is_rate_limit(&by_code));

        let by_message = ApiError {
            message: "Rate limit reached for requests".to_string(),
            r#type: None,
            param: None,
            code: None,
        };
        assert!(is_rate_limit(&by_message));

        let neither = ApiError {
            message: "model not found".to_string(),
            r#type: None,
            param: None,
            code: Some("model_not_found".to_string()),
        };
        assert!(!is_rate_limit(&neither));
    }
}
