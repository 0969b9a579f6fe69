use log::debug;
use serde_json::Value;

use writer_core::{
    CancellationToken, ChatBackend, ChatMessage, GenerationError, GenerationService,
    SettingsProvider, SharedLogSink, WritingAssistant,
};

use crate::error::AdapterError;
use crate::retry::{RetryingInvoker, Sleeper, ThreadSleeper};
use crate::transport::{ChatCompletionRequest, Transport, TransportClient};

/// Chat-completions backend for OpenAI-compatible providers.
pub struct ChatCompletionsBackend<T, S = ThreadSleeper> {
    invoker: RetryingInvoker<T, S>,
    model: String,
}

impl<T: Transport, S: Sleeper> ChatCompletionsBackend<T, S> {
    pub fn new(invoker: RetryingInvoker<T, S>, model: impl Into<String>) -> Self {
        Self {
            invoker,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn invoker(&self) -> &RetryingInvoker<T, S> {
        &self.invoker
    }

    pub fn request_body(
        &self,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
    ) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            max_tokens,
        }
    }

    fn send(
        &self,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<String, AdapterError> {
        let body = self.request_body(messages, max_tokens);
        self.invoker.invoke_with(&body, cancel, |response| extract_content(&response))
    }
}

impl<T: Transport, S: Sleeper> ChatBackend for ChatCompletionsBackend<T, S> {
    fn complete(
        &self,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        self.send(messages, max_tokens, cancel)
            .map_err(GenerationError::from)
    }
}

/// Returns `choices[0].message.content` from a chat-completions response.
pub fn extract_content(response: &Value) -> Result<String, AdapterError> {
    let choices = response
        .get("choices")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::MalformedResponse("missing `choices` array".to_string()))?;
    let first = choices
        .first()
        .ok_or_else(|| AdapterError::MalformedResponse("`choices` is empty".to_string()))?;
    first
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            AdapterError::MalformedResponse(
                "missing `choices[0].message.content` string".to_string(),
            )
        })
}

/// Picks the endpoint for a provider when none is configured explicitly.
pub fn resolve_endpoint(provider: &str, endpoint_url: &str) -> Result<String, AdapterError> {
    let explicit = endpoint_url.trim();
    if !explicit.is_empty() {
        return Ok(explicit.to_string());
    }

    let provider = provider.trim().to_lowercase();
    let default = match provider.as_str() {
        "" | "siliconflow" => "https://api.siliconflow.cn/v1/chat/completions",
        "deepseek" => "https://api.deepseek.com/v1/chat/completions",
        "openai" => "https://api.openai.com/v1/chat/completions",
        "ollama" => "http://localhost:11434/v1/chat/completions",
        "custom" => {
            return Err(AdapterError::InvalidConfig(
                "provider `custom` requires endpoint_url".to_string(),
            ))
        }
        other => {
            return Err(AdapterError::InvalidConfig(format!(
                "unknown provider: {}",
                other
            )))
        }
    };
    Ok(default.to_string())
}

pub type DefaultBackend = ChatCompletionsBackend<TransportClient>;

/// Builds the production generation service from configuration.
pub fn create_generation_service(
    settings: &dyn SettingsProvider,
) -> Result<GenerationService<DefaultBackend>, AdapterError> {
    let mut config = settings.service_config()?;
    config.endpoint_url = resolve_endpoint(settings.provider_name(), &config.endpoint_url)?;
    let policy = settings.retry_policy();
    debug!(
        "creating {} backend for model `{}` at {} ({} retries)",
        settings.provider_name(),
        config.model,
        config.endpoint_url,
        policy.max_retries
    );

    let model = config.model.clone();
    let transport = TransportClient::new(config)?;
    let backend = ChatCompletionsBackend::new(RetryingInvoker::new(transport, policy), model);
    Ok(GenerationService::new(backend))
}

pub fn create_writing_assistant(
    settings: &dyn SettingsProvider,
    sink: SharedLogSink,
) -> Result<Box<dyn WritingAssistant>, AdapterError> {
    let service = create_generation_service(settings)?.with_log_sink(sink);
    Ok(Box::new(service))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use writer_core::{Config, ErrorKind};

    use super::*;

    #[test]
    fn extracts_first_choice_content() {
        let response = json!({
            "choices": [
                {"message": {"role": "assistant", "content": "Roses are red."}},
                {"message": {"role": "assistant", "content": "ignored"}}
            ]
        });
        assert_eq!(extract_content(&response).unwrap(), "Roses are red.");
    }

    #[test]
    fn rejects_unexpected_shapes() {
        for response in [
            json!({}),
            json!({"choices": []}),
            json!({"choices": [{"message": {}}]}),
            json!({"choices": [{"message": {"content": 42}}]}),
            json!({"choices": [{"text": "legacy"}]}),
        ] {
            let err = extract_content(&response).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedResponse, "{response}");
        }
    }

    #[test]
    fn resolves_provider_endpoints() {
        assert_eq!(
            resolve_endpoint("siliconflow", "").unwrap(),
            "https://api.siliconflow.cn/v1/chat/completions"
        );
        assert_eq!(
            resolve_endpoint("DeepSeek", " ").unwrap(),
            "https://api.deepseek.com/v1/chat/completions"
        );
        assert_eq!(
            resolve_endpoint("ollama", "").unwrap(),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(
            resolve_endpoint("openai", " http://proxy.local/v1/chat/completions ").unwrap(),
            "http://proxy.local/v1/chat/completions"
        );
        assert!(resolve_endpoint("custom", "").is_err());
        assert!(resolve_endpoint("mystery", "").is_err());
    }

    #[test]
    fn factory_requires_api_key() {
        let err = create_generation_service(&Config::default())
            .err()
            .expect("missing key should fail");
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn factory_uses_configured_model_and_normalized_key() {
        let mut config = Config::default();
        config.service.api_key = "Bearer sk-ABC".into();
        config.service.provider = "deepseek".into();
        config.service.model = "deepseek-chat".into();

        let service = create_generation_service(&config).unwrap();
        let backend = service.backend();
        assert_eq!(backend.model(), "deepseek-chat");
        let transport = backend.invoker().transport();
        assert_eq!(transport.authorization_header(), "Bearer sk-ABC");
        assert_eq!(
            transport.config().endpoint_url,
            "https://api.deepseek.com/v1/chat/completions"
        );
        assert_eq!(backend.invoker().policy().max_retries, 3);
    }
}
