use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{self, HeaderValue};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use serde_json::Value;

use writer_core::{CancellationToken, ChatMessage, ServiceConfig};

use crate::error::AdapterError;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);
const UNKNOWN_ERROR_MESSAGE: &str = "unknown error";

static BEARER_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^bearer ").unwrap());

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// One request/response cycle against a chat-completions endpoint. Never retries.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        body: &ChatCompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, AdapterError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(
        &self,
        body: &ChatCompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, AdapterError> {
        (**self).send(body, cancel)
    }
}

/// Trims the key and drops a leading `Bearer ` (any case) so the header can
/// always be rebuilt as `Bearer <key>`.
pub fn normalize_api_key(raw: &str) -> String {
    let trimmed = raw.trim();
    BEARER_PREFIX.replace(trimmed, "").trim().to_string()
}

pub struct TransportClient {
    client: Client,
    config: ServiceConfig,
    authorization: HeaderValue,
}

impl TransportClient {
    pub fn new(mut config: ServiceConfig) -> Result<Self, AdapterError> {
        let endpoint = config.endpoint_url.trim().to_string();
        if endpoint.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "endpoint_url must not be empty".to_string(),
            ));
        }
        Url::parse(&endpoint).map_err(|err| {
            AdapterError::InvalidConfig(format!("invalid endpoint_url `{endpoint}`: {err}"))
        })?;

        config.endpoint_url = endpoint;
        config.api_key = normalize_api_key(&config.api_key);

        let mut authorization = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|err| {
                AdapterError::InvalidConfig(format!("invalid api key header: {}", err))
            })?;
        authorization.set_sensitive(true);

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(AdapterError::from_reqwest)?;

        Ok(Self {
            client,
            config,
            authorization,
        })
    }

    /// The configuration in effect, with the API key already normalized.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn api_key(&self) -> &str {
        &self.config.api_key
    }

    pub fn authorization_header(&self) -> &str {
        self.authorization.to_str().unwrap_or_default()
    }

    fn pending(&self, body: &ChatCompletionRequest) -> PendingRequest {
        PendingRequest {
            client: self.client.clone(),
            endpoint: self.config.endpoint_url.clone(),
            authorization: self.authorization.clone(),
            body: body.clone(),
        }
    }
}

impl Transport for TransportClient {
    fn send(
        &self,
        body: &ChatCompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, AdapterError> {
        if cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }

        // The request runs on a helper thread so a cancelled caller can stop
        // waiting; an abandoned request finishes or times out on its own.
        let request = self.pending(body);
        let (tx, rx) = mpsc::channel();
        let worker = {
            let request = request.clone();
            thread::Builder::new()
                .name("writer-transport".to_string())
                .spawn(move || {
                    let _ = tx.send(request.execute());
                })
        };
        if worker.is_err() {
            return request.execute();
        }

        loop {
            match rx.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled() {
                        debug!("abandoning in-flight request to {}", request.endpoint);
                        return Err(AdapterError::Cancelled);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AdapterError::MalformedResponse(
                        "transport worker exited without a response".to_string(),
                    ))
                }
            }
        }
    }
}

#[derive(Clone)]
struct PendingRequest {
    client: Client,
    endpoint: String,
    authorization: HeaderValue,
    body: ChatCompletionRequest,
}

impl PendingRequest {
    fn execute(&self) -> Result<Value, AdapterError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .header(header::AUTHORIZATION, self.authorization.clone())
            .json(&self.body)
            .send()
            .map_err(AdapterError::from_reqwest)?;

        let status = response.status();
        let text = response.text().map_err(AdapterError::from_reqwest)?;

        if status != StatusCode::OK {
            let (message, error_type) = parse_error_body(&text);
            return Err(AdapterError::HttpStatus {
                status,
                message,
                error_type,
            });
        }

        serde_json::from_str(&text).map_err(|err| {
            AdapterError::MalformedResponse(format!("response body is not valid JSON: {err}"))
        })
    }
}

/// Pulls `error.message` and `error.type` out of an error body, tolerating
/// bodies that are missing either field or are not JSON at all.
pub fn parse_error_body(body: &str) -> (String, String) {
    let error = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("error").cloned());

    let message = match &error {
        Some(Value::String(text)) if !text.trim().is_empty() => text.clone(),
        Some(value) => value
            .get("message")
            .and_then(Value::as_str)
            .filter(|text| !text.trim().is_empty())
            .unwrap_or(UNKNOWN_ERROR_MESSAGE)
            .to_string(),
        None => UNKNOWN_ERROR_MESSAGE.to_string(),
    };

    let error_type = error
        .as_ref()
        .and_then(|value| value.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    (message, error_type)
}
