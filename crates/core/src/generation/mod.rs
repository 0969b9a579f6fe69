use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::logging::{LogRecord, NullLogSink, SharedLogSink};
use crate::prompts::{GenerationParams, PromptBuilder, PromptMode, RenderedPrompt};

pub const CONTEXT_PREFIX: &str = "Previous context: ";
pub const GUIDANCE_PREFIX: &str = "\n\nUser guidance: ";
pub const CREDENTIAL_CHECK_MESSAGE: &str = "Connection test";
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    ConnectionFailure,
    Http { status: u16 },
    MalformedResponse,
    Cancelled,
    InvalidConfig,
}

impl ErrorKind {
    /// Whether the condition is transient. Only the retry loop acts on this;
    /// callers receiving a failure must not retry again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::ConnectionFailure => true,
            Self::Http { status } => matches!(status, 429 | 500 | 502 | 503 | 504),
            Self::MalformedResponse | Self::Cancelled | Self::InvalidConfig => false,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::ConnectionFailure => f.write_str("connection failure"),
            Self::Http { status } => write!(f, "http {status}"),
            Self::MalformedResponse => f.write_str("malformed response"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::InvalidConfig => f.write_str("invalid configuration"),
        }
    }
}

/// Failure crossing the [`ChatBackend`] seam. `message` is display-ready.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct GenerationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GenerationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "generation was cancelled")
    }

    pub fn into_outcome(self) -> GenerationOutcome {
        GenerationOutcome::Failure {
            kind: self.kind,
            message: self.message,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationOutcome {
    Success { text: String },
    Failure { kind: ErrorKind, message: String },
}

impl GenerationOutcome {
    pub fn success(text: impl Into<String>) -> Self {
        Self::Success { text: text.into() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Success { text } => Some(text),
            Self::Failure { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }

    pub fn into_result(self) -> Result<String, GenerationError> {
        match self {
            Self::Success { text } => Ok(text),
            Self::Failure { kind, message } => Err(GenerationError { kind, message }),
        }
    }
}

impl From<Result<String, GenerationError>> for GenerationOutcome {
    fn from(result: Result<String, GenerationError>) -> Self {
        match result {
            Ok(text) => Self::Success { text },
            Err(GenerationError { kind, message }) => Self::Failure { kind, message },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// One provider's way of turning a message list into completion text.
///
/// Implementations own their transport, credentials and retry budget and
/// return the raw (untrimmed) text of the first choice.
pub trait ChatBackend: Send + Sync {
    fn complete(
        &self,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError>;
}

impl<B: ChatBackend + ?Sized> ChatBackend for Box<B> {
    fn complete(
        &self,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        (**self).complete(messages, max_tokens, cancel)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub custom_template: Option<String>,
    pub params: GenerationParams,
    pub max_tokens: u32,
    /// Sent ahead of the prompt as a system message when non-empty.
    pub context: Option<String>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            custom_template: None,
            params: GenerationParams::default(),
            max_tokens: DEFAULT_MAX_TOKENS,
            context: None,
        }
    }

    pub fn with_template(mut self, template: Option<String>) -> Self {
        self.custom_template = template;
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContinueRequest {
    pub context: String,
    pub user_prompt: String,
    pub custom_template: Option<String>,
    pub params: GenerationParams,
    pub max_tokens: u32,
}

impl ContinueRequest {
    pub fn new(context: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            user_prompt: user_prompt.into(),
            custom_template: None,
            params: GenerationParams::default(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_template(mut self, template: Option<String>) -> Self {
        self.custom_template = template;
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// The capability set a presentation layer drives. Every call blocks until
/// it produces exactly one outcome; failures are display-ready.
pub trait WritingAssistant: Send + Sync {
    fn validate_credentials(&self, cancel: &CancellationToken) -> GenerationOutcome;

    fn generate_content(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> GenerationOutcome;

    fn continue_writing(
        &self,
        request: &ContinueRequest,
        cancel: &CancellationToken,
    ) -> GenerationOutcome;
}

pub struct GenerationService<B> {
    backend: B,
    prompts: PromptBuilder,
    sink: SharedLogSink,
}

impl<B: ChatBackend> GenerationService<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            prompts: PromptBuilder::new(),
            sink: Arc::new(NullLogSink),
        }
    }

    pub fn with_log_sink(mut self, sink: SharedLogSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn generation_messages(&self, request: &GenerateRequest) -> Vec<ChatMessage> {
        let rendered = self.prompts.build_generation_prompt(
            &request.prompt,
            request.custom_template.as_deref(),
            &request.params,
        );
        self.note_fallback(PromptMode::Generation, &rendered);

        let mut messages = Vec::with_capacity(2);
        if let Some(context) = request.context.as_deref().filter(|c| !c.is_empty()) {
            messages.push(ChatMessage::system(format!("{CONTEXT_PREFIX}{context}")));
        }
        messages.push(ChatMessage::user(rendered.into_text()));
        messages
    }

    pub fn continuation_messages(&self, request: &ContinueRequest) -> Vec<ChatMessage> {
        let rendered = self.prompts.build_continuation_prompt(
            &request.context,
            request.custom_template.as_deref(),
            &request.params,
        );
        self.note_fallback(PromptMode::Continuation, &rendered);

        let mut prompt = rendered.into_text();
        let guidance = request.user_prompt.trim();
        if !guidance.is_empty() {
            prompt.push_str(GUIDANCE_PREFIX);
            prompt.push_str(guidance);
        }
        vec![ChatMessage::user(prompt)]
    }

    fn run(
        &self,
        label: &str,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
        cancel: &CancellationToken,
    ) -> GenerationOutcome {
        if cancel.is_cancelled() {
            return GenerationError::cancelled().into_outcome();
        }

        self.sink.log(LogRecord::debug(format!(
            "{label}: sending {} message(s)",
            messages.len()
        )));

        match self.backend.complete(messages, max_tokens, cancel) {
            Ok(text) => GenerationOutcome::success(text.trim()),
            Err(err) => {
                self.sink
                    .log(LogRecord::error(format!("{label} failed: {}", err.message)));
                err.into_outcome()
            }
        }
    }

    fn note_fallback(&self, mode: PromptMode, rendered: &RenderedPrompt) {
        if let Some(reason) = rendered.fallback_reason() {
            self.sink.log(LogRecord::warn(format!(
                "custom {mode} template could not be rendered ({reason}); using the default template"
            )));
        }
    }
}

impl<B: ChatBackend> WritingAssistant for GenerationService<B> {
    fn validate_credentials(&self, cancel: &CancellationToken) -> GenerationOutcome {
        let messages = [ChatMessage::user(CREDENTIAL_CHECK_MESSAGE)];
        match self.run("credential check", &messages, None, cancel) {
            GenerationOutcome::Success { .. } => GenerationOutcome::success(""),
            failure => failure,
        }
    }

    fn generate_content(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> GenerationOutcome {
        let messages = self.generation_messages(request);
        self.run("generation", &messages, Some(request.max_tokens), cancel)
    }

    fn continue_writing(
        &self,
        request: &ContinueRequest,
        cancel: &CancellationToken,
    ) -> GenerationOutcome {
        let messages = self.continuation_messages(request);
        self.run("continuation", &messages, Some(request.max_tokens), cancel)
    }
}
