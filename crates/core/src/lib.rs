pub mod cancel;
pub mod config;
pub mod generation;
pub mod logging;
pub mod prompts;

pub use cancel::CancellationToken;
pub use config::{
    Config, ConfigError, ConfigStore, RetryPolicy, ServiceConfig, ServiceSettings,
    SettingsProvider, TemplateSettings,
};
pub use generation::{
    ChatBackend, ChatMessage, ChatRole, ContinueRequest, ErrorKind, GenerateRequest,
    GenerationError, GenerationOutcome, GenerationService, WritingAssistant,
};
pub use logging::{
    LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink, StderrLogSink, VecLogSink,
};
pub use prompts::{
    GenerationParams, PromptArguments, PromptBuilder, PromptError, PromptMode, PromptTemplate,
    render_template, RenderedPrompt, TemplateLibrary, TemplateStore, TemplateStoreError,
};
