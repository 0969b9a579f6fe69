mod error;
mod llm;
mod retry;
mod transport;

pub use error::AdapterError;
pub use llm::{
    create_generation_service, create_writing_assistant, extract_content, resolve_endpoint,
    ChatCompletionsBackend, DefaultBackend,
};
pub use retry::{call_with_retry, RetryingInvoker, Sleeper, ThreadSleeper};
pub use transport::{
    normalize_api_key, parse_error_body, ChatCompletionRequest, Transport, TransportClient,
};

pub use writer_core::config::{Config, ConfigStore, RetryPolicy, ServiceConfig};
