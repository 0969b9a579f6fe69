use clap::{Args, Parser, Subcommand};
use writer_adapters::{create_writing_assistant, AdapterError};
use writer_core::prompts::TemplateEntry;
use writer_core::{
    render_template, CancellationToken, ConfigError, ConfigStore, ContinueRequest,
    GenerateRequest, GenerationOutcome, GenerationParams, LogLevel, LogRecord, LogSink,
    PromptBuilder, PromptMode, PromptTemplate, SharedLogSink, StderrLogSink, TemplateStore,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let sink: SharedLogSink = Arc::new(StderrLogSink::new(level));

    match cli.command {
        Command::Config(command) => handle_config(&cli.config, command, sink),
        Command::Generate(args) => run_generate(&cli.config, args, sink),
        Command::Continue(args) => run_continue(&cli.config, args, sink),
        Command::Template(command) => handle_template(&cli.config, command, sink.as_ref()),
    }
}

fn handle_config(
    config_path: &Path,
    command: ConfigCommand,
    sink: SharedLogSink,
) -> Result<(), CliError> {
    match command {
        ConfigCommand::Test => run_config_test(config_path, sink),
    }
}

fn handle_template(
    config_path: &Path,
    command: TemplateCommand,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    match command {
        TemplateCommand::Validate(args) => run_validate_template(args, sink),
        TemplateCommand::List => run_list_templates(config_path),
    }
}

fn run_config_test(config_path: &Path, sink: SharedLogSink) -> Result<(), CliError> {
    let store = ConfigStore::open(config_path)?;
    let service = &store.config().service;
    sink.log(LogRecord::info(format!(
        "testing credentials for provider `{}` with model `{}`",
        service.provider, service.model
    )));

    let assistant = create_writing_assistant(store.config(), sink.clone())?;
    let outcome = assistant.validate_credentials(&CancellationToken::new());
    finish(outcome, sink.as_ref(), |_| {
        println!("Connection OK");
    })
}

fn run_generate(config_path: &Path, args: GenerateArgs, sink: SharedLogSink) -> Result<(), CliError> {
    let store = ConfigStore::open(config_path)?;
    let template = resolve_template(&store, args.template_file.as_deref(), PromptMode::Generation)?;

    let mut request = GenerateRequest::new(args.prompt)
        .with_template(template)
        .with_params(args.params.to_params());
    if let Some(max_tokens) = args.params.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }
    if let Some(context) = args.context {
        request = request.with_context(context);
    }

    let assistant = create_writing_assistant(store.config(), sink.clone())?;
    let outcome = assistant.generate_content(&request, &CancellationToken::new());
    finish(outcome, sink.as_ref(), |text| println!("{text}"))
}

fn run_continue(config_path: &Path, args: ContinueArgs, sink: SharedLogSink) -> Result<(), CliError> {
    let store = ConfigStore::open(config_path)?;
    let context = read_file(&args.context_file)?;
    let template = resolve_template(
        &store,
        args.template_file.as_deref(),
        PromptMode::Continuation,
    )?;

    let mut request = ContinueRequest::new(context, args.prompt.unwrap_or_default())
        .with_template(template)
        .with_params(args.params.to_params());
    if let Some(max_tokens) = args.params.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }

    let assistant = create_writing_assistant(store.config(), sink.clone())?;
    let outcome = assistant.continue_writing(&request, &CancellationToken::new());
    finish(outcome, sink.as_ref(), |text| println!("{text}"))
}

fn run_validate_template(args: ValidateTemplateArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let template = read_file(&args.file)?;
    let arguments = args.mode.sample_arguments();
    let builder = PromptBuilder::new();

    if builder.validate_template(&template, &arguments) {
        println!("Template is valid for {} mode", args.mode);
        let placeholders = PromptTemplate::parse(&template)
            .map(|parsed| parsed.placeholders().map(str::to_string).collect::<Vec<_>>())
            .unwrap_or_default();
        if !placeholders.is_empty() {
            println!("Placeholders: {}", placeholders.join(", "));
        }
        Ok(())
    } else {
        let reason = render_template(&template, &arguments)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        sink.log(LogRecord::error(format!(
            "{} cannot be rendered: {reason}",
            args.file.display()
        )));
        Err(CliError::InvalidTemplate(reason))
    }
}

fn run_list_templates(config_path: &Path) -> Result<(), CliError> {
    let store = ConfigStore::open(config_path)?;
    let library = store.config().template_library()?;
    for mode in [PromptMode::Generation, PromptMode::Continuation] {
        println!("{}", describe_template(mode, library.get(mode)));
    }
    Ok(())
}

fn describe_template(mode: PromptMode, entry: Option<&TemplateEntry>) -> String {
    let Some(entry) = entry else {
        return format!("{mode}: built-in default");
    };
    let source = match entry.source().as_path() {
        Some(path) => path.display().to_string(),
        None => "configuration".to_string(),
    };
    match entry.description() {
        Some(description) => format!("{mode}: {source} ({description})"),
        None => format!("{mode}: {source}"),
    }
}

/// An explicit template file wins over templates from the configuration.
fn resolve_template(
    store: &ConfigStore,
    template_file: Option<&Path>,
    mode: PromptMode,
) -> Result<Option<String>, CliError> {
    if let Some(path) = template_file {
        return read_file(path).map(Some);
    }
    let library = store.config().template_library()?;
    Ok(library.template_for(mode))
}

fn read_file(path: &Path) -> Result<String, CliError> {
    fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn finish(
    outcome: GenerationOutcome,
    sink: &dyn LogSink,
    on_success: impl FnOnce(&str),
) -> Result<(), CliError> {
    match outcome.into_result() {
        Ok(text) => {
            if text.is_empty() {
                sink.log(LogRecord::warn("the service returned an empty completion"));
            }
            on_success(&text);
            Ok(())
        }
        Err(err) => {
            sink.log(LogRecord::debug(format!("failure kind: {}", err.kind)));
            Err(CliError::Generation(err.message))
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("template is invalid: {0}")]
    InvalidTemplate(String),
    #[error("{0}")]
    Generation(String),
}

#[derive(Parser)]
#[command(
    name = "writerctl",
    version,
    about = "Writing assistant command-line tool"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Show debug progress messages
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Configuration checks
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Generate new content from a prompt
    Generate(GenerateArgs),
    /// Continue an existing text
    Continue(ContinueArgs),
    /// Template utilities
    #[command(subcommand)]
    Template(TemplateCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Send a test message to verify the API key and endpoint
    Test,
}

#[derive(Subcommand)]
enum TemplateCommand {
    /// Check that a template renders with sample parameters
    Validate(ValidateTemplateArgs),
    /// Show which template each mode uses
    List,
}

#[derive(Args)]
struct ParamArgs {
    #[arg(long)]
    genre: Option<String>,
    #[arg(long)]
    style: Option<String>,
    #[arg(long, value_name = "N")]
    min_words: Option<u32>,
    #[arg(long, value_name = "N")]
    max_words: Option<u32>,
    /// Target length; allows up to 200 words more
    #[arg(long, value_name = "N", conflicts_with_all = ["min_words", "max_words"])]
    words: Option<u32>,
    #[arg(long, value_name = "TOKENS")]
    max_tokens: Option<u32>,
}

impl ParamArgs {
    fn to_params(&self) -> GenerationParams {
        let mut params = GenerationParams {
            genre: self.genre.clone(),
            style: self.style.clone(),
            min_words: self.min_words,
            max_words: self.max_words,
        };
        if let Some(words) = self.words {
            params = params.with_target_words(words);
        }
        params
    }
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(long, value_name = "TEXT")]
    prompt: String,
    /// Earlier text sent ahead of the prompt
    #[arg(long, value_name = "TEXT")]
    context: Option<String>,
    #[arg(long, value_name = "FILE")]
    template_file: Option<PathBuf>,
    #[command(flatten)]
    params: ParamArgs,
}

#[derive(Args)]
struct ContinueArgs {
    /// File holding the text to continue
    #[arg(long, value_name = "FILE")]
    context_file: PathBuf,
    /// Extra guidance for the continuation
    #[arg(long, value_name = "TEXT")]
    prompt: Option<String>,
    #[arg(long, value_name = "FILE")]
    template_file: Option<PathBuf>,
    #[command(flatten)]
    params: ParamArgs,
}

#[derive(Args)]
struct ValidateTemplateArgs {
    #[arg(long, value_name = "FILE")]
    file: PathBuf,
    #[arg(long, default_value = "generation")]
    mode: PromptMode,
}
