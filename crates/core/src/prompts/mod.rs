mod library;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use thiserror::Error;

pub use library::{TemplateEntry, TemplateLibrary, TemplateSource, TemplateStore, TemplateStoreError};

pub type PromptArguments = HashMap<String, String>;

pub const DEFAULT_GENRE: &str = "novel";
pub const DEFAULT_STYLE: &str = "modern";

pub const DEFAULT_GENERATION_TEMPLATE: &str = "\
You are a professional {genre} writer, skilled at writing in a {style} style.
Please write content based on the following prompt:

{prompt}

Requirements:
1. The content should fit the conventions of {genre}
2. The writing should reflect the {style} style
3. Length between {min_words} and {max_words} words
4. Keep the text coherent and logically connected
";

pub const DEFAULT_CONTINUATION_TEMPLATE: &str = "\
You are a professional {genre} writer, skilled at writing in a {style} style.
Please continue the following text:

Existing content:
{context}

Requirements:
1. Keep the style and tone consistent with the existing text
2. Keep the plot and content coherent
3. Continue with between {min_words} and {max_words} words
4. Make the transition from the existing text feel natural
";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PromptMode {
    Generation,
    Continuation,
}

impl PromptMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Continuation => "continuation",
        }
    }

    pub fn default_template(&self) -> &'static str {
        match self {
            Self::Generation => DEFAULT_GENERATION_TEMPLATE,
            Self::Continuation => DEFAULT_CONTINUATION_TEMPLATE,
        }
    }

    /// Placeholder that receives the caller's text in this mode.
    pub fn subject_key(&self) -> &'static str {
        match self {
            Self::Generation => "prompt",
            Self::Continuation => "context",
        }
    }

    pub fn default_word_range(&self) -> (u32, u32) {
        match self {
            Self::Generation => (500, 1000),
            Self::Continuation => (300, 800),
        }
    }

    /// Arguments a configuration screen can use to check a template before saving it.
    pub fn sample_arguments(&self) -> PromptArguments {
        let subject = match self {
            Self::Generation => "A lighthouse keeper finds a message in a bottle.",
            Self::Continuation => "The storm had not stopped for three days.",
        };
        GenerationParams::default().arguments(*self, subject)
    }
}

impl fmt::Display for PromptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for PromptMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "generation" | "generate" => Ok(Self::Generation),
            "continuation" | "continue" => Ok(Self::Continuation),
            other => Err(format!("unknown prompt mode `{other}`")),
        }
    }
}

/// Writing parameters for a single call. Unset fields take the defaults of
/// the prompt mode they are rendered for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenerationParams {
    pub genre: Option<String>,
    pub style: Option<String>,
    pub min_words: Option<u32>,
    pub max_words: Option<u32>,
}

impl GenerationParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = Some(genre.into());
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn with_word_range(mut self, min_words: u32, max_words: u32) -> Self {
        self.min_words = Some(min_words);
        self.max_words = Some(max_words);
        self
    }

    /// The word-count shortcut of the assistant dialog: a target of `words`
    /// allows up to 200 more.
    pub fn with_target_words(self, words: u32) -> Self {
        self.with_word_range(words, words.saturating_add(200))
    }

    pub fn arguments(&self, mode: PromptMode, subject: &str) -> PromptArguments {
        let (default_min, default_max) = mode.default_word_range();
        let mut args = PromptArguments::new();
        args.insert(
            "genre".into(),
            self.genre.clone().unwrap_or_else(|| DEFAULT_GENRE.to_string()),
        );
        args.insert(
            "style".into(),
            self.style.clone().unwrap_or_else(|| DEFAULT_STYLE.to_string()),
        );
        args.insert(
            "min_words".into(),
            self.min_words.unwrap_or(default_min).to_string(),
        );
        args.insert(
            "max_words".into(),
            self.max_words.unwrap_or(default_max).to_string(),
        );
        args.insert(mode.subject_key().into(), subject.to_string());
        args
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("no value supplied for placeholder `{0}`")]
    MissingArgument(String),
    #[error("unbalanced `{brace}` at byte {position}")]
    UnbalancedBrace { brace: char, position: usize },
    #[error("placeholder at byte {position} has no name")]
    EmptyPlaceholder { position: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum TemplateSegment {
    Literal(String),
    Placeholder(String),
}

/// A parsed template. `{name}` is a placeholder; `{{` and `}}` are literal braces.
#[derive(Clone, Debug)]
pub struct PromptTemplate {
    template: String,
    segments: Vec<TemplateSegment>,
    placeholders: BTreeSet<String>,
}

impl PromptTemplate {
    pub fn parse(template: &str) -> Result<Self, PromptError> {
        let segments = parse_segments(template)?;
        let placeholders = segments
            .iter()
            .filter_map(|segment| match segment {
                TemplateSegment::Placeholder(name) => Some(name.clone()),
                TemplateSegment::Literal(_) => None,
            })
            .collect();

        Ok(Self {
            template: template.to_string(),
            segments,
            placeholders,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.placeholders.iter().map(|s| s.as_str())
    }

    pub fn render(&self, arguments: &PromptArguments) -> Result<String, PromptError> {
        if let Some(missing) = self
            .placeholders
            .iter()
            .find(|name| !arguments.contains_key(*name))
        {
            return Err(PromptError::MissingArgument(missing.clone()));
        }

        let mut output = String::with_capacity(self.template.len());
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(text) => output.push_str(text),
                TemplateSegment::Placeholder(name) => {
                    if let Some(value) = arguments.get(name) {
                        output.push_str(value);
                    }
                }
            }
        }
        Ok(output)
    }
}

pub fn render_template(template: &str, arguments: &PromptArguments) -> Result<String, PromptError> {
    PromptTemplate::parse(template)?.render(arguments)
}

fn parse_segments(template: &str) -> Result<Vec<TemplateSegment>, PromptError> {
    let mut segments = Vec::new();
    let mut buffer = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((position, ch)) = chars.next() {
        match ch {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    buffer.push('{');
                    continue;
                }

                let mut name = String::new();
                let mut closed = false;
                for (_, next) in chars.by_ref() {
                    match next {
                        '}' => {
                            closed = true;
                            break;
                        }
                        '{' => return Err(PromptError::UnbalancedBrace { brace: '{', position }),
                        other => name.push(other),
                    }
                }

                if !closed {
                    return Err(PromptError::UnbalancedBrace { brace: '{', position });
                }
                if name.is_empty() {
                    return Err(PromptError::EmptyPlaceholder { position });
                }

                if !buffer.is_empty() {
                    segments.push(TemplateSegment::Literal(std::mem::take(&mut buffer)));
                }
                segments.push(TemplateSegment::Placeholder(name));
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                    buffer.push('}');
                } else {
                    return Err(PromptError::UnbalancedBrace { brace: '}', position });
                }
            }
            _ => buffer.push(ch),
        }
    }

    if !buffer.is_empty() {
        segments.push(TemplateSegment::Literal(buffer));
    }

    Ok(segments)
}

/// Outcome of the template render step. `fallback` carries the reason the
/// custom template was rejected when the built-in default was used instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedPrompt {
    text: String,
    fallback: Option<PromptError>,
}

impl RenderedPrompt {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn used_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn fallback_reason(&self) -> Option<&PromptError> {
        self.fallback.as_ref()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build_generation_prompt(
        &self,
        prompt_text: &str,
        custom_template: Option<&str>,
        params: &GenerationParams,
    ) -> RenderedPrompt {
        self.build(PromptMode::Generation, prompt_text, custom_template, params)
    }

    pub fn build_continuation_prompt(
        &self,
        context: &str,
        custom_template: Option<&str>,
        params: &GenerationParams,
    ) -> RenderedPrompt {
        self.build(PromptMode::Continuation, context, custom_template, params)
    }

    /// Renders `custom_template` (or the mode default when absent or blank).
    /// A template that fails to render is replaced by the mode default with
    /// the same arguments; this never fails.
    pub fn build(
        &self,
        mode: PromptMode,
        subject: &str,
        custom_template: Option<&str>,
        params: &GenerationParams,
    ) -> RenderedPrompt {
        let arguments = params.arguments(mode, subject);

        let custom = custom_template.filter(|template| !template.trim().is_empty());
        if let Some(template) = custom {
            match render_template(template, &arguments) {
                Ok(text) => return RenderedPrompt { text, fallback: None },
                Err(reason) => {
                    return RenderedPrompt {
                        text: render_default(mode, &arguments),
                        fallback: Some(reason),
                    }
                }
            }
        }

        RenderedPrompt {
            text: render_default(mode, &arguments),
            fallback: None,
        }
    }

    pub fn validate_template(&self, template: &str, sample_params: &PromptArguments) -> bool {
        render_template(template, sample_params).is_ok()
    }
}

fn render_default(mode: PromptMode, arguments: &PromptArguments) -> String {
    // The defaults only reference keys that `GenerationParams::arguments` always supplies.
    render_template(mode.default_template(), arguments)
        .unwrap_or_else(|_| mode.default_template().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> GenerationParams {
        GenerationParams::new()
            .with_genre("fantasy")
            .with_style("lyrical")
            .with_word_range(100, 200)
    }

    #[test]
    fn renders_default_generation_template() {
        let rendered = PromptBuilder::new().build_generation_prompt("A dragon wakes", None, &params());
        assert!(!rendered.used_fallback());
        let text = rendered.text();
        assert!(text.contains("professional fantasy writer"));
        assert!(text.contains("lyrical style"));
        assert!(text.contains("A dragon wakes"));
        assert!(text.contains("between 100 and 200 words"));
        assert!(!text.contains('{'));
        assert!(!text.contains('}'));
    }

    #[test]
    fn unset_params_use_mode_defaults() {
        let builder = PromptBuilder::new();
        let generation = builder.build_generation_prompt("x", None, &GenerationParams::new());
        assert!(generation.text().contains("professional novel writer"));
        assert!(generation.text().contains("modern style"));
        assert!(generation.text().contains("between 500 and 1000 words"));

        let continuation = builder.build_continuation_prompt("x", None, &GenerationParams::new());
        assert!(continuation.text().contains("between 300 and 800 words"));
    }

    #[test]
    fn custom_template_is_substituted_literally() {
        let rendered = PromptBuilder::new().build_generation_prompt(
            "a haiku",
            Some("Write {prompt} as {genre} ({min_words}-{max_words}, {style})"),
            &params(),
        );
        assert_eq!(rendered.text(), "Write a haiku as fantasy (100-200, lyrical)");
        assert!(!rendered.used_fallback());
    }

    #[test]
    fn missing_placeholder_falls_back_to_default() {
        let builder = PromptBuilder::new();
        let expected = builder.build_generation_prompt("a haiku", None, &params());
        let rendered =
            builder.build_generation_prompt("a haiku", Some("Use {context} and {mood}"), &params());

        assert_eq!(rendered.text(), expected.text());
        assert!(rendered.used_fallback());
        assert_eq!(
            rendered.fallback_reason(),
            Some(&PromptError::MissingArgument("context".into()))
        );
    }

    #[test]
    fn continuation_rejects_prompt_placeholder() {
        let builder = PromptBuilder::new();
        let expected = builder.build_continuation_prompt("Once upon a time,", None, &params());
        let rendered =
            builder.build_continuation_prompt("Once upon a time,", Some("{prompt}"), &params());
        assert_eq!(rendered.text(), expected.text());
        assert!(rendered.text().contains("Once upon a time,"));
    }

    #[test]
    fn unbalanced_braces_fall_back() {
        let builder = PromptBuilder::new();
        let expected = builder.build_generation_prompt("p", None, &params());
        for broken in ["Write {prompt", "Write prompt}", "Write {pro{mpt}", "Write {}"] {
            let rendered = builder.build_generation_prompt("p", Some(broken), &params());
            assert!(rendered.used_fallback(), "template {broken:?} should fall back");
            assert_eq!(rendered.text(), expected.text());
        }
    }

    #[test]
    fn blank_custom_template_uses_default_without_fallback_tag() {
        let rendered = PromptBuilder::new().build_generation_prompt("p", Some("   "), &params());
        assert!(!rendered.used_fallback());
        assert!(rendered.text().contains("Please write content"));
    }

    #[test]
    fn escaped_braces_render_as_literals() {
        let rendered = PromptBuilder::new().build_generation_prompt(
            "story",
            Some("{{json}} {prompt} }}"),
            &params(),
        );
        assert_eq!(rendered.text(), "{json} story }");
    }

    #[test]
    fn empty_subject_is_accepted() {
        let rendered = PromptBuilder::new().build_continuation_prompt("", Some("[{context}]"), &params());
        assert_eq!(rendered.text(), "[]");
    }

    #[test]
    fn extra_arguments_are_ignored() {
        let mut args = PromptMode::Generation.sample_arguments();
        args.insert("unused".into(), "value".into());
        assert_eq!(render_template("{genre}", &args).unwrap(), "novel");
    }

    #[test]
    fn validate_template_reports_render_success() {
        let builder = PromptBuilder::new();
        let sample = PromptMode::Generation.sample_arguments();
        assert!(builder.validate_template(DEFAULT_GENERATION_TEMPLATE, &sample));
        assert!(builder.validate_template("{prompt} in {style}", &sample));
        assert!(!builder.validate_template("{context}", &sample));
        assert!(!builder.validate_template("{prompt", &sample));
        assert!(builder.validate_template(
            DEFAULT_CONTINUATION_TEMPLATE,
            &PromptMode::Continuation.sample_arguments()
        ));
    }

    #[test]
    fn target_words_adds_headroom() {
        let params = GenerationParams::new().with_target_words(500);
        assert_eq!(params.min_words, Some(500));
        assert_eq!(params.max_words, Some(700));
    }

    #[test]
    fn parse_collects_placeholders() {
        let template = PromptTemplate::parse("{genre} {style} {genre}").unwrap();
        let names: Vec<&str> = template.placeholders().collect();
        assert_eq!(names, vec!["genre", "style"]);
    }

    #[test]
    fn parses_prompt_mode_names() {
        assert_eq!("continue".parse::<PromptMode>(), Ok(PromptMode::Continuation));
        assert_eq!("Generation".parse::<PromptMode>(), Ok(PromptMode::Generation));
        assert!("summary".parse::<PromptMode>().is_err());
    }
}
