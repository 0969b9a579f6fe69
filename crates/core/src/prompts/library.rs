use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::PromptMode;

/// Source of user-supplied templates that override the built-in defaults.
pub trait TemplateStore {
    fn template_for(&self, mode: PromptMode) -> Option<String>;

    fn generation_template(&self) -> Option<String> {
        self.template_for(PromptMode::Generation)
    }

    fn continuation_template(&self) -> Option<String> {
        self.template_for(PromptMode::Continuation)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TemplateSource {
    Config,
    File(PathBuf),
}

impl TemplateSource {
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Config => None,
            Self::File(path) => Some(path.as_path()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TemplateEntry {
    template: String,
    description: Option<String>,
    source: TemplateSource,
}

impl TemplateEntry {
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn source(&self) -> &TemplateSource {
        &self.source
    }
}

#[derive(Debug, Error)]
pub enum TemplateStoreError {
    #[error("failed to read template file `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse template file `{path}` as TOML: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to parse template file `{path}` as YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("unsupported template file `{0}`; expected .toml, .yaml or .yml")]
    UnsupportedFormat(PathBuf),
}

/// Custom templates keyed by prompt mode, loaded from TOML or YAML documents:
///
/// ```toml
/// [templates.generation]
/// template = "Write {prompt} as a {genre} piece."
/// description = "terse"
/// ```
#[derive(Clone, Debug, Default)]
pub struct TemplateLibrary {
    generation: Option<TemplateEntry>,
    continuation: Option<TemplateEntry>,
}

impl TemplateLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_path(path: &Path) -> Result<Self, TemplateStoreError> {
        let mut library = Self::default();
        library.load_file(path)?;
        Ok(library)
    }

    /// Loads every `.toml`/`.yaml`/`.yml` file in `dir` in name order; later
    /// files override earlier ones. A missing directory yields an empty library.
    pub fn from_directory(dir: &Path) -> Result<Self, TemplateStoreError> {
        let mut library = Self::default();
        if !dir.is_dir() {
            return Ok(library);
        }

        let read_dir = fs::read_dir(dir).map_err(|source| TemplateStoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| TemplateStoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() && document_format(&path).is_some() {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            library.load_file(&path)?;
        }
        Ok(library)
    }

    pub fn get(&self, mode: PromptMode) -> Option<&TemplateEntry> {
        match mode {
            PromptMode::Generation => self.generation.as_ref(),
            PromptMode::Continuation => self.continuation.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.generation.is_none() && self.continuation.is_none()
    }

    pub fn set(&mut self, mode: PromptMode, template: impl Into<String>, source: TemplateSource) {
        let entry = TemplateEntry {
            template: template.into(),
            description: None,
            source,
        };
        *self.slot(mode) = Some(entry);
    }

    fn slot(&mut self, mode: PromptMode) -> &mut Option<TemplateEntry> {
        match mode {
            PromptMode::Generation => &mut self.generation,
            PromptMode::Continuation => &mut self.continuation,
        }
    }

    fn load_file(&mut self, path: &Path) -> Result<(), TemplateStoreError> {
        let format = document_format(path)
            .ok_or_else(|| TemplateStoreError::UnsupportedFormat(path.to_path_buf()))?;
        let contents = fs::read_to_string(path).map_err(|source| TemplateStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let document: TemplateDocument = match format {
            DocumentFormat::Toml => {
                toml::from_str(&contents).map_err(|source| TemplateStoreError::ParseToml {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            DocumentFormat::Yaml => {
                serde_yaml::from_str(&contents).map_err(|source| TemplateStoreError::ParseYaml {
                    path: path.to_path_buf(),
                    source,
                })?
            }
        };

        for (key, raw) in document.templates {
            let Ok(mode) = key.parse::<PromptMode>() else {
                continue;
            };
            *self.slot(mode) = Some(TemplateEntry {
                template: raw.template,
                description: raw.description,
                source: TemplateSource::File(path.to_path_buf()),
            });
        }
        Ok(())
    }
}

impl TemplateStore for TemplateLibrary {
    fn template_for(&self, mode: PromptMode) -> Option<String> {
        self.get(mode).map(|entry| entry.template.clone())
    }
}

#[derive(Clone, Copy)]
enum DocumentFormat {
    Toml,
    Yaml,
}

fn document_format(path: &Path) -> Option<DocumentFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Some(DocumentFormat::Toml),
        "yaml" | "yml" => Some(DocumentFormat::Yaml),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct TemplateDocument {
    #[serde(default)]
    templates: BTreeMap<String, RawTemplate>,
}

#[derive(Debug, Deserialize)]
struct RawTemplate {
    #[serde(alias = "text")]
    template: String,
    #[serde(default)]
    description: Option<String>,
}
