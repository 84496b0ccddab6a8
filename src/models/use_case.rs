use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Logical task category used to pick a default model chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum UseCase {
    Chat,
    Analysis,
    CodeGeneration,
    Summarization,
    Extraction,
    Vision,
    FastResponse,
    HighQuality,
    CostEffective,
}

impl UseCase {
    pub const ALL: [UseCase; 9] = [
        UseCase::Chat,
        UseCase::Analysis,
        UseCase::CodeGeneration,
        UseCase::Summarization,
        UseCase::Extraction,
        UseCase::Vision,
        UseCase::FastResponse,
        UseCase::HighQuality,
        UseCase::CostEffective,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UseCase::Chat => "chat",
            UseCase::Analysis => "analysis",
            UseCase::CodeGeneration => "code_generation",
            UseCase::Summarization => "summarization",
            UseCase::Extraction => "extraction",
            UseCase::Vision => "vision",
            UseCase::FastResponse => "fast_response",
            UseCase::HighQuality => "high_quality",
            UseCase::CostEffective => "cost_effective",
        }
    }
}

impl fmt::Display for UseCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UseCase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        UseCase::ALL
            .into_iter()
            .find(|u| u.as_str() == normalized)
            .ok_or_else(|| Error::validation(format!("Unknown use case: {}", s)))
    }
}

/// Fully-qualified model reference, `provider:model`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parses `provider:model`. Returns `None` for a bare model id.
    pub fn parse(value: &str) -> Option<Self> {
        let (provider, model) = value.split_once(':')?;
        let (provider, model) = (provider.trim(), model.trim());
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UseCaseModelMapping {
    /// `provider:model`
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
}

impl UseCaseModelMapping {
    pub fn new(primary: &str, fallbacks: &[&str]) -> Self {
        Self {
            primary: primary.to_string(),
            fallbacks: fallbacks.iter().map(|f| f.to_string()).collect(),
            temperature: None,
            max_tokens: None,
            system_prompt: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// `[primary, ...fallbacks]` with duplicates removed, order preserved.
    pub fn candidates(&self) -> Result<Vec<ModelRef>> {
        let mut out: Vec<ModelRef> = Vec::with_capacity(1 + self.fallbacks.len());
        for id in std::iter::once(&self.primary).chain(self.fallbacks.iter()) {
            let model_ref = ModelRef::parse(id).ok_or_else(|| {
                Error::validation(format!("Model reference '{}' must be provider:model", id))
            })?;
            if !out.contains(&model_ref) {
                out.push(model_ref);
            }
        }
        Ok(out)
    }
}

pub fn default_mappings() -> HashMap<UseCase, UseCaseModelMapping> {
    let mut mappings = HashMap::new();
    mappings.insert(
        UseCase::Chat,
        UseCaseModelMapping::new(
            "openai:gpt-4o-mini",
            &["anthropic:claude-3-5-haiku-20241022", "gemini:gemini-1.5-flash"],
        )
        .with_temperature(0.7),
    );
    mappings.insert(
        UseCase::Analysis,
        UseCaseModelMapping::new(
            "anthropic:claude-3-5-sonnet-20241022",
            &["openai:gpt-4o", "gemini:gemini-1.5-pro"],
        )
        .with_temperature(0.3),
    );
    mappings.insert(
        UseCase::CodeGeneration,
        UseCaseModelMapping::new(
            "anthropic:claude-3-5-sonnet-20241022",
            &["openai:gpt-4o", "gemini:gemini-1.5-pro"],
        )
        .with_temperature(0.2)
        .with_max_tokens(4096),
    );
    mappings.insert(
        UseCase::Summarization,
        UseCaseModelMapping::new(
            "openai:gpt-4o-mini",
            &["gemini:gemini-1.5-flash", "anthropic:claude-3-5-haiku-20241022"],
        )
        .with_temperature(0.3)
        .with_max_tokens(1024),
    );
    mappings.insert(
        UseCase::Extraction,
        UseCaseModelMapping::new(
            "openai:gpt-4o",
            &["anthropic:claude-3-5-sonnet-20241022", "gemini:gemini-1.5-pro"],
        )
        .with_temperature(0.0),
    );
    mappings.insert(
        UseCase::Vision,
        UseCaseModelMapping::new(
            "openai:gpt-4o",
            &["anthropic:claude-3-5-sonnet-20241022", "gemini:gemini-1.5-pro"],
        ),
    );
    mappings.insert(
        UseCase::FastResponse,
        UseCaseModelMapping::new(
            "gemini:gemini-1.5-flash",
            &["openai:gpt-4o-mini", "anthropic:claude-3-5-haiku-20241022"],
        )
        .with_max_tokens(512),
    );
    mappings.insert(
        UseCase::HighQuality,
        UseCaseModelMapping::new(
            "anthropic:claude-3-5-sonnet-20241022",
            &["openai:gpt-4o", "gemini:gemini-1.5-pro"],
        ),
    );
    mappings.insert(
        UseCase::CostEffective,
        UseCaseModelMapping::new(
            "gemini:gemini-1.5-flash",
            &["openai:gpt-4o-mini", "anthropic:claude-3-5-haiku-20241022"],
        ),
    );
    mappings
}
