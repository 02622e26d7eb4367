use std::fs;
use std::path::PathBuf;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub const DEFAULT_CONFIG_FILE: &str = "geo-harvester.json";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub accessions: Vec<String>,
    pub cache_dir: Option<String>,
    pub out_dir: String,
    pub workers: usize,
    pub timeout_secs: u64,
    pub retry: RetrySettings,
    pub rate_limits: RateLimitSettings,
    pub snippets: SnippetSettings,
    pub fetch_full_text: bool,
    pub publication_similarity_threshold: f64,
    pub accept_confidence: f64,
    pub llm: LlmSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accessions: Vec::new(),
            cache_dir: None,
            out_dir: "out".to_string(),
            workers: 3,
            timeout_secs: 60,
            retry: RetrySettings::default(),
            rate_limits: RateLimitSettings::default(),
            snippets: SnippetSettings::default(),
            fetch_full_text: true,
            publication_similarity_threshold: 0.6,
            accept_confidence: 0.7,
            llm: LlmSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub geo_interval_ms: u64,
    pub sra_interval_ms: u64,
    pub pubmed_interval_ms: u64,
    pub llm_interval_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            geo_interval_ms: 340,
            sra_interval_ms: 340,
            pubmed_interval_ms: 340,
            llm_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SnippetSettings {
    pub window_chars: usize,
    pub window_step: usize,
    pub max_snippets_per_field: usize,
}

impl Default for SnippetSettings {
    fn default() -> Self {
        Self {
            window_chars: 1200,
            window_step: 400,
            max_snippets_per_field: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ModelSettings {
    pub provider: LlmProvider,
    pub model: String,
    pub price_in_per_mtok: f64,
    pub price_out_per_mtok: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl ModelSettings {
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider.as_str(), self.model)
    }

    pub fn cost_usd(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        self.price_in_per_mtok * prompt_tokens as f64 / 1_000_000.0
            + self.price_out_per_mtok * completion_tokens as f64 / 1_000_000.0
    }
}

fn default_max_tokens() -> u32 {
    800
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmSettings {
    pub enabled: bool,
    pub primary: ModelSettings,
    pub fallback: ModelSettings,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            primary: ModelSettings {
                provider: LlmProvider::OpenAi,
                model: "gpt-4.1-mini".to_string(),
                price_in_per_mtok: 0.5,
                price_out_per_mtok: 0.5,
                max_tokens: default_max_tokens(),
            },
            fallback: ModelSettings {
                provider: LlmProvider::Anthropic,
                model: "claude-3-5-sonnet-latest".to_string(),
                price_in_per_mtok: 3.0,
                price_out_per_mtok: 15.0,
                max_tokens: default_max_tokens(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub accessions: Vec<String>,
    pub cache_dir: Utf8PathBuf,
    pub out_dir: Utf8PathBuf,
    pub workers: usize,
    pub timeout_secs: u64,
    pub retry: RetrySettings,
    pub rate_limits: RateLimitSettings,
    pub snippets: SnippetSettings,
    pub fetch_full_text: bool,
    pub publication_similarity_threshold: f64,
    pub accept_confidence: f64,
    pub llm: LlmSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<HarvestConfig, PipelineError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            tracing::debug!("no {DEFAULT_CONFIG_FILE} found, using defaults");
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| PipelineError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| PipelineError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<HarvestConfig, PipelineError> {
        if config.workers == 0 {
            return Err(PipelineError::ConfigInvalid(
                "workers must be at least 1".to_string(),
            ));
        }
        if config.retry.max_attempts == 0 {
            return Err(PipelineError::ConfigInvalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        check_unit_interval("accept_confidence", config.accept_confidence)?;
        check_unit_interval(
            "publication_similarity_threshold",
            config.publication_similarity_threshold,
        )?;
        if config.snippets.window_step == 0 {
            return Err(PipelineError::ConfigInvalid(
                "snippets.window_step must be positive".to_string(),
            ));
        }

        let cache_dir = match config.cache_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_cache_dir()?,
        };

        Ok(HarvestConfig {
            accessions: config.accessions,
            cache_dir,
            out_dir: Utf8PathBuf::from(config.out_dir),
            workers: config.workers,
            timeout_secs: config.timeout_secs,
            retry: config.retry,
            rate_limits: config.rate_limits,
            snippets: config.snippets,
            fetch_full_text: config.fetch_full_text,
            publication_similarity_threshold: config.publication_similarity_threshold,
            accept_confidence: config.accept_confidence,
            llm: config.llm,
        })
    }
}

fn check_unit_interval(name: &str, value: f64) -> Result<(), PipelineError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(PipelineError::ConfigInvalid(format!(
            "{name} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

pub fn default_cache_dir() -> Result<Utf8PathBuf, PipelineError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("geo-harvester")).ok()
        })
        .ok_or_else(|| PipelineError::Filesystem("unable to resolve cache directory".to_string()))
}

/// Accession ids from a plain list (one per line, `#` comments) or from a CSV
/// whose header names an `accession` column.
pub fn parse_ids(content: &str) -> Vec<String> {
    let mut lines = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .peekable();
    let column = lines.peek().and_then(|header| {
        header
            .split(',')
            .position(|cell| cell.trim().trim_matches('"').eq_ignore_ascii_case("accession"))
    });
    if column.is_some() {
        lines.next();
    }
    lines
        .filter_map(|line| match column {
            Some(idx) => line.split(',').nth(idx),
            None => Some(line),
        })
        .map(|cell| cell.trim().trim_matches('"').to_string())
        .filter(|cell| !cell.is_empty())
        .collect()
}

pub fn read_ids_file(path: &Utf8Path) -> Result<Vec<String>, PipelineError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("{path}: {err}")))?;
    Ok(parse_ids(&content))
}
