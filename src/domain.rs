use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeoSeriesAccession(String);

impl GeoSeriesAccession {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GeoSeriesAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GeoSeriesAccession {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let digits = normalized
            .strip_prefix("GSE")
            .ok_or_else(|| PipelineError::InvalidAccession(value.to_string()))?;
        if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(PipelineError::InvalidAccession(value.to_string()));
        }
        let stripped = digits.trim_start_matches('0');
        if stripped.is_empty() {
            return Err(PipelineError::InvalidAccession(value.to_string()));
        }
        Ok(Self(format!("GSE{stripped}")))
    }
}

/// Entity kinds addressed by the cache. The string form is the on-disk
/// directory name, so renaming a variant invalidates existing entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    GeoSeries,
    SraExperiment,
    PubMedArticle,
    PubMedSearch,
    PubMedSummary,
    PmcDocument,
    LlmCompletion,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::GeoSeries => "geo_series",
            EntityKind::SraExperiment => "sra_experiment",
            EntityKind::PubMedArticle => "pubmed_article",
            EntityKind::PubMedSearch => "pubmed_search",
            EntityKind::PubMedSummary => "pubmed_summary",
            EntityKind::PmcDocument => "pmc_document",
            EntityKind::LlmCompletion => "llm_completion",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossRefKind {
    SraExperiment,
    SraRun,
    SraStudy,
    PubMed,
    BioProject,
    BioSample,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CrossReference {
    pub kind: CrossRefKind,
    pub id: String,
}

impl CrossReference {
    pub fn new(kind: CrossRefKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Classifies a bare identifier by its archive prefix.
    pub fn classify(id: &str) -> Option<Self> {
        let id = id.trim();
        let prefix = id.get(..3)?;
        let rest = &id[3..];
        let kind = match prefix {
            "SRX" | "ERX" | "DRX" => CrossRefKind::SraExperiment,
            "SRR" | "ERR" | "DRR" => CrossRefKind::SraRun,
            "SRP" | "ERP" | "DRP" => CrossRefKind::SraStudy,
            "PRJ" => CrossRefKind::BioProject,
            "SAM" => CrossRefKind::BioSample,
            _ => return None,
        };
        let numeric = rest.trim_start_matches(|ch: char| ch.is_ascii_uppercase());
        if numeric.is_empty() || !numeric.chars().all(|ch| ch.is_ascii_digit()) {
            return None;
        }
        if matches!(
            kind,
            CrossRefKind::SraExperiment | CrossRefKind::SraRun | CrossRefKind::SraStudy
        ) && numeric.len() != rest.len()
        {
            return None;
        }
        Some(Self::new(kind, id))
    }

    pub fn is_sra_lookup(&self) -> bool {
        matches!(
            self.kind,
            CrossRefKind::SraExperiment | CrossRefKind::SraRun
        )
    }
}
