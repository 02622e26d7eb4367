use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "Spatial transcriptomics")]
    SpatialTranscriptomics,
    #[serde(rename = "Single cell RNA sequencing")]
    SingleCellRnaSeq,
    #[serde(rename = "Single nucleus RNA sequencing")]
    SingleNucleusRnaSeq,
    #[serde(rename = "Bulk RNA sequencing")]
    BulkRnaSeq,
    #[serde(rename = "Methylation sequencing")]
    MethylationSequencing,
    #[serde(rename = "Whole genome sequencing")]
    WholeGenomeSequencing,
    #[serde(rename = "Whole exome sequencing")]
    WholeExomeSequencing,
    #[serde(rename = "Expression microarray")]
    ExpressionMicroarray,
    #[serde(rename = "Methylation array")]
    MethylationArray,
    #[serde(rename = "Proteomics")]
    Proteomics,
    #[serde(rename = "Expression profiling by array")]
    ExpressionProfilingByArray,
    #[serde(rename = "High throughput sequencing")]
    HighThroughputSequencing,
    #[serde(rename = "Unclassified")]
    Unclassified,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::SpatialTranscriptomics => "Spatial transcriptomics",
            DataType::SingleCellRnaSeq => "Single cell RNA sequencing",
            DataType::SingleNucleusRnaSeq => "Single nucleus RNA sequencing",
            DataType::BulkRnaSeq => "Bulk RNA sequencing",
            DataType::MethylationSequencing => "Methylation sequencing",
            DataType::WholeGenomeSequencing => "Whole genome sequencing",
            DataType::WholeExomeSequencing => "Whole exome sequencing",
            DataType::ExpressionMicroarray => "Expression microarray",
            DataType::MethylationArray => "Methylation array",
            DataType::Proteomics => "Proteomics",
            DataType::ExpressionProfilingByArray => "Expression profiling by array",
            DataType::HighThroughputSequencing => "High throughput sequencing",
            DataType::Unclassified => "Unclassified",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Controlled vocabulary for per-sample library strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LibraryStrategy {
    #[serde(rename = "RNA-Seq")]
    RnaSeq,
    #[serde(rename = "miRNA-Seq")]
    MiRnaSeq,
    #[serde(rename = "ncRNA-Seq")]
    NcRnaSeq,
    #[serde(rename = "WGS")]
    Wgs,
    #[serde(rename = "WXS")]
    Wxs,
    #[serde(rename = "ChIP-Seq")]
    ChipSeq,
    #[serde(rename = "ATAC-seq")]
    AtacSeq,
    #[serde(rename = "Bisulfite-Seq")]
    BisulfiteSeq,
    #[serde(rename = "RRBS")]
    Rrbs,
    #[serde(rename = "MeDIP-Seq")]
    MeDipSeq,
    #[serde(rename = "Targeted-Capture")]
    TargetedCapture,
    #[serde(rename = "AMPLICON")]
    Amplicon,
    #[serde(rename = "OTHER")]
    Other,
    #[serde(rename = "unclassified")]
    Unclassified,
}

const STRATEGY_TAGS: &[(&str, LibraryStrategy)] = &[
    ("rna-seq", LibraryStrategy::RnaSeq),
    ("mirna-seq", LibraryStrategy::MiRnaSeq),
    ("ncrna-seq", LibraryStrategy::NcRnaSeq),
    ("wgs", LibraryStrategy::Wgs),
    ("wxs", LibraryStrategy::Wxs),
    ("chip-seq", LibraryStrategy::ChipSeq),
    ("atac-seq", LibraryStrategy::AtacSeq),
    ("bisulfite-seq", LibraryStrategy::BisulfiteSeq),
    ("rrbs", LibraryStrategy::Rrbs),
    ("medip-seq", LibraryStrategy::MeDipSeq),
    ("targeted-capture", LibraryStrategy::TargetedCapture),
    ("amplicon", LibraryStrategy::Amplicon),
    ("other", LibraryStrategy::Other),
];

const STRATEGY_SYNONYMS: &[(&str, LibraryStrategy)] = &[
    ("small rna", LibraryStrategy::MiRnaSeq),
    ("mirna", LibraryStrategy::MiRnaSeq),
    ("rna seq", LibraryStrategy::RnaSeq),
    ("rnaseq", LibraryStrategy::RnaSeq),
    ("rna-seq", LibraryStrategy::RnaSeq),
    ("transcriptom", LibraryStrategy::RnaSeq),
    ("whole genome bisulfite", LibraryStrategy::BisulfiteSeq),
    ("wgbs", LibraryStrategy::BisulfiteSeq),
    ("bisulfite", LibraryStrategy::BisulfiteSeq),
    ("reduced representation", LibraryStrategy::Rrbs),
    ("whole genome", LibraryStrategy::Wgs),
    ("exome", LibraryStrategy::Wxs),
    ("chip", LibraryStrategy::ChipSeq),
    ("atac", LibraryStrategy::AtacSeq),
    ("16s", LibraryStrategy::Amplicon),
];

impl LibraryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryStrategy::RnaSeq => "RNA-Seq",
            LibraryStrategy::MiRnaSeq => "miRNA-Seq",
            LibraryStrategy::NcRnaSeq => "ncRNA-Seq",
            LibraryStrategy::Wgs => "WGS",
            LibraryStrategy::Wxs => "WXS",
            LibraryStrategy::ChipSeq => "ChIP-Seq",
            LibraryStrategy::AtacSeq => "ATAC-seq",
            LibraryStrategy::BisulfiteSeq => "Bisulfite-Seq",
            LibraryStrategy::Rrbs => "RRBS",
            LibraryStrategy::MeDipSeq => "MeDIP-Seq",
            LibraryStrategy::TargetedCapture => "Targeted-Capture",
            LibraryStrategy::Amplicon => "AMPLICON",
            LibraryStrategy::Other => "OTHER",
            LibraryStrategy::Unclassified => "unclassified",
        }
    }

    /// Exact tag match first, then synonym containment, then `Unclassified`.
    pub fn map(raw: &str) -> Self {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return LibraryStrategy::Unclassified;
        }
        if let Some((_, strategy)) = STRATEGY_TAGS.iter().find(|(tag, _)| *tag == normalized) {
            return *strategy;
        }
        STRATEGY_SYNONYMS
            .iter()
            .find(|(synonym, _)| normalized.contains(synonym))
            .map(|(_, strategy)| *strategy)
            .unwrap_or(LibraryStrategy::Unclassified)
    }
}

impl fmt::Display for LibraryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TissueHint {
    Placenta,
    Decidua,
}

const TISSUE_SYNONYMS: &[(TissueHint, &[&str])] = &[
    (
        TissueHint::Placenta,
        &[
            "placenta",
            "placental",
            "chorionic villi",
            "chorion",
            "villous",
            "syncytiotrophoblast",
            "cytotrophoblast",
            "trophoblast",
            "basal plate",
            "amnion",
        ],
    ),
    (
        TissueHint::Decidua,
        &["decidua", "decidua basalis", "decidua parietalis"],
    ),
];

const NEGATIVE_TISSUE_HINTS: &[&str] = &["cord blood", "pbmc", "whole blood", "serum", "plasma"];

/// A negative hint anywhere in the text suppresses the match entirely.
pub fn tissue_hint(text: &str) -> Option<TissueHint> {
    let lowered = text.to_lowercase();
    if NEGATIVE_TISSUE_HINTS
        .iter()
        .any(|hint| lowered.contains(hint))
    {
        return None;
    }
    TISSUE_SYNONYMS
        .iter()
        .find(|(_, synonyms)| synonyms.iter().any(|syn| lowered.contains(syn)))
        .map(|(hint, _)| *hint)
}

const SPATIAL_HINTS: &[&str] = &[
    "spatial transcriptomics",
    "visium",
    "slide-seq",
    "merfish",
    "seqfish",
];
const SINGLE_CELL_HINTS: &[&str] = &[
    "single cell",
    "single-cell",
    "scrna",
    "10x genomics",
    "chromium",
    "drop-seq",
    "smart-seq",
];
const SINGLE_NUCLEUS_HINTS: &[&str] = &["single nucleus", "single-nucleus", "snrna"];
const METHYLATION_SEQ_HINTS: &[&str] = &[
    "rrbs",
    "reduced representation bisulfite",
    "wgbs",
    "bisulfite sequencing",
];
const PROTEOMICS_HINTS: &[&str] = &["proteomics", "mass spectrometry", "lc-ms", "ms/ms"];
const ARRAY_PLATFORMS: &[&str] = &["affymetrix", "humanht", "agilent", "genechip", "beadchip"];
const METHYLATION_PLATFORMS: &[&str] = &["450k", "methylationepic", "methylation epic", "27k"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    Exact,
    Synonym,
}

#[derive(Debug, Clone, Copy)]
enum Matcher {
    SeriesType(&'static str),
    Strategy(&'static [LibraryStrategy]),
    StrategyWithHint(LibraryStrategy, &'static [&'static str]),
    Hint(&'static [&'static str]),
    Platform(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
struct DataTypeRule {
    tier: MatchTier,
    matcher: Matcher,
    data_type: DataType,
}

const fn exact(matcher: Matcher, data_type: DataType) -> DataTypeRule {
    DataTypeRule {
        tier: MatchTier::Exact,
        matcher,
        data_type,
    }
}

const fn synonym(matcher: Matcher, data_type: DataType) -> DataTypeRule {
    DataTypeRule {
        tier: MatchTier::Synonym,
        matcher,
        data_type,
    }
}

/// Exact rules precede synonym rules; order within a tier is priority.
const DATA_TYPE_RULES: &[DataTypeRule] = &[
    exact(
        Matcher::StrategyWithHint(LibraryStrategy::RnaSeq, SPATIAL_HINTS),
        DataType::SpatialTranscriptomics,
    ),
    exact(
        Matcher::StrategyWithHint(LibraryStrategy::RnaSeq, SINGLE_NUCLEUS_HINTS),
        DataType::SingleNucleusRnaSeq,
    ),
    exact(
        Matcher::StrategyWithHint(LibraryStrategy::RnaSeq, SINGLE_CELL_HINTS),
        DataType::SingleCellRnaSeq,
    ),
    exact(
        Matcher::Strategy(&[
            LibraryStrategy::RnaSeq,
            LibraryStrategy::MiRnaSeq,
            LibraryStrategy::NcRnaSeq,
        ]),
        DataType::BulkRnaSeq,
    ),
    exact(
        Matcher::Strategy(&[LibraryStrategy::Wgs]),
        DataType::WholeGenomeSequencing,
    ),
    exact(
        Matcher::Strategy(&[LibraryStrategy::Wxs]),
        DataType::WholeExomeSequencing,
    ),
    exact(
        Matcher::Strategy(&[
            LibraryStrategy::BisulfiteSeq,
            LibraryStrategy::Rrbs,
            LibraryStrategy::MeDipSeq,
        ]),
        DataType::MethylationSequencing,
    ),
    exact(
        Matcher::SeriesType("methylation profiling by high throughput sequencing"),
        DataType::MethylationSequencing,
    ),
    exact(
        Matcher::SeriesType("methylation profiling by array"),
        DataType::MethylationArray,
    ),
    exact(
        Matcher::SeriesType("expression profiling by array"),
        DataType::ExpressionProfilingByArray,
    ),
    exact(
        Matcher::SeriesType("proteomic profiling by mass spectrometry"),
        DataType::Proteomics,
    ),
    exact(
        Matcher::SeriesType("expression profiling by high throughput sequencing"),
        DataType::HighThroughputSequencing,
    ),
    synonym(Matcher::Hint(SPATIAL_HINTS), DataType::SpatialTranscriptomics),
    synonym(
        Matcher::Hint(SINGLE_NUCLEUS_HINTS),
        DataType::SingleNucleusRnaSeq,
    ),
    synonym(Matcher::Hint(SINGLE_CELL_HINTS), DataType::SingleCellRnaSeq),
    synonym(
        Matcher::Hint(METHYLATION_SEQ_HINTS),
        DataType::MethylationSequencing,
    ),
    synonym(Matcher::Hint(PROTEOMICS_HINTS), DataType::Proteomics),
    synonym(
        Matcher::Platform(METHYLATION_PLATFORMS),
        DataType::MethylationArray,
    ),
    synonym(
        Matcher::Platform(ARRAY_PLATFORMS),
        DataType::ExpressionMicroarray,
    ),
];

#[derive(Debug, Clone, Default)]
pub struct ClassificationInput {
    pub series_types: Vec<String>,
    pub strategies: Vec<LibraryStrategy>,
    pub platforms: Vec<String>,
    pub hints: String,
}

impl ClassificationInput {
    fn normalized(&self) -> (Vec<String>, Vec<String>, String) {
        (
            self.series_types
                .iter()
                .map(|value| value.trim().to_lowercase())
                .collect(),
            self.platforms
                .iter()
                .map(|value| value.trim().to_lowercase())
                .collect(),
            self.hints.to_lowercase(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTypeDecision {
    pub primary: DataType,
    pub tier: Option<MatchTier>,
    pub additional: Vec<DataType>,
}

pub fn classify_data_type(input: &ClassificationInput) -> DataTypeDecision {
    let (series_types, platforms, hints) = input.normalized();
    let has_hint = |keywords: &[&str]| keywords.iter().any(|kw| hints.contains(kw));

    let mut matched: Vec<(MatchTier, DataType)> = Vec::new();
    for rule in DATA_TYPE_RULES {
        let hit = match rule.matcher {
            Matcher::SeriesType(value) => series_types.iter().any(|ty| ty == value),
            Matcher::Strategy(strategies) => input
                .strategies
                .iter()
                .any(|strategy| strategies.contains(strategy)),
            Matcher::StrategyWithHint(strategy, keywords) => {
                input.strategies.contains(&strategy) && has_hint(keywords)
            }
            Matcher::Hint(keywords) => has_hint(keywords),
            Matcher::Platform(keywords) => platforms
                .iter()
                .any(|platform| keywords.iter().any(|kw| platform.contains(kw))),
        };
        if hit && !matched.iter().any(|(_, ty)| *ty == rule.data_type) {
            matched.push((rule.tier, rule.data_type));
        }
    }

    match matched.split_first() {
        Some(((tier, primary), rest)) => DataTypeDecision {
            primary: *primary,
            tier: Some(*tier),
            additional: rest.iter().map(|(_, ty)| *ty).collect(),
        },
        None => DataTypeDecision {
            primary: DataType::Unclassified,
            tier: None,
            additional: Vec::new(),
        },
    }
}
