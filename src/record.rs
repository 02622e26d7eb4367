use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::classify::{DataType, LibraryStrategy, TissueHint};
use crate::problems::ProblemEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClinicalField {
    PregnancyTrimester,
    BirthweightProvided,
    GaAtDeliveryProvided,
    GaAtDeliveryWeeks,
    GaAtCollectionProvided,
    GaAtCollectionWeeks,
    SexOfOffspringProvided,
    ParityProvided,
    GravidityProvided,
    NumOffspringPerPregnancyProvided,
    RaceEthnicityProvided,
    GeneticAncestryOrStrainProvided,
    MaternalHeightProvided,
    MaternalPrepregWeightProvided,
    PaternalHeightProvided,
    PaternalWeightProvided,
    MaternalAgeAtCollectionProvided,
    PaternalAgeAtCollectionProvided,
    SamplesFromPregnancyComplicationsCollected,
    ModeOfDeliveryProvided,
    PregnancyComplicationsList,
    FetalComplications,
    FetalComplicationsListed,
    HospitalCenter,
    CountryOfCollection,
    SamplingSite,
}

impl ClinicalField {
    pub const ALL: [ClinicalField; 26] = [
        ClinicalField::PregnancyTrimester,
        ClinicalField::BirthweightProvided,
        ClinicalField::GaAtDeliveryProvided,
        ClinicalField::GaAtDeliveryWeeks,
        ClinicalField::GaAtCollectionProvided,
        ClinicalField::GaAtCollectionWeeks,
        ClinicalField::SexOfOffspringProvided,
        ClinicalField::ParityProvided,
        ClinicalField::GravidityProvided,
        ClinicalField::NumOffspringPerPregnancyProvided,
        ClinicalField::RaceEthnicityProvided,
        ClinicalField::GeneticAncestryOrStrainProvided,
        ClinicalField::MaternalHeightProvided,
        ClinicalField::MaternalPrepregWeightProvided,
        ClinicalField::PaternalHeightProvided,
        ClinicalField::PaternalWeightProvided,
        ClinicalField::MaternalAgeAtCollectionProvided,
        ClinicalField::PaternalAgeAtCollectionProvided,
        ClinicalField::SamplesFromPregnancyComplicationsCollected,
        ClinicalField::ModeOfDeliveryProvided,
        ClinicalField::PregnancyComplicationsList,
        ClinicalField::FetalComplications,
        ClinicalField::FetalComplicationsListed,
        ClinicalField::HospitalCenter,
        ClinicalField::CountryOfCollection,
        ClinicalField::SamplingSite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClinicalField::PregnancyTrimester => "pregnancy_trimester",
            ClinicalField::BirthweightProvided => "birthweight_provided",
            ClinicalField::GaAtDeliveryProvided => "ga_at_delivery_provided",
            ClinicalField::GaAtDeliveryWeeks => "ga_at_delivery_weeks",
            ClinicalField::GaAtCollectionProvided => "ga_at_collection_provided",
            ClinicalField::GaAtCollectionWeeks => "ga_at_collection_weeks",
            ClinicalField::SexOfOffspringProvided => "sex_of_offspring_provided",
            ClinicalField::ParityProvided => "parity_provided",
            ClinicalField::GravidityProvided => "gravidity_provided",
            ClinicalField::NumOffspringPerPregnancyProvided => {
                "num_offspring_per_pregnancy_provided"
            }
            ClinicalField::RaceEthnicityProvided => "race_ethnicity_provided",
            ClinicalField::GeneticAncestryOrStrainProvided => "genetic_ancestry_or_strain_provided",
            ClinicalField::MaternalHeightProvided => "maternal_height_provided",
            ClinicalField::MaternalPrepregWeightProvided => "maternal_prepreg_weight_provided",
            ClinicalField::PaternalHeightProvided => "paternal_height_provided",
            ClinicalField::PaternalWeightProvided => "paternal_weight_provided",
            ClinicalField::MaternalAgeAtCollectionProvided => "maternal_age_at_collection_provided",
            ClinicalField::PaternalAgeAtCollectionProvided => "paternal_age_at_collection_provided",
            ClinicalField::SamplesFromPregnancyComplicationsCollected => {
                "samples_from_pregnancy_complications_collected"
            }
            ClinicalField::ModeOfDeliveryProvided => "mode_of_delivery_provided",
            ClinicalField::PregnancyComplicationsList => "pregnancy_complications_list",
            ClinicalField::FetalComplications => "fetal_complications",
            ClinicalField::FetalComplicationsListed => "fetal_complications_listed",
            ClinicalField::HospitalCenter => "hospital_center",
            ClinicalField::CountryOfCollection => "country_of_collection",
            ClinicalField::SamplingSite => "sampling_site",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|field| field.as_str() == name.trim())
    }

    pub fn is_yes_no(&self) -> bool {
        matches!(
            self,
            ClinicalField::BirthweightProvided
                | ClinicalField::GaAtDeliveryProvided
                | ClinicalField::GaAtCollectionProvided
                | ClinicalField::SexOfOffspringProvided
                | ClinicalField::ParityProvided
                | ClinicalField::GravidityProvided
                | ClinicalField::NumOffspringPerPregnancyProvided
                | ClinicalField::RaceEthnicityProvided
                | ClinicalField::GeneticAncestryOrStrainProvided
                | ClinicalField::MaternalHeightProvided
                | ClinicalField::MaternalPrepregWeightProvided
                | ClinicalField::PaternalHeightProvided
                | ClinicalField::PaternalWeightProvided
                | ClinicalField::MaternalAgeAtCollectionProvided
                | ClinicalField::PaternalAgeAtCollectionProvided
                | ClinicalField::SamplesFromPregnancyComplicationsCollected
                | ClinicalField::ModeOfDeliveryProvided
                | ClinicalField::FetalComplicationsListed
        )
    }

    /// Fields the model tiers are allowed to fill. Complication detail lists
    /// and sampling site come from rules only.
    pub fn llm_eligible(&self) -> bool {
        !matches!(
            self,
            ClinicalField::FetalComplications | ClinicalField::SamplingSite
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            ClinicalField::PregnancyTrimester => {
                "trimester of sample collection: 1st, 2nd, 3rd, term or premature"
            }
            ClinicalField::GaAtDeliveryWeeks => "gestational age at delivery in weeks",
            ClinicalField::GaAtCollectionWeeks => "gestational age at collection in weeks",
            ClinicalField::PregnancyComplicationsList => {
                "comma-separated pregnancy complications studied"
            }
            ClinicalField::FetalComplications => "comma-separated fetal complications",
            ClinicalField::HospitalCenter => "hospital or centre where samples were collected",
            ClinicalField::CountryOfCollection => "country where samples were collected",
            ClinicalField::SamplingSite => "placental sampling site",
            _ => "yes or no: whether the study reports this variable",
        }
    }
}

impl fmt::Display for ClinicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Confidence(f64);

impl Confidence {
    pub const HIGH: Confidence = Confidence(1.0);
    pub const MEDIUM: Confidence = Confidence(0.6);

    pub fn new(score: f64) -> Self {
        if score.is_nan() {
            return Confidence(0.0);
        }
        Confidence(score.clamp(0.0, 1.0))
    }

    pub fn score(&self) -> f64 {
        self.0
    }

    pub fn level(&self) -> ConfidenceLevel {
        if self.0 >= 0.8 {
            ConfidenceLevel::High
        } else if self.0 >= 0.5 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

/// Declaration order is merge precedence: earlier variants win. SRA and
/// PubMed outputs are single-origin dataset fields and never compete here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldSource {
    #[serde(rename = "geo_native")]
    GeoNative,
    #[serde(rename = "regex")]
    Regex,
    #[serde(rename = "llm_primary")]
    LlmPrimary,
    #[serde(rename = "llm_fallback")]
    LlmFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub field: ClinicalField,
    pub value: String,
    pub confidence: Confidence,
    pub evidence: Vec<String>,
    pub source: FieldSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSection {
    SeriesTitle,
    SeriesSummary,
    OverallDesign,
    SampleCharacteristics,
    SampleDescription,
    Document,
    ModelEvidence,
}

impl SourceSection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceSection::SeriesTitle => "series_title",
            SourceSection::SeriesSummary => "series_summary",
            SourceSection::OverallDesign => "overall_design",
            SourceSection::SampleCharacteristics => "sample_characteristics",
            SourceSection::SampleDescription => "sample_description",
            SourceSection::Document => "document",
            SourceSection::ModelEvidence => "model_evidence",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snippet {
    pub id: String,
    pub accession: String,
    pub section: SourceSection,
    pub label: String,
    pub locator: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub email: Option<String>,
    pub institute: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub tag: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEntity {
    pub accession: String,
    pub title: Option<String>,
    pub organism: Option<String>,
    pub source_name: Option<String>,
    pub characteristics: Vec<Characteristic>,
    pub description: Option<String>,
    pub protocols: Vec<String>,
    pub library_description: Option<String>,
    pub library_strategy_raw: Option<String>,
    pub library_strategy: LibraryStrategy,
    pub tissue_hint: Option<TissueHint>,
    pub instrument: Option<String>,
    pub platform_id: Option<String>,
    pub molecule: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationMatch {
    Direct,
    Search,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub affiliations: Vec<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub pmid: String,
    pub title: Option<String>,
    pub journal: Option<String>,
    pub year: Option<String>,
    pub doi: Option<String>,
    pub pmcid: Option<String>,
    pub citation: Option<String>,
    pub authors: Vec<Author>,
    pub corresponding_author: Option<String>,
    pub corresponding_email: Option<String>,
    pub match_kind: PublicationMatch,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub accession: String,
    pub title: String,
    pub summary: Option<String>,
    pub overall_design: Option<String>,
    pub organism: Option<String>,
    pub submission_date: Option<String>,
    pub last_update_date: Option<String>,
    pub contacts: Vec<Contact>,
    pub data_type: DataType,
    pub additional_data_types: Vec<DataType>,
    pub samples: Vec<SampleEntity>,
    pub sra_study_ids: Option<BTreeSet<String>>,
    pub bioproject_ids: Option<BTreeSet<String>>,
    pub biosample_ids: Option<BTreeSet<String>>,
    pub publication: Option<Publication>,
    pub supplementary_files: Vec<String>,
    pub is_superseries: bool,
    pub subseries: Vec<String>,
    pub clinical: BTreeMap<ClinicalField, Option<String>>,
    pub confidence: BTreeMap<ClinicalField, Confidence>,
    pub sources: BTreeMap<ClinicalField, FieldSource>,
    pub evidence: BTreeMap<ClinicalField, Vec<String>>,
    pub problems: Vec<ProblemEntry>,
}

impl DatasetRecord {
    pub fn clinical_value(&self, field: ClinicalField) -> Option<&str> {
        self.clinical.get(&field).and_then(|value| value.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_round_trip() {
        for field in ClinicalField::ALL {
            assert_eq!(ClinicalField::from_name(field.as_str()), Some(field));
            let json = serde_json::to_string(&field).unwrap();
            assert_eq!(json, format!("\"{}\"", field.as_str()));
        }
    }

    #[test]
    fn confidence_levels() {
        assert_eq!(Confidence::new(0.95).level(), ConfidenceLevel::High);
        assert_eq!(Confidence::MEDIUM.level(), ConfidenceLevel::Medium);
        assert_eq!(Confidence::new(-2.0).score(), 0.0);
        assert_eq!(Confidence::new(0.2).level(), ConfidenceLevel::Low);
    }

    #[test]
    fn source_precedence_follows_declaration() {
        assert!(FieldSource::GeoNative < FieldSource::Regex);
        assert!(FieldSource::Regex < FieldSource::LlmPrimary);
        assert!(FieldSource::LlmPrimary < FieldSource::LlmFallback);
    }
}
