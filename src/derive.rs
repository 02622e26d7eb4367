use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::classify::TissueHint;
use crate::geo::ResolvedSeries;
use crate::record::{
    Characteristic, ClinicalField, Confidence, ExtractedField, FieldSource, SourceSection,
};
use crate::snippets::{
    FETAL_COMPLICATIONS, PREGNANCY_COMPLICATIONS, SAMPLING_SITES, SnippetBook,
};

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").unwrap());

const MISSING_VALUES: &[&str] = &[
    "", "na", "n/a", "nan", "none", "unknown", "not available", "missing", "-",
];

/// Characteristic tag keywords that mark a presence flag as reported.
const TAG_FLAGS: &[(ClinicalField, &[&str])] = &[
    (ClinicalField::BirthweightProvided, &["birthweight", "birth weight"]),
    (
        ClinicalField::SexOfOffspringProvided,
        &["fetal sex", "sex of fetus", "infant sex", "neonatal sex", "sex", "gender"],
    ),
    (ClinicalField::ParityProvided, &["parity"]),
    (ClinicalField::GravidityProvided, &["gravidity", "gravida"]),
    (
        ClinicalField::NumOffspringPerPregnancyProvided,
        &["singleton", "twin", "plurality", "number of fetuses", "number of offspring"],
    ),
    (ClinicalField::RaceEthnicityProvided, &["race", "ethnicity"]),
    (ClinicalField::GeneticAncestryOrStrainProvided, &["ancestry", "strain"]),
    (ClinicalField::MaternalHeightProvided, &["maternal height"]),
    (
        ClinicalField::MaternalPrepregWeightProvided,
        &["pre-pregnancy weight", "prepregnancy weight", "maternal weight"],
    ),
    (ClinicalField::PaternalHeightProvided, &["paternal height"]),
    (ClinicalField::PaternalWeightProvided, &["paternal weight"]),
    (ClinicalField::MaternalAgeAtCollectionProvided, &["maternal age"]),
    (ClinicalField::PaternalAgeAtCollectionProvided, &["paternal age"]),
    (
        ClinicalField::ModeOfDeliveryProvided,
        &["mode of delivery", "delivery mode", "delivery method", "cesarean", "c-section"],
    ),
];

const SITE_TAGS: &[&str] = &[
    "tissue",
    "sampling site",
    "region",
    "location",
    "cell type",
    "sample type",
];

fn is_missing(value: &str) -> bool {
    MISSING_VALUES.contains(&value.trim().to_lowercase().as_str())
}

fn is_gestational_tag(tag: &str) -> bool {
    tag.contains("gestational") || tag == "ga" || tag.starts_with("ga ")
}

fn is_delivery_tag(tag: &str) -> bool {
    tag.contains("delivery") || tag.contains("birth")
}

pub fn trimester_for_weeks(weeks: f64) -> &'static str {
    if weeks <= 13.0 {
        "1st"
    } else if weeks <= 27.0 {
        "2nd"
    } else {
        "3rd"
    }
}

fn trimester_from_value(value: &str) -> Option<&'static str> {
    let lowered = value.to_lowercase();
    if lowered.contains("first") || lowered.contains("1st") {
        Some("1st")
    } else if lowered.contains("second") || lowered.contains("2nd") {
        Some("2nd")
    } else if lowered.contains("third") || lowered.contains("3rd") {
        Some("3rd")
    } else if lowered.contains("preterm") || lowered.contains("premature") {
        Some("premature")
    } else if lowered.contains("term") {
        Some("term")
    } else {
        None
    }
}

fn gestational_weeks(characteristic: &Characteristic) -> Vec<f64> {
    let text = format!("{} {}", characteristic.tag, characteristic.value).to_lowercase();
    let in_days = text.contains("day") || text.contains("dga") || text.contains("d gest");
    NUMBER_RE
        .find_iter(&text)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .map(|number| if in_days { number / 7.0 } else { number })
        .collect()
}

struct NativeHits<'a> {
    book: &'a mut SnippetBook,
    fields: BTreeMap<ClinicalField, ExtractedField>,
}

impl NativeHits<'_> {
    fn evidence(&mut self, sample: &str, characteristic: &Characteristic) -> String {
        self.book.record(
            SourceSection::SampleCharacteristics,
            sample,
            &format!("characteristic:{}", characteristic.tag),
            &format!("{}: {}", characteristic.tag, characteristic.value),
        )
    }

    fn add(&mut self, field: ClinicalField, value: &str, evidence: Vec<String>) {
        self.fields.entry(field).or_insert_with(|| ExtractedField {
            field,
            value: value.to_string(),
            confidence: Confidence::HIGH,
            evidence,
            source: FieldSource::GeoNative,
        });
    }
}

/// Clinical fields read straight from structured sample characteristics.
pub fn derive_native_fields(
    series: &ResolvedSeries,
    book: &mut SnippetBook,
) -> Vec<ExtractedField> {
    let mut hits = NativeHits {
        book,
        fields: BTreeMap::new(),
    };
    let mut weeks = Vec::new();
    let mut weeks_evidence = Vec::new();
    let mut pregnancy = BTreeMap::<&'static str, String>::new();
    let mut fetal = BTreeMap::<&'static str, String>::new();

    for sample in &series.samples {
        let placental = matches!(
            sample.tissue_hint,
            Some(TissueHint::Placenta | TissueHint::Decidua)
        );
        for characteristic in &sample.characteristics {
            if is_missing(&characteristic.value) {
                continue;
            }
            let tag = characteristic.tag.trim().to_lowercase();

            for (field, keywords) in TAG_FLAGS {
                if hits.fields.contains_key(field) {
                    continue;
                }
                if keywords.iter().any(|keyword| tag.contains(keyword)) {
                    let id = hits.evidence(&sample.accession, characteristic);
                    hits.add(*field, "yes", vec![id]);
                }
            }

            if is_gestational_tag(&tag) {
                let flag = if is_delivery_tag(&tag) {
                    ClinicalField::GaAtDeliveryProvided
                } else {
                    ClinicalField::GaAtCollectionProvided
                };
                if !hits.fields.contains_key(&flag) {
                    let id = hits.evidence(&sample.accession, characteristic);
                    hits.add(flag, "yes", vec![id]);
                }
                if !is_delivery_tag(&tag) {
                    let found = gestational_weeks(characteristic);
                    if !found.is_empty() && weeks_evidence.is_empty() {
                        weeks_evidence.push(hits.evidence(&sample.accession, characteristic));
                    }
                    weeks.extend(found);
                }
            }

            if tag.contains("trimester")
                && !hits.fields.contains_key(&ClinicalField::PregnancyTrimester)
            {
                if let Some(trimester) = trimester_from_value(&characteristic.value) {
                    let id = hits.evidence(&sample.accession, characteristic);
                    hits.add(ClinicalField::PregnancyTrimester, trimester, vec![id]);
                }
            }

            for (name, pattern) in PREGNANCY_COMPLICATIONS.iter() {
                if !pregnancy.contains_key(name) && pattern.is_match(&characteristic.value) {
                    let id = hits.evidence(&sample.accession, characteristic);
                    pregnancy.insert(*name, id);
                }
            }
            for (name, pattern) in FETAL_COMPLICATIONS.iter() {
                if !fetal.contains_key(name) && pattern.is_match(&characteristic.value) {
                    let id = hits.evidence(&sample.accession, characteristic);
                    fetal.insert(*name, id);
                }
            }

            if placental
                && SITE_TAGS.contains(&tag.as_str())
                && !hits.fields.contains_key(&ClinicalField::SamplingSite)
            {
                if let Some(site) = SAMPLING_SITES
                    .iter()
                    .find(|(_, pattern)| pattern.is_match(&characteristic.value))
                    .map(|(site, _)| *site)
                {
                    let id = hits.evidence(&sample.accession, characteristic);
                    hits.add(ClinicalField::SamplingSite, site, vec![id]);
                }
            }
        }
    }

    if !weeks.is_empty() && !hits.fields.contains_key(&ClinicalField::PregnancyTrimester) {
        let average = weeks.iter().sum::<f64>() / weeks.len() as f64;
        hits.add(
            ClinicalField::PregnancyTrimester,
            trimester_for_weeks(average),
            weeks_evidence,
        );
    }

    if !pregnancy.is_empty() {
        let value = pregnancy.keys().copied().collect::<Vec<_>>().join(", ");
        let evidence = pregnancy.into_values().collect::<Vec<_>>();
        hits.add(ClinicalField::PregnancyComplicationsList, &value, evidence.clone());
        hits.add(
            ClinicalField::SamplesFromPregnancyComplicationsCollected,
            "yes",
            evidence,
        );
    }
    if !fetal.is_empty() {
        let value = fetal.keys().copied().collect::<Vec<_>>().join(", ");
        let evidence = fetal.into_values().collect::<Vec<_>>();
        hits.add(ClinicalField::FetalComplications, &value, evidence.clone());
        hits.add(ClinicalField::FetalComplicationsListed, "yes", evidence);
    }

    hits.fields.into_values().collect()
}
