use std::collections::{BTreeMap, BTreeSet};

use crate::domain::CrossRefKind;
use crate::geo::ResolvedSeries;
use crate::problems::ProblemEntry;
use crate::pubmed::PublicationLink;
use crate::record::{ClinicalField, DatasetRecord, ExtractedField};
use crate::sra::SraResolution;

/// Keeps the winning candidate per field. Lower `FieldSource` wins; among equal
/// sources the first offered value stays.
#[derive(Debug, Clone, Default)]
pub struct FieldAggregator {
    fields: BTreeMap<ClinicalField, ExtractedField>,
}

impl FieldAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, candidate: ExtractedField) {
        match self.fields.get(&candidate.field) {
            Some(current) if current.source <= candidate.source => {
                tracing::trace!(
                    "{}: keeping {:?} value over {:?}",
                    candidate.field,
                    current.source,
                    candidate.source
                );
            }
            _ => {
                self.fields.insert(candidate.field, candidate);
            }
        }
    }

    pub fn offer_all(&mut self, candidates: impl IntoIterator<Item = ExtractedField>) {
        for candidate in candidates {
            self.offer(candidate);
        }
    }

    pub fn get(&self, field: ClinicalField) -> Option<&ExtractedField> {
        self.fields.get(&field)
    }

    pub fn finish(
        self,
        series: ResolvedSeries,
        sra: SraResolution,
        publication: PublicationLink,
        problems: Vec<ProblemEntry>,
    ) -> DatasetRecord {
        let mut clinical = BTreeMap::new();
        let mut confidence = BTreeMap::new();
        let mut sources = BTreeMap::new();
        let mut evidence = BTreeMap::new();
        for field in ClinicalField::ALL {
            match self.fields.get(&field) {
                Some(found) => {
                    clinical.insert(field, Some(found.value.clone()));
                    confidence.insert(field, found.confidence);
                    sources.insert(field, found.source);
                    evidence.insert(field, found.evidence.clone());
                }
                None => {
                    clinical.insert(field, None);
                }
            }
        }

        let ids_of = |kind: CrossRefKind| {
            let ids = series
                .refs_of(kind)
                .into_iter()
                .map(|reference| reference.id.clone())
                .collect::<BTreeSet<_>>();
            (!ids.is_empty()).then_some(ids)
        };
        let bioproject_ids = ids_of(CrossRefKind::BioProject);
        let biosample_ids = ids_of(CrossRefKind::BioSample);
        let organism = (!series.organisms.is_empty()).then(|| series.organisms.join("; "));

        DatasetRecord {
            accession: series.accession.as_str().to_string(),
            title: series.title,
            summary: series.summary,
            overall_design: series.overall_design,
            organism,
            submission_date: series.submission_date,
            last_update_date: series.last_update_date,
            contacts: series.contacts,
            data_type: series.data_type.primary,
            additional_data_types: series.data_type.additional,
            samples: series.samples,
            sra_study_ids: sra.study_ids,
            bioproject_ids,
            biosample_ids,
            publication: publication.publication,
            supplementary_files: series.supplementary_files,
            is_superseries: series.is_superseries,
            subseries: series.subseries,
            clinical,
            confidence,
            sources,
            evidence,
            problems,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Confidence, FieldSource};

    fn candidate(value: &str, source: FieldSource) -> ExtractedField {
        ExtractedField {
            field: ClinicalField::PregnancyTrimester,
            value: value.to_string(),
            confidence: Confidence::HIGH,
            evidence: Vec::new(),
            source,
        }
    }

    #[test]
    fn earlier_source_wins_regardless_of_order() {
        let mut aggregator = FieldAggregator::new();
        aggregator.offer(candidate("2nd", FieldSource::LlmPrimary));
        aggregator.offer(candidate("1st", FieldSource::Regex));
        aggregator.offer(candidate("3rd", FieldSource::LlmFallback));
        let kept = aggregator.get(ClinicalField::PregnancyTrimester).unwrap();
        assert_eq!(kept.value, "1st");
        assert_eq!(kept.source, FieldSource::Regex);
    }

    #[test]
    fn ties_keep_first_value() {
        let mut aggregator = FieldAggregator::new();
        aggregator.offer(candidate("1st", FieldSource::Regex));
        aggregator.offer(candidate("term", FieldSource::Regex));
        assert_eq!(
            aggregator.get(ClinicalField::PregnancyTrimester).unwrap().value,
            "1st"
        );
    }
}
