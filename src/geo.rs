use std::io::Read;
use std::sync::Arc;
use std::sync::LazyLock;

use flate2::read::GzDecoder;
use regex::Regex;

use crate::cache::{CacheKey, CacheStore};
use crate::classify::{
    ClassificationInput, DataTypeDecision, LibraryStrategy, classify_data_type, tissue_hint,
};
use crate::domain::{CrossRefKind, CrossReference, EntityKind, GeoSeriesAccession};
use crate::error::PipelineError;
use crate::http::{HttpFetcher, RetryPolicy};
use crate::record::{Characteristic, Contact, SampleEntity};
use crate::text::{clean_text, unique_preserve_order};

static XREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b((?:SRX|SRR|SRP|ERX|ERR|ERP|DRX|DRR|DRP)\d+|PRJ[A-Z]{1,4}\d+|SAM[A-Z]{1,2}\d+)\b")
        .unwrap()
});
static PMID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"PMID:\s*(\d+)").unwrap());
static GSE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bGSE\d+\b").unwrap());

pub trait GeoClient: Send + Sync {
    fn fetch_soft_text(&self, accession: &GeoSeriesAccession) -> Result<String, PipelineError>;
}

impl<T: GeoClient + ?Sized> GeoClient for Arc<T> {
    fn fetch_soft_text(&self, accession: &GeoSeriesAccession) -> Result<String, PipelineError> {
        (**self).fetch_soft_text(accession)
    }
}

#[derive(Clone)]
pub struct GeoHttpClient {
    fetcher: HttpFetcher,
}

impl GeoHttpClient {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }

    fn soft_url(accession: &GeoSeriesAccession) -> String {
        let prefix = geo_series_prefix(accession);
        format!(
            "https://ftp.ncbi.nlm.nih.gov/geo/series/{prefix}/{acc}/soft/{acc}_family.soft.gz",
            acc = accession.as_str()
        )
    }
}

impl GeoClient for GeoHttpClient {
    fn fetch_soft_text(&self, accession: &GeoSeriesAccession) -> Result<String, PipelineError> {
        let bytes = self
            .fetcher
            .get_bytes(accession.as_str(), &Self::soft_url(accession))?;
        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|err| PipelineError::Parse {
                what: format!("SOFT archive for {accession}"),
                message: err.to_string(),
            })?;
        Ok(text)
    }
}

pub fn geo_series_prefix(accession: &GeoSeriesAccession) -> String {
    let digits = accession.as_str().trim_start_matches("GSE");
    if digits.len() <= 3 {
        return "GSEnnn".to_string();
    }
    let head = &digits[..digits.len() - 3];
    format!("GSE{}nnn", head)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftEntity {
    pub kind: String,
    pub id: String,
    attributes: Vec<(String, String)>,
}

impl SoftEntity {
    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.attributes
            .iter()
            .filter(move |(name, _)| name == key)
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
    }

    pub fn first(&self, key: &str) -> Option<String> {
        self.values(key).next().map(str::to_string)
    }

    fn joined(&self, key: &str, separator: &str) -> Option<String> {
        let joined = self.values(key).collect::<Vec<_>>().join(separator);
        if joined.trim().is_empty() {
            None
        } else {
            Some(clean_text(&joined))
        }
    }
}

/// Splits SOFT text into `^ENTITY = id` blocks of `!Key = value` attributes.
/// Data tables between `_table_begin` and `_table_end` markers are skipped.
pub fn parse_soft(text: &str) -> Vec<SoftEntity> {
    let mut entities: Vec<SoftEntity> = Vec::new();
    let mut in_table = false;
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix('^') {
            in_table = false;
            let (kind, id) = rest.split_once('=').unwrap_or((rest, ""));
            entities.push(SoftEntity {
                kind: kind.trim().to_uppercase(),
                id: id.trim().to_string(),
                attributes: Vec::new(),
            });
            continue;
        }
        if let Some(rest) = line.strip_prefix('!') {
            let lowered = rest.to_lowercase();
            if lowered.ends_with("_table_begin") {
                in_table = true;
                continue;
            }
            if lowered.ends_with("_table_end") {
                in_table = false;
                continue;
            }
            if in_table {
                continue;
            }
            let Some(entity) = entities.last_mut() else {
                continue;
            };
            let (key, value) = rest.split_once('=').unwrap_or((rest, ""));
            entity
                .attributes
                .push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    entities
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSeries {
    pub accession: GeoSeriesAccession,
    pub title: String,
    pub summary: Option<String>,
    pub overall_design: Option<String>,
    pub series_types: Vec<String>,
    pub organisms: Vec<String>,
    pub submission_date: Option<String>,
    pub last_update_date: Option<String>,
    pub contacts: Vec<Contact>,
    pub relations: Vec<String>,
    pub supplementary_files: Vec<String>,
    pub platform_titles: Vec<String>,
    pub samples: Vec<SampleEntity>,
    pub cross_refs: Vec<CrossReference>,
    pub is_superseries: bool,
    pub subseries: Vec<String>,
    pub data_type: DataTypeDecision,
}

impl ResolvedSeries {
    pub fn refs_of(&self, kind: CrossRefKind) -> Vec<&CrossReference> {
        self.cross_refs.iter().filter(|r| r.kind == kind).collect()
    }

    pub fn has_target_tissue(&self) -> bool {
        self.samples.iter().any(|sample| sample.tissue_hint.is_some())
    }
}

pub fn parse_series(
    accession: &GeoSeriesAccession,
    text: &str,
) -> Result<ResolvedSeries, PipelineError> {
    let entities = parse_soft(text);
    let series = entities
        .iter()
        .find(|entity| {
            entity.kind == "SERIES" && entity.id.eq_ignore_ascii_case(accession.as_str())
        })
        .or_else(|| entities.iter().find(|entity| entity.kind == "SERIES"))
        .ok_or_else(|| PipelineError::Parse {
            what: format!("SOFT record for {accession}"),
            message: "no ^SERIES block".to_string(),
        })?;

    let title = series.first("Series_title").ok_or_else(|| PipelineError::Parse {
        what: format!("SOFT record for {accession}"),
        message: "series has no title".to_string(),
    })?;

    let samples = entities
        .iter()
        .filter(|entity| entity.kind == "SAMPLE")
        .map(parse_sample)
        .collect::<Vec<_>>();

    let platform_titles = unique_preserve_order(
        entities
            .iter()
            .filter(|entity| entity.kind == "PLATFORM")
            .filter_map(|entity| entity.first("Platform_title")),
    );

    let mut organisms = unique_preserve_order(
        samples
            .iter()
            .filter_map(|sample| sample.organism.as_deref()),
    );
    if organisms.is_empty() {
        organisms = unique_preserve_order(
            series
                .values("Series_sample_organism")
                .chain(series.values("Series_organism")),
        );
    }

    let relations = series
        .values("Series_relation")
        .map(str::to_string)
        .collect::<Vec<_>>();
    let sample_relations = entities
        .iter()
        .filter(|entity| entity.kind == "SAMPLE")
        .flat_map(|entity| entity.values("Sample_relation"))
        .collect::<Vec<_>>();

    let mut cross_refs: Vec<CrossReference> = Vec::new();
    let mut push_ref = |reference: CrossReference| {
        if !cross_refs.contains(&reference) {
            cross_refs.push(reference);
        }
    };
    for pmid in series.values("Series_pubmed_id") {
        push_ref(CrossReference::new(CrossRefKind::PubMed, pmid.trim()));
    }
    for relation in relations
        .iter()
        .map(String::as_str)
        .chain(sample_relations.iter().copied())
    {
        for capture in PMID_RE.captures_iter(relation) {
            push_ref(CrossReference::new(CrossRefKind::PubMed, &capture[1]));
        }
        for found in XREF_RE.find_iter(relation) {
            if let Some(reference) = CrossReference::classify(found.as_str()) {
                push_ref(reference);
            }
        }
    }

    let superseries_relations = relations
        .iter()
        .filter(|relation| relation.to_lowercase().starts_with("superseries of"))
        .collect::<Vec<_>>();
    let subseries = unique_preserve_order(
        superseries_relations
            .iter()
            .flat_map(|relation| GSE_RE.find_iter(relation).map(|m| m.as_str())),
    );
    let is_superseries = !superseries_relations.is_empty();

    let contacts = series
        .first("Series_contact_name")
        .map(|raw| Contact {
            name: raw
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
            email: series.first("Series_contact_email"),
            institute: series.first("Series_contact_institute"),
            country: series.first("Series_contact_country"),
        })
        .into_iter()
        .collect();

    let summary = series.joined("Series_summary", " ");
    let overall_design = series.joined("Series_overall_design", " ");
    let series_types = series
        .values("Series_type")
        .map(str::to_string)
        .collect::<Vec<_>>();

    let data_type = classify_data_type(&ClassificationInput {
        series_types: series_types.clone(),
        strategies: samples
            .iter()
            .map(|sample| sample.library_strategy)
            .filter(|strategy| *strategy != LibraryStrategy::Unclassified)
            .collect(),
        platforms: platform_titles.clone(),
        hints: classification_hints(&title, &summary, &overall_design, &samples),
    });

    Ok(ResolvedSeries {
        accession: accession.clone(),
        title: clean_text(&title),
        summary,
        overall_design,
        series_types,
        organisms,
        submission_date: series.first("Series_submission_date"),
        last_update_date: series.first("Series_last_update_date"),
        contacts,
        relations,
        supplementary_files: series
            .values("Series_supplementary_file")
            .filter(|value| !value.eq_ignore_ascii_case("none"))
            .map(str::to_string)
            .collect(),
        platform_titles,
        samples,
        cross_refs,
        is_superseries,
        subseries,
        data_type,
    })
}

fn classification_hints(
    title: &str,
    summary: &Option<String>,
    overall_design: &Option<String>,
    samples: &[SampleEntity],
) -> String {
    let mut parts = vec![title.to_string()];
    parts.extend(summary.iter().cloned());
    parts.extend(overall_design.iter().cloned());
    for sample in samples {
        parts.extend(sample.title.iter().cloned());
        parts.extend(sample.description.iter().cloned());
        parts.extend(sample.protocols.iter().cloned());
        parts.extend(
            sample
                .characteristics
                .iter()
                .map(|c| format!("{}: {}", c.tag, c.value)),
        );
    }
    parts.join("\n")
}

fn parse_sample(entity: &SoftEntity) -> SampleEntity {
    let characteristics = entity
        .values("Sample_characteristics_ch1")
        .chain(entity.values("Sample_characteristics_ch2"))
        .map(|raw| match raw.split_once(':') {
            Some((tag, value)) => Characteristic {
                tag: tag.trim().to_string(),
                value: value.trim().to_string(),
            },
            None => Characteristic {
                tag: String::new(),
                value: raw.trim().to_string(),
            },
        })
        .collect::<Vec<_>>();

    let strategy_raw = entity.first("Sample_library_strategy");
    let library_parts = [
        strategy_raw.clone(),
        entity.first("Sample_library_source"),
        entity.first("Sample_library_selection"),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>();
    let library_description = if library_parts.is_empty() {
        None
    } else {
        Some(library_parts.join(" / "))
    };

    let source_name = entity.first("Sample_source_name_ch1");
    let tissue_text = source_name
        .iter()
        .cloned()
        .chain(
            characteristics
                .iter()
                .map(|c| format!("{}: {}", c.tag, c.value)),
        )
        .collect::<Vec<_>>()
        .join(" ");

    let protocols = entity
        .values("Sample_extract_protocol_ch1")
        .chain(entity.values("Sample_treatment_protocol_ch1"))
        .map(clean_text)
        .collect::<Vec<_>>();

    SampleEntity {
        accession: entity.id.clone(),
        title: entity.first("Sample_title"),
        organism: entity.first("Sample_organism_ch1"),
        source_name,
        characteristics,
        description: entity.joined("Sample_description", " "),
        protocols,
        library_description,
        library_strategy: strategy_raw
            .as_deref()
            .map(LibraryStrategy::map)
            .unwrap_or(LibraryStrategy::Unclassified),
        library_strategy_raw: strategy_raw,
        tissue_hint: tissue_hint(&tissue_text),
        instrument: entity.first("Sample_instrument_model"),
        platform_id: entity.first("Sample_platform_id"),
        molecule: entity.first("Sample_molecule_ch1"),
    }
}

pub struct AccessionResolver<G: GeoClient> {
    client: G,
    cache: Arc<CacheStore>,
    retry: RetryPolicy,
}

impl<G: GeoClient> AccessionResolver<G> {
    pub fn new(client: G, cache: Arc<CacheStore>, retry: RetryPolicy) -> Self {
        Self {
            client,
            cache,
            retry,
        }
    }

    pub fn cache_key(accession: &GeoSeriesAccession) -> CacheKey {
        CacheKey::with_params(
            EntityKind::GeoSeries,
            accession.as_str(),
            &[("format", "soft_family")],
        )
    }

    pub fn resolve(&self, accession: &GeoSeriesAccession) -> Result<ResolvedSeries, PipelineError> {
        let key = Self::cache_key(accession);
        if let Some(entry) = self.cache.get(&key) {
            match parse_series(accession, &entry.payload) {
                Ok(series) => return Ok(series),
                Err(err) => {
                    tracing::warn!("{accession}: cached SOFT record unusable ({err}); refetching");
                    self.cache.remove(&key)?;
                }
            }
        }

        tracing::info!("{accession}: fetching GEO SOFT record");
        let text = self
            .retry
            .run("geo", || self.client.fetch_soft_text(accession))?;
        let series = parse_series(accession, &text).map_err(|err| {
            tracing::warn!("{accession}: {err}");
            PipelineError::not_found("GEO series", accession.as_str())
        })?;
        if let Err(err) = self.cache.put(&key, &text) {
            tracing::warn!("{accession}: cache write failed: {err}");
        }
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_buckets_by_thousands() {
        let small: GeoSeriesAccession = "GSE12".parse().unwrap();
        let large: GeoSeriesAccession = "GSE102902".parse().unwrap();
        assert_eq!(geo_series_prefix(&small), "GSEnnn");
        assert_eq!(geo_series_prefix(&large), "GSE102nnn");
    }

    #[test]
    fn soft_tables_are_skipped() {
        let text = "^SAMPLE = GSM1\n!Sample_title = a\n!sample_table_begin\nID\tVALUE\n!Sample_title = bogus\n!sample_table_end\n";
        let entities = parse_soft(text);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].values("Sample_title").count(), 1);
    }
}
