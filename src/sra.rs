use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::cache::{CacheKey, CacheStore};
use crate::domain::{CrossRefKind, CrossReference, EntityKind};
use crate::error::PipelineError;
use crate::http::{HttpFetcher, RetryPolicy, ncbi_params};
use crate::problems::{ProblemEntry, ProblemReason};

const EFETCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi";

static STUDY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<STUDY(?:_REF)?\b[^>]*?\baccession="([SED]RP\d+)""#).unwrap()
});

pub trait SraClient: Send + Sync {
    fn fetch_experiment_xml(&self, accession: &str) -> Result<String, PipelineError>;
}

impl<T: SraClient + ?Sized> SraClient for Arc<T> {
    fn fetch_experiment_xml(&self, accession: &str) -> Result<String, PipelineError> {
        (**self).fetch_experiment_xml(accession)
    }
}

#[derive(Clone)]
pub struct SraHttpClient {
    fetcher: HttpFetcher,
}

impl SraHttpClient {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }
}

impl SraClient for SraHttpClient {
    fn fetch_experiment_xml(&self, accession: &str) -> Result<String, PipelineError> {
        let mut query = vec![
            ("db".to_string(), "sra".to_string()),
            ("id".to_string(), accession.to_string()),
        ];
        query.extend(ncbi_params());
        self.fetcher.get_text(accession, EFETCH_URL, &query)
    }
}

pub fn parse_study_accessions(xml: &str) -> BTreeSet<String> {
    STUDY_RE
        .captures_iter(xml)
        .map(|capture| capture[1].to_string())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SraResolution {
    pub study_ids: Option<BTreeSet<String>>,
    pub problems: Vec<ProblemEntry>,
}

pub struct SraResolver<S: SraClient> {
    client: S,
    cache: Arc<CacheStore>,
    retry: RetryPolicy,
}

impl<S: SraClient> SraResolver<S> {
    pub fn new(client: S, cache: Arc<CacheStore>, retry: RetryPolicy) -> Self {
        Self {
            client,
            cache,
            retry,
        }
    }

    pub fn cache_key(accession: &str) -> CacheKey {
        CacheKey::with_params(EntityKind::SraExperiment, accession, &[("db", "sra")])
    }

    pub fn resolve(&self, accession: &str, refs: &[CrossReference]) -> SraResolution {
        let mut studies = refs
            .iter()
            .filter(|reference| reference.kind == CrossRefKind::SraStudy)
            .map(|reference| reference.id.clone())
            .collect::<BTreeSet<_>>();
        let mut problems = Vec::new();

        for reference in refs.iter().filter(|reference| reference.is_sra_lookup()) {
            match self.lookup(&reference.id) {
                Ok(found) if !found.is_empty() => studies.extend(found),
                Ok(_) => problems.push(ProblemEntry::new(
                    accession,
                    "sra",
                    ProblemReason::NotFound,
                    format!("{} resolved to no parent study", reference.id),
                )),
                Err(err) => {
                    tracing::warn!("{accession}: SRA lookup for {} failed: {err}", reference.id);
                    problems.push(ProblemEntry::new(
                        accession,
                        "sra",
                        err.problem_reason(),
                        format!("{}: {err}", reference.id),
                    ));
                }
            }
        }

        if studies.len() > 1 {
            problems.push(ProblemEntry::new(
                accession,
                "sra_study_ids",
                ProblemReason::AmbiguousSraStudy,
                format!(
                    "runs resolve to {} studies: {}",
                    studies.len(),
                    studies.iter().cloned().collect::<Vec<_>>().join(", ")
                ),
            ));
        }

        SraResolution {
            study_ids: if studies.is_empty() {
                None
            } else {
                Some(studies)
            },
            problems,
        }
    }

    fn lookup(&self, id: &str) -> Result<BTreeSet<String>, PipelineError> {
        let xml = self.cache.fetch_validated(
            &Self::cache_key(id),
            || {
                self.retry
                    .run("sra", || self.client.fetch_experiment_xml(id))
            },
            |xml| !parse_study_accessions(xml).is_empty(),
        )?;
        Ok(parse_study_accessions(&xml))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_study_and_study_ref() {
        let xml = r#"<EXPERIMENT_PACKAGE><STUDY_REF accession="SRP100"/>
            <STUDY center_name="GEO" alias="GSE1" accession="SRP100">
            </STUDY><STUDY_REF refname="x" accession="ERP7"/></EXPERIMENT_PACKAGE>"#;
        let studies = parse_study_accessions(xml);
        assert_eq!(
            studies.into_iter().collect::<Vec<_>>(),
            vec!["ERP7".to_string(), "SRP100".to_string()]
        );
    }
}
