use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::cache::{CacheKey, CacheStore};
use crate::domain::EntityKind;
use crate::error::PipelineError;
use crate::http::{HttpFetcher, RetryPolicy, ncbi_params};
use crate::record::{Publication, SourceSection};
use crate::snippets::TextSource;
use crate::text::{clean_text, decode_entities};

const EFETCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi";

static BODY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<body\b[^>]*>(.*?)</body>").unwrap());
static ARTICLE_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<article-title\b[^>]*>(.*?)</article-title>").unwrap()
});
static BLOCK_END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</(?:p|title|sec|caption|td|th|li)>").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static DROP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(?:xref|ref-list|fn-group|ack)\b[^>]*>.*?</(?:xref|ref-list|fn-group|ack)>")
        .unwrap()
});

/// Supplies extra text (e.g. a full-text manuscript) for a linked publication.
pub trait DocumentSource: Send + Sync {
    fn sections(&self, publication: &Publication) -> Result<Vec<TextSource>, PipelineError>;
}

pub trait PmcClient: Send + Sync {
    fn fetch_pmc_xml(&self, pmcid: &str) -> Result<String, PipelineError>;
}

impl<T: PmcClient + ?Sized> PmcClient for Arc<T> {
    fn fetch_pmc_xml(&self, pmcid: &str) -> Result<String, PipelineError> {
        (**self).fetch_pmc_xml(pmcid)
    }
}

#[derive(Clone)]
pub struct PmcHttpClient {
    fetcher: HttpFetcher,
}

impl PmcHttpClient {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }
}

impl PmcClient for PmcHttpClient {
    fn fetch_pmc_xml(&self, pmcid: &str) -> Result<String, PipelineError> {
        let mut query = vec![
            ("db".to_string(), "pmc".to_string()),
            ("id".to_string(), pmcid.trim_start_matches("PMC").to_string()),
            ("retmode".to_string(), "xml".to_string()),
        ];
        query.extend(ncbi_params());
        self.fetcher.get_text(pmcid, EFETCH_URL, &query)
    }
}

/// Flattens a JATS article body to text with one block per line, so section
/// titles stand alone and can be picked up as headings.
pub fn pmc_body_text(xml: &str) -> Option<String> {
    let body = clean_text(BODY_RE.captures(xml)?.get(1)?.as_str());
    let body = DROP_RE.replace_all(&body, " ");
    let body = BLOCK_END_RE.replace_all(&body, "\n");
    let text = TAG_RE.replace_all(&body, " ");
    let lines = decode_entities(&text)
        .lines()
        .map(clean_text)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

pub fn pmc_article_title(xml: &str) -> Option<String> {
    ARTICLE_TITLE_RE
        .captures(xml)
        .map(|capture| clean_text(&TAG_RE.replace_all(&capture[1], " ")))
        .filter(|title| !title.is_empty())
}

pub struct PmcDocumentSource<C: PmcClient> {
    client: C,
    cache: Arc<CacheStore>,
    retry: RetryPolicy,
}

impl<C: PmcClient> PmcDocumentSource<C> {
    pub fn new(client: C, cache: Arc<CacheStore>, retry: RetryPolicy) -> Self {
        Self {
            client,
            cache,
            retry,
        }
    }

    pub fn cache_key(pmcid: &str) -> CacheKey {
        CacheKey::with_params(
            EntityKind::PmcDocument,
            pmcid,
            &[("db", "pmc"), ("retmode", "xml")],
        )
    }
}

impl<C: PmcClient> DocumentSource for PmcDocumentSource<C> {
    fn sections(&self, publication: &Publication) -> Result<Vec<TextSource>, PipelineError> {
        let Some(pmcid) = publication.pmcid.as_deref() else {
            return Ok(Vec::new());
        };
        let xml = self.cache.fetch_validated(
            &Self::cache_key(pmcid),
            || self.retry.run("pmc", || self.client.fetch_pmc_xml(pmcid)),
            |xml| pmc_body_text(xml).is_some(),
        )?;
        let text = pmc_body_text(&xml).ok_or_else(|| PipelineError::Parse {
            what: format!("PMC article {pmcid}"),
            message: "no article body".to_string(),
        })?;
        tracing::debug!(
            "{pmcid}: full text with {} lines ({})",
            text.lines().count(),
            pmc_article_title(&xml).unwrap_or_default()
        );
        Ok(vec![TextSource::new(SourceSection::Document, pmcid, text)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_keeps_section_titles_on_own_lines() {
        let xml = r#"<article><front><article-title>X</article-title></front><body>
            <sec><title>Methods</title><p>Placentas were collected at term
            <xref ref-type="bibr">12</xref>.</p></sec></body></article>"#;
        let text = pmc_body_text(xml).unwrap();
        assert_eq!(text, "Methods\nPlacentas were collected at term .");
    }

    #[test]
    fn missing_body_yields_none() {
        assert_eq!(pmc_body_text("<article><front/></article>"), None);
    }
}
