use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;

use crate::cache::{CacheKey, CacheStore};
use crate::domain::{CrossRefKind, EntityKind};
use crate::error::PipelineError;
use crate::geo::ResolvedSeries;
use crate::http::{HttpFetcher, RetryPolicy, ncbi_params};
use crate::problems::{ProblemEntry, ProblemReason};
use crate::record::{Author, Confidence, Publication, PublicationMatch};
use crate::text::{clean_text, strip_tags, title_similarity};

const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const SEARCH_RETMAX: &str = "5";
const MAX_CITED_AUTHORS: usize = 6;
const SUMMARY_TERM_WORDS: usize = 12;

static ARTICLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<PubmedArticle\b.*?</PubmedArticle>").unwrap());
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<ArticleTitle\b[^>]*>(.*?)</ArticleTitle>").unwrap());
static JOURNAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Journal>.*?<Title>(.*?)</Title>").unwrap());
static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<PubDate>.*?(?:<Year>(\d{4})</Year>|<MedlineDate>(\d{4}))").unwrap()
});
static ARTICLE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<ArticleId\s+IdType="([A-Za-z]+)"\s*>([^<]+)</ArticleId>"#).unwrap()
});
static AUTHOR_LIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<AuthorList\b[^>]*>(.*?)</AuthorList>").unwrap());
static AUTHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Author\b[^>]*>(.*?)</Author>").unwrap());
static AFFILIATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Affiliation>(.*?)</Affiliation>").unwrap());
static LAST_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<LastName>(.*?)</LastName>").unwrap());
static COLLECTIVE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<CollectiveName>(.*?)</CollectiveName>").unwrap());
static FORE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<ForeName>(.*?)</ForeName>").unwrap());
static INITIALS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Initials>(.*?)</Initials>").unwrap());
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+").unwrap());

pub trait PubMedClient: Send + Sync {
    fn fetch_article_xml(&self, pmid: &str) -> Result<String, PipelineError>;
    fn search(&self, term: &str) -> Result<String, PipelineError>;
    fn summaries(&self, pmids: &[String]) -> Result<String, PipelineError>;
}

impl<T: PubMedClient + ?Sized> PubMedClient for Arc<T> {
    fn fetch_article_xml(&self, pmid: &str) -> Result<String, PipelineError> {
        (**self).fetch_article_xml(pmid)
    }

    fn search(&self, term: &str) -> Result<String, PipelineError> {
        (**self).search(term)
    }

    fn summaries(&self, pmids: &[String]) -> Result<String, PipelineError> {
        (**self).summaries(pmids)
    }
}

#[derive(Clone)]
pub struct PubMedHttpClient {
    fetcher: HttpFetcher,
}

impl PubMedHttpClient {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }

    fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut query = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<Vec<_>>();
        query.extend(ncbi_params());
        query
    }
}

impl PubMedClient for PubMedHttpClient {
    fn fetch_article_xml(&self, pmid: &str) -> Result<String, PipelineError> {
        let query = Self::query(&[("db", "pubmed"), ("id", pmid), ("retmode", "xml")]);
        self.fetcher
            .get_text(pmid, &format!("{EUTILS_BASE}/efetch.fcgi"), &query)
    }

    fn search(&self, term: &str) -> Result<String, PipelineError> {
        let query = Self::query(&[
            ("db", "pubmed"),
            ("term", term),
            ("retmode", "json"),
            ("retmax", SEARCH_RETMAX),
            ("sort", "relevance"),
        ]);
        self.fetcher
            .get_text(term, &format!("{EUTILS_BASE}/esearch.fcgi"), &query)
    }

    fn summaries(&self, pmids: &[String]) -> Result<String, PipelineError> {
        let ids = pmids.join(",");
        let query = Self::query(&[("db", "pubmed"), ("id", &ids), ("retmode", "json")]);
        self.fetcher
            .get_text(&ids, &format!("{EUTILS_BASE}/esummary.fcgi"), &query)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArticleMetadata {
    pub pmid: String,
    pub title: Option<String>,
    pub journal: Option<String>,
    pub year: Option<String>,
    pub doi: Option<String>,
    pub pmcid: Option<String>,
    pub authors: Vec<Author>,
}

fn capture_text(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|capture| capture.get(1))
        .map(|m| clean_text(&strip_tags(m.as_str())))
        .filter(|value| !value.is_empty())
}

fn search_term(text: &str) -> String {
    clean_text(&text.replace(['"', '[', ']'], " "))
}

/// Leading words of the summary's first sentence.
fn summary_term(summary: &str) -> String {
    let sentence = summary.split(". ").next().unwrap_or_default();
    search_term(sentence)
        .split(' ')
        .take(SUMMARY_TERM_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Best-effort: the first address-looking token in the affiliations.
pub fn extract_email(affiliations: &[String]) -> Option<String> {
    affiliations.iter().find_map(|affiliation| {
        EMAIL_RE
            .find(affiliation)
            .map(|m| m.as_str().trim_end_matches('.').to_string())
    })
}

fn parse_author(block: &str) -> Option<Author> {
    let last = capture_text(&LAST_NAME_RE, block)
        .or_else(|| capture_text(&COLLECTIVE_NAME_RE, block));
    let fore =
        capture_text(&FORE_NAME_RE, block).or_else(|| capture_text(&INITIALS_RE, block));
    let name = match (fore, last) {
        (Some(fore), Some(last)) => format!("{fore} {last}"),
        (None, Some(last)) => last,
        (Some(fore), None) => fore,
        (None, None) => return None,
    };
    let affiliations = AFFILIATION_RE
        .captures_iter(block)
        .map(|capture| clean_text(&strip_tags(&capture[1])))
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>();
    let email = extract_email(&affiliations);
    Some(Author {
        name,
        affiliations,
        email,
    })
}

pub fn parse_article(pmid: &str, xml: &str) -> Option<ArticleMetadata> {
    let article = ARTICLE_RE.find(xml)?.as_str();
    let own_ids = article
        .split("<ReferenceList")
        .next()
        .unwrap_or(article);

    let mut doi = None;
    let mut pmcid = None;
    let mut found_pmid = None;
    for capture in ARTICLE_ID_RE.captures_iter(own_ids) {
        let value = capture[2].trim().to_string();
        match capture[1].to_lowercase().as_str() {
            "doi" if doi.is_none() => doi = Some(value),
            "pmc" if pmcid.is_none() => {
                pmcid = Some(if value.starts_with("PMC") {
                    value
                } else {
                    format!("PMC{value}")
                })
            }
            "pubmed" if found_pmid.is_none() => found_pmid = Some(value),
            _ => {}
        }
    }

    let authors = AUTHOR_LIST_RE
        .captures(article)
        .map(|capture| {
            AUTHOR_RE
                .captures_iter(&capture[1])
                .filter_map(|author| parse_author(&author[1]))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let year = YEAR_RE.captures(article).and_then(|capture| {
        capture
            .get(1)
            .or_else(|| capture.get(2))
            .map(|m| m.as_str().to_string())
    });

    Some(ArticleMetadata {
        pmid: found_pmid.unwrap_or_else(|| pmid.to_string()),
        title: capture_text(&TITLE_RE, article),
        journal: capture_text(&JOURNAL_RE, article),
        year,
        doi,
        pmcid,
        authors,
    })
}

pub fn format_citation(meta: &ArticleMetadata) -> Option<String> {
    let names = meta
        .authors
        .iter()
        .map(|author| author.name.as_str())
        .collect::<Vec<_>>();
    let author_str = if names.len() > MAX_CITED_AUTHORS {
        format!("{}, et al", names[..MAX_CITED_AUTHORS].join(", "))
    } else {
        names.join(", ")
    };
    let pieces = [
        Some(author_str),
        meta.title.clone(),
        meta.journal.clone(),
        meta.year.clone(),
        meta.doi.clone(),
    ]
    .into_iter()
    .flatten()
    .map(|piece| piece.trim_end_matches('.').to_string())
    .filter(|piece| !piece.is_empty())
    .collect::<Vec<_>>();
    if pieces.is_empty() {
        None
    } else {
        Some(pieces.join(". "))
    }
}

pub fn parse_search_ids(json: &str) -> Result<Vec<String>, PipelineError> {
    let value: Value = serde_json::from_str(json).map_err(|err| PipelineError::Parse {
        what: "esearch response".to_string(),
        message: err.to_string(),
    })?;
    let ids = value
        .get("esearchresult")
        .and_then(|result| result.get("idlist"))
        .and_then(Value::as_array)
        .ok_or_else(|| PipelineError::Parse {
            what: "esearch response".to_string(),
            message: "missing esearchresult.idlist".to_string(),
        })?;
    Ok(ids
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect())
}

pub fn parse_summary_title(json: &str, pmid: &str) -> Option<String> {
    let value: Value = serde_json::from_str(json).ok()?;
    value
        .get("result")?
        .get(pmid)?
        .get("title")?
        .as_str()
        .map(|title| clean_text(&strip_tags(title)))
        .filter(|title| !title.is_empty())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublicationLink {
    pub publication: Option<Publication>,
    pub problems: Vec<ProblemEntry>,
}

pub struct PubMedLinker<P: PubMedClient> {
    client: P,
    cache: Arc<CacheStore>,
    retry: RetryPolicy,
    similarity_threshold: f64,
}

impl<P: PubMedClient> PubMedLinker<P> {
    pub fn new(
        client: P,
        cache: Arc<CacheStore>,
        retry: RetryPolicy,
        similarity_threshold: f64,
    ) -> Self {
        Self {
            client,
            cache,
            retry,
            similarity_threshold,
        }
    }

    pub fn article_key(pmid: &str) -> CacheKey {
        CacheKey::with_params(
            EntityKind::PubMedArticle,
            pmid,
            &[("db", "pubmed"), ("retmode", "xml")],
        )
    }

    pub fn search_key(term: &str) -> CacheKey {
        CacheKey::with_params(
            EntityKind::PubMedSearch,
            term,
            &[
                ("db", "pubmed"),
                ("retmax", SEARCH_RETMAX),
                ("sort", "relevance"),
            ],
        )
    }

    pub fn summary_key(pmid: &str) -> CacheKey {
        CacheKey::with_params(EntityKind::PubMedSummary, pmid, &[("db", "pubmed")])
    }

    pub fn link(&self, series: &ResolvedSeries) -> PublicationLink {
        let accession = series.accession.as_str();
        let direct = series.refs_of(CrossRefKind::PubMed);
        let outcome = match direct.first() {
            Some(reference) => self.link_direct(accession, &reference.id),
            None => self.link_by_search(accession, series),
        };
        match outcome {
            Ok(link) => link,
            Err(err) => {
                tracing::warn!("{accession}: publication lookup failed: {err}");
                PublicationLink {
                    publication: None,
                    problems: vec![ProblemEntry::new(
                        accession,
                        "pubmed",
                        err.problem_reason(),
                        err.to_string(),
                    )],
                }
            }
        }
    }

    fn link_direct(&self, accession: &str, pmid: &str) -> Result<PublicationLink, PipelineError> {
        let Some(meta) = self.fetch_article(pmid)? else {
            return Ok(PublicationLink {
                publication: None,
                problems: vec![ProblemEntry::new(
                    accession,
                    "pubmed",
                    ProblemReason::NotFound,
                    format!("PMID {pmid} has no PubMed record"),
                )],
            });
        };
        Ok(self.build_link(
            accession,
            meta,
            PublicationMatch::Direct,
            Confidence::HIGH,
        ))
    }

    fn link_by_search(
        &self,
        accession: &str,
        series: &ResolvedSeries,
    ) -> Result<PublicationLink, PipelineError> {
        let no_match = |note: String| PublicationLink {
            publication: None,
            problems: vec![ProblemEntry::new(
                accession,
                "publication",
                ProblemReason::NoConfidentPublicationMatch,
                note,
            )],
        };

        let mut terms = vec![
            search_term(&series.title),
            summary_term(series.summary.as_deref().unwrap_or_default()),
        ];
        terms.retain(|term| !term.is_empty());
        terms.dedup();
        if terms.is_empty() {
            return Ok(no_match("dataset has no title or summary to search with".to_string()));
        }

        let mut found = None;
        for term in &terms {
            let search_json = self.cache.fetch_validated(
                &Self::search_key(term),
                || self.retry.run("pubmed", || self.client.search(term)),
                |json| parse_search_ids(json).is_ok(),
            )?;
            if let Some(top) = parse_search_ids(&search_json)?.into_iter().next() {
                found = Some((term, top));
                break;
            }
            tracing::debug!("{accession}: no PubMed hits for \"{term}\"");
        }
        let Some((term, top)) = found else {
            return Ok(no_match("search returned no candidates".to_string()));
        };

        let top_ids = vec![top.clone()];
        let summary_json = self.cache.fetch_validated(
            &Self::summary_key(&top),
            || self.retry.run("pubmed", || self.client.summaries(&top_ids)),
            |json| parse_summary_title(json, &top).is_some(),
        )?;
        let candidate_title = parse_summary_title(&summary_json, &top).unwrap_or_default();
        let score = title_similarity(term, &candidate_title);
        tracing::debug!("{accession}: PMID {top} title similarity {score:.2}");
        if score < self.similarity_threshold {
            return Ok(no_match(format!(
                "best candidate PMID {top} scored {score:.2} below {:.2}",
                self.similarity_threshold
            )));
        }

        match self.fetch_article(&top)? {
            Some(meta) => Ok(self.build_link(
                accession,
                meta,
                PublicationMatch::Search,
                Confidence::new(score),
            )),
            None => Ok(no_match(format!("candidate PMID {top} has no PubMed record"))),
        }
    }

    fn fetch_article(&self, pmid: &str) -> Result<Option<ArticleMetadata>, PipelineError> {
        let xml = self.cache.fetch_validated(
            &Self::article_key(pmid),
            || {
                self.retry
                    .run("pubmed", || self.client.fetch_article_xml(pmid))
            },
            |xml| parse_article(pmid, xml).is_some(),
        )?;
        Ok(parse_article(pmid, &xml))
    }

    fn build_link(
        &self,
        accession: &str,
        meta: ArticleMetadata,
        match_kind: PublicationMatch,
        confidence: Confidence,
    ) -> PublicationLink {
        let mut problems = Vec::new();
        let corresponding = meta.authors.last().map(|author| author.name.clone());
        if corresponding.is_none() {
            problems.push(ProblemEntry::new(
                accession,
                "corresponding_author",
                ProblemReason::MissingAuthor,
                format!("PMID {} lists no authors", meta.pmid),
            ));
        }
        let corresponding_email = meta
            .authors
            .iter()
            .rev()
            .find_map(|author| author.email.clone());
        let citation = format_citation(&meta);
        PublicationLink {
            publication: Some(Publication {
                pmid: meta.pmid,
                title: meta.title,
                journal: meta.journal,
                year: meta.year,
                doi: meta.doi,
                pmcid: meta.pmcid,
                citation,
                authors: meta.authors,
                corresponding_author: corresponding,
                corresponding_email,
                match_kind,
                confidence,
            }),
            problems,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_is_optional() {
        assert_eq!(
            extract_email(&["Dept. of Obstetrics, Boston, MA.".to_string()]),
            None
        );
        assert_eq!(
            extract_email(&["Boston, MA. Electronic address: jdoe@example.org.".to_string()]),
            Some("jdoe@example.org".to_string())
        );
    }

    #[test]
    fn citation_truncates_authors() {
        let author = |name: &str| Author {
            name: name.to_string(),
            affiliations: Vec::new(),
            email: None,
        };
        let meta = ArticleMetadata {
            pmid: "1".to_string(),
            title: Some("Title".to_string()),
            journal: Some("Placenta".to_string()),
            year: Some("2020".to_string()),
            doi: None,
            pmcid: None,
            authors: ["A", "B", "C", "D", "E", "F", "G"]
                .iter()
                .map(|name| author(name))
                .collect(),
        };
        assert_eq!(
            format_citation(&meta).unwrap(),
            "A, B, C, D, E, F, et al. Title. Placenta. 2020"
        );
    }

    #[test]
    fn author_names_fall_back_to_collective_and_initials() {
        let collective =
            parse_author("<Author><CollectiveName>Placenta Atlas Consortium</CollectiveName></Author>")
                .unwrap();
        assert_eq!(collective.name, "Placenta Atlas Consortium");

        let initials = parse_author("<Author><LastName>Lee</LastName><Initials>A</Initials></Author>")
            .unwrap();
        assert_eq!(initials.name, "A Lee");
        assert_eq!(parse_author("<Author><Identifier>x</Identifier></Author>"), None);
    }
}
