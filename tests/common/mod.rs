#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;

use geo_harvester::cache::CacheStore;
use geo_harvester::config::{
    Config, ConfigLoader, HarvestConfig, LlmSettings, ModelSettings, RateLimitSettings,
    RetrySettings,
};
use geo_harvester::cost::TokenUsage;
use geo_harvester::domain::GeoSeriesAccession;
use geo_harvester::error::PipelineError;
use geo_harvester::geo::GeoClient;
use geo_harvester::llm::{Completion, LlmClient};
use geo_harvester::pubmed::PubMedClient;
use geo_harvester::sra::SraClient;

pub struct TestEnv {
    pub temp: tempfile::TempDir,
    pub config: HarvestConfig,
    pub cache: Arc<CacheStore>,
}

pub fn test_env() -> TestEnv {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let config = ConfigLoader::resolve_config(Config {
        cache_dir: Some(root.join("cache").to_string()),
        out_dir: root.join("out").to_string(),
        workers: 2,
        fetch_full_text: false,
        retry: RetrySettings {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
        },
        rate_limits: RateLimitSettings {
            geo_interval_ms: 0,
            sra_interval_ms: 0,
            pubmed_interval_ms: 0,
            llm_interval_ms: 0,
        },
        ..Config::default()
    })
    .unwrap();
    let cache = Arc::new(CacheStore::new(config.cache_dir.clone()));
    TestEnv {
        temp,
        config,
        cache,
    }
}

/// Minimal SOFT family text: one series block followed by its samples.
pub struct SoftBuilder {
    accession: String,
    series: Vec<String>,
    samples: Vec<String>,
}

impl SoftBuilder {
    pub fn series(accession: &str, title: &str) -> Self {
        Self {
            accession: accession.to_string(),
            series: vec![
                format!("!Series_title = {title}"),
                format!("!Series_geo_accession = {accession}"),
                "!Series_type = Expression profiling by high throughput sequencing".to_string(),
                "!Series_submission_date = Jan 05 2021".to_string(),
                "!Series_last_update_date = Mar 01 2022".to_string(),
                "!Series_contact_name = Jane,,Doe".to_string(),
                "!Series_contact_email = jane@example.org".to_string(),
            ],
            samples: Vec::new(),
        }
    }

    pub fn line(mut self, key: &str, value: &str) -> Self {
        self.series.push(format!("!{key} = {value}"));
        self
    }

    pub fn summary(self, text: &str) -> Self {
        self.line("Series_summary", text)
    }

    pub fn design(self, text: &str) -> Self {
        self.line("Series_overall_design", text)
    }

    pub fn pubmed(self, pmid: &str) -> Self {
        self.line("Series_pubmed_id", pmid)
    }

    /// Adds a placental RNA-Seq sample; `extra` holds raw `Key = value` lines.
    pub fn sample(mut self, id: &str, characteristics: &[&str], extra: &[&str]) -> Self {
        let mut block = vec![
            format!("^SAMPLE = {id}"),
            format!("!Sample_title = {id} placenta"),
            "!Sample_source_name_ch1 = placenta".to_string(),
            "!Sample_organism_ch1 = Homo sapiens".to_string(),
            "!Sample_library_strategy = RNA-Seq".to_string(),
            "!Sample_library_source = transcriptomic".to_string(),
            "!Sample_instrument_model = Illumina NovaSeq 6000".to_string(),
        ];
        block.extend(
            characteristics
                .iter()
                .map(|value| format!("!Sample_characteristics_ch1 = {value}")),
        );
        block.extend(extra.iter().map(|line| format!("!{line}")));
        self.samples.push(block.join("\n"));
        self
    }

    pub fn build(self) -> String {
        let mut text = format!("^SERIES = {}\n{}\n", self.accession, self.series.join("\n"));
        for sample in self.samples {
            text.push_str(&sample);
            text.push('\n');
        }
        text
    }
}

pub fn sra_xml(study: &str) -> String {
    format!(
        r#"<EXPERIMENT_PACKAGE_SET><EXPERIMENT_PACKAGE><EXPERIMENT accession="SRX0"><STUDY_REF accession="{study}"/></EXPERIMENT><STUDY accession="{study}" alias="s"/></EXPERIMENT_PACKAGE></EXPERIMENT_PACKAGE_SET>"#
    )
}

pub fn article_xml(pmid: &str, title: &str, authors: &[(&str, &str, &str)]) -> String {
    let authors = authors
        .iter()
        .map(|(fore, last, affiliation)| {
            format!(
                "<Author ValidYN=\"Y\"><LastName>{last}</LastName><ForeName>{fore}</ForeName>\
                 <AffiliationInfo><Affiliation>{affiliation}</Affiliation></AffiliationInfo></Author>"
            )
        })
        .collect::<String>();
    format!(
        "<PubmedArticleSet><PubmedArticle><MedlineCitation><PMID>{pmid}</PMID><Article>\
         <Journal><JournalIssue><PubDate><Year>2021</Year></PubDate></JournalIssue>\
         <Title>Placenta</Title></Journal><ArticleTitle>{title}</ArticleTitle>\
         <AuthorList>{authors}</AuthorList></Article></MedlineCitation><PubmedData>\
         <ArticleIdList><ArticleId IdType=\"pubmed\">{pmid}</ArticleId>\
         <ArticleId IdType=\"doi\">10.1000/placenta.{pmid}</ArticleId></ArticleIdList>\
         </PubmedData></PubmedArticle></PubmedArticleSet>"
    )
}

pub fn search_json(ids: &[&str]) -> String {
    serde_json::json!({"esearchresult": {"count": ids.len().to_string(), "idlist": ids}})
        .to_string()
}

pub fn summary_json(pmid: &str, title: &str) -> String {
    serde_json::json!({"result": {"uids": [pmid], pmid: {"uid": pmid, "title": title}}})
        .to_string()
}

#[derive(Default)]
pub struct MockGeo {
    records: HashMap<String, String>,
    pub calls: Mutex<usize>,
}

impl MockGeo {
    pub fn with(mut self, accession: &str, soft: String) -> Self {
        self.records.insert(accession.to_string(), soft);
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl GeoClient for MockGeo {
    fn fetch_soft_text(&self, accession: &GeoSeriesAccession) -> Result<String, PipelineError> {
        *self.calls.lock().unwrap() += 1;
        self.records
            .get(accession.as_str())
            .cloned()
            .ok_or_else(|| PipelineError::not_found("geo", accession.as_str()))
    }
}

#[derive(Default)]
pub struct MockSra {
    studies: HashMap<String, String>,
    pub calls: Mutex<usize>,
}

impl MockSra {
    pub fn with(mut self, experiment: &str, study: &str) -> Self {
        self.studies.insert(experiment.to_string(), study.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl SraClient for MockSra {
    fn fetch_experiment_xml(&self, accession: &str) -> Result<String, PipelineError> {
        *self.calls.lock().unwrap() += 1;
        match self.studies.get(accession) {
            Some(study) => Ok(sra_xml(study)),
            None => Ok("<EXPERIMENT_PACKAGE_SET/>".to_string()),
        }
    }
}

#[derive(Default)]
pub struct MockPubMed {
    articles: HashMap<String, String>,
    searches: HashMap<String, String>,
    summaries: HashMap<String, String>,
    pub calls: Mutex<usize>,
    pub search_calls: Mutex<usize>,
}

impl MockPubMed {
    pub fn with_article(mut self, pmid: &str, xml: String) -> Self {
        self.articles.insert(pmid.to_string(), xml);
        self
    }

    pub fn with_search(mut self, term: &str, json: String) -> Self {
        self.searches.insert(term.to_string(), json);
        self
    }

    pub fn with_summary(mut self, pmid: &str, json: String) -> Self {
        self.summaries.insert(pmid.to_string(), json);
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    pub fn search_calls(&self) -> usize {
        *self.search_calls.lock().unwrap()
    }
}

impl PubMedClient for MockPubMed {
    fn fetch_article_xml(&self, pmid: &str) -> Result<String, PipelineError> {
        *self.calls.lock().unwrap() += 1;
        self.articles
            .get(pmid)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("pubmed", pmid))
    }

    fn search(&self, term: &str) -> Result<String, PipelineError> {
        *self.calls.lock().unwrap() += 1;
        *self.search_calls.lock().unwrap() += 1;
        Ok(self
            .searches
            .get(term)
            .cloned()
            .unwrap_or_else(|| search_json(&[])))
    }

    fn summaries(&self, pmids: &[String]) -> Result<String, PipelineError> {
        *self.calls.lock().unwrap() += 1;
        let pmid = pmids.first().cloned().unwrap_or_default();
        self.summaries
            .get(&pmid)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("pubmed summary", &pmid))
    }
}

pub struct MockLlm {
    settings: ModelSettings,
    reply: Option<String>,
    pub calls: Mutex<usize>,
    pub prompts: Mutex<Vec<String>>,
}

impl MockLlm {
    pub fn primary(reply: Option<String>) -> Self {
        Self::new(LlmSettings::default().primary, reply)
    }

    pub fn fallback(reply: Option<String>) -> Self {
        Self::new(LlmSettings::default().fallback, reply)
    }

    pub fn new(settings: ModelSettings, reply: Option<String>) -> Self {
        Self {
            settings,
            reply,
            calls: Mutex::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl LlmClient for MockLlm {
    fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    fn complete(&self, _system: &str, user: &str) -> Result<Completion, PipelineError> {
        *self.calls.lock().unwrap() += 1;
        self.prompts.lock().unwrap().push(user.to_string());
        match &self.reply {
            Some(text) => Ok(Completion {
                text: text.clone(),
                usage: TokenUsage {
                    prompt_tokens: 1_000,
                    completion_tokens: 200,
                },
            }),
            None => Err(PipelineError::Provider {
                provider: self.settings.provider.as_str().to_string(),
                message: "status 400: bad request".to_string(),
                retryable: false,
            }),
        }
    }
}

/// Model reply in the `{"fields": {...}}` shape.
pub fn model_reply(answers: &[(&str, Option<&str>, f64, &[&str])]) -> String {
    let fields = answers
        .iter()
        .map(|(name, value, confidence, evidence)| {
            (
                name.to_string(),
                serde_json::json!({
                    "value": value,
                    "confidence": confidence,
                    "evidence": evidence,
                }),
            )
        })
        .collect::<serde_json::Map<_, _>>();
    serde_json::json!({ "fields": fields }).to_string()
}
