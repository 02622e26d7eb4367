use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;

use crate::aggregate::FieldAggregator;
use crate::cache::{CacheStats, CacheStore};
use crate::classify::DataType;
use crate::config::HarvestConfig;
use crate::cost::{CostLedger, CostReport};
use crate::derive::derive_native_fields;
use crate::documents::DocumentSource;
use crate::domain::GeoSeriesAccession;
use crate::error::PipelineError;
use crate::geo::{AccessionResolver, GeoClient};
use crate::http::RetryPolicy;
use crate::llm::{LlmClient, LlmEscalator};
use crate::problems::{ProblemEntry, ProblemReason, ProblemTracker};
use crate::pubmed::{PubMedClient, PubMedLinker};
use crate::record::{ClinicalField, ConfidenceLevel, DatasetRecord, Snippet};
use crate::snippets::{SnippetBook, SnippetExtractor, series_sources};
use crate::sra::{SraClient, SraResolver};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub accession: Option<String>,
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub requested: usize,
    pub records: usize,
    pub failed: Vec<String>,
    pub problems: usize,
    pub snippets: usize,
    pub cache: CacheStats,
    pub llm_calls: u64,
    pub llm_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub records: Vec<DatasetRecord>,
    pub problems: Vec<ProblemEntry>,
    pub snippets: Vec<Snippet>,
    pub costs: CostReport,
    pub summary: BatchSummary,
}

/// Everything one accession produced. Only built once its whole chain ran.
struct AccessionOutcome {
    accession: String,
    record: Option<DatasetRecord>,
    snippets: Vec<Snippet>,
    problems: Vec<ProblemEntry>,
}

impl AccessionOutcome {
    fn failed(accession: &str, problem: ProblemEntry) -> Self {
        Self {
            accession: accession.to_string(),
            record: None,
            snippets: Vec::new(),
            problems: vec![problem],
        }
    }
}

pub struct Pipeline<G: GeoClient, S: SraClient, P: PubMedClient> {
    workers: usize,
    fetch_full_text: bool,
    accept_confidence: f64,
    cache: Arc<CacheStore>,
    retry: RetryPolicy,
    resolver: AccessionResolver<G>,
    sra: SraResolver<S>,
    pubmed: PubMedLinker<P>,
    documents: Option<Box<dyn DocumentSource>>,
    extractor: SnippetExtractor,
    escalator: Option<LlmEscalator>,
    ledger: Arc<CostLedger>,
    problems: ProblemTracker,
    cancel: Arc<AtomicBool>,
}

impl<G: GeoClient, S: SraClient, P: PubMedClient> Pipeline<G, S, P> {
    pub fn new(config: &HarvestConfig, cache: Arc<CacheStore>, geo: G, sra: S, pubmed: P) -> Self {
        let retry = RetryPolicy::from_settings(&config.retry);
        Self {
            workers: config.workers,
            fetch_full_text: config.fetch_full_text,
            accept_confidence: config.accept_confidence,
            resolver: AccessionResolver::new(geo, cache.clone(), retry),
            sra: SraResolver::new(sra, cache.clone(), retry),
            pubmed: PubMedLinker::new(
                pubmed,
                cache.clone(),
                retry,
                config.publication_similarity_threshold,
            ),
            documents: None,
            extractor: SnippetExtractor::new(config.snippets),
            escalator: None,
            ledger: Arc::new(CostLedger::new()),
            problems: ProblemTracker::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            cache,
            retry,
        }
    }

    pub fn with_documents(mut self, documents: impl DocumentSource + 'static) -> Self {
        self.documents = Some(Box::new(documents));
        self
    }

    pub fn with_models(
        mut self,
        primary: Box<dyn LlmClient>,
        fallback: Option<Box<dyn LlmClient>>,
    ) -> Self {
        self.escalator = Some(LlmEscalator::new(
            primary,
            fallback,
            self.cache.clone(),
            self.retry,
            self.ledger.clone(),
            self.accept_confidence,
        ));
        self
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn ledger(&self) -> &CostLedger {
        &self.ledger
    }

    pub fn run(
        &self,
        inputs: &[String],
        sink: &dyn ProgressSink,
    ) -> Result<BatchReport, PipelineError> {
        let started = Instant::now();
        self.cache.ensure_root()?;

        let mut seen = BTreeSet::new();
        let mut accessions = Vec::new();
        for raw in inputs {
            match raw.parse::<GeoSeriesAccession>() {
                Ok(accession) => {
                    if seen.insert(accession.clone()) {
                        accessions.push(accession);
                    } else {
                        tracing::debug!("{accession}: duplicate input skipped");
                    }
                }
                Err(err) => {
                    tracing::warn!("{err}");
                    self.problems.record(ProblemEntry::new(
                        raw.trim(),
                        "input",
                        ProblemReason::InvalidAccession,
                        err.to_string(),
                    ));
                }
            }
        }

        sink.event(ProgressEvent {
            accession: None,
            message: format!(
                "phase=Resolve; {} accessions on {} workers",
                accessions.len(),
                self.workers
            ),
            elapsed: None,
        });

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|idx| format!("harvest-{idx}"))
            .build()
            .map_err(|err| PipelineError::WorkerPool(err.to_string()))?;
        let outcomes = pool.install(|| {
            accessions
                .par_iter()
                .map(|accession| {
                    let outcome = self.process(accession, sink);
                    self.problems.extend(outcome.problems.iter().cloned());
                    outcome
                })
                .collect::<Vec<_>>()
        });

        let mut records = Vec::new();
        let mut snippets = Vec::new();
        let mut failed = Vec::new();
        let mut order = Vec::new();
        for outcome in outcomes {
            order.push(outcome.accession.clone());
            snippets.extend(outcome.snippets);
            match outcome.record {
                Some(record) => records.push(record),
                None => failed.push(outcome.accession),
            }
        }

        let mut problems = self.problems.snapshot();
        problems.sort_by_key(|problem| {
            order
                .iter()
                .position(|accession| *accession == problem.accession)
                .unwrap_or(usize::MAX)
        });

        let costs = self.ledger.report();
        let summary = BatchSummary {
            requested: inputs.len(),
            records: records.len(),
            failed,
            problems: problems.len(),
            snippets: snippets.len(),
            cache: self.cache.stats(),
            llm_calls: costs.total_calls,
            llm_cost_usd: costs.total_cost_usd,
        };
        sink.event(ProgressEvent {
            accession: None,
            message: format!(
                "phase=Done; {} records, {} problems",
                summary.records, summary.problems
            ),
            elapsed: Some(started.elapsed()),
        });

        Ok(BatchReport {
            records,
            problems,
            snippets,
            costs,
            summary,
        })
    }

    fn process(&self, accession: &GeoSeriesAccession, sink: &dyn ProgressSink) -> AccessionOutcome {
        let acc = accession.as_str();
        if self.cancel.load(Ordering::SeqCst) {
            return AccessionOutcome::failed(
                acc,
                ProblemEntry::new(
                    acc,
                    "pipeline",
                    ProblemReason::Cancelled,
                    "interrupted before start",
                ),
            );
        }
        let started = Instant::now();
        let progress = |message: String| {
            sink.event(ProgressEvent {
                accession: Some(acc.to_string()),
                message,
                elapsed: Some(started.elapsed()),
            })
        };

        let series = match self.resolver.resolve(accession) {
            Ok(series) => series,
            Err(err) => {
                tracing::warn!("{acc}: {err}");
                return AccessionOutcome::failed(
                    acc,
                    ProblemEntry::new(acc, "geo", err.problem_reason(), err.to_string()),
                );
            }
        };
        progress(format!("phase=Geo; {} samples", series.samples.len()));

        let (sra, link) = rayon::join(
            || self.sra.resolve(acc, &series.cross_refs),
            || self.pubmed.link(&series),
        );
        progress("phase=Link; SRA and PubMed resolved".to_string());

        let mut problems = Vec::new();
        problems.extend(sra.problems.iter().cloned());
        problems.extend(link.problems.iter().cloned());

        let mut sources = series_sources(&series);
        if let (true, Some(documents), Some(publication)) =
            (self.fetch_full_text, &self.documents, &link.publication)
        {
            match documents.sections(publication) {
                Ok(extra) => sources.extend(extra),
                Err(err) => {
                    tracing::warn!("{acc}: full text unavailable: {err}");
                    problems.push(ProblemEntry::new(
                        acc,
                        "document",
                        ProblemReason::DocumentUnavailable,
                        err.to_string(),
                    ));
                }
            }
        }

        let mut book = SnippetBook::new(acc);
        let mut aggregator = FieldAggregator::new();
        aggregator.offer_all(derive_native_fields(&series, &mut book));
        let extraction = self
            .extractor
            .extract(&sources, series.has_target_tissue(), &mut book);
        aggregator.offer_all(extraction.fields);

        let pending = ClinicalField::ALL
            .into_iter()
            .filter(ClinicalField::llm_eligible)
            .filter(|field| match aggregator.get(*field) {
                Some(found) => found.confidence.level() == ConfidenceLevel::Low,
                None => true,
            })
            .collect::<Vec<_>>();

        if !pending.is_empty() {
            match &self.escalator {
                Some(escalator) => {
                    let escalation =
                        escalator.escalate(acc, &pending, &extraction.passages, &mut book);
                    for step in &escalation.trace {
                        tracing::trace!("{acc}: {} -> {:?}", step.field, step.state);
                    }
                    aggregator.offer_all(escalation.fields);
                    problems.extend(escalation.problems);
                    progress(format!("phase=Escalate; {} fields pending", pending.len()));
                }
                None => problems.push(ProblemEntry::new(
                    acc,
                    "llm",
                    ProblemReason::EscalationUnavailable,
                    pending
                        .iter()
                        .map(ClinicalField::as_str)
                        .collect::<Vec<_>>()
                        .join(", "),
                )),
            }
        }

        if series.data_type.primary == DataType::Unclassified {
            problems.push(ProblemEntry::new(
                acc,
                "data_type",
                ProblemReason::UnclassifiedDataType,
                "no library strategy, series type or platform rule matched",
            ));
        }
        if !series.has_target_tissue() {
            problems.push(ProblemEntry::new(
                acc,
                "samples",
                ProblemReason::NoTargetTissue,
                "no placental or decidual samples detected",
            ));
        }

        let record = aggregator.finish(series, sra, link, problems.clone());
        progress("phase=Aggregate; record complete".to_string());
        AccessionOutcome {
            accession: acc.to_string(),
            record: Some(record),
            snippets: book.into_snippets(),
            problems,
        }
    }
}
