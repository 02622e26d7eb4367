use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::{CacheKey, CacheStore};
use crate::cost::CostLedger;
use crate::domain::EntityKind;
use crate::error::PipelineError;
use crate::http::RetryPolicy;
use crate::llm::client::LlmClient;
use crate::problems::{ProblemEntry, ProblemReason};
use crate::record::{
    ClinicalField, Confidence, ExtractedField, FieldSource, Snippet, SourceSection,
};
use crate::snippets::SnippetBook;
use crate::text::{clean_text, normalize_quotes};

pub const SYSTEM_PROMPT: &str =
    "You are a careful information extractor. Use ONLY the provided snippets. Reply with one JSON object.";

/// Ceiling applied to an answer that quotes no evidence.
pub const UNQUOTED_CONFIDENCE_CAP: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Primary,
    Fallback,
}

impl Tier {
    pub fn source(&self) -> FieldSource {
        match self {
            Tier::Primary => FieldSource::LlmPrimary,
            Tier::Fallback => FieldSource::LlmFallback,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Primary => "primary",
            Tier::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldState {
    Unresolved,
    PrimaryQueried,
    FallbackQueried,
    Resolved,
    UnresolvedFinal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub field: ClinicalField,
    pub state: FieldState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelAnswer {
    pub value: Option<String>,
    pub confidence: Confidence,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Escalation {
    pub fields: Vec<ExtractedField>,
    pub problems: Vec<ProblemEntry>,
    pub trace: Vec<Transition>,
}

impl Escalation {
    pub fn states(&self, field: ClinicalField) -> Vec<FieldState> {
        self.trace
            .iter()
            .filter(|step| step.field == field)
            .map(|step| step.state)
            .collect()
    }
}

pub fn build_prompt(fields: &[ClinicalField], passages: &[Snippet]) -> String {
    let schema = fields
        .iter()
        .map(|field| format!("- {}: {}", field.as_str(), field.description()))
        .collect::<Vec<_>>()
        .join("\n");
    let excerpts = passages
        .iter()
        .enumerate()
        .map(|(idx, passage)| {
            format!(
                "--- SNIPPET {} (locator: {} | section: {}) ---\n{}",
                idx + 1,
                passage.locator,
                passage.label,
                passage.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "TASK: Fill the following fields strictly from the excerpts.\n\
         Answer as {{\"fields\": {{\"<name>\": {{\"value\": string or null, \
         \"confidence\": number between 0 and 1, \"evidence\": [verbatim quotes]}}}}}}.\n\
         Yes/no fields take \"yes\" or \"no\". Use null when the excerpts do not say.\n\
         FIELDS:\n{schema}\nEXCERPTS:\n{excerpts}"
    )
}

fn json_object_slice(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(text) => clean_text(text),
        Value::Bool(flag) => if *flag { "yes" } else { "no" }.to_string(),
        Value::Number(number) => match number.as_f64() {
            Some(float) if float.fract() == 0.0 => format!("{}", float as i64),
            _ => number.to_string(),
        },
        Value::Array(items) => {
            let mut parts = items
                .iter()
                .filter_map(value_text)
                .map(|part| part.to_lowercase())
                .collect::<Vec<_>>();
            parts.sort();
            parts.dedup();
            parts.join(", ")
        }
        Value::Object(_) => return None,
    };
    let lowered = text.to_lowercase();
    if text.is_empty() || matches!(lowered.as_str(), "null" | "none" | "unknown" | "n/a") {
        None
    } else {
        Some(text)
    }
}

fn yes_no(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_lowercase())
        .filter(|value| value == "yes" || value == "no")
}

/// Parses `{"fields": {name: {value, confidence, evidence}}}`. Unknown field
/// names are ignored; presence flags that are not yes/no become null.
pub fn parse_answers(text: &str) -> Result<BTreeMap<ClinicalField, ModelAnswer>, PipelineError> {
    let root: Value =
        serde_json::from_str(json_object_slice(text)).map_err(|err| PipelineError::Parse {
            what: "model response".to_string(),
            message: err.to_string(),
        })?;
    let fields = root
        .get("fields")
        .and_then(Value::as_object)
        .ok_or_else(|| PipelineError::Parse {
            what: "model response".to_string(),
            message: "missing \"fields\" object".to_string(),
        })?;

    let mut answers = BTreeMap::new();
    for (name, answer) in fields {
        let Some(field) = ClinicalField::from_name(name) else {
            tracing::debug!("ignoring unknown field {name} in model response");
            continue;
        };
        let mut value = answer.get("value").and_then(value_text);
        if field.is_yes_no() {
            value = yes_no(value);
        }
        let evidence = answer
            .get("evidence")
            .and_then(Value::as_array)
            .map(|quotes| {
                quotes
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|quote| normalize_quotes(quote.trim()))
                    .filter(|quote| !quote.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let mut score = answer
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        if evidence.is_empty() {
            score = score.min(UNQUOTED_CONFIDENCE_CAP);
        }
        answers.insert(
            field,
            ModelAnswer {
                value,
                confidence: Confidence::new(score),
                evidence,
            },
        );
    }
    Ok(answers)
}

pub struct LlmEscalator {
    primary: Box<dyn LlmClient>,
    fallback: Option<Box<dyn LlmClient>>,
    cache: Arc<CacheStore>,
    retry: RetryPolicy,
    ledger: Arc<CostLedger>,
    accept_confidence: f64,
}

impl LlmEscalator {
    pub fn new(
        primary: Box<dyn LlmClient>,
        fallback: Option<Box<dyn LlmClient>>,
        cache: Arc<CacheStore>,
        retry: RetryPolicy,
        ledger: Arc<CostLedger>,
        accept_confidence: f64,
    ) -> Self {
        Self {
            primary,
            fallback,
            cache,
            retry,
            ledger,
            accept_confidence,
        }
    }

    pub fn cache_key(accession: &str, client: &dyn LlmClient, user_prompt: &str) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(SYSTEM_PROMPT.as_bytes());
        hasher.update(b"\n");
        hasher.update(user_prompt.as_bytes());
        let prompt_hash = hex::encode(hasher.finalize());
        let settings = client.settings();
        CacheKey::with_params(
            EntityKind::LlmCompletion,
            accession,
            &[
                ("provider", settings.provider.as_str()),
                ("model", &settings.model),
                ("prompt_sha256", &prompt_hash),
            ],
        )
    }

    /// Walks each pending field through primary then fallback tiers. Fields are
    /// batched into one query per tier; provider failures never escape.
    pub fn escalate(
        &self,
        accession: &str,
        pending: &[ClinicalField],
        passages: &[Snippet],
        book: &mut SnippetBook,
    ) -> Escalation {
        let mut outcome = Escalation::default();
        let mut open = pending
            .iter()
            .copied()
            .filter(ClinicalField::llm_eligible)
            .collect::<Vec<_>>();
        open.sort();
        open.dedup();
        if open.is_empty() {
            return outcome;
        }
        for field in &open {
            outcome.trace.push(Transition {
                field: *field,
                state: FieldState::Unresolved,
            });
        }
        if passages.is_empty() {
            tracing::debug!("{accession}: no passages for model tiers");
            for field in open {
                outcome.trace.push(Transition {
                    field,
                    state: FieldState::UnresolvedFinal,
                });
                outcome.problems.push(ProblemEntry::new(
                    accession,
                    field.as_str(),
                    ProblemReason::NoEvidence,
                    "no passage mentions this field; models not queried",
                ));
            }
            return outcome;
        }

        let tiers = std::iter::once((Tier::Primary, &*self.primary))
            .chain(self.fallback.as_deref().map(|client| (Tier::Fallback, client)));
        let mut last_failure: Option<PipelineError> = None;
        let mut last_scores = BTreeMap::<ClinicalField, f64>::new();

        for (tier, client) in tiers {
            if open.is_empty() {
                break;
            }
            let queried = match tier {
                Tier::Primary => FieldState::PrimaryQueried,
                Tier::Fallback => FieldState::FallbackQueried,
            };
            for field in &open {
                outcome.trace.push(Transition {
                    field: *field,
                    state: queried,
                });
            }

            let answers = match self.query(accession, client, &open, passages) {
                Ok(answers) => {
                    last_failure = None;
                    answers
                }
                Err(err) => {
                    tracing::warn!(
                        "{accession}: {} tier ({}) failed: {err}",
                        tier.as_str(),
                        client.settings().key()
                    );
                    last_failure = Some(err);
                    continue;
                }
            };

            let mut still_open = Vec::new();
            for field in open {
                let accepted = answers.get(&field).and_then(|answer| {
                    last_scores.insert(field, answer.confidence.score());
                    let value = answer.value.as_ref()?;
                    (answer.confidence.score() >= self.accept_confidence)
                        .then(|| (value.clone(), answer))
                });
                match accepted {
                    Some((value, answer)) => {
                        let evidence = answer
                            .evidence
                            .iter()
                            .map(|quote| {
                                book.record(
                                    SourceSection::ModelEvidence,
                                    &client.settings().key(),
                                    &format!("{}:{}", tier.as_str(), field.as_str()),
                                    quote,
                                )
                            })
                            .collect();
                        outcome.fields.push(ExtractedField {
                            field,
                            value,
                            confidence: answer.confidence,
                            evidence,
                            source: tier.source(),
                        });
                        outcome.trace.push(Transition {
                            field,
                            state: FieldState::Resolved,
                        });
                    }
                    None => still_open.push(field),
                }
            }
            open = still_open;
        }

        let tier_note = match self.fallback {
            Some(_) => "",
            None => " (primary only)",
        };
        for field in open {
            outcome.trace.push(Transition {
                field,
                state: FieldState::UnresolvedFinal,
            });
            let problem = match &last_failure {
                Some(err) => ProblemEntry::new(
                    accession,
                    field.as_str(),
                    ProblemReason::ProviderError,
                    err.to_string(),
                ),
                None => ProblemEntry::new(
                    accession,
                    field.as_str(),
                    match self.fallback {
                        Some(_) => ProblemReason::LowConfidenceAfterFallback,
                        None => ProblemReason::LowConfidence,
                    },
                    match last_scores.get(&field) {
                        Some(score) => format!(
                            "best model confidence {score:.2} below {:.2}{tier_note}",
                            self.accept_confidence
                        ),
                        None => format!("no model answer{tier_note}"),
                    },
                ),
            };
            outcome.problems.push(problem);
        }
        outcome
    }

    fn query(
        &self,
        accession: &str,
        client: &dyn LlmClient,
        fields: &[ClinicalField],
        passages: &[Snippet],
    ) -> Result<BTreeMap<ClinicalField, ModelAnswer>, PipelineError> {
        let user_prompt = build_prompt(fields, passages);
        let settings = client.settings();
        let text = self.cache.fetch_validated(
            &Self::cache_key(accession, client, &user_prompt),
            || {
                self.retry.run(settings.provider.as_str(), || {
                    match client.complete(SYSTEM_PROMPT, &user_prompt) {
                        Ok(completion) => {
                            self.ledger.record(settings, completion.usage);
                            Ok(completion.text)
                        }
                        Err(err) => {
                            self.ledger.record_failure(settings);
                            Err(err)
                        }
                    }
                })
            },
            |text| parse_answers(text).is_ok(),
        )?;
        parse_answers(&text)
    }
}
