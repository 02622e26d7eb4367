mod common;

use std::sync::Arc;

use geo_harvester::cost::CostLedger;
use geo_harvester::http::RetryPolicy;
use geo_harvester::llm::{FieldState, LlmClient, LlmEscalator};
use geo_harvester::problems::ProblemReason;
use geo_harvester::record::{ClinicalField, FieldSource, Snippet, SourceSection};
use geo_harvester::snippets::SnippetBook;

use common::{MockLlm, TestEnv, model_reply, test_env};

const ACCESSION: &str = "GSE5001";

struct Harness {
    _env: TestEnv,
    escalator: LlmEscalator,
    primary: Arc<MockLlm>,
    fallback: Arc<MockLlm>,
    ledger: Arc<CostLedger>,
}

fn harness(primary: Option<String>, fallback: Option<String>) -> Harness {
    let env = test_env();
    let primary = Arc::new(MockLlm::primary(primary));
    let fallback = Arc::new(MockLlm::fallback(fallback));
    let ledger = Arc::new(CostLedger::new());
    let escalator = LlmEscalator::new(
        Box::new(primary.clone()) as Box<dyn LlmClient>,
        Some(Box::new(fallback.clone()) as Box<dyn LlmClient>),
        env.cache.clone(),
        RetryPolicy::from_settings(&env.config.retry),
        ledger.clone(),
        env.config.accept_confidence,
    );
    Harness {
        _env: env,
        escalator,
        primary,
        fallback,
        ledger,
    }
}

fn passages(book: &mut SnippetBook) -> Vec<Snippet> {
    let id = book.record(
        SourceSection::SeriesSummary,
        ACCESSION,
        "offset:0",
        "Placentas were sampled in the second trimester from nulliparous women.",
    );
    vec![book.get(&id).unwrap().clone()]
}

#[test]
fn confident_primary_answers_skip_fallback() {
    let reply = model_reply(&[
        ("pregnancy_trimester", Some("2nd"), 0.9, &["second trimester"]),
        ("parity_provided", Some("yes"), 0.85, &["nulliparous women"]),
    ]);
    let h = harness(Some(reply), None);
    let mut book = SnippetBook::new(ACCESSION);
    let passages = passages(&mut book);

    let escalation = h.escalator.escalate(
        ACCESSION,
        &[ClinicalField::PregnancyTrimester, ClinicalField::ParityProvided],
        &passages,
        &mut book,
    );

    assert!(escalation.problems.is_empty());
    assert_eq!(escalation.fields.len(), 2);
    assert!(escalation.fields.iter().all(|f| f.source == FieldSource::LlmPrimary));
    assert_eq!(h.primary.calls(), 1);
    assert_eq!(h.fallback.calls(), 0);

    let trimester = escalation
        .fields
        .iter()
        .find(|f| f.field == ClinicalField::PregnancyTrimester)
        .unwrap();
    assert_eq!(trimester.value, "2nd");
    let quote = book.get(&trimester.evidence[0]).unwrap();
    assert_eq!(quote.section, SourceSection::ModelEvidence);
    assert_eq!(quote.locator, "primary:pregnancy_trimester");
    assert_eq!(quote.text, "second trimester");

    assert_eq!(
        escalation.states(ClinicalField::ParityProvided),
        vec![
            FieldState::Unresolved,
            FieldState::PrimaryQueried,
            FieldState::Resolved
        ]
    );
}

#[test]
fn weak_primary_answers_go_to_fallback() {
    let primary = model_reply(&[
        ("pregnancy_trimester", Some("2nd"), 0.4, &["second trimester"]),
        ("parity_provided", Some("yes"), 0.9, &["nulliparous women"]),
    ]);
    let fallback = model_reply(&[(
        "pregnancy_trimester",
        Some("2nd"),
        0.95,
        &["second trimester"],
    )]);
    let h = harness(Some(primary), Some(fallback));
    let mut book = SnippetBook::new(ACCESSION);
    let passages = passages(&mut book);

    let escalation = h.escalator.escalate(
        ACCESSION,
        &[ClinicalField::PregnancyTrimester, ClinicalField::ParityProvided],
        &passages,
        &mut book,
    );

    assert!(escalation.problems.is_empty());
    assert_eq!(h.primary.calls(), 1);
    assert_eq!(h.fallback.calls(), 1);
    let fallback_prompt = &h.fallback.prompts()[0];
    assert!(fallback_prompt.contains("- pregnancy_trimester:"));
    assert!(!fallback_prompt.contains("- parity_provided:"));

    let trimester = escalation
        .fields
        .iter()
        .find(|f| f.field == ClinicalField::PregnancyTrimester)
        .unwrap();
    assert_eq!(trimester.source, FieldSource::LlmFallback);
    assert_eq!(
        escalation.states(ClinicalField::PregnancyTrimester),
        vec![
            FieldState::Unresolved,
            FieldState::PrimaryQueried,
            FieldState::FallbackQueried,
            FieldState::Resolved
        ]
    );
}

#[test]
fn unresolved_after_fallback_is_reported_per_field() {
    let weak = model_reply(&[("gravidity_provided", Some("yes"), 0.2, &["women"])]);
    let h = harness(Some(weak.clone()), Some(weak));
    let mut book = SnippetBook::new(ACCESSION);
    let passages = passages(&mut book);

    let escalation = h.escalator.escalate(
        ACCESSION,
        &[ClinicalField::GravidityProvided],
        &passages,
        &mut book,
    );

    assert!(escalation.fields.is_empty());
    assert_eq!(escalation.problems.len(), 1);
    let problem = &escalation.problems[0];
    assert_eq!(problem.reason, ProblemReason::LowConfidenceAfterFallback);
    assert_eq!(problem.scope, "gravidity_provided");
    assert_eq!(
        escalation.states(ClinicalField::GravidityProvided).last(),
        Some(&FieldState::UnresolvedFinal)
    );
}

#[test]
fn provider_errors_become_problems() {
    let h = harness(None, None);
    let mut book = SnippetBook::new(ACCESSION);
    let passages = passages(&mut book);

    let escalation = h.escalator.escalate(
        ACCESSION,
        &[ClinicalField::ParityProvided],
        &passages,
        &mut book,
    );

    assert_eq!(escalation.problems.len(), 1);
    assert_eq!(escalation.problems[0].reason, ProblemReason::ProviderError);
    assert_eq!(h.primary.calls(), 1);
    assert_eq!(h.fallback.calls(), 1);

    let report = h.ledger.report();
    assert_eq!(report.total_calls, 2);
    assert_eq!(report.total_cost_usd, 0.0);
    assert!(report.models.values().all(|usage| usage.failed_calls == 1));
}

#[test]
fn failed_primary_still_tries_fallback() {
    let fallback = model_reply(&[("parity_provided", Some("no"), 0.9, &["nulliparous women"])]);
    let h = harness(None, Some(fallback));
    let mut book = SnippetBook::new(ACCESSION);
    let passages = passages(&mut book);

    let escalation = h.escalator.escalate(
        ACCESSION,
        &[ClinicalField::ParityProvided],
        &passages,
        &mut book,
    );
    assert!(escalation.problems.is_empty());
    assert_eq!(escalation.fields[0].value, "no");
    assert_eq!(escalation.fields[0].source, FieldSource::LlmFallback);
}

#[test]
fn completions_are_cached() {
    let reply = model_reply(&[("parity_provided", Some("yes"), 0.9, &["nulliparous women"])]);
    let h = harness(Some(reply), None);

    for _ in 0..2 {
        let mut book = SnippetBook::new(ACCESSION);
        let passages = passages(&mut book);
        let escalation = h.escalator.escalate(
            ACCESSION,
            &[ClinicalField::ParityProvided],
            &passages,
            &mut book,
        );
        assert_eq!(escalation.fields.len(), 1);
    }
    assert_eq!(h.primary.calls(), 1);
    let report = h.ledger.report();
    assert_eq!(report.total_calls, 1);
    assert!((report.total_cost_usd - 0.0006).abs() < 1e-9);
}

#[test]
fn nothing_to_read_means_no_calls_but_reports_each_field() {
    let h = harness(Some(model_reply(&[])), None);
    let mut book = SnippetBook::new(ACCESSION);
    let escalation = h.escalator.escalate(
        ACCESSION,
        &[ClinicalField::ParityProvided, ClinicalField::SamplingSite],
        &[],
        &mut book,
    );
    assert_eq!(h.primary.calls(), 0);
    assert_eq!(escalation.problems.len(), 1);
    let problem = &escalation.problems[0];
    assert_eq!(problem.reason, ProblemReason::NoEvidence);
    assert_eq!(problem.scope, "parity_provided");
    assert_eq!(problem.accession, ACCESSION);
    assert_eq!(
        escalation.states(ClinicalField::ParityProvided),
        vec![FieldState::Unresolved, FieldState::UnresolvedFinal]
    );
    assert!(escalation.states(ClinicalField::SamplingSite).is_empty());
}

#[test]
fn weak_answer_without_fallback_is_primary_only() {
    let env = test_env();
    let weak = model_reply(&[("gravidity_provided", Some("yes"), 0.2, &["women"])]);
    let primary = Arc::new(MockLlm::primary(Some(weak)));
    let escalator = LlmEscalator::new(
        Box::new(primary.clone()) as Box<dyn LlmClient>,
        None,
        env.cache.clone(),
        RetryPolicy::from_settings(&env.config.retry),
        Arc::new(CostLedger::new()),
        env.config.accept_confidence,
    );
    let mut book = SnippetBook::new(ACCESSION);
    let passages = passages(&mut book);

    let escalation = escalator.escalate(
        ACCESSION,
        &[ClinicalField::GravidityProvided],
        &passages,
        &mut book,
    );

    assert_eq!(primary.calls(), 1);
    assert_eq!(escalation.problems.len(), 1);
    let problem = &escalation.problems[0];
    assert_eq!(problem.reason, ProblemReason::LowConfidence);
    assert!(problem.note.ends_with("(primary only)"));
    assert!(!escalation
        .states(ClinicalField::GravidityProvided)
        .contains(&FieldState::FallbackQueried));
}
