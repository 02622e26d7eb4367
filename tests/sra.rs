mod common;

use std::sync::Arc;

use geo_harvester::domain::{CrossRefKind, CrossReference};
use geo_harvester::http::RetryPolicy;
use geo_harvester::problems::ProblemReason;
use geo_harvester::sra::SraResolver;

use common::{MockSra, test_env};

fn resolver(sra: Arc<MockSra>, env: &common::TestEnv) -> SraResolver<Arc<MockSra>> {
    SraResolver::new(
        sra,
        env.cache.clone(),
        RetryPolicy::from_settings(&env.config.retry),
    )
}

fn experiment(id: &str) -> CrossReference {
    CrossReference::new(CrossRefKind::SraExperiment, id)
}

#[test]
fn series_without_sra_refs_has_no_studies() {
    let env = test_env();
    let sra = Arc::new(MockSra::default());
    let resolution = resolver(sra.clone(), &env).resolve(
        "GSE2001",
        &[CrossReference::new(CrossRefKind::PubMed, "1")],
    );
    assert_eq!(resolution.study_ids, None);
    assert!(resolution.problems.is_empty());
    assert_eq!(sra.calls(), 0);
}

#[test]
fn runs_in_two_studies_are_flagged() {
    let env = test_env();
    let sra = Arc::new(
        MockSra::default()
            .with("SRX1", "SRP100")
            .with("SRX2", "SRP200"),
    );
    let resolution =
        resolver(sra.clone(), &env).resolve("GSE2002", &[experiment("SRX1"), experiment("SRX2")]);

    let studies = resolution.study_ids.unwrap();
    assert_eq!(
        studies.into_iter().collect::<Vec<_>>(),
        vec!["SRP100".to_string(), "SRP200".to_string()]
    );
    assert_eq!(resolution.problems.len(), 1);
    assert_eq!(resolution.problems[0].reason, ProblemReason::AmbiguousSraStudy);
    assert_eq!(resolution.problems[0].scope, "sra_study_ids");
}

#[test]
fn direct_study_refs_need_no_lookup() {
    let env = test_env();
    let sra = Arc::new(MockSra::default());
    let resolution = resolver(sra.clone(), &env).resolve(
        "GSE2003",
        &[CrossReference::new(CrossRefKind::SraStudy, "SRP300")],
    );
    assert_eq!(
        resolution.study_ids.unwrap().into_iter().collect::<Vec<_>>(),
        vec!["SRP300".to_string()]
    );
    assert_eq!(sra.calls(), 0);
}

#[test]
fn lookups_are_cached_but_empty_answers_are_not() {
    let env = test_env();
    let sra = Arc::new(MockSra::default().with("SRX10", "SRP10"));
    let resolver = resolver(sra.clone(), &env);

    resolver.resolve("GSE2004", &[experiment("SRX10")]);
    resolver.resolve("GSE2004", &[experiment("SRX10")]);
    assert_eq!(sra.calls(), 1);

    let missing = resolver.resolve("GSE2005", &[experiment("SRX11")]);
    assert_eq!(missing.study_ids, None);
    assert_eq!(missing.problems[0].reason, ProblemReason::NotFound);
    resolver.resolve("GSE2005", &[experiment("SRX11")]);
    assert_eq!(sra.calls(), 3);
}
