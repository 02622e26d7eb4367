use geo_harvester::config::SnippetSettings;
use geo_harvester::record::{ClinicalField, Confidence, FieldSource, SourceSection};
use geo_harvester::snippets::{
    DEFAULT_SAMPLING_SITE, Extraction, SnippetBook, SnippetExtractor, TextSource,
};

fn summary(text: &str) -> Vec<TextSource> {
    vec![TextSource::new(SourceSection::SeriesSummary, "GSE4001", text)]
}

fn extract(sources: &[TextSource], placental: bool) -> (Extraction, SnippetBook) {
    let mut book = SnippetBook::new("GSE4001");
    let extraction =
        SnippetExtractor::new(SnippetSettings::default()).extract(sources, placental, &mut book);
    (extraction, book)
}

#[test]
fn trimester_and_delivery_age() {
    let (extraction, _) = extract(
        &summary(
            "Participants were in the 1st trimester with gestational age at delivery 39 weeks.",
        ),
        false,
    );
    assert_eq!(extraction.value(ClinicalField::PregnancyTrimester), Some("1st"));
    assert_eq!(extraction.value(ClinicalField::GaAtDeliveryWeeks), Some("39"));
    assert_eq!(extraction.value(ClinicalField::GaAtDeliveryProvided), Some("yes"));
    assert_eq!(extraction.value(ClinicalField::GaAtCollectionWeeks), None);
}

#[test]
fn collection_age_and_birthweight() {
    let (extraction, _) = extract(
        &summary("Gestational age at collection was 12 weeks and birth weight 3500 g."),
        false,
    );
    assert_eq!(extraction.value(ClinicalField::GaAtCollectionWeeks), Some("12"));
    assert_eq!(extraction.value(ClinicalField::GaAtDeliveryWeeks), None);
    assert_eq!(extraction.value(ClinicalField::BirthweightProvided), Some("yes"));
}

#[test]
fn complications_are_listed() {
    let (extraction, _) = extract(
        &summary("Participants with preeclampsia and IUGR were included."),
        false,
    );
    assert_eq!(
        extraction.value(ClinicalField::PregnancyComplicationsList),
        Some("preeclampsia")
    );
    assert_eq!(
        extraction.value(ClinicalField::SamplesFromPregnancyComplicationsCollected),
        Some("yes")
    );
    assert_eq!(extraction.value(ClinicalField::FetalComplications), Some("iugr"));
    assert_eq!(extraction.value(ClinicalField::FetalComplicationsListed), Some("yes"));
}

#[test]
fn placental_samples_default_the_sampling_site() {
    let sources = summary("Bulk RNA-seq of tissue.");
    let (extraction, _) = extract(&sources, true);
    let site = extraction.field(ClinicalField::SamplingSite).unwrap();
    assert_eq!(site.value, DEFAULT_SAMPLING_SITE);
    assert_eq!(site.confidence, Confidence::MEDIUM);
    assert!(site.evidence.is_empty());

    let (extraction, _) = extract(&sources, false);
    assert_eq!(extraction.value(ClinicalField::SamplingSite), None);
}

#[test]
fn explicit_site_beats_default() {
    let (extraction, _) = extract(&summary("RNA was isolated from chorionic villi."), true);
    let site = extraction.field(ClinicalField::SamplingSite).unwrap();
    assert_eq!(site.value, "chorionic villi");
    assert_eq!(site.confidence, Confidence::HIGH);
}

#[test]
fn first_source_wins() {
    let sources = vec![
        TextSource::new(
            SourceSection::SeriesSummary,
            "GSE4001",
            "Samples from the 3rd trimester.",
        ),
        TextSource::new(
            SourceSection::SampleCharacteristics,
            "GSM1",
            "stage: 2nd trimester",
        ),
    ];
    let (extraction, _) = extract(&sources, false);
    assert_eq!(extraction.value(ClinicalField::PregnancyTrimester), Some("3rd"));
}

#[test]
fn evidence_points_at_recorded_snippets() {
    let sources = summary(
        "Placentas were collected at Mount Sinai Hospital, Toronto, Canada. Maternal age was recorded.",
    );
    let (extraction, book) = extract(&sources, false);
    let hospital = extraction.field(ClinicalField::HospitalCenter).unwrap();
    assert_eq!(hospital.value, "Mount Sinai Hospital, Toronto, Canada");
    assert_eq!(hospital.source, FieldSource::Regex);
    assert_eq!(extraction.value(ClinicalField::CountryOfCollection), Some("Canada"));
    assert_eq!(
        extraction.value(ClinicalField::MaternalAgeAtCollectionProvided),
        Some("yes")
    );

    for field in &extraction.fields {
        for id in &field.evidence {
            let snippet = book.get(id).unwrap();
            assert_eq!(snippet.accession, "GSE4001");
            assert!(id.starts_with("GSE4001:series_summary:"));
        }
    }
    let span = book.get(&hospital.evidence[0]).unwrap();
    assert_eq!(span.locator, "offset:15");
    assert!(span.text.starts_with("collected at Mount Sinai"));
}

#[test]
fn passages_are_bounded_and_recorded() {
    let text = "Gestational age at delivery was recorded. ".repeat(100);
    let sources = summary(&text);
    let settings = SnippetSettings {
        window_chars: 200,
        window_step: 100,
        max_snippets_per_field: 2,
    };
    let mut book = SnippetBook::new("GSE4001");
    let passages = SnippetExtractor::new(settings).passages(&sources, &mut book);
    assert!(!passages.is_empty());
    assert!(passages.iter().all(|passage| passage.text.chars().count() <= 200));
    for passage in &passages {
        assert_eq!(book.get(&passage.id), Some(passage));
    }
}
