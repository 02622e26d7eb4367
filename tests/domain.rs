use assert_matches::assert_matches;

use geo_harvester::domain::{CrossRefKind, CrossReference, GeoSeriesAccession};
use geo_harvester::error::PipelineError;

#[test]
fn parse_series_accession_valid() {
    let acc: GeoSeriesAccession = " gse00102902 ".parse().unwrap();
    assert_eq!(acc.as_str(), "GSE102902");
}

#[test]
fn parse_series_accession_invalid() {
    for raw in ["GSEX001", "GSM123", "GSE", "GSE000", "12345"] {
        let err = raw.parse::<GeoSeriesAccession>().unwrap_err();
        assert_matches!(err, PipelineError::InvalidAccession(_));
    }
}

#[test]
fn cross_references_by_prefix() {
    assert_eq!(
        CrossReference::classify("SRR014966").map(|r| r.kind),
        Some(CrossRefKind::SraRun)
    );
    assert_eq!(
        CrossReference::classify("ERP000001").map(|r| r.kind),
        Some(CrossRefKind::SraStudy)
    );
    assert!(CrossReference::new(CrossRefKind::SraExperiment, "SRX1").is_sra_lookup());
    assert!(!CrossReference::new(CrossRefKind::SraStudy, "SRP1").is_sra_lookup());
}
