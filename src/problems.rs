use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemReason {
    InvalidAccession,
    NotFound,
    TransientFetch,
    UnparseableRecord,
    AmbiguousSraStudy,
    NoConfidentPublicationMatch,
    MissingAuthor,
    LowConfidence,
    LowConfidenceAfterFallback,
    NoEvidence,
    ProviderError,
    EscalationUnavailable,
    UnclassifiedDataType,
    NoTargetTissue,
    DocumentUnavailable,
    StageFailed,
    Cancelled,
}

impl ProblemReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemReason::InvalidAccession => "invalid_accession",
            ProblemReason::NotFound => "not_found",
            ProblemReason::TransientFetch => "transient_fetch",
            ProblemReason::UnparseableRecord => "unparseable_record",
            ProblemReason::AmbiguousSraStudy => "ambiguous_sra_study",
            ProblemReason::NoConfidentPublicationMatch => "no_confident_publication_match",
            ProblemReason::MissingAuthor => "missing_author",
            ProblemReason::LowConfidence => "low_confidence",
            ProblemReason::LowConfidenceAfterFallback => "low_confidence_after_fallback",
            ProblemReason::NoEvidence => "no_evidence",
            ProblemReason::ProviderError => "provider_error",
            ProblemReason::EscalationUnavailable => "escalation_unavailable",
            ProblemReason::UnclassifiedDataType => "unclassified_data_type",
            ProblemReason::NoTargetTissue => "no_target_tissue",
            ProblemReason::DocumentUnavailable => "document_unavailable",
            ProblemReason::StageFailed => "stage_failed",
            ProblemReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ProblemReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One "needs follow-up" item. `scope` is either a stage name (`geo`, `sra`,
/// `pubmed`, ...) or a clinical field name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemEntry {
    pub accession: String,
    pub scope: String,
    pub reason: ProblemReason,
    pub note: String,
}

impl ProblemEntry {
    pub fn new(
        accession: impl Into<String>,
        scope: impl Into<String>,
        reason: ProblemReason,
        note: impl Into<String>,
    ) -> Self {
        Self {
            accession: accession.into(),
            scope: scope.into(),
            reason,
            note: note.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ProblemTracker {
    entries: Mutex<Vec<ProblemEntry>>,
}

impl ProblemTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: ProblemEntry) {
        tracing::debug!(
            accession = %entry.accession,
            scope = %entry.scope,
            reason = %entry.reason,
            "problem recorded"
        );
        self.entries.lock().push(entry);
    }

    pub fn extend(&self, entries: impl IntoIterator<Item = ProblemEntry>) {
        let mut guard = self.entries.lock();
        guard.extend(entries);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ProblemEntry> {
        self.entries.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_keeps_duplicates() {
        let tracker = ProblemTracker::new();
        let entry = ProblemEntry::new("GSE1", "sra", ProblemReason::NotFound, "SRX1");
        tracker.record(entry.clone());
        tracker.record(entry);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn reason_serializes_snake_case() {
        let json = serde_json::to_string(&ProblemReason::NoConfidentPublicationMatch).unwrap();
        assert_eq!(json, "\"no_confident_publication_match\"");
    }
}
