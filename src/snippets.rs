use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::config::SnippetSettings;
use crate::geo::ResolvedSeries;
use crate::record::{
    ClinicalField, Confidence, ExtractedField, FieldSource, Snippet, SourceSection,
};
use crate::text::{clean_text, sliding_window, truncate, unique_preserve_order};

/// One block of text the extractor may read, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSource {
    pub section: SourceSection,
    pub label: String,
    pub text: String,
}

impl TextSource {
    pub fn new(section: SourceSection, label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            section,
            label: label.into(),
            text: text.into(),
        }
    }
}

/// GEO-native text of a series: title, summary, design, then per-sample
/// characteristics and descriptions. Identical sample texts are kept once.
pub fn series_sources(series: &ResolvedSeries) -> Vec<TextSource> {
    let accession = series.accession.as_str();
    let mut sources = vec![TextSource::new(
        SourceSection::SeriesTitle,
        accession,
        series.title.clone(),
    )];
    if let Some(summary) = &series.summary {
        sources.push(TextSource::new(SourceSection::SeriesSummary, accession, summary.clone()));
    }
    if let Some(design) = &series.overall_design {
        sources.push(TextSource::new(SourceSection::OverallDesign, accession, design.clone()));
    }

    let mut seen = BTreeSet::new();
    for sample in &series.samples {
        let characteristics = sample
            .characteristics
            .iter()
            .map(|c| {
                if c.tag.is_empty() {
                    c.value.clone()
                } else {
                    format!("{}: {}", c.tag, c.value)
                }
            })
            .collect::<Vec<_>>()
            .join("; ");
        if !characteristics.is_empty()
            && seen.insert((
                SourceSection::SampleCharacteristics,
                characteristics.to_lowercase(),
            ))
        {
            sources.push(TextSource::new(
                SourceSection::SampleCharacteristics,
                sample.accession.clone(),
                characteristics,
            ));
        }
    }
    for sample in &series.samples {
        let description = unique_preserve_order(
            sample
                .description
                .iter()
                .chain(sample.protocols.iter())
                .map(String::as_str),
        )
        .join(" ");
        if !description.is_empty()
            && seen.insert((SourceSection::SampleDescription, description.to_lowercase()))
        {
            sources.push(TextSource::new(
                SourceSection::SampleDescription,
                sample.accession.clone(),
                description,
            ));
        }
    }
    sources
}

/// Append-only snippet store for one accession. Ids are `{accession}:{section}:{n}`
/// with `n` counting per section, so a fixed input order gives fixed ids.
#[derive(Debug, Clone)]
pub struct SnippetBook {
    accession: String,
    counters: BTreeMap<SourceSection, usize>,
    snippets: Vec<Snippet>,
}

impl SnippetBook {
    pub fn new(accession: impl Into<String>) -> Self {
        Self {
            accession: accession.into(),
            counters: BTreeMap::new(),
            snippets: Vec::new(),
        }
    }

    pub fn record(
        &mut self,
        section: SourceSection,
        label: &str,
        locator: &str,
        text: &str,
    ) -> String {
        let text = clean_text(text);
        if let Some(existing) = self.snippets.iter().find(|snippet| {
            snippet.section == section
                && snippet.label == label
                && snippet.locator == locator
                && snippet.text == text
        }) {
            return existing.id.clone();
        }
        let counter = self.counters.entry(section).or_insert(0);
        *counter += 1;
        let id = format!("{}:{}:{}", self.accession, section.as_str(), counter);
        self.snippets.push(Snippet {
            id: id.clone(),
            accession: self.accession.clone(),
            section,
            label: label.to_string(),
            locator: locator.to_string(),
            text,
        });
        id
    }

    pub fn get(&self, id: &str) -> Option<&Snippet> {
        self.snippets.iter().find(|snippet| snippet.id == id)
    }

    pub fn snippets(&self) -> &[Snippet] {
        &self.snippets
    }

    pub fn into_snippets(self) -> Vec<Snippet> {
        self.snippets
    }
}

fn ci(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){pattern}")).unwrap()
}

static TRIMESTER_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (ci(r"\b(?:1st|first)\s+trimester\b"), "1st"),
        (ci(r"\b(?:2nd|second)\s+trimester\b"), "2nd"),
        (ci(r"\b(?:3rd|third)\s+trimester\b"), "3rd"),
        (ci(r"\bterm\b"), "term"),
        (ci(r"\b(?:preterm|premature)\b"), "premature"),
    ]
});

static GA_DELIVERY_RE: LazyLock<Regex> = LazyLock::new(|| {
    ci(r"gestational\s+age[^.\n]{0,60}(?:delivery|birth)[^0-9]{0,20}(\d{2,3})\s*(?:weeks|wk)")
});
static GA_COLLECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    ci(r"gestational\s+age[^.\n]{0,60}(?:collection|sampling)[^0-9]{0,20}(\d{2,3})\s*(?:weeks|wk)")
});
static BIRTHWEIGHT_RE: LazyLock<Regex> =
    LazyLock::new(|| ci(r"birth[ -]?weight[^0-9]{0,40}(?:\d{3,4}\s*g|\d\.\d\s*kg)"));

/// Presence flags in evaluation order. Keyword lists are folded into the
/// same alternation so each hit carries its own matched span.
static PRESENCE_PATTERNS: LazyLock<Vec<(ClinicalField, Regex)>> = LazyLock::new(|| {
    vec![
        (ClinicalField::SexOfOffspringProvided, ci(r"\bsex\b")),
        (ClinicalField::ParityProvided, ci(r"\bparity\b")),
        (ClinicalField::GravidityProvided, ci(r"\b(?:gravidity|gravida)\b")),
        (
            ClinicalField::NumOffspringPerPregnancyProvided,
            ci(r"\b(?:singletons?|twins?|triplets?|multiple|fetuses)\b"),
        ),
        (
            ClinicalField::RaceEthnicityProvided,
            ci(r"\b(?:race|ethnicity|self-reported|hispanic|white|black|asian)\b"),
        ),
        (
            ClinicalField::GeneticAncestryOrStrainProvided,
            ci(r"\b(?:ancestry|strain|c57\w*|european|african|admixed)\b"),
        ),
        (ClinicalField::MaternalHeightProvided, ci(r"maternal\s+height")),
        (
            ClinicalField::MaternalPrepregWeightProvided,
            ci(r"pre-?pregnancy\s+weight|maternal\s+weight"),
        ),
        (ClinicalField::PaternalHeightProvided, ci(r"paternal\s+height")),
        (ClinicalField::PaternalWeightProvided, ci(r"paternal\s+weight")),
        (ClinicalField::MaternalAgeAtCollectionProvided, ci(r"maternal\s+age")),
        (ClinicalField::PaternalAgeAtCollectionProvided, ci(r"paternal\s+age")),
        (
            ClinicalField::ModeOfDeliveryProvided,
            ci(r"cesarean|caesarean|c-section|vaginal"),
        ),
    ]
});

pub(crate) static PREGNANCY_COMPLICATIONS: LazyLock<Vec<(&'static str, Regex)>> =
    LazyLock::new(|| {
        vec![
            ("preeclampsia", ci(r"pre-?eclampsia")),
            ("gestational diabetes", ci(r"gestational\s+diabetes")),
            (
                "hypertension",
                ci(r"gestational\s+hypertension|pregnancy-induced\s+hypertension"),
            ),
            ("preterm birth", ci(r"preterm\s+birth|\bptb\b")),
            ("placenta previa", ci(r"placenta\s+previa")),
            ("placental abruption", ci(r"placental\s+abruption")),
            ("chorioamnionitis", ci(r"chorioamnionitis")),
        ]
    });

pub(crate) static FETAL_COMPLICATIONS: LazyLock<Vec<(&'static str, Regex)>> =
    LazyLock::new(|| {
        vec![
            ("fetal distress", ci(r"fetal\s+distress")),
            ("congenital anomaly", ci(r"congenital\s+anomal(?:y|ies)")),
            ("nicu", ci(r"\bnicu\b")),
            ("iugr", ci(r"\biugr\b|intrauterine\s+growth\s+restriction")),
            ("sga", ci(r"small\s+for\s+gestational\s+age|\bsga\b")),
        ]
    });

static SITE_RE: LazyLock<Regex> = LazyLock::new(|| {
    ci(r"(?:collected at|recruited from|enrolled at|delivered at|performed at|obtained from)\s+([^.;\n]+)")
});

const COUNTRIES: &[&str] = &[
    "united states",
    "usa",
    "china",
    "canada",
    "united kingdom",
    "australia",
    "germany",
    "france",
    "spain",
    "italy",
    "brazil",
    "india",
    "japan",
    "mexico",
    "sweden",
    "norway",
    "denmark",
    "finland",
    "netherlands",
    "russia",
    "korea",
    "hong kong",
    "taiwan",
    "singapore",
    "thailand",
    "argentina",
    "south africa",
];

/// Precise placental sampling sites, most specific first.
pub(crate) static SAMPLING_SITES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        ("chorionic plate", ci(r"\bchorionic\s+plate\b")),
        ("chorionic villi", ci(r"\bchorionic\s+vill(?:i|us|ous)\b|\bvillous\s+tissue\b")),
        ("basal plate", ci(r"\bbasal\s+plate\b")),
        ("decidua basalis", ci(r"\bdecidua\s+basalis\b")),
        ("decidua parietalis", ci(r"\bdecidua\s+parietalis\b")),
        ("amnion", ci(r"\bamnion\b")),
        ("chorion", ci(r"\bchorion(?:\s+laeve)?\b")),
        ("fetal membranes", ci(r"\bfetal\s+membranes?\b")),
    ]
});

pub const DEFAULT_SAMPLING_SITE: &str = "placenta";

const FIELD_GROUPS: &[(&str, &[&str])] = &[
    (
        "ga_trimester",
        &[
            "gestational age",
            "weeks",
            "trimester",
            "delivery",
            "collection",
            "sampling",
            "birth",
            "term",
            "preterm",
        ],
    ),
    ("birthweight", &["birth weight", "birthweight", "grams", "kg"]),
    (
        "parity",
        &["parity", "nulliparous", "multiparous", "gravidity", "gravida"],
    ),
    (
        "offspring",
        &["singleton", "twin", "multiple", "fetuses", "offspring"],
    ),
    ("sex", &["sex", "male", "female", "fetus"]),
    (
        "race",
        &["race", "ethnicity", "self-reported", "hispanic", "white", "black", "asian"],
    ),
    (
        "ancestry",
        &["ancestry", "strain", "c57", "european", "african", "admixed"],
    ),
    (
        "maternal",
        &["maternal age", "maternal height", "maternal weight", "pre-pregnancy"],
    ),
    ("paternal", &["paternal age", "paternal height", "paternal weight"]),
    ("mode_delivery", &["cesarean", "caesarean", "c-section", "vaginal"]),
    (
        "pregnancy_complications",
        &[
            "preeclampsia",
            "gestational diabetes",
            "hypertension",
            "preterm",
            "placenta previa",
            "placental abruption",
            "chorioamnionitis",
        ],
    ),
    (
        "fetal_complications",
        &["fetal distress", "anomaly", "nicu", "iugr", "growth restriction"],
    ),
    (
        "site",
        &["hospital", "center", "university", "collected at", "recruited", "country"],
    ),
];

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^(?:\d+[.)\-]\s+)?([A-Za-z][A-Za-z0-9 ,\-/()]{3,})\s*$").unwrap()
});

fn char_offset(text: &str, byte_idx: usize) -> usize {
    text[..byte_idx].chars().count()
}

fn headings(text: &str) -> Vec<(usize, String)> {
    HEADING_RE
        .captures_iter(text)
        .filter_map(|capture| {
            let whole = capture.get(0)?;
            let title = clean_text(&capture[1]);
            (!title.is_empty()).then(|| (char_offset(text, whole.start()), title))
        })
        .collect()
}

fn nearest_heading(headings: &[(usize, String)], offset: usize) -> Option<&str> {
    headings
        .iter()
        .take_while(|(pos, _)| *pos <= offset)
        .last()
        .map(|(_, title)| title.as_str())
}

fn score_window(window: &str, keywords: &[&str]) -> usize {
    let lowered = window.to_lowercase();
    keywords
        .iter()
        .map(|keyword| lowered.matches(keyword).count())
        .sum()
}

/// Country named by the last comma-separated token of a site phrase.
pub fn country_from_location(location: &str) -> Option<String> {
    location
        .split(',')
        .map(str::trim)
        .rev()
        .find(|token| COUNTRIES.contains(&token.to_lowercase().as_str()))
        .map(str::to_string)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub fields: Vec<ExtractedField>,
    pub passages: Vec<Snippet>,
}

impl Extraction {
    pub fn field(&self, field: ClinicalField) -> Option<&ExtractedField> {
        self.fields.iter().find(|candidate| candidate.field == field)
    }

    pub fn value(&self, field: ClinicalField) -> Option<&str> {
        self.field(field).map(|found| found.value.as_str())
    }
}

struct RuleHits<'a> {
    book: &'a mut SnippetBook,
    hits: BTreeMap<ClinicalField, ExtractedField>,
}

impl RuleHits<'_> {
    fn has(&self, field: ClinicalField) -> bool {
        self.hits.contains_key(&field)
    }

    fn span(&mut self, source: &TextSource, start: usize, text: &str) -> String {
        let locator = format!("offset:{}", char_offset(&source.text, start));
        self.book
            .record(source.section, &source.label, &locator, text)
    }

    fn add(
        &mut self,
        field: ClinicalField,
        value: &str,
        evidence: Vec<String>,
        confidence: Confidence,
    ) {
        self.hits.entry(field).or_insert_with(|| ExtractedField {
            field,
            value: value.to_string(),
            confidence,
            evidence,
            source: FieldSource::Regex,
        });
    }
}

pub struct SnippetExtractor {
    settings: SnippetSettings,
}

impl SnippetExtractor {
    pub fn new(settings: SnippetSettings) -> Self {
        Self { settings }
    }

    /// Runs the ordered rules over `sources` (first match wins per field) and
    /// selects the bounded passages handed to model tiers.
    pub fn extract(
        &self,
        sources: &[TextSource],
        has_placental_samples: bool,
        book: &mut SnippetBook,
    ) -> Extraction {
        let mut hits = RuleHits {
            book: &mut *book,
            hits: BTreeMap::new(),
        };
        let mut pregnancy = BTreeMap::<&'static str, String>::new();
        let mut fetal = BTreeMap::<&'static str, String>::new();

        for source in sources {
            apply_field_rules(source, &mut hits);
            for (name, pattern) in PREGNANCY_COMPLICATIONS.iter() {
                if pregnancy.contains_key(name) {
                    continue;
                }
                if let Some(found) = pattern.find(&source.text) {
                    let id = hits.span(source, found.start(), found.as_str());
                    pregnancy.insert(*name, id);
                }
            }
            for (name, pattern) in FETAL_COMPLICATIONS.iter() {
                if fetal.contains_key(name) {
                    continue;
                }
                if let Some(found) = pattern.find(&source.text) {
                    let id = hits.span(source, found.start(), found.as_str());
                    fetal.insert(*name, id);
                }
            }
        }

        if !pregnancy.is_empty() {
            let value = pregnancy.keys().copied().collect::<Vec<_>>().join(", ");
            let evidence = pregnancy.values().cloned().collect::<Vec<_>>();
            hits.add(
                ClinicalField::PregnancyComplicationsList,
                &value,
                evidence.clone(),
                Confidence::HIGH,
            );
            hits.add(
                ClinicalField::SamplesFromPregnancyComplicationsCollected,
                "yes",
                evidence,
                Confidence::HIGH,
            );
        }
        if !fetal.is_empty() {
            let value = fetal.keys().copied().collect::<Vec<_>>().join(", ");
            let evidence = fetal.values().cloned().collect::<Vec<_>>();
            hits.add(
                ClinicalField::FetalComplications,
                &value,
                evidence.clone(),
                Confidence::HIGH,
            );
            hits.add(
                ClinicalField::FetalComplicationsListed,
                "yes",
                evidence,
                Confidence::HIGH,
            );
        }

        if !hits.has(ClinicalField::SamplingSite) && has_placental_samples {
            hits.add(
                ClinicalField::SamplingSite,
                DEFAULT_SAMPLING_SITE,
                Vec::new(),
                Confidence::MEDIUM,
            );
        }

        let fields = hits.hits.into_values().collect();
        let passages = self.passages(sources, book);
        Extraction { fields, passages }
    }

    /// Top-scoring windows per keyword group across all sources. Ties keep
    /// source priority order; a window selected by several groups is kept once.
    pub fn passages(&self, sources: &[TextSource], book: &mut SnippetBook) -> Vec<Snippet> {
        let mut windows = Vec::new();
        for (source_idx, source) in sources.iter().enumerate() {
            let source_headings = if source.section == SourceSection::Document {
                headings(&source.text)
            } else {
                Vec::new()
            };
            for (offset, text) in sliding_window(
                &source.text,
                self.settings.window_chars,
                self.settings.window_step,
            ) {
                let label = match nearest_heading(&source_headings, offset) {
                    Some(heading) => format!("{} / {heading}", source.label),
                    None => source.label.clone(),
                };
                windows.push((source_idx, offset, label, text));
            }
        }

        let mut selected = BTreeSet::new();
        for (_, keywords) in FIELD_GROUPS {
            let mut scored = windows
                .iter()
                .enumerate()
                .map(|(idx, (_, _, _, text))| (score_window(text, keywords), idx))
                .filter(|(score, _)| *score > 0)
                .collect::<Vec<_>>();
            scored.sort_by(|a, b| b.0.cmp(&a.0));
            selected.extend(
                scored
                    .into_iter()
                    .take(self.settings.max_snippets_per_field)
                    .map(|(_, idx)| idx),
            );
        }

        selected
            .into_iter()
            .filter_map(|idx| {
                let (source_idx, offset, label, text) = &windows[idx];
                let source = &sources[*source_idx];
                let text = truncate(text.trim(), self.settings.window_chars);
                let id = book.record(source.section, label, &format!("offset:{offset}"), &text);
                book.get(&id).cloned()
            })
            .collect()
    }
}

fn apply_field_rules(source: &TextSource, hits: &mut RuleHits<'_>) {
    let text = source.text.as_str();

    if !hits.has(ClinicalField::PregnancyTrimester) {
        if let Some((found, value)) = TRIMESTER_PATTERNS
            .iter()
            .find_map(|(pattern, value)| pattern.find(text).map(|found| (found, *value)))
        {
            let id = hits.span(source, found.start(), found.as_str());
            hits.add(
                ClinicalField::PregnancyTrimester,
                value,
                vec![id],
                Confidence::HIGH,
            );
        }
    }

    for (pattern, weeks_field, flag_field) in [
        (
            &*GA_DELIVERY_RE,
            ClinicalField::GaAtDeliveryWeeks,
            ClinicalField::GaAtDeliveryProvided,
        ),
        (
            &*GA_COLLECTION_RE,
            ClinicalField::GaAtCollectionWeeks,
            ClinicalField::GaAtCollectionProvided,
        ),
    ] {
        if hits.has(weeks_field) {
            continue;
        }
        if let Some(capture) = pattern.captures(text) {
            let (Some(whole), Some(weeks)) = (capture.get(0), capture.get(1)) else {
                continue;
            };
            let id = hits.span(source, whole.start(), whole.as_str());
            hits.add(weeks_field, weeks.as_str(), vec![id.clone()], Confidence::HIGH);
            hits.add(flag_field, "yes", vec![id], Confidence::HIGH);
        }
    }

    if !hits.has(ClinicalField::BirthweightProvided) {
        if let Some(found) = BIRTHWEIGHT_RE.find(text) {
            let id = hits.span(source, found.start(), found.as_str());
            hits.add(
                ClinicalField::BirthweightProvided,
                "yes",
                vec![id],
                Confidence::HIGH,
            );
        }
    }

    for (field, pattern) in PRESENCE_PATTERNS.iter() {
        if hits.has(*field) {
            continue;
        }
        if let Some(found) = pattern.find(text) {
            let id = hits.span(source, found.start(), found.as_str());
            hits.add(*field, "yes", vec![id], Confidence::HIGH);
        }
    }

    if !hits.has(ClinicalField::HospitalCenter) {
        if let Some(capture) = SITE_RE.captures(text) {
            if let (Some(whole), Some(place)) = (capture.get(0), capture.get(1)) {
                let location = clean_text(place.as_str());
                let id = hits.span(source, whole.start(), whole.as_str());
                hits.add(
                    ClinicalField::HospitalCenter,
                    &location,
                    vec![id.clone()],
                    Confidence::HIGH,
                );
                if let Some(country) = country_from_location(&location) {
                    hits.add(
                        ClinicalField::CountryOfCollection,
                        &country,
                        vec![id],
                        Confidence::HIGH,
                    );
                }
            }
        }
    }

    if !hits.has(ClinicalField::SamplingSite) {
        if let Some((found, site)) = SAMPLING_SITES
            .iter()
            .find_map(|(site, pattern)| pattern.find(text).map(|found| (found, *site)))
        {
            let id = hits.span(source, found.start(), found.as_str());
            hits.add(ClinicalField::SamplingSite, site, vec![id], Confidence::HIGH);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn country_is_last_known_token() {
        assert_eq!(
            country_from_location("Brigham and Women's Hospital, Boston, MA, USA"),
            Some("USA".to_string())
        );
        assert_eq!(country_from_location("St Mary's Hospital, Manchester"), None);
    }

    #[test]
    fn book_ids_count_per_section() {
        let mut book = SnippetBook::new("GSE1");
        let a = book.record(SourceSection::SeriesSummary, "GSE1", "offset:0", "one");
        let b = book.record(SourceSection::SeriesSummary, "GSE1", "offset:9", "two");
        let c = book.record(SourceSection::Document, "PMC1", "offset:0", "three");
        let again = book.record(SourceSection::SeriesSummary, "GSE1", "offset:0", "one");
        assert_eq!(a, "GSE1:series_summary:1");
        assert_eq!(b, "GSE1:series_summary:2");
        assert_eq!(c, "GSE1:document:1");
        assert_eq!(again, a);
        assert_eq!(book.snippets().len(), 3);
    }

    #[test]
    fn headings_resolve_to_preceding_line() {
        let text = "Methods\nSamples were collected at term.\nResults\nNothing here.";
        let found = headings(text);
        assert_eq!(nearest_heading(&found, 20), Some("Methods"));
    }
}
