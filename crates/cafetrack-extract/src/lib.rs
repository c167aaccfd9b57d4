//! Field extractors: free admissions-forum text in, typed fields out.
//!
//! Every extractor is total. The upstream text is unstructured human writing,
//! so each field degrades independently to an absent value or sentinel and
//! none of them can fail a record.

use std::ops::RangeInclusive;
use std::sync::LazyLock;

use cafetrack_core::{
    Decision, DegreeLevel, Nationality, NormalizedRecord, RawRecord, NO_TERM_DETECTED,
};
use chrono::NaiveDate;
use regex_lite::Regex;

pub const CRATE_NAME: &str = "cafetrack-extract";

/// Trim, strip NUL bytes, and map empty strings to `None`.
///
/// NUL bytes are rejected by the Postgres text wire encoding, so they must
/// never survive past this point.
pub fn clean_text(input: &str) -> Option<String> {
    let cleaned = input.replace('\0', "");
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

const DATE_FORMATS: &[&str] = &["%B %d, %Y", "%b %d, %Y", "%Y-%m-%d", "%m/%d/%Y"];

/// Parse the upstream posted date in any of its observed notations.
pub fn parse_record_date(raw: &str) -> Option<NaiveDate> {
    let cleaned = clean_text(raw)?;
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&cleaned, fmt).ok())
}

// Term rules, first match wins: a spelled-out season (optionally with an
// apostrophe year, e.g. "Fall '26"), then the single-letter shorthand
// ("F26", "S '26"). Autumn folds into Fall.
static TERM_FULL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(Fall|Spring|Summer|Winter|Autumn)\s*['\u{2019}]?\s*(20\d{2}|\d{2})\b")
        .expect("term pattern")
});
static TERM_SHORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(SU|F|S|W)\s*['\u{2019}]?\s*(\d{2})\b").expect("term shorthand pattern")
});

fn canonical_season(token: &str) -> &'static str {
    match token.to_ascii_lowercase().as_str() {
        "fall" | "autumn" | "f" => "Fall",
        "spring" | "s" => "Spring",
        "summer" | "su" => "Summer",
        _ => "Winter",
    }
}

/// Extract a canonical `"<Season> <4-digit-year>"` term, or the sentinel.
pub fn extract_term(text: &str) -> String {
    if let Some(caps) = TERM_FULL.captures(text) {
        let season = canonical_season(&caps[1]);
        let year = &caps[2];
        let year = if year.len() == 2 {
            format!("20{year}")
        } else {
            year.to_string()
        };
        return format!("{season} {year}");
    }
    if let Some(caps) = TERM_SHORT.captures(text) {
        let season = canonical_season(&caps[1]);
        return format!("{season} 20{}", &caps[2]);
    }
    NO_TERM_DETECTED.to_string()
}

static DECISION_RULES: LazyLock<[(Regex, Decision); 4]> = LazyLock::new(|| {
    [
        (
            Regex::new(r"(?i)\b(accepted|accept|admitted|admit)\b").expect("accept pattern"),
            Decision::Accepted,
        ),
        (
            Regex::new(r"(?i)\b(rejected|reject|denied|deny)\b").expect("reject pattern"),
            Decision::Rejected,
        ),
        (
            Regex::new(r"(?i)\b(wait\s*listed|waitlisted|waitlist)\b").expect("waitlist pattern"),
            Decision::Waitlisted,
        ),
        (
            Regex::new(r"(?i)\binterview(?:ed)?\b").expect("interview pattern"),
            Decision::Interview,
        ),
    ]
});

/// Scan for decision keywords; the earliest match in the text wins. Posts
/// with no decision keyword are `Unclassified`.
pub fn extract_decision(text: &str) -> Decision {
    let mut earliest: Option<(usize, Decision)> = None;
    for (pattern, decision) in DECISION_RULES.iter() {
        if let Some(found) = pattern.find(text) {
            let better = earliest.map_or(true, |(pos, _)| found.start() < pos);
            if better {
                earliest = Some((found.start(), *decision));
            }
        }
    }
    earliest.map_or(Decision::Unclassified, |(_, decision)| decision)
}

static INTERNATIONAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\binternational\b").expect("international pattern"));
static AMERICAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bamerican\b").expect("american pattern"));

pub fn extract_nationality(text: &str) -> Nationality {
    if INTERNATIONAL.is_match(text) {
        Nationality::International
    } else if AMERICAN.is_match(text) {
        Nationality::American
    } else {
        Nationality::Unknown
    }
}

static PHD_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(ph\.?d|doctorate)\b").expect("phd pattern"));
static MASTERS_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(master(?:'s|s)?|msc|meng|ms)\b").expect("masters pattern"));
static BACHELORS_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(bachelor(?:'s|s)?|bs)\b").expect("bachelors pattern"));

/// Map a degree label (e.g. the upstream `masters_or_phd` field) to a level.
pub fn degree_from_label(label: &str) -> DegreeLevel {
    let lower = label.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return DegreeLevel::Unknown;
    }
    if lower.contains("phd") || lower.contains("ph.d") || lower.contains("doctor") {
        DegreeLevel::PhD
    } else if lower.contains("master")
        || matches!(lower.as_str(), "ms" | "m.s." | "msc" | "mcs" | "meng")
    {
        DegreeLevel::Masters
    } else if lower.contains("bachelor") || matches!(lower.as_str(), "bs" | "b.s.") {
        DegreeLevel::Bachelors
    } else {
        DegreeLevel::Unknown
    }
}

/// Scan free text for degree-level keywords. PhD wins over Masters so that
/// "PhD after my Masters" classifies as the program actually applied to.
pub fn degree_from_text(text: &str) -> DegreeLevel {
    if PHD_TEXT.is_match(text) {
        DegreeLevel::PhD
    } else if MASTERS_TEXT.is_match(text) {
        DegreeLevel::Masters
    } else if BACHELORS_TEXT.is_match(text) {
        DegreeLevel::Bachelors
    } else {
        DegreeLevel::Unknown
    }
}

// Numeric metrics: label-adjacent number tokens, bounds-checked per metric.
// Values outside the plausible range are discarded as noise, never stored.
const GPA_RANGE: RangeInclusive<f64> = 0.0..=4.33;
const GRE_SECTION_RANGE: RangeInclusive<f64> = 130.0..=170.0;
const GRE_AW_RANGE: RangeInclusive<f64> = 0.0..=6.0;

static GPA_RULES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![Regex::new(r"(?i)\bGPA\s*[:=]?\s*(\d{1,2}(?:\.\d{1,2})?)\b").expect("gpa pattern")]
});

static GRE_QUANT_RULES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\b(?:GRE\s*)?Q(?:uant(?:itative)?)?\s*[:=]?\s*(\d{2,3})\b")
            .expect("gre quant pattern"),
        Regex::new(r"(?i)\b(\d{2,3})\s*Q\b").expect("gre quant suffix pattern"),
        // Bare "GRE 165" reads as the quantitative section; totals fall
        // outside the section range and are dropped by the bounds check.
        Regex::new(r"(?i)\bGRE\s*[:=]?\s*(\d{2,3})\b").expect("gre bare pattern"),
    ]
});

static GRE_VERBAL_RULES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\b(?:GRE\s*)?V(?:erb(?:al)?)?\s*[:=]?\s*(\d{2,3})\b")
            .expect("gre verbal pattern"),
        Regex::new(r"(?i)\b(\d{2,3})\s*V\b").expect("gre verbal suffix pattern"),
    ]
});

static GRE_AW_RULES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\b(?:AWA|AW|Analytical\s+Writing)\s*[:=]?\s*(\d(?:\.\d)?)\b")
            .expect("gre aw pattern"),
    ]
});

fn first_in_range(rules: &[Regex], text: &str, range: &RangeInclusive<f64>) -> Option<f64> {
    for pattern in rules {
        let Some(caps) = pattern.captures(text) else {
            continue;
        };
        let Some(value) = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) else {
            continue;
        };
        if range.contains(&value) {
            return Some(value);
        }
    }
    None
}

/// Numeric scores recovered from one post. Each field is independent; zero
/// is a real reported score and is never used as a default.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricScores {
    pub gpa: Option<f64>,
    pub gre_quant: Option<f64>,
    pub gre_verbal: Option<f64>,
    pub gre_aw: Option<f64>,
}

pub fn extract_metrics(text: &str) -> MetricScores {
    MetricScores {
        gpa: first_in_range(&GPA_RULES, text, &GPA_RANGE),
        gre_quant: first_in_range(&GRE_QUANT_RULES, text, &GRE_SECTION_RANGE),
        gre_verbal: first_in_range(&GRE_VERBAL_RULES, text, &GRE_SECTION_RANGE),
        gre_aw: first_in_range(&GRE_AW_RULES, text, &GRE_AW_RANGE),
    }
}

/// Turn one raw post into its persisted shape. Total: any input, including
/// an all-empty record, produces a well-formed `NormalizedRecord`.
pub fn normalize(raw: &RawRecord) -> NormalizedRecord {
    let program = raw.program.as_deref().and_then(clean_text);
    let comments = raw.comments.as_deref().and_then(clean_text);
    let url = raw.url.as_deref().and_then(clean_text);
    let status_field = raw.status.as_deref().and_then(clean_text);
    let llm_program = raw.llm_program.as_deref().and_then(clean_text);
    let llm_university = raw.llm_university.as_deref().and_then(clean_text);

    // One combined scan text: posts bury term/nationality/degree hints in
    // whichever field the author happened to type them into.
    let combined = [
        program.as_deref(),
        status_field.as_deref(),
        comments.as_deref(),
        llm_program.as_deref(),
        llm_university.as_deref(),
    ]
    .iter()
    .flatten()
    .copied()
    .collect::<Vec<_>>()
    .join(" ");

    // The structured status field is more trustworthy than the free text
    // when it actually classifies; otherwise fall back to the full scan.
    let status = match status_field.as_deref().map(extract_decision) {
        Some(decision) if decision != Decision::Unclassified => decision,
        _ => extract_decision(&combined),
    };

    let degree = match raw.degree.as_deref().map(degree_from_label) {
        Some(level) if level != DegreeLevel::Unknown => level,
        _ => degree_from_text(&combined),
    };

    let metrics = extract_metrics(&combined);

    NormalizedRecord {
        date_added: raw.date_added.as_deref().and_then(parse_record_date),
        status,
        term: extract_term(&combined),
        nationality: extract_nationality(&combined),
        degree,
        gpa: metrics.gpa,
        gre_quant: metrics.gre_quant,
        gre_verbal: metrics.gre_verbal,
        gre_aw: metrics.gre_aw,
        program,
        comments,
        url,
        llm_program,
        llm_university,
    }
}
