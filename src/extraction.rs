//! Recovery of structured data from untrusted model output.
//!
//! Three structural strategies run in strict order and the first success wins:
//! a fenced block tagged `json`, the whole text as one value, then the longest
//! brace-balanced substring. For reports, any section the structure lacks is
//! default-filled by [`crate::heuristics`] from the text around the structure, and a
//! total structural failure degrades to heuristics over the whole response.

use crate::heuristics::{SectionOrigin, SectionSegmenter, DEFAULT_MIN_SECTION_CHARS};
use crate::schema::{ReportSections, SectionKey};
use log::{debug, warn};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;

static FENCED_JSON: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```[ \t]*(?i:json)[ \t]*\r?\n(.*?)```").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseTier {
    FencedBlock,
    WholeText,
    BalancedBraces,
}

impl fmt::Display for ParseTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParseTier::FencedBlock => "fenced block",
            ParseTier::WholeText => "whole text",
            ParseTier::BalancedBraces => "balanced braces",
        };
        f.write_str(name)
    }
}

/// A top-level object recovered from model output, with the byte span it occupied.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredPayload {
    pub object: Map<String, Value>,
    pub tier: ParseTier,
    pub span: Range<usize>,
}

impl StructuredPayload {
    /// The text surrounding the structured span.
    pub fn leftover(&self, raw: &str) -> String {
        let before = raw.get(..self.span.start).unwrap_or_default();
        let after = raw.get(self.span.end..).unwrap_or_default();
        format!("{}\n\n{}", before.trim_end(), after.trim_start())
            .trim()
            .to_string()
    }

    /// Required keys that are absent or hold an empty value.
    pub fn missing_keys<'k>(&self, required: &[&'k str]) -> Vec<&'k str> {
        required
            .iter()
            .copied()
            .filter(|key| self.object.get(*key).map_or(true, is_empty_value))
            .collect()
    }
}

/// All structural strategies failed. Carries the raw text for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionFailure {
    pub raw_text: String,
    pub attempts: Vec<(ParseTier, String)>,
}

impl fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reasons = self
            .attempts
            .iter()
            .map(|(tier, reason)| format!("{}: {}", tier, reason))
            .collect::<Vec<_>>()
            .join("; ");
        write!(
            f,
            "no structured payload in {} chars of text ({})",
            self.raw_text.chars().count(),
            reasons
        )
    }
}

type Strategy = fn(&str) -> Result<(Map<String, Value>, Range<usize>), String>;

const STRATEGIES: [(ParseTier, Strategy); 3] = [
    (ParseTier::FencedBlock, parse_fenced_block),
    (ParseTier::WholeText, parse_whole_text),
    (ParseTier::BalancedBraces, parse_longest_balanced),
];

/// Runs the structural strategies in order and returns the first object recovered.
pub fn extract_structured(raw: &str) -> Result<StructuredPayload, ExtractionFailure> {
    let mut attempts = Vec::with_capacity(STRATEGIES.len());

    for (tier, strategy) in STRATEGIES {
        match strategy(raw) {
            Ok((object, span)) => {
                debug!("Structured payload recovered via {} ({} keys)", tier, object.len());
                return Ok(StructuredPayload { object, tier, span });
            }
            Err(reason) => attempts.push((tier, reason)),
        }
    }

    Err(ExtractionFailure {
        raw_text: raw.to_string(),
        attempts,
    })
}

fn parse_fenced_block(raw: &str) -> Result<(Map<String, Value>, Range<usize>), String> {
    let fence = FENCED_JSON
        .as_ref()
        .ok_or_else(|| "fence pattern unavailable".to_string())?;

    let mut last_error = "no json-tagged fenced block".to_string();
    for caps in fence.captures_iter(raw) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        match parse_object(body.as_str()) {
            Ok(object) => return Ok((object, whole.range())),
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

fn parse_whole_text(raw: &str) -> Result<(Map<String, Value>, Range<usize>), String> {
    parse_object(raw).map(|object| (object, 0..raw.len()))
}

fn parse_longest_balanced(raw: &str) -> Result<(Map<String, Value>, Range<usize>), String> {
    let span = longest_balanced_span(raw).ok_or_else(|| "no balanced braces".to_string())?;
    parse_object(&raw[span.clone()]).map(|object| (object, span))
}

fn parse_object(text: &str) -> Result<Map<String, Value>, String> {
    let trimmed = text.trim().trim_start_matches('\u{feff}');
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err("top-level value is not an object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// Longest `{...}` span anywhere in the text, found in one linear pass. Braces inside
/// string literals are ignored; quotes only count once a brace is open.
pub fn longest_balanced_span(text: &str) -> Option<Range<usize>> {
    let mut best: Option<Range<usize>> = None;
    let mut opens: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in text.as_bytes().iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if !opens.is_empty() => in_string = true,
            b'{' => opens.push(i),
            b'}' => {
                if let Some(open) = opens.pop() {
                    let span = open..i + 1;
                    if best.as_ref().map_or(true, |b| span.len() > b.len()) {
                        best = Some(span);
                    }
                }
            }
            _ => {}
        }
    }

    best
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Flattens a section value into text. Strings are kept verbatim.
fn section_text(value: &Value) -> Option<String> {
    if is_empty_value(value) {
        return None;
    }
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let lines: Vec<String> = items
                .iter()
                .filter(|item| !is_empty_value(item))
                .map(|item| match item {
                    Value::String(s) => s.trim().to_string(),
                    other => other.to_string(),
                })
                .collect();
            Some(lines.join("\n"))
        }
        other => serde_json::to_string_pretty(other).ok(),
    }
}

/// Where the sections of an [`Extraction`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionSource {
    Structured(ParseTier),
    Heuristics,
}

/// A report recovered from model output. Always carries all four sections.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub sections: ReportSections,
    pub source: ExtractionSource,
    /// Sections filled by heuristics rather than taken from structure.
    pub heuristic_sections: Vec<SectionKey>,
    /// How each heuristically filled section was found.
    pub heuristic_origins: BTreeMap<SectionKey, SectionOrigin>,
    /// Present when every structural strategy failed.
    pub failure: Option<ExtractionFailure>,
}

impl Extraction {
    /// True when all four sections came straight from a structured payload.
    pub fn is_complete(&self) -> bool {
        matches!(self.source, ExtractionSource::Structured(_)) && self.heuristic_sections.is_empty()
    }

    /// True when `key` was taken from structure or found under its own section label,
    /// as opposed to paragraphs handed out in order or a placeholder.
    pub fn is_anchored(&self, key: SectionKey) -> bool {
        if !self.heuristic_sections.contains(&key) {
            return true;
        }
        matches!(self.heuristic_origins.get(&key), Some(SectionOrigin::Label(_)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReportExtractor {
    segmenter: SectionSegmenter,
}

impl Default for ReportExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SECTION_CHARS)
    }
}

impl ReportExtractor {
    pub fn new(min_section_chars: usize) -> Self {
        Self {
            segmenter: SectionSegmenter::new(min_section_chars),
        }
    }

    /// Recovers the four-section report. Never fails; the worst case is placeholders.
    pub fn extract(&self, raw: &str) -> Extraction {
        match extract_structured(raw) {
            Ok(payload) => self.from_payload(raw, &payload),
            Err(failure) => {
                warn!("Structured extraction failed, falling back to section heuristics: {}", failure);
                let segmentation = self.segmenter.segment_detailed(raw);
                Extraction {
                    sections: segmentation.sections,
                    source: ExtractionSource::Heuristics,
                    heuristic_sections: SectionKey::ALL.to_vec(),
                    heuristic_origins: segmentation.origins,
                    failure: Some(failure),
                }
            }
        }
    }

    fn from_payload(&self, raw: &str, payload: &StructuredPayload) -> Extraction {
        let mut sections = ReportSections::placeholder();
        let mut missing = Vec::new();

        for key in SectionKey::ALL {
            let text = payload
                .object
                .iter()
                .find(|(name, _)| SectionKey::from_key(name) == Some(key))
                .and_then(|(_, value)| section_text(value));
            match text {
                Some(text) => sections.set(key, text),
                None => missing.push(key),
            }
        }

        let mut heuristic_origins = BTreeMap::new();
        if !missing.is_empty() {
            warn!(
                "Structured payload ({}) lacks sections {:?}; default-filling from surrounding text",
                payload.tier, missing
            );
            let leftover = payload.leftover(raw);
            let recovered = self.segmenter.segment_sections(&leftover, &missing);
            for key in &missing {
                sections.set(*key, recovered.sections.get(*key).to_string());
            }
            heuristic_origins = recovered.origins;
        }

        Extraction {
            sections,
            source: ExtractionSource::Structured(payload.tier),
            heuristic_sections: missing,
            heuristic_origins,
            failure: None,
        }
    }
}

/// Extracts a report with the default segmenter settings.
pub fn extract(raw: &str) -> Extraction {
    ReportExtractor::default().extract(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SECTION_UNAVAILABLE;

    const FULL_REPORT: &str = r#"{
        "fundamentalAnalysis": "Revenue up 8% with stable margins.",
        "businessSegments": "Cloud 60%, devices 40%.",
        "growthCatalysts": "New AI accelerators ship in Q3.",
        "valuationAnalysis": "22x forward earnings, below peers."
    }"#;

    #[test]
    fn test_fenced_block_round_trip() {
        let raw = format!("Here is the report:\n```json\n{}\n```\nLet me know.", FULL_REPORT);
        let extraction = extract(&raw);
        assert_eq!(extraction.source, ExtractionSource::Structured(ParseTier::FencedBlock));
        assert!(extraction.is_complete());
        assert_eq!(
            extraction.sections.fundamental_analysis,
            "Revenue up 8% with stable margins."
        );
        assert_eq!(
            extraction.sections.valuation_analysis,
            "22x forward earnings, below peers."
        );
    }

    #[test]
    fn test_whole_text_parse() {
        let extraction = extract(FULL_REPORT);
        assert_eq!(extraction.source, ExtractionSource::Structured(ParseTier::WholeText));
        assert_eq!(extraction.sections.business_segments, "Cloud 60%, devices 40%.");
    }

    #[test]
    fn test_fence_tag_is_case_insensitive() {
        let raw = format!("```JSON\n{}\n```", FULL_REPORT);
        let payload = extract_structured(&raw).unwrap();
        assert_eq!(payload.tier, ParseTier::FencedBlock);
    }

    #[test]
    fn test_invalid_fence_falls_through_to_balanced_braces() {
        let raw = format!(
            "```json\n{{ not valid json \n```\nCorrected output: {}",
            FULL_REPORT
        );
        let payload = extract_structured(&raw).unwrap();
        assert_eq!(payload.tier, ParseTier::BalancedBraces);
        assert_eq!(payload.object.len(), 4);
    }

    #[test]
    fn test_longest_balanced_substring_wins() {
        let raw = r#"Draft: {"summary": "short"} and final: {"summary": "the longer one", "highlights": []} done"#;
        let payload = extract_structured(raw).unwrap();
        assert_eq!(payload.tier, ParseTier::BalancedBraces);
        assert_eq!(payload.object["summary"], "the longer one");
    }

    #[test]
    fn test_balanced_scan_ignores_braces_in_strings() {
        let raw = r#"note {"a": "contains } brace", "b": 1} tail"#;
        let span = longest_balanced_span(raw).unwrap();
        assert_eq!(&raw[span], r#"{"a": "contains } brace", "b": 1}"#);
    }

    #[test]
    fn test_unclosed_brace_does_not_hide_later_object() {
        let raw = r#"Thinking { aloud here. Result: {"summary": "kept"} end"#;
        let span = longest_balanced_span(raw).unwrap();
        assert_eq!(&raw[span], r#"{"summary": "kept"}"#);
    }

    #[test]
    fn test_unclosed_braces_scan_in_linear_time() {
        let raw = "{".repeat(100_000);
        let started = std::time::Instant::now();
        assert!(longest_balanced_span(&raw).is_none());
        let extraction = extract(&raw);
        assert_eq!(extraction.source, ExtractionSource::Heuristics);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_non_object_is_not_a_payload() {
        let failure = extract_structured("[1, 2, 3]").unwrap_err();
        assert_eq!(failure.attempts.len(), 3);
        assert_eq!(failure.raw_text, "[1, 2, 3]");
    }

    #[test]
    fn test_partial_payload_is_default_filled() {
        let raw = r#"{"fundamentalAnalysis": "Strong cash generation.", "businessSegments": "Two segments.", "growthCatalysts": ""}

Valuation: the shares look inexpensive relative to the sector, trading at a meaningful discount to the five-year average multiple despite improving returns."#;
        let extraction = extract(raw);
        assert_eq!(extraction.source, ExtractionSource::Structured(ParseTier::BalancedBraces));
        assert_eq!(
            extraction.heuristic_sections,
            vec![SectionKey::GrowthCatalysts, SectionKey::ValuationAnalysis]
        );
        assert_eq!(extraction.sections.fundamental_analysis, "Strong cash generation.");
        assert!(extraction
            .sections
            .valuation_analysis
            .contains("inexpensive relative to the sector"));
        assert_eq!(extraction.sections.growth_catalysts, SECTION_UNAVAILABLE);
        assert!(extraction.is_anchored(SectionKey::FundamentalAnalysis));
        assert!(extraction.is_anchored(SectionKey::ValuationAnalysis));
        assert!(!extraction.is_anchored(SectionKey::GrowthCatalysts));
    }

    #[test]
    fn test_snake_case_keys_and_array_values() {
        let raw = r#"{"fundamental_analysis": ["Point one", "Point two"], "business_segments": "B", "growth_catalysts": "G", "valuation_analysis": "V"}"#;
        let extraction = extract(raw);
        assert!(extraction.is_complete());
        assert_eq!(extraction.sections.fundamental_analysis, "Point one\nPoint two");
    }

    #[test]
    fn test_unstructured_text_never_fails() {
        let extraction = extract("The model apologised and produced nothing useful.");
        assert_eq!(extraction.source, ExtractionSource::Heuristics);
        assert!(extraction.failure.is_some());
        for key in SectionKey::ALL {
            assert!(!extraction.sections.get(key).trim().is_empty());
            assert!(!extraction.is_anchored(key));
        }
    }

    #[test]
    fn test_missing_keys() {
        let payload = extract_structured(r#"{"summary": "s", "highlights": []}"#).unwrap();
        assert_eq!(payload.missing_keys(&["summary", "highlights"]), vec!["highlights"]);
    }
}
