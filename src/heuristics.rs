//! Best-effort recovery of the four report sections from free-form prose.
//!
//! Each section has an ordered list of header labels in English and Chinese. The first
//! label (in declared order) whose header captures at least `min_section_chars` characters
//! wins. Sections that no label recovers are filled from the unclaimed paragraphs in
//! document order, and whatever is still empty gets [`SECTION_UNAVAILABLE`].

use crate::schema::{ReportSections, SectionKey, SECTION_UNAVAILABLE};
use crate::utils::trimmed_char_len;
use log::debug;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

pub const DEFAULT_MIN_SECTION_CHARS: usize = 100;

const SECTION_LABELS: [(SectionKey, &[&str]); 4] = [
    (
        SectionKey::FundamentalAnalysis,
        &[
            "Fundamental Analysis",
            "基本面分析",
            "Company Fundamentals",
            "Fundamentals",
            "公司基本面",
            "基本面",
        ],
    ),
    (
        SectionKey::BusinessSegments,
        &[
            "Business Segments",
            "业务板块",
            "Business Segment Analysis",
            "Segment Analysis",
            "Business Overview",
            "业务分部",
            "业务结构",
            "主营业务",
            "业务分析",
        ],
    ),
    (
        SectionKey::GrowthCatalysts,
        &[
            "Growth Catalysts",
            "增长催化剂",
            "Growth Drivers",
            "Catalysts",
            "成长催化剂",
            "增长驱动因素",
            "催化剂",
        ],
    ),
    (
        SectionKey::ValuationAnalysis,
        &["Valuation Analysis", "估值分析", "Valuation", "估值"],
    ),
];

struct LabelPattern {
    section: SectionKey,
    label: &'static str,
    regex: Regex,
}

/// Header lines: optional markdown hashes, bold markers and numbering ("1." / "一、"),
/// then the label, then either end of line or a colon.
static LABEL_PATTERNS: LazyLock<Vec<LabelPattern>> = LazyLock::new(|| {
    SECTION_LABELS
        .iter()
        .flat_map(|(section, labels)| labels.iter().map(move |label| (*section, *label)))
        .filter_map(|(section, label)| {
            let pattern = format!(
                r"(?im)^[ \t]*(?P<hashes>#{{1,6}})?[ \t]*(?:\*\*|__)?[ \t]*(?:(?:\d{{1,2}}|[一二三四五六七八九十]{{1,3}})[.、)．][ \t]*)?(?:\*\*|__)?[ \t]*{}[ \t]*(?:\*\*|__)?[ \t]*(?:[:：][ \t]*(?:\*\*|__)?|$)",
                regex::escape(label)
            );
            Regex::new(&pattern).ok().map(|regex| LabelPattern {
                section,
                label,
                regex,
            })
        })
        .collect()
});

static HEADING_MARKER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(#{1,6})[ \t]+\S").ok());

static BLANK_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\n[ \t]*\n").ok());

/// How a section's content was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionOrigin {
    Label(&'static str),
    Paragraphs(usize),
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct Segmentation {
    pub sections: ReportSections,
    pub origins: BTreeMap<SectionKey, SectionOrigin>,
}

#[derive(Debug, Clone, Copy)]
pub struct SectionSegmenter {
    min_section_chars: usize,
}

impl Default for SectionSegmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SECTION_CHARS)
    }
}

impl SectionSegmenter {
    pub fn new(min_section_chars: usize) -> Self {
        Self { min_section_chars }
    }

    pub fn segment(&self, raw: &str) -> ReportSections {
        self.segment_detailed(raw).sections
    }

    pub fn segment_detailed(&self, raw: &str) -> Segmentation {
        self.segment_sections(raw, &SectionKey::ALL)
    }

    /// Recovers only `targets`; other sections keep the placeholder and get no origin.
    pub fn segment_sections(&self, raw: &str, targets: &[SectionKey]) -> Segmentation {
        let text = raw.replace("\r\n", "\n");
        let headers = all_headers(&text);
        let mut sections = ReportSections::placeholder();
        let mut origins = BTreeMap::new();
        let mut claimed: Vec<(usize, usize)> = Vec::new();

        for (section, _) in SECTION_LABELS
            .iter()
            .filter(|(section, _)| targets.contains(section))
        {
            let found = LABEL_PATTERNS
                .iter()
                .filter(|pattern| pattern.section == *section)
                .find_map(|pattern| {
                    pattern.regex.captures_iter(&text).find_map(|caps| {
                        let whole = caps.get(0)?;
                        if claimed
                            .iter()
                            .any(|(s, e)| whole.start() >= *s && whole.start() < *e)
                        {
                            return None;
                        }
                        let level = caps.name("hashes").map(|h| h.as_str().len());
                        let end = section_end(&text, &headers, whole.end(), level);
                        let content = text[whole.end()..end].trim();
                        if trimmed_char_len(content) >= self.min_section_chars {
                            Some((pattern.label, whole.start(), end, content.to_string()))
                        } else {
                            None
                        }
                    })
                });

            if let Some((label, start, end, content)) = found {
                debug!("Recovered section {} via label '{}'", section, label);
                sections.set(*section, content);
                origins.insert(*section, SectionOrigin::Label(label));
                claimed.push((start, end));
            }
        }

        let unclaimed: Vec<SectionKey> = SectionKey::ALL
            .into_iter()
            .filter(|key| targets.contains(key) && !origins.contains_key(key))
            .collect();

        if !unclaimed.is_empty() {
            let paragraphs = leftover_paragraphs(&text, &claimed);
            let groups = distribute(paragraphs.len(), unclaimed.len());
            let mut cursor = 0;
            for (key, count) in unclaimed.iter().zip(groups) {
                if count == 0 {
                    origins.insert(*key, SectionOrigin::Unavailable);
                    continue;
                }
                let content = paragraphs[cursor..cursor + count].join("\n\n");
                cursor += count;
                sections.set(*key, content);
                origins.insert(*key, SectionOrigin::Paragraphs(count));
            }
        }

        for key in targets.iter().copied() {
            if sections.get(key) == SECTION_UNAVAILABLE {
                origins.insert(key, SectionOrigin::Unavailable);
            }
        }

        Segmentation { sections, origins }
    }
}

/// Segments with the default minimum section length.
pub fn segment(raw: &str) -> ReportSections {
    SectionSegmenter::default().segment(raw)
}

/// Start offsets of every recognized label header, ascending.
fn all_headers(text: &str) -> Vec<usize> {
    let mut starts: Vec<usize> = LABEL_PATTERNS
        .iter()
        .flat_map(|pattern| pattern.regex.find_iter(text).map(|m| m.start()))
        .collect();
    starts.sort_unstable();
    starts
}

/// The section body ends at the next recognized label, at the next heading of the same or
/// higher rank, or at end of text.
fn section_end(text: &str, headers: &[usize], from: usize, level: Option<usize>) -> usize {
    let next_label = headers.iter().copied().find(|start| *start >= from);

    let next_heading = HEADING_MARKER.as_ref().and_then(|re| {
        re.captures_iter(&text[from..])
            .filter_map(|caps| {
                let hashes = caps.get(1)?.as_str().len();
                let start = caps.get(0)?.start();
                let outranks = level.map_or(true, |own| hashes <= own);
                outranks.then_some(from + start)
            })
            .next()
    });

    [next_label, next_heading]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(text.len())
}

fn leftover_paragraphs(text: &str, claimed: &[(usize, usize)]) -> Vec<String> {
    let mut spans = claimed.to_vec();
    spans.sort_unstable();

    let mut leftover = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end) in spans {
        if start > cursor {
            leftover.push_str(&text[cursor..start]);
        }
        leftover.push_str("\n\n");
        cursor = cursor.max(end);
    }
    if cursor < text.len() {
        leftover.push_str(&text[cursor..]);
    }

    let pieces: Vec<&str> = match BLANK_LINE.as_ref() {
        Some(re) => re.split(&leftover).collect(),
        None => leftover.split("\n\n").collect(),
    };

    pieces
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter(|p| !is_heading_only(p))
        .map(str::to_string)
        .collect()
}

fn is_heading_only(paragraph: &str) -> bool {
    paragraph
        .lines()
        .all(|line| line.trim().is_empty() || line.trim_start().starts_with('#'))
}

/// Splits `items` into `buckets` contiguous groups, earlier groups taking the remainder.
fn distribute(items: usize, buckets: usize) -> Vec<usize> {
    if buckets == 0 {
        return Vec::new();
    }
    if items <= buckets {
        return (0..buckets).map(|i| usize::from(i < items)).collect();
    }
    let base = items / buckets;
    let extra = items % buckets;
    (0..buckets).map(|i| base + usize::from(i < extra)).collect()
}
