use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker written into any section that could not be recovered from a model response.
pub const SECTION_UNAVAILABLE: &str = "[内容暂不可用 / Content unavailable]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "en")]
    English,
    #[serde(rename = "zh")]
    Chinese,
}

impl Language {
    pub fn parse(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "en" | "en-us" | "en-gb" | "english" => Some(Self::English),
            "zh" | "zh-cn" | "zh-hans" | "cn" | "chinese" => Some(Self::Chinese),
            _ => None,
        }
    }

    /// Guesses the language of a text from its share of CJK ideographs among letters.
    pub fn detect(text: &str) -> Self {
        let mut cjk = 0usize;
        let mut latin = 0usize;
        for ch in text.chars() {
            if ('\u{4E00}'..='\u{9FFF}').contains(&ch) {
                cjk += 1;
            } else if ch.is_ascii_alphabetic() {
                latin += 1;
            }
        }

        // One ideograph carries roughly a word, so it is weighed against several latin letters.
        if cjk > 0 && cjk * 5 >= latin {
            Self::Chinese
        } else {
            Self::English
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::English => "en",
            Self::Chinese => "zh",
        }
    }
}

/// The four fixed sections of an analysis report.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum SectionKey {
    FundamentalAnalysis,
    BusinessSegments,
    GrowthCatalysts,
    ValuationAnalysis,
}

impl SectionKey {
    pub const ALL: [SectionKey; 4] = [
        SectionKey::FundamentalAnalysis,
        SectionKey::BusinessSegments,
        SectionKey::GrowthCatalysts,
        SectionKey::ValuationAnalysis,
    ];

    /// The wire key used in the data-interchange form of a report.
    pub fn as_str(self) -> &'static str {
        match self {
            SectionKey::FundamentalAnalysis => "fundamentalAnalysis",
            SectionKey::BusinessSegments => "businessSegments",
            SectionKey::GrowthCatalysts => "growthCatalysts",
            SectionKey::ValuationAnalysis => "valuationAnalysis",
        }
    }

    pub fn title(self, language: Language) -> &'static str {
        match (self, language) {
            (SectionKey::FundamentalAnalysis, Language::English) => "Fundamental Analysis",
            (SectionKey::BusinessSegments, Language::English) => "Business Segments",
            (SectionKey::GrowthCatalysts, Language::English) => "Growth Catalysts",
            (SectionKey::ValuationAnalysis, Language::English) => "Valuation Analysis",
            (SectionKey::FundamentalAnalysis, Language::Chinese) => "基本面分析",
            (SectionKey::BusinessSegments, Language::Chinese) => "业务板块",
            (SectionKey::GrowthCatalysts, Language::Chinese) => "增长催化剂",
            (SectionKey::ValuationAnalysis, Language::Chinese) => "估值分析",
        }
    }

    /// Resolves a wire key, a snake/kebab spelling or a section title in either language.
    pub fn from_key(key: &str) -> Option<Self> {
        let normalized: String = key
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();

        SectionKey::ALL.into_iter().find(|section| {
            normalized == section.as_str().to_lowercase()
                || normalized == section.title(Language::English).replace(' ', "").to_lowercase()
                || normalized == section.title(Language::Chinese)
        })
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four-section body of a report. Every section is always present; sections that
/// could not be recovered hold [`SECTION_UNAVAILABLE`] instead of an empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSections {
    pub fundamental_analysis: String,
    pub business_segments: String,
    pub growth_catalysts: String,
    pub valuation_analysis: String,
}

impl ReportSections {
    pub fn placeholder() -> Self {
        Self {
            fundamental_analysis: SECTION_UNAVAILABLE.to_string(),
            business_segments: SECTION_UNAVAILABLE.to_string(),
            growth_catalysts: SECTION_UNAVAILABLE.to_string(),
            valuation_analysis: SECTION_UNAVAILABLE.to_string(),
        }
    }

    pub fn get(&self, key: SectionKey) -> &str {
        match key {
            SectionKey::FundamentalAnalysis => &self.fundamental_analysis,
            SectionKey::BusinessSegments => &self.business_segments,
            SectionKey::GrowthCatalysts => &self.growth_catalysts,
            SectionKey::ValuationAnalysis => &self.valuation_analysis,
        }
    }

    /// Stores a section, substituting the placeholder for blank content.
    pub fn set(&mut self, key: SectionKey, value: impl Into<String>) {
        let mut value = value.into();
        if value.trim().is_empty() {
            value = SECTION_UNAVAILABLE.to_string();
        }
        match key {
            SectionKey::FundamentalAnalysis => self.fundamental_analysis = value,
            SectionKey::BusinessSegments => self.business_segments = value,
            SectionKey::GrowthCatalysts => self.growth_catalysts = value,
            SectionKey::ValuationAnalysis => self.valuation_analysis = value,
        }
    }

    pub fn is_recovered(&self, key: SectionKey) -> bool {
        self.get(key) != SECTION_UNAVAILABLE
    }

    pub fn unrecovered(&self) -> Vec<SectionKey> {
        SectionKey::ALL
            .into_iter()
            .filter(|key| !self.is_recovered(*key))
            .collect()
    }
}

impl Default for ReportSections {
    fn default() -> Self {
        Self::placeholder()
    }
}

/// A stored analysis report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    #[serde(default = "first_version")]
    pub version: u32,
    #[serde(flatten)]
    pub sections: ReportSections,
}

fn first_version() -> u32 {
    1
}

impl Document {
    pub fn new(id: impl Into<String>, sections: ReportSections) -> Self {
        Self {
            id: id.into(),
            version: first_version(),
            sections,
        }
    }

    /// Renders the four sections as headed markdown, the form used as grounding context.
    pub fn render_markdown(&self, language: Language) -> String {
        SectionKey::ALL
            .into_iter()
            .map(|key| format!("## {}\n\n{}", key.title(language), self.sections.get(key).trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Language of the recovered section text; placeholders are ignored.
    pub fn detect_language(&self) -> Language {
        let body = SectionKey::ALL
            .into_iter()
            .filter(|key| self.sections.is_recovered(*key))
            .map(|key| self.sections.get(key))
            .collect::<Vec<_>>()
            .join("\n");
        Language::detect(&body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum HighlightCategory {
    #[schemars(description = "Technology, product or operational edge over competitors")]
    TechnicalAdvantage,

    #[schemars(description = "Revenue, margin, cash flow or balance sheet developments")]
    FinancialPerformance,

    #[schemars(description = "Market share, competitive standing, pricing power")]
    MarketPosition,

    #[schemars(description = "Downside risks, threats or uncertainties")]
    RiskFactor,

    #[schemars(description = "Actionable buy/hold/sell style conclusions or target changes")]
    InvestmentRecommendation,

    #[schemars(description = "Anything that fits none of the other categories")]
    Other,
}

impl HighlightCategory {
    pub const ALL: [HighlightCategory; 6] = [
        HighlightCategory::TechnicalAdvantage,
        HighlightCategory::FinancialPerformance,
        HighlightCategory::MarketPosition,
        HighlightCategory::RiskFactor,
        HighlightCategory::InvestmentRecommendation,
        HighlightCategory::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HighlightCategory::TechnicalAdvantage => "technical-advantage",
            HighlightCategory::FinancialPerformance => "financial-performance",
            HighlightCategory::MarketPosition => "market-position",
            HighlightCategory::RiskFactor => "risk-factor",
            HighlightCategory::InvestmentRecommendation => "investment-recommendation",
            HighlightCategory::Other => "other",
        }
    }

    /// Accepts kebab, snake, camel or spaced spellings and Chinese labels; anything else is `Other`.
    pub fn parse_lenient(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "technicaladvantage" | "technology" | "技术优势" => Self::TechnicalAdvantage,
            "financialperformance" | "financial" | "财务表现" | "财务业绩" => {
                Self::FinancialPerformance
            }
            "marketposition" | "market" | "市场地位" => Self::MarketPosition,
            "riskfactor" | "risk" | "risks" | "风险因素" | "风险" => Self::RiskFactor,
            "investmentrecommendation" | "recommendation" | "投资建议" => {
                Self::InvestmentRecommendation
            }
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    High,
    Medium,
    Low,
}

impl ImpactLevel {
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "high" | "高" => Some(Self::High),
            "medium" | "moderate" | "mid" | "中" => Some(Self::Medium),
            "low" | "低" => Some(Self::Low),
            _ => None,
        }
    }
}

/// A categorized insight produced by synthesis. Only the confirmation gate flips
/// `is_user_confirmed`; the flag is written out but never read back, so a deserialized
/// highlight always starts unconfirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Highlight {
    pub id: String,
    pub category: HighlightCategory,
    pub title: String,
    pub content: String,
    pub impact: ImpactLevel,
    pub is_new_insight: bool,
    #[serde(default, skip_deserializing)]
    pub(crate) is_user_confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_section: Option<SectionKey>,
}

impl Highlight {
    pub fn new(
        id: impl Into<String>,
        category: HighlightCategory,
        title: impl Into<String>,
        content: impl Into<String>,
        impact: ImpactLevel,
        is_new_insight: bool,
    ) -> Self {
        Self {
            id: id.into(),
            category,
            title: title.into(),
            content: content.into(),
            impact,
            is_new_insight,
            is_user_confirmed: false,
            source_section: None,
        }
    }

    pub fn with_source_section(mut self, section: SectionKey) -> Self {
        self.source_section = Some(section);
        self
    }

    pub fn is_user_confirmed(&self) -> bool {
        self.is_user_confirmed
    }
}

/// One answered question of a discussion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub question: String,
    pub answer: String,
    pub asked_at: DateTime<Utc>,
    pub answered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Uninitialized,
    Active,
    Completed,
    Archived,
}

/// Summary plus highlights distilled from one discussion. The confirmed subset and the
/// pending flag are derived from the highlight flags on every read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "SynthesisSnapshot", from = "SynthesisSnapshot")]
pub struct SynthesisResult {
    id: String,
    session_id: String,
    summary: String,
    highlights: Vec<Highlight>,
    created_at: DateTime<Utc>,
}

impl SynthesisResult {
    pub(crate) fn new(
        id: String,
        session_id: String,
        summary: String,
        highlights: Vec<Highlight>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            session_id,
            summary,
            highlights,
            created_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn highlights(&self) -> &[Highlight] {
        &self.highlights
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn highlight(&self, id: &str) -> Option<&Highlight> {
        self.highlights.iter().find(|h| h.id == id)
    }

    pub fn confirmed_highlights(&self) -> Vec<&Highlight> {
        self.highlights
            .iter()
            .filter(|h| h.is_user_confirmed)
            .collect()
    }

    pub fn is_user_confirmation_pending(&self) -> bool {
        !self.highlights.iter().any(|h| h.is_user_confirmed)
    }

    pub(crate) fn highlights_mut(&mut self) -> &mut [Highlight] {
        &mut self.highlights
    }
}

/// Wire form of a [`SynthesisResult`]. The derived fields are written for consumers and
/// ignored when read back, as are the highlights' confirmation flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisSnapshot {
    pub id: String,
    pub session_id: String,
    pub summary: String,
    pub highlights: Vec<Highlight>,
    #[serde(default)]
    pub confirmed_highlight_ids: Vec<String>,
    #[serde(default)]
    pub is_user_confirmation_pending: bool,
    pub created_at: DateTime<Utc>,
}

impl From<SynthesisResult> for SynthesisSnapshot {
    fn from(result: SynthesisResult) -> Self {
        let confirmed_highlight_ids = result
            .confirmed_highlights()
            .into_iter()
            .map(|h| h.id.clone())
            .collect();
        let is_user_confirmation_pending = result.is_user_confirmation_pending();
        Self {
            id: result.id,
            session_id: result.session_id,
            summary: result.summary,
            highlights: result.highlights,
            confirmed_highlight_ids,
            is_user_confirmation_pending,
            created_at: result.created_at,
        }
    }
}

impl From<SynthesisSnapshot> for SynthesisResult {
    fn from(snapshot: SynthesisSnapshot) -> Self {
        Self::new(
            snapshot.id,
            snapshot.session_id,
            snapshot.summary,
            snapshot.highlights,
            snapshot.created_at,
        )
    }
}

/// The enhanced report produced from a document and its confirmed highlights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionResult {
    id: String,
    document_id: String,
    synthesis_id: String,
    highlights_used: Vec<Highlight>,
    enhanced_content: String,
    document: Document,
    created_at: DateTime<Utc>,
}

impl EvolutionResult {
    pub(crate) fn new(
        id: String,
        synthesis_id: String,
        highlights_used: Vec<Highlight>,
        enhanced_content: String,
        document: Document,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            document_id: document.id.clone(),
            synthesis_id,
            highlights_used,
            enhanced_content,
            document,
            created_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn synthesis_id(&self) -> &str {
        &self.synthesis_id
    }

    pub fn highlights_used(&self) -> &[Highlight] {
        &self.highlights_used
    }

    /// The model's enhanced report, verbatim.
    pub fn enhanced_content(&self) -> &str {
        &self.enhanced_content
    }

    /// The four-section version written back to the document store.
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Shape the synthesis prompt asks the model to return.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisPayload {
    #[schemars(description = "A concise summary of what the discussion established")]
    pub summary: String,

    #[schemars(description = "Discrete insights from the discussion, most important first")]
    pub highlights: Vec<HighlightPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HighlightPayload {
    pub category: HighlightCategory,

    #[schemars(description = "A short headline for the insight")]
    pub title: String,

    #[schemars(description = "One or two sentences stating the insight and its evidence")]
    pub content: String,

    pub impact: ImpactLevel,

    #[schemars(description = "True if the insight is absent from the original report")]
    pub is_new_insight: bool,

    #[serde(default)]
    #[schemars(description = "The report section this insight refines, if any")]
    pub source_section: Option<SectionKey>,
}

impl SynthesisPayload {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(SynthesisPayload)
    }

    pub fn schema_as_json() -> Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sections() -> ReportSections {
        ReportSections {
            fundamental_analysis: "Solid balance sheet.".to_string(),
            business_segments: "Cloud and devices.".to_string(),
            growth_catalysts: "AI adoption.".to_string(),
            valuation_analysis: "Trades at 25x earnings.".to_string(),
        }
    }

    #[test]
    fn test_schema_generation() {
        let schema_json = SynthesisPayload::schema_as_json().unwrap();
        assert!(schema_json.contains("summary"));
        assert!(schema_json.contains("highlights"));
        assert!(schema_json.contains("isNewInsight"));
        assert!(schema_json.contains("financial-performance"));
    }

    #[test]
    fn test_document_serializes_flat_camel_case_keys() {
        let doc = Document::new("AAPL-2024", sample_sections());
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["id"], "AAPL-2024");
        assert_eq!(json["fundamentalAnalysis"], "Solid balance sheet.");
        assert_eq!(json["valuationAnalysis"], "Trades at 25x earnings.");

        let back: Document = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_set_blank_section_uses_placeholder() {
        let mut sections = sample_sections();
        sections.set(SectionKey::GrowthCatalysts, "   ");
        assert_eq!(sections.growth_catalysts, SECTION_UNAVAILABLE);
        assert_eq!(sections.unrecovered(), vec![SectionKey::GrowthCatalysts]);
    }

    #[test]
    fn test_section_key_from_key_variants() {
        assert_eq!(
            SectionKey::from_key("fundamentalAnalysis"),
            Some(SectionKey::FundamentalAnalysis)
        );
        assert_eq!(
            SectionKey::from_key("business_segments"),
            Some(SectionKey::BusinessSegments)
        );
        assert_eq!(
            SectionKey::from_key("Growth Catalysts"),
            Some(SectionKey::GrowthCatalysts)
        );
        assert_eq!(SectionKey::from_key("估值分析"), Some(SectionKey::ValuationAnalysis));
        assert_eq!(SectionKey::from_key("summary"), None);
    }

    #[test]
    fn test_category_parse_lenient() {
        assert_eq!(
            HighlightCategory::parse_lenient("financial-performance"),
            HighlightCategory::FinancialPerformance
        );
        assert_eq!(
            HighlightCategory::parse_lenient("Risk_Factor"),
            HighlightCategory::RiskFactor
        );
        assert_eq!(
            HighlightCategory::parse_lenient("市场地位"),
            HighlightCategory::MarketPosition
        );
        assert_eq!(
            HighlightCategory::parse_lenient("macro outlook"),
            HighlightCategory::Other
        );
    }

    #[test]
    fn test_language_detection() {
        assert_eq!(Language::detect("Revenue grew 12% year over year."), Language::English);
        assert_eq!(Language::detect("公司营收同比增长12%，毛利率提升。"), Language::Chinese);
        assert_eq!(Language::parse("zh-CN"), Some(Language::Chinese));
    }

    #[test]
    fn test_render_markdown_contains_all_titles() {
        let doc = Document::new("X", sample_sections());
        let rendered = doc.render_markdown(Language::English);
        for key in SectionKey::ALL {
            assert!(rendered.contains(key.title(Language::English)));
        }
        assert!(rendered.contains("Trades at 25x earnings."));
    }

    #[test]
    fn test_synthesis_snapshot_recomputes_derived_fields() {
        let mut highlight = Highlight::new(
            "hl-1",
            HighlightCategory::RiskFactor,
            "FX exposure",
            "Half of revenue is in euros.",
            ImpactLevel::Medium,
            true,
        );
        highlight.is_user_confirmed = true;
        let result = SynthesisResult::new(
            "syn-1".to_string(),
            "session-1".to_string(),
            "summary".to_string(),
            vec![highlight],
            Utc::now(),
        );

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["confirmedHighlightIds"][0], "hl-1");
        assert_eq!(json["isUserConfirmationPending"], false);
        assert_eq!(json["highlights"][0]["isUserConfirmed"], true);

        let mut tampered = json.clone();
        tampered["isUserConfirmationPending"] = serde_json::Value::Bool(false);
        let back: SynthesisResult = serde_json::from_value(tampered).unwrap();
        assert!(back.is_user_confirmation_pending());
        assert!(back.confirmed_highlights().is_empty());
        assert_eq!(back.highlights()[0].title, "FX exposure");
    }

    #[test]
    fn test_deserialized_highlight_is_unconfirmed() {
        let highlight: Highlight = serde_json::from_str(
            r#"{"id": "hl-x", "category": "risk-factor", "title": "t", "content": "c",
                "impact": "low", "isNewInsight": false, "isUserConfirmed": true}"#,
        )
        .unwrap();
        assert!(!highlight.is_user_confirmed());
    }
}
