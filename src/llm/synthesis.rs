use chrono::Utc;
use log::{info, warn};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::RefinementConfig;
use crate::error::{InsightError, Operation, Result};
use crate::extraction::extract_structured;
use crate::llm::discussion::DiscussionSession;
use crate::llm::gateway::{call_gateway, ChatMessage, CompletionGateway, CompletionRequest};
use crate::llm::prompts;
use crate::schema::{
    Document, Highlight, HighlightCategory, ImpactLevel, SectionKey, SynthesisPayload,
    SynthesisResult, SECTION_UNAVAILABLE,
};
use crate::utils::{generate_id, truncate_chars};

const TITLE_FROM_CONTENT_CHARS: usize = 60;

/// Turns a discussion transcript into a summary and a list of unconfirmed highlights.
pub struct SynthesisEngine {
    gateway: Arc<dyn CompletionGateway>,
    config: RefinementConfig,
}

impl SynthesisEngine {
    pub fn new(gateway: Arc<dyn CompletionGateway>, config: RefinementConfig) -> Self {
        Self { gateway, config }
    }

    /// Synthesizes `session`'s transcript against `original`. A session with no turns is
    /// rejected before any gateway call. Unparseable output degrades to a summary-only
    /// result instead of failing.
    pub async fn synthesize(
        &self,
        session: &DiscussionSession,
        original: &Document,
    ) -> Result<SynthesisResult> {
        if session.turns().is_empty() {
            return Err(InsightError::precondition(
                Operation::Synthesis,
                "the discussion has no answered questions yet",
            ));
        }

        let language = session.language();
        let schema = SynthesisPayload::schema_as_json()?;
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(prompts::synthesis_system_prompt(&schema, language)),
                ChatMessage::user(prompts::synthesis_user_message(
                    session.turns(),
                    original,
                    language,
                )),
            ],
            params: self.config.synthesis.clone(),
        };

        let raw = call_gateway(
            &self.gateway,
            Operation::Synthesis,
            request,
            self.config.synthesis_timeout,
        )
        .await?;

        let (summary, highlights) = parse_synthesis(&raw);
        info!(
            "Synthesis for session {} produced {} highlight(s)",
            session.id(),
            highlights.len()
        );

        Ok(SynthesisResult::new(
            generate_id("synthesis"),
            session.id().to_string(),
            summary,
            highlights,
            Utc::now(),
        ))
    }

    /// Synthesizes against the session's own grounding document and installs the result,
    /// replacing any earlier synthesis. On failure the session keeps its previous result.
    pub async fn synthesize_session<'s>(
        &self,
        session: &'s mut DiscussionSession,
    ) -> Result<&'s SynthesisResult> {
        let original = session.active_document()?.clone();
        let result = self.synthesize(session, &original).await?;
        Ok(session.install_synthesis(result))
    }
}

/// Recovers the summary and validated highlights from a synthesis response.
pub(crate) fn parse_synthesis(raw: &str) -> (String, Vec<Highlight>) {
    let payload = match extract_structured(raw) {
        Ok(payload) => payload,
        Err(failure) => {
            warn!("Synthesis response had no usable structure, keeping it as the summary: {}", failure);
            return (summary_from_leftover(raw), Vec::new());
        }
    };

    let summary = field(&payload.object, &["summary", "discussionSummary", "摘要", "总结"])
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            warn!("Synthesis payload has no summary; recovering it from surrounding text");
            summary_from_leftover(&payload.leftover(raw))
        });

    let highlights = match field(&payload.object, &["highlights", "insights", "亮点"]) {
        Some(Value::Array(items)) => validate_highlights(items),
        Some(other) => {
            warn!("Synthesis payload highlights is not an array: {}", other);
            Vec::new()
        }
        None => {
            warn!("Synthesis payload has no highlights key");
            Vec::new()
        }
    };

    (summary, highlights)
}

fn summary_from_leftover(leftover: &str) -> String {
    let trimmed = leftover.trim();
    if trimmed.is_empty() {
        SECTION_UNAVAILABLE.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Schema check at the boundary: every highlight leaving here has a known category and
/// impact, a non-empty title and content, a unique id, and is unconfirmed.
fn validate_highlights(items: &[Value]) -> Vec<Highlight> {
    let mut seen = HashSet::new();
    let mut highlights = Vec::with_capacity(items.len());

    for (index, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            warn!("Dropping highlight #{}: not an object", index);
            continue;
        };

        let title = string_field(obj, &["title", "headline", "标题"]);
        let content = string_field(obj, &["content", "description", "detail", "内容"]);
        let (title, content) = match (title, content) {
            (None, None) => {
                warn!("Dropping highlight #{}: no title or content", index);
                continue;
            }
            (Some(title), None) => (title.clone(), title),
            (None, Some(content)) => (
                truncate_chars(&content, TITLE_FROM_CONTENT_CHARS).to_string(),
                content,
            ),
            (Some(title), Some(content)) => (title, content),
        };

        let category = string_field(obj, &["category", "type", "类别"])
            .map(|raw| HighlightCategory::parse_lenient(&raw))
            .unwrap_or(HighlightCategory::Other);
        let impact = string_field(obj, &["impact", "impactLevel", "影响"])
            .and_then(|raw| ImpactLevel::parse_lenient(&raw))
            .unwrap_or(ImpactLevel::Medium);
        let is_new_insight = field(obj, &["isNewInsight", "is_new_insight", "newInsight"])
            .and_then(bool_value)
            .unwrap_or(false);

        let id = match string_field(obj, &["id"]) {
            Some(id) if !seen.contains(&id) => id,
            _ => generate_id("hl"),
        };
        seen.insert(id.clone());

        let mut highlight = Highlight::new(id, category, title, content, impact, is_new_insight);
        if let Some(section) = string_field(obj, &["sourceSection", "source_section", "section"])
            .and_then(|raw| SectionKey::from_key(&raw))
        {
            highlight = highlight.with_source_section(section);
        }
        highlights.push(highlight);
    }

    highlights
}

fn field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| obj.get(*name))
}

fn string_field(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    field(obj, names)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn bool_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "是" => Some(true),
            "false" | "no" | "否" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::llm::testing::ScriptedGateway;
    use crate::schema::ReportSections;

    fn document() -> Document {
        let mut sections = ReportSections::placeholder();
        sections.set(SectionKey::FundamentalAnalysis, "Gross margin 41%.");
        Document::new("NVDA", sections)
    }

    async fn session_with_turn(answer: &str) -> DiscussionSession {
        let gateway: Arc<dyn CompletionGateway> =
            Arc::new(ScriptedGateway::new(vec![Ok(answer.to_string())]));
        let mut session = DiscussionSession::new("NVDA");
        session.ground(document(), None).unwrap();
        session
            .ask(&gateway, &RefinementConfig::default(), "What changed?")
            .await
            .unwrap();
        session
    }

    #[test]
    fn test_parse_fenced_payload() {
        let raw = r#"Here you go:
```json
{
  "summary": "Margins are expanding.",
  "highlights": [
    {"id": "h1", "category": "financial-performance", "title": "Margin Expansion",
     "content": "Gross margin up 2pp.", "impact": "high", "isNewInsight": true,
     "sourceSection": "fundamentalAnalysis", "isUserConfirmed": true}
  ]
}
```"#;
        let (summary, highlights) = parse_synthesis(raw);
        assert_eq!(summary, "Margins are expanding.");
        assert_eq!(highlights.len(), 1);
        let h = &highlights[0];
        assert_eq!(h.id, "h1");
        assert_eq!(h.category, HighlightCategory::FinancialPerformance);
        assert_eq!(h.impact, ImpactLevel::High);
        assert!(h.is_new_insight);
        assert!(!h.is_user_confirmed());
        assert_eq!(h.source_section, Some(SectionKey::FundamentalAnalysis));
    }

    #[test]
    fn test_total_failure_keeps_response_as_summary() {
        let raw = "The discussion mostly confirmed the report's view on margins.";
        let (summary, highlights) = parse_synthesis(raw);
        assert_eq!(summary, raw);
        assert!(highlights.is_empty());
    }

    #[test]
    fn test_lenient_highlight_validation() {
        let raw = r#"{"summary": "s", "highlights": [
            {"id": "dup", "category": "Risk Factor", "title": "FX", "content": "Euro exposure", "impact": "severe"},
            {"id": "dup", "category": "crypto", "content": "Bitcoin treasury holdings add volatility", "isNewInsight": "yes"},
            {"category": "other", "title": "", "content": ""},
            "not an object"
        ]}"#;
        let (_, highlights) = parse_synthesis(raw);
        assert_eq!(highlights.len(), 2);

        assert_eq!(highlights[0].category, HighlightCategory::RiskFactor);
        assert_eq!(highlights[0].impact, ImpactLevel::Medium);
        assert_eq!(highlights[0].id, "dup");

        assert_eq!(highlights[1].category, HighlightCategory::Other);
        assert_ne!(highlights[1].id, "dup");
        assert!(highlights[1].is_new_insight);
        assert_eq!(highlights[1].title, "Bitcoin treasury holdings add volatility");
    }

    #[test]
    fn test_missing_summary_recovered_from_prose() {
        let raw = "Overall the reader's questions sharpened the margin story.\n\n{\"highlights\": []}";
        let (summary, highlights) = parse_synthesis(raw);
        assert_eq!(summary, "Overall the reader's questions sharpened the margin story.");
        assert!(highlights.is_empty());
    }

    #[tokio::test]
    async fn test_zero_turn_session_is_rejected_without_call() {
        let scripted = Arc::new(ScriptedGateway::new(vec![Ok("{}".to_string())]));
        let engine = SynthesisEngine::new(scripted.clone(), RefinementConfig::default());
        let mut session = DiscussionSession::new("NVDA");
        session.ground(document(), None).unwrap();

        let err = engine.synthesize(&session, &document()).await.unwrap_err();
        assert!(matches!(
            err,
            InsightError::Precondition {
                operation: Operation::Synthesis,
                ..
            }
        ));
        assert_eq!(scripted.calls(), 0);
    }

    #[tokio::test]
    async fn test_request_embeds_schema_and_transcript() {
        let session = session_with_turn("Data center revenue doubled.").await;
        let scripted = Arc::new(ScriptedGateway::new(vec![Ok(
            r#"{"summary": "ok", "highlights": []}"#.to_string(),
        )]));
        let engine = SynthesisEngine::new(scripted.clone(), RefinementConfig::default());

        let result = engine.synthesize(&session, &document()).await.unwrap();
        assert_eq!(result.session_id(), session.id());
        assert!(result.is_user_confirmation_pending());

        let request = scripted.last_request().unwrap();
        assert!(request.messages[0].content.contains("isNewInsight"));
        assert!(request.messages[1].content.contains("Data center revenue doubled."));
        assert!(request.messages[1].content.contains("Gross margin 41%."));
    }

    #[tokio::test]
    async fn test_rerun_replaces_previous_result() {
        let mut session = session_with_turn("Answer.").await;
        let scripted = Arc::new(ScriptedGateway::new(vec![
            Ok(r#"{"summary": "first", "highlights": [{"title": "A", "content": "a"}]}"#.to_string()),
            Ok(r#"{"summary": "second", "highlights": [{"title": "B", "content": "b"}, {"title": "C", "content": "c"}]}"#.to_string()),
        ]));
        let engine = SynthesisEngine::new(scripted.clone(), RefinementConfig::default());

        engine.synthesize_session(&mut session).await.unwrap();
        session.confirm_all_highlights().unwrap();
        let second = engine.synthesize_session(&mut session).await.unwrap();

        assert_eq!(second.summary(), "second");
        assert_eq!(second.highlights().len(), 2);
        assert!(second.is_user_confirmation_pending());
    }

    #[tokio::test]
    async fn test_upstream_failure_keeps_previous_result() {
        let mut session = session_with_turn("Answer.").await;
        let scripted = Arc::new(ScriptedGateway::new(vec![
            Ok(r#"{"summary": "kept", "highlights": []}"#.to_string()),
            Err(GatewayError::Network("reset".to_string())),
        ]));
        let engine = SynthesisEngine::new(scripted.clone(), RefinementConfig::default());

        engine.synthesize_session(&mut session).await.unwrap();
        assert!(engine.synthesize_session(&mut session).await.is_err());
        assert_eq!(session.synthesis().unwrap().summary(), "kept");
    }
}
