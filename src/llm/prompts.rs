// Prompts for the three gateway-bound stages of the refinement flow

use crate::schema::{ConversationTurn, Document, Highlight, Language, SectionKey};

pub const SYSTEM_PROMPT_DISCUSSION_EN: &str = r#"
You are a senior equity research analyst discussing an investment analysis report with its reader.

## GROUNDING
- The report is supplied in full in the first user message. Treat it as your primary source.
- When you go beyond the report, say so explicitly and explain your reasoning.
- If the report does not support a claim, do not invent figures. State what would be needed to verify it.

## STYLE
- Answer the question that was asked, then stop.
- Prefer concrete numbers, dates and named drivers over generic commentary.
- Use short paragraphs or bullet points. No preamble, no closing pleasantries.
"#;

pub const SYSTEM_PROMPT_DISCUSSION_ZH: &str = r#"
你是一名资深股票研究分析师，正在与读者讨论一份投资分析报告。

## 依据
- 报告全文在第一条用户消息中提供，请以其为主要依据。
- 如果回答超出报告内容，请明确说明并给出推理过程。
- 报告无法支持的结论不要编造数据，请说明需要哪些信息才能验证。

## 风格
- 直接回答所提问题，答完即止。
- 优先使用具体数字、日期和明确的驱动因素，避免泛泛而谈。
- 使用简短段落或要点列表，不要开场白和客套结尾。
"#;

pub const SYSTEM_PROMPT_SYNTHESIS: &str = r#"
You are an Investment Insight Synthesizer.

## YOUR MISSION
Read a discussion between an analyst and a reader about an existing report and distill it into:
1. A concise summary of what the discussion established.
2. A list of discrete highlights, each a single insight worth carrying into the next version of the report.

## HIGHLIGHT RULES
- One insight per highlight. Split compound points.
- `category` must be one of: technical-advantage, financial-performance, market-position, risk-factor, investment-recommendation, other.
- `impact` must be one of: high, medium, low.
- `isNewInsight` is true only if the insight is absent from the original report.
- `sourceSection`, when the insight refines an existing section, is one of: fundamentalAnalysis, businessSegments, growthCatalysts, valuationAnalysis.
- Do not restate the report. Only include what the discussion added, corrected or sharpened.
- If the discussion produced nothing new, return an empty highlights array.

## OUTPUT FORMAT
Return a single JSON object in a ```json fenced block, matching this schema:
"#;

pub const SYSTEM_PROMPT_EVOLUTION: &str = r#"
You are a senior equity research editor producing the next version of an investment analysis report.

## YOUR MISSION
Merge the confirmed highlights into the original report.

## RULES
- Keep the four-section structure: Fundamental Analysis, Business Segments, Growth Catalysts, Valuation Analysis.
- Keep every fact of the original that no highlight contradicts. Preserve its figures and dates.
- Work each highlight into the section it concerns. Where a highlight changes a conclusion, update the conclusion and say why.
- Do not add insights that are not in the original report or the confirmed highlights.

## OUTPUT FORMAT
Prefer a single JSON object in a ```json fenced block with the keys
fundamentalAnalysis, businessSegments, growthCatalysts and valuationAnalysis, each holding markdown text.
A richer combined document is acceptable if the content does not fit that shape.
"#;

pub fn discussion_system_prompt(language: Language) -> &'static str {
    match language {
        Language::English => SYSTEM_PROMPT_DISCUSSION_EN,
        Language::Chinese => SYSTEM_PROMPT_DISCUSSION_ZH,
    }
}

fn answer_language_line(language: Language) -> &'static str {
    match language {
        Language::English => "Write all text values in English.",
        Language::Chinese => "所有文本内容请使用简体中文撰写。",
    }
}

pub fn grounding_message(document: &Document, language: Language) -> String {
    format!(
        "## REPORT {} (version {})\n\n{}",
        document.id,
        document.version,
        document.render_markdown(language)
    )
}

pub fn synthesis_system_prompt(schema_json: &str, language: Language) -> String {
    format!(
        "{}\n{}\n\n{}",
        SYSTEM_PROMPT_SYNTHESIS.trim(),
        schema_json,
        answer_language_line(language)
    )
}

pub fn synthesis_user_message(
    transcript: &[ConversationTurn],
    document: &Document,
    language: Language,
) -> String {
    let mut out = grounding_message(document, language);
    out.push_str("\n\n## DISCUSSION TRANSCRIPT\n");
    for (i, turn) in transcript.iter().enumerate() {
        out.push_str(&format!(
            "\n### Q{}\n{}\n\n### A{}\n{}\n",
            i + 1,
            turn.question.trim(),
            i + 1,
            turn.answer.trim()
        ));
    }
    out
}

pub fn evolution_system_prompt(language: Language) -> String {
    let titles = SectionKey::ALL
        .into_iter()
        .map(|key| key.title(language))
        .collect::<Vec<_>>()
        .join(" / ");
    format!(
        "{}\n\nSection titles: {}\n{}",
        SYSTEM_PROMPT_EVOLUTION.trim(),
        titles,
        answer_language_line(language)
    )
}

pub fn evolution_user_message(
    document: &Document,
    highlights: &[Highlight],
    language: Language,
) -> String {
    let mut out = grounding_message(document, language);
    out.push_str("\n\n## CONFIRMED HIGHLIGHTS\n");
    for highlight in highlights {
        let section = highlight
            .source_section
            .map(|key| format!(" [{}]", key.title(language)))
            .unwrap_or_default();
        out.push_str(&format!(
            "\n- ({}, impact {:?}{}) **{}**: {}",
            highlight.category.as_str(),
            highlight.impact,
            section,
            highlight.title.trim(),
            highlight.content.trim()
        ));
    }
    out
}
