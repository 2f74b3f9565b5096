use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

use crate::config::RefinementConfig;
use crate::error::{GatewayError, InsightError, Operation, Result};
use crate::extraction::ReportExtractor;
use crate::llm::gateway::{call_gateway, ChatMessage, CompletionGateway, CompletionRequest};
use crate::llm::prompts;
use crate::llm::types::RefinementEvent;
use crate::schema::{Document, EvolutionResult, Highlight, Language, SectionKey, SynthesisResult};
use crate::store::{DocumentStore, NoopUsageMeter, UsageEvent, UsageMeter};
use crate::utils::generate_id;

/// Regenerates a document so that it incorporates the user-confirmed highlights, then writes
/// the new version back to the store.
pub struct EvolutionGenerator {
    gateway: Arc<dyn CompletionGateway>,
    store: Arc<dyn DocumentStore>,
    meter: Arc<dyn UsageMeter>,
    config: RefinementConfig,
}

impl EvolutionGenerator {
    pub fn new(
        gateway: Arc<dyn CompletionGateway>,
        store: Arc<dyn DocumentStore>,
        config: RefinementConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            meter: Arc::new(NoopUsageMeter),
            config,
        }
    }

    pub fn with_meter(mut self, meter: Arc<dyn UsageMeter>) -> Self {
        self.meter = meter;
        self
    }

    /// Evolves the stored document `document_id` with the confirmed highlights of `synthesis`.
    pub async fn evolve_stored(
        &self,
        document_id: &str,
        synthesis: &SynthesisResult,
        language: Option<Language>,
        progress: Option<Sender<RefinementEvent>>,
    ) -> Result<EvolutionResult> {
        let original = self.store.get(document_id).await?;
        self.evolve(&original, synthesis, language, progress).await
    }

    /// Evolves `original` with the highlights of `synthesis` the user confirmed.
    pub async fn evolve(
        &self,
        original: &Document,
        synthesis: &SynthesisResult,
        language: Option<Language>,
        progress: Option<Sender<RefinementEvent>>,
    ) -> Result<EvolutionResult> {
        let confirmed: Vec<Highlight> = synthesis
            .confirmed_highlights()
            .into_iter()
            .cloned()
            .collect();
        self.evolve_with(original, &confirmed, synthesis.id(), language, progress)
            .await
    }

    /// Evolves `original` with `highlights`, of which only the confirmed ones are used.
    /// With none confirmed the call is rejected before reaching the gateway.
    pub async fn evolve_with(
        &self,
        original: &Document,
        highlights: &[Highlight],
        synthesis_id: &str,
        language: Option<Language>,
        progress: Option<Sender<RefinementEvent>>,
    ) -> Result<EvolutionResult> {
        let confirmed: Vec<Highlight> = highlights
            .iter()
            .filter(|h| h.is_user_confirmed())
            .cloned()
            .collect();
        if confirmed.is_empty() {
            return Err(InsightError::precondition(
                Operation::Evolution,
                "no confirmed highlights to merge",
            ));
        }

        self.send_event(
            &progress,
            RefinementEvent::Starting {
                document_id: original.id.clone(),
                highlight_count: confirmed.len(),
            },
        )
        .await;

        match self
            .run(original, &confirmed, synthesis_id, language, &progress)
            .await
        {
            Ok(result) => {
                self.send_event(&progress, RefinementEvent::Success).await;
                Ok(result)
            }
            Err(e) => {
                self.send_event(
                    &progress,
                    RefinementEvent::Failed {
                        reason: e.to_string(),
                    },
                )
                .await;
                Err(InsightError::EvolutionFailed {
                    document_id: original.id.clone(),
                    highlight_ids: confirmed.iter().map(|h| h.id.clone()).collect(),
                    source: Box::new(e),
                })
            }
        }
    }

    async fn run(
        &self,
        original: &Document,
        confirmed: &[Highlight],
        synthesis_id: &str,
        language: Option<Language>,
        progress: &Option<Sender<RefinementEvent>>,
    ) -> Result<EvolutionResult> {
        let language = language
            .or(self.config.language)
            .unwrap_or_else(|| original.detect_language());
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(prompts::evolution_system_prompt(language)),
                ChatMessage::user(prompts::evolution_user_message(original, confirmed, language)),
            ],
            params: self.config.evolution.clone(),
        };

        self.send_event(progress, RefinementEvent::RequestSent).await;
        let enhanced = call_gateway(
            &self.gateway,
            Operation::Evolution,
            request,
            self.config.evolution_timeout,
        )
        .await?;

        if enhanced.trim().is_empty() {
            return Err(InsightError::upstream(
                Operation::Evolution,
                GatewayError::InvalidResponse("empty enhanced document".to_string()),
            ));
        }
        self.send_event(
            progress,
            RefinementEvent::ResponseReceived {
                chars: enhanced.chars().count(),
            },
        )
        .await;

        let evolved = self.evolved_document(original, &enhanced);
        self.send_event(
            progress,
            RefinementEvent::Persisting {
                version: evolved.version,
            },
        )
        .await;
        self.store.put(&evolved.id, evolved.clone()).await?;

        let result = EvolutionResult::new(
            generate_id("evolution"),
            synthesis_id.to_string(),
            confirmed.to_vec(),
            enhanced,
            evolved,
            Utc::now(),
        );

        let usage = UsageEvent {
            document_id: result.document_id().to_string(),
            evolution_id: result.id().to_string(),
            highlight_count: confirmed.len(),
            output_chars: result.enhanced_content().chars().count(),
            recorded_at: result.created_at(),
        };
        if let Err(e) = self.meter.record_generation(usage).await {
            warn!("Usage metering failed for evolution {}: {}", result.id(), e);
        }

        info!(
            "Evolved document {} to version {} with {} highlight(s)",
            result.document_id(),
            result.document().version,
            confirmed.len()
        );
        Ok(result)
    }

    /// Four-section form of the enhanced payload. Only sections taken from structure or
    /// found under their own label replace the original's text; the rest keep it.
    fn evolved_document(&self, original: &Document, enhanced: &str) -> Document {
        let extraction = ReportExtractor::new(self.config.min_section_chars).extract(enhanced);
        let mut sections = extraction.sections.clone();

        for key in SectionKey::ALL {
            let usable = extraction.is_anchored(key) && sections.is_recovered(key);
            if !usable && original.sections.is_recovered(key) {
                warn!(
                    "Enhanced document for {} lacks {}; keeping the previous text",
                    original.id, key
                );
                sections.set(key, original.sections.get(key).to_string());
            }
        }
        debug!(
            "Enhanced document for {} parsed via {:?}",
            original.id, extraction.source
        );

        Document {
            id: original.id.clone(),
            version: original.version + 1,
            sections,
        }
    }

    async fn send_event(&self, sender: &Option<Sender<RefinementEvent>>, event: RefinementEvent) {
        if let Some(tx) = sender {
            let _ = tx.send(event).await;
        }
    }
}
