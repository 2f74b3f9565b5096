//! # Insight Refiner
//!
//! A library for turning LLM-generated investment analysis into a reliable four-section
//! report, and for refining that report through a grounded conversation.
//!
//! ## Core Concepts
//!
//! - **Extraction**: model output is untrusted text. [`extract`] recovers the four report
//!   sections from fenced JSON, bare JSON, the longest balanced-brace span, or, failing all
//!   of those, bilingual section headings and paragraph segmentation. It never fails.
//! - **Discussion**: a [`DiscussionSession`] asks questions about one document and keeps the
//!   answered turns in order.
//! - **Synthesis**: the [`SynthesisEngine`] distills a transcript into categorized
//!   [`Highlight`]s, all unconfirmed.
//! - **Confirmation**: pure transitions in [`confirmation`] are the only way a highlight
//!   becomes confirmed.
//! - **Evolution**: the [`EvolutionGenerator`] merges the confirmed highlights into the next
//!   version of the document.
//!
//! ## Example
//!
//! ```rust,ignore
//! use insight_refiner::*;
//! use std::sync::Arc;
//!
//! let gateway: Arc<dyn CompletionGateway> = Arc::new(GeminiClient::from_env()?);
//! let store = Arc::new(InMemoryDocumentStore::with_documents([document]));
//! let refiner = InsightRefiner::new(gateway, store, RefinementConfig::from_env()?);
//!
//! let session_id = refiner.open_session("AAPL-2024Q4").await?;
//! refiner.ask(&session_id, "What is the margin trend?").await?;
//! let synthesis = refiner.synthesize(&session_id).await?;
//! refiner.toggle_highlight(&session_id, &synthesis.highlights()[0].id).await?;
//! let evolution = refiner.evolve(&session_id, None).await?;
//! println!("{}", evolution.document().render_markdown(Language::English));
//! ```

pub mod config;
pub mod confirmation;
pub mod error;
pub mod extraction;
pub mod heuristics;
pub mod llm;
pub mod schema;
pub mod store;
pub mod utils;

pub use config::RefinementConfig;
pub use error::{GatewayError, InsightError, Operation, Result};
pub use extraction::{
    extract, extract_structured, Extraction, ExtractionFailure, ExtractionSource, ParseTier,
    ReportExtractor, StructuredPayload,
};
pub use heuristics::{segment, SectionOrigin, SectionSegmenter, Segmentation};
pub use llm::*;
pub use schema::*;
pub use store::*;

use log::{debug, info};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

/// Wires the refinement flow to one gateway and one document store, with sessions tracked
/// per viewing context.
pub struct InsightRefiner {
    gateway: Arc<dyn CompletionGateway>,
    store: Arc<dyn DocumentStore>,
    config: RefinementConfig,
    synthesis: SynthesisEngine,
    evolution: EvolutionGenerator,
    sessions: SessionStore,
}

impl InsightRefiner {
    pub fn new(
        gateway: Arc<dyn CompletionGateway>,
        store: Arc<dyn DocumentStore>,
        config: RefinementConfig,
    ) -> Self {
        Self {
            synthesis: SynthesisEngine::new(gateway.clone(), config.clone()),
            evolution: EvolutionGenerator::new(gateway.clone(), store.clone(), config.clone()),
            gateway,
            store,
            config,
            sessions: SessionStore::new(),
        }
    }

    pub fn with_meter(mut self, meter: Arc<dyn UsageMeter>) -> Self {
        self.evolution = self.evolution.with_meter(meter);
        self
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    /// Opens a session grounded on `document_id`, completing any earlier session of that
    /// document's context. Returns the new session id.
    pub async fn open_session(&self, document_id: &str) -> Result<String> {
        let session = self
            .sessions
            .open(self.store.as_ref(), document_id, self.config.language)
            .await?;
        let id = session.lock().await.id().to_string();
        info!("Opened session {} on {}", id, document_id);
        Ok(id)
    }

    /// The shared session, for callers that drive it directly.
    pub async fn session(&self, session_id: &str) -> Result<SharedSession> {
        self.sessions
            .get(session_id)
            .await
            .ok_or_else(|| InsightError::SessionNotFound(session_id.to_string()))
    }

    pub async fn ask(&self, session_id: &str, question: &str) -> Result<ConversationTurn> {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;
        let turn = session.ask(&self.gateway, &self.config, question).await?;
        Ok(turn.clone())
    }

    pub async fn synthesize(&self, session_id: &str) -> Result<SynthesisResult> {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;
        let result = self.synthesis.synthesize_session(&mut session).await?;
        Ok(result.clone())
    }

    pub async fn toggle_highlight(
        &self,
        session_id: &str,
        highlight_id: &str,
    ) -> Result<SynthesisResult> {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;
        Ok(session.toggle_highlight(highlight_id)?.clone())
    }

    pub async fn confirm_highlight(
        &self,
        session_id: &str,
        highlight_id: &str,
    ) -> Result<SynthesisResult> {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;
        Ok(session.confirm_highlight(highlight_id)?.clone())
    }

    pub async fn confirm_all_highlights(&self, session_id: &str) -> Result<SynthesisResult> {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;
        Ok(session.confirm_all_highlights()?.clone())
    }

    pub async fn save_synthesis(&self, session_id: &str) -> Result<()> {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;
        session.save_synthesis()
    }

    /// Evolves the session's document with its confirmed highlights and re-grounds the
    /// session on the new version.
    ///
    /// The session is first re-grounded on the stored document when the store holds a newer
    /// version, so an evolution whose write landed before the caller gave up is built on
    /// rather than overwritten.
    pub async fn evolve(
        &self,
        session_id: &str,
        progress: Option<Sender<RefinementEvent>>,
    ) -> Result<EvolutionResult> {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;

        let grounded = session.active_document()?.clone();
        let synthesis = session.synthesis().cloned().ok_or_else(|| {
            InsightError::precondition(Operation::Evolution, "no synthesis result to evolve from")
        })?;
        let language = Some(session.language());

        let stored = self.store.get(&grounded.id).await?;
        let original = if stored.version > grounded.version {
            debug!(
                "Session {} catches up on {} v{} before evolving",
                session_id, stored.id, stored.version
            );
            session.ground(stored.clone(), language)?;
            stored
        } else {
            grounded
        };

        let result = self
            .evolution
            .evolve(&original, &synthesis, language, progress)
            .await?;
        session.ground(result.document().clone(), language)?;
        Ok(result)
    }

    /// Closes a document's viewing context. See [`SessionStore::close_context`].
    pub async fn close_context(&self, context_id: &str) -> Vec<String> {
        self.sessions.close_context(context_id).await
    }
}
