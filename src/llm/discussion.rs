use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::config::RefinementConfig;
use crate::confirmation;
use crate::error::{GatewayError, InsightError, Operation, Result};
use crate::llm::gateway::{call_gateway, ChatMessage, CompletionGateway, CompletionRequest};
use crate::llm::prompts;
use crate::schema::{ConversationTurn, Document, Language, SessionStatus, SynthesisResult};
use crate::store::DocumentStore;
use crate::utils::generate_id;

/// A conversation grounded in one document.
///
/// Turns are only ever appended after the gateway answered, so a failed, timed-out or
/// cancelled question leaves the session exactly as it was.
#[derive(Debug, Clone)]
pub struct DiscussionSession {
    id: String,
    context_id: String,
    language: Language,
    document: Option<Document>,
    turns: Vec<ConversationTurn>,
    question_count: u32,
    status: SessionStatus,
    synthesis: Option<SynthesisResult>,
    synthesis_saved: bool,
    created_at: DateTime<Utc>,
}

impl DiscussionSession {
    /// A fresh session for a viewing context, typically the id of the document on screen.
    pub fn new(context_id: impl Into<String>) -> Self {
        Self {
            id: generate_id("session"),
            context_id: context_id.into(),
            language: Language::default(),
            document: None,
            turns: Vec::new(),
            question_count: 0,
            status: SessionStatus::Uninitialized,
            synthesis: None,
            synthesis_saved: false,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn document(&self) -> Option<&Document> {
        self.document.as_ref()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn question_count(&self) -> u32 {
        self.question_count
    }

    pub fn synthesis(&self) -> Option<&SynthesisResult> {
        self.synthesis.as_ref()
    }

    pub fn is_synthesis_saved(&self) -> bool {
        self.synthesis_saved
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Loads the grounding document from the store and activates the session.
    pub async fn load(
        &mut self,
        store: &dyn DocumentStore,
        document_id: &str,
        language: Option<Language>,
    ) -> Result<()> {
        let document = store.get(document_id).await?;
        self.ground(document, language)
    }

    /// Activates the session on `document`. An active session may be re-grounded, for
    /// example on the evolved version of its document.
    pub fn ground(&mut self, document: Document, language: Option<Language>) -> Result<()> {
        match self.status {
            SessionStatus::Uninitialized | SessionStatus::Active => {}
            status => {
                return Err(InsightError::precondition(
                    Operation::Discussion,
                    format!("session {} is {:?}", self.id, status),
                ))
            }
        }

        self.language = language.unwrap_or_else(|| document.detect_language());
        debug!(
            "Session {} grounded on {} v{} ({})",
            self.id,
            document.id,
            document.version,
            self.language.code()
        );
        self.document = Some(document);
        self.status = SessionStatus::Active;
        Ok(())
    }

    /// Sends one question and appends the answered turn.
    pub async fn ask(
        &mut self,
        gateway: &Arc<dyn CompletionGateway>,
        config: &RefinementConfig,
        question: &str,
    ) -> Result<&ConversationTurn> {
        let question = question.trim();
        if question.is_empty() {
            return Err(InsightError::precondition(
                Operation::Discussion,
                "question is empty",
            ));
        }
        let document = self.active_document()?;

        let mut messages = vec![
            ChatMessage::system(prompts::discussion_system_prompt(self.language).trim()),
            ChatMessage::user(prompts::grounding_message(document, self.language)),
        ];
        for turn in &self.turns {
            messages.push(ChatMessage::user(turn.question.clone()));
            messages.push(ChatMessage::assistant(turn.answer.clone()));
        }
        messages.push(ChatMessage::user(question));

        let request = CompletionRequest {
            messages,
            params: config.discussion.clone(),
        };

        let asked_at = Utc::now();
        let answer = call_gateway(
            gateway,
            Operation::Discussion,
            request,
            config.discussion_timeout,
        )
        .await?;

        if answer.trim().is_empty() {
            return Err(InsightError::upstream(
                Operation::Discussion,
                GatewayError::InvalidResponse("empty answer".to_string()),
            ));
        }

        self.turns.push(ConversationTurn {
            question: question.to_string(),
            answer,
            asked_at,
            answered_at: Utc::now(),
        });
        self.question_count += 1;

        let index = self.turns.len() - 1;
        Ok(&self.turns[index])
    }

    /// Replaces any previous synthesis in full. A replaced synthesis must be saved again.
    pub fn install_synthesis(&mut self, result: SynthesisResult) -> &SynthesisResult {
        self.synthesis_saved = false;
        self.synthesis.insert(result)
    }

    pub fn toggle_highlight(&mut self, highlight_id: &str) -> Result<&SynthesisResult> {
        let next = confirmation::toggle(self.current_synthesis()?, highlight_id)?;
        Ok(self.synthesis.insert(next))
    }

    pub fn confirm_highlight(&mut self, highlight_id: &str) -> Result<&SynthesisResult> {
        let next = confirmation::confirm(self.current_synthesis()?, highlight_id)?;
        Ok(self.synthesis.insert(next))
    }

    pub fn confirm_all_highlights(&mut self) -> Result<&SynthesisResult> {
        let next = confirmation::confirm_all(self.current_synthesis()?);
        Ok(self.synthesis.insert(next))
    }

    /// Marks the current synthesis as kept, so closing the context archives the session
    /// instead of discarding it.
    pub fn save_synthesis(&mut self) -> Result<()> {
        self.current_synthesis()?;
        self.synthesis_saved = true;
        Ok(())
    }

    pub fn complete(&mut self) {
        if self.status == SessionStatus::Active || self.status == SessionStatus::Uninitialized {
            self.status = SessionStatus::Completed;
        }
    }

    fn archive(&mut self) {
        self.status = SessionStatus::Archived;
    }

    pub(crate) fn active_document(&self) -> Result<&Document> {
        match (&self.status, &self.document) {
            (SessionStatus::Active, Some(document)) => Ok(document),
            (status, _) => Err(InsightError::precondition(
                Operation::Discussion,
                format!("session {} is {:?}, not active", self.id, status),
            )),
        }
    }

    fn current_synthesis(&self) -> Result<&SynthesisResult> {
        self.synthesis.as_ref().ok_or_else(|| {
            InsightError::precondition(
                Operation::Synthesis,
                format!("session {} has no synthesis result", self.id),
            )
        })
    }
}

pub type SharedSession = Arc<Mutex<DiscussionSession>>;

struct SessionEntry {
    context_id: String,
    session: SharedSession,
}

#[derive(Default)]
struct SessionIndex {
    sessions: HashMap<String, SessionEntry>,
    active_by_context: HashMap<String, String>,
}

/// Sessions keyed by id, with at most one active session per viewing context.
///
/// Sessions are shared behind an async mutex: a caller holds the lock for the whole of a
/// gateway call, so a second question on the same session waits for the first answer.
/// The index guard is never held across a session lock or a store read, so a busy session
/// never delays lookups of the others.
#[derive(Default)]
pub struct SessionStore {
    index: RwLock<SessionIndex>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session grounded on `document_id` for the context of the same name.
    /// A previously active session of that context is completed.
    pub async fn open(
        &self,
        store: &dyn DocumentStore,
        document_id: &str,
        language: Option<Language>,
    ) -> Result<SharedSession> {
        let mut session = DiscussionSession::new(document_id);
        session.load(store, document_id, language).await?;
        Ok(self.register(session).await)
    }

    /// Registers an already grounded session as the active one of its context.
    ///
    /// The replaced session is completed once any call in flight on it finishes. Unless
    /// its synthesis was saved, it is then dropped from the store with its transcript.
    pub async fn register(&self, session: DiscussionSession) -> SharedSession {
        let session_id = session.id().to_string();
        let context_id = session.context_id().to_string();
        let shared = Arc::new(Mutex::new(session));

        let previous = {
            let mut index = self.index.write().await;
            index.sessions.insert(
                session_id.clone(),
                SessionEntry {
                    context_id: context_id.clone(),
                    session: shared.clone(),
                },
            );
            index
                .active_by_context
                .insert(context_id.clone(), session_id)
                .and_then(|id| {
                    let session = index.sessions.get(&id)?.session.clone();
                    Some((id, session))
                })
        };

        if let Some((previous_id, previous)) = previous {
            let keep = {
                let mut previous = previous.lock().await;
                previous.complete();
                previous.is_synthesis_saved()
            };
            if keep {
                debug!("Session {} completed by a new session on {}", previous_id, context_id);
            } else {
                self.index.write().await.sessions.remove(&previous_id);
                debug!(
                    "Session {} replaced on {} and dropped with its unsaved log",
                    previous_id, context_id
                );
            }
        }

        shared
    }

    pub async fn get(&self, session_id: &str) -> Option<SharedSession> {
        self.index
            .read()
            .await
            .sessions
            .get(session_id)
            .map(|entry| entry.session.clone())
    }

    pub async fn active_for(&self, context_id: &str) -> Option<SharedSession> {
        let index = self.index.read().await;
        index
            .active_by_context
            .get(context_id)
            .and_then(|session_id| index.sessions.get(session_id))
            .map(|entry| entry.session.clone())
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.sessions.is_empty()
    }

    /// Closes a viewing context. Sessions with a saved synthesis are archived and kept;
    /// every other session of the context is discarded with its conversation log.
    /// Returns the ids of the archived sessions.
    pub async fn close_context(&self, context_id: &str) -> Vec<String> {
        let entries: Vec<(String, SharedSession)> = {
            let mut index = self.index.write().await;
            index.active_by_context.remove(context_id);
            index
                .sessions
                .iter()
                .filter(|(_, entry)| entry.context_id == context_id)
                .map(|(id, entry)| (id.clone(), entry.session.clone()))
                .collect()
        };

        let mut archived = Vec::new();
        let mut discarded = Vec::new();
        for (id, session) in entries {
            let mut session = session.lock().await;
            if session.is_synthesis_saved() {
                session.archive();
                archived.push(id);
            } else {
                discarded.push(id);
            }
        }

        if !discarded.is_empty() {
            let mut index = self.index.write().await;
            for id in &discarded {
                index.sessions.remove(id);
            }
        }

        info!(
            "Closed context {}: {} session(s) archived, {} discarded",
            context_id,
            archived.len(),
            discarded.len()
        );
        archived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedGateway;
    use crate::llm::gateway::Role;
    use crate::schema::{Highlight, HighlightCategory, ImpactLevel, ReportSections, SectionKey};
    use crate::store::InMemoryDocumentStore;

    fn document(id: &str) -> Document {
        let mut sections = ReportSections::placeholder();
        sections.set(
            SectionKey::FundamentalAnalysis,
            "Revenue grew 12% with operating margin at 31%.",
        );
        Document::new(id, sections)
    }

    fn active_session() -> DiscussionSession {
        let mut session = DiscussionSession::new("AAPL");
        session.ground(document("AAPL"), None).unwrap();
        session
    }

    fn synthesis(session: &DiscussionSession) -> SynthesisResult {
        SynthesisResult::new(
            "syn-1".to_string(),
            session.id().to_string(),
            "summary".to_string(),
            vec![Highlight::new(
                "hl-1",
                HighlightCategory::FinancialPerformance,
                "Margin",
                "Up 2pp",
                ImpactLevel::High,
                true,
            )],
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_ask_appends_turn_and_counts() {
        let scripted = Arc::new(ScriptedGateway::new(vec![
            Ok("Margins expanded.".to_string()),
            Ok("Mostly services.".to_string()),
        ]));
        let gateway: Arc<dyn CompletionGateway> = scripted.clone();
        let config = RefinementConfig::default();
        let mut session = active_session();

        session.ask(&gateway, &config, "Margin trend?").await.unwrap();
        session.ask(&gateway, &config, "Mix?").await.unwrap();

        assert_eq!(session.question_count(), 2);
        assert_eq!(session.turns()[0].answer, "Margins expanded.");
        assert_eq!(session.turns()[1].question, "Mix?");

        let request = scripted.last_request().unwrap();
        assert_eq!(request.messages[0].role, Role::System);
        assert!(request.messages[1].content.contains("operating margin at 31%"));
        assert_eq!(request.messages.last().unwrap().content, "Mix?");
        assert_eq!(request.messages.len(), 5);
    }

    #[tokio::test]
    async fn test_empty_question_is_rejected_without_call() {
        let scripted = Arc::new(ScriptedGateway::new(vec![]));
        let gateway: Arc<dyn CompletionGateway> = scripted.clone();
        let mut session = active_session();

        let err = session
            .ask(&gateway, &RefinementConfig::default(), "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, InsightError::Precondition { .. }));
        assert_eq!(scripted.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_question_leaves_session_unchanged() {
        let gateway: Arc<dyn CompletionGateway> = Arc::new(ScriptedGateway::new(vec![Err(
            GatewayError::Status {
                status: 500,
                body: "boom".to_string(),
            },
        )]));
        let mut session = active_session();

        let err = session
            .ask(&gateway, &RefinementConfig::default(), "Why?")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InsightError::Upstream {
                operation: Operation::Discussion,
                ..
            }
        ));
        assert!(session.turns().is_empty());
        assert_eq!(session.question_count(), 0);
    }

    #[tokio::test]
    async fn test_uninitialized_session_cannot_ask() {
        let scripted = Arc::new(ScriptedGateway::new(vec![Ok("hi".to_string())]));
        let gateway: Arc<dyn CompletionGateway> = scripted.clone();
        let mut session = DiscussionSession::new("AAPL");
        assert_eq!(session.status(), SessionStatus::Uninitialized);

        let err = session
            .ask(&gateway, &RefinementConfig::default(), "Hello?")
            .await
            .unwrap_err();
        assert!(matches!(err, InsightError::Precondition { .. }));
        assert_eq!(scripted.calls(), 0);
    }

    #[test]
    fn test_language_detected_from_document() {
        let mut sections = ReportSections::placeholder();
        sections.set(SectionKey::FundamentalAnalysis, "公司营收同比增长百分之十二，毛利率持续提升。");
        let mut session = DiscussionSession::new("600519");
        session.ground(Document::new("600519", sections), None).unwrap();
        assert_eq!(session.language(), Language::Chinese);

        let mut fixed = DiscussionSession::new("600519");
        fixed
            .ground(document("600519"), Some(Language::Chinese))
            .unwrap();
        assert_eq!(fixed.language(), Language::Chinese);
    }

    #[test]
    fn test_gate_operations_need_synthesis() {
        let mut session = active_session();
        assert!(session.confirm_all_highlights().is_err());
        assert!(session.save_synthesis().is_err());

        let result = synthesis(&session);
        session.install_synthesis(result);
        let pending = session.toggle_highlight("hl-1").unwrap().is_user_confirmation_pending();
        assert!(!pending);
        assert!(session.toggle_highlight("hl-404").is_err());
        assert_eq!(session.synthesis().unwrap().confirmed_highlights().len(), 1);
    }

    #[tokio::test]
    async fn test_open_completes_and_drops_unsaved_previous_session() {
        let store = InMemoryDocumentStore::with_documents([document("AAPL")]);
        let sessions = SessionStore::new();

        let first = sessions.open(&store, "AAPL", None).await.unwrap();
        let first_id = first.lock().await.id().to_string();
        let second = sessions.open(&store, "AAPL", None).await.unwrap();

        assert_eq!(first.lock().await.status(), SessionStatus::Completed);
        assert_eq!(second.lock().await.status(), SessionStatus::Active);
        assert!(sessions.get(&first_id).await.is_none());
        assert_eq!(sessions.len().await, 1);
        let active = sessions.active_for("AAPL").await.unwrap();
        assert!(Arc::ptr_eq(&active, &second));
    }

    #[tokio::test]
    async fn test_replaced_session_with_saved_synthesis_is_kept() {
        let store = InMemoryDocumentStore::with_documents([document("AAPL")]);
        let sessions = SessionStore::new();

        let first = sessions.open(&store, "AAPL", None).await.unwrap();
        let first_id = {
            let mut session = first.lock().await;
            let result = synthesis(&session);
            session.install_synthesis(result);
            session.save_synthesis().unwrap();
            session.id().to_string()
        };
        sessions.open(&store, "AAPL", None).await.unwrap();

        let kept = sessions.get(&first_id).await.unwrap();
        assert_eq!(kept.lock().await.status(), SessionStatus::Completed);
        assert_eq!(sessions.len().await, 2);
    }

    #[tokio::test]
    async fn test_lookup_is_not_blocked_by_busy_session() {
        let store = InMemoryDocumentStore::with_documents([document("AAPL"), document("MSFT")]);
        let sessions = Arc::new(SessionStore::new());

        let busy = sessions.open(&store, "AAPL", None).await.unwrap();
        let other = sessions.open(&store, "MSFT", None).await.unwrap();
        let other_id = other.lock().await.id().to_string();

        let guard = busy.lock().await;
        let reopen = {
            let sessions = sessions.clone();
            let store = InMemoryDocumentStore::with_documents([document("AAPL")]);
            tokio::spawn(async move { sessions.open(&store, "AAPL", None).await.map(|_| ()) })
        };
        // Wait until the new session is registered and the reopen waits on `busy`.
        while Arc::ptr_eq(&sessions.active_for("AAPL").await.unwrap(), &busy) {
            tokio::task::yield_now().await;
        }

        let found = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            sessions.get(&other_id),
        )
        .await
        .unwrap();
        assert!(found.is_some());

        drop(guard);
        reopen.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_open_missing_document_registers_nothing() {
        let store = InMemoryDocumentStore::new();
        let sessions = SessionStore::new();
        let err = sessions.open(&store, "GONE", None).await.unwrap_err();
        assert!(matches!(err, InsightError::DocumentNotFound(_)));
        assert!(sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_context_archives_only_saved_sessions() {
        let store = InMemoryDocumentStore::with_documents([document("AAPL")]);
        let sessions = SessionStore::new();

        let saved = sessions.open(&store, "AAPL", None).await.unwrap();
        let saved_id = {
            let mut session = saved.lock().await;
            let result = synthesis(&session);
            session.install_synthesis(result);
            session.save_synthesis().unwrap();
            session.id().to_string()
        };

        let unsaved = sessions.open(&store, "AAPL", None).await.unwrap();
        let unsaved_id = unsaved.lock().await.id().to_string();

        let archived = sessions.close_context("AAPL").await;
        assert_eq!(archived, vec![saved_id.clone()]);
        assert!(sessions.get(&unsaved_id).await.is_none());
        assert_eq!(
            sessions.get(&saved_id).await.unwrap().lock().await.status(),
            SessionStatus::Archived
        );
        assert!(sessions.active_for("AAPL").await.is_none());
    }
}
