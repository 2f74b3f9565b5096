//! Collaborators the refinement flow reads and writes through: the document store and the
//! usage meter. In-memory versions are provided for embedding and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::RwLock;

use crate::error::{InsightError, Result};
use crate::schema::Document;

/// Documents keyed by report identity. Writes are last-write-wins.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, document_id: &str) -> Result<Document>;

    async fn put(&self, document_id: &str, document: Document) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<String, Document>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(documents: impl IntoIterator<Item = Document>) -> Self {
        let documents = documents
            .into_iter()
            .map(|doc| (doc.id.clone(), doc))
            .collect();
        Self {
            documents: RwLock::new(documents),
        }
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, document_id: &str) -> Result<Document> {
        self.documents
            .read()
            .await
            .get(document_id)
            .cloned()
            .ok_or_else(|| InsightError::DocumentNotFound(document_id.to_string()))
    }

    async fn put(&self, document_id: &str, document: Document) -> Result<()> {
        if document.id != document_id {
            return Err(InsightError::Store(format!(
                "document id '{}' does not match key '{}'",
                document.id, document_id
            )));
        }
        self.documents
            .write()
            .await
            .insert(document_id.to_string(), document);
        Ok(())
    }
}

/// One successful evolution, as reported to metering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub document_id: String,
    pub evolution_id: String,
    pub highlight_count: usize,
    pub output_chars: usize,
    pub recorded_at: DateTime<Utc>,
}

/// Invoked once per successful evolution. Failures are logged by the caller and never
/// undo the evolution.
#[async_trait]
pub trait UsageMeter: Send + Sync {
    async fn record_generation(&self, event: UsageEvent) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUsageMeter;

#[async_trait]
impl UsageMeter for NoopUsageMeter {
    async fn record_generation(&self, _event: UsageEvent) -> Result<()> {
        Ok(())
    }
}

/// Keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingUsageMeter {
    events: Mutex<Vec<UsageEvent>>,
}

impl RecordingUsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl UsageMeter for RecordingUsageMeter {
    async fn record_generation(&self, event: UsageEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|e| InsightError::Store(format!("usage log poisoned: {}", e)))?
            .push(event);
        Ok(())
    }
}
