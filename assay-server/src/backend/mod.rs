//! Inference backend collaborator interface
//!
//! Everything the pipeline needs from the external RAG service lives
//! behind this trait, so the stage sequencer never sees raw HTTP details
//! or the backend's error quirks, and tests can script the collaborator.

pub mod rag_client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::DocumentStatus;

pub use rag_client::RagClient;

/// Inference backend call errors
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Cannot connect to inference backend: {0}")]
    Connect(String),

    #[error("Inference backend request timed out: {0}")]
    Timeout(String),

    #[error("Inference backend returned HTTP {0}: {1}")]
    HttpStatus(u16, String),

    #[error("Inference backend error: {0}")]
    Api(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Unexpected inference backend response: {0}")]
    InvalidResponse(String),
}

impl From<BackendError> for assay_common::Error {
    fn from(err: BackendError) -> Self {
        assay_common::Error::Backend(err.to_string())
    }
}

/// One retrieved reference chunk returned for a question
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievedChunk {
    #[serde(default)]
    pub document_id: String,
    #[serde(default)]
    pub document_name: String,
    #[serde(default)]
    pub content: String,
    /// Five-element position rows; semantics depend on document type
    #[serde(default)]
    pub positions: Vec<Vec<f64>>,
    #[serde(default)]
    pub image_id: Option<String>,
}

/// Answer text plus the ordered retrieval set it cites into
#[derive(Debug, Clone, Default)]
pub struct AskOutcome {
    pub answer: String,
    pub chunks: Vec<RetrievedChunk>,
}

/// The core calls the pipeline makes against the inference backend.
///
/// Implementations must translate the backend's absence quirks (permission
/// or existence errors for resources that simply do not exist yet) into
/// clean empty results, never failures.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Return a fresh dataset id for `name`, replacing any same-named one
    async fn ensure_dataset(&self, name: &str) -> Result<String, BackendError>;

    /// Upload a single document; returns the backend document id
    async fn upload_document(
        &self,
        dataset_id: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BackendError>;

    /// Trigger chunk parsing for the given documents
    async fn start_parsing(
        &self,
        dataset_id: &str,
        document_ids: &[String],
    ) -> Result<(), BackendError>;

    /// Poll until every document reaches a terminal status or the parse
    /// timeout elapses. Individual document failures are reported in the
    /// returned statuses, never as an error; the caller owns the fan-in
    /// decision.
    async fn wait_for_parsing(
        &self,
        dataset_id: &str,
        document_ids: &[String],
    ) -> Result<Vec<DocumentStatus>, BackendError>;

    /// Return an answering-assistant id bound to the datasets, replacing
    /// any same-named assistant
    async fn ensure_chat(
        &self,
        name: &str,
        dataset_ids: &[String],
    ) -> Result<String, BackendError>;

    /// Open an answering session on the assistant
    async fn create_session(&self, chat_id: &str) -> Result<String, BackendError>;

    /// Ask one question; returns the answer and its retrieval set
    async fn ask(
        &self,
        chat_id: &str,
        session_id: &str,
        question: &str,
    ) -> Result<AskOutcome, BackendError>;
}
