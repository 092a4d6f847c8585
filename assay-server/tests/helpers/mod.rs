//! Shared test helpers: temp databases and a scripted inference backend
#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

use assay_common::config::Settings;
use assay_server::backend::{AskOutcome, BackendError, InferenceBackend, RetrievedChunk};
use assay_server::models::{DocumentState, DocumentStatus, Question, SerialNo};
use assay_server::pipeline::Pipeline;
use assay_server::AppState;

/// File-backed temp database; the TempDir guard must outlive the pool
pub async fn setup_db() -> (SqlitePool, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = dir.path().join("assay-test.db");
    let pool = assay_common::db::init_database(&db_path)
        .await
        .expect("Failed to initialize test database");
    (pool, dir)
}

pub fn test_settings() -> Settings {
    Settings {
        max_concurrent_requests: 5,
        poll_interval_secs: 0.01,
        parse_timeout_secs: 5.0,
        ..Settings::default()
    }
}

pub fn questions(count: usize) -> Vec<Question> {
    (0..count)
        .map(|i| Question {
            serial_no: SerialNo::Number(i as i64 + 1),
            question: format!("Is control {} implemented?", i + 1),
            vendor_response: String::new(),
            vendor_comment: String::new(),
        })
        .collect()
}

pub fn pdf_chunk(name: &str, page: f64) -> RetrievedChunk {
    RetrievedChunk {
        document_id: format!("doc-for-{}", name),
        document_name: name.to_string(),
        content: format!("Evidence from {}", name),
        positions: vec![vec![page, 10.0, 20.0, 30.0, 40.0]],
        image_id: None,
    }
}

/// Scripted inference backend for driving the sequencer in tests.
///
/// Uploads get sequential ids; parse outcomes are configured per filename
/// (default success); answers come from a fixed template. Ask concurrency
/// is tracked so tests can assert the executor's cap.
pub struct MockBackend {
    upload_seq: AtomicUsize,
    /// document id -> uploaded filename
    uploads: Mutex<HashMap<String, String>>,
    /// filename -> scripted terminal parse state
    parse_plan: Mutex<HashMap<String, DocumentState>>,
    /// filenames whose upload call should fail
    failing_uploads: Mutex<HashSet<String>>,
    /// substring that makes an ask call fail
    failing_ask_marker: Mutex<Option<String>>,
    answer: Mutex<String>,
    chunks: Mutex<Vec<RetrievedChunk>>,
    ask_delay: Duration,
    asks_in_flight: AtomicUsize,
    pub max_concurrent_asks: AtomicUsize,
    pub ask_count: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            upload_seq: AtomicUsize::new(0),
            uploads: Mutex::new(HashMap::new()),
            parse_plan: Mutex::new(HashMap::new()),
            failing_uploads: Mutex::new(HashSet::new()),
            failing_ask_marker: Mutex::new(None),
            answer: Mutex::new(
                "Answer: Yes\nDetails: Supported by the evidence. [ID:0]".to_string(),
            ),
            chunks: Mutex::new(vec![pdf_chunk("evidence.pdf", 1.0)]),
            ask_delay: Duration::from_millis(10),
            asks_in_flight: AtomicUsize::new(0),
            max_concurrent_asks: AtomicUsize::new(0),
            ask_count: AtomicUsize::new(0),
        })
    }

    pub fn plan_parse_outcome(&self, filename: &str, state: DocumentState) {
        self.parse_plan
            .lock()
            .unwrap()
            .insert(filename.to_string(), state);
    }

    pub fn fail_upload_of(&self, filename: &str) {
        self.failing_uploads
            .lock()
            .unwrap()
            .insert(filename.to_string());
    }

    pub fn fail_asks_containing(&self, marker: &str) {
        *self.failing_ask_marker.lock().unwrap() = Some(marker.to_string());
    }

    pub fn set_answer(&self, answer: &str) {
        *self.answer.lock().unwrap() = answer.to_string();
    }

    pub fn set_chunks(&self, chunks: Vec<RetrievedChunk>) {
        *self.chunks.lock().unwrap() = chunks;
    }

    pub fn uploaded_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn ensure_dataset(&self, name: &str) -> Result<String, BackendError> {
        Ok(format!("ds-{}", name))
    }

    async fn upload_document(
        &self,
        _dataset_id: &str,
        filename: &str,
        _bytes: Vec<u8>,
    ) -> Result<String, BackendError> {
        if self.failing_uploads.lock().unwrap().contains(filename) {
            return Err(BackendError::Api(format!("upload of {} rejected", filename)));
        }
        let n = self.upload_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let doc_id = format!("doc-{}", n);
        self.uploads
            .lock()
            .unwrap()
            .insert(doc_id.clone(), filename.to_string());
        Ok(doc_id)
    }

    async fn start_parsing(
        &self,
        _dataset_id: &str,
        _document_ids: &[String],
    ) -> Result<(), BackendError> {
        Ok(())
    }

    async fn wait_for_parsing(
        &self,
        _dataset_id: &str,
        document_ids: &[String],
    ) -> Result<Vec<DocumentStatus>, BackendError> {
        let uploads = self.uploads.lock().unwrap();
        let plan = self.parse_plan.lock().unwrap();
        Ok(document_ids
            .iter()
            .map(|doc_id| {
                let name = uploads.get(doc_id).cloned().unwrap_or_default();
                let state = plan.get(&name).copied().unwrap_or(DocumentState::Success);
                let (progress, message) = match state {
                    DocumentState::Success => (1.0, "Parsed successfully".to_string()),
                    DocumentState::Failed => (0.0, "Parsing failed".to_string()),
                    DocumentState::Timeout => (0.4, "Document parsing timed out".to_string()),
                    DocumentState::NotFound => {
                        (0.0, format!("Document {} not found in dataset", doc_id))
                    }
                    _ => (0.0, String::new()),
                };
                DocumentStatus {
                    document_id: doc_id.clone(),
                    document_name: name,
                    fingerprint: String::new(),
                    status: state,
                    progress,
                    message,
                }
            })
            .collect())
    }

    async fn ensure_chat(
        &self,
        name: &str,
        _dataset_ids: &[String],
    ) -> Result<String, BackendError> {
        Ok(format!("chat-{}", name))
    }

    async fn create_session(&self, chat_id: &str) -> Result<String, BackendError> {
        Ok(format!("session-{}", chat_id))
    }

    async fn ask(
        &self,
        _chat_id: &str,
        _session_id: &str,
        question: &str,
    ) -> Result<AskOutcome, BackendError> {
        let in_flight = self.asks_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_asks
            .fetch_max(in_flight, Ordering::SeqCst);
        tokio::time::sleep(self.ask_delay).await;
        self.asks_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.ask_count.fetch_add(1, Ordering::SeqCst);

        let marker = self.failing_ask_marker.lock().unwrap().clone();
        if let Some(marker) = marker {
            if question.contains(&marker) {
                return Err(BackendError::Timeout("scripted ask failure".to_string()));
            }
        }

        Ok(AskOutcome {
            answer: self.answer.lock().unwrap().clone(),
            chunks: self.chunks.lock().unwrap().clone(),
        })
    }
}

/// Pipeline wired to a temp database and a scripted backend
pub async fn setup_pipeline() -> (Pipeline, Arc<MockBackend>, SqlitePool, TempDir) {
    let (pool, dir) = setup_db().await;
    let backend = MockBackend::new();
    let settings = Arc::new(test_settings());
    let pipeline = Pipeline::new(
        pool.clone(),
        backend.clone() as Arc<dyn InferenceBackend>,
        settings,
    );
    (pipeline, backend, pool, dir)
}

/// App state for router tests, sharing the same scripted backend
pub async fn setup_app() -> (axum::Router, Arc<MockBackend>, SqlitePool, TempDir) {
    let (pool, dir) = setup_db().await;
    let backend = MockBackend::new();
    let settings = Arc::new(test_settings());
    let state = AppState::new(
        pool.clone(),
        backend.clone() as Arc<dyn InferenceBackend>,
        settings,
    );
    (assay_server::build_router(state), backend, pool, dir)
}
