//! Task lifecycle state machine and record types
//!
//! A verification task progresses pending → uploading → parsing →
//! processing → completed, with awaiting_documents as the alternate entry
//! for the incremental-upload workflow and failed reachable from any
//! non-terminal state. A failed task is reopened by uploading further
//! documents (failed → awaiting_documents), which is the retry path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::reference::Reference;
use crate::models::Verdict;

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    /// Session created, waiting for document uploads
    AwaitingDocuments,
    Uploading,
    Parsing,
    Processing,
    Completed,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::AwaitingDocuments => "awaiting_documents",
            TaskState::Uploading => "uploading",
            TaskState::Parsing => "parsing",
            TaskState::Processing => "processing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskState::Pending),
            "awaiting_documents" => Some(TaskState::AwaitingDocuments),
            "uploading" => Some(TaskState::Uploading),
            "parsing" => Some(TaskState::Parsing),
            "processing" => Some(TaskState::Processing),
            "completed" => Some(TaskState::Completed),
            "failed" => Some(TaskState::Failed),
            _ => None,
        }
    }

    /// States from which incremental uploads (and thus retry) are accepted
    pub fn accepts_documents(&self) -> bool {
        matches!(self, TaskState::AwaitingDocuments | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse progress indicator, reported alongside the state purely for
/// observability; it never gates transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    DocumentUpload,
    DocumentParsing,
    ChatProcessing,
    Finalizing,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Idle => "idle",
            PipelineStage::DocumentUpload => "document_upload",
            PipelineStage::DocumentParsing => "document_parsing",
            PipelineStage::ChatProcessing => "chat_processing",
            PipelineStage::Finalizing => "finalizing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(PipelineStage::Idle),
            "document_upload" => Some(PipelineStage::DocumentUpload),
            "document_parsing" => Some(PipelineStage::DocumentParsing),
            "chat_processing" => Some(PipelineStage::ChatProcessing),
            "finalizing" => Some(PipelineStage::Finalizing),
            _ => None,
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-document parse outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    NotFound,
}

impl DocumentState {
    /// Terminal states stop the parse poll for this document
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DocumentState::Pending | DocumentState::Running)
    }
}

/// One uploaded evidence document within a task.
///
/// Created when the upload succeeds, updated by parse polls. Dedup scope is
/// per-task: identical content in two tasks yields two records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStatus {
    pub document_id: String,
    #[serde(default)]
    pub document_name: String,
    /// SHA-256 content fingerprint recorded at upload time
    #[serde(default)]
    pub fingerprint: String,
    pub status: DocumentState,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub message: String,
}

impl DocumentStatus {
    /// Fresh record for a just-uploaded document awaiting parsing
    pub fn uploaded(document_id: String, document_name: String, fingerprint: String) -> Self {
        Self {
            document_id,
            document_name,
            fingerprint,
            status: DocumentState::Pending,
            progress: 0.0,
            message: String::new(),
        }
    }

    /// Reset parse progress ahead of a re-run, keeping identity fields
    pub fn reset_for_retry(&mut self) {
        self.status = DocumentState::Pending;
        self.progress = 0.0;
        self.message.clear();
    }
}

/// Question serial numbers come from external sheets and may be numeric or
/// free text; both shapes round-trip through serialization unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SerialNo {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for SerialNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerialNo::Number(n) => write!(f, "{}", n),
            SerialNo::Text(s) => f.write_str(s),
        }
    }
}

/// One question to verify against the evidence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub serial_no: SerialNo,
    pub question: String,
    #[serde(default)]
    pub vendor_response: String,
    #[serde(default)]
    pub vendor_comment: String,
}

/// Answered question with verdict, explanation and citations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question_serial_no: SerialNo,
    pub question: String,
    #[serde(default)]
    pub vendor_response: String,
    #[serde(default)]
    pub vendor_comment: String,
    pub ai_response: Verdict,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub references: Vec<Reference>,
}

/// Behavioural flags snapshotted into the task at creation, so later
/// default changes do not retroactively alter a running task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskOptions {
    pub process_vendor_response: bool,
    pub only_cited_references: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            process_vendor_response: false,
            only_cited_references: true,
        }
    }
}

/// Inference-backend resource ids created for one task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendContext {
    #[serde(default)]
    pub dataset_id: String,
    #[serde(default)]
    pub dataset_ids: Vec<String>,
    #[serde(default)]
    pub document_ids: Vec<String>,
    /// Content fingerprint → backend document id, recorded after each
    /// successful upload; the dedup check reads this across upload calls
    #[serde(default)]
    pub file_fingerprints: HashMap<String, String>,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub session_id: String,
}

/// Externally visible task status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub state: TaskState,
    pub pipeline_stage: PipelineStage,
    #[serde(default)]
    pub progress_message: String,
    pub total_questions: i64,
    pub questions_processed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,

    // Backend resource ids, synced from the BackendContext on every
    // load/save so responses always carry them
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub dataset_ids: Vec<String>,
    pub chat_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub document_ids: Vec<String>,
    #[serde(default)]
    pub document_statuses: Vec<DocumentStatus>,
}

/// Full task record as persisted in the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub backend: BackendContext,
    pub options: TaskOptions,
    pub questions: Vec<Question>,
    pub results: Vec<QuestionResult>,
    pub document_statuses: Vec<DocumentStatus>,
}

impl TaskRecord {
    /// Create a new record in the given entry state
    pub fn new(questions: Vec<Question>, state: TaskState, options: TaskOptions) -> Self {
        let task_id = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let status = TaskStatus {
            task_id: task_id.clone(),
            state,
            pipeline_stage: PipelineStage::Idle,
            progress_message: String::new(),
            total_questions: questions.len() as i64,
            questions_processed: 0,
            created_at: now,
            updated_at: now,
            error: None,
            dataset_id: None,
            dataset_ids: Vec::new(),
            chat_id: None,
            session_id: None,
            document_ids: Vec::new(),
            document_statuses: Vec::new(),
        };
        Self {
            task_id,
            status,
            backend: BackendContext::default(),
            options,
            questions,
            results: Vec::new(),
            document_statuses: Vec::new(),
        }
    }

    /// Copy backend resource ids and document statuses into the status
    /// object so they appear in API responses.
    pub fn sync_backend_ids(&mut self) {
        let b = &self.backend;
        self.status.dataset_id = if b.dataset_id.is_empty() {
            None
        } else {
            Some(b.dataset_id.clone())
        };
        self.status.dataset_ids = if b.dataset_ids.is_empty() {
            self.status.dataset_id.iter().cloned().collect()
        } else {
            b.dataset_ids.clone()
        };
        self.status.chat_id = if b.chat_id.is_empty() {
            None
        } else {
            Some(b.chat_id.clone())
        };
        self.status.session_id = if b.session_id.is_empty() {
            None
        } else {
            Some(b.session_id.clone())
        };
        self.status.document_ids = b.document_ids.clone();
        self.status.document_statuses = self.document_statuses.clone();
    }
}

/// One row of the append-only task audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: String,
    pub event_type: String,
    pub state: Option<TaskState>,
    pub pipeline_stage: Option<PipelineStage>,
    #[serde(default)]
    pub message: String,
    pub error: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
