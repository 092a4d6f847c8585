//! Assessment pipeline orchestration
//!
//! Drives a task through its fixed stage sequence — dataset creation,
//! document upload, parsing, question answering, finalization — persisting
//! progress incrementally through the task record store. Per-item failures
//! (one upload, one question) are recovered locally and aggregated; only
//! the fan-in decision at a stage boundary escalates to task-level failure,
//! which is always retryable via the incremental-upload path.

pub mod citations;
pub mod dedup;
pub mod executor;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use assay_common::config::Settings;
use assay_common::pagination::calculate_pagination;
use assay_common::{Error, Result};

use crate::backend::InferenceBackend;
use crate::db::{events, tasks};
use crate::models::{
    DocumentState, DocumentStatus, PipelineStage, Question, QuestionResult, TaskOptions,
    TaskRecord, TaskState, Verdict,
};

/// How often question progress is flushed to the store. Progress is also
/// always flushed on the final question, so a crash between flushes loses
/// at most the latest partial progress count, never flushed results.
const PROGRESS_BATCH_SIZE: usize = 5;

/// Partial status mutation applied through [`Pipeline::update_status`].
///
/// `error` distinguishes "leave alone" (None) from "clear" (Some(None))
/// from "set" (Some(Some(text))).
#[derive(Debug, Default)]
struct StatusUpdate {
    state: Option<TaskState>,
    stage: Option<PipelineStage>,
    message: Option<String>,
    error: Option<Option<String>>,
    questions_processed: Option<i64>,
}

/// Response to a two-phase session creation
#[derive(Debug, Clone, Serialize)]
pub struct SessionCreated {
    pub task_id: String,
    pub dataset_id: String,
    pub state: TaskState,
    pub message: String,
}

/// Response to an incremental document upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub task_id: String,
    pub dataset_id: String,
    pub uploaded_document_ids: Vec<String>,
    pub total_documents: usize,
    pub skipped_duplicates: usize,
    pub message: String,
}

/// One page of question results
#[derive(Debug, Clone, Serialize)]
pub struct ResultsPage {
    pub task_id: String,
    pub state: TaskState,
    pub total_questions: i64,
    pub questions_processed: i64,
    pub results: Vec<QuestionResult>,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
    pub dataset_id: Option<String>,
    pub dataset_ids: Vec<String>,
    pub chat_id: Option<String>,
    pub session_id: Option<String>,
    pub document_ids: Vec<String>,
    pub document_statuses: Vec<DocumentStatus>,
}

struct QuestionProgress<'a> {
    record: &'a mut TaskRecord,
    slots: Vec<Option<QuestionResult>>,
    completed: usize,
}

/// The stage sequencer. Stateless apart from its handles; all task state
/// lives in the record store so any worker can pick up any request.
pub struct Pipeline {
    db: SqlitePool,
    backend: Arc<dyn InferenceBackend>,
    settings: Arc<Settings>,
}

impl Pipeline {
    pub fn new(db: SqlitePool, backend: Arc<dyn InferenceBackend>, settings: Arc<Settings>) -> Self {
        Self {
            db,
            backend,
            settings,
        }
    }

    fn default_dataset_name(&self, task_id: &str) -> String {
        format!("{}_{}", self.settings.chat_name_prefix, &task_id[..8])
    }

    fn default_chat_name(&self, task_id: &str) -> String {
        format!("{}_chat_{}", self.settings.chat_name_prefix, &task_id[..8])
    }

    async fn load_task(&self, task_id: &str) -> Result<TaskRecord> {
        tasks::get_task(&self.db, task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Task {} not found", task_id)))
    }

    /// Create a new task record and persist it.
    ///
    /// Behavioural flags are snapshotted from the settings (or the given
    /// overrides) now, so later default changes never alter this task.
    pub async fn create_task(
        &self,
        questions: Vec<Question>,
        state: TaskState,
        options: Option<TaskOptions>,
    ) -> Result<TaskRecord> {
        if questions.is_empty() {
            return Err(Error::InvalidInput(
                "Question set is empty; nothing to assess".to_string(),
            ));
        }
        let options = options.unwrap_or(TaskOptions {
            process_vendor_response: self.settings.process_vendor_response,
            only_cited_references: self.settings.only_cited_references,
        });
        let record = TaskRecord::new(questions, state, options);
        tasks::save_task(&self.db, &record).await?;

        if let Err(e) = events::add_task_event(
            &self.db,
            &record.task_id,
            "task_created",
            Some(state),
            Some(PipelineStage::Idle),
            "Task created",
            None,
            json!({ "total_questions": record.status.total_questions }),
        )
        .await
        {
            warn!(task_id = %record.task_id, error = %e, "Failed to append task_created event");
        }

        Ok(record)
    }

    /// Single-call workflow: dataset, uploads, parsing, answering.
    ///
    /// Pipeline errors mark the task failed rather than propagating; the
    /// caller has already received the task id and follows along via the
    /// status endpoints.
    pub async fn run_assessment(
        &self,
        task_id: &str,
        files: Vec<(String, Vec<u8>)>,
        dataset_name: Option<String>,
        chat_name: Option<String>,
    ) -> Result<()> {
        let mut record = self.load_task(task_id).await?;
        info!(
            task_id = %task_id,
            questions = record.questions.len(),
            evidence_files = files.len(),
            "Starting assessment pipeline"
        );
        if let Err(err) = self
            .run_assessment_inner(&mut record, files, dataset_name, chat_name)
            .await
        {
            self.fail_task(&mut record, &err).await?;
        }
        Ok(())
    }

    async fn run_assessment_inner(
        &self,
        record: &mut TaskRecord,
        files: Vec<(String, Vec<u8>)>,
        dataset_name: Option<String>,
        chat_name: Option<String>,
    ) -> Result<()> {
        // 1. Create dataset
        self.update_status(
            record,
            StatusUpdate {
                state: Some(TaskState::Uploading),
                stage: Some(PipelineStage::DocumentUpload),
                message: Some("Creating dataset...".to_string()),
                ..Default::default()
            },
        )
        .await?;

        let ds_name = dataset_name.unwrap_or_else(|| self.default_dataset_name(&record.task_id));
        let dataset_id = self.backend.ensure_dataset(&ds_name).await.map_err(Error::from)?;
        record.backend.dataset_id = dataset_id.clone();
        record.backend.dataset_ids = vec![dataset_id];

        // 2. Upload evidence documents
        self.update_status(
            record,
            StatusUpdate {
                message: Some("Uploading evidence documents...".to_string()),
                ..Default::default()
            },
        )
        .await?;

        let batch_size = files.len();
        let (new_ids, skipped) = self.upload_new_documents(record, files).await?;
        if new_ids.is_empty() {
            if skipped > 0 && skipped == batch_size {
                return Err(Error::InvalidInput(format!(
                    "All {} evidence documents were duplicates of each other",
                    batch_size
                )));
            }
            return Err(Error::Backend(
                "No evidence documents were uploaded".to_string(),
            ));
        }

        // 3. Parse, 4-6. answer
        self.parse_documents(record).await?;
        self.answer_questions(record, chat_name).await?;
        Ok(())
    }

    /// Phase 1 of the two-phase workflow: create the task and its dataset
    /// upfront; documents arrive incrementally afterwards.
    pub async fn create_session(
        &self,
        questions: Vec<Question>,
        dataset_name: Option<String>,
        options: Option<TaskOptions>,
    ) -> Result<SessionCreated> {
        let mut record = self
            .create_task(questions, TaskState::AwaitingDocuments, options)
            .await?;

        let ds_name = dataset_name.unwrap_or_else(|| self.default_dataset_name(&record.task_id));
        match self.backend.ensure_dataset(&ds_name).await {
            Ok(dataset_id) => {
                record.backend.dataset_id = dataset_id.clone();
                record.backend.dataset_ids = vec![dataset_id.clone()];
                let message =
                    "Session created. Upload evidence documents then start the assessment."
                        .to_string();
                self.update_status(
                    &mut record,
                    StatusUpdate {
                        state: Some(TaskState::AwaitingDocuments),
                        stage: Some(PipelineStage::Idle),
                        message: Some(message.clone()),
                        ..Default::default()
                    },
                )
                .await?;
                Ok(SessionCreated {
                    task_id: record.task_id.clone(),
                    dataset_id,
                    state: TaskState::AwaitingDocuments,
                    message,
                })
            }
            Err(err) => {
                let err = Error::from(err);
                self.update_status(
                    &mut record,
                    StatusUpdate {
                        state: Some(TaskState::Failed),
                        message: Some("Session creation failed".to_string()),
                        error: Some(Some(err.to_string())),
                        ..Default::default()
                    },
                )
                .await?;
                Err(err)
            }
        }
    }

    /// Phase 2 (repeatable): upload documents into an existing session.
    ///
    /// Also accepts failed tasks: a later upload reopens the task to
    /// awaiting_documents and clears the error, keeping every previously
    /// uploaded document and fingerprint. This is the retry path.
    pub async fn add_documents(
        &self,
        task_id: &str,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<UploadOutcome> {
        if files.is_empty() {
            return Err(Error::InvalidInput("No files provided".to_string()));
        }

        let mut record = self.load_task(task_id).await?;
        if !record.status.state.accepts_documents() {
            return Err(Error::InvalidInput(format!(
                "Cannot upload documents in state '{}'. Task must be in 'awaiting_documents' or 'failed' state.",
                record.status.state
            )));
        }
        if record.backend.dataset_id.is_empty() {
            return Err(Error::InvalidInput(
                "No dataset associated with this task".to_string(),
            ));
        }

        let batch_size = files.len();
        let (new_ids, skipped) = self.upload_new_documents(&mut record, files).await?;

        if new_ids.is_empty() && skipped == batch_size {
            // Nothing new: leave the record untouched
            return Ok(UploadOutcome {
                task_id: record.task_id.clone(),
                dataset_id: record.backend.dataset_id.clone(),
                uploaded_document_ids: Vec::new(),
                total_documents: record.backend.document_ids.len(),
                skipped_duplicates: skipped,
                message: format!("All {} document(s) were duplicates and skipped.", skipped),
            });
        }
        if new_ids.is_empty() {
            return Err(Error::Backend(format!(
                "Failed to upload any of {} document(s)",
                batch_size - skipped
            )));
        }

        // failed -> awaiting_documents is the retry edge: reopen and clear
        // the previous error
        let reopening = record.status.state == TaskState::Failed;

        let mut message = format!("Uploaded {} document(s).", new_ids.len());
        if skipped > 0 {
            message.push_str(&format!(" Skipped {} duplicate(s).", skipped));
        }
        let total_documents = record.backend.document_ids.len();

        self.update_status(
            &mut record,
            StatusUpdate {
                state: reopening.then_some(TaskState::AwaitingDocuments),
                message: Some(format!("{} document(s) available. {}", total_documents, message)),
                error: reopening.then_some(None),
                ..Default::default()
            },
        )
        .await?;

        Ok(UploadOutcome {
            task_id: record.task_id.clone(),
            dataset_id: record.backend.dataset_id.clone(),
            uploaded_document_ids: new_ids,
            total_documents,
            skipped_duplicates: skipped,
            message: format!("{} Total: {}.", message, total_documents),
        })
    }

    /// Atomically validate and claim a session task for a new run.
    ///
    /// The claim is one conditional state update; a concurrent second
    /// start loses the claim and gets a validation error. Prior results
    /// are cleared so old and new runs never mix.
    pub async fn claim_start(&self, task_id: &str) -> Result<TaskRecord> {
        let record = self.load_task(task_id).await?;
        if record.backend.document_ids.is_empty() {
            return Err(Error::InvalidInput(
                "No evidence documents uploaded. Upload at least one document first.".to_string(),
            ));
        }

        let claimed = tasks::claim_task_state(
            &self.db,
            task_id,
            &[TaskState::AwaitingDocuments, TaskState::Failed],
            TaskState::Parsing,
        )
        .await?;
        if !claimed {
            let current = self.load_task(task_id).await?;
            return Err(Error::InvalidInput(format!(
                "Cannot start assessment in state '{}'. Task must be in 'awaiting_documents' or 'failed' state.",
                current.status.state
            )));
        }

        // Reset stale run artifacts before queueing the new run
        let mut record = self.load_task(task_id).await?;
        record.results.clear();
        for doc in &mut record.document_statuses {
            doc.reset_for_retry();
        }
        self.update_status(
            &mut record,
            StatusUpdate {
                stage: Some(PipelineStage::DocumentParsing),
                message: Some("Assessment queued. Starting document parsing...".to_string()),
                questions_processed: Some(0),
                error: Some(None),
                ..Default::default()
            },
        )
        .await?;
        Ok(record)
    }

    /// Phase 3: run the pipeline for a session whose dataset and documents
    /// are already in place, picking up from the parsing stage onward.
    pub async fn run_for_session(&self, task_id: &str, chat_name: Option<String>) -> Result<()> {
        let mut record = self.load_task(task_id).await?;
        let state = record.status.state;
        if !matches!(
            state,
            TaskState::Parsing | TaskState::AwaitingDocuments | TaskState::Failed
        ) {
            return Err(Error::InvalidInput(format!(
                "Cannot start assessment in state '{}'. Task must be in 'parsing', 'awaiting_documents' or 'failed' state.",
                state
            )));
        }
        if record.backend.document_ids.is_empty() {
            return Err(Error::InvalidInput(
                "No evidence documents have been uploaded yet.".to_string(),
            ));
        }

        // Clear stale results from any previous (failed) run so the new
        // run starts from a clean slate
        record.results.clear();
        for doc in &mut record.document_statuses {
            doc.reset_for_retry();
        }
        record.status.questions_processed = 0;
        record.status.error = None;
        if record.backend.dataset_ids.is_empty() && !record.backend.dataset_id.is_empty() {
            record.backend.dataset_ids = vec![record.backend.dataset_id.clone()];
        }

        if let Err(err) = self.run_session_inner(&mut record, chat_name).await {
            self.fail_task(&mut record, &err).await?;
        }
        Ok(())
    }

    async fn run_session_inner(
        &self,
        record: &mut TaskRecord,
        chat_name: Option<String>,
    ) -> Result<()> {
        self.parse_documents(record).await?;
        self.answer_questions(record, chat_name).await?;
        Ok(())
    }

    /// Run the pipeline against pre-existing backend datasets whose
    /// documents are already uploaded and parsed: starts directly at the
    /// answering stage.
    pub async fn run_from_datasets(
        &self,
        task_id: &str,
        dataset_ids: Vec<String>,
        chat_name: Option<String>,
    ) -> Result<()> {
        if dataset_ids.is_empty() {
            return Err(Error::InvalidInput(
                "At least one dataset id is required".to_string(),
            ));
        }
        let mut record = self.load_task(task_id).await?;
        record.backend.dataset_id = dataset_ids[0].clone();
        record.backend.dataset_ids = dataset_ids;

        if let Err(err) = self.answer_questions(&mut record, chat_name).await {
            self.fail_task(&mut record, &err).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stage helpers
    // ------------------------------------------------------------------

    /// Dedup the batch against the task's recorded fingerprints, then
    /// upload the survivors under the concurrency cap. Fingerprints and
    /// document records are written only for uploads that succeeded, so a
    /// failed upload can be retried without looking like a duplicate.
    async fn upload_new_documents(
        &self,
        record: &mut TaskRecord,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<(Vec<String>, usize)> {
        let outcome = dedup::filter_duplicates(files, &record.backend.file_fingerprints);
        let skipped = outcome.skipped;
        if outcome.accepted.is_empty() {
            return Ok((Vec::new(), skipped));
        }

        let dataset_id = record.backend.dataset_id.clone();
        let ops: Vec<_> = outcome
            .accepted
            .into_iter()
            .map(|file| {
                let dataset_id = dataset_id.clone();
                let backend = Arc::clone(&self.backend);
                async move {
                    backend
                        .upload_document(&dataset_id, &file.name, file.bytes)
                        .await
                        .map(|doc_id| (doc_id, file.name, file.fingerprint))
                }
            })
            .collect();

        let results = executor::run_bounded(self.settings.max_concurrent_requests, ops).await;

        let mut new_ids = Vec::new();
        for result in results {
            match result {
                Ok((doc_id, name, fingerprint)) => {
                    record.backend.document_ids.push(doc_id.clone());
                    record
                        .backend
                        .file_fingerprints
                        .insert(fingerprint.clone(), doc_id.clone());
                    record
                        .document_statuses
                        .push(DocumentStatus::uploaded(doc_id.clone(), name, fingerprint));
                    new_ids.push(doc_id);
                }
                Err(e) => {
                    warn!(task_id = %record.task_id, error = %e, "Document upload failed");
                }
            }
        }
        Ok((new_ids, skipped))
    }

    /// Parse all of the task's documents and apply the fan-in rule: at
    /// least one success proceeds, zero successes fails the task.
    async fn parse_documents(&self, record: &mut TaskRecord) -> Result<()> {
        self.update_status(
            record,
            StatusUpdate {
                state: Some(TaskState::Parsing),
                stage: Some(PipelineStage::DocumentParsing),
                message: Some("Parsing evidence documents...".to_string()),
                ..Default::default()
            },
        )
        .await?;

        let dataset_id = record.backend.dataset_id.clone();
        let doc_ids = record.backend.document_ids.clone();
        self.backend
            .start_parsing(&dataset_id, &doc_ids)
            .await
            .map_err(Error::from)?;
        let polled = self
            .backend
            .wait_for_parsing(&dataset_id, &doc_ids)
            .await
            .map_err(Error::from)?;

        merge_parse_statuses(record, &polled);

        let ok_count = polled
            .iter()
            .filter(|d| d.status == DocumentState::Success)
            .count();
        let failed: Vec<&DocumentStatus> = polled
            .iter()
            .filter(|d| d.status != DocumentState::Success)
            .collect();

        if !failed.is_empty() {
            let names: Vec<&str> = failed
                .iter()
                .map(|d| {
                    if d.document_name.is_empty() {
                        d.document_id.as_str()
                    } else {
                        d.document_name.as_str()
                    }
                })
                .collect();
            warn!(task_id = %record.task_id, documents = %names.join(", "), "Documents with parsing issues");
        }

        if ok_count == 0 {
            let summary: Vec<String> = failed
                .iter()
                .map(|d| {
                    let name = if d.document_name.is_empty() {
                        d.document_id.as_str()
                    } else {
                        d.document_name.as_str()
                    };
                    format!("{}: {}", name, d.message)
                })
                .collect();
            return Err(Error::Internal(format!(
                "All documents failed to parse. {}",
                summary.join("; ")
            )));
        }

        self.update_status(
            record,
            StatusUpdate {
                message: Some(format!(
                    "Parsing complete: {} succeeded, {} failed",
                    ok_count,
                    failed.len()
                )),
                ..Default::default()
            },
        )
        .await?;
        Ok(())
    }

    /// Create the answering assistant and session, process every question
    /// under the concurrency cap, then finalize the task.
    async fn answer_questions(
        &self,
        record: &mut TaskRecord,
        chat_name: Option<String>,
    ) -> Result<()> {
        self.update_status(
            record,
            StatusUpdate {
                state: Some(TaskState::Processing),
                stage: Some(PipelineStage::ChatProcessing),
                message: Some("Creating chat assistant...".to_string()),
                ..Default::default()
            },
        )
        .await?;

        let name = chat_name.unwrap_or_else(|| self.default_chat_name(&record.task_id));
        let dataset_ids = record.backend.dataset_ids.clone();
        let chat_id = self
            .backend
            .ensure_chat(&name, &dataset_ids)
            .await
            .map_err(Error::from)?;
        record.backend.chat_id = chat_id.clone();
        let session_id = self
            .backend
            .create_session(&chat_id)
            .await
            .map_err(Error::from)?;
        record.backend.session_id = session_id.clone();

        let failed_count = self.process_questions(record, &chat_id, &session_id).await?;

        let final_message = if failed_count > 0 {
            format!("Assessment completed with {} question failure(s)", failed_count)
        } else {
            "Assessment completed".to_string()
        };
        self.update_status(
            record,
            StatusUpdate {
                state: Some(TaskState::Completed),
                stage: Some(PipelineStage::Finalizing),
                message: Some(final_message),
                questions_processed: Some(record.questions.len() as i64),
                ..Default::default()
            },
        )
        .await?;
        Ok(())
    }

    /// Process all questions concurrently and return the failure count.
    ///
    /// Results land in index-addressed slots so persisted results always
    /// follow input question order, no matter which call completes first.
    /// A failed question becomes an explicit N/A result carrying the error
    /// text — a completed task has every slot populated.
    async fn process_questions(
        &self,
        record: &mut TaskRecord,
        chat_id: &str,
        session_id: &str,
    ) -> Result<usize> {
        self.update_status(
            record,
            StatusUpdate {
                message: Some("Processing questions...".to_string()),
                ..Default::default()
            },
        )
        .await?;

        let total = record.questions.len();
        if total == 0 {
            return Ok(0);
        }

        let questions = record.questions.clone();
        let options = record.options;
        let shared = Mutex::new(QuestionProgress {
            record,
            slots: vec![None; total],
            completed: 0,
        });
        let shared_ref = &shared;

        let ops: Vec<_> = questions
            .into_iter()
            .enumerate()
            .map(|(idx, question)| async move {
                let outcome = self
                    .answer_one(chat_id, session_id, &question, &options)
                    .await;
                let failed = outcome.is_err();
                let result = match outcome {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(serial_no = %question.serial_no, error = %e, "Question failed");
                        unanswerable_result(&question, &e)
                    }
                };

                let mut progress = shared_ref.lock().await;
                progress.slots[idx] = Some(result);
                progress.completed += 1;
                let completed = progress.completed;

                // Batch store writes: flush every N completions and always
                // on the last one
                if completed % PROGRESS_BATCH_SIZE == 0 || completed == total {
                    let QuestionProgress { record, slots, .. } = &mut *progress;
                    record.results = slots.iter().flatten().cloned().collect();
                    if let Err(e) = self
                        .update_status(
                            record,
                            StatusUpdate {
                                questions_processed: Some(completed as i64),
                                message: Some(format!(
                                    "Processed {}/{} questions",
                                    completed, total
                                )),
                                ..Default::default()
                            },
                        )
                        .await
                    {
                        warn!(error = %e, "Failed to flush question progress (non-fatal, continuing)");
                    }
                }
                failed
            })
            .collect();

        let failures =
            executor::run_bounded(self.settings.max_concurrent_requests, ops).await;
        let failed_count = failures.into_iter().filter(|failed| *failed).count();

        let QuestionProgress {
            record,
            slots,
            completed,
        } = shared.into_inner();
        record.results = slots.into_iter().flatten().collect();
        record.status.questions_processed = completed as i64;

        if failed_count > 0 {
            warn!(
                failed = failed_count,
                total = total,
                "Some questions failed during processing"
            );
        }
        Ok(failed_count)
    }

    async fn answer_one(
        &self,
        chat_id: &str,
        session_id: &str,
        question: &Question,
        options: &TaskOptions,
    ) -> Result<QuestionResult> {
        let mut text = question.question.clone();
        if options.process_vendor_response
            && (!question.vendor_response.is_empty() || !question.vendor_comment.is_empty())
        {
            text = format!(
                "The vendor responded '{}' with comments: '{}'. \
                 Please verify if this is correct based on the documents. Question: {}",
                question.vendor_response, question.vendor_comment, question.question
            );
        }

        let outcome = self
            .backend
            .ask(chat_id, session_id, &text)
            .await
            .map_err(Error::from)?;
        let (verdict, details) = citations::parse_verdict(&outcome.answer);
        let references = citations::resolve_references(
            &outcome.answer,
            &outcome.chunks,
            options.only_cited_references,
        );

        Ok(QuestionResult {
            question_serial_no: question.serial_no.clone(),
            question: question.question.clone(),
            vendor_response: question.vendor_response.clone(),
            vendor_comment: question.vendor_comment.clone(),
            ai_response: verdict,
            details,
            references,
        })
    }

    async fn fail_task(&self, record: &mut TaskRecord, err: &Error) -> Result<()> {
        error!(task_id = %record.task_id, error = %err, "Assessment pipeline failed");
        self.update_status(
            record,
            StatusUpdate {
                state: Some(TaskState::Failed),
                stage: Some(PipelineStage::Idle),
                message: Some("Pipeline failed".to_string()),
                error: Some(Some(err.to_string())),
                ..Default::default()
            },
        )
        .await
    }

    /// The single mutation path for task status: applies the patch, bumps
    /// updated_at, syncs backend ids, persists, and appends a status event
    /// when something actually changed.
    async fn update_status(&self, record: &mut TaskRecord, update: StatusUpdate) -> Result<()> {
        let prev_state = record.status.state;
        let prev_stage = record.status.pipeline_stage;
        let prev_message = record.status.progress_message.clone();
        let prev_error = record.status.error.clone();
        let prev_processed = record.status.questions_processed;

        {
            let s = &mut record.status;
            if let Some(state) = update.state {
                s.state = state;
            }
            if let Some(stage) = update.stage {
                s.pipeline_stage = stage;
            }
            if let Some(message) = update.message {
                s.progress_message = message;
            }
            if let Some(error) = update.error {
                // Normalise empty strings to "no error"
                s.error = error.filter(|e| !e.is_empty());
            }
            if let Some(processed) = update.questions_processed {
                s.questions_processed = processed;
            }
            s.updated_at = Utc::now();
        }
        record.sync_backend_ids();
        tasks::save_task(&self.db, record).await?;

        let s = &record.status;
        let changed = prev_state != s.state
            || prev_stage != s.pipeline_stage
            || prev_message != s.progress_message
            || prev_error != s.error
            || prev_processed != s.questions_processed;
        if changed {
            if let Err(e) = events::add_task_event(
                &self.db,
                &record.task_id,
                "status_update",
                Some(s.state),
                Some(s.pipeline_stage),
                &s.progress_message,
                s.error.as_deref(),
                json!({
                    "total_questions": s.total_questions,
                    "questions_processed": s.questions_processed,
                }),
            )
            .await
            {
                warn!(task_id = %record.task_id, error = %e, "Failed to append task event");
            }
        }
        Ok(())
    }
}

/// Fold polled parse outcomes into the task's document records, matching
/// by document id and keeping upload-time identity fields (fingerprint,
/// display name) that the poll does not know about.
fn merge_parse_statuses(record: &mut TaskRecord, polled: &[DocumentStatus]) {
    for status in polled {
        match record
            .document_statuses
            .iter_mut()
            .find(|d| d.document_id == status.document_id)
        {
            Some(doc) => {
                doc.status = status.status;
                doc.progress = status.progress;
                doc.message = status.message.clone();
                if !status.document_name.is_empty() {
                    doc.document_name = status.document_name.clone();
                }
            }
            None => record.document_statuses.push(status.clone()),
        }
    }
}

fn unanswerable_result(question: &Question, err: &Error) -> QuestionResult {
    QuestionResult {
        question_serial_no: question.serial_no.clone(),
        question: question.question.clone(),
        vendor_response: question.vendor_response.clone(),
        vendor_comment: question.vendor_comment.clone(),
        ai_response: Verdict::NotApplicable,
        details: format!("Question processing failed: {}", err),
        references: Vec::new(),
    }
}

/// Assemble one page of a task's results
pub fn paginated_results(record: &TaskRecord, page: i64, page_size: i64) -> ResultsPage {
    let total = record.results.len() as i64;
    let p = calculate_pagination(total, page, page_size);
    let start = p.offset as usize;
    let end = (start + p.page_size as usize).min(record.results.len());
    let results = if start < record.results.len() {
        record.results[start..end].to_vec()
    } else {
        Vec::new()
    };

    let s = &record.status;
    ResultsPage {
        task_id: record.task_id.clone(),
        state: s.state,
        total_questions: s.total_questions,
        questions_processed: s.questions_processed,
        results,
        page: p.page,
        page_size: p.page_size,
        total_pages: p.total_pages,
        dataset_id: s.dataset_id.clone(),
        dataset_ids: s.dataset_ids.clone(),
        chat_id: s.chat_id.clone(),
        session_id: s.session_id.clone(),
        document_ids: s.document_ids.clone(),
        document_statuses: s.document_statuses.clone(),
    }
}
