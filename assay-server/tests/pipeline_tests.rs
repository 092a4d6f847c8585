//! Integration tests for the assessment pipeline
//!
//! Drive the stage sequencer end to end against a scripted inference
//! backend and a real (temp-file) task record store: state transitions,
//! dedup across upload calls, the parse fan-in rule, retry semantics,
//! progress counters, and the concurrency cap.

mod helpers;

use std::sync::atomic::Ordering;

use assay_server::db::tasks;
use assay_server::models::{DocumentState, TaskState, Verdict};
use helpers::{questions, setup_pipeline};

fn file(name: &str, content: &str) -> (String, Vec<u8>) {
    (name.to_string(), content.as_bytes().to_vec())
}

// ============================================================================
// Two-phase workflow
// ============================================================================

#[tokio::test]
async fn two_phase_workflow_completes() {
    let (pipeline, _backend, pool, _dir) = setup_pipeline().await;

    let created = pipeline
        .create_session(questions(3), None, None)
        .await
        .unwrap();
    assert_eq!(created.state, TaskState::AwaitingDocuments);
    assert!(created.dataset_id.starts_with("ds-"));

    let outcome = pipeline
        .add_documents(
            &created.task_id,
            vec![file("a.pdf", "contents a"), file("b.pdf", "contents b")],
        )
        .await
        .unwrap();
    assert_eq!(outcome.uploaded_document_ids.len(), 2);
    assert_eq!(outcome.skipped_duplicates, 0);

    let record = pipeline.claim_start(&created.task_id).await.unwrap();
    assert_eq!(record.status.state, TaskState::Parsing);

    pipeline
        .run_for_session(&created.task_id, None)
        .await
        .unwrap();

    let record = tasks::get_task(&pool, &created.task_id).await.unwrap().unwrap();
    assert_eq!(record.status.state, TaskState::Completed);
    assert_eq!(record.status.questions_processed, 3);
    assert_eq!(record.status.total_questions, 3);
    assert_eq!(record.results.len(), 3);
    assert!(record
        .document_statuses
        .iter()
        .all(|d| d.status == DocumentState::Success));
    // Results in input question order
    let serials: Vec<String> = record
        .results
        .iter()
        .map(|r| r.question_serial_no.to_string())
        .collect();
    assert_eq!(serials, vec!["1", "2", "3"]);
    // References resolved from the cited chunk
    assert_eq!(record.results[0].ai_response, Verdict::Yes);
    assert_eq!(record.results[0].references.len(), 1);
}

#[tokio::test]
async fn single_call_workflow_completes() {
    let (pipeline, _backend, pool, _dir) = setup_pipeline().await;

    let record = pipeline
        .create_task(questions(2), TaskState::Pending, None)
        .await
        .unwrap();
    pipeline
        .run_assessment(
            &record.task_id,
            vec![file("a.pdf", "alpha"), file("b.pdf", "beta")],
            None,
            None,
        )
        .await
        .unwrap();

    let record = tasks::get_task(&pool, &record.task_id).await.unwrap().unwrap();
    assert_eq!(record.status.state, TaskState::Completed);
    assert_eq!(record.status.pipeline_stage.as_str(), "finalizing");
    assert_eq!(record.results.len(), 2);
    assert_eq!(record.backend.document_ids.len(), 2);
}

#[tokio::test]
async fn from_datasets_workflow_skips_upload_and_parse() {
    let (pipeline, backend, pool, _dir) = setup_pipeline().await;

    let record = pipeline
        .create_task(questions(2), TaskState::Pending, None)
        .await
        .unwrap();
    pipeline
        .run_from_datasets(
            &record.task_id,
            vec!["ds-ext-1".to_string(), "ds-ext-2".to_string()],
            None,
        )
        .await
        .unwrap();

    let record = tasks::get_task(&pool, &record.task_id).await.unwrap().unwrap();
    assert_eq!(record.status.state, TaskState::Completed);
    assert_eq!(record.status.dataset_ids.len(), 2);
    assert_eq!(record.status.dataset_id.as_deref(), Some("ds-ext-1"));
    // No documents ever uploaded
    assert_eq!(backend.uploaded_count(), 0);
    assert!(record.document_statuses.is_empty());
}

#[tokio::test]
async fn empty_question_set_is_rejected_before_any_stage() {
    let (pipeline, backend, _pool, _dir) = setup_pipeline().await;

    let err = pipeline
        .create_session(Vec::new(), None, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("empty"));
    assert_eq!(backend.uploaded_count(), 0);
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test]
async fn duplicate_content_is_skipped_across_upload_calls() {
    let (pipeline, _backend, pool, _dir) = setup_pipeline().await;

    let created = pipeline
        .create_session(questions(1), None, None)
        .await
        .unwrap();

    // Same bytes under two names within one batch: one stored record
    let outcome = pipeline
        .add_documents(
            &created.task_id,
            vec![file("first.pdf", "same bytes"), file("copy.pdf", "same bytes")],
        )
        .await
        .unwrap();
    assert_eq!(outcome.uploaded_document_ids.len(), 1);
    assert_eq!(outcome.skipped_duplicates, 1);
    assert_eq!(
        outcome.uploaded_document_ids.len() + outcome.skipped_duplicates,
        2
    );

    // Same content again in a later call, different name: still skipped
    let outcome = pipeline
        .add_documents(&created.task_id, vec![file("renamed.pdf", "same bytes")])
        .await
        .unwrap();
    assert!(outcome.uploaded_document_ids.is_empty());
    assert_eq!(outcome.skipped_duplicates, 1);
    assert!(outcome.message.contains("duplicates"));

    let record = tasks::get_task(&pool, &created.task_id).await.unwrap().unwrap();
    assert_eq!(record.backend.document_ids.len(), 1);
    assert_eq!(record.document_statuses.len(), 1);
    assert_eq!(record.backend.file_fingerprints.len(), 1);
}

#[tokio::test]
async fn failed_upload_is_not_recorded_as_duplicate() {
    let (pipeline, backend, pool, _dir) = setup_pipeline().await;

    let created = pipeline
        .create_session(questions(1), None, None)
        .await
        .unwrap();

    backend.fail_upload_of("flaky.pdf");
    let err = pipeline
        .add_documents(&created.task_id, vec![file("flaky.pdf", "payload")])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Failed to upload"));

    let record = tasks::get_task(&pool, &created.task_id).await.unwrap().unwrap();
    assert!(record.backend.file_fingerprints.is_empty());

    // Identical bytes under a name the backend accepts: not a duplicate,
    // because the failed upload never recorded a fingerprint
    let outcome = pipeline
        .add_documents(&created.task_id, vec![file("flaky-retry.pdf", "payload")])
        .await
        .unwrap();
    assert_eq!(outcome.uploaded_document_ids.len(), 1);
    assert_eq!(outcome.skipped_duplicates, 0);
}

// ============================================================================
// Parse fan-in rule
// ============================================================================

#[tokio::test]
async fn one_successful_document_is_enough_to_proceed() {
    let (pipeline, backend, pool, _dir) = setup_pipeline().await;

    let created = pipeline
        .create_session(questions(2), None, None)
        .await
        .unwrap();
    pipeline
        .add_documents(
            &created.task_id,
            vec![
                file("good.pdf", "good"),
                file("bad.pdf", "bad"),
                file("slow.pdf", "slow"),
            ],
        )
        .await
        .unwrap();

    backend.plan_parse_outcome("bad.pdf", DocumentState::Failed);
    backend.plan_parse_outcome("slow.pdf", DocumentState::Timeout);

    pipeline.claim_start(&created.task_id).await.unwrap();
    pipeline
        .run_for_session(&created.task_id, None)
        .await
        .unwrap();

    let record = tasks::get_task(&pool, &created.task_id).await.unwrap().unwrap();
    assert_eq!(record.status.state, TaskState::Completed);

    let by_name = |name: &str| {
        record
            .document_statuses
            .iter()
            .find(|d| d.document_name == name)
            .unwrap()
            .status
    };
    assert_eq!(by_name("good.pdf"), DocumentState::Success);
    assert_eq!(by_name("bad.pdf"), DocumentState::Failed);
    assert_eq!(by_name("slow.pdf"), DocumentState::Timeout);
}

#[tokio::test]
async fn zero_successful_documents_fails_the_task() {
    let (pipeline, backend, pool, _dir) = setup_pipeline().await;

    let created = pipeline
        .create_session(questions(2), None, None)
        .await
        .unwrap();
    pipeline
        .add_documents(
            &created.task_id,
            vec![file("bad1.pdf", "one"), file("bad2.pdf", "two")],
        )
        .await
        .unwrap();

    backend.plan_parse_outcome("bad1.pdf", DocumentState::Failed);
    backend.plan_parse_outcome("bad2.pdf", DocumentState::Failed);

    pipeline.claim_start(&created.task_id).await.unwrap();
    pipeline
        .run_for_session(&created.task_id, None)
        .await
        .unwrap();

    let record = tasks::get_task(&pool, &created.task_id).await.unwrap().unwrap();
    assert_eq!(record.status.state, TaskState::Failed);
    let error = record.status.error.unwrap();
    assert!(error.contains("All documents failed to parse"));
    // No questions were asked
    assert_eq!(backend.ask_count.load(Ordering::SeqCst), 0);
    assert_eq!(record.status.questions_processed, 0);
}

// ============================================================================
// Retry round-trip
// ============================================================================

#[tokio::test]
async fn retry_keeps_documents_and_regenerates_results() {
    let (pipeline, backend, pool, _dir) = setup_pipeline().await;

    let created = pipeline
        .create_session(questions(2), None, None)
        .await
        .unwrap();
    pipeline
        .add_documents(&created.task_id, vec![file("only.pdf", "original")])
        .await
        .unwrap();

    // First run: the lone document fails parsing, so the task fails
    backend.plan_parse_outcome("only.pdf", DocumentState::Failed);
    pipeline.claim_start(&created.task_id).await.unwrap();
    pipeline
        .run_for_session(&created.task_id, None)
        .await
        .unwrap();

    let record = tasks::get_task(&pool, &created.task_id).await.unwrap().unwrap();
    assert_eq!(record.status.state, TaskState::Failed);
    assert!(record.status.error.is_some());

    // Retry path: upload one replacement document on the failed task
    let outcome = pipeline
        .add_documents(&created.task_id, vec![file("fixed.pdf", "replacement")])
        .await
        .unwrap();
    assert_eq!(outcome.uploaded_document_ids.len(), 1);

    let record = tasks::get_task(&pool, &created.task_id).await.unwrap().unwrap();
    assert_eq!(record.status.state, TaskState::AwaitingDocuments);
    assert_eq!(record.status.error, None);
    // Previously uploaded document and its fingerprint survive
    assert_eq!(record.backend.document_ids.len(), 2);
    assert_eq!(record.backend.file_fingerprints.len(), 2);

    // Second run: original document now parses too
    backend.plan_parse_outcome("only.pdf", DocumentState::Success);
    pipeline.claim_start(&created.task_id).await.unwrap();
    pipeline
        .run_for_session(&created.task_id, None)
        .await
        .unwrap();

    let record = tasks::get_task(&pool, &created.task_id).await.unwrap().unwrap();
    assert_eq!(record.status.state, TaskState::Completed);
    // Results fully regenerated, never mixed with the failed run
    assert_eq!(record.results.len(), 2);
    assert_eq!(record.status.questions_processed, 2);
    assert_eq!(record.document_statuses.len(), 2);
    assert!(record
        .document_statuses
        .iter()
        .all(|d| d.status == DocumentState::Success));
}

#[tokio::test]
async fn claim_is_atomic_against_double_start() {
    let (pipeline, _backend, _pool, _dir) = setup_pipeline().await;

    let created = pipeline
        .create_session(questions(1), None, None)
        .await
        .unwrap();
    pipeline
        .add_documents(&created.task_id, vec![file("a.pdf", "bytes")])
        .await
        .unwrap();

    let first = pipeline.claim_start(&created.task_id).await;
    assert!(first.is_ok());

    // The task is now parsing; a second start loses the claim
    let second = pipeline.claim_start(&created.task_id).await;
    let err = second.unwrap_err().to_string();
    assert!(err.contains("parsing"), "unexpected error: {}", err);
}

#[tokio::test]
async fn uploads_are_rejected_while_processing() {
    let (pipeline, _backend, _pool, _dir) = setup_pipeline().await;

    let created = pipeline
        .create_session(questions(1), None, None)
        .await
        .unwrap();
    pipeline
        .add_documents(&created.task_id, vec![file("a.pdf", "bytes")])
        .await
        .unwrap();
    pipeline.claim_start(&created.task_id).await.unwrap();

    let err = pipeline
        .add_documents(&created.task_id, vec![file("late.pdf", "late")])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Cannot upload documents"));
}

// ============================================================================
// Question processing
// ============================================================================

#[tokio::test]
async fn failed_questions_become_explicit_unanswerable_results() {
    let (pipeline, backend, pool, _dir) = setup_pipeline().await;

    let created = pipeline
        .create_session(questions(3), None, None)
        .await
        .unwrap();
    pipeline
        .add_documents(&created.task_id, vec![file("a.pdf", "bytes")])
        .await
        .unwrap();

    // "control 2" only appears in the second question's text
    backend.fail_asks_containing("control 2");

    pipeline.claim_start(&created.task_id).await.unwrap();
    pipeline
        .run_for_session(&created.task_id, None)
        .await
        .unwrap();

    let record = tasks::get_task(&pool, &created.task_id).await.unwrap().unwrap();
    assert_eq!(record.status.state, TaskState::Completed);
    assert!(record
        .status
        .progress_message
        .contains("1 question failure(s)"));

    // Every slot populated; the failed one is an explicit N/A
    assert_eq!(record.results.len(), 3);
    assert_eq!(record.status.questions_processed, 3);
    assert_eq!(record.results[1].ai_response, Verdict::NotApplicable);
    assert!(record.results[1].details.contains("failed"));
    assert_eq!(record.results[0].ai_response, Verdict::Yes);
    assert_eq!(record.results[2].ai_response, Verdict::Yes);
}

#[tokio::test]
async fn question_concurrency_respects_the_cap() {
    let (pipeline, backend, pool, _dir) = setup_pipeline().await;

    let created = pipeline
        .create_session(questions(20), None, None)
        .await
        .unwrap();
    pipeline
        .add_documents(&created.task_id, vec![file("a.pdf", "bytes")])
        .await
        .unwrap();
    pipeline.claim_start(&created.task_id).await.unwrap();
    pipeline
        .run_for_session(&created.task_id, None)
        .await
        .unwrap();

    assert_eq!(backend.ask_count.load(Ordering::SeqCst), 20);
    let max = backend.max_concurrent_asks.load(Ordering::SeqCst);
    assert!(max <= 5, "cap exceeded: {} asks in flight", max);

    let record = tasks::get_task(&pool, &created.task_id).await.unwrap().unwrap();
    assert_eq!(record.results.len(), 20);
    assert_eq!(record.status.questions_processed, 20);
    // Progress flush batching still ends at the exact total
    assert!(record.status.questions_processed <= record.status.total_questions);
}

#[tokio::test]
async fn vendor_flow_and_citation_filter_follow_task_options() {
    let (pipeline, backend, pool, _dir) = setup_pipeline().await;

    let mut qs = questions(1);
    qs[0].vendor_response = "Yes".to_string();
    qs[0].vendor_comment = "We rotate keys quarterly".to_string();

    let options = assay_server::models::TaskOptions {
        process_vendor_response: true,
        only_cited_references: true,
    };
    let created = pipeline
        .create_session(qs, None, Some(options))
        .await
        .unwrap();
    pipeline
        .add_documents(&created.task_id, vec![file("a.pdf", "bytes")])
        .await
        .unwrap();

    // Three retrieved chunks, answer cites only the third
    backend.set_chunks(vec![
        helpers::pdf_chunk("one.pdf", 1.0),
        helpers::pdf_chunk("two.pdf", 2.0),
        helpers::pdf_chunk("three.pdf", 3.0),
    ]);
    backend.set_answer("Answer: No\nDetails: Contradicted by [ID:2].");

    pipeline.claim_start(&created.task_id).await.unwrap();
    pipeline
        .run_for_session(&created.task_id, None)
        .await
        .unwrap();

    let record = tasks::get_task(&pool, &created.task_id).await.unwrap().unwrap();
    let result = &record.results[0];
    assert_eq!(result.ai_response, Verdict::No);
    assert_eq!(result.references.len(), 1);
    assert_eq!(result.references[0].document_name, "three.pdf");
    // Vendor fields preserved on the result
    assert_eq!(result.vendor_response, "Yes");
}
