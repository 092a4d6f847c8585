//! Domain models for the assay-server

pub mod reference;
pub mod task;

pub use reference::{detect_doc_type, RefLocation, Reference, Verdict};
pub use task::{
    BackendContext, DocumentState, DocumentStatus, PipelineStage, Question, QuestionResult,
    SerialNo, TaskEvent, TaskOptions, TaskRecord, TaskState, TaskStatus,
};
