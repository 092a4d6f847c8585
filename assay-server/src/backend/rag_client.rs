//! HTTP client for the RAGFlow-shaped inference backend REST API
//!
//! All network calls go through this module so the rest of the service
//! stays decoupled from raw HTTP details. Responses arrive in a
//! `{code, message, data}` envelope where a nonzero code is an error.

use reqwest::multipart;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use assay_common::config::Settings;

use super::{AskOutcome, BackendError, InferenceBackend, RetrievedChunk};
use crate::models::{DocumentState, DocumentStatus};

/// Timeout for individual HTTP calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

const SYSTEM_PROMPT: &str = "You are a compliance/assessment assistant. \
For each question you receive, determine if the evidence in the \
knowledge base supports a YES or NO answer. \
Respond with EXACTLY this format:\n\
Answer: Yes/No\n\
Details: <brief explanation>\n\
If the knowledge base does not contain relevant information, \
answer \"N/A\" and explain why.\n\
Here is the knowledge base:\n{knowledge}\n\
The above is the knowledge base.";

/// Response envelope used by every backend endpoint
#[derive(Debug, Deserialize)]
struct Envelope {
    code: Option<i64>,
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct DocumentInfo {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    run: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    progress_msg: String,
}

/// Classify a document's parse state from its raw run/progress fields
fn doc_state_from(run: &str, progress: f64) -> DocumentState {
    if run == "FAIL" || run == "2" {
        DocumentState::Failed
    } else if progress >= 1.0 {
        DocumentState::Success
    } else if progress > 0.0 {
        DocumentState::Running
    } else {
        DocumentState::Pending
    }
}

/// Thin async wrapper around the inference backend REST API
pub struct RagClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    poll_interval: Duration,
    parse_timeout: Duration,
    similarity_threshold: f64,
    top_n: u32,
}

impl RagClient {
    pub fn new(settings: &Settings) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Connect(e.to_string()))?;

        Ok(Self {
            http,
            base_url: settings.backend_base_url.trim_end_matches('/').to_string(),
            api_key: settings.backend_api_key.clone(),
            poll_interval: Duration::from_secs_f64(settings.poll_interval_secs),
            parse_timeout: Duration::from_secs_f64(settings.parse_timeout_secs),
            similarity_threshold: settings.similarity_threshold,
            top_n: settings.top_n,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, BackendError> {
        let response = req
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(e.to_string())
                } else if e.is_connect() {
                    BackendError::Connect(format!("{}: {}", self.base_url, e))
                } else {
                    BackendError::Api(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        if !status.is_success() {
            let detail: String = text.chars().take(500).collect();
            return Err(BackendError::HttpStatus(status.as_u16(), detail));
        }

        let envelope: Envelope = serde_json::from_str(&text).map_err(|_| {
            BackendError::InvalidResponse(text.chars().take(300).collect())
        })?;

        match envelope.code {
            Some(0) | None => Ok(envelope.data),
            Some(code) => Err(BackendError::Api(format!(
                "code {}: {}",
                code,
                envelope.message.unwrap_or_default()
            ))),
        }
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, BackendError> {
        self.send(self.http.get(self.url(path)).query(params)).await
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, BackendError> {
        self.send(self.http.post(self.url(path)).json(&body)).await
    }

    async fn delete_json(&self, path: &str, body: Value) -> Result<Value, BackendError> {
        self.send(self.http.delete(self.url(path)).json(&body)).await
    }

    /// The backend reports absence of name-filtered resources as
    /// permission/existence errors; translate those into "no results".
    fn is_absence_error(err: &BackendError) -> bool {
        let msg = match err {
            BackendError::Api(m) | BackendError::HttpStatus(_, m) => m,
            _ => return false,
        };
        msg.contains("lacks permission") || msg.contains("doesn't exist")
    }

    async fn list_datasets(&self, name: Option<&str>) -> Result<Vec<Value>, BackendError> {
        let mut params = vec![("page", "1".to_string()), ("page_size", "100".to_string())];
        if let Some(name) = name {
            params.push(("name", name.to_string()));
        }
        match self.get("/api/v1/datasets", &params).await {
            Ok(data) => Ok(data.as_array().cloned().unwrap_or_default()),
            Err(err) if name.is_some() && Self::is_absence_error(&err) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    async fn create_dataset(&self, name: &str) -> Result<String, BackendError> {
        let data = self
            .post_json("/api/v1/datasets", json!({ "name": name }))
            .await?;
        data["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BackendError::InvalidResponse("dataset create returned no id".into()))
    }

    async fn delete_datasets(&self, ids: &[String]) -> Result<(), BackendError> {
        self.delete_json("/api/v1/datasets", json!({ "ids": ids }))
            .await?;
        Ok(())
    }

    async fn list_documents(&self, dataset_id: &str) -> Result<Vec<DocumentInfo>, BackendError> {
        let data = self
            .get(
                &format!("/api/v1/datasets/{}/documents", dataset_id),
                &[("page", "1".to_string()), ("page_size", "100".to_string())],
            )
            .await?;
        let docs = data
            .get("docs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(docs
            .into_iter()
            .filter_map(|d| serde_json::from_value(d).ok())
            .collect())
    }

    async fn list_chats(&self, name: Option<&str>) -> Result<Vec<Value>, BackendError> {
        let mut params = vec![("page", "1".to_string()), ("page_size", "100".to_string())];
        if let Some(name) = name {
            params.push(("name", name.to_string()));
        }
        match self.get("/api/v1/chats", &params).await {
            Ok(data) => Ok(data.as_array().cloned().unwrap_or_default()),
            Err(err) if name.is_some() && Self::is_absence_error(&err) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    async fn create_chat(&self, name: &str, dataset_ids: &[String]) -> Result<String, BackendError> {
        let payload = json!({
            "name": name,
            "dataset_ids": dataset_ids,
            "prompt": {
                "system": SYSTEM_PROMPT,
                "quote": true,
                "similarity_threshold": self.similarity_threshold,
                "top_n": self.top_n,
            },
        });
        let data = self.post_json("/api/v1/chats", payload).await?;
        data["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BackendError::InvalidResponse("chat create returned no id".into()))
    }

    async fn delete_chats(&self, ids: &[String]) -> Result<(), BackendError> {
        self.delete_json("/api/v1/chats", json!({ "ids": ids })).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl InferenceBackend for RagClient {
    async fn ensure_dataset(&self, name: &str) -> Result<String, BackendError> {
        // Delete any same-named dataset first so the caller always gets a
        // clean, empty one
        let existing = self.list_datasets(Some(name)).await?;
        let stale: Vec<String> = existing
            .iter()
            .filter(|ds| ds["name"].as_str() == Some(name))
            .filter_map(|ds| ds["id"].as_str().map(str::to_string))
            .collect();
        if !stale.is_empty() {
            info!(name = %name, count = stale.len(), "Deleting existing dataset(s) before create");
            self.delete_datasets(&stale).await?;
        }
        self.create_dataset(name).await
    }

    async fn upload_document(
        &self,
        dataset_id: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BackendError> {
        let part = multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = multipart::Form::new().part("file", part);
        let data = self
            .send(
                self.http
                    .post(self.url(&format!("/api/v1/datasets/{}/documents", dataset_id)))
                    .multipart(form),
            )
            .await?;

        data.as_array()
            .and_then(|docs| docs.first())
            .and_then(|doc| doc["id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                BackendError::InvalidResponse("upload succeeded but no document returned".into())
            })
    }

    async fn start_parsing(
        &self,
        dataset_id: &str,
        document_ids: &[String],
    ) -> Result<(), BackendError> {
        self.post_json(
            &format!("/api/v1/datasets/{}/chunks", dataset_id),
            json!({ "document_ids": document_ids }),
        )
        .await?;
        Ok(())
    }

    async fn wait_for_parsing(
        &self,
        dataset_id: &str,
        document_ids: &[String],
    ) -> Result<Vec<DocumentStatus>, BackendError> {
        let deadline = tokio::time::Instant::now() + self.parse_timeout;
        // Terminal outcome per document id, filled as polls resolve them
        let mut terminal: std::collections::HashMap<String, DocumentStatus> =
            std::collections::HashMap::new();
        let mut last_seen: std::collections::HashMap<String, DocumentInfo> =
            std::collections::HashMap::new();

        loop {
            let docs = self.list_documents(dataset_id).await?;
            for doc in docs {
                last_seen.insert(doc.id.clone(), doc);
            }

            let mut pending = false;
            for did in document_ids {
                if terminal.contains_key(did) {
                    continue;
                }
                match last_seen.get(did) {
                    None => {
                        terminal.insert(
                            did.clone(),
                            DocumentStatus {
                                document_id: did.clone(),
                                document_name: String::new(),
                                fingerprint: String::new(),
                                status: DocumentState::NotFound,
                                progress: 0.0,
                                message: format!("Document {} not found in dataset", did),
                            },
                        );
                    }
                    Some(doc) => match doc_state_from(&doc.run, doc.progress) {
                        DocumentState::Failed => {
                            let message = if doc.progress_msg.is_empty() {
                                "Parsing failed".to_string()
                            } else {
                                doc.progress_msg.clone()
                            };
                            terminal.insert(
                                did.clone(),
                                DocumentStatus {
                                    document_id: did.clone(),
                                    document_name: doc.name.clone(),
                                    fingerprint: String::new(),
                                    status: DocumentState::Failed,
                                    progress: doc.progress,
                                    message,
                                },
                            );
                        }
                        DocumentState::Success => {
                            terminal.insert(
                                did.clone(),
                                DocumentStatus {
                                    document_id: did.clone(),
                                    document_name: doc.name.clone(),
                                    fingerprint: String::new(),
                                    status: DocumentState::Success,
                                    progress: 1.0,
                                    message: "Parsed successfully".to_string(),
                                },
                            );
                        }
                        _ => pending = true,
                    },
                }
            }

            if !pending {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(dataset_id = %dataset_id, "Document parse polling hit timeout");
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        // Anything still unresolved after the deadline is a timeout
        for did in document_ids {
            if !terminal.contains_key(did) {
                let (name, progress) = last_seen
                    .get(did)
                    .map(|d| (d.name.clone(), d.progress))
                    .unwrap_or_default();
                terminal.insert(
                    did.clone(),
                    DocumentStatus {
                        document_id: did.clone(),
                        document_name: name,
                        fingerprint: String::new(),
                        status: DocumentState::Timeout,
                        progress,
                        message: "Document parsing timed out".to_string(),
                    },
                );
            }
        }

        Ok(document_ids
            .iter()
            .map(|did| terminal.remove(did).expect("every id resolved above"))
            .collect())
    }

    async fn ensure_chat(&self, name: &str, dataset_ids: &[String]) -> Result<String, BackendError> {
        let existing = self.list_chats(Some(name)).await?;
        let stale: Vec<String> = existing
            .iter()
            .filter(|ch| ch["name"].as_str() == Some(name))
            .filter_map(|ch| ch["id"].as_str().map(str::to_string))
            .collect();
        if !stale.is_empty() {
            info!(name = %name, count = stale.len(), "Deleting existing chat(s) before create");
            self.delete_chats(&stale).await?;
        }
        self.create_chat(name, dataset_ids).await
    }

    async fn create_session(&self, chat_id: &str) -> Result<String, BackendError> {
        let data = self
            .post_json(&format!("/api/v1/chats/{}/sessions", chat_id), json!({}))
            .await?;
        data["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BackendError::InvalidResponse("session create returned no id".into()))
    }

    async fn ask(
        &self,
        chat_id: &str,
        session_id: &str,
        question: &str,
    ) -> Result<AskOutcome, BackendError> {
        debug!(chat_id = %chat_id, session_id = %session_id, "Sending question to backend");
        let data = self
            .post_json(
                &format!("/api/v1/chats/{}/completions", chat_id),
                json!({
                    "question": question,
                    "session_id": session_id,
                    "stream": false,
                }),
            )
            .await?;

        let answer = data["answer"].as_str().unwrap_or_default().to_string();
        let chunks = data["reference"]["chunks"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| serde_json::from_value::<RetrievedChunk>(c).ok())
            .collect();

        Ok(AskOutcome { answer, chunks })
    }
}
