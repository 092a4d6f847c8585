//! Citation extraction and reference shaping
//!
//! Answers cite retrieved chunks inline as `[ID:N]` where N is the
//! zero-based index into the retrieval set. This module extracts those
//! markers, reduces the retrieval set to the cited subset, and shapes each
//! surviving chunk into a typed `Reference`. It also parses the
//! `Answer:`/`Details:` verdict format out of the free text.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::backend::RetrievedChunk;
use crate::models::{detect_doc_type, RefLocation, Reference, Verdict};

/// Snippets are capped at this many characters (plus an ellipsis)
const SNIPPET_MAX_CHARS: usize = 300;

fn citation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[ID:(\d+)\]").expect("citation marker pattern"))
}

fn answer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\banswer\s*:\s*(yes|no|n/?a)\b").expect("answer pattern"))
}

fn details_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)\bdetails?\s*:\s*(.*)").expect("details pattern"))
}

/// Extract the deduplicated set of `[ID:N]` indices from answer text
pub fn cited_indices(answer: &str) -> BTreeSet<usize> {
    citation_re()
        .captures_iter(answer)
        .filter_map(|cap| cap[1].parse::<usize>().ok())
        .collect()
}

/// Parse the Yes/No/N-A verdict and the detail explanation.
///
/// Without an `Answer:` line the verdict defaults to N/A; without a
/// `Details:` line the whole answer text becomes the details.
pub fn parse_verdict(answer: &str) -> (Verdict, String) {
    let verdict = match answer_re().captures(answer) {
        Some(cap) => match cap[1].to_ascii_uppercase().as_str() {
            "YES" => Verdict::Yes,
            "NO" => Verdict::No,
            _ => Verdict::NotApplicable,
        },
        None => Verdict::NotApplicable,
    };

    let details = match details_re().captures(answer) {
        Some(cap) => cap[1].trim().to_string(),
        None => answer.to_string(),
    };

    (verdict, details)
}

/// Reduce the retrieval set to the cited subset and shape each chunk.
///
/// With `only_cited` enabled and at least one in-range marker present,
/// only the cited chunks survive, in original retrieval order. When
/// citation parsing finds nothing the full set is returned instead —
/// imperfect citation behaviour from the answering model must not produce
/// an empty reference list.
pub fn resolve_references(
    answer: &str,
    chunks: &[RetrievedChunk],
    only_cited: bool,
) -> Vec<Reference> {
    let cited: BTreeSet<usize> = cited_indices(answer)
        .into_iter()
        .filter(|&i| i < chunks.len())
        .collect();
    let filter_active = only_cited && !cited.is_empty();

    chunks
        .iter()
        .enumerate()
        .filter(|(i, _)| !filter_active || cited.contains(i))
        .map(|(_, chunk)| build_reference(chunk))
        .collect()
}

/// Shape one retrieved chunk into a typed reference
pub fn build_reference(chunk: &RetrievedChunk) -> Reference {
    let doc_type = detect_doc_type(&chunk.document_name);

    let image_url = chunk
        .image_id
        .as_ref()
        .map(|id| format!("/api/v1/proxy/image/{}", id));
    let first_row = chunk.positions.first().map(Vec::as_slice);
    let location = RefLocation::from_positions(&doc_type, first_row, image_url);

    // Document links go through the service proxy so raw backend URLs are
    // never exposed to clients
    let document_url = if chunk.document_id.is_empty() {
        None
    } else {
        let mut url = format!("/api/v1/proxy/document/{}", chunk.document_id);
        if let Some(page) = location.as_ref().and_then(RefLocation::page_number) {
            url.push_str(&format!("#page={}", page));
        }
        Some(url)
    };

    let content = chunk.content.trim();
    let snippet = if content.chars().count() > SNIPPET_MAX_CHARS {
        let truncated: String = content.chars().take(SNIPPET_MAX_CHARS).collect();
        format!("{}...", truncated)
    } else {
        content.to_string()
    };

    Reference {
        document_name: chunk.document_name.clone(),
        document_type: doc_type,
        location,
        snippet,
        document_url,
    }
}
