//! Citation reference types
//!
//! The inference backend encodes chunk positions as five-element arrays
//! whose meaning depends on the source document type: PDFs carry a real
//! page number plus bounding-box coordinates, slide decks carry a slide
//! number with zeroed coordinates, and every other type repeats a chunk or
//! row counter. The location is modelled as a tagged variant so the answer
//! path never inspects raw arrays.

use serde::{Deserialize, Serialize};

/// Yes/No/N-A verdict parsed from the answer text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Yes,
    No,
    #[serde(rename = "N/A")]
    NotApplicable,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Yes => f.write_str("Yes"),
            Verdict::No => f.write_str("No"),
            Verdict::NotApplicable => f.write_str("N/A"),
        }
    }
}

/// Type-conditional position of a cited chunk within its document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefLocation {
    /// PDF: page number, bounding box, optional preview image
    Pdf {
        page: i64,
        coordinates: Option<[f64; 4]>,
        image_url: Option<String>,
    },
    /// PPT/PPTX: slide number only; the backend zeroes the coordinates
    Slide { page: i64 },
    /// Everything else: zero-based chunk/row index
    Chunk { index: i64 },
}

impl RefLocation {
    /// Map a raw backend position array onto the typed location.
    ///
    /// `positions` is the first row of the chunk's position matrix;
    /// `None` when the backend reported no position at all.
    pub fn from_positions(
        doc_type: &str,
        positions: Option<&[f64]>,
        image_url: Option<String>,
    ) -> Option<Self> {
        let pos = positions?;
        let first = *pos.first()? as i64;
        match doc_type {
            "pdf" => {
                let coordinates = if pos.len() >= 5 {
                    Some([pos[1], pos[2], pos[3], pos[4]])
                } else {
                    None
                };
                Some(RefLocation::Pdf {
                    page: first,
                    coordinates,
                    image_url,
                })
            }
            "ppt" => Some(RefLocation::Slide { page: first }),
            _ => Some(RefLocation::Chunk { index: first }),
        }
    }

    /// Page or slide number, when the document type has one
    pub fn page_number(&self) -> Option<i64> {
        match self {
            RefLocation::Pdf { page, .. } | RefLocation::Slide { page } => Some(*page),
            RefLocation::Chunk { .. } => None,
        }
    }

    /// Chunk/row index for non-paged document types
    pub fn chunk_index(&self) -> Option<i64> {
        match self {
            RefLocation::Chunk { index } => Some(*index),
            _ => None,
        }
    }
}

/// A citation back to one evidence chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub document_name: String,
    /// Canonical family ("pdf", "excel", "docx", "ppt") or the bare
    /// extension for anything else
    pub document_type: String,
    pub location: Option<RefLocation>,
    #[serde(default)]
    pub snippet: String,
    pub document_url: Option<String>,
}

/// Infer a document type label from the file extension.
///
/// Known families get a canonical name; everything else returns the bare
/// extension ("md", "txt", ...) so callers always receive a meaningful
/// label, or "unknown" for names with no extension.
pub fn detect_doc_type(document_name: &str) -> String {
    let ext = document_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "pdf".to_string(),
        "xls" | "xlsx" | "xlsm" | "xlsb" | "csv" => "excel".to_string(),
        "doc" | "docx" => "docx".to_string(),
        "ppt" | "pptx" => "ppt".to_string(),
        "" => "unknown".to_string(),
        other => other.to_string(),
    }
}
