//! Content-addressed document deduplication
//!
//! Identity is the SHA-256 of the file bytes; filenames never participate.
//! Dedup scope is the owning task: a file is a duplicate if its fingerprint
//! was recorded by any prior upload call for the task, or appeared earlier
//! in the same batch. Fingerprints are recorded by the caller only after a
//! successful upload, so a failed upload can be retried without being
//! mistaken for a duplicate.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// Compute the content fingerprint of a file
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// One genuinely new file that survived dedup filtering
#[derive(Debug, Clone)]
pub struct NewFile {
    pub name: String,
    pub bytes: Vec<u8>,
    pub fingerprint: String,
}

/// Result of filtering an upload batch
#[derive(Debug)]
pub struct DedupOutcome {
    /// New files in their original batch order
    pub accepted: Vec<NewFile>,
    /// Number of duplicates dropped
    pub skipped: usize,
}

/// Filter an ordered batch of (filename, bytes) pairs against the
/// fingerprints already recorded for the task.
pub fn filter_duplicates(
    files: Vec<(String, Vec<u8>)>,
    known_fingerprints: &HashMap<String, String>,
) -> DedupOutcome {
    let mut seen_in_batch: HashSet<String> = HashSet::new();
    let mut accepted = Vec::new();
    let mut skipped = 0;

    for (name, bytes) in files {
        let fp = fingerprint(&bytes);
        if known_fingerprints.contains_key(&fp) || !seen_in_batch.insert(fp.clone()) {
            skipped += 1;
            continue;
        }
        accepted.push(NewFile {
            name,
            bytes,
            fingerprint: fp,
        });
    }

    DedupOutcome { accepted, skipped }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(files: &[(&str, &str)]) -> Vec<(String, Vec<u8>)> {
        files
            .iter()
            .map(|(name, content)| (name.to_string(), content.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn identical_content_different_name_is_a_duplicate() {
        let outcome = filter_duplicates(
            batch(&[("a.pdf", "same bytes"), ("b.pdf", "same bytes")]),
            &HashMap::new(),
        );
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.accepted[0].name, "a.pdf");
    }

    #[test]
    fn accept_plus_skip_equals_batch_size() {
        let outcome = filter_duplicates(
            batch(&[("a", "x"), ("b", "y"), ("c", "x"), ("d", "z"), ("e", "y")]),
            &HashMap::new(),
        );
        assert_eq!(outcome.accepted.len() + outcome.skipped, 5);
        assert_eq!(outcome.accepted.len(), 3);
    }

    #[test]
    fn previously_recorded_fingerprints_are_skipped() {
        let mut known = HashMap::new();
        known.insert(fingerprint(b"already there"), "doc1".to_string());

        let outcome = filter_duplicates(
            batch(&[("new.pdf", "fresh"), ("old.pdf", "already there")]),
            &known,
        );
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].name, "new.pdf");
        assert_eq!(outcome.skipped, 1);
    }

    #[test]
    fn order_of_accepted_files_is_preserved() {
        let outcome = filter_duplicates(
            batch(&[("1", "a"), ("2", "b"), ("3", "c")]),
            &HashMap::new(),
        );
        let names: Vec<&str> = outcome.accepted.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["1", "2", "3"]);
    }

    #[test]
    fn fingerprint_is_stable_hex_sha256() {
        let fp = fingerprint(b"");
        assert_eq!(
            fp,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
