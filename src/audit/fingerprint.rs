//! Operation identity hashing for duplicate detection.
//!
//! The fingerprint is a pure function of the semantic key fields: file
//! selection order never changes it, and audit metadata (timestamp, actor,
//! reason, output location) never enters it.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::models::OperationKey;

/// Canonical encoding of the key fields. Field order is alphabetical so the
/// serialized form is stable across releases.
#[derive(Serialize)]
struct CanonicalKey<'a> {
    center_code: &'a str,
    hospital_number: &'a str,
    merge_flag: bool,
    operation_type: &'a str,
    pdf_files: &'a [String],
    time_point: &'a str,
}

/// Compute the SHA-256 fingerprint of an operation key as a 64-char lowercase
/// hex digest. Deterministic on any machine, any run.
pub fn compute(key: &OperationKey) -> String {
    let mut files = key.files.clone();
    files.sort();

    let canonical = CanonicalKey {
        center_code: key.center.as_str(),
        hospital_number: &key.hospital_number,
        merge_flag: key.merge,
        operation_type: key.kind.as_str(),
        pdf_files: &files,
        time_point: key.time_point.as_str(),
    };

    // CanonicalKey contains no map types, so serialization cannot fail
    let encoded = serde_json::to_string(&canonical).expect("canonical key serializes");
    let digest = Sha256::digest(encoded.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CenterCode, OperationKind, TimePoint};

    fn key(files: &[&str]) -> OperationKey {
        OperationKey {
            time_point: TimePoint::A0,
            center: CenterCode::Cmc,
            hospital_number: "12345".into(),
            files: files.iter().map(|s| s.to_string()).collect(),
            kind: OperationKind::Download,
            merge: false,
        }
    }

    #[test]
    fn digest_is_64_hex_chars() {
        let fp = compute(&key(&["arat.pdf", "nhpt.pdf"]));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn selection_order_does_not_matter() {
        let a = compute(&key(&["arat.pdf", "nhpt.pdf"]));
        let b = compute(&key(&["nhpt.pdf", "arat.pdf"]));
        assert_eq!(a, b);
    }

    #[test]
    fn deterministic_across_calls() {
        let a = compute(&key(&["arat.pdf", "nhpt.pdf", "wmft.pdf"]));
        let b = compute(&key(&["arat.pdf", "nhpt.pdf", "wmft.pdf"]));
        assert_eq!(a, b);
    }

    #[test]
    fn each_key_field_changes_digest() {
        let base = compute(&key(&["arat.pdf", "nhpt.pdf"]));

        let mut k = key(&["arat.pdf", "nhpt.pdf"]);
        k.time_point = TimePoint::A1;
        assert_ne!(compute(&k), base);

        let mut k = key(&["arat.pdf", "nhpt.pdf"]);
        k.center = CenterCode::Mnp;
        assert_ne!(compute(&k), base);

        let mut k = key(&["arat.pdf", "nhpt.pdf"]);
        k.hospital_number = "54321".into();
        assert_ne!(compute(&k), base);

        assert_ne!(compute(&key(&["arat.pdf"])), base);

        let mut k = key(&["arat.pdf", "nhpt.pdf"]);
        k.kind = OperationKind::Print;
        assert_ne!(compute(&k), base);

        let mut k = key(&["arat.pdf", "nhpt.pdf"]);
        k.merge = true;
        assert_ne!(compute(&k), base);
    }

    #[test]
    fn input_key_is_not_mutated() {
        let k = key(&["nhpt.pdf", "arat.pdf"]);
        let _ = compute(&k);
        assert_eq!(k.files, vec!["nhpt.pdf".to_string(), "arat.pdf".to_string()]);
    }
}
