//! Download and print workflows: stamp the requested files, deliver the
//! output, and record the operation in the audit store.
//!
//! Callers are expected to run `OperationStore::check_duplicate` first and,
//! when a prior record exists, collect a justification before calling back in
//! with `reprint_reason` set. The duplicate flag on the stored record follows
//! from the presence of that reason.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::audit::OperationStore;
use crate::db::DatabaseError;
use crate::models::OperationKey;
use crate::pdf::composer::{merge_all, ComposedDocument, PageComposer};
use crate::pdf::{batch, PdfError};

/// Justification length policy for duplicate operations.
pub const REASON_MIN_LEN: usize = 10;
pub const REASON_MAX_LEN: usize = 500;

#[derive(Error, Debug)]
pub enum StampingError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("PDF error: {0}")]
    Pdf(#[from] PdfError),

    #[error("Reprint reason must be 10-500 characters, got {0}")]
    InvalidReason(usize),

    #[error("No documents could be processed")]
    AllFailed { failures: Vec<(String, PdfError)> },
}

/// Where the stamped output goes.
enum Delivery {
    /// User-chosen directory; recorded as the operation's output location.
    Download { output_dir: PathBuf },
    /// Per-app temp staging, handed to an external viewer by the caller;
    /// no output location is recorded.
    Print,
}

/// Result of a completed (possibly partially failed) stamping operation.
#[derive(Debug)]
pub struct StampOutcome {
    pub saved: Vec<PathBuf>,
    pub failures: Vec<(String, PdfError)>,
    pub record_id: i64,
}

impl StampOutcome {
    pub fn fully_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Stamp and save the requested files into `output_dir`.
pub fn download(
    composer: &PageComposer,
    store: &mut OperationStore,
    key: &OperationKey,
    reprint_reason: Option<&str>,
    output_dir: &Path,
) -> Result<StampOutcome, StampingError> {
    run(
        composer,
        store,
        key,
        reprint_reason,
        Delivery::Download {
            output_dir: output_dir.to_path_buf(),
        },
    )
}

/// Stamp the requested files into the print staging directory. The returned
/// paths are ready to hand to an external viewer; printing itself is not
/// this crate's job.
pub fn prepare_print(
    composer: &PageComposer,
    store: &mut OperationStore,
    key: &OperationKey,
    reprint_reason: Option<&str>,
) -> Result<StampOutcome, StampingError> {
    run(composer, store, key, reprint_reason, Delivery::Print)
}

fn run(
    composer: &PageComposer,
    store: &mut OperationStore,
    key: &OperationKey,
    reprint_reason: Option<&str>,
    delivery: Delivery,
) -> Result<StampOutcome, StampingError> {
    if let Some(reason) = reprint_reason {
        validate_reason(reason)?;
    }

    let label = key.label();
    let requests: Vec<(String, String)> = key
        .files
        .iter()
        .map(|f| (f.clone(), label.clone()))
        .collect();

    let mut composed: Vec<(String, ComposedDocument)> = Vec::new();
    let mut failures: Vec<(String, PdfError)> = Vec::new();
    for item in batch::process_all(composer, &requests) {
        match item.outcome {
            Ok(doc) => composed.push((item.id, doc)),
            Err(e) => failures.push((item.id, e)),
        }
    }

    if composed.is_empty() {
        return Err(StampingError::AllFailed { failures });
    }

    let out_dir = match &delivery {
        Delivery::Download { output_dir } => output_dir.clone(),
        Delivery::Print => print_staging_dir()?,
    };

    let mut saved = Vec::new();
    if key.merge {
        let docs = composed.into_iter().map(|(_, doc)| doc).collect();
        let merged = merge_all(docs)?;
        let path = out_dir.join(format!("{}_merged.pdf", key.hospital_number));
        write_output(&path, merged)?;
        saved.push(path);
    } else {
        for (id, doc) in composed {
            let stem = Path::new(id.as_str())
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(id.as_str());
            let path = out_dir.join(format!("{}_{stem}.pdf", key.hospital_number));
            match write_output(&path, doc) {
                Ok(()) => saved.push(path),
                Err(e) => failures.push((id, e)),
            }
        }
        if saved.is_empty() {
            return Err(StampingError::AllFailed { failures });
        }
    }

    let output_location = match &delivery {
        Delivery::Download { output_dir } => Some(output_dir.display().to_string()),
        Delivery::Print => None,
    };
    let record_id = store.record_operation(
        key,
        reprint_reason.is_some(),
        reprint_reason,
        output_location.as_deref(),
    )?;

    tracing::info!(
        kind = key.kind.as_str(),
        saved = saved.len(),
        failed = failures.len(),
        record_id,
        "Stamping operation recorded"
    );

    Ok(StampOutcome {
        saved,
        failures,
        record_id,
    })
}

/// Enforce the justification policy for duplicate operations.
pub fn validate_reason(reason: &str) -> Result<(), StampingError> {
    let len = reason.trim().chars().count();
    if !(REASON_MIN_LEN..=REASON_MAX_LEN).contains(&len) {
        return Err(StampingError::InvalidReason(len));
    }
    Ok(())
}

fn write_output(path: &Path, doc: ComposedDocument) -> Result<(), PdfError> {
    let bytes = doc.into_bytes()?;
    std::fs::write(path, bytes).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => PdfError::PermissionDenied {
            path: path.display().to_string(),
        },
        _ => PdfError::Io(e),
    })
}

fn print_staging_dir() -> Result<PathBuf, StampingError> {
    let dir = std::env::temp_dir().join("chartstamp_print");
    std::fs::create_dir_all(&dir).map_err(PdfError::Io)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CenterCode, OperationKind, TimePoint};
    use crate::pdf::testutil::make_test_pdf;

    fn key(files: &[&str], kind: OperationKind, merge: bool) -> OperationKey {
        OperationKey {
            time_point: TimePoint::A0,
            center: CenterCode::Cmc,
            hospital_number: "12345".into(),
            files: files.iter().map(|s| s.to_string()).collect(),
            kind,
            merge,
        }
    }

    fn setup(files: &[&str]) -> (tempfile::TempDir, PageComposer, OperationStore) {
        let dir = tempfile::tempdir().unwrap();
        for name in files {
            std::fs::write(dir.path().join(name), make_test_pdf(&[name])).unwrap();
        }
        let composer = PageComposer::new(dir.path());
        let store = OperationStore::open_in_memory().unwrap();
        (dir, composer, store)
    }

    #[test]
    fn download_saves_one_file_per_source() {
        let (_dir, composer, mut store) = setup(&["arat.pdf", "nhpt.pdf"]);
        let out = tempfile::tempdir().unwrap();
        let k = key(&["arat.pdf", "nhpt.pdf"], OperationKind::Download, false);

        let outcome = download(&composer, &mut store, &k, None, out.path()).unwrap();
        assert!(outcome.fully_succeeded());
        assert_eq!(outcome.saved.len(), 2);
        assert!(out.path().join("12345_arat.pdf").exists());
        assert!(out.path().join("12345_nhpt.pdf").exists());

        let record = store.check_duplicate(&k).unwrap().expect("operation recorded");
        assert_eq!(record.id, outcome.record_id);
        assert!(!record.is_duplicate);
        assert_eq!(
            record.output_location.as_deref(),
            Some(out.path().display().to_string().as_str())
        );
    }

    #[test]
    fn download_with_merge_saves_single_document() {
        let (_dir, composer, mut store) = setup(&["arat.pdf", "nhpt.pdf"]);
        let out = tempfile::tempdir().unwrap();
        let k = key(&["arat.pdf", "nhpt.pdf"], OperationKind::Download, true);

        let outcome = download(&composer, &mut store, &k, None, out.path()).unwrap();
        assert_eq!(outcome.saved, vec![out.path().join("12345_merged.pdf")]);
        assert!(out.path().join("12345_merged.pdf").exists());
    }

    #[test]
    fn partial_failure_still_records_the_operation() {
        let (_dir, composer, mut store) = setup(&["arat.pdf"]);
        let out = tempfile::tempdir().unwrap();
        let k = key(&["arat.pdf", "missing.pdf"], OperationKind::Download, false);

        let outcome = download(&composer, &mut store, &k, None, out.path()).unwrap();
        assert_eq!(outcome.saved.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(outcome.failures[0].1, PdfError::NotFound { .. }));
        assert!(store.check_duplicate(&k).unwrap().is_some());
    }

    #[test]
    fn zero_successes_is_a_full_failure_and_records_nothing() {
        let (_dir, composer, mut store) = setup(&[]);
        let out = tempfile::tempdir().unwrap();
        let k = key(&["missing_a.pdf", "missing_b.pdf"], OperationKind::Download, false);

        let err = download(&composer, &mut store, &k, None, out.path()).unwrap_err();
        match err {
            StampingError::AllFailed { failures } => assert_eq!(failures.len(), 2),
            other => panic!("expected AllFailed, got {other}"),
        }
        assert!(store.check_duplicate(&k).unwrap().is_none());
    }

    #[test]
    fn encrypted_source_is_excluded_but_reported() {
        let (_dir, composer, mut store) = {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("arat.pdf"), make_test_pdf(&["ARAT"])).unwrap();
            std::fs::write(
                dir.path().join("locked.pdf"),
                crate::pdf::testutil::make_encrypted_pdf(),
            )
            .unwrap();
            let composer = PageComposer::new(dir.path());
            (dir, composer, OperationStore::open_in_memory().unwrap())
        };
        let out = tempfile::tempdir().unwrap();
        let k = key(&["arat.pdf", "locked.pdf"], OperationKind::Download, true);

        let outcome = download(&composer, &mut store, &k, None, out.path()).unwrap();
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].0, "locked.pdf");
        assert!(matches!(outcome.failures[0].1, PdfError::Encrypted { .. }));
        // The merged output exists and contains only the readable source
        assert!(out.path().join("12345_merged.pdf").exists());
    }

    #[test]
    fn repeat_download_with_reason_marks_duplicate() {
        let (_dir, composer, mut store) = setup(&["arat.pdf"]);
        let out = tempfile::tempdir().unwrap();
        let k = key(&["arat.pdf"], OperationKind::Download, false);

        download(&composer, &mut store, &k, None, out.path()).unwrap();
        download(
            &composer,
            &mut store,
            &k,
            Some("Ward copy misplaced, reprint requested by sister in charge"),
            out.path(),
        )
        .unwrap();

        let record = store.check_duplicate(&k).unwrap().unwrap();
        assert!(record.is_duplicate);
        assert!(record.reprint_reason.is_some());
    }

    #[test]
    fn reason_length_policy_enforced() {
        let (_dir, composer, mut store) = setup(&["arat.pdf"]);
        let out = tempfile::tempdir().unwrap();
        let k = key(&["arat.pdf"], OperationKind::Download, false);

        let err = download(&composer, &mut store, &k, Some("too short"), out.path()).unwrap_err();
        assert!(matches!(err, StampingError::InvalidReason(9)));

        let long = "x".repeat(REASON_MAX_LEN + 1);
        let err = download(&composer, &mut store, &k, Some(&long), out.path()).unwrap_err();
        assert!(matches!(err, StampingError::InvalidReason(_)));
    }

    #[test]
    fn print_stages_files_without_output_location() {
        let (_dir, composer, mut store) = setup(&["arat.pdf"]);
        let k = key(&["arat.pdf"], OperationKind::Print, false);

        let outcome = prepare_print(&composer, &mut store, &k, None).unwrap();
        assert_eq!(outcome.saved.len(), 1);
        assert!(outcome.saved[0].exists());
        assert!(outcome.saved[0].ends_with("12345_arat.pdf"));

        let record = store.check_duplicate(&k).unwrap().unwrap();
        assert!(record.output_location.is_none());
    }
}
