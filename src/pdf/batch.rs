//! Batch stamping across a list of requested source files.
//!
//! Failures are captured per entry; one broken source never aborts the rest
//! of the batch, and nothing is retried.

use super::composer::{ComposedDocument, PageComposer};
use super::PdfError;

/// Outcome for one requested source file. Items come back in request order.
pub struct BatchItem {
    pub id: String,
    pub outcome: Result<ComposedDocument, PdfError>,
}

impl BatchItem {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Stamp every requested `(id, label)` entry independently.
pub fn process_all(composer: &PageComposer, requests: &[(String, String)]) -> Vec<BatchItem> {
    let mut results = Vec::with_capacity(requests.len());
    for (id, label) in requests {
        match composer.stamp_file(id, label) {
            Ok(composed) => results.push(BatchItem {
                id: id.clone(),
                outcome: Ok(composed),
            }),
            Err(e) => {
                tracing::warn!(file = %id, error = %e, "Failed to stamp file");
                results.push(BatchItem {
                    id: id.clone(),
                    outcome: Err(e),
                });
            }
        }
    }
    results
}
