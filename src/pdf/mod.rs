//! PDF composition: overlay rendering, page stamping and document merging.

pub mod batch;
pub mod composer;
pub mod overlay;

#[cfg(test)]
pub(crate) mod testutil;

pub use batch::{process_all, BatchItem};
pub use composer::{merge_all, ComposedDocument, PageComposer};
pub use overlay::{OverlayLayer, RenderError};

use thiserror::Error;

/// Per-file error taxonomy. Every variant is surfaced per source file by the
/// batch layer; none of them aborts a batch.
#[derive(Error, Debug)]
pub enum PdfError {
    #[error("PDF file not found: {file}")]
    NotFound { file: String },

    #[error("Cannot process encrypted PDF: {file}")]
    Encrypted { file: String },

    #[error("Cannot parse PDF {file}: {reason}")]
    Corrupt { file: String, reason: String },

    #[error("Overlay render failed: {0}")]
    Render(#[from] RenderError),

    #[error("Overlay layer is {layer_width}x{layer_height} but page is {page_width}x{page_height}")]
    LayerSizeMismatch {
        layer_width: f64,
        layer_height: f64,
        page_width: f64,
        page_height: f64,
    },

    #[error("PDF assembly error: {0}")]
    Assembly(String),

    #[error("Permission denied writing {path} (check folder permissions)")]
    PermissionDenied { path: String },

    #[error("No successfully processed documents to merge")]
    NothingToMerge,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
