//! Page stamping and document concatenation.
//!
//! Stamping appends an isolated overlay to each page's content array: the
//! original streams are neither replaced nor reordered, and the overlay is
//! wrapped in its own graphics state so leftover state from the page content
//! cannot bleed into it.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};

use super::overlay::{self, OverlayLayer, FONT_RESOURCE};
use super::PdfError;

/// Page attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE_PAGE_KEYS: [&[u8]; 4] = [b"MediaBox", b"CropBox", b"Resources", b"Rotate"];

/// Output of stamping one source document, or of concatenating several
/// stamped documents into one.
#[derive(Debug)]
pub struct ComposedDocument {
    doc: Document,
    pages: usize,
}

impl ComposedDocument {
    pub fn page_count(&self) -> usize {
        self.pages
    }

    /// Serialize to PDF bytes, consuming the document.
    pub fn into_bytes(self) -> Result<Vec<u8>, PdfError> {
        let mut doc = self.doc;
        let mut buf = Vec::new();
        doc.save_to(&mut buf)
            .map_err(|e| PdfError::Assembly(e.to_string()))?;
        Ok(buf)
    }
}

/// Stamps a text label onto every page of source documents under `pdf_dir`.
/// Holds no mutable state; independent files can be processed in parallel.
pub struct PageComposer {
    pdf_dir: PathBuf,
}

impl PageComposer {
    pub fn new(pdf_dir: impl Into<PathBuf>) -> Self {
        Self {
            pdf_dir: pdf_dir.into(),
        }
    }

    /// Stamp a source file from the composer's directory.
    pub fn stamp_file(&self, filename: &str, label: &str) -> Result<ComposedDocument, PdfError> {
        let path = self.pdf_dir.join(filename);
        if !path.exists() {
            return Err(PdfError::NotFound {
                file: filename.to_string(),
            });
        }
        let bytes = std::fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => PdfError::PermissionDenied {
                path: path.display().to_string(),
            },
            _ => PdfError::Io(e),
        })?;
        self.stamp_bytes(&bytes, label, filename)
    }

    /// Stamp in-memory source bytes. `source_name` is used in error reports.
    pub fn stamp_bytes(
        &self,
        bytes: &[u8],
        label: &str,
        source_name: &str,
    ) -> Result<ComposedDocument, PdfError> {
        let mut doc = Document::load_mem(bytes).map_err(|e| PdfError::Corrupt {
            file: source_name.to_string(),
            reason: e.to_string(),
        })?;

        // Access-restricted sources are explicitly unsupported; never attempt
        // to decrypt.
        if doc.trailer.get(b"Encrypt").is_ok() {
            return Err(PdfError::Encrypted {
                file: source_name.to_string(),
            });
        }

        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });

        let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
        if pages.is_empty() {
            return Err(PdfError::Corrupt {
                file: source_name.to_string(),
                reason: "document has no pages".to_string(),
            });
        }

        for page_id in &pages {
            let (width, height) = page_box(&doc, *page_id, source_name)?;
            let layer = overlay::render(label, width, height)?;
            apply_overlay(&mut doc, *page_id, &layer, font_id, source_name)?;
        }

        tracing::debug!(file = %source_name, pages = pages.len(), "Stamped document");

        Ok(ComposedDocument {
            pages: pages.len(),
            doc,
        })
    }
}

/// Concatenate the pages of the given documents, in the order supplied, into
/// one output document. Inputs are consumed.
pub fn merge_all(documents: Vec<ComposedDocument>) -> Result<ComposedDocument, PdfError> {
    if documents.is_empty() {
        return Err(PdfError::NothingToMerge);
    }

    let mut merged = Document::with_version("1.5");
    let mut objects: BTreeMap<ObjectId, Object> = BTreeMap::new();
    let mut page_ids: Vec<ObjectId> = Vec::new();
    let mut offset = 1;

    for composed in documents {
        let mut doc = composed.doc;
        // Each source's page tree is discarded below; pin attributes pages
        // inherit from it onto the pages themselves first.
        flatten_inherited_attributes(&mut doc)?;
        doc.renumber_objects_with(offset);
        offset = doc.max_id + 1;
        page_ids.extend(doc.get_pages().into_values());
        objects.extend(doc.objects);
    }

    // Keep everything except the per-source page-tree roots and catalogs; a
    // single new tree re-parents all pages.
    for (id, object) in objects {
        match object.type_name().unwrap_or("") {
            "Catalog" | "Pages" | "Outlines" | "Outline" => {}
            _ => {
                merged.objects.insert(id, object);
            }
        }
    }
    merged.max_id = offset;

    let pages_id = merged.new_object_id();
    for page_id in &page_ids {
        let page = merged
            .get_object_mut(*page_id)
            .and_then(Object::as_dict_mut)
            .map_err(|e| PdfError::Assembly(format!("page {page_id:?} lost in merge: {e}")))?;
        page.set("Parent", Object::Reference(pages_id));
    }

    let kids: Vec<Object> = page_ids.iter().map(|id| Object::Reference(*id)).collect();
    let count = page_ids.len();
    merged.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count as i64,
        }),
    );

    let catalog_id = merged.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    merged.trailer.set("Root", Object::Reference(catalog_id));
    merged.renumber_objects();
    merged.compress();

    Ok(ComposedDocument {
        doc: merged,
        pages: count,
    })
}

/// Copy inheritable attributes down onto every page that lacks them.
fn flatten_inherited_attributes(doc: &mut Document) -> Result<(), PdfError> {
    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    for page_id in pages {
        for key in INHERITABLE_PAGE_KEYS {
            let already_set = doc
                .get_dictionary(page_id)
                .map(|d| d.has(key))
                .unwrap_or(false);
            if already_set {
                continue;
            }
            if let Some(value) = find_inherited(doc, page_id, key) {
                let page = doc
                    .get_object_mut(page_id)
                    .and_then(Object::as_dict_mut)
                    .map_err(|e| PdfError::Assembly(e.to_string()))?;
                page.set(key, value);
            }
        }
    }
    Ok(())
}

/// Resolve a possibly-inherited page attribute by walking the Parent chain.
fn find_inherited(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let mut current = page_id;
    // Bounded walk: a well-formed page tree is shallow, and a malformed one
    // must not loop us forever.
    for _ in 0..32 {
        let dict = doc.get_dictionary(current).ok()?;
        if let Ok(value) = dict.get(key) {
            return Some(value.clone());
        }
        match dict.get(b"Parent") {
            Ok(Object::Reference(parent)) => current = *parent,
            _ => return None,
        }
    }
    None
}

/// Width and height of the page's visible-content box: CropBox when present,
/// otherwise the (possibly inherited) MediaBox.
fn page_box(doc: &Document, page_id: ObjectId, source_name: &str) -> Result<(f64, f64), PdfError> {
    let rect = find_inherited(doc, page_id, b"CropBox")
        .or_else(|| find_inherited(doc, page_id, b"MediaBox"))
        .and_then(|obj| as_rect(doc, &obj));

    match rect {
        Some([x0, y0, x1, y1]) => Ok(((x1 - x0).abs(), (y1 - y0).abs())),
        None => Err(PdfError::Corrupt {
            file: source_name.to_string(),
            reason: format!("page {page_id:?} has no usable page box"),
        }),
    }
}

fn as_rect(doc: &Document, obj: &Object) -> Option<[f64; 4]> {
    let resolved = match obj {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    let arr = resolved.as_array().ok()?;
    if arr.len() != 4 {
        return None;
    }
    let mut rect = [0f64; 4];
    for (slot, value) in rect.iter_mut().zip(arr) {
        *slot = match value {
            Object::Integer(v) => *v as f64,
            Object::Real(v) => f64::from(*v),
            _ => return None,
        };
    }
    Some(rect)
}

/// Composite a rendered layer on top of one page.
///
/// The page's content array becomes `[q, <original streams...>, Q overlay]`:
/// a no-op state push before the original content and a state pop plus the
/// overlay after it. Existing streams are untouched.
fn apply_overlay(
    doc: &mut Document,
    page_id: ObjectId,
    layer: &OverlayLayer,
    font_id: ObjectId,
    source_name: &str,
) -> Result<(), PdfError> {
    let (page_width, page_height) = page_box(doc, page_id, source_name)?;
    if layer.width() != page_width || layer.height() != page_height {
        return Err(PdfError::LayerSizeMismatch {
            layer_width: layer.width(),
            layer_height: layer.height(),
            page_width,
            page_height,
        });
    }

    register_overlay_font(doc, page_id, font_id)?;

    let existing = existing_contents(doc, page_id)?;

    let before_id = doc.add_object(Stream::new(dictionary! {}, b"q\n".to_vec()));
    let mut after = Vec::with_capacity(layer.ops().len() + 8);
    after.extend_from_slice(b"Q\nq\n");
    after.extend_from_slice(layer.ops());
    after.extend_from_slice(b"\nQ");
    let after_id = doc.add_object(Stream::new(dictionary! {}, after));

    let mut contents = Vec::with_capacity(existing.len() + 2);
    contents.push(Object::Reference(before_id));
    contents.extend(existing);
    contents.push(Object::Reference(after_id));

    let page = doc
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| PdfError::Assembly(e.to_string()))?;
    page.set("Contents", Object::Array(contents));
    Ok(())
}

fn existing_contents(doc: &mut Document, page_id: ObjectId) -> Result<Vec<Object>, PdfError> {
    let contents = {
        let page = doc
            .get_dictionary(page_id)
            .map_err(|e| PdfError::Assembly(e.to_string()))?;
        page.get(b"Contents").ok().cloned()
    };
    match contents {
        Some(Object::Array(refs)) => Ok(refs),
        Some(Object::Reference(id)) => match doc.get_object(id) {
            // A reference may point at an array of stream references
            Ok(Object::Array(refs)) => Ok(refs.clone()),
            _ => Ok(vec![Object::Reference(id)]),
        },
        // A stream stored inline in the page dictionary cannot sit in a
        // content array; hoist it into its own object first.
        Some(Object::Stream(stream)) => {
            let id = doc.add_object(Object::Stream(stream));
            Ok(vec![Object::Reference(id)])
        }
        _ => Ok(Vec::new()),
    }
}

/// Make the overlay font reachable from the page's resources without
/// mutating a resource dictionary other pages may share: the effective
/// resources are copied onto the page and extended there.
fn register_overlay_font(
    doc: &mut Document,
    page_id: ObjectId,
    font_id: ObjectId,
) -> Result<(), PdfError> {
    let mut resources = match find_inherited(doc, page_id, b"Resources") {
        Some(Object::Dictionary(dict)) => dict,
        Some(Object::Reference(id)) => doc
            .get_dictionary(id)
            .map(Dictionary::clone)
            .unwrap_or_else(|_| Dictionary::new()),
        _ => Dictionary::new(),
    };

    let mut fonts = match resources.get(b"Font") {
        Ok(Object::Dictionary(dict)) => dict.clone(),
        Ok(Object::Reference(id)) => doc
            .get_dictionary(*id)
            .map(Dictionary::clone)
            .unwrap_or_else(|_| Dictionary::new()),
        _ => Dictionary::new(),
    };
    fonts.set(FONT_RESOURCE.to_vec(), Object::Reference(font_id));
    resources.set("Font", Object::Dictionary(fonts));

    let page = doc
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| PdfError::Assembly(e.to_string()))?;
    page.set("Resources", Object::Dictionary(resources));
    Ok(())
}
