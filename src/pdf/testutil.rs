//! Test fixtures: minimal but well-formed PDF documents built with lopdf.

use lopdf::{dictionary, Document, Object, ObjectId, Stream};

/// Build an n-page document with one text stream per page.
pub(crate) fn make_test_pdf(page_texts: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.4");

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    let mut kids: Vec<Object> = Vec::new();
    let mut page_ids: Vec<ObjectId> = Vec::new();
    for text in page_texts {
        let content = format!("BT /F1 12 Tf 100 700 Td ({text}) Tj ET");
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            },
        });
        kids.push(Object::Reference(page_id));
        page_ids.push(page_id);
    }

    let pages_id = doc.add_object(dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => page_texts.len() as i64,
    });
    for page_id in page_ids {
        if let Ok(page) = doc.get_object_mut(page_id) {
            if let Ok(dict) = page.as_dict_mut() {
                dict.set("Parent", Object::Reference(pages_id));
            }
        }
    }

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", Object::Reference(catalog_id));

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

/// Build a document whose trailer carries an Encrypt entry.
pub(crate) fn make_encrypted_pdf() -> Vec<u8> {
    let mut doc = Document::load_mem(&make_test_pdf(&["Locked"])).unwrap();
    let encrypt_id = doc.add_object(dictionary! { "Filter" => "Standard" });
    doc.trailer.set("Encrypt", Object::Reference(encrypt_id));
    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}
