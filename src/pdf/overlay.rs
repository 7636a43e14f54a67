//! Transparent text layer placed on top of existing page content.
//!
//! Each layer carries exactly two placements: the identifying label
//! right-aligned in the top-right corner, and a generation timestamp in the
//! bottom-left. Coordinates follow the PDF convention (origin bottom-left).

use chrono::Local;
use lopdf::content::{Content, Operation};
use lopdf::Object;
use thiserror::Error;

/// Fixed built-in font used for both placements.
pub const FONT_SIZE: f64 = 10.0;

/// Layout margins, in page-coordinate points.
pub const MARGIN_TOP: f64 = 20.0;
pub const MARGIN_RIGHT: f64 = 20.0;
pub const MARGIN_BOTTOM: f64 = 20.0;
pub const MARGIN_LEFT: f64 = 20.0;

/// Resource name the overlay font is registered under on each stamped page.
pub(crate) const FONT_RESOURCE: &[u8] = b"OvlHelv";

/// Invariant violations only: fixed valid inputs never hit these.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Page dimensions must be positive, got {width}x{height}")]
    InvalidDimensions { width: f64, height: f64 },

    #[error("No width metric for {0:?} in the built-in font")]
    UnmeasurableText(char),

    #[error("Could not encode overlay content: {0}")]
    Encode(String),
}

/// A rendered single-page layer. Valid only for a page whose dimensions
/// exactly match `width` x `height`; consumed by one merge.
pub struct OverlayLayer {
    width: f64,
    height: f64,
    ops: Vec<u8>,
}

impl OverlayLayer {
    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    /// Encoded content-stream operations of the layer.
    pub(crate) fn ops(&self) -> &[u8] {
        &self.ops
    }
}

/// Render the label and a current-timestamp line for a page of the given
/// dimensions. Stateless; safe to call from any number of threads.
pub fn render(text: &str, page_width: f64, page_height: f64) -> Result<OverlayLayer, RenderError> {
    if page_width <= 0.0 || page_height <= 0.0 {
        return Err(RenderError::InvalidDimensions {
            width: page_width,
            height: page_height,
        });
    }

    let label_width = text_width(text, FONT_SIZE)?;
    let label_x = page_width - label_width - MARGIN_RIGHT;
    let label_y = page_height - MARGIN_TOP - FONT_SIZE;

    let stamped_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

    let content = Content {
        operations: vec![
            text_block(text, label_x, label_y),
            text_block(&stamped_at, MARGIN_LEFT, MARGIN_BOTTOM),
        ]
        .concat(),
    };
    let ops = content
        .encode()
        .map_err(|e| RenderError::Encode(e.to_string()))?;

    Ok(OverlayLayer {
        width: page_width,
        height: page_height,
        ops,
    })
}

fn text_block(text: &str, x: f64, y: f64) -> Vec<Operation> {
    vec![
        Operation::new("BT", vec![]),
        Operation::new(
            "Tf",
            vec![
                Object::Name(FONT_RESOURCE.to_vec()),
                Object::Real(FONT_SIZE as f32),
            ],
        ),
        Operation::new("Td", vec![Object::Real(x as f32), Object::Real(y as f32)]),
        Operation::new("Tj", vec![Object::string_literal(text)]),
        Operation::new("ET", vec![]),
    ]
}

/// Measure rendered text width in page units at the given font size.
pub fn text_width(text: &str, font_size: f64) -> Result<f64, RenderError> {
    let mut total = 0u32;
    for ch in text.chars() {
        total += glyph_width(ch).ok_or(RenderError::UnmeasurableText(ch))? as u32;
    }
    Ok(f64::from(total) * font_size / 1000.0)
}

/// Advance width of a character in the fixed font, in 1/1000 em units.
/// Metrics cover the printable ASCII range of the standard font program.
fn glyph_width(ch: char) -> Option<u16> {
    let code = ch as u32;
    if !(0x20..=0x7E).contains(&code) {
        return None;
    }
    Some(HELVETICA_WIDTHS[(code - 0x20) as usize])
}

/// Standard Helvetica advance widths for character codes 0x20..=0x7E.
#[rustfmt::skip]
static HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '..'/'
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556, // '0'..'?'
    1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778, // '@'..'O'
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556, // 'P'..'_'
    333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556, // '`'..'o'
    556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584,      // 'p'..'~'
];
