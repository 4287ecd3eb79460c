//! Page rasterisation: render one page of a PDF buffer to PNG bytes.
//!
//! Each page task renders independently from the whole document buffer and
//! a page index. pdfium is not async-safe, so the page task calls
//! [`PageRenderer::render`] from `spawn_blocking`.
//!
//! `max_rendered_pixels` caps the longest edge regardless of physical page
//! size; an A0 poster at 150 DPI would otherwise produce a 12,000 × 17,000 px
//! image. Below the cap, `dpi` sets the scale.

use image::{DynamicImage, ImageFormat};
use pdfium_render::prelude::*;
use std::io::Cursor;
use tracing::debug;

use crate::error::RenderError;
use crate::pdfium;

/// Renders a single page to encoded image bytes.
pub trait PageRenderer: Send + Sync {
    /// `page_index` is 0-based.
    fn render(&self, pdf: &[u8], page_index: usize) -> Result<Vec<u8>, RenderError>;
}

/// [`PageRenderer`] producing PNG via pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumRenderer {
    dpi: u32,
    max_pixels: u32,
    password: Option<String>,
}

impl PdfiumRenderer {
    pub fn new(dpi: u32, max_pixels: u32, password: Option<String>) -> Self {
        Self {
            dpi,
            max_pixels,
            password,
        }
    }
}

impl PageRenderer for PdfiumRenderer {
    fn render(&self, pdf: &[u8], page_index: usize) -> Result<Vec<u8>, RenderError> {
        // pdfium documents cannot cross threads, so each page render parses
        // the whole file again on its own blocking thread.
        let pdfium = pdfium::bind().map_err(RenderError)?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, self.password.as_deref())
            .map_err(|e| RenderError(format!("cannot open document: {:?}", e)))?;

        let pages = document.pages();
        let total = pages.len() as usize;
        let index = u16::try_from(page_index)
            .ok()
            .filter(|_| page_index < total)
            .ok_or_else(|| {
                RenderError(format!("page {} out of range (total={})", page_index + 1, total))
            })?;

        let page = pages
            .get(index)
            .map_err(|e| RenderError(format!("cannot load page: {:?}", e)))?;

        let (width, height) = target_size(
            page.width().value,
            page.height().value,
            self.dpi,
            self.max_pixels,
        );
        let render_config = PdfRenderConfig::new()
            .set_target_width(width)
            .set_maximum_height(height);

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| RenderError(format!("rasterisation failed: {:?}", e)))?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            page_index + 1,
            image.width(),
            image.height()
        );

        encode_png(&image)
    }
}

/// Pixel size of a page of `width_pt × height_pt` points at `dpi`, with the
/// longest edge capped at `max_pixels`.
pub fn target_size(width_pt: f32, height_pt: f32, dpi: u32, max_pixels: u32) -> (i32, i32) {
    let scale = dpi as f32 / 72.0;
    let (mut w, mut h) = (width_pt.max(1.0) * scale, height_pt.max(1.0) * scale);
    let longest = w.max(h);
    if longest > max_pixels as f32 {
        let shrink = max_pixels as f32 / longest;
        w *= shrink;
        h *= shrink;
    }
    ((w.round() as i32).max(1), (h.round() as i32).max(1))
}

/// Encode an image as PNG.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, RenderError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| RenderError(format!("PNG encoding failed: {e}")))?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letter_page_at_150_dpi() {
        // 612 × 792 pt = US Letter.
        assert_eq!(target_size(612.0, 792.0, 150, 2000), (1275, 1650));
    }

    #[test]
    fn longest_edge_is_capped() {
        // A0 portrait: 2384 × 3370 pt.
        let (w, h) = target_size(2384.0, 3370.0, 150, 2000);
        assert_eq!(h, 2000);
        assert!(w < 2000 && w > 1400, "w={w}");
    }

    #[test]
    fn encode_png_produces_png_signature() {
        let img = DynamicImage::new_rgb8(4, 3);
        let bytes = encode_png(&img).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }
}
