//! Page extraction: page count and per-page text from the PDF bytes.
//!
//! The extractor's page count is the single authoritative count for a job:
//! the worker spawns exactly that many page tasks and the artifact reports
//! exactly that many pages.
//!
//! Extraction is synchronous and CPU-bound; the worker calls it from
//! `spawn_blocking`.

use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use regex::Regex;
use tracing::{info, warn};

use crate::error::ExtractError;
use crate::pdfium;

/// The extractor's view of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedDocument {
    /// Normalised text, one entry per page in page order.
    pub pages: Vec<String>,
}

impl ExtractedDocument {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Text of 1-indexed page `page_number`.
    pub fn text(&self, page_number: usize) -> &str {
        page_number
            .checked_sub(1)
            .and_then(|i| self.pages.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Produces page count and page text from PDF bytes.
pub trait PageExtractor: Send + Sync {
    fn extract(&self, pdf: &[u8]) -> Result<ExtractedDocument, ExtractError>;
}

/// [`PageExtractor`] backed by pdfium's text layer.
#[derive(Debug, Clone, Default)]
pub struct PdfiumExtractor {
    password: Option<String>,
}

impl PdfiumExtractor {
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }
}

impl PageExtractor for PdfiumExtractor {
    fn extract(&self, pdf: &[u8]) -> Result<ExtractedDocument, ExtractError> {
        check_magic(pdf)?;

        let pdfium = pdfium::bind().map_err(ExtractError::Engine)?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, self.password.as_deref())
            .map_err(|e| {
                if pdfium::is_password_error(&e) {
                    if self.password.is_some() {
                        ExtractError::Malformed("wrong password".into())
                    } else {
                        ExtractError::Malformed("document is encrypted and needs a password".into())
                    }
                } else {
                    ExtractError::Malformed(format!("{:?}", e))
                }
            })?;

        let pages = document.pages();
        let total = pages.len() as usize;
        info!("PDF loaded: {} pages", total);

        let mut texts = Vec::with_capacity(total);
        for (idx, page) in pages.iter().enumerate() {
            let text = match page.text() {
                Ok(t) => normalise_text(&t.all()),
                Err(e) => {
                    // A page without a usable text layer still gets rendered.
                    warn!("Page {}: no text layer ({:?})", idx + 1, e);
                    String::new()
                }
            };
            texts.push(text);
        }

        Ok(ExtractedDocument { pages: texts })
    }
}

/// PDF headers may be preceded by junk; readers accept `%PDF-` in the first KiB.
fn check_magic(pdf: &[u8]) -> Result<(), ExtractError> {
    let window = &pdf[..pdf.len().min(1024)];
    if window.windows(5).any(|w| w == b"%PDF-") {
        return Ok(());
    }
    let mut magic = [0u8; 4];
    let n = pdf.len().min(4);
    magic[..n].copy_from_slice(&pdf[..n]);
    Err(ExtractError::Malformed(format!(
        "not a PDF (no %PDF- header; starts with {:?})",
        magic
    )))
}

// ── Text normalisation ───────────────────────────────────────────────────
//
// Rules (applied in order):
// 1. Normalise line endings (CRLF / CR → LF)
// 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
// 3. Strip C0 control characters other than tab and newline
// 4. Trim trailing whitespace per line
// 5. Collapse 3+ consecutive newlines down to a single blank line
// 6. Trim leading and trailing blank lines

/// Normalise pdfium page text.
pub fn normalise_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = remove_control_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim_matches('\n').to_string()
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

static RE_CONTROL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").unwrap());

fn remove_control_chars(input: &str) -> String {
    RE_CONTROL.replace_all(input, "").to_string()
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}
