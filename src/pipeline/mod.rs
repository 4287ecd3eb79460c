//! Pipeline stages a worker drives for each job.
//!
//! Each submodule implements exactly one step, behind a trait so tests and
//! alternative backends can replace it.
//!
//! ## Data Flow
//!
//! ```text
//! fetch ──▶ extract ──▶ ┬─ render ──▶ upload ─┐  (per page, bounded)
//! (bytes)   (count,     ├─ render ──▶ upload ─┤
//!            text)      └─ ...                ┘
//! ```
//!
//! 1. [`fetch`]   load the source PDF (`http(s)://` or `file://`)
//! 2. [`extract`] authoritative page count and normalised page text; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 3. [`render`]  rasterise one page to PNG, also in `spawn_blocking`
//! 4. [`upload`]  put the PNG into the blob store with retry/backoff

pub mod extract;
pub mod fetch;
pub mod render;
pub mod upload;
