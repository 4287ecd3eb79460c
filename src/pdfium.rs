//! Binding to the pdfium shared library.
//!
//! Lookup order:
//!
//! 1. `PDFIUM_LIB_PATH`: a library file, or a directory containing the
//!    platform library (`libpdfium.so`, `libpdfium.dylib`, `pdfium.dll`).
//! 2. The platform library in the current working directory.
//! 3. The system library search path.
//!
//! A failed bind is an engine error, not a property of the document, so
//! callers surface it as retryable.

use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

/// Bind to pdfium following the lookup order above.
pub fn bind() -> Result<Pdfium, String> {
    let bindings = match std::env::var_os(PDFIUM_LIB_PATH_ENV) {
        Some(raw) => {
            let path = library_path(Path::new(&raw));
            debug!("Binding pdfium from {}", path.display());
            Pdfium::bind_to_library(&path)
                .map_err(|e| format!("cannot load pdfium from {}: {:?}", path.display(), e))?
        }
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library())
            .map_err(|e| {
                format!("pdfium library not found (set {PDFIUM_LIB_PATH_ENV}): {:?}", e)
            })?,
    };
    Ok(Pdfium::new(bindings))
}

fn library_path(configured: &Path) -> PathBuf {
    if configured.is_dir() {
        Pdfium::pdfium_platform_library_name_at_path(configured)
    } else {
        configured.to_path_buf()
    }
}

/// Whether a load error means the document needs a (different) password.
pub(crate) fn is_password_error(e: &PdfiumError) -> bool {
    let text = format!("{:?}", e);
    text.contains("Password") || text.contains("password")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_resolves_to_platform_library() {
        let dir = tempfile::tempdir().unwrap();
        let path = library_path(dir.path());
        assert!(path.starts_with(dir.path()));
        assert!(path.to_string_lossy().contains("pdfium"));
    }

    #[test]
    fn file_path_is_used_as_is() {
        let p = Path::new("/opt/pdfium/lib/libpdfium.so");
        assert_eq!(library_path(p), p.to_path_buf());
    }
}
