//! Per-page results and the aggregate artifact written at finalisation.
//!
//! [`PageResult`] values are produced by page tasks in completion order;
//! [`DocumentArtifact::assemble`] sorts them, checks that the page numbers
//! form exactly `1..=page_count`, and computes the summary counts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PageError, PipelineError};

/// Outcome of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Succeeded,
    Failed,
}

/// Result of processing a single page.
///
/// Construct through [`PageResult::succeeded`] or [`PageResult::failed`];
/// they keep `image_url` present exactly when the page succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    /// 1-indexed page number.
    page_number: usize,
    /// Extracted text; may be empty.
    text: String,
    image_url: Option<String>,
    status: PageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<PageError>,
}

impl PageResult {
    pub fn succeeded(page_number: usize, text: String, image_url: String) -> Self {
        Self {
            page_number,
            text,
            image_url: Some(image_url),
            status: PageStatus::Succeeded,
            error: None,
        }
    }

    pub fn failed(page_number: usize, text: String, error: PageError) -> Self {
        Self {
            page_number,
            text,
            image_url: None,
            status: PageStatus::Failed,
            error: Some(error),
        }
    }

    pub fn page_number(&self) -> usize {
        self.page_number
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn image_url(&self) -> Option<&str> {
        self.image_url.as_deref()
    }

    pub fn status(&self) -> PageStatus {
        self.status
    }

    pub fn error(&self) -> Option<&PageError> {
        self.error.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.status == PageStatus::Succeeded
    }
}

/// The aggregate result persisted as `{documentId}/document.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentArtifact {
    pub document_id: String,
    pub page_count: usize,
    pub pages: Vec<PageResult>,
    pub succeeded_pages: usize,
    pub failed_pages: usize,
    pub processed_date: DateTime<Utc>,
}

impl DocumentArtifact {
    /// Sort `pages` and verify they cover `1..=page_count` exactly once.
    pub fn assemble(
        document_id: &str,
        page_count: usize,
        mut pages: Vec<PageResult>,
        processed_date: DateTime<Utc>,
    ) -> Result<Self, PipelineError> {
        pages.sort_by_key(|p| p.page_number);
        if pages.len() != page_count {
            return Err(PipelineError::Internal(format!(
                "expected {} page results, got {}",
                page_count,
                pages.len()
            )));
        }
        for (i, p) in pages.iter().enumerate() {
            if p.page_number != i + 1 {
                return Err(PipelineError::Internal(format!(
                    "page results out of sequence: position {} holds page {}",
                    i + 1,
                    p.page_number
                )));
            }
        }
        let succeeded_pages = pages.iter().filter(|p| p.is_success()).count();
        Ok(Self {
            document_id: document_id.to_string(),
            page_count,
            failed_pages: page_count - succeeded_pages,
            succeeded_pages,
            pages,
            processed_date,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, PipelineError> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| PipelineError::Internal(format!("artifact serialisation failed: {e}")))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, PipelineError> {
        serde_json::from_slice(bytes)
            .map_err(|e| PipelineError::Internal(format!("artifact is not valid JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(n: usize) -> PageResult {
        PageResult::succeeded(n, format!("page {n}"), format!("file:///b/{n:04}.png"))
    }

    #[test]
    fn constructors_tie_image_url_to_status() {
        assert!(ok(1).image_url().is_some());
        let f = PageResult::failed(
            2,
            String::new(),
            PageError::RenderFailed {
                page: 2,
                detail: "bitmap".into(),
            },
        );
        assert!(f.image_url().is_none());
        assert_eq!(f.status(), PageStatus::Failed);
    }

    #[test]
    fn assemble_sorts_out_of_order_results() {
        let a = DocumentArtifact::assemble("d", 3, vec![ok(3), ok(1), ok(2)], Utc::now()).unwrap();
        let numbers: Vec<_> = a.pages.iter().map(|p| p.page_number()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(a.succeeded_pages, 3);
        assert_eq!(a.failed_pages, 0);
    }

    #[test]
    fn assemble_rejects_gaps_and_duplicates() {
        assert!(DocumentArtifact::assemble("d", 3, vec![ok(1), ok(1), ok(3)], Utc::now()).is_err());
        assert!(DocumentArtifact::assemble("d", 3, vec![ok(1), ok(2)], Utc::now()).is_err());
    }

    #[test]
    fn json_uses_camel_case_and_null_image_for_failures() {
        let failed = PageResult::failed(
            2,
            "txt".into(),
            PageError::UploadFailed {
                page: 2,
                attempts: 4,
                detail: "503".into(),
            },
        );
        let a = DocumentArtifact::assemble("doc-9", 2, vec![ok(1), failed], Utc::now()).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&a.to_json().unwrap()).unwrap();
        assert_eq!(v["documentId"], "doc-9");
        assert_eq!(v["pageCount"], 2);
        assert_eq!(v["failedPages"], 1);
        assert_eq!(v["pages"][1]["status"], "failed");
        assert!(v["pages"][1]["imageUrl"].is_null());
        assert_eq!(v["pages"][0]["pageNumber"], 1);
        assert!(v["pages"][0].get("error").is_none());
        assert!(v.get("processedDate").is_some());
    }

    #[test]
    fn empty_document_assembles() {
        let a = DocumentArtifact::assemble("d", 0, vec![], Utc::now()).unwrap();
        assert_eq!(a.page_count, 0);
        assert!(a.pages.is_empty());
    }
}
