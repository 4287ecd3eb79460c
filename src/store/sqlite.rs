//! SQLite-backed [`DocumentStore`].

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use super::{DocumentStore, ProcessingState};
use crate::db::{from_ms, to_ms, Database};
use crate::error::StoreError;
use crate::job::DocumentId;

/// Document records stored in the `documents` table of a [`Database`].
#[derive(Debug, Clone)]
pub struct SqliteDocumentStore {
    db: Database,
}

impl SqliteDocumentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn require_row(changed: usize, doc: &str) -> Result<(), StoreError> {
    if changed == 0 {
        return Err(StoreError::NotFound(format!("document '{doc}'")));
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn begin_run(&self, doc: &DocumentId) -> Result<(), StoreError> {
        let doc = doc.as_str().to_string();
        let now = to_ms(Utc::now());
        self.db
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO documents (document_id, progress, complete, error, updated_at_ms)
                    VALUES (?1, 0, 0, NULL, ?2)
                    ON CONFLICT(document_id) DO UPDATE
                    SET complete = 0, error = NULL, updated_at_ms = excluded.updated_at_ms
                    "#,
                    params![doc, now],
                )?;
                Ok(())
            })
            .await
    }

    async fn set_progress(&self, doc: &DocumentId, progress: u8) -> Result<(), StoreError> {
        let doc = doc.as_str().to_string();
        let now = to_ms(Utc::now());
        let progress = i64::from(progress.min(100));
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    r#"
                    UPDATE documents
                    SET progress = MAX(progress, ?2), updated_at_ms = ?3
                    WHERE document_id = ?1
                    "#,
                    params![doc, progress, now],
                )?;
                require_row(changed, &doc)
            })
            .await
    }

    async fn mark_complete(
        &self,
        doc: &DocumentId,
        page_count: usize,
        artifact_url: &str,
    ) -> Result<(), StoreError> {
        let doc_text = doc.as_str().to_string();
        let url = artifact_url.to_string();
        let pages = i64::try_from(page_count)
            .map_err(|_| StoreError::InvalidInput(format!("page count {page_count} too large")))?;
        let now = to_ms(Utc::now());
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    r#"
                    UPDATE documents
                    SET progress = 100, complete = 1, error = NULL,
                        page_count = ?2, artifact_url = ?3, updated_at_ms = ?4
                    WHERE document_id = ?1
                    "#,
                    params![doc_text, pages, url, now],
                )?;
                require_row(changed, &doc_text)
            })
            .await?;
        debug!(document_id = %doc, "Document marked complete");
        Ok(())
    }

    async fn mark_failed(&self, doc: &DocumentId, error: &str) -> Result<(), StoreError> {
        let doc = doc.as_str().to_string();
        let error = error.to_string();
        let now = to_ms(Utc::now());
        self.db
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO documents (document_id, progress, complete, error, updated_at_ms)
                    VALUES (?1, 0, 0, ?2, ?3)
                    ON CONFLICT(document_id) DO UPDATE
                    SET error = excluded.error, complete = 0, updated_at_ms = excluded.updated_at_ms
                    "#,
                    params![doc, error, now],
                )?;
                Ok(())
            })
            .await
    }

    async fn processing_state(&self, doc: &DocumentId) -> Result<Option<ProcessingState>, StoreError> {
        let doc = doc.as_str().to_string();
        self.db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        r#"
                        SELECT progress, complete, error, page_count, artifact_url, updated_at_ms
                        FROM documents WHERE document_id = ?1
                        "#,
                        params![doc],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, bool>(1)?,
                                row.get::<_, Option<String>>(2)?,
                                row.get::<_, Option<i64>>(3)?,
                                row.get::<_, Option<String>>(4)?,
                                row.get::<_, i64>(5)?,
                            ))
                        },
                    )
                    .optional()?;
                let Some((progress, complete, error, page_count, artifact_url, updated)) = row
                else {
                    return Ok(None);
                };
                Ok(Some(ProcessingState {
                    progress: progress.clamp(0, 100) as u8,
                    complete,
                    error,
                    page_count: page_count.and_then(|n| usize::try_from(n).ok()),
                    artifact_url,
                    updated_at: from_ms(updated)?,
                }))
            })
            .await
    }
}
