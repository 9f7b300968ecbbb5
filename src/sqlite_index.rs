//! SQLite [`IndexBackend`] over the `index_records` table.
//!
//! Records are stored flat with their embedding as a little-endian f32
//! BLOB. Filters are evaluated after loading, so metadata filters behave
//! the same as in the in-memory backend.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use filesync_core::embedding::{blob_to_vec, vec_to_blob};
use filesync_core::models::IndexRecord;
use filesync_core::search::Filter;
use filesync_core::store::{IndexBackend, RecordCounts};
use filesync_core::{Result, SyncError};

use crate::sqlite_store::{from_ts, ts};

fn index_err(e: sqlx::Error) -> SyncError {
    SyncError::index(e.to_string())
}

#[derive(Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &SqliteRow) -> Result<IndexRecord> {
    let metadata_json: String = row.try_get("metadata_json").map_err(index_err)?;
    let metadata = match serde_json::from_str(&metadata_json) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    let embedding: Option<Vec<u8>> = row.try_get("embedding").map_err(index_err)?;
    let chunk_index: i64 = row.try_get("chunk_index").map_err(index_err)?;
    let chunk_start: Option<i64> = row.try_get("chunk_start").map_err(index_err)?;
    let chunk_end: Option<i64> = row.try_get("chunk_end").map_err(index_err)?;
    let token_count: i64 = row.try_get("token_count").map_err(index_err)?;
    let total_chunks: i64 = row.try_get("total_chunks").map_err(index_err)?;
    let is_chunk: i64 = row.try_get("is_chunk").map_err(index_err)?;

    Ok(IndexRecord {
        id: row.try_get("id").map_err(index_err)?,
        doc_id: row.try_get("doc_id").map_err(index_err)?,
        parent_doc_id: row.try_get("parent_doc_id").map_err(index_err)?,
        title: row.try_get("title").map_err(index_err)?,
        text: row.try_get("text").map_err(index_err)?,
        search_text: row.try_get("search_text").map_err(index_err)?,
        content_preview: row.try_get("content_preview").map_err(index_err)?,
        link: row.try_get("link").map_err(index_err)?,
        is_chunk: is_chunk != 0,
        chunk_index: chunk_index as usize,
        chunk_start: chunk_start.map(|v| v as usize),
        chunk_end: chunk_end.map(|v| v as usize),
        token_count: token_count as usize,
        total_chunks: total_chunks as usize,
        file_type: row.try_get("file_type").map_err(index_err)?,
        quality_score: row.try_get("quality_score").map_err(index_err)?,
        indexed_at: from_ts(row.try_get("indexed_at").map_err(index_err)?),
        metadata,
        embedding: embedding.map(|blob| blob_to_vec(&blob)),
    })
}

const DELETE_DOC: &str = "DELETE FROM index_records WHERE doc_id = ? OR parent_doc_id = ? OR id = ?";

#[async_trait]
impl IndexBackend for SqliteIndex {
    async fn replace_records(&self, doc_id: &str, records: &[IndexRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(index_err)?;

        sqlx::query(DELETE_DOC)
            .bind(doc_id)
            .bind(doc_id)
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(index_err)?;

        for record in records {
            let metadata_json = serde_json::to_string(&record.metadata)
                .map_err(|e| SyncError::index(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO index_records (
                    id, doc_id, parent_doc_id, title, text, search_text, content_preview, link,
                    is_chunk, chunk_index, chunk_start, chunk_end, token_count, total_chunks,
                    file_type, quality_score, indexed_at, metadata_json, embedding
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.id)
            .bind(&record.doc_id)
            .bind(&record.parent_doc_id)
            .bind(&record.title)
            .bind(&record.text)
            .bind(&record.search_text)
            .bind(&record.content_preview)
            .bind(&record.link)
            .bind(record.is_chunk)
            .bind(record.chunk_index as i64)
            .bind(record.chunk_start.map(|v| v as i64))
            .bind(record.chunk_end.map(|v| v as i64))
            .bind(record.token_count as i64)
            .bind(record.total_chunks as i64)
            .bind(&record.file_type)
            .bind(record.quality_score)
            .bind(ts(record.indexed_at))
            .bind(metadata_json)
            .bind(record.embedding.as_deref().map(vec_to_blob))
            .execute(&mut *tx)
            .await
            .map_err(index_err)?;
        }

        tx.commit().await.map_err(index_err)?;
        Ok(())
    }

    async fn delete_records(&self, doc_id: &str) -> Result<usize> {
        let result = sqlx::query(DELETE_DOC)
            .bind(doc_id)
            .bind(doc_id)
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(index_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn load_records(&self, filters: &[Filter]) -> Result<Vec<IndexRecord>> {
        let rows = sqlx::query("SELECT * FROM index_records ORDER BY doc_id, chunk_index")
            .fetch_all(&self.pool)
            .await
            .map_err(index_err)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = row_to_record(row)?;
            if filters.iter().all(|f| f.matches(&record)) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn counts(&self) -> Result<RecordCounts> {
        let (total, chunks, with_embeddings): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(is_chunk), 0),
                COALESCE(SUM(CASE WHEN embedding IS NOT NULL THEN 1 ELSE 0 END), 0)
            FROM index_records
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(index_err)?;
        Ok(RecordCounts {
            total: total as usize,
            full_documents: (total - chunks) as usize,
            chunks: chunks as usize,
            with_embeddings: with_embeddings as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filesync_core::search::{IndexDocument, IndexTier, SearchIndex, SearchRequest};
    use std::sync::Arc;

    async fn backend() -> (tempfile::TempDir, Arc<SqliteIndex>) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("index.sqlite"))
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        (dir, Arc::new(SqliteIndex::new(pool)))
    }

    fn long_text() -> String {
        (0..15)
            .map(|i| {
                if i == 11 {
                    "The quarterly audit found a discrepancy in the cedar shipment ledger.".to_string()
                } else {
                    format!("Paragraph {} talks about routine weekly planning for the whole team.", i)
                }
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[tokio::test]
    async fn test_chunked_document_roundtrip_and_search() {
        let (_dir, backend) = backend().await;
        let index = SearchIndex::new(backend.clone(), IndexTier::Advanced);
        let doc = IndexDocument {
            doc_id: "box:7".into(),
            title: "ledger.docx".into(),
            text: long_text().repeat(2),
            link: Some("https://app.box.com/file/7".into()),
            file_name: Some("ledger.docx".into()),
            metadata: serde_json::Map::new(),
        };
        index.index(&doc).await.unwrap();

        let counts = backend.counts().await.unwrap();
        assert!(counts.chunks >= 2);
        assert_eq!(counts.full_documents, 0);

        let records = backend.load_records(&[]).await.unwrap();
        assert!(records
            .iter()
            .all(|r| r.parent_doc_id.as_deref() == Some("box:7") && r.file_type == "document"));

        let response = index.search(&SearchRequest::new("cedar")).await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert!(response.results[0].total_chunks >= 2);

        assert_eq!(index.delete("box:7").await.unwrap(), counts.total);
        assert_eq!(backend.counts().await.unwrap(), RecordCounts::default());
    }

    #[tokio::test]
    async fn test_embedding_blob_survives_storage() {
        let (_dir, backend) = backend().await;
        let record = IndexRecord {
            id: "box:1".into(),
            doc_id: "box:1".into(),
            parent_doc_id: None,
            title: "a.txt".into(),
            text: "hello".into(),
            search_text: "a.txt hello".into(),
            content_preview: "hello".into(),
            link: None,
            is_chunk: false,
            chunk_index: 0,
            chunk_start: None,
            chunk_end: None,
            token_count: 1,
            total_chunks: 1,
            file_type: "text".into(),
            quality_score: 0.4,
            indexed_at: chrono::Utc::now(),
            metadata: serde_json::Map::new(),
            embedding: Some(vec![0.25, -1.5]),
        };
        backend.replace_records("box:1", &[record]).await.unwrap();
        let loaded = backend.load_records(&[]).await.unwrap();
        assert_eq!(loaded[0].embedding, Some(vec![0.25, -1.5]));
        assert_eq!(backend.counts().await.unwrap().with_embeddings, 1);
    }
}
