//! Document store: fetched artifacts, extracted text, segments, artifacts.

use chrono::Utc;
use diesel::prelude::*;
use serde_json::Value;

use super::models::{DocumentRecord, SegmentRecord};
use super::pool::{run_blocking, DieselError, SqlitePool};
use crate::schema::{document, document_artifact, document_segment};

/// Fetch outcome to persist; body may be empty on error responses.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub tender_id: i32,
    pub url: String,
    pub source: String,
    pub http_status: Option<i32>,
    pub content_type: Option<String>,
    pub sha256: Option<String>,
    pub size_bytes: i32,
    pub truncated: bool,
    pub headers: Option<String>,
    pub body: Option<Vec<u8>>,
    pub error: Option<String>,
}

/// One text chunk ready for insertion.
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub idx: i32,
    pub text: String,
    pub tsv: String,
    pub embedding: Option<String>,
}

/// Aggregate extraction quality for a tender's document set.
#[derive(Debug, Clone, Default)]
pub struct TenderQuality {
    pub avg_quality: f64,
    pub max_chars: i64,
    pub docs: i64,
}

impl TenderQuality {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "avg_quality": self.avg_quality,
            "max_chars": self.max_chars,
            "docs": self.docs,
        })
    }
}

#[derive(Clone)]
pub struct DocumentRepository {
    pool: SqlitePool,
}

impl DocumentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Dedupe probe on the (tender, body-hash) unique pair.
    pub async fn exists_by_sha(&self, tender_id: i32, sha256: &str) -> Result<bool, DieselError> {
        let sha = sha256.to_string();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            use diesel::dsl::count_star;
            let count: i64 = document::table
                .filter(document::tender_id.eq(tender_id))
                .filter(document::sha256.eq(&sha))
                .select(count_star())
                .first(conn)?;
            Ok(count > 0)
        })
        .await
    }

    /// Insert a fetch result, returning the new document id.
    pub async fn insert(&self, doc: FetchedDocument) -> Result<i32, DieselError> {
        let now = Utc::now().to_rfc3339();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            diesel::insert_into(document::table)
                .values((
                    document::tender_id.eq(doc.tender_id),
                    document::url.eq(&doc.url),
                    document::source.eq(&doc.source),
                    document::fetched_at.eq(&now),
                    document::http_status.eq(doc.http_status),
                    document::content_type.eq(&doc.content_type),
                    document::sha256.eq(&doc.sha256),
                    document::size_bytes.eq(doc.size_bytes),
                    document::truncated.eq(doc.truncated as i32),
                    document::headers.eq(&doc.headers),
                    document::body.eq(&doc.body),
                    document::error.eq(&doc.error),
                ))
                .execute(conn)?;
            diesel::sql_query("SELECT last_insert_rowid()")
                .get_result::<LastInsertRowId>(conn)
                .map(|r| r.id as i32)
        })
        .await
    }

    pub async fn get(&self, id: i32) -> Result<Option<DocumentRecord>, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            document::table.find(id).first::<DocumentRecord>(conn).optional()
        })
        .await
    }

    /// Persist the parse outcome; `drop_body` also nulls the raw bytes.
    pub async fn update_parsed(
        &self,
        id: i32,
        text: &str,
        quality: f64,
        ocr_used: bool,
        drop_body: bool,
    ) -> Result<(), DieselError> {
        let text = text.to_string();
        let chars = text.chars().count() as i32;
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            if drop_body {
                diesel::update(document::table.find(id))
                    .set((
                        document::texto_extraido.eq(&text),
                        document::texto_chars.eq(chars),
                        document::texto_quality.eq(quality),
                        document::ocr_used.eq(ocr_used as i32),
                        document::body.eq(None::<Vec<u8>>),
                    ))
                    .execute(conn)?;
            } else {
                diesel::update(document::table.find(id))
                    .set((
                        document::texto_extraido.eq(&text),
                        document::texto_chars.eq(chars),
                        document::texto_quality.eq(quality),
                        document::ocr_used.eq(ocr_used as i32),
                    ))
                    .execute(conn)?;
            }
            Ok(())
        })
        .await
    }

    /// Replace all segments for a document in one transaction, so readers see
    /// either the prior set or the fresh set, never a mix.
    pub async fn replace_segments(
        &self,
        document_id: i32,
        tender_id: i32,
        segments: Vec<NewSegment>,
    ) -> Result<usize, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                diesel::delete(document_segment::table.filter(document_segment::document_id.eq(document_id)))
                    .execute(conn)?;
                for seg in &segments {
                    diesel::insert_into(document_segment::table)
                        .values((
                            document_segment::document_id.eq(document_id),
                            document_segment::tender_id.eq(tender_id),
                            document_segment::idx.eq(seg.idx),
                            document_segment::text.eq(&seg.text),
                            document_segment::tsv.eq(&seg.tsv),
                            document_segment::embedding.eq(&seg.embedding),
                        ))
                        .execute(conn)?;
                }
                Ok(segments.len())
            })
        })
        .await
    }

    pub async fn segments_for_document(&self, document_id: i32) -> Result<Vec<SegmentRecord>, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            document_segment::table
                .filter(document_segment::document_id.eq(document_id))
                .order(document_segment::idx.asc())
                .load::<SegmentRecord>(conn)
        })
        .await
    }

    pub async fn segments_for_tender(
        &self,
        tender_id: i32,
        limit: i64,
    ) -> Result<Vec<SegmentRecord>, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            document_segment::table
                .filter(document_segment::tender_id.eq(tender_id))
                .order((document_segment::document_id.asc(), document_segment::idx.asc()))
                .limit(limit)
                .load::<SegmentRecord>(conn)
        })
        .await
    }

    /// Segments carrying editorial-template signals (objeto, valor, datas,
    /// sessão, critério, modalidade), matched on the folded column so both
    /// accented and plain spellings hit.
    pub async fn segments_with_signals(
        &self,
        tender_id: i32,
        limit: i64,
    ) -> Result<Vec<SegmentRecord>, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            document_segment::table
                .filter(document_segment::tender_id.eq(tender_id))
                .filter(
                    document_segment::tsv
                        .like("%objeto%")
                        .or(document_segment::tsv.like("%valor%"))
                        .or(document_segment::tsv.like("%data%"))
                        .or(document_segment::tsv.like("%sessao%"))
                        .or(document_segment::tsv.like("%crit%"))
                        .or(document_segment::tsv.like("%modalidade%")),
                )
                .order(document_segment::id.asc())
                .limit(limit)
                .load::<SegmentRecord>(conn)
        })
        .await
    }

    /// Raw LIKE pattern over the folded column, e.g. `%valor%estimado%`.
    pub async fn segments_matching_pattern(
        &self,
        tender_id: i32,
        pattern: &str,
        limit: i64,
    ) -> Result<Vec<SegmentRecord>, DieselError> {
        let pattern = pattern.to_string();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            document_segment::table
                .filter(document_segment::tender_id.eq(tender_id))
                .filter(document_segment::tsv.like(&pattern))
                .order(document_segment::id.asc())
                .limit(limit)
                .load::<SegmentRecord>(conn)
        })
        .await
    }

    /// Extraction-quality aggregate over a tender's documents.
    pub async fn tender_quality(&self, tender_id: i32) -> Result<TenderQuality, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            use diesel::dsl::{avg, count_star, max};
            let (avg_quality, max_chars, docs): (Option<f64>, Option<i32>, i64) = document::table
                .filter(document::tender_id.eq(tender_id))
                .select((
                    avg(document::texto_quality),
                    max(document::texto_chars),
                    count_star(),
                ))
                .first(conn)?;
            Ok(TenderQuality {
                avg_quality: avg_quality.unwrap_or(0.0),
                max_chars: max_chars.unwrap_or(0) as i64,
                docs,
            })
        })
        .await
    }

    /// Keyword lookup over the folded full-text column.
    pub async fn search_segments(
        &self,
        query_folded: &str,
        tender_id: Option<i32>,
        limit: i64,
    ) -> Result<Vec<SegmentRecord>, DieselError> {
        let needle = format!("%{}%", query_folded);
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            let mut query = document_segment::table
                .filter(document_segment::tsv.like(&needle))
                .order(document_segment::id.asc())
                .limit(limit)
                .into_boxed();
            if let Some(tid) = tender_id {
                query = query.filter(document_segment::tender_id.eq(tid));
            }
            query.load::<SegmentRecord>(conn)
        })
        .await
    }

    /// Upsert a derived artifact by (document, kind).
    pub async fn store_artifact(
        &self,
        document_id: i32,
        kind: &str,
        payload: &Value,
    ) -> Result<(), DieselError> {
        let kind = kind.to_string();
        let payload = serde_json::to_string(payload).unwrap_or_else(|_| "null".to_string());
        let now = Utc::now().to_rfc3339();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            diesel::replace_into(document_artifact::table)
                .values((
                    document_artifact::document_id.eq(document_id),
                    document_artifact::kind.eq(&kind),
                    document_artifact::payload.eq(&payload),
                    document_artifact::created_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn get_artifact(
        &self,
        document_id: i32,
        kind: &str,
    ) -> Result<Option<String>, DieselError> {
        let kind = kind.to_string();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            document_artifact::table
                .filter(document_artifact::document_id.eq(document_id))
                .filter(document_artifact::kind.eq(&kind))
                .select(document_artifact::payload)
                .first::<String>(conn)
                .optional()
        })
        .await
    }

    pub async fn count_for_tender(&self, tender_id: i32) -> Result<i64, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            document::table
                .filter(document::tender_id.eq(tender_id))
                .count()
                .get_result(conn)
        })
        .await
    }
}

#[derive(diesel::QueryableByName)]
struct LastInsertRowId {
    #[diesel(sql_type = diesel::sql_types::BigInt, column_name = "last_insert_rowid()")]
    id: i64,
}
