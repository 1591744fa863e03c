//! Diesel record structs for rows the pipeline reads back.
//!
//! Inserts mostly use inline value tuples; these structs cover loads and the
//! handful of richer projections (subscription joins, worker document rows).

use diesel::prelude::*;

use crate::schema;

/// Full tender row.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::tender)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TenderRecord {
    pub id: i32,
    pub id_pncp: String,
    pub source: Option<String>,
    pub source_id: Option<String>,
    pub orgao: Option<String>,
    pub orgao_norm: Option<String>,
    pub municipio: Option<String>,
    pub municipio_norm: Option<String>,
    pub uf: Option<String>,
    pub uf_norm: Option<String>,
    pub modalidade: Option<String>,
    pub modalidade_norm: Option<String>,
    pub objeto: Option<String>,
    pub objeto_norm: Option<String>,
    pub status: Option<String>,
    pub status_norm: Option<String>,
    pub data_publicacao: Option<String>,
    pub urls: String,
    pub fingerprint: Option<String>,
    pub hash_metadados: Option<String>,
    pub canonical_tender_id: Option<i32>,
    pub materia: Option<String>,
    pub categoria: Option<String>,
    pub materia_confidence: Option<f64>,
    pub materia_source: Option<String>,
    pub materia_tags: Option<String>,
    pub materia_updated_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Document row as the parse worker sees it.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::document)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DocumentRecord {
    pub id: i32,
    pub tender_id: i32,
    pub url: String,
    pub source: String,
    pub fetched_at: String,
    pub http_status: Option<i32>,
    pub content_type: Option<String>,
    pub sha256: Option<String>,
    pub size_bytes: i32,
    pub truncated: i32,
    pub headers: Option<String>,
    pub body: Option<Vec<u8>>,
    pub texto_extraido: Option<String>,
    pub texto_chars: Option<i32>,
    pub texto_quality: Option<f64>,
    pub ocr_used: i32,
    pub error: Option<String>,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::document_segment)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SegmentRecord {
    pub id: i32,
    pub document_id: i32,
    pub tender_id: i32,
    pub idx: i32,
    pub text: String,
    pub tsv: String,
    pub embedding: Option<String>,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::app_user)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct UserRecord {
    pub id: i32,
    pub telegram_user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::user_subscription)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SubscriptionRecord {
    pub id: i32,
    pub user_id: i32,
    pub filters: String,
    pub delivery: String,
    pub frequency: String,
    pub is_active: i32,
    pub created_at: String,
    pub updated_at: String,
}

/// Active subscription joined with its user's chat id.
#[derive(Queryable, Debug, Clone)]
pub struct ActiveSubscription {
    pub id: i32,
    pub user_id: i32,
    pub filters: String,
    pub delivery: String,
    pub frequency: String,
    pub telegram_user_id: i64,
}
