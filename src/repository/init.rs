//! Schema bootstrap: idempotent DDL for all pipeline tables.

use diesel::prelude::*;

use super::pool::{run_blocking, DieselError, SqlitePool};

const DDL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS tender (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        id_pncp TEXT NOT NULL UNIQUE,
        source TEXT,
        source_id TEXT,
        orgao TEXT,
        orgao_norm TEXT,
        municipio TEXT,
        municipio_norm TEXT,
        uf TEXT,
        uf_norm TEXT,
        modalidade TEXT,
        modalidade_norm TEXT,
        objeto TEXT,
        objeto_norm TEXT,
        status TEXT,
        status_norm TEXT,
        data_publicacao TEXT,
        urls TEXT NOT NULL DEFAULT '{}',
        fingerprint TEXT,
        hash_metadados TEXT,
        canonical_tender_id INTEGER,
        materia TEXT,
        categoria TEXT,
        materia_confidence REAL,
        materia_source TEXT,
        materia_tags TEXT,
        materia_updated_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_tender_fingerprint ON tender (fingerprint)",
    "CREATE INDEX IF NOT EXISTS idx_tender_source ON tender (source, source_id)",
    "CREATE INDEX IF NOT EXISTS idx_tender_data_publicacao ON tender (data_publicacao)",
    r#"CREATE TABLE IF NOT EXISTS tender_version (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tender_id INTEGER NOT NULL,
        hash_metadados TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tender_source_payload (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tender_id INTEGER NOT NULL,
        source TEXT NOT NULL,
        source_id TEXT,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS document (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tender_id INTEGER NOT NULL,
        url TEXT NOT NULL,
        source TEXT NOT NULL DEFAULT 'unknown',
        fetched_at TEXT NOT NULL,
        http_status INTEGER,
        content_type TEXT,
        sha256 TEXT,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        truncated INTEGER NOT NULL DEFAULT 0,
        headers TEXT,
        body BLOB,
        texto_extraido TEXT,
        texto_chars INTEGER,
        texto_quality REAL,
        ocr_used INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        UNIQUE (tender_id, sha256)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS document_segment (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_id INTEGER NOT NULL,
        tender_id INTEGER NOT NULL,
        idx INTEGER NOT NULL,
        text TEXT NOT NULL,
        tsv TEXT NOT NULL,
        embedding TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_segment_document ON document_segment (document_id)",
    "CREATE INDEX IF NOT EXISTS idx_segment_tender ON document_segment (tender_id)",
    r#"CREATE TABLE IF NOT EXISTS document_artifact (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_id INTEGER NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (document_id, kind)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS pipeline_event (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tender_id INTEGER,
        document_id INTEGER,
        stage TEXT NOT NULL,
        status TEXT NOT NULL,
        message TEXT,
        payload TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS app_user (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        telegram_user_id BIGINT NOT NULL UNIQUE,
        username TEXT,
        first_name TEXT,
        last_name TEXT,
        language_code TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS user_subscription (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        filters TEXT NOT NULL DEFAULT '{}',
        delivery TEXT NOT NULL DEFAULT '{}',
        frequency TEXT NOT NULL DEFAULT 'realtime',
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tender_follow (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        tender_id INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (user_id, tender_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS alert (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        type TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}',
        sent_at TEXT NOT NULL,
        created_at TEXT NOT NULL
    )"#,
];

/// Apply the full schema; safe to run repeatedly.
pub async fn init_schema(pool: SqlitePool) -> Result<(), DieselError> {
    run_blocking(pool, |conn| {
        for stmt in DDL {
            diesel::sql_query(*stmt).execute(conn)?;
        }
        Ok(())
    })
    .await
}
