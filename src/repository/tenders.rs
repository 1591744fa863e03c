//! Tender store: upsert-and-version semantics plus cross-source linking.
//!
//! The upsert is the single write path shared by the ingest API and the
//! fetch worker's lazy resolution. It is keyed on the external id, writes a
//! `tender_version` row whenever the metadata hash changes, and links twins
//! that share a fingerprint to the earliest peer's canonical id.

use chrono::Utc;
use diesel::prelude::*;
use serde_json::{json, Map, Value};

use super::models::TenderRecord;
use super::pool::{run_blocking, DieselError, SqlitePool};
use crate::dedupe::{fingerprint_tender, hash_metadados};
use crate::schema::{tender, tender_source_payload, tender_version};

/// Subset returned to ingest callers.
#[derive(Debug, Clone)]
pub struct SavedTender {
    pub id: i32,
    pub id_pncp: String,
    pub source: Option<String>,
    pub source_id: Option<String>,
    pub hash_metadados: String,
    pub created: bool,
}

impl SavedTender {
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "id_pncp": self.id_pncp,
            "source": self.source,
            "source_id": self.source_id,
            "hash_metadados": self.hash_metadados,
        })
    }
}

fn opt_str(payload: &Map<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str()).map(String::from)
}

/// Fill in source/source_id/id_pncp from one another by prefix convention,
/// clean the free-form strings, then derive the `_norm` companions. This is
/// the shared front half of every upsert path.
pub fn prepare_payload(raw: &Map<String, Value>) -> Map<String, Value> {
    let mut out = raw.clone();

    let mut source = opt_str(raw, "source")
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());
    let mut id_pncp = opt_str(raw, "id_pncp")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let mut source_id = opt_str(raw, "source_id")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    if source.is_none() {
        source = Some(match id_pncp.as_deref() {
            Some(id) if id.starts_with("compras:") => "compras".to_string(),
            Some(_) => "pncp".to_string(),
            None => "unknown".to_string(),
        });
    }
    let src = source.clone().unwrap_or_else(|| "unknown".to_string());
    if source_id.is_none() {
        if src == "pncp" {
            source_id = id_pncp.clone();
        } else if let Some(rest) = id_pncp
            .as_deref()
            .and_then(|id| id.strip_prefix(&format!("{}:", src)))
        {
            source_id = Some(rest.to_string());
        }
    }
    if id_pncp.is_none() {
        if let Some(ref sid) = source_id {
            id_pncp = Some(format!("{}:{}", src, sid));
        }
    }
    out.insert("source".to_string(), json!(source));
    out.insert("source_id".to_string(), json!(source_id));
    out.insert("id_pncp".to_string(), json!(id_pncp));

    for key in ["orgao", "municipio", "modalidade", "objeto", "status"] {
        if let Some(v) = opt_str(&out, key) {
            let trimmed = v.trim().to_string();
            out.insert(
                key.to_string(),
                if trimmed.is_empty() { Value::Null } else { json!(trimmed) },
            );
        }
    }
    if let Some(uf) = opt_str(&out, "uf") {
        let upper = uf.trim().to_uppercase();
        out.insert(
            "uf".to_string(),
            if upper.is_empty() { Value::Null } else { json!(upper) },
        );
    }
    if !out.get("urls").map(Value::is_object).unwrap_or(false) {
        out.insert("urls".to_string(), json!({}));
    }

    crate::normalize::normalize_tender(&out)
}

#[derive(Clone)]
pub struct TenderRepository {
    pool: SqlitePool,
}

impl TenderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a normalized payload (with `_norm` companions already derived).
    ///
    /// `source_payload`, when given, is the raw upstream document preserved
    /// verbatim in `tender_source_payload`.
    pub async fn upsert(
        &self,
        payload: &Map<String, Value>,
        source_payload: Option<&Value>,
    ) -> Result<SavedTender, DieselError> {
        let h = hash_metadados(payload);
        let fp = fingerprint_tender(payload);

        let id_pncp = opt_str(payload, "id_pncp").unwrap_or_default();
        let source = opt_str(payload, "source");
        let source_id = opt_str(payload, "source_id");
        let orgao = opt_str(payload, "orgao");
        let orgao_norm = opt_str(payload, "orgao_norm");
        let municipio = opt_str(payload, "municipio");
        let municipio_norm = opt_str(payload, "municipio_norm");
        let uf = opt_str(payload, "uf");
        let uf_norm = opt_str(payload, "uf_norm");
        let modalidade = opt_str(payload, "modalidade");
        let modalidade_norm = opt_str(payload, "modalidade_norm");
        let objeto = opt_str(payload, "objeto");
        let objeto_norm = opt_str(payload, "objeto_norm");
        let status = opt_str(payload, "status");
        let status_norm = opt_str(payload, "status_norm");
        let data_publicacao = opt_str(payload, "data_publicacao");
        let urls = serde_json::to_string(payload.get("urls").unwrap_or(&json!({})))
            .unwrap_or_else(|_| "{}".to_string());
        let payload_json =
            serde_json::to_string(&Value::Object(payload.clone())).unwrap_or_else(|_| "{}".to_string());
        let src_payload_json = source_payload
            .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "{}".to_string()))
            .unwrap_or_else(|| payload_json.clone());
        let now = Utc::now().to_rfc3339();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                let existing: Option<(i32, Option<String>)> = tender::table
                    .select((tender::id, tender::hash_metadados))
                    .filter(tender::id_pncp.eq(&id_pncp))
                    .first(conn)
                    .optional()?;

                let (tender_id, created, prev_hash) = match existing {
                    Some((id, prev_hash)) => {
                        diesel::update(tender::table.find(id))
                            .set((
                                tender::source.eq(&source),
                                tender::source_id.eq(&source_id),
                                tender::orgao.eq(&orgao),
                                tender::orgao_norm.eq(&orgao_norm),
                                tender::municipio.eq(&municipio),
                                tender::municipio_norm.eq(&municipio_norm),
                                tender::uf.eq(&uf),
                                tender::uf_norm.eq(&uf_norm),
                                tender::modalidade.eq(&modalidade),
                                tender::modalidade_norm.eq(&modalidade_norm),
                                tender::objeto.eq(&objeto),
                                tender::objeto_norm.eq(&objeto_norm),
                                tender::status.eq(&status),
                                tender::status_norm.eq(&status_norm),
                                tender::data_publicacao.eq(&data_publicacao),
                                tender::urls.eq(&urls),
                                tender::fingerprint.eq(&fp),
                                tender::hash_metadados.eq(&h),
                                tender::updated_at.eq(&now),
                            ))
                            .execute(conn)?;
                        (id, false, prev_hash)
                    }
                    None => {
                        diesel::insert_into(tender::table)
                            .values((
                                tender::id_pncp.eq(&id_pncp),
                                tender::source.eq(&source),
                                tender::source_id.eq(&source_id),
                                tender::orgao.eq(&orgao),
                                tender::orgao_norm.eq(&orgao_norm),
                                tender::municipio.eq(&municipio),
                                tender::municipio_norm.eq(&municipio_norm),
                                tender::uf.eq(&uf),
                                tender::uf_norm.eq(&uf_norm),
                                tender::modalidade.eq(&modalidade),
                                tender::modalidade_norm.eq(&modalidade_norm),
                                tender::objeto.eq(&objeto),
                                tender::objeto_norm.eq(&objeto_norm),
                                tender::status.eq(&status),
                                tender::status_norm.eq(&status_norm),
                                tender::data_publicacao.eq(&data_publicacao),
                                tender::urls.eq(&urls),
                                tender::fingerprint.eq(&fp),
                                tender::hash_metadados.eq(&h),
                                tender::created_at.eq(&now),
                                tender::updated_at.eq(&now),
                            ))
                            .execute(conn)?;
                        let id: i32 = tender::table
                            .select(tender::id)
                            .filter(tender::id_pncp.eq(&id_pncp))
                            .first(conn)?;
                        (id, true, None)
                    }
                };

                diesel::insert_into(tender_source_payload::table)
                    .values((
                        tender_source_payload::tender_id.eq(tender_id),
                        tender_source_payload::source.eq(source.as_deref().unwrap_or("unknown")),
                        tender_source_payload::source_id.eq(&source_id),
                        tender_source_payload::payload.eq(&src_payload_json),
                        tender_source_payload::created_at.eq(&now),
                    ))
                    .execute(conn)?;

                if created || prev_hash.as_deref() != Some(h.as_str()) {
                    diesel::insert_into(tender_version::table)
                        .values((
                            tender_version::tender_id.eq(tender_id),
                            tender_version::hash_metadados.eq(&h),
                            tender_version::payload.eq(&payload_json),
                            tender_version::created_at.eq(&now),
                        ))
                        .execute(conn)?;
                }

                if let Some(ref fp) = fp {
                    link_canonical(conn, tender_id, fp)?;
                }

                Ok(SavedTender {
                    id: tender_id,
                    id_pncp,
                    source,
                    source_id,
                    hash_metadados: h,
                    created,
                })
            })
        })
        .await
    }

    pub async fn get(&self, id: i32) -> Result<Option<TenderRecord>, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            tender::table.find(id).first::<TenderRecord>(conn).optional()
        })
        .await
    }

    pub async fn get_by_id_pncp(&self, id_pncp: &str) -> Result<Option<TenderRecord>, DieselError> {
        let id_pncp = id_pncp.to_string();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            tender::table
                .filter(tender::id_pncp.eq(&id_pncp))
                .first::<TenderRecord>(conn)
                .optional()
        })
        .await
    }

    pub async fn get_by_source(
        &self,
        source: &str,
        source_id: &str,
    ) -> Result<Option<TenderRecord>, DieselError> {
        let source = source.to_string();
        let source_id = source_id.to_string();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            tender::table
                .filter(tender::source.eq(&source))
                .filter(tender::source_id.eq(&source_id))
                .first::<TenderRecord>(conn)
                .optional()
        })
        .await
    }

    pub async fn exists(&self, id: i32) -> Result<bool, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            use diesel::dsl::count_star;
            let count: i64 = tender::table
                .filter(tender::id.eq(id))
                .select(count_star())
                .first(conn)?;
            Ok(count > 0)
        })
        .await
    }

    /// Tenders published at or after the cutoff, newest first.
    pub async fn published_since(&self, since_rfc3339: &str) -> Result<Vec<TenderRecord>, DieselError> {
        let since = since_rfc3339.to_string();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            tender::table
                .filter(tender::data_publicacao.ge(&since))
                .order(tender::data_publicacao.desc())
                .load::<TenderRecord>(conn)
        })
        .await
    }

    /// Persist classification labels from the enrichment oracle.
    pub async fn update_labels(
        &self,
        id: i32,
        materia: Option<String>,
        categoria: Option<String>,
        confidence: Option<f64>,
        source: Option<String>,
        tags: &[String],
    ) -> Result<(), DieselError> {
        let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
        let now = Utc::now().to_rfc3339();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            diesel::update(tender::table.find(id))
                .set((
                    tender::materia.eq(&materia),
                    tender::categoria.eq(&categoria),
                    tender::materia_confidence.eq(confidence),
                    tender::materia_source.eq(&source),
                    tender::materia_tags.eq(&tags_json),
                    tender::materia_updated_at.eq(&now),
                    tender::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn version_count(&self, id: i32) -> Result<i64, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            tender_version::table
                .filter(tender_version::tender_id.eq(id))
                .count()
                .get_result(conn)
        })
        .await
    }

    pub async fn source_payload_count(&self, id: i32) -> Result<i64, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            tender_source_payload::table
                .filter(tender_source_payload::tender_id.eq(id))
                .count()
                .get_result(conn)
        })
        .await
    }
}

/// Point this tender (and a canonical-less peer) at the group representative.
///
/// Best effort and idempotent: concurrent upserts may transiently disagree,
/// but each later upsert re-runs the link and converges.
fn link_canonical(conn: &mut SqliteConnection, tender_id: i32, fp: &str) -> Result<(), DieselError> {
    let peer: Option<(i32, Option<i32>)> = tender::table
        .select((tender::id, tender::canonical_tender_id))
        .filter(tender::fingerprint.eq(fp))
        .filter(tender::id.ne(tender_id))
        .order(tender::id.asc())
        .first(conn)
        .optional()?;

    if let Some((peer_id, peer_canonical)) = peer {
        let canonical = peer_canonical.unwrap_or(peer_id);
        diesel::update(tender::table.find(tender_id))
            .set(tender::canonical_tender_id.eq(canonical))
            .execute(conn)?;
        if peer_canonical.is_none() {
            diesel::update(tender::table.find(peer_id))
                .set(tender::canonical_tender_id.eq(canonical))
                .execute(conn)?;
        }
    }
    Ok(())
}

/// Flatten a tender row into the info map used by scoring, filter matching
/// and message formatting.
pub fn tender_info(record: &TenderRecord) -> Map<String, Value> {
    let urls: Value = serde_json::from_str(&record.urls).unwrap_or_else(|_| json!({}));
    let mut info = Map::new();
    info.insert("id".to_string(), json!(record.id));
    info.insert("id_pncp".to_string(), json!(record.id_pncp));
    info.insert("source".to_string(), json!(record.source));
    info.insert("source_id".to_string(), json!(record.source_id));
    info.insert("orgao".to_string(), json!(record.orgao));
    info.insert("municipio".to_string(), json!(record.municipio));
    info.insert("uf".to_string(), json!(record.uf));
    info.insert("modalidade".to_string(), json!(record.modalidade));
    info.insert("objeto".to_string(), json!(record.objeto));
    info.insert("data_publicacao".to_string(), json!(record.data_publicacao));
    info.insert("status".to_string(), json!(record.status));
    info.insert("urls".to_string(), urls);
    info.insert("materia".to_string(), json!(record.materia));
    info.insert("categoria".to_string(), json!(record.categoria));
    info
}
