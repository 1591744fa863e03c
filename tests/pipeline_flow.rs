//! End-to-end store semantics for the ingest-and-processing pipeline.
//!
//! Exercises the upsert/version/canonical contract, document dedupe, atomic
//! segment replacement and the subscription plumbing against a temporary
//! SQLite database.

use std::path::Path;

use serde_json::{json, Map, Value};

use licitaradar::repository::{
    create_pool, init_schema, prepare_payload, tender_info, DocumentRepository, FetchedDocument,
    NewSegment, SqlitePool, TenderRepository, UserRepository,
};
use licitaradar::triage::score_tender;

async fn setup_test_db() -> (SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db_path = dir.path().join("test.db");
    let pool = create_pool(Path::new(&db_path)).expect("failed to create pool");
    init_schema(pool.clone()).await.expect("failed to apply schema");
    (pool, dir)
}

fn ingest_payload(id_pncp: &str, objeto: &str) -> Map<String, Value> {
    json!({
        "id_pncp": id_pncp,
        "source": "pncp",
        "source_id": "1",
        "orgao": "Prefeitura Municipal",
        "municipio": "Campinas",
        "uf": "SP",
        "modalidade": "pregão eletrônico",
        "objeto": objeto,
        "data_publicacao": "2024-01-01T00:00:00+00:00",
        "status": "aberta",
        "urls": {"pncp": "https://pncp.gov.br/app/contratacoes/X-1"},
    })
    .as_object()
    .unwrap()
    .clone()
}

// ============================================================================
// upsert / version semantics
// ============================================================================

#[tokio::test]
async fn fresh_ingest_creates_one_of_each_row() {
    let (pool, _dir) = setup_test_db().await;
    let repo = TenderRepository::new(pool);

    let prepared = prepare_payload(&ingest_payload("X-1", "limpeza hospitalar"));
    assert_eq!(prepared.get("modalidade_norm"), Some(&json!("PREGAO")));
    assert_eq!(prepared.get("uf_norm"), Some(&json!("SP")));
    assert_eq!(prepared.get("status_norm"), Some(&json!("OPEN")));

    let saved = repo.upsert(&prepared, None).await.unwrap();
    assert!(saved.created);
    assert_eq!(repo.version_count(saved.id).await.unwrap(), 1);
    assert_eq!(repo.source_payload_count(saved.id).await.unwrap(), 1);

    let record = repo.get(saved.id).await.unwrap().unwrap();
    let (score, reasons) = score_tender(&tender_info(&record));
    assert!(score >= 3, "expected score >= 3, got {} ({:?})", score, reasons);
}

#[tokio::test]
async fn repeated_ingest_of_stable_payload_is_idempotent() {
    let (pool, _dir) = setup_test_db().await;
    let repo = TenderRepository::new(pool);

    let prepared = prepare_payload(&ingest_payload("X-1", "limpeza hospitalar"));
    let first = repo.upsert(&prepared, None).await.unwrap();
    let second = repo.upsert(&prepared, None).await.unwrap();

    assert_eq!(first.id, second.id);
    assert!(!second.created);
    assert_eq!(first.hash_metadados, second.hash_metadados);
    // stable input: no second version row
    assert_eq!(repo.version_count(first.id).await.unwrap(), 1);
    // but every delivery is preserved as a source payload
    assert_eq!(repo.source_payload_count(first.id).await.unwrap(), 2);
}

#[tokio::test]
async fn changed_payload_writes_a_new_version() {
    let (pool, _dir) = setup_test_db().await;
    let repo = TenderRepository::new(pool);

    let v1 = prepare_payload(&ingest_payload("X-1", "limpeza hospitalar"));
    let saved = repo.upsert(&v1, None).await.unwrap();

    let v2 = prepare_payload(&ingest_payload("X-1", "limpeza hospitalar e predial"));
    let updated = repo.upsert(&v2, None).await.unwrap();

    assert_eq!(saved.id, updated.id);
    assert_ne!(saved.hash_metadados, updated.hash_metadados);
    assert_eq!(repo.version_count(saved.id).await.unwrap(), 2);
}

// ============================================================================
// cross-source canonical linking
// ============================================================================

#[tokio::test]
async fn cross_source_twins_converge_on_the_lower_id() {
    let (pool, _dir) = setup_test_db().await;
    let repo = TenderRepository::new(pool);

    let mut a = ingest_payload("pncp:A", "Contratação X");
    a.insert("source".to_string(), json!("pncp"));
    let mut b = ingest_payload("compras:A", "Contratação X");
    b.insert("source".to_string(), json!("compras"));

    let saved_a = repo.upsert(&prepare_payload(&a), None).await.unwrap();
    let saved_b = repo.upsert(&prepare_payload(&b), None).await.unwrap();
    assert_ne!(saved_a.id, saved_b.id);

    let rec_a = repo.get(saved_a.id).await.unwrap().unwrap();
    let rec_b = repo.get(saved_b.id).await.unwrap().unwrap();
    assert_eq!(rec_a.fingerprint, rec_b.fingerprint);
    assert!(rec_a.fingerprint.is_some());

    let canonical = Some(saved_a.id.min(saved_b.id));
    assert_eq!(rec_a.canonical_tender_id, canonical);
    assert_eq!(rec_b.canonical_tender_id, canonical);
}

#[tokio::test]
async fn reingest_keeps_canonical_stable() {
    let (pool, _dir) = setup_test_db().await;
    let repo = TenderRepository::new(pool);

    let a = prepare_payload(&ingest_payload("pncp:A", "Contratação X"));
    let mut braw = ingest_payload("compras:A", "Contratação X");
    braw.insert("source".to_string(), json!("compras"));
    let b = prepare_payload(&braw);

    let saved_a = repo.upsert(&a, None).await.unwrap();
    repo.upsert(&b, None).await.unwrap();
    // upsert the original again: the link must not churn
    repo.upsert(&a, None).await.unwrap();

    let rec_a = repo.get(saved_a.id).await.unwrap().unwrap();
    assert_eq!(rec_a.canonical_tender_id, Some(saved_a.id));
}

// ============================================================================
// document dedupe and parse persistence
// ============================================================================

fn fetched_doc(tender_id: i32, sha: &str, body: &[u8]) -> FetchedDocument {
    FetchedDocument {
        tender_id,
        url: "https://example.gov.br/edital.pdf".to_string(),
        source: "pncp".to_string(),
        http_status: Some(200),
        content_type: Some("application/pdf".to_string()),
        sha256: Some(sha.to_string()),
        size_bytes: body.len() as i32,
        truncated: false,
        headers: None,
        body: Some(body.to_vec()),
        error: None,
    }
}

#[tokio::test]
async fn duplicate_sha_is_detected_per_tender() {
    let (pool, _dir) = setup_test_db().await;
    let tenders = TenderRepository::new(pool.clone());
    let docs = DocumentRepository::new(pool);

    let saved = tenders
        .upsert(&prepare_payload(&ingest_payload("X-1", "limpeza")), None)
        .await
        .unwrap();

    assert!(!docs.exists_by_sha(saved.id, "abc123").await.unwrap());
    docs.insert(fetched_doc(saved.id, "abc123", b"%PDF-1.4 fake"))
        .await
        .unwrap();
    assert!(docs.exists_by_sha(saved.id, "abc123").await.unwrap());
    // same hash under another tender is a different document
    assert!(!docs.exists_by_sha(saved.id + 1, "abc123").await.unwrap());

    assert_eq!(docs.count_for_tender(saved.id).await.unwrap(), 1);
}

#[tokio::test]
async fn parse_update_can_drop_the_body() {
    let (pool, _dir) = setup_test_db().await;
    let tenders = TenderRepository::new(pool.clone());
    let docs = DocumentRepository::new(pool);

    let saved = tenders
        .upsert(&prepare_payload(&ingest_payload("X-1", "limpeza")), None)
        .await
        .unwrap();
    let doc_id = docs
        .insert(fetched_doc(saved.id, "abc", b"%PDF body bytes"))
        .await
        .unwrap();

    docs.update_parsed(doc_id, "extracted text here", 0.91, true, true)
        .await
        .unwrap();

    let row = docs.get(doc_id).await.unwrap().unwrap();
    assert_eq!(row.texto_extraido.as_deref(), Some("extracted text here"));
    assert_eq!(row.texto_chars, Some(19));
    assert_eq!(row.ocr_used, 1);
    assert!(row.body.is_none());
}

#[tokio::test]
async fn segment_replacement_is_all_or_nothing() {
    let (pool, _dir) = setup_test_db().await;
    let tenders = TenderRepository::new(pool.clone());
    let docs = DocumentRepository::new(pool);

    let saved = tenders
        .upsert(&prepare_payload(&ingest_payload("X-1", "limpeza")), None)
        .await
        .unwrap();
    let doc_id = docs
        .insert(fetched_doc(saved.id, "abc", b"body"))
        .await
        .unwrap();

    let first: Vec<NewSegment> = (0..3)
        .map(|i| NewSegment {
            idx: i,
            text: format!("old segment {}", i),
            tsv: format!("old segment {}", i),
            embedding: None,
        })
        .collect();
    docs.replace_segments(doc_id, saved.id, first).await.unwrap();
    assert_eq!(docs.segments_for_document(doc_id).await.unwrap().len(), 3);

    let second: Vec<NewSegment> = (0..2)
        .map(|i| NewSegment {
            idx: i,
            text: format!("new segment {}", i),
            tsv: format!("new segment {}", i),
            embedding: Some("[0.1,0.2]".to_string()),
        })
        .collect();
    docs.replace_segments(doc_id, saved.id, second).await.unwrap();

    let rows = docs.segments_for_document(doc_id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|s| s.text.starts_with("new segment")));
}

#[tokio::test]
async fn segment_search_matches_folded_text() {
    let (pool, _dir) = setup_test_db().await;
    let tenders = TenderRepository::new(pool.clone());
    let docs = DocumentRepository::new(pool);

    let saved = tenders
        .upsert(&prepare_payload(&ingest_payload("X-1", "limpeza")), None)
        .await
        .unwrap();
    let doc_id = docs.insert(fetched_doc(saved.id, "abc", b"body")).await.unwrap();
    docs.replace_segments(
        doc_id,
        saved.id,
        vec![NewSegment {
            idx: 0,
            text: "Serviços de vigilância armada".to_string(),
            tsv: "servicos de vigilancia armada".to_string(),
            embedding: None,
        }],
    )
    .await
    .unwrap();

    let hits = docs.search_segments("vigilancia", None, 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    let scoped = docs.search_segments("vigilancia", Some(saved.id), 10).await.unwrap();
    assert_eq!(scoped.len(), 1);
    let none = docs.search_segments("inexistente", None, 10).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn artifact_upsert_keeps_one_row_per_kind() {
    let (pool, _dir) = setup_test_db().await;
    let tenders = TenderRepository::new(pool.clone());
    let docs = DocumentRepository::new(pool);

    let saved = tenders
        .upsert(&prepare_payload(&ingest_payload("X-1", "limpeza")), None)
        .await
        .unwrap();
    let doc_id = docs.insert(fetched_doc(saved.id, "abc", b"body")).await.unwrap();

    docs.store_artifact(doc_id, "doc_convert", &json!({"markdown": "v1"}))
        .await
        .unwrap();
    docs.store_artifact(doc_id, "doc_convert", &json!({"markdown": "v2"}))
        .await
        .unwrap();

    let payload = docs.get_artifact(doc_id, "doc_convert").await.unwrap().unwrap();
    assert!(payload.contains("v2"));
    assert!(docs.get_artifact(doc_id, "tables").await.unwrap().is_none());
}

// ============================================================================
// users, subscriptions, daily guard
// ============================================================================

#[tokio::test]
async fn subscription_join_carries_chat_id() {
    let (pool, _dir) = setup_test_db().await;
    let users = UserRepository::new(pool);

    let user = users
        .upsert_user(licitaradar::repository::UserUpsert {
            telegram_user_id: 4242,
            username: Some("ana".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    users
        .create_subscription(user.id, r#"{"uf":["SP"]}"#, r#"{"pv":true}"#, "realtime")
        .await
        .unwrap();
    users
        .create_subscription(user.id, "{}", "{}", "daily")
        .await
        .unwrap();

    let all = users.active_subscriptions(None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|s| s.telegram_user_id == 4242));

    let daily = users.active_subscriptions(Some("daily")).await.unwrap();
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].frequency, "daily");

    users.set_all_active(user.id, false).await.unwrap();
    assert!(users.active_subscriptions(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn daily_alert_guard_is_once_per_window() {
    let (pool, _dir) = setup_test_db().await;
    let users = UserRepository::new(pool);

    let user = users
        .upsert_user(licitaradar::repository::UserUpsert {
            telegram_user_id: 7,
            ..Default::default()
        })
        .await
        .unwrap();

    let day_start = chrono::Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
        .to_rfc3339();
    assert!(!users
        .alert_sent_since(user.id, "daily_summary", &day_start)
        .await
        .unwrap());

    users
        .record_alert(user.id, "daily_summary", r#"{"count":3,"lookback_h":24}"#)
        .await
        .unwrap();
    assert!(users
        .alert_sent_since(user.id, "daily_summary", &day_start)
        .await
        .unwrap());
    // other alert kinds do not trip the daily guard
    assert!(!users
        .alert_sent_since(user.id, "weekly_summary", &day_start)
        .await
        .unwrap());
}

#[tokio::test]
async fn follow_is_idempotent_and_unfollow_removes() {
    let (pool, _dir) = setup_test_db().await;
    let tenders = TenderRepository::new(pool.clone());
    let users = UserRepository::new(pool);

    let saved = tenders
        .upsert(&prepare_payload(&ingest_payload("X-1", "limpeza")), None)
        .await
        .unwrap();
    let user = users
        .upsert_user(licitaradar::repository::UserUpsert {
            telegram_user_id: 9,
            ..Default::default()
        })
        .await
        .unwrap();

    users.follow(user.id, saved.id).await.unwrap();
    users.follow(user.id, saved.id).await.unwrap();
    users.unfollow(user.id, saved.id).await.unwrap();
}

// ============================================================================
// recent tenders for the digest window
// ============================================================================

#[tokio::test]
async fn published_since_filters_on_the_window() {
    let (pool, _dir) = setup_test_db().await;
    let repo = TenderRepository::new(pool);

    let mut recent = ingest_payload("X-NEW", "limpeza");
    recent.insert(
        "data_publicacao".to_string(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    repo.upsert(&prepare_payload(&recent), None).await.unwrap();

    let mut old = ingest_payload("X-OLD", "vigilância");
    old.insert("data_publicacao".to_string(), json!("2020-01-01T00:00:00+00:00"));
    repo.upsert(&prepare_payload(&old), None).await.unwrap();

    let since = (chrono::Utc::now() - chrono::Duration::hours(24)).to_rfc3339();
    let rows = repo.published_since(&since).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id_pncp, "X-NEW");
}
