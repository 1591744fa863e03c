// Table definitions kept in sync with repository::init.

diesel::table! {
    tender (id) {
        id -> Integer,
        id_pncp -> Text,
        source -> Nullable<Text>,
        source_id -> Nullable<Text>,
        orgao -> Nullable<Text>,
        orgao_norm -> Nullable<Text>,
        municipio -> Nullable<Text>,
        municipio_norm -> Nullable<Text>,
        uf -> Nullable<Text>,
        uf_norm -> Nullable<Text>,
        modalidade -> Nullable<Text>,
        modalidade_norm -> Nullable<Text>,
        objeto -> Nullable<Text>,
        objeto_norm -> Nullable<Text>,
        status -> Nullable<Text>,
        status_norm -> Nullable<Text>,
        data_publicacao -> Nullable<Text>,
        urls -> Text,
        fingerprint -> Nullable<Text>,
        hash_metadados -> Nullable<Text>,
        canonical_tender_id -> Nullable<Integer>,
        materia -> Nullable<Text>,
        categoria -> Nullable<Text>,
        materia_confidence -> Nullable<Double>,
        materia_source -> Nullable<Text>,
        materia_tags -> Nullable<Text>,
        materia_updated_at -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    tender_version (id) {
        id -> Integer,
        tender_id -> Integer,
        hash_metadados -> Text,
        payload -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    tender_source_payload (id) {
        id -> Integer,
        tender_id -> Integer,
        source -> Text,
        source_id -> Nullable<Text>,
        payload -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    document (id) {
        id -> Integer,
        tender_id -> Integer,
        url -> Text,
        source -> Text,
        fetched_at -> Text,
        http_status -> Nullable<Integer>,
        content_type -> Nullable<Text>,
        sha256 -> Nullable<Text>,
        size_bytes -> Integer,
        truncated -> Integer,
        headers -> Nullable<Text>,
        body -> Nullable<Binary>,
        texto_extraido -> Nullable<Text>,
        texto_chars -> Nullable<Integer>,
        texto_quality -> Nullable<Double>,
        ocr_used -> Integer,
        error -> Nullable<Text>,
    }
}

diesel::table! {
    document_segment (id) {
        id -> Integer,
        document_id -> Integer,
        tender_id -> Integer,
        idx -> Integer,
        text -> Text,
        tsv -> Text,
        embedding -> Nullable<Text>,
    }
}

diesel::table! {
    document_artifact (id) {
        id -> Integer,
        document_id -> Integer,
        kind -> Text,
        payload -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    pipeline_event (id) {
        id -> Integer,
        tender_id -> Nullable<Integer>,
        document_id -> Nullable<Integer>,
        stage -> Text,
        status -> Text,
        message -> Nullable<Text>,
        payload -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    app_user (id) {
        id -> Integer,
        telegram_user_id -> BigInt,
        username -> Nullable<Text>,
        first_name -> Nullable<Text>,
        last_name -> Nullable<Text>,
        language_code -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    user_subscription (id) {
        id -> Integer,
        user_id -> Integer,
        filters -> Text,
        delivery -> Text,
        frequency -> Text,
        is_active -> Integer,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    tender_follow (id) {
        id -> Integer,
        user_id -> Integer,
        tender_id -> Integer,
        created_at -> Text,
    }
}

diesel::table! {
    alert (id) {
        id -> Integer,
        user_id -> Integer,
        #[sql_name = "type"]
        kind -> Text,
        payload -> Text,
        sent_at -> Text,
        created_at -> Text,
    }
}

diesel::joinable!(tender_version -> tender (tender_id));
diesel::joinable!(tender_source_payload -> tender (tender_id));
diesel::joinable!(document -> tender (tender_id));
diesel::joinable!(document_artifact -> document (document_id));
diesel::joinable!(user_subscription -> app_user (user_id));
diesel::joinable!(alert -> app_user (user_id));

diesel::allow_tables_to_appear_in_same_query!(
    tender,
    tender_version,
    tender_source_payload,
    document,
    document_segment,
    document_artifact,
    pipeline_event,
    app_user,
    user_subscription,
    tender_follow,
    alert,
);
