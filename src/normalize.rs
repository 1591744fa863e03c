//! Canonicalization of free-form tender fields.
//!
//! Pure functions over possibly-missing strings. Normalization never fails:
//! unmatchable input degrades to `None` (or the `OUTRA`/`UNKNOWN` catch-all
//! for the enum fields). All functions are idempotent.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

fn ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

fn municipio_uf_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<city>.+?)[\s/-]+(?P<uf>[A-Za-z]{2})$").unwrap())
}

/// Trim; empty becomes `None`.
pub fn strip(s: Option<&str>) -> Option<String> {
    let out = s?.trim();
    if out.is_empty() {
        None
    } else {
        Some(out.to_string())
    }
}

/// Collapse whitespace runs to single spaces and trim.
pub fn squash_ws(s: Option<&str>) -> Option<String> {
    let raw = s?;
    let out = ws_re().replace_all(raw, " ").trim().to_string();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// NFKD-decompose and drop combining marks.
pub fn fold_accents(s: &str) -> String {
    s.nfkd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Accent-folded lowercase, the comparison form used throughout matching.
pub fn fold_accents_lower(s: &str) -> String {
    fold_accents(s).to_lowercase()
}

fn upper(s: Option<&str>) -> Option<String> {
    let out = s?.trim().to_uppercase();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Two-letter alphabetic state code, uppercased; anything else is `None`.
pub fn normalize_uf(uf: Option<&str>) -> Option<String> {
    let u = upper(uf)?;
    if u.len() == 2 && u.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(u)
    } else {
        None
    }
}

/// Split "City/UF" or "City - UF" conservatively.
///
/// On no match the whole text is returned as the city with no UF.
pub fn split_municipio_uf(raw: Option<&str>) -> (Option<String>, Option<String>) {
    let text = match squash_ws(raw) {
        Some(t) => t,
        None => return (None, None),
    };
    if let Some(caps) = municipio_uf_re().captures(&text) {
        let city = strip(caps.name("city").map(|m| m.as_str()));
        let uf = normalize_uf(caps.name("uf").map(|m| m.as_str()));
        if uf.is_some() {
            return (city, uf);
        }
    }
    (Some(text), None)
}

/// Substring match against the fixed modality enum; unmatched input is OUTRA.
pub fn normalize_modalidade(raw: Option<&str>) -> Option<String> {
    let s = fold_accents_lower(&strip(raw)?);
    let out = if s.contains("preg") {
        "PREGAO"
    } else if s.contains("concorr") {
        "CONCORRENCIA"
    } else if s.contains("dispensa") {
        "DISPENSA"
    } else if s.contains("inexig") {
        "INEXIGIBILIDADE"
    } else if s.contains("convite") {
        "CONVITE"
    } else if s.contains("tomada") || s.contains("precos") {
        "TOMADA_PRECOS"
    } else if s.contains("rdc") {
        "RDC"
    } else if s.contains("leil") {
        "LEILAO"
    } else {
        "OUTRA"
    };
    Some(out.to_string())
}

/// Substring match against the fixed status enum.
pub fn normalize_status(raw: Option<&str>) -> Option<String> {
    let s = fold_accents_lower(&strip(raw)?);
    let any = |keys: &[&str]| keys.iter().any(|k| s.contains(k));
    let out = if any(&["aberta", "aberto", "abertura", "publicada"]) {
        "OPEN"
    } else if any(&["em andamento", "andamento", "processando"]) {
        "IN_PROGRESS"
    } else if any(&["encerrada", "finalizada", "homologada"]) {
        "CLOSED"
    } else if any(&["cancelada", "anulada", "revogada"]) {
        "CANCELED"
    } else if any(&["suspensa", "suspenso"]) {
        "SUSPENDED"
    } else if any(&["deserta", "fracassada"]) {
        "FAILED"
    } else {
        "UNKNOWN"
    };
    Some(out.to_string())
}

pub fn normalize_objeto(raw: Option<&str>) -> Option<String> {
    squash_ws(raw)
}

pub fn normalize_orgao(raw: Option<&str>) -> Option<String> {
    squash_ws(raw)
}

pub fn normalize_municipio(raw: Option<&str>) -> Option<String> {
    let (city, _uf) = split_municipio_uf(raw);
    squash_ws(city.as_deref())
}

fn get_str(payload: &Map<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn set_opt(payload: &mut Map<String, Value>, key: &str, value: Option<String>) {
    payload.insert(
        key.to_string(),
        value.map(Value::String).unwrap_or(Value::Null),
    );
}

/// Derive the `_norm` companions and clean the base fields in place.
///
/// The UF may come from its own field or be recovered from a "City/UF"
/// municipality string.
pub fn normalize_tender(payload: &Map<String, Value>) -> Map<String, Value> {
    let mut out = payload.clone();

    let municipio_raw = get_str(payload, "municipio");
    let (city, uf_from_city) = split_municipio_uf(municipio_raw.as_deref());
    let uf = normalize_uf(get_str(payload, "uf").as_deref()).or(uf_from_city);

    let orgao = get_str(payload, "orgao");
    let modalidade = get_str(payload, "modalidade");
    let status = get_str(payload, "status");
    let objeto = get_str(payload, "objeto");

    set_opt(&mut out, "orgao_norm", normalize_orgao(orgao.as_deref()));
    set_opt(&mut out, "municipio_norm", normalize_municipio(city.as_deref()));
    set_opt(&mut out, "uf_norm", uf.clone());
    set_opt(&mut out, "modalidade_norm", normalize_modalidade(modalidade.as_deref()));
    set_opt(&mut out, "status_norm", normalize_status(status.as_deref()));
    set_opt(&mut out, "objeto_norm", normalize_objeto(objeto.as_deref()));

    set_opt(&mut out, "orgao", strip(orgao.as_deref()));
    set_opt(&mut out, "municipio", strip(city.as_deref()));
    set_opt(&mut out, "uf", uf);
    set_opt(&mut out, "modalidade", strip(modalidade.as_deref()));
    set_opt(&mut out, "status", strip(status.as_deref()));
    set_opt(&mut out, "objeto", normalize_objeto(objeto.as_deref()));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fold_drops_accents() {
        assert_eq!(fold_accents_lower("São Paulo"), "sao paulo");
        assert_eq!(fold_accents_lower("VIGILÂNCIA"), "vigilancia");
    }

    #[test]
    fn uf_rejects_non_codes() {
        assert_eq!(normalize_uf(Some("sp")), Some("SP".to_string()));
        assert_eq!(normalize_uf(Some("SPX")), None);
        assert_eq!(normalize_uf(Some("S1")), None);
        assert_eq!(normalize_uf(None), None);
    }

    #[test]
    fn municipio_uf_split_variants() {
        assert_eq!(
            split_municipio_uf(Some("Campinas/SP")),
            (Some("Campinas".to_string()), Some("SP".to_string()))
        );
        assert_eq!(
            split_municipio_uf(Some("Rio de Janeiro - RJ")),
            (Some("Rio de Janeiro".to_string()), Some("RJ".to_string()))
        );
        assert_eq!(
            split_municipio_uf(Some("Brasília")),
            (Some("Brasília".to_string()), None)
        );
        assert_eq!(split_municipio_uf(None), (None, None));
    }

    #[test]
    fn modalidade_enum_mapping() {
        assert_eq!(
            normalize_modalidade(Some("Pregão Eletrônico")),
            Some("PREGAO".to_string())
        );
        assert_eq!(
            normalize_modalidade(Some("Tomada de Preços")),
            Some("TOMADA_PRECOS".to_string())
        );
        assert_eq!(normalize_modalidade(Some("coisa rara")), Some("OUTRA".to_string()));
        assert_eq!(normalize_modalidade(None), None);
    }

    #[test]
    fn status_enum_mapping() {
        assert_eq!(normalize_status(Some("Aberta")), Some("OPEN".to_string()));
        assert_eq!(normalize_status(Some("Homologada")), Some("CLOSED".to_string()));
        assert_eq!(normalize_status(Some("???")), Some("UNKNOWN".to_string()));
    }

    #[test]
    fn normalize_is_idempotent() {
        let payload = json!({
            "orgao": "  Prefeitura   de  Campinas ",
            "municipio": "Campinas/SP",
            "uf": null,
            "modalidade": "pregão",
            "status": "aberta",
            "objeto": "serviço  de   limpeza",
        });
        let once = normalize_tender(payload.as_object().unwrap());
        let twice = normalize_tender(&once);
        assert_eq!(once, twice);
        assert_eq!(once.get("uf_norm"), Some(&json!("SP")));
        assert_eq!(once.get("modalidade_norm"), Some(&json!("PREGAO")));
        assert_eq!(once.get("objeto"), Some(&json!("serviço de limpeza")));
    }
}
