//! Heuristic insight extraction over indexed segments.
//!
//! Procurement notices follow a rigid editorial template (OBJETO, VALOR,
//! DATA DA SESSÃO, MODALIDADE...), so structured fields, summary bullets
//! and direct answers come out of anchored regexes over whitespace-collapsed
//! text. The chat oracle is only a fallback when the patterns find nothing.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};

fn re_ci(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|_| Regex::new("$^").unwrap())
}

fn objeto_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        re_ci(r"OBJETO\s*[:\-]?\s*(.{20,1200}?)\s*(?:VALOR|DATA|CRIT[ÉE]RIO|MODALIDADE|$)")
    })
}

fn objeto_alt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| re_ci(r"(Contrata[^.]{60,220})"))
}

fn valor_global_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| re_ci(r"VALOR\s+GLOBAL\s*(R\$\s*[0-9\.]+,[0-9]{2}[^\n]{0,80})"))
}

fn valor_total_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        re_ci(r"VALOR\s+TOTAL\s*(?:ESTIMADO\s+DA\s+CONTRATA[ÇC][AÃ]O\s*)?(R\$\s*[0-9\.]+,[0-9]{2}[^\n]{0,80})")
    })
}

fn valor_estimado_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| re_ci(r"VALOR\s+(?:TOTAL\s+)?ESTIMADO.*?(R\$\s*[0-9\.]+,[0-9]{2}[^\n]{0,80})"))
}

fn sessao_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        re_ci(r"DATA\s+DA\s+SESS[ÃA]O\s+P[ÚU]BLICA\s*[:\-]?\s*([0-9]{2}/[0-9]{2}/[0-9]{4}[^\n]{0,40})")
    })
}

fn sessao_hora_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        re_ci(
            r"DATA\s+DA\s+SESS[ÃA]O\s+P[ÚU]BLICA\s*[:\-]?\s*([0-9]{2}/[0-9]{2}/[0-9]{4}(?:\s+\S{1,5}\s+[0-9]{2}:[0-9]{2}h?)?)",
        )
    })
}

fn prazo_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        re_ci(r"PRAZO\s+FINAL\s+PARA\s+PROPOSTA\S*\s*[:\-]?\s*([0-9]{2}/[0-9]{2}/[0-9]{4}[^\n]{0,40})")
    })
}

fn modalidade_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| re_ci(r"MODALIDADE\s*[:\-]?\s*([A-ZÇÃÕ\s]{4,80})"))
}

fn criterio_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| re_ci(r"CRIT[ÉE]RIO\s+DE\s+JULGAMENTO\s*[:\-]?\s*([A-ZÇÃÕ\s]{4,60})"))
}

fn orgao_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        re_ci(r"(DEPARTAMENTO\s+NACIONAL\s+DE\s+INFRAESTRUTURA\s+DE\s+TRANSPORTES[^\n]{0,120})")
    })
}

fn objeto_frase_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| re_ci(r"objeto da presente licita[çc][ãa]o [ée] (.{20,400})"))
}

fn objeto_livre_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| re_ci(r"OBJETO\s*[:\-]?\s*(.{20,400})"))
}

fn take_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn squash(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapsed prefix of the text, in characters.
fn norm_prefix(text: &str, max_chars: usize) -> String {
    squash(&take_chars(text, max_chars))
}

/// First line, whitespace-squashed and capped.
pub fn first_line_short(text: &str, max_len: usize) -> String {
    let line = text.trim().lines().next().unwrap_or("").trim();
    take_chars(&squash(line), max_len)
}

fn cut_before<'a>(val: &'a str, token: &str) -> &'a str {
    match val.find(token) {
        Some(pos) => &val[..pos],
        None => val,
    }
}

/// Strip header noise (contact lines, URLs) and anchor on the contract verb.
pub fn clean_object_text(val: &str) -> String {
    if val.is_empty() {
        return String::new();
    }
    let mut out = val.to_string();
    for token in ["http", "E-mail", "CEP:"] {
        out = cut_before(&out, token).to_string();
    }
    if let Some(pos) = out.rfind("OBJETO") {
        out = out[pos + "OBJETO".len()..].to_string();
    }
    // common OCR artifact in these notices
    out = out.replace("Contrataç oão", "Contratação");
    if let Some(pos) = out.find("Contrata") {
        out = out[pos..].to_string();
    }
    squash(&out)
}

fn clean_upper(val: &str, stop_tokens: &[&str], max_len: usize) -> String {
    let mut out = val.to_string();
    for token in stop_tokens {
        out = cut_before(&out, token).to_string();
    }
    take_chars(&squash(&out), max_len)
}

/// Fields recovered from the editorial template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredFields {
    pub objeto: Option<String>,
    pub valor_global: Option<String>,
    pub valor_total: Option<String>,
    pub valor_estimado: Option<String>,
    pub valor: Option<String>,
    pub sessao: Option<String>,
    pub prazo_proposta: Option<String>,
    pub modalidade: Option<String>,
    pub orgao: Option<String>,
}

impl StructuredFields {
    /// Fields counted toward the confidence score.
    pub fn field_hits(&self) -> usize {
        [
            &self.objeto,
            &self.valor,
            &self.sessao,
            &self.prazo_proposta,
            &self.modalidade,
            &self.orgao,
        ]
        .iter()
        .filter(|f| f.is_some())
        .count()
    }

    pub fn to_json(&self) -> Value {
        let mut out = serde_json::Map::new();
        let mut put = |key: &str, val: &Option<String>| {
            if let Some(v) = val {
                out.insert(key.to_string(), json!(v));
            }
        };
        put("objeto", &self.objeto);
        put("valor_global", &self.valor_global);
        put("valor_total", &self.valor_total);
        put("valor_estimado", &self.valor_estimado);
        put("valor", &self.valor);
        put("sessao", &self.sessao);
        put("prazo_proposta", &self.prazo_proposta);
        put("modalidade", &self.modalidade);
        put("orgao", &self.orgao);
        Value::Object(out)
    }
}

fn pick(re: &Regex, norm: &str) -> Option<String> {
    re.captures(norm)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn extract_structured(text: &str) -> StructuredFields {
    if text.is_empty() {
        return StructuredFields::default();
    }
    let norm = norm_prefix(text, 20_000);
    let mut out = StructuredFields::default();

    if let Some(raw) = pick(objeto_re(), &norm) {
        let cleaned = clean_object_text(&raw);
        if !cleaned.is_empty() {
            out.objeto = Some(take_chars(&cleaned, 400));
        }
    }

    out.valor_global = pick(valor_global_re(), &norm).map(|v| take_chars(&v, 120));
    out.valor_total = pick(valor_total_re(), &norm).map(|v| take_chars(&v, 120));
    out.valor_estimado = pick(valor_estimado_re(), &norm).map(|v| take_chars(&v, 120));
    out.valor = out
        .valor_global
        .clone()
        .or_else(|| out.valor_total.clone())
        .or_else(|| out.valor_estimado.clone());

    if let Some(sessao) = pick(sessao_re(), &norm) {
        out.sessao = Some(take_chars(
            clean_upper(&sessao, &["CRIT", "MODO", "PREFER"], 80).trim(),
            80,
        ));
    }
    out.prazo_proposta = pick(prazo_re(), &norm).map(|v| take_chars(&v, 80));

    if let Some(modalidade) = pick(modalidade_re(), &norm) {
        let cleaned = cut_before(&modalidade, "CRIT").trim().to_string();
        if !cleaned.is_empty() {
            out.modalidade = Some(take_chars(&cleaned, 80));
        }
    }
    if let Some(orgao) = pick(orgao_re(), &norm) {
        out.orgao = Some(take_chars(&squash(&orgao), 140));
    }

    out
}

/// Bullet-per-field summary over the same patterns; at most 10 bullets.
pub fn heuristic_summary(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let norm = norm_prefix(text, 12_000);
    let mut bullets: Vec<String> = Vec::new();

    if let Some(raw) = pick(objeto_re(), &norm) {
        let mut val = clean_object_text(&raw);
        if val.chars().count() < 60 {
            if let Some(alt) = pick(objeto_alt_re(), &norm) {
                val = clean_object_text(&alt);
            }
        }
        if !val.is_empty() {
            bullets.push(format!("Objeto: {}", take_chars(&val, 220)));
        }
    }
    if let Some(valor) = pick(valor_estimado_re(), &norm) {
        bullets.push(format!("Valor: {}", take_chars(&valor, 220)));
    }
    if let Some(sessao) = pick(sessao_hora_re(), &norm) {
        bullets.push(format!("Sessao: {}", take_chars(sessao.trim(), 60)));
    }
    if let Some(modalidade) = pick(modalidade_re(), &norm) {
        let val = clean_upper(&modalidade, &["CRIT", "MODO", "PREFER"], 120);
        if !val.is_empty() {
            bullets.push(format!("Modalidade: {}", val));
        }
    }
    if let Some(criterio) = pick(criterio_re(), &norm) {
        let val = clean_upper(&criterio, &["MODO", "PREFER"], 120);
        if !val.is_empty() {
            bullets.push(format!("Criterio: {}", val));
        }
    }
    if let Some(orgao) = pick(orgao_re(), &norm) {
        let val = clean_upper(&orgao, &["EDITAL", "PREG", "OBJETO"], 140);
        if !val.is_empty() {
            bullets.push(format!("Orgao: {}", val));
        }
    }

    bullets.truncate(10);
    bullets
}

/// Reject summaries that only echo headers, contacts or binary stubs.
pub fn summary_looks_useful(bullets: &[String]) -> bool {
    if bullets.is_empty() {
        return false;
    }
    let joined = bullets.join(" ").to_lowercase();
    if ["binario", "binary", "content type", "content_type", "bytes"]
        .iter()
        .any(|x| joined.contains(x))
    {
        return false;
    }
    let has_obj = joined.contains("objeto") || joined.contains("contrat");
    let has_val = joined.contains("r$") || joined.contains("valor");
    let has_data = joined.contains("data") || joined.contains("sess");
    let useful_hits = [has_obj, has_val, has_data].iter().filter(|b| **b).count();
    if joined.contains("e-mail") || joined.contains("http") {
        return useful_hits >= 2;
    }
    has_obj || (has_val && has_data)
}

/// Blend of field coverage, average text quality and text volume, in [0, 1].
pub fn summary_confidence(field_hits: usize, avg_quality: f64, max_chars: i64) -> f64 {
    let fields_score = (field_hits as f64 / 6.0).min(1.0);
    let chars = (max_chars as f64 / 20_000.0).min(1.0);
    let score = 0.5 * fields_score + 0.3 * avg_quality + 0.2 * chars;
    (score.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
}

/// Direct answers for the three question families the bot asks most.
pub fn heuristic_answer(question: &str, evidence_texts: &[String]) -> Option<String> {
    if question.is_empty() || evidence_texts.is_empty() {
        return None;
    }
    let q = question.to_lowercase();
    let joined = squash(
        &evidence_texts
            .iter()
            .take(5)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" "),
    );

    if q.contains("sess") && q.contains("data") {
        if let Some(val) = pick(sessao_re(), &joined) {
            let val = clean_upper(&val, &["CRIT", "MODO", "PREFER"], 80);
            return Some(format!("Data da sessao publica: {}.", val.trim()));
        }
    }
    if q.contains("valor") {
        if let Some(val) = pick(valor_estimado_re(), &joined) {
            return Some(format!("Valor estimado: {}.", val));
        }
    }
    if q.contains("objeto") {
        if let Some(raw) = pick(objeto_livre_re(), &joined) {
            let mut val = clean_object_text(&raw);
            if val.chars().count() < 60 {
                if let Some(alt) = pick(objeto_frase_re(), &joined) {
                    val = clean_object_text(&alt);
                }
            }
            if !val.is_empty() {
                return Some(format!("Objeto: {}.", take_chars(&val, 220)));
            }
        }
    }
    None
}

/// Baseline participation checklist; extraction-driven items come later.
pub fn checklist_items() -> Value {
    json!([
        {"title": "Proposta comercial", "priority": "alta"},
        {"title": "Habilitação jurídica", "priority": "alta"},
        {"title": "Regularidade fiscal", "priority": "alta"},
        {"title": "Qualificação técnica", "priority": "media"},
        {"title": "Qualificação econômico-financeira", "priority": "media"},
        {"title": "Declarações obrigatórias", "priority": "media"},
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    const EDITAL: &str = "PREGÃO ELETRÔNICO Nº 90012/2024 \
        OBJETO: Contratação de empresa especializada em serviços de limpeza \
        predial e hospitalar para as unidades da administração. \
        VALOR TOTAL ESTIMADO DA CONTRATAÇÃO R$ 1.234.567,89 conforme anexo \
        DATA DA SESSÃO PÚBLICA: 15/08/2024 às 10:00h \
        MODALIDADE: PREGÃO ELETRÔNICO CRITÉRIO DE JULGAMENTO: MENOR PREÇO";

    #[test]
    fn extracts_structured_fields() {
        let fields = extract_structured(EDITAL);
        let objeto = fields.objeto.as_deref().unwrap();
        assert!(objeto.starts_with("Contratação de empresa"), "{}", objeto);
        assert!(fields.valor.as_deref().unwrap().starts_with("R$ 1.234.567,89"));
        assert!(fields.sessao.as_deref().unwrap().starts_with("15/08/2024"));
        assert!(fields.modalidade.is_some());
        assert!(fields.field_hits() >= 4);
    }

    #[test]
    fn empty_text_yields_no_fields() {
        let fields = extract_structured("");
        assert_eq!(fields, StructuredFields::default());
        assert_eq!(fields.field_hits(), 0);
    }

    #[test]
    fn summary_bullets_cover_template_fields() {
        let bullets = heuristic_summary(EDITAL);
        assert!(bullets.iter().any(|b| b.starts_with("Objeto:")));
        assert!(bullets.iter().any(|b| b.starts_with("Valor:")));
        assert!(bullets.iter().any(|b| b.starts_with("Sessao:")));
        assert!(bullets.len() <= 10);
        assert!(summary_looks_useful(&bullets));
    }

    #[test]
    fn useless_summaries_are_rejected() {
        assert!(!summary_looks_useful(&[]));
        assert!(!summary_looks_useful(&["[BINARIO] content type bytes=12".to_string()]));
        // contact-only header needs two useful signals
        assert!(!summary_looks_useful(&["E-mail: x@y.gov.br objeto".to_string()]));
    }

    #[test]
    fn clean_object_cuts_header_noise() {
        let raw = "Órgão: Prefeitura OBJETO Contratação de obras de pavimentação E-mail: x@y.gov";
        let cleaned = clean_object_text(raw);
        assert_eq!(cleaned, "Contratação de obras de pavimentação");
        // everything after a contact token is dropped
        assert_eq!(clean_object_text("Av. Central CEP: 13000-000 resto"), "Av. Central");
    }

    #[test]
    fn confidence_blends_fields_quality_and_volume() {
        assert_eq!(summary_confidence(0, 0.0, 0), 0.0);
        assert_eq!(summary_confidence(6, 1.0, 20_000), 1.0);
        let mid = summary_confidence(3, 0.5, 10_000);
        assert!((0.0..=1.0).contains(&mid));
        assert_eq!(mid, 0.5);
    }

    #[test]
    fn heuristic_answer_by_question_family() {
        let evidence = vec![EDITAL.to_string()];
        let sess = heuristic_answer("qual a data da sessão?", &evidence).unwrap();
        assert!(sess.contains("15/08/2024"));
        let valor = heuristic_answer("qual o valor estimado?", &evidence).unwrap();
        assert!(valor.contains("R$ 1.234.567,89"));
        let objeto = heuristic_answer("qual o objeto?", &evidence).unwrap();
        assert!(objeto.contains("Contratação"));
        assert!(heuristic_answer("quem assina?", &evidence).is_none());
        assert!(heuristic_answer("qual o valor?", &[]).is_none());
    }

    #[test]
    fn first_line_is_squashed_and_capped() {
        assert_eq!(first_line_short("  a   b  \nsecond", 220), "a b");
        assert_eq!(first_line_short("", 220), "");
        let long: String = std::iter::repeat('x').take(300).collect();
        assert_eq!(first_line_short(&long, 220).len(), 220);
    }

    #[test]
    fn checklist_is_static_and_nonempty() {
        let items = checklist_items();
        let arr = items.as_array().unwrap();
        assert_eq!(arr.len(), 6);
        assert_eq!(arr[0]["title"], "Proposta comercial");
        assert_eq!(arr[0]["priority"], "alta");
    }
}
