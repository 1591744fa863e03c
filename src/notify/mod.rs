//! Subscription matching and realtime notification fan-out.
//!
//! Filter matching is a conjunction over every populated filter dimension;
//! an empty dimension matches anything and the literal `ALL` is a wildcard.
//! Delivery is idempotent per (stage, tender, user) and per
//! (stage, UF channel, tender) through 24-hour SET-NX keys in the shared
//! store; an unreachable store fails open and the message is sent.

pub mod telegram;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::info;

use crate::config::NotifyConfig;
use crate::normalize::fold_accents_lower;
use crate::repository::models::ActiveSubscription;
use telegram::{InlineKeyboardButton, InlineKeyboardMarkup, TelegramClient};

const SENT_KEY_TTL_S: u64 = 24 * 3600;

/// A subscription with its JSON columns decoded.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub user_id: i32,
    pub telegram_user_id: i64,
    pub filters: Value,
    pub deliver_private: bool,
    pub deliver_channel: bool,
    pub realtime: bool,
}

impl Subscription {
    pub fn from_record(record: &ActiveSubscription) -> Self {
        let filters = serde_json::from_str(&record.filters).unwrap_or(Value::Null);
        let delivery: Value = serde_json::from_str(&record.delivery).unwrap_or(Value::Null);
        let deliver = |key: &str| {
            delivery
                .get(key)
                .and_then(|v| v.as_bool())
                .unwrap_or(true)
        };
        let freq = record.frequency.to_lowercase();
        Self {
            user_id: record.user_id,
            telegram_user_id: record.telegram_user_id,
            filters,
            deliver_private: deliver("pv"),
            deliver_channel: deliver("channel"),
            realtime: matches!(freq.as_str(), "realtime" | "rt"),
        }
    }
}

fn normalize_filters(filters: &Value) -> Map<String, Value> {
    match filters {
        Value::Object(map) => map.clone(),
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default(),
        _ => Map::new(),
    }
}

fn as_list(value: Option<&Value>) -> Option<Vec<String>> {
    match value? {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
                    Value::String(_) => None,
                    other => Some(other.to_string()),
                })
                .collect(),
        ),
        Value::String(s) => Some(vec![s.clone()]),
        Value::Null => None,
        other => Some(vec![other.to_string()]),
    }
}

/// Case-normalized membership; empty list matches, `ALL` is a wildcard.
fn match_list(value: Option<&str>, allowed: Option<&Vec<String>>) -> bool {
    let Some(allowed) = allowed else {
        return true;
    };
    let allowed_norm: Vec<String> = allowed
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if allowed_norm.is_empty() || allowed_norm.iter().any(|s| s == "ALL") {
        return true;
    }
    match value {
        Some(v) if !v.trim().is_empty() => allowed_norm.contains(&v.trim().to_uppercase()),
        _ => false,
    }
}

fn word_boundary_match(text: &str, keyword: &str) -> bool {
    Regex::new(&format!(r"\b{}\b", regex::escape(keyword)))
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

/// Any keyword present (word-boundary); empty keyword set matches.
fn match_keywords(text: &str, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return true;
    }
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .any(|k| word_boundary_match(text, &k))
}

fn info_str<'a>(info: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    info.get(key).and_then(|v| v.as_str())
}

/// Conjunction over UF, municipality, modality, object keywords, category
/// keywords, materia membership and the republication policy.
pub fn matches_filters(info: &Map<String, Value>, filters: &Value) -> bool {
    let filters = normalize_filters(filters);
    if filters.is_empty() {
        return true;
    }

    let uf_ok = match_list(info_str(info, "uf"), as_list(filters.get("uf")).as_ref());
    let mun_ok = match_list(
        info_str(info, "municipio"),
        as_list(filters.get("municipio")).as_ref(),
    );

    let mod_allowed: Option<Vec<String>> = as_list(filters.get("modalidade")).map(|list| {
        list.iter()
            .map(|m| fold_accents_lower(m))
            .filter(|m| !m.is_empty())
            .collect()
    });
    let info_mod = fold_accents_lower(info_str(info, "modalidade").unwrap_or(""));
    let mod_ok = match mod_allowed {
        Some(ref list) if !list.is_empty() => match_list(Some(&info_mod), Some(list)),
        _ => true,
    };

    let objeto = fold_accents_lower(info_str(info, "objeto").unwrap_or(""));
    let keywords: Vec<String> = as_list(filters.get("keywords"))
        .unwrap_or_default()
        .iter()
        .map(|k| fold_accents_lower(k))
        .collect();
    let kw_ok = match_keywords(&objeto, &keywords);

    let cat_keywords: Vec<String> = as_list(filters.get("categoria"))
        .unwrap_or_default()
        .iter()
        .map(|k| fold_accents_lower(k))
        .collect();
    let cat_ok = match_keywords(&objeto, &cat_keywords);

    let mat_allowed: Option<Vec<String>> = as_list(
        filters
            .get("materia")
            .or_else(|| filters.get("categoria")),
    )
    .map(|list| {
        list.iter()
            .map(|m| fold_accents_lower(m))
            .filter(|m| !m.is_empty())
            .collect()
    });
    let info_mat = fold_accents_lower(
        info_str(info, "materia")
            .or_else(|| info_str(info, "categoria"))
            .unwrap_or(""),
    );
    let mat_ok = match mat_allowed {
        Some(ref list) if !list.is_empty() => match_list(Some(&info_mat), Some(list)),
        _ => true,
    };

    let rep = filters
        .get("republicacoes")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_lowercase();
    let rep_ok = if matches!(rep.as_str(), "new_only" | "new") {
        let flag = info
            .get("republicacao")
            .or_else(|| info.get("is_republication"))
            .map(truthy)
            .unwrap_or(false);
        !flag
    } else {
        true
    };

    uf_ok && mun_ok && mod_ok && kw_ok && cat_ok && mat_ok && rep_ok
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.to_lowercase().as_str(), "true" | "1" | "yes" | "sim"),
        Value::Number(n) => n.as_i64().map(|i| i != 0).unwrap_or(false),
        _ => false,
    }
}

fn short(s: &str, n: usize) -> String {
    let s = s.trim();
    if s.chars().count() <= n {
        return s.to_string();
    }
    let cut: String = s.chars().take(n.saturating_sub(3)).collect();
    format!("{}...", cut)
}

/// Opportunity card sent on realtime matches.
pub fn format_message(info: &Map<String, Value>, score: Option<i64>) -> String {
    let get = |key: &str, fallback: &str| {
        info.get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(fallback)
            .to_string()
    };
    let mut parts = vec![
        format!("✅ OPORTUNIDADE — {}", get("id_pncp", "?")),
        format!("Órgão: {}", get("orgao", "?")),
        format!("Local: {}/{}", get("municipio", "??"), get("uf", "??")),
        format!("Modalidade: {}", get("modalidade", "?")),
        format!("Status: {}", get("status", "?")),
    ];
    let dp = get("data_publicacao", "");
    if !dp.is_empty() {
        parts.push(format!("Publicação: {}", dp));
    }
    if let Some(score) = score {
        parts.push(format!("Score: {}", score));
    }
    let objeto = get("objeto", "");
    if !objeto.is_empty() {
        parts.push(format!("Resumo: {}", short(&objeto, 220)));
    }
    parts.join("\n")
}

/// Daily digest body.
pub fn format_daily(items: &[Map<String, Value>]) -> String {
    if items.is_empty() {
        return "Resumo diário: nenhum edital novo nas últimas 24h.".to_string();
    }
    let mut lines = vec!["Resumo diário — últimas 24h:".to_string()];
    for item in items {
        let objeto = short(item.get("objeto").and_then(|v| v.as_str()).unwrap_or(""), 90);
        let muni = item.get("municipio").and_then(|v| v.as_str()).unwrap_or("?");
        let uf = item.get("uf").and_then(|v| v.as_str()).unwrap_or("?");
        let id_pncp = item.get("id_pncp").and_then(|v| v.as_str()).unwrap_or("");
        let url = item
            .get("urls")
            .and_then(|u| u.get("pncp"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let mut line = format!("- {}/{} • {}", muni, uf, objeto);
        if !id_pncp.is_empty() {
            line.push_str(&format!(" ({})", id_pncp));
        }
        if !url.is_empty() {
            line.push_str(&format!("\n  {}", url));
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// Upstream URL preference order for action buttons and fetch routing.
pub fn pick_url(urls: &Value) -> Option<String> {
    let obj = urls.as_object()?;
    for key in ["pncp", "compras", "url", "sistema_origem"] {
        if let Some(url) = obj.get(key).and_then(|v| v.as_str()) {
            if !url.trim().is_empty() {
                return Some(url.trim().to_string());
            }
        }
    }
    None
}

pub struct Notifier {
    telegram: TelegramClient,
    redis: redis::Client,
    config: NotifyConfig,
}

impl Notifier {
    pub fn new(redis_url: &str, config: NotifyConfig) -> redis::RedisResult<Self> {
        Ok(Self {
            telegram: TelegramClient::new(config.bot_token.clone()),
            redis: redis::Client::open(redis_url)?,
            config,
        })
    }

    pub fn config(&self) -> &NotifyConfig {
        &self.config
    }

    /// SET NX EX gate; an unreachable store allows the send (fail open).
    async fn first_send(&self, key: &str) -> bool {
        let res: redis::RedisResult<Option<String>> = async {
            let mut conn = self.redis.get_multiplexed_async_connection().await?;
            redis::cmd("SET")
                .arg(key)
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(SENT_KEY_TTL_S)
                .query_async(&mut conn)
                .await
        }
        .await;
        match res {
            Ok(set) => set.is_some(),
            Err(_) => true,
        }
    }

    fn action_buttons(&self, info: &Map<String, Value>) -> Option<InlineKeyboardMarkup> {
        let url = info.get("urls").and_then(pick_url);
        let tender_id = info.get("id").and_then(|v| v.as_i64());
        let deep_link = |action: &str| {
            match (&self.config.bot_username, tender_id) {
                (Some(bot), Some(id)) => Some(format!("https://t.me/{}?start={}_{}", bot, action, id)),
                _ => None,
            }
        };
        let qa_link = deep_link("qa");
        let follow_link = deep_link("follow");

        let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();
        let mut row = Vec::new();
        if let Some(url) = url {
            row.push(InlineKeyboardButton {
                text: "Abrir".to_string(),
                url,
            });
        }
        if let Some(ref link) = qa_link {
            row.push(InlineKeyboardButton {
                text: "Resumo".to_string(),
                url: link.clone(),
            });
        }
        if !row.is_empty() {
            rows.push(row);
        }
        let mut row2 = Vec::new();
        if let Some(ref link) = qa_link {
            row2.push(InlineKeyboardButton {
                text: "Checklist".to_string(),
                url: link.clone(),
            });
        }
        if let Some(link) = follow_link {
            row2.push(InlineKeyboardButton {
                text: "Seguir".to_string(),
                url: link,
            });
        }
        if !row2.is_empty() {
            rows.push(row2);
        }
        if rows.is_empty() {
            None
        } else {
            Some(InlineKeyboardMarkup {
                inline_keyboard: rows,
            })
        }
    }

    /// Realtime fan-out for one tender at one stage.
    ///
    /// Private: at most one message per (stage, tender, user) per 24 h.
    /// Channel: at most one per (stage, UF channel, tender) per 24 h, and
    /// only when some matching subscription opted into channel delivery.
    pub async fn fan_out(
        &self,
        stage: &str,
        info: &Map<String, Value>,
        subscriptions: &[Subscription],
        score: Option<i64>,
    ) -> usize {
        let tender_id = info
            .get("id")
            .and_then(|v| v.as_i64())
            .unwrap_or_default();
        let text = format_message(info, score);
        let mut sent = 0usize;
        let mut notified_users: Vec<i64> = Vec::new();

        for sub in subscriptions {
            if !sub.realtime || !matches_filters(info, &sub.filters) {
                continue;
            }
            if notified_users.contains(&sub.telegram_user_id) {
                continue;
            }
            notified_users.push(sub.telegram_user_id);
            if !sub.deliver_private {
                continue;
            }
            let key = format!("tg_sent:{}:{}:{}", stage, tender_id, sub.telegram_user_id);
            if !self.first_send(&key).await {
                continue;
            }
            if self
                .telegram
                .send_message(&sub.telegram_user_id.to_string(), &text, None)
                .await
            {
                sent += 1;
            }
        }
        if notified_users.is_empty() {
            info!(stage, tender_id, "no matching subscriptions to notify");
        }

        let uf = info
            .get("uf")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_uppercase();
        if let Some(channel_id) = self.config.uf_channels.get(&uf) {
            let wants_channel = subscriptions
                .iter()
                .any(|s| s.deliver_channel && matches_filters(info, &s.filters));
            if wants_channel {
                let key = format!("tg_sent:{}:chan:{}:{}", stage, uf, tender_id);
                if self.first_send(&key).await {
                    let markup = self.action_buttons(info);
                    if self
                        .telegram
                        .send_message(channel_id, &text, markup.as_ref())
                        .await
                    {
                        sent += 1;
                    }
                }
            }
        }
        sent
    }

    pub async fn send_direct(&self, chat_id: &str, text: &str) -> bool {
        self.telegram.send_message(chat_id, text, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn empty_filters_match_everything() {
        let i = info(json!({"uf": "SP", "objeto": "limpeza"}));
        assert!(matches_filters(&i, &json!({})));
        assert!(matches_filters(&i, &Value::Null));
    }

    #[test]
    fn uf_list_membership() {
        let i = info(json!({"uf": "SP"}));
        assert!(matches_filters(&i, &json!({"uf": ["SP", "RJ"]})));
        assert!(!matches_filters(&i, &json!({"uf": ["MG"]})));
        assert!(matches_filters(&i, &json!({"uf": ["ALL"]})));
        assert!(matches_filters(&i, &json!({"uf": "sp"})));
    }

    #[test]
    fn keywords_are_accent_folded_word_matches() {
        let i = info(json!({"objeto": "Serviço de vigilância armada"}));
        assert!(matches_filters(&i, &json!({"keywords": ["vigilancia"]})));
        assert!(!matches_filters(&i, &json!({"keywords": ["vigia"]})));
    }

    #[test]
    fn modality_folded_membership() {
        let i = info(json!({"modalidade": "Pregão Eletrônico"}));
        assert!(matches_filters(&i, &json!({"modalidade": ["pregao eletronico"]})));
        assert!(!matches_filters(&i, &json!({"modalidade": ["convite"]})));
    }

    #[test]
    fn republication_policy_excludes_flagged() {
        let rep = info(json!({"uf": "SP", "republicacao": "true"}));
        assert!(!matches_filters(&rep, &json!({"republicacoes": "new_only"})));
        let fresh = info(json!({"uf": "SP"}));
        assert!(matches_filters(&fresh, &json!({"republicacoes": "new_only"})));
    }

    #[test]
    fn filters_accept_string_encoded_json() {
        let i = info(json!({"uf": "SP"}));
        assert!(matches_filters(&i, &json!("{\"uf\": [\"SP\"]}")));
        assert!(matches_filters(&i, &json!("not json")));
    }

    #[test]
    fn message_includes_core_fields() {
        let i = info(json!({
            "id_pncp": "X-1", "orgao": "Prefeitura", "municipio": "Campinas",
            "uf": "SP", "modalidade": "pregão", "status": "aberta",
            "objeto": "limpeza hospitalar",
        }));
        let msg = format_message(&i, Some(5));
        assert!(msg.contains("X-1"));
        assert!(msg.contains("Campinas/SP"));
        assert!(msg.contains("Score: 5"));
        assert!(msg.contains("limpeza hospitalar"));
    }

    #[test]
    fn url_preference_order() {
        let urls = json!({"sistema_origem": "http://c", "compras": "http://b", "pncp": "http://a"});
        assert_eq!(pick_url(&urls).as_deref(), Some("http://a"));
        let urls = json!({"url": "http://only"});
        assert_eq!(pick_url(&urls).as_deref(), Some("http://only"));
        assert_eq!(pick_url(&json!({})), None);
    }

    #[test]
    fn daily_digest_formats_items() {
        let items = vec![info(json!({
            "municipio": "Santos", "uf": "SP", "objeto": "merenda escolar",
            "id_pncp": "X-9", "urls": {"pncp": "http://x"},
        }))];
        let msg = format_daily(&items);
        assert!(msg.contains("Santos/SP"));
        assert!(msg.contains("X-9"));
        assert!(msg.contains("http://x"));
        assert!(format_daily(&[]).contains("nenhum edital"));
    }
}
