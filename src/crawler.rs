//! Upstream catalog crawlers.
//!
//! Two catalogs feed the pipeline: the PNCP publication listing, paged by
//! explicit page numbers, and the compras.dados.gov.br listing, which pages
//! by following `next` links. Both map each item to the ingest schema and
//! POST it to the core API; page and item caps bound a sweep and listing
//! errors back off.

use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{ComprasConfig, CrawlerConfig};
use crate::metrics::MetricsSink;

async fn ingest_tender(
    client: &reqwest::Client,
    core_api_url: &str,
    core_api_key: Option<&str>,
    payload: &Value,
) -> Result<(), String> {
    let url = format!("{}/v1/ingest/tender", core_api_url);
    let mut request = client.post(&url).json(payload);
    if let Some(key) = core_api_key {
        request = request.header("x-api-key", key);
    }
    let resp = request.send().await.map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("HTTP {}", resp.status()));
    }
    Ok(())
}

pub struct PncpCrawler {
    config: CrawlerConfig,
    client: reqwest::Client,
    metrics: MetricsSink,
}

impl PncpCrawler {
    pub fn new(config: CrawlerConfig, metrics: MetricsSink) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build crawler http client");
        Self {
            config,
            client,
            metrics,
        }
    }

    fn date_range(&self) -> (String, String) {
        match (&self.config.data_inicial, &self.config.data_final) {
            (Some(start), Some(end)) => (start.clone(), end.clone()),
            _ => {
                let today = chrono::Utc::now().format("%Y%m%d").to_string();
                (today.clone(), today)
            }
        }
    }

    fn listing_url(&self, modalidade_id: &str, page: usize, start: &str, end: &str) -> String {
        let page_size = self.config.page_size.max(self.config.page_size_min);
        let mut url = format!(
            "{}/v1/contratacoes/publicacao?dataInicial={}&dataFinal={}&codigoModalidadeContratacao={}&pagina={}&tamanhoPagina={}",
            self.config.base_url, start, end, modalidade_id, page, page_size
        );
        if let Some(ref uf) = self.config.uf {
            url.push_str(&format!("&uf={}", uf));
        }
        url
    }

    /// Map one listing item to the ingest payload shape.
    pub fn map_item(item: &Value) -> Option<Value> {
        let numero = item
            .get("numeroControlePNCP")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if numero.is_empty() {
            return None;
        }
        let orgao = item
            .get("orgaoEntidade")
            .and_then(|v| v.get("razaoSocial"))
            .cloned()
            .unwrap_or(Value::Null);
        let unidade = item.get("unidadeOrgao").cloned().unwrap_or(Value::Null);
        let municipio = unidade.get("municipioNome").cloned().unwrap_or(Value::Null);
        let uf = unidade.get("ufSigla").cloned().unwrap_or(Value::Null);

        let mut objeto = item
            .get("objetoCompra")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let info = item
            .get("informacaoComplementar")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if !info.is_empty() {
            objeto = if objeto.is_empty() {
                info.to_string()
            } else {
                format!("{} | {}", objeto, info)
            };
        }

        let mut urls = Map::new();
        urls.insert(
            "pncp".to_string(),
            json!(format!("https://pncp.gov.br/app/contratacoes/{}", numero)),
        );
        if let Some(origem) = item.get("linkSistemaOrigem").and_then(|v| v.as_str()) {
            urls.insert("sistema_origem".to_string(), json!(origem));
        }
        if let Some(processo) = item.get("linkProcessoEletronico").and_then(|v| v.as_str()) {
            urls.insert("processo".to_string(), json!(processo));
        }

        Some(json!({
            "id_pncp": numero,
            "source": "pncp",
            "source_id": numero,
            "orgao": orgao,
            "municipio": municipio,
            "uf": uf,
            "modalidade": item.get("modalidadeNome").cloned().unwrap_or(Value::Null),
            "objeto": objeto,
            "data_publicacao": item.get("dataPublicacaoPncp").cloned().unwrap_or(Value::Null),
            "status": item.get("situacaoCompraNome").cloned().unwrap_or(Value::Null),
            "urls": urls,
            "force_fetch": false,
            "source_payload": item,
        }))
    }

    /// One full sweep over every configured modality.
    pub async fn fetch_once(&self) {
        let (start, end) = self.date_range();
        let mut total_items = 0usize;

        for modalidade_id in &self.config.modalidade_ids {
            let mut page = 1usize;
            while page <= self.config.max_pages {
                let url = self.listing_url(modalidade_id, page, &start, &end);
                info!(modalidade = %modalidade_id, page, "crawling listing page");
                let data = match self.client.get(&url).send().await {
                    Ok(resp) => resp.json::<Value>().await.unwrap_or(Value::Null),
                    Err(e) => {
                        warn!(error = %e, backoff_s = self.config.backoff_s, "listing fetch failed");
                        self.metrics.incr("crawler.batch_error_total").await;
                        tokio::time::sleep(std::time::Duration::from_secs_f64(self.config.backoff_s))
                            .await;
                        break;
                    }
                };
                let items = data
                    .get("data")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                if items.is_empty() {
                    break;
                }
                self.metrics.incr("crawler.batch_ok_total").await;
                for item in &items {
                    let Some(payload) = Self::map_item(item) else {
                        continue;
                    };
                    self.metrics.incr("crawler.items_total").await;
                    match ingest_tender(
                        &self.client,
                        &self.config.core_api_url,
                        self.config.core_api_key.as_deref(),
                        &payload,
                    )
                    .await
                    {
                        Ok(()) => {
                            self.metrics.incr("crawler.ingest_ok_total").await;
                            total_items += 1;
                        }
                        Err(e) => {
                            warn!(id_pncp = ?payload.get("id_pncp"), error = %e, "ingest failed");
                            self.metrics.incr("crawler.ingest_error_total").await;
                        }
                    }
                    if total_items >= self.config.max_items {
                        info!(total_items, "crawler item cap reached");
                        return;
                    }
                }
                page += 1;
                tokio::time::sleep(std::time::Duration::from_secs_f64(self.config.sleep_s)).await;
            }
        }
        info!(total_items, "crawler sweep done");
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(base = %self.config.base_url, "pncp crawler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.fetch_once().await;
            let sleep = tokio::time::sleep(std::time::Duration::from_secs_f64(self.config.poll_s));
            tokio::select! {
                _ = sleep => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("pncp crawler stopped");
    }
}

/// compras.dados.gov.br listing crawler. Pagination follows the `next`
/// hypermedia link instead of page numbers; each list item is enriched with
/// its detail record before ingest.
pub struct ComprasCrawler {
    config: ComprasConfig,
    client: reqwest::Client,
    metrics: MetricsSink,
}

impl ComprasCrawler {
    pub fn new(config: ComprasConfig, metrics: MetricsSink) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build crawler http client");
        Self {
            config,
            client,
            metrics,
        }
    }

    fn date_range(&self) -> (String, String) {
        match (&self.config.data_inicial, &self.config.data_final) {
            (Some(start), Some(end)) => (start.clone(), end.clone()),
            _ => {
                let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
                (today.clone(), today)
            }
        }
    }

    fn list_url(&self) -> String {
        let (start, end) = self.date_range();
        let mut params: Vec<(String, String)> = Vec::new();
        if !self.config.date_field.is_empty() {
            params.push((format!("{}_min", self.config.date_field), start));
            params.push((format!("{}_max", self.config.date_field), end));
        }
        if let Some(ref uasg) = self.config.uasg {
            params.push(("uasg".to_string(), uasg.clone()));
        }
        if params.is_empty() {
            return format!("{}{}", self.config.api_base, self.config.list_path);
        }
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        format!("{}{}?{}", self.config.api_base, self.config.list_path, query)
    }

    /// Listing items hide under `_embedded` in the hypermedia shape or at
    /// the top level in older responses.
    pub fn get_items(payload: &Value) -> Vec<Value> {
        if let Some(embedded) = payload.get("_embedded").and_then(|v| v.as_object()) {
            for key in ["licitacoes", "licitacao", "items"] {
                if let Some(items) = embedded.get(key).and_then(|v| v.as_array()) {
                    return items.clone();
                }
            }
        }
        for key in ["licitacoes", "items", "licitacao"] {
            if let Some(items) = payload.get(key).and_then(|v| v.as_array()) {
                return items.clone();
            }
        }
        Vec::new()
    }

    /// `_links.next` (or `proximo`), as an href object or a bare string.
    pub fn next_link(payload: &Value) -> Option<String> {
        let links = payload
            .get("_links")
            .or_else(|| payload.get("links"))?
            .as_object()?;
        let next = links.get("next").or_else(|| links.get("proximo"))?;
        match next {
            Value::Object(obj) => obj
                .get("href")
                .and_then(|v| v.as_str())
                .map(String::from)
                .filter(|s| !s.is_empty()),
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    pub fn normalize_id(item: &Value) -> Option<String> {
        for key in ["identificador", "id", "numero_processo", "numero_aviso"] {
            match item.get(key) {
                Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
                Some(Value::Number(n)) => return Some(n.to_string()),
                _ => {}
            }
        }
        None
    }

    /// Merge the detail record over the list item into the ingest payload.
    pub fn map_tender(config: &ComprasConfig, detail: &Value, fallback: &Value, ident: &str) -> Value {
        let field = |key: &str| {
            detail
                .get(key)
                .filter(|v| !v.is_null())
                .or_else(|| fallback.get(key).filter(|v| !v.is_null()))
                .cloned()
        };
        let objeto = field("objeto").and_then(|v| v.as_str().map(String::from));
        let data_pub = field("data_publicacao").unwrap_or(Value::Null);
        let modalidade = field("modalidade").map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        });
        let uasg = field("uasg").map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        });
        let status = field("situacao_aviso").unwrap_or(Value::Null);
        let url_html = format!("{}/licitacoes/id/licitacao/{}.html", config.api_base, ident);
        let url_json = format!("{}/licitacoes/id/licitacao/{}.json", config.api_base, ident);

        json!({
            "id_pncp": format!("compras:{}", ident),
            "source": "compras",
            "source_id": ident,
            "orgao": uasg.map(|u| format!("UASG {}", u)),
            "municipio": Value::Null,
            "uf": Value::Null,
            "modalidade": modalidade,
            "objeto": objeto.filter(|o| !o.is_empty()),
            "data_publicacao": data_pub,
            "status": status,
            "urls": {
                "compras": url_html.clone(),
                "api": url_json,
                "url": url_html,
            },
            "force_fetch": false,
            "source_payload": {"list_item": fallback, "detail": detail},
        })
    }

    async fn get_json(&self, url: &str) -> Option<Value> {
        let resp = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .ok()?;
        resp.json::<Value>().await.ok()
    }

    /// One sweep following `next` links; returns the item count.
    pub async fn fetch_once(&self) -> Result<usize, String> {
        let mut url = Some(self.list_url());
        let mut pages = 0usize;
        let mut total = 0usize;

        while let Some(page_url) = url {
            if pages >= self.config.max_pages || total >= self.config.max_items {
                break;
            }
            info!(page = pages + 1, "crawling compras listing page");
            let payload = match self.get_json(&page_url).await {
                Some(payload) => payload,
                None => return Err(format!("listing fetch failed: {}", page_url)),
            };
            let items = Self::get_items(&payload);
            if items.is_empty() {
                break;
            }
            for item in &items {
                let Some(ident) = Self::normalize_id(item) else {
                    continue;
                };
                let detail_url = format!(
                    "{}{}",
                    self.config.api_base,
                    self.config.detail_path.replace("{id}", &ident)
                );
                let detail = self.get_json(&detail_url).await.unwrap_or(Value::Null);
                let tender = Self::map_tender(&self.config, &detail, item, &ident);
                match ingest_tender(
                    &self.client,
                    &self.config.core_api_url,
                    self.config.core_api_key.as_deref(),
                    &tender,
                )
                .await
                {
                    Ok(()) => {
                        self.metrics
                            .incr("worker.compras_fetch.ingest_ok_total")
                            .await;
                    }
                    Err(e) => {
                        warn!(id = %ident, error = %e, "compras ingest failed");
                        self.metrics
                            .incr("worker.compras_fetch.ingest_error_total")
                            .await;
                    }
                }
                total += 1;
                if total >= self.config.max_items {
                    break;
                }
            }
            pages += 1;
            url = Self::next_link(&payload).map(|next| {
                if next.starts_with('/') {
                    format!("{}{}", self.config.api_base, next)
                } else {
                    next
                }
            });
        }
        Ok(total)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(base = %self.config.api_base, "compras crawler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.fetch_once().await {
                Ok(processed) => {
                    self.metrics.incr("worker.compras_fetch.batch_ok_total").await;
                    if processed > 0 {
                        self.metrics
                            .incr_by("worker.compras_fetch.items_total", processed as i64)
                            .await;
                    }
                    info!(processed, "compras sweep done");
                }
                Err(e) => {
                    warn!(error = %e, "compras sweep failed");
                    self.metrics
                        .incr("worker.compras_fetch.batch_error_total")
                        .await;
                }
            }
            let sleep = tokio::time::sleep(std::time::Duration::from_secs_f64(self.config.poll_s));
            tokio::select! {
                _ = sleep => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("compras crawler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_item_builds_ingest_payload() {
        let item = json!({
            "numeroControlePNCP": "12345678000199-1-000042/2024",
            "orgaoEntidade": {"razaoSocial": "Prefeitura de Campinas"},
            "unidadeOrgao": {"municipioNome": "Campinas", "ufSigla": "SP"},
            "modalidadeNome": "Pregão Eletrônico",
            "objetoCompra": "Serviços de limpeza",
            "informacaoComplementar": "urgente",
            "dataPublicacaoPncp": "2024-05-01T00:00:00",
            "situacaoCompraNome": "Divulgada",
            "linkSistemaOrigem": "https://example.gov.br/x",
        });
        let mapped = PncpCrawler::map_item(&item).unwrap();
        assert_eq!(mapped["id_pncp"], "12345678000199-1-000042/2024");
        assert_eq!(mapped["source"], "pncp");
        assert_eq!(mapped["uf"], "SP");
        assert_eq!(mapped["objeto"], "Serviços de limpeza | urgente");
        assert!(mapped["urls"]["pncp"].as_str().unwrap().contains("pncp.gov.br"));
        assert_eq!(mapped["urls"]["sistema_origem"], "https://example.gov.br/x");
        assert_eq!(mapped["source_payload"], item);
    }

    #[test]
    fn map_item_requires_control_number() {
        assert!(PncpCrawler::map_item(&json!({"objetoCompra": "x"})).is_none());
    }

    #[test]
    fn compras_items_found_in_embedded_or_top_level() {
        let embedded = json!({"_embedded": {"licitacoes": [{"id": 1}, {"id": 2}]}});
        assert_eq!(ComprasCrawler::get_items(&embedded).len(), 2);
        let top = json!({"items": [{"id": 3}]});
        assert_eq!(ComprasCrawler::get_items(&top).len(), 1);
        assert!(ComprasCrawler::get_items(&json!({})).is_empty());
    }

    #[test]
    fn compras_next_link_shapes() {
        let href = json!({"_links": {"next": {"href": "/licitacoes/v1/licitacoes.json?offset=500"}}});
        assert_eq!(
            ComprasCrawler::next_link(&href).as_deref(),
            Some("/licitacoes/v1/licitacoes.json?offset=500")
        );
        let bare = json!({"links": {"proximo": "https://compras.dados.gov.br/x?offset=500"}});
        assert_eq!(
            ComprasCrawler::next_link(&bare).as_deref(),
            Some("https://compras.dados.gov.br/x?offset=500")
        );
        assert_eq!(ComprasCrawler::next_link(&json!({"_links": {}})), None);
        assert_eq!(ComprasCrawler::next_link(&json!({})), None);
    }

    #[test]
    fn compras_id_fallback_chain() {
        assert_eq!(
            ComprasCrawler::normalize_id(&json!({"identificador": "abc123"})).as_deref(),
            Some("abc123")
        );
        assert_eq!(
            ComprasCrawler::normalize_id(&json!({"numero_aviso": 42})).as_deref(),
            Some("42")
        );
        assert_eq!(ComprasCrawler::normalize_id(&json!({})), None);
    }

    #[test]
    fn compras_map_tender_merges_detail_over_list_item() {
        let config = ComprasConfig {
            api_base: "https://compras.dados.gov.br".to_string(),
            list_path: "/licitacoes/v1/licitacoes.json".to_string(),
            detail_path: "/licitacoes/id/licitacao/{id}.json".to_string(),
            poll_s: 3600.0,
            max_pages: 10,
            max_items: 500,
            date_field: "data_abertura_proposta".to_string(),
            data_inicial: None,
            data_final: None,
            uasg: None,
            core_api_url: "http://127.0.0.1:8080".to_string(),
            core_api_key: None,
        };
        let list_item = json!({"objeto": "objeto da lista", "uasg": 153173});
        let detail = json!({"objeto": "objeto detalhado", "situacao_aviso": "Publicado"});
        let tender = ComprasCrawler::map_tender(&config, &detail, &list_item, "97658");

        assert_eq!(tender["id_pncp"], "compras:97658");
        assert_eq!(tender["source"], "compras");
        assert_eq!(tender["objeto"], "objeto detalhado");
        assert_eq!(tender["orgao"], "UASG 153173");
        assert_eq!(tender["status"], "Publicado");
        assert_eq!(
            tender["urls"]["compras"],
            "https://compras.dados.gov.br/licitacoes/id/licitacao/97658.html"
        );
        assert_eq!(tender["urls"]["url"], tender["urls"]["compras"]);
        assert_eq!(tender["source_payload"]["list_item"], list_item);
        assert_eq!(tender["source_payload"]["detail"], detail);
    }
}
