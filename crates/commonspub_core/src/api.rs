use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::blocking::multipart::Form;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{EndpointSection, PublishConfig};

/// Read surface the resolver needs from Wikimedia Commons, plus the write
/// surface the executor drives. Tests substitute mock implementations.
pub trait CommonsApi {
    fn category_exists(&mut self, name: &str) -> Result<bool>;
    fn category_wikitext(&mut self, name: &str) -> Result<Option<String>>;
    fn create_category(
        &mut self,
        name: &str,
        wikitext: &str,
        summary: &str,
    ) -> Result<CreateCategoryOutcome>;
    fn upload_file(&mut self, request: &UploadRequest) -> Result<UploadOutcome>;
    fn edit_file_page(&mut self, filename: &str, wikitext: &str, summary: &str) -> Result<()>;
    /// Submit a prepared wbeditentity payload against the `M<pageId>`
    /// media-info entity of an uploaded file.
    fn edit_media_info(&mut self, page_id: u64, data: &Value) -> Result<()>;
    fn request_count(&self) -> usize;
}

pub trait WikidataApi {
    fn get_entity(&mut self, qid: &str) -> Result<Option<EntityInfo>>;
    fn find_entity_by_label(&mut self, label: &str, language: &str) -> Result<Option<String>>;
    /// Creates a new item from a prepared wbeditentity payload; returns the
    /// assigned Q-ID.
    fn create_entity(&mut self, data: &Value) -> Result<String>;
    fn create_claim(&mut self, entity_id: &str, property: &str, value: &Value) -> Result<()>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCategoryOutcome {
    pub success: bool,
    pub existed: bool,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub file_path: PathBuf,
    pub wikitext: String,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub page_id: u64,
}

/// Entity data reduced to what resolution needs: a label and claim values
/// flattened to strings (item references become bare Q-IDs).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub qid: String,
    pub label: Option<String>,
    pub claims: BTreeMap<String, Vec<String>>,
}

impl EntityInfo {
    pub fn first_claim(&self, property: &str) -> Option<&str> {
        self.claims
            .get(property)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn for_commons(config: &PublishConfig) -> Self {
        Self::with_endpoint(config.commons_api_url(), &config.commons, config)
    }

    pub fn for_wikidata(config: &PublishConfig) -> Self {
        Self::with_endpoint(config.wikidata_api_url(), &config.wikidata, config)
    }

    fn with_endpoint(api_url: String, section: &EndpointSection, config: &PublishConfig) -> Self {
        Self {
            api_url,
            user_agent: config.user_agent(section),
            timeout_ms: env_value_u64("WIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("WIKI_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_value_u64("WIKI_RATE_LIMIT_WRITE", 1_000),
            max_retries: env_value_usize("WIKI_HTTP_RETRIES", 2),
            max_write_retries: env_value_usize("WIKI_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_value_u64("WIKI_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

enum Payload<'a> {
    Query(&'a [(&'a str, String)]),
    Form(&'a [(&'a str, String)]),
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;
        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
        })
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let token_response = self.request_json(
            Payload::Query(&[
                ("action", "query".to_string()),
                ("meta", "tokens".to_string()),
                ("type", "login".to_string()),
            ]),
            false,
        )?;
        let login_token = token_response
            .pointer("/query/tokens/logintoken")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let response = self.request_json(
            Payload::Form(&[
                ("action", "login".to_string()),
                ("lgname", username.to_string()),
                ("lgpassword", password.to_string()),
                ("lgtoken", login_token),
            ]),
            true,
        )?;
        match response.pointer("/login/result").and_then(Value::as_str) {
            Some("Success") => {
                self.csrf_token = None;
                Ok(())
            }
            other => bail!(
                "MediaWiki login failed: {}",
                response
                    .pointer("/login/reason")
                    .and_then(Value::as_str)
                    .or(other)
                    .unwrap_or("unknown error")
            ),
        }
    }

    fn ensure_csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.request_json(
            Payload::Query(&[
                ("action", "query".to_string()),
                ("meta", "tokens".to_string()),
            ]),
            false,
        )?;
        let token = response
            .pointer("/query/tokens/csrftoken")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki csrf token"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    fn request_json(&mut self, payload: Payload<'_>, is_write: bool) -> Result<Value> {
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };
        let pairs = match &payload {
            Payload::Query(params) | Payload::Form(params) => with_format_params(params),
        };

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let request = match &payload {
                Payload::Query(_) => self.client.get(&self.config.api_url).query(&pairs),
                Payload::Form(_) => self.client.post(&self.config.api_url).form(&pairs),
            };
            let response = request
                .header("User-Agent", self.config.user_agent.clone())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }
                    let body: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    if let Some(error) = body.get("error") {
                        let code = error
                            .get("code")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown_error");
                        let info = error
                            .get("info")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown info");
                        bail!("MediaWiki API error [{code}]: {info}");
                    }
                    return Ok(body);
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn request_multipart(&mut self, form: Form) -> Result<Value> {
        self.apply_rate_limit(true);
        let response = self
            .client
            .post(&self.config.api_url)
            .header("User-Agent", self.config.user_agent.clone())
            .multipart(form)
            .send()
            .context("failed to call MediaWiki upload API")?;
        let status = response.status();
        if !status.is_success() {
            bail!("MediaWiki upload failed with HTTP {status}");
        }
        let body: Value = response
            .json()
            .context("failed to decode MediaWiki upload response")?;
        if let Some(error) = body.get("error") {
            let code = error
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            let info = error
                .get("info")
                .and_then(Value::as_str)
                .unwrap_or("unknown info");
            bail!("MediaWiki API error [{code}]: {info}");
        }
        Ok(body)
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }

    fn page_id_for_title(&mut self, title: &str) -> Result<Option<u64>> {
        let response = self.request_json(
            Payload::Query(&[
                ("action", "query".to_string()),
                ("titles", title.to_string()),
            ]),
            false,
        )?;
        let parsed: QueryResponse =
            serde_json::from_value(response).context("failed to decode page query response")?;
        let page = match parsed.query.pages.first() {
            Some(page) => page,
            None => return Ok(None),
        };
        if page.missing.unwrap_or(false) {
            return Ok(None);
        }
        Ok(page.pageid.and_then(|id| u64::try_from(id).ok()))
    }
}

impl CommonsApi for MediaWikiClient {
    fn category_exists(&mut self, name: &str) -> Result<bool> {
        let response = self.request_json(
            Payload::Query(&[
                ("action", "query".to_string()),
                ("titles", category_title(name)),
            ]),
            false,
        )?;
        let parsed: QueryResponse =
            serde_json::from_value(response).context("failed to decode category query")?;
        let exists = parsed
            .query
            .pages
            .first()
            .map(|page| !page.missing.unwrap_or(false))
            .unwrap_or(false);
        Ok(exists)
    }

    fn category_wikitext(&mut self, name: &str) -> Result<Option<String>> {
        let response = self.request_json(
            Payload::Query(&[
                ("action", "query".to_string()),
                ("titles", category_title(name)),
                ("prop", "revisions".to_string()),
                ("rvprop", "content".to_string()),
                ("rvslots", "main".to_string()),
            ]),
            false,
        )?;
        let content = response
            .pointer("/query/pages/0/revisions/0/slots/main/content")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        Ok(content)
    }

    fn create_category(
        &mut self,
        name: &str,
        wikitext: &str,
        summary: &str,
    ) -> Result<CreateCategoryOutcome> {
        let token = self.ensure_csrf_token()?;
        let response = self.request_json(
            Payload::Form(&[
                ("action", "edit".to_string()),
                ("title", category_title(name)),
                ("text", wikitext.to_string()),
                ("summary", summary.to_string()),
                ("createonly", "1".to_string()),
                ("bot", "1".to_string()),
                ("token", token),
            ]),
            true,
        );
        match response {
            Ok(body) => {
                let result = body.pointer("/edit/result").and_then(Value::as_str);
                if result != Some("Success") {
                    bail!(
                        "category creation failed for {}: {}",
                        name,
                        result.unwrap_or("unknown")
                    );
                }
                Ok(CreateCategoryOutcome {
                    success: true,
                    existed: false,
                })
            }
            Err(error) => {
                if error.to_string().contains("articleexists") {
                    return Ok(CreateCategoryOutcome {
                        success: true,
                        existed: true,
                    });
                }
                Err(error)
            }
        }
    }

    fn upload_file(&mut self, request: &UploadRequest) -> Result<UploadOutcome> {
        let token = self.ensure_csrf_token()?;
        let form = Form::new()
            .text("action", "upload")
            .text("format", "json")
            .text("formatversion", "2")
            .text("filename", request.filename.clone())
            .text("text", request.wikitext.clone())
            .text("comment", request.comment.clone())
            .text("ignorewarnings", "1")
            .text("token", token)
            .file("file", &request.file_path)
            .with_context(|| format!("failed to read {}", request.file_path.display()))?;
        let body = self.request_multipart(form)?;
        let result = body.pointer("/upload/result").and_then(Value::as_str);
        if result != Some("Success") {
            bail!(
                "upload failed for {}: {}",
                request.filename,
                result.unwrap_or("unknown")
            );
        }

        let title = file_title(&request.filename);
        let page_id = self
            .page_id_for_title(&title)?
            .ok_or_else(|| anyhow::anyhow!("uploaded page not found: {title}"))?;
        Ok(UploadOutcome { page_id })
    }

    fn edit_file_page(&mut self, filename: &str, wikitext: &str, summary: &str) -> Result<()> {
        let token = self.ensure_csrf_token()?;
        let response = self.request_json(
            Payload::Form(&[
                ("action", "edit".to_string()),
                ("title", file_title(filename)),
                ("text", wikitext.to_string()),
                ("summary", summary.to_string()),
                ("bot", "1".to_string()),
                ("token", token),
            ]),
            true,
        )?;
        if response.pointer("/edit/result").and_then(Value::as_str) != Some("Success") {
            bail!("page edit failed for {filename}");
        }
        Ok(())
    }

    fn edit_media_info(&mut self, page_id: u64, data: &Value) -> Result<()> {
        let token = self.ensure_csrf_token()?;
        let response = self.request_json(
            Payload::Form(&[
                ("action", "wbeditentity".to_string()),
                ("id", format!("M{page_id}")),
                ("data", serde_json::to_string(data).context("failed to encode media-info data")?),
                ("token", token),
            ]),
            true,
        )?;
        if response.get("success").and_then(Value::as_i64) != Some(1) {
            bail!("media-info edit failed for M{page_id}");
        }
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl WikidataApi for MediaWikiClient {
    fn get_entity(&mut self, qid: &str) -> Result<Option<EntityInfo>> {
        let response = self.request_json(
            Payload::Query(&[
                ("action", "wbgetentities".to_string()),
                ("ids", qid.to_string()),
                ("props", "labels|claims".to_string()),
                ("languages", "en".to_string()),
            ]),
            false,
        )?;
        let Some(entity) = response.pointer(&format!("/entities/{qid}")) else {
            return Ok(None);
        };
        if entity.get("missing").is_some() {
            return Ok(None);
        }
        Ok(Some(parse_entity(qid, entity)))
    }

    fn find_entity_by_label(&mut self, label: &str, language: &str) -> Result<Option<String>> {
        let response = self.request_json(
            Payload::Query(&[
                ("action", "wbsearchentities".to_string()),
                ("search", label.to_string()),
                ("language", language.to_string()),
                ("type", "item".to_string()),
                ("limit", "5".to_string()),
            ]),
            false,
        )?;
        let hits = response
            .get("search")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for hit in &hits {
            let hit_label = hit.get("label").and_then(Value::as_str).unwrap_or("");
            if hit_label.eq_ignore_ascii_case(label)
                && let Some(id) = hit.get("id").and_then(Value::as_str)
            {
                return Ok(Some(id.to_string()));
            }
        }
        Ok(None)
    }

    fn create_entity(&mut self, data: &Value) -> Result<String> {
        let token = self.ensure_csrf_token()?;
        let response = self.request_json(
            Payload::Form(&[
                ("action", "wbeditentity".to_string()),
                ("new", "item".to_string()),
                ("data", serde_json::to_string(data).context("failed to encode entity data")?),
                ("token", token),
            ]),
            true,
        )?;
        response
            .pointer("/entity/id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("entity creation returned no id"))
    }

    fn create_claim(&mut self, entity_id: &str, property: &str, value: &Value) -> Result<()> {
        let token = self.ensure_csrf_token()?;
        let response = self.request_json(
            Payload::Form(&[
                ("action", "wbcreateclaim".to_string()),
                ("entity", entity_id.to_string()),
                ("property", property.to_string()),
                ("snaktype", "value".to_string()),
                ("value", serde_json::to_string(value).context("failed to encode claim value")?),
                ("token", token),
            ]),
            true,
        )?;
        if response.get("success").and_then(Value::as_i64) != Some(1) {
            bail!("claim creation failed for {entity_id} {property}");
        }
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn parse_entity(qid: &str, entity: &Value) -> EntityInfo {
    let label = entity
        .pointer("/labels/en/value")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let mut claims: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(claim_map) = entity.get("claims").and_then(Value::as_object) {
        for (property, statements) in claim_map {
            let Some(statements) = statements.as_array() else {
                continue;
            };
            let mut values = Vec::new();
            for statement in statements {
                let datavalue = statement.pointer("/mainsnak/datavalue");
                let Some(datavalue) = datavalue else {
                    continue;
                };
                match datavalue.get("type").and_then(Value::as_str) {
                    Some("string") => {
                        if let Some(text) = datavalue.get("value").and_then(Value::as_str) {
                            values.push(text.to_string());
                        }
                    }
                    Some("wikibase-entityid") => {
                        if let Some(id) = datavalue.pointer("/value/id").and_then(Value::as_str) {
                            values.push(id.to_string());
                        }
                    }
                    Some("time") => {
                        if let Some(time) = datavalue.pointer("/value/time").and_then(Value::as_str)
                        {
                            values.push(time.to_string());
                        }
                    }
                    _ => {}
                }
            }
            if !values.is_empty() {
                claims.insert(property.clone(), values);
            }
        }
    }
    EntityInfo {
        qid: qid.to_string(),
        label,
        claims,
    }
}

fn with_format_params(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        if !value.is_empty() {
            pairs.push(((*key).to_string(), value.clone()));
        }
    }
    pairs
}

pub fn category_title(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.starts_with("Category:") {
        trimmed.to_string()
    } else {
        format!("Category:{trimmed}")
    }
}

pub fn file_title(filename: &str) -> String {
    let trimmed = filename.trim();
    if trimmed.starts_with("File:") {
        trimmed.to_string()
    } else {
        format!("File:{trimmed}")
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    pageid: Option<i64>,
    missing: Option<bool>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{EntityInfo, category_title, file_title, parse_entity};

    #[test]
    fn title_helpers_add_namespace_once() {
        assert_eq!(category_title("Players of Arsenal"), "Category:Players of Arsenal");
        assert_eq!(category_title("Category:Already"), "Category:Already");
        assert_eq!(file_title("Band_2025_01.jpg"), "File:Band_2025_01.jpg");
        assert_eq!(file_title("File:Band_2025_01.jpg"), "File:Band_2025_01.jpg");
    }

    #[test]
    fn parse_entity_flattens_claim_values() {
        let entity = json!({
            "labels": {"en": {"language": "en", "value": "Douglas Adams"}},
            "claims": {
                "P373": [{"mainsnak": {"datavalue": {"type": "string", "value": "Douglas Adams"}}}],
                "P106": [
                    {"mainsnak": {"datavalue": {"type": "wikibase-entityid", "value": {"id": "Q36180"}}}},
                    {"mainsnak": {"datavalue": {"type": "wikibase-entityid", "value": {"id": "Q177220"}}}}
                ],
                "P569": [{"mainsnak": {"datavalue": {"type": "time", "value": {"time": "+1952-03-11T00:00:00Z"}}}}],
                "P18": [{"mainsnak": {"snaktype": "novalue"}}]
            }
        });
        let parsed = parse_entity("Q42", &entity);
        assert_eq!(parsed.label.as_deref(), Some("Douglas Adams"));
        assert_eq!(parsed.first_claim("P373"), Some("Douglas Adams"));
        assert_eq!(
            parsed.claims.get("P106"),
            Some(&vec!["Q36180".to_string(), "Q177220".to_string()])
        );
        assert_eq!(parsed.first_claim("P569"), Some("+1952-03-11T00:00:00Z"));
        assert!(parsed.claims.get("P18").is_none());
    }

    #[test]
    fn first_claim_returns_none_for_absent_property() {
        let info = EntityInfo::default();
        assert_eq!(info.first_claim("P373"), None);
    }
}
