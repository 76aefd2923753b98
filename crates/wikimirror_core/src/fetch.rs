use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::MirrorConfig;
use crate::title::{NS_SPECIAL, slugify};

/// Parsed page as the wiki serves it, before any local transformation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteContent {
    pub title: String,
    pub page_id: Option<i64>,
    pub namespace: i32,
    pub html: String,
    pub categories: Vec<String>,
    pub images: Vec<String>,
    pub created_at: Option<String>,
    pub modified_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backlink {
    pub title: String,
    pub slug: String,
}

impl Backlink {
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            slug: slugify(&title),
            title,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedPage {
    pub content: Option<RemoteContent>,
    pub backlinks: Option<Vec<Backlink>>,
    pub redirect_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryMember {
    pub title: String,
    pub page_id: i64,
    pub timestamp: Option<String>,
}

/// Read side of the source wiki.
#[async_trait]
pub trait WikiSource: Send + Sync {
    /// `content` is `None` when the page does not exist upstream.
    async fn fetch_page(&self, title: &str) -> Result<FetchedPage>;
    async fn fetch_category_members(&self, category: &str) -> Result<Vec<CategoryMember>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub concurrency: usize,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &MirrorConfig) -> Result<Self> {
        let Some(api_url) = config.api_url() else {
            bail!("wiki API URL is not configured");
        };
        Ok(Self {
            api_url: api_url.to_string(),
            user_agent: config.user_agent(),
            timeout_ms: config.wiki.timeout_ms,
            connect_timeout_ms: config.wiki.connect_timeout_ms,
            max_retries: config.wiki.max_retries,
            retry_delay_ms: config.wiki.retry_delay_ms,
            concurrency: config.mirror.fetch_concurrency.max(1),
        })
    }
}

pub struct MediaWikiClient {
    client: Client,
    base_url: Url,
    config: MediaWikiClientConfig,
    permits: Semaphore,
    request_count: AtomicUsize,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.api_url)
            .with_context(|| format!("invalid wiki API URL: {}", config.api_url))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            base_url,
            permits: Semaphore::new(config.concurrency.max(1)),
            config,
            request_count: AtomicUsize::new(0),
        })
    }

    /// GET against api.php. API errors bail unless their code is in `tolerated`,
    /// in which case the payload is returned for the caller to inspect.
    async fn request_json_get(
        &self,
        params: &[(&str, String)],
        tolerated: &[&str],
    ) -> Result<Value> {
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .context("fetch limiter closed")?;
        for attempt in 0..=self.config.max_retries {
            self.request_count.fetch_add(1, Ordering::Relaxed);
            let response = self
                .client
                .get(self.base_url.clone())
                .query(&pairs)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt).await;
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .await
                        .context("failed to decode MediaWiki API JSON response")?;
                    if let Some(error) = payload.get("error") {
                        let code = error
                            .get("code")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown_error");
                        if tolerated.contains(&code) {
                            return Ok(payload);
                        }
                        let info = error
                            .get("info")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown info");
                        bail!("MediaWiki API error [{code}]: {info}");
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt).await;
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    async fn wait_before_retry(&self, attempt: usize) {
        let base = backoff_ms(self.config.retry_delay_ms, attempt);
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(base.saturating_add(jitter))).await;
    }

    async fn query_page_info(&self, title: &str) -> Result<PageInfoResponse> {
        let params = [
            ("action", "query".to_string()),
            ("titles", title.to_string()),
            ("redirects", "1".to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "timestamp".to_string()),
            ("list", "backlinks".to_string()),
            ("bltitle", title.to_string()),
            ("blnamespace", "0".to_string()),
            ("bllimit", "500".to_string()),
        ];
        let response = self.request_json_get(&params, &[]).await?;
        serde_json::from_value(response).context("failed to decode page info API response")
    }

    async fn query_created_at(&self, title: &str) -> Result<Option<String>> {
        let params = [
            ("action", "query".to_string()),
            ("titles", title.to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "timestamp".to_string()),
            ("rvdir", "newer".to_string()),
            ("rvlimit", "1".to_string()),
        ];
        let response = self.request_json_get(&params, &[]).await?;
        let parsed: PageInfoResponse = serde_json::from_value(response)
            .context("failed to decode revision API response")?;
        Ok(parsed
            .query
            .pages
            .into_iter()
            .next()
            .and_then(|page| page.revisions.into_iter().next())
            .map(|revision| revision.timestamp))
    }

    async fn parse_page(&self, title: &str) -> Result<Option<ParsePayload>> {
        let params = [
            ("action", "parse".to_string()),
            ("page", title.to_string()),
            ("prop", "text|categories|images".to_string()),
            ("redirects", "1".to_string()),
            ("disableeditsection", "1".to_string()),
        ];
        let response = self
            .request_json_get(&params, &["missingtitle", "invalidtitle"])
            .await?;
        if response.get("error").is_some() {
            return Ok(None);
        }
        let parsed: ParseResponse =
            serde_json::from_value(response).context("failed to decode parse API response")?;
        Ok(Some(parsed.parse))
    }
}

#[async_trait]
impl WikiSource for MediaWikiClient {
    async fn fetch_page(&self, title: &str) -> Result<FetchedPage> {
        let info = self.query_page_info(title).await?;
        let redirect_target = info.query.redirects.into_iter().next().map(|redirect| redirect.to);
        let backlinks = info
            .query
            .backlinks
            .into_iter()
            .map(|item| Backlink::new(item.title))
            .collect::<Vec<_>>();

        let Some(page) = info.query.pages.into_iter().next() else {
            return Ok(FetchedPage::default());
        };
        if page.missing.unwrap_or(false) || page.invalid.unwrap_or(false) || page.ns == NS_SPECIAL
        {
            debug!(title = %title, "page not present upstream");
            return Ok(FetchedPage {
                content: None,
                backlinks: Some(backlinks),
                redirect_target,
            });
        }

        let Some(parsed) = self.parse_page(&page.title).await? else {
            return Ok(FetchedPage {
                content: None,
                backlinks: Some(backlinks),
                redirect_target,
            });
        };
        let created_at = self.query_created_at(&page.title).await?;
        let modified_at = page.revisions.into_iter().next().map(|rev| rev.timestamp);

        Ok(FetchedPage {
            content: Some(RemoteContent {
                title: page.title,
                page_id: page.pageid.or(parsed.pageid),
                namespace: page.ns,
                html: parsed.text,
                categories: parsed
                    .categories
                    .into_iter()
                    .filter(|category| !category.hidden)
                    .map(|category| category.category.replace('_', " "))
                    .collect(),
                images: parsed.images,
                created_at,
                modified_at,
            }),
            backlinks: Some(backlinks),
            redirect_target,
        })
    }

    async fn fetch_category_members(&self, category: &str) -> Result<Vec<CategoryMember>> {
        let mut members = Vec::new();
        let mut continue_token: Option<String> = None;
        let category_title = if category.starts_with("Category:") {
            category.to_string()
        } else {
            format!("Category:{category}")
        };

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("list", "categorymembers".to_string()),
                ("cmtitle", category_title.clone()),
                ("cmtype", "page".to_string()),
                ("cmprop", "ids|title|timestamp".to_string()),
                ("cmlimit", "500".to_string()),
            ];
            if let Some(token) = &continue_token {
                params.push(("cmcontinue", token.clone()));
            }

            let response = self.request_json_get(&params, &[]).await?;
            let parsed: CategoryMembersResponse = serde_json::from_value(response)
                .context("failed to decode categorymembers API response")?;
            for item in parsed.query.categorymembers {
                members.push(CategoryMember {
                    title: item.title,
                    page_id: item.pageid,
                    timestamp: item.timestamp,
                });
            }

            continue_token = parsed.continuation.and_then(|cont| cont.cmcontinue);
            if continue_token.is_none() {
                break;
            }
        }

        Ok(members)
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
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

#[derive(Debug, Deserialize, Default)]
struct PageInfoResponse {
    #[serde(default)]
    query: PageInfoPayload,
}

#[derive(Debug, Deserialize, Default)]
struct PageInfoPayload {
    #[serde(default)]
    pages: Vec<PageQueryItem>,
    #[serde(default)]
    backlinks: Vec<TitleQueryItem>,
    #[serde(default)]
    redirects: Vec<RedirectItem>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    pageid: Option<i64>,
    #[serde(default)]
    ns: i32,
    title: String,
    missing: Option<bool>,
    invalid: Option<bool>,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct TitleQueryItem {
    title: String,
}

#[derive(Debug, Deserialize)]
struct RedirectItem {
    to: String,
}

#[derive(Debug, Deserialize)]
struct ParseResponse {
    parse: ParsePayload,
}

#[derive(Debug, Deserialize)]
struct ParsePayload {
    pageid: Option<i64>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    categories: Vec<ParseCategory>,
    #[serde(default)]
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ParseCategory {
    category: String,
    #[serde(default)]
    hidden: bool,
}

#[derive(Debug, Deserialize, Default)]
struct CategoryMembersResponse {
    #[serde(default)]
    query: CategoryMembersPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct CategoryMembersPayload {
    #[serde(default)]
    categorymembers: Vec<CategoryMemberItem>,
}

#[derive(Debug, Deserialize)]
struct CategoryMemberItem {
    pageid: i64,
    title: String,
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    cmcontinue: Option<String>,
}

/// Exponential backoff before jitter, doubling per attempt up to 256x.
fn backoff_ms(retry_delay_ms: u64, attempt: usize) -> u64 {
    let exponent = u32::try_from(attempt).unwrap_or(8).min(8);
    let scale = 1u64.checked_shl(exponent).unwrap_or(256);
    retry_delay_ms.saturating_mul(scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_requires_api_url() {
        let error = MediaWikiClientConfig::from_config(&MirrorConfig::default())
            .expect_err("missing api url");
        assert!(error.to_string().contains("not configured"));
    }

    #[test]
    fn client_rejects_invalid_api_url() {
        let config = MediaWikiClientConfig {
            api_url: "not a url".to_string(),
            user_agent: "test".to_string(),
            timeout_ms: 1_000,
            connect_timeout_ms: 1_000,
            max_retries: 0,
            retry_delay_ms: 0,
            concurrency: 1,
        };
        let error = MediaWikiClient::new(config).err().expect("invalid url");
        assert!(error.to_string().contains("invalid wiki API URL"));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_ms(100, 0), 100);
        assert_eq!(backoff_ms(100, 3), 800);
        assert_eq!(backoff_ms(100, 8), 25_600);
        assert_eq!(backoff_ms(100, 40), 25_600);
        assert_eq!(backoff_ms(u64::MAX, 2), u64::MAX);
    }

    #[test]
    fn page_info_payload_decodes_backlinks_and_redirects() {
        let payload = serde_json::json!({
            "batchcomplete": true,
            "query": {
                "redirects": [{"from": "Old Name", "to": "New Name"}],
                "pages": [{
                    "pageid": 7, "ns": 0, "title": "New Name",
                    "revisions": [{"timestamp": "2024-05-01T10:00:00Z"}]
                }],
                "backlinks": [{"pageid": 3, "ns": 0, "title": "Workshop A"}]
            }
        });
        let parsed: PageInfoResponse = serde_json::from_value(payload).expect("decode");
        assert_eq!(parsed.query.redirects[0].to, "New Name");
        assert_eq!(parsed.query.pages[0].revisions[0].timestamp, "2024-05-01T10:00:00Z");
        assert_eq!(Backlink::new(parsed.query.backlinks[0].title.clone()).slug, "workshop-a");
    }

    #[test]
    fn category_members_payload_decodes_continuation() {
        let payload = serde_json::json!({
            "continue": {"cmcontinue": "page|123", "continue": "-||"},
            "query": {"categorymembers": [
                {"pageid": 1, "ns": 0, "title": "Workshop A", "timestamp": "2024-05-01T10:00:00Z"}
            ]}
        });
        let parsed: CategoryMembersResponse = serde_json::from_value(payload).expect("decode");
        assert_eq!(parsed.query.categorymembers.len(), 1);
        assert_eq!(
            parsed.continuation.and_then(|cont| cont.cmcontinue).as_deref(),
            Some("page|123")
        );
    }
}
