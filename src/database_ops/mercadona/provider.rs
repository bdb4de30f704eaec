use crate::config::UpstreamConfig;
use crate::database_ops::mercadona::schema::{
    self, WireCategoryDetail, WireCategoryList, WireSearchPage,
};
use crate::database_ops::product::Product;
use crate::database_ops::upstream::{Category, CategoryDetail, CatalogUpstream, SearchPage};
use crate::error::{CatalogError, CatalogResult};
use anyhow::{anyhow, Context};
use chrono::Utc;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};
use url::Url;

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

/// Mercadona online shop catalog API.
/// Public base: https://tienda.mercadona.es/api/
///
/// Endpoints used:
/// - GET /categories/            category tree (top level + subcategories)
/// - GET /categories/{id}/       subcategory sections with product stubs
/// - GET /products/{id}/         full product detail (carries the EAN)
/// - GET {search_url}?query=...  one page of product details
///
/// No retries here; callers decide whether to retry or fall back to local data.
#[derive(Debug, Clone)]
pub struct MercadonaClient {
    base_url: Url,
    search_url: Url,
    http: Client,
}

impl MercadonaClient {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .with_context(|| format!("invalid upstream base url {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("upstream base url {} cannot take a path", base_url));
        }
        let search_url = match &config.search_url {
            Some(raw) => Url::parse(raw).with_context(|| format!("invalid search url {raw}"))?,
            None => join_segments(&base_url, &["search"])?,
        };
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            base_url,
            search_url,
            http,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> CatalogResult<Url> {
        join_segments(&self.base_url, segments)
            .map_err(|e| CatalogError::UpstreamUnavailable(e.to_string()))
    }

    /// GET and return the body; 404 maps to `NotFound(what)`.
    async fn get_text(&self, url: Url, query: &[(&str, &str)], what: &str) -> CatalogResult<String> {
        let resp = self
            .http
            .get(url.clone())
            .header("Accept", "application/json")
            .query(query)
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CatalogError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = truncate_for_log(resp.text().await.unwrap_or_default(), 500);
            warn!(%status, %url, "upstream request failed");
            return Err(CatalogError::UpstreamUnavailable(format!(
                "{what}: {status} url={url} body={body}"
            )));
        }
        let body = resp.text().await?;
        debug!(%url, bytes = body.len(), "upstream response");
        Ok(body)
    }
}

/// `base` + `/seg/.../` with each segment percent-encoded.
fn join_segments(base: &Url, segments: &[&str]) -> anyhow::Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("upstream base url {} cannot take a path", base))?
        .pop_if_empty()
        .extend(segments)
        .push("");
    Ok(url)
}

#[async_trait::async_trait]
impl CatalogUpstream for MercadonaClient {
    #[instrument(skip(self))]
    async fn fetch_by_id(&self, id: &str) -> CatalogResult<Product> {
        let url = self.endpoint(&["products", id])?;
        let body = self.get_text(url, &[], &format!("product {id}")).await?;
        Ok(schema::parse_product(&body, Utc::now())?)
    }

    #[instrument(skip(self))]
    async fn search(&self, query: &str) -> CatalogResult<SearchPage> {
        let body = match self
            .get_text(self.search_url.clone(), &[("query", query)], "search")
            .await
        {
            Ok(body) => body,
            // an empty page, not a missing product
            Err(CatalogError::NotFound(_)) => return Ok(SearchPage::empty()),
            Err(e) => return Err(e),
        };
        let page: WireSearchPage = schema::decode(&body, "search page")?;
        let fetched_at = Utc::now();
        Ok(SearchPage::new(page.results.into_iter().map(move |raw| {
            schema::parse_product_value(raw, fetched_at).map_err(CatalogError::from)
        })))
    }

    async fn list_categories(&self) -> CatalogResult<Vec<Category>> {
        let url = self.endpoint(&["categories"])?;
        let body = self.get_text(url, &[], "category list").await?;
        let wire: WireCategoryList = schema::decode(&body, "category list")?;
        Ok(schema::normalize_categories(wire)?)
    }

    async fn category_detail(&self, id: i64) -> CatalogResult<CategoryDetail> {
        let id_text = id.to_string();
        let url = self.endpoint(&["categories", &id_text])?;
        let what = format!("category {id}");
        let body = self.get_text(url, &[], &what).await?;
        let wire: WireCategoryDetail = schema::decode(&body, &what)?;
        Ok(schema::normalize_category_detail(wire)?)
    }
}
