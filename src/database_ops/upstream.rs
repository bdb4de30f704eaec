//! Seam between the catalog service / refresher and whatever serves product data.
//!
//! The production implementation is [`crate::database_ops::mercadona::provider::MercadonaClient`].

use crate::database_ops::product::Product;
use crate::error::CatalogResult;
use serde::{Deserialize, Serialize};

#[async_trait::async_trait]
pub trait CatalogUpstream: Send + Sync {
    /// `NotFound` when the upstream has no such id.
    async fn fetch_by_id(&self, id: &str) -> CatalogResult<Product>;

    /// One response page of matches. Items are validated as they are pulled.
    async fn search(&self, query: &str) -> CatalogResult<SearchPage>;

    async fn list_categories(&self) -> CatalogResult<Vec<Category>>;

    async fn category_detail(&self, id: i64) -> CatalogResult<CategoryDetail>;
}

/// Lazy, finite, single-pass sequence of products from one upstream page.
pub struct SearchPage {
    items: Box<dyn Iterator<Item = CatalogResult<Product>> + Send>,
}

impl SearchPage {
    pub fn new<I>(items: I) -> Self
    where
        I: Iterator<Item = CatalogResult<Product>> + Send + 'static,
    {
        Self {
            items: Box::new(items),
        }
    }

    pub fn from_products(products: Vec<Product>) -> Self {
        Self::new(products.into_iter().map(Ok))
    }

    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }
}

impl Iterator for SearchPage {
    type Item = CatalogResult<Product>;

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }
}

impl std::fmt::Debug for SearchPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchPage").finish_non_exhaustive()
    }
}

/// Top-level category with its subcategories (`GET /categories/`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub subcategories: Vec<SubCategory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubCategory {
    pub id: i64,
    pub name: String,
}

/// Subcategory page (`GET /categories/{id}/`): sections listing product stubs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryDetail {
    pub id: i64,
    pub name: String,
    pub sections: Vec<CategorySection>,
}

impl CategoryDetail {
    pub fn product_ids(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .flat_map(|s| s.products.iter())
            .map(|p| p.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySection {
    pub id: i64,
    pub name: String,
    pub products: Vec<ProductStub>,
}

/// Listing entry; the detail endpoint is needed for the EAN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductStub {
    pub id: String,
    pub name: String,
    pub thumbnail: Option<String>,
    pub unit_price: Option<String>,
    pub share_url: Option<String>,
}
