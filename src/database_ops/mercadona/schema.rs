// Wire shapes of the Mercadona catalog API and their strict normalisation.
//
// Deserialisation rejects anything structurally off; `normalize_*` then
// enforces the value rules (non-empty id/name, decimal price, digit EAN)
// so nothing half-parsed reaches the store.

use crate::database_ops::product::Product;
use crate::database_ops::upstream::{
    Category, CategoryDetail, CategorySection, ProductStub, SubCategory,
};
use crate::error::SchemaError;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::str::FromStr;

/// Prices arrive as strings ("1.25") on most endpoints and as numbers on a few.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireDecimal {
    Text(String),
    Number(serde_json::Number),
}

impl WireDecimal {
    fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.trim().to_string(),
            Self::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePriceInstructions {
    #[serde(default)]
    pub unit_price: Option<WireDecimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireCategoryRef {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub categories: Vec<WireCategoryRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireProductDetail {
    pub id: String,
    #[serde(default)]
    pub ean: Option<String>,
    pub display_name: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub share_url: Option<String>,
    pub price_instructions: WirePriceInstructions,
    #[serde(default)]
    pub categories: Vec<WireCategoryRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireProductStub {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    pub price_instructions: WirePriceInstructions,
    #[serde(default)]
    pub share_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireSubCategory {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireMainCategory {
    pub id: i64,
    pub name: String,
    pub categories: Vec<WireSubCategory>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireCategoryList {
    pub results: Vec<WireMainCategory>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireSection {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub products: Option<Vec<WireProductStub>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireCategoryDetail {
    pub id: i64,
    pub name: String,
    pub categories: Vec<WireSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireSearchPage {
    pub results: Vec<serde_json::Value>,
}

pub fn decode<T: DeserializeOwned>(body: &str, context: &str) -> Result<T, SchemaError> {
    serde_json::from_str(body).map_err(|source| SchemaError::Json {
        context: context.to_string(),
        source,
    })
}

pub fn decode_value<T: DeserializeOwned>(
    value: serde_json::Value,
    context: &str,
) -> Result<T, SchemaError> {
    serde_json::from_value(value).map_err(|source| SchemaError::Json {
        context: context.to_string(),
        source,
    })
}

fn required(raw: &str, context: &str, field: &'static str) -> Result<String, SchemaError> {
    let v = raw.trim();
    if v.is_empty() {
        return Err(SchemaError::MissingField {
            context: context.to_string(),
            field,
        });
    }
    Ok(v.to_string())
}

fn optional(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_price(raw: &WireDecimal, context: &str) -> Result<BigDecimal, SchemaError> {
    let text = raw.as_text();
    // some listings use a decimal comma
    let normalized = text.replace(',', ".");
    match BigDecimal::from_str(&normalized) {
        Ok(v) if v >= BigDecimal::from(0) => Ok(v),
        _ => Err(SchemaError::InvalidPrice {
            context: context.to_string(),
            raw: text,
        }),
    }
}

fn parse_ean(raw: Option<String>, context: &str) -> Result<Option<String>, SchemaError> {
    match optional(raw) {
        None => Ok(None),
        Some(ean) if ean.chars().all(|c| c.is_ascii_digit()) => Ok(Some(ean)),
        Some(ean) => Err(SchemaError::InvalidEan {
            context: context.to_string(),
            raw: ean,
        }),
    }
}

/// Most specific category name along the first branch.
fn deepest_category(categories: &[WireCategoryRef]) -> Option<String> {
    let mut node = categories.first()?;
    while let Some(child) = node.categories.first() {
        node = child;
    }
    optional(Some(node.name.clone()))
}

pub fn normalize_detail(
    wire: WireProductDetail,
    fetched_at: DateTime<Utc>,
) -> Result<Product, SchemaError> {
    let context = format!("product {}", wire.id.trim());
    let id = required(&wire.id, &context, "id")?;
    let name = required(&wire.display_name, &context, "display_name")?;
    let price = wire
        .price_instructions
        .unit_price
        .as_ref()
        .ok_or_else(|| SchemaError::MissingField {
            context: context.clone(),
            field: "price_instructions.unit_price",
        })
        .and_then(|raw| parse_price(raw, &context))?;
    let ean = parse_ean(wire.ean, &context)?;
    let category = deepest_category(&wire.categories);

    Ok(Product {
        id,
        ean,
        name,
        category,
        price,
        thumbnail: optional(wire.thumbnail),
        share_url: optional(wire.share_url),
        last_refreshed: fetched_at,
    })
}

pub fn parse_product(body: &str, fetched_at: DateTime<Utc>) -> Result<Product, SchemaError> {
    let wire: WireProductDetail = decode(body, "product detail")?;
    normalize_detail(wire, fetched_at)
}

pub fn parse_product_value(
    value: serde_json::Value,
    fetched_at: DateTime<Utc>,
) -> Result<Product, SchemaError> {
    let wire: WireProductDetail = decode_value(value, "search result")?;
    normalize_detail(wire, fetched_at)
}

pub fn normalize_categories(wire: WireCategoryList) -> Result<Vec<Category>, SchemaError> {
    wire.results
        .into_iter()
        .map(|main| {
            let context = format!("category {}", main.id);
            Ok(Category {
                id: main.id,
                name: required(&main.name, &context, "name")?,
                subcategories: main
                    .categories
                    .into_iter()
                    .map(|sub| SubCategory {
                        id: sub.id,
                        name: sub.name.trim().to_string(),
                    })
                    .collect(),
            })
        })
        .collect()
}

pub fn normalize_category_detail(wire: WireCategoryDetail) -> Result<CategoryDetail, SchemaError> {
    let mut sections = Vec::with_capacity(wire.categories.len());
    for section in wire.categories {
        let mut products = Vec::new();
        for stub in section.products.unwrap_or_default() {
            let context = format!("category {} stub {}", wire.id, stub.id.trim());
            products.push(ProductStub {
                id: required(&stub.id, &context, "id")?,
                name: required(&stub.display_name, &context, "display_name")?,
                thumbnail: optional(stub.thumbnail),
                unit_price: stub.price_instructions.unit_price.map(|p| p.as_text()),
                share_url: optional(stub.share_url),
            });
        }
        sections.push(CategorySection {
            id: section.id,
            name: section.name.trim().to_string(),
            products,
        });
    }
    Ok(CategoryDetail {
        id: wire.id,
        name: wire.name.trim().to_string(),
        sections,
    })
}
