use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// One mirrored catalog item. `id` is the upstream identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub ean: Option<String>,
    pub name: String,
    pub category: Option<String>,
    pub price: BigDecimal,
    pub thumbnail: Option<String>,
    pub share_url: Option<String>,
    pub last_refreshed: DateTime<Utc>,
}

impl Product {
    /// Strictly older than `threshold`; a record exactly at the threshold is still fresh.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now.signed_duration_since(self.last_refreshed) > threshold
    }

    /// Stamps the refresh time, truncated to the millisecond the store keeps.
    pub fn refreshed_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_refreshed = at.trunc_subsecs(3);
        self
    }

    /// Everything except `last_refreshed` matches.
    pub fn same_content(&self, other: &Product) -> bool {
        self.id == other.id
            && self.ean == other.ean
            && self.name == other.name
            && self.category == other.category
            && self.price == other.price
            && self.thumbnail == other.thumbnail
            && self.share_url == other.share_url
    }
}

/// What a foreground caller is looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogQuery {
    ById(String),
    ByEan(String),
    ByName(String),
}

impl CatalogQuery {
    pub fn key(&self) -> &str {
        match self {
            Self::ById(v) | Self::ByEan(v) | Self::ByName(v) => v,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ById(_) => "id",
            Self::ByEan(_) => "ean",
            Self::ByName(_) => "name",
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    pub fn product(id: &str, ean: Option<&str>, name: &str) -> Product {
        Product {
            id: id.to_string(),
            ean: ean.map(str::to_string),
            name: name.to_string(),
            category: Some("Lácteos".to_string()),
            price: BigDecimal::from_str("1.25").unwrap(),
            thumbnail: Some(format!("https://img.example/{id}.jpg")),
            share_url: None,
            last_refreshed: t0(),
        }
    }
}
