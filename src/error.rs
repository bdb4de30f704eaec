//! Error taxonomy shared by the upstream client, the store and the service.

use thiserror::Error;

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// No record for the query, locally or upstream.
    #[error("product not found: {0}")]
    NotFound(String),

    /// Network failure, timeout or a non-2xx upstream response.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// `ean` is already bound to a different product id.
    #[error("ean {ean} already belongs to product {existing_id}, refusing to bind it to {incoming_id}")]
    Conflict {
        ean: String,
        existing_id: String,
        incoming_id: String,
    },

    #[error("upstream payload rejected: {0}")]
    Schema(#[from] SchemaError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CatalogError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Failures a caller may paper over with a stale local copy.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::UpstreamUnavailable(_) | Self::Schema(_)
        )
    }
}

impl From<reqwest::Error> for CatalogError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamUnavailable(format!("request timed out: {err}"))
        } else {
            Self::UpstreamUnavailable(err.to_string())
        }
    }
}

/// Strict validation failures at the upstream client boundary.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("{context}: invalid json: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{context}: field `{field}` is missing or empty")]
    MissingField {
        context: String,
        field: &'static str,
    },
    #[error("{context}: price {raw:?} is not a non-negative decimal")]
    InvalidPrice { context: String, raw: String },
    #[error("{context}: ean {raw:?} is not a digit string")]
    InvalidEan { context: String, raw: String },
}
