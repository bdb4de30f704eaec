// Local catalog store: the only code that touches the `products` table.

use crate::database_ops::db::Db;
use crate::database_ops::product::Product;
use crate::error::{CatalogError, CatalogResult};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, Sqlite};
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: String,
    ean: Option<String>,
    name: String,
    category: Option<String>,
    price: String,
    thumbnail: Option<String>,
    share_url: Option<String>,
    last_refreshed: i64,
}

impl TryFrom<ProductRow> for Product {
    type Error = CatalogError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        let price = BigDecimal::from_str(&row.price)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let last_refreshed = DateTime::<Utc>::from_timestamp_millis(row.last_refreshed)
            .ok_or_else(|| {
                sqlx::Error::Decode(
                    format!("last_refreshed {} out of range", row.last_refreshed).into(),
                )
            })?;
        Ok(Product {
            id: row.id,
            ean: row.ean,
            name: row.name,
            category: row.category,
            price,
            thumbnail: row.thumbnail,
            share_url: row.share_url,
            last_refreshed,
        })
    }
}

fn into_products(rows: Vec<ProductRow>) -> CatalogResult<Vec<Product>> {
    rows.into_iter().map(Product::try_from).collect()
}

/// Escape LIKE wildcards so user text matches literally (paired with `ESCAPE '\'`).
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn contains_pattern(raw: &str) -> String {
    format!("%{}%", escape_like(raw))
}

#[derive(Clone)]
pub struct CatalogStore {
    db: Db,
}

impl CatalogStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub async fn get_by_id(&self, id: &str) -> CatalogResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>(
            r#"
            SELECT id, ean, name, category, price, thumbnail, share_url, last_refreshed
            FROM products
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db.pool)
        .await?;
        row.map(Product::try_from).transpose()
    }

    pub async fn get_by_ean(&self, ean: &str) -> CatalogResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>(
            r#"
            SELECT id, ean, name, category, price, thumbnail, share_url, last_refreshed
            FROM products
            WHERE ean = ?
            "#,
        )
        .bind(ean)
        .fetch_optional(&self.db.pool)
        .await?;
        row.map(Product::try_from).transpose()
    }

    /// Case-insensitive substring match on the name, ordered by name then id.
    pub async fn search_by_name(&self, substring: &str, limit: i64) -> CatalogResult<Vec<Product>> {
        let rows = sqlx::query_as::<_, ProductRow>(
            r#"
            SELECT id, ean, name, category, price, thumbnail, share_url, last_refreshed
            FROM products
            WHERE name LIKE ? ESCAPE '\'
            ORDER BY name COLLATE NOCASE, id
            LIMIT ?
            "#,
        )
        .bind(contains_pattern(substring))
        .bind(limit)
        .fetch_all(&self.db.pool)
        .await?;
        into_products(rows)
    }

    /// Multi-word search: every word must appear in the name, or the whole
    /// query is an exact EAN / id.
    pub async fn search(&self, query: &str, limit: i64) -> CatalogResult<Vec<Product>> {
        let query = query.trim();
        let words: Vec<&str> = query.split_whitespace().collect();
        if words.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, ean, name, category, price, thumbnail, share_url, last_refreshed \
             FROM products WHERE (",
        );
        let mut conditions = qb.separated(" AND ");
        for word in &words {
            conditions.push("name LIKE ");
            conditions.push_bind_unseparated(contains_pattern(word));
            conditions.push_unseparated(" ESCAPE '\\'");
        }
        qb.push(") OR ean = ")
            .push_bind(query.to_string())
            .push(" OR id = ")
            .push_bind(query.to_string())
            .push(" ORDER BY name COLLATE NOCASE, id LIMIT ")
            .push_bind(limit);

        let rows = qb
            .build_query_as::<ProductRow>()
            .fetch_all(&self.db.pool)
            .await?;
        debug!(query, words = words.len(), hits = rows.len(), "local search");
        into_products(rows)
    }

    /// Insert or overwrite by `id` in one transaction.
    ///
    /// Fails with `Conflict` when another id already owns `product.ean`; the
    /// existing row is left untouched. The write lock is taken before the
    /// EAN check (`BEGIN IMMEDIATE`): a deferred read upgraded to a write gets
    /// SQLITE_BUSY without waiting on the busy timeout.
    pub async fn upsert(&self, product: &Product) -> CatalogResult<()> {
        let mut tx = self.db.pool.begin_with("BEGIN IMMEDIATE").await?;

        if let Some(ean) = product.ean.as_deref() {
            let owner: Option<String> =
                sqlx::query_scalar("SELECT id FROM products WHERE ean = ? AND id <> ?")
                    .bind(ean)
                    .bind(&product.id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some(existing_id) = owner {
                return Err(CatalogError::Conflict {
                    ean: ean.to_string(),
                    existing_id,
                    incoming_id: product.id.clone(),
                });
            }
        }

        let written = sqlx::query(
            r#"
            INSERT INTO products (id, ean, name, category, price, thumbnail, share_url, last_refreshed)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                ean = excluded.ean,
                name = excluded.name,
                category = excluded.category,
                price = excluded.price,
                thumbnail = excluded.thumbnail,
                share_url = excluded.share_url,
                last_refreshed = excluded.last_refreshed,
                last_attempted = NULL
            "#,
        )
        .bind(&product.id)
        .bind(&product.ean)
        .bind(&product.name)
        .bind(&product.category)
        .bind(product.price.to_string())
        .bind(&product.thumbnail)
        .bind(&product.share_url)
        .bind(product.last_refreshed.timestamp_millis())
        .execute(&mut *tx)
        .await;

        match written {
            Ok(_) => {}
            // a concurrent writer claimed the EAN between our check and the insert
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                drop(tx);
                let ean = product.ean.clone().unwrap_or_default();
                let existing_id = self
                    .get_by_ean(&ean)
                    .await?
                    .map(|p| p.id)
                    .unwrap_or_else(|| "<unknown>".to_string());
                return Err(CatalogError::Conflict {
                    ean,
                    existing_id,
                    incoming_id: product.id.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(())
    }

    /// Records with `now - last_refreshed > threshold`, least recently
    /// tried first: a failed attempt (`mark_attempted`) moves a row behind
    /// stale rows that have not been tried since.
    pub async fn list_stale(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
        limit: i64,
    ) -> CatalogResult<Vec<Product>> {
        // a threshold reaching past the calendar range: nothing is that old
        let Some(cutoff) = now.checked_sub_signed(threshold) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query_as::<_, ProductRow>(
            r#"
            SELECT id, ean, name, category, price, thumbnail, share_url, last_refreshed
            FROM products
            WHERE last_refreshed < ?
            ORDER BY COALESCE(last_attempted, last_refreshed), id
            LIMIT ?
            "#,
        )
        .bind(cutoff.timestamp_millis())
        .bind(limit)
        .fetch_all(&self.db.pool)
        .await?;
        into_products(rows)
    }

    /// Record a failed refresh so the row yields its place in the stale queue.
    /// The stored product itself is left as it was.
    pub async fn mark_attempted(&self, id: &str, at: DateTime<Utc>) -> CatalogResult<()> {
        sqlx::query("UPDATE products SET last_attempted = ? WHERE id = ?")
            .bind(at.timestamp_millis())
            .bind(id)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> CatalogResult<i64> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM products")
            .fetch_one(&self.db.pool)
            .await?;
        Ok(n)
    }

    pub async fn oldest_refresh(&self) -> CatalogResult<Option<DateTime<Utc>>> {
        let ms = sqlx::query_scalar::<_, Option<i64>>("SELECT MIN(last_refreshed) FROM products")
            .fetch_one(&self.db.pool)
            .await?;
        Ok(ms.and_then(DateTime::<Utc>::from_timestamp_millis))
    }
}
