pub mod catalog_service;
pub mod db;
pub mod mercadona;
pub mod product;
pub mod refresh;
pub mod store;
pub mod sync;
pub mod upstream;

pub use catalog_service::{CatalogService, ResolveOrigin, Resolved};
pub use product::{CatalogQuery, Product};
pub use refresh::{RefreshReport, RefreshScheduler, TickOutcome};
pub use store::CatalogStore;
pub use sync::{SeedSync, SyncReport};
pub use upstream::CatalogUpstream;
