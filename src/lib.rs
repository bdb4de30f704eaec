pub mod api;
pub mod config;
pub mod database_ops;
pub mod error;
pub mod logging;

pub mod util {
    pub mod clock;
    pub mod env;
}

pub use error::{CatalogError, CatalogResult};
