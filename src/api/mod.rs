// HTTP API for the catalog mirror
// Serves the mobile client: product lookups, search, categories, maintenance triggers

pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use handlers::AppState;
pub use server::ApiServer;
