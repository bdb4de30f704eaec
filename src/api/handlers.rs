// HTTP request handlers for API endpoints

use crate::api::models::*;
use crate::database_ops::{
    CatalogQuery, CatalogService, RefreshScheduler, ResolveOrigin, Resolved, SeedSync,
    TickOutcome,
};
use crate::error::CatalogError;
use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, ResponseError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};

/// Shared state handed to every handler.
pub struct AppState {
    pub service: Arc<CatalogService>,
    pub scheduler: Arc<RefreshScheduler>,
    pub sync: Arc<SeedSync>,
    sync_running: Arc<AtomicBool>,
    started_at: Instant,
}

/// Owned flag guard; moved into the background sync task.
struct SyncFlag(Arc<AtomicBool>);

impl Drop for SyncFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AppState {
    pub fn new(service: CatalogService, scheduler: RefreshScheduler, sync: SeedSync) -> Self {
        Self {
            service: Arc::new(service),
            scheduler: Arc::new(scheduler),
            sync: Arc::new(sync),
            sync_running: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        }
    }

    pub fn sync_running(&self) -> bool {
        self.sync_running.load(Ordering::Acquire)
    }

    /// Start a seed sync on a background task. False if one is already running.
    pub fn spawn_sync(&self, trigger: &'static str) -> bool {
        if self
            .sync_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let flag = SyncFlag(self.sync_running.clone());
        let sync = self.sync.clone();
        tokio::spawn(
            async move {
                let _flag = flag;
                match sync.run().await {
                    Ok(report) => info!(?report, "seed sync finished"),
                    Err(e) => error!(error = %e, "seed sync aborted"),
                }
            }
            .instrument(info_span!("sync", trigger)),
        );
        true
    }
}

/// `CatalogError` rendered as an `ApiResponse` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub CatalogError);

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        Self(err)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            CatalogError::NotFound(_) => StatusCode::NOT_FOUND,
            CatalogError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CatalogError::Conflict { .. } => StatusCode::CONFLICT,
            CatalogError::Schema(_) => StatusCode::BAD_GATEWAY,
            CatalogError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match &self.0 {
            CatalogError::Database(e) => {
                error!(error = %e, "database error while serving request");
                "internal database error".to_string()
            }
            other => other.to_string(),
        };
        HttpResponse::build(self.status_code()).json(ApiResponse::<()>::error(message))
    }
}

type ApiResult = Result<HttpResponse, ApiError>;

fn product_response(resolved: Resolved) -> HttpResponse {
    let stale = resolved.origin == ResolveOrigin::StaleFallback;
    HttpResponse::Ok().json(ApiResponse::success(ProductResponse {
        product: resolved.product,
        origin: resolved.origin,
        stale,
    }))
}

/// Health check endpoint
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let store = state.service.store();
    let connected = store.db().ping().await;
    let products = store.count().await.ok();
    let oldest_refresh = store.oldest_refresh().await.ok().flatten();

    let body = ApiResponse::success(HealthResponse {
        status: if connected { "healthy" } else { "degraded" }.to_string(),
        database: if connected { "connected" } else { "disconnected" }.to_string(),
        products,
        oldest_refresh,
        refresh_running: state.scheduler.is_running(),
        sync_running: state.sync_running(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    });

    if connected {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub async fn get_product(path: web::Path<String>, state: web::Data<AppState>) -> ApiResult {
    let resolved = state
        .service
        .resolve(CatalogQuery::ById(path.into_inner()))
        .await?;
    Ok(product_response(resolved))
}

/// Barcode lookup used by the scanner screen.
pub async fn get_product_by_ean(path: web::Path<String>, state: web::Data<AppState>) -> ApiResult {
    let resolved = state
        .service
        .resolve(CatalogQuery::ByEan(path.into_inner()))
        .await?;
    Ok(product_response(resolved))
}

pub async fn search_products(
    query: web::Query<SearchQuery>,
    state: web::Data<AppState>,
) -> ApiResult {
    let query = query.into_inner().query;
    let results = state.service.search(&query).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(SearchResponse {
        count: results.len(),
        query,
        results,
    })))
}

pub async fn list_categories(state: web::Data<AppState>) -> ApiResult {
    let categories = state.service.categories().await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(categories)))
}

pub async fn get_category(path: web::Path<i64>, state: web::Data<AppState>) -> ApiResult {
    let detail = state.service.category(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(detail)))
}

/// Kick off a full seed sync in the background
pub async fn trigger_sync(state: web::Data<AppState>) -> HttpResponse {
    if !state.spawn_sync("api") {
        return HttpResponse::Conflict().json(ApiResponse::<()>::error("seed sync already running"));
    }
    HttpResponse::Accepted().json(ApiResponse::success(TaskAccepted {
        task: "sync",
        status: "started",
    }))
}

/// Run one refresh tick inline and report what it did
pub async fn trigger_refresh(state: web::Data<AppState>) -> HttpResponse {
    match state.scheduler.tick().await {
        TickOutcome::Completed(report) => HttpResponse::Ok().json(ApiResponse::success(report)),
        TickOutcome::Skipped => HttpResponse::Conflict()
            .json(ApiResponse::<()>::error("refresh tick already running")),
        TickOutcome::Failed { reason } => {
            HttpResponse::InternalServerError().json(ApiResponse::<()>::error(reason))
        }
    }
}
