use std::future::Future;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use shopsync_core::db::{Database, LibSqlMirrorStore, LibSqlOperationLog};
use shopsync_core::external::{
    AuthContext, ExternalResourceClient, InMemoryExternal, ShopifyRestClient,
};
use shopsync_core::session::{SessionLoader, StaticSessionLoader};
use shopsync_core::{
    Price, ProductFields, ProductId, ProductRecord, ReconciliationEngine, SweepReport,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{AppConfig, ExternalBackend};
use crate::error::AppError;

const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: ReconciliationEngine,
    sessions: Arc<dyn SessionLoader>,
}

impl AppState {
    /// Open the mirror database and wire the configured external backend
    pub async fn from_config(config: Arc<AppConfig>) -> shopsync_core::Result<Self> {
        let external: Arc<dyn ExternalResourceClient>;
        let session = match &config.backend {
            ExternalBackend::Shopify(shopify) => {
                external = Arc::new(ShopifyRestClient::new(
                    shopify.api_version.clone(),
                    shopify.api_base_url.clone(),
                    config.external_timeout,
                )?);
                AuthContext::new(shopify.shop.clone(), shopify.access_token.clone())
            }
            ExternalBackend::Memory => {
                tracing::warn!(
                    "Using in-memory external backend; products are not persisted upstream"
                );
                external = Arc::new(InMemoryExternal::new());
                AuthContext::new("memory.local", "memory")
            }
        };
        let sessions = Arc::new(StaticSessionLoader::new(session));
        Self::with_external(config, external, sessions).await
    }

    pub async fn with_external(
        config: Arc<AppConfig>,
        external: Arc<dyn ExternalResourceClient>,
        sessions: Arc<dyn SessionLoader>,
    ) -> shopsync_core::Result<Self> {
        let db = Arc::new(Database::open(&config.database_path).await?);
        let engine = ReconciliationEngine::new(
            external,
            Arc::new(LibSqlMirrorStore::new(Arc::clone(&db))),
            Arc::new(LibSqlOperationLog::new(db)),
            config.engine_config(),
        );
        Ok(Self {
            config,
            engine,
            sessions,
        })
    }

    pub async fn session(&self) -> shopsync_core::Result<AuthContext> {
        self.sessions.load_session().await
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/products", get(list_products).post(create_product))
        .route("/products/{id}", put(update_product).delete(delete_product))
        .route("/admin/sweep", post(run_sweep))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

#[derive(Debug, Serialize)]
struct ProductResponse {
    id: ProductId,
    title: String,
    description: String,
    price: Price,
    vendor: String,
}

impl From<ProductRecord> for ProductResponse {
    fn from(record: ProductRecord) -> Self {
        Self {
            id: record.id,
            title: record.title,
            description: record.description,
            price: record.price,
            vendor: record.vendor,
        }
    }
}

/// Run engine work on its own task so a dropped request cannot abandon an
/// external write halfway through.
async fn detached<T, F>(work: F) -> Result<T, AppError>
where
    F: Future<Output = shopsync_core::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|error| AppError::internal(format!("engine task failed: {error}")))?
        .map_err(AppError::from)
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|value| {
            value
                .to_str()
                .map(str::to_string)
                .map_err(|_| AppError::bad_request("Idempotency-Key must be visible ASCII"))
        })
        .transpose()
}

fn product_body(
    body: Result<Json<ProductFields>, JsonRejection>,
) -> Result<ProductFields, AppError> {
    body.map(|Json(fields)| fields)
        .map_err(|rejection| AppError::bad_request(rejection.body_text()))
}

async fn list_products(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProductResponse>>, AppError> {
    let products = state.engine.list().await?;
    Ok(Json(products.into_iter().map(ProductResponse::from).collect()))
}

async fn create_product(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ProductFields>, JsonRejection>,
) -> Result<(StatusCode, Json<ProductResponse>), AppError> {
    let fields = product_body(body)?;
    let key = idempotency_key(&headers)?;
    let ctx = state.session().await?;
    let engine = state.engine.clone();

    let outcome = detached(async move { engine.create(&ctx, fields, key).await }).await?;
    tracing::info!(
        endpoint = "create_product",
        product_id = %outcome.product_id,
        state = %outcome.state,
        replayed = outcome.replayed,
        "Product created"
    );
    let record = outcome
        .record
        .ok_or_else(|| AppError::internal("create returned no record"))?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<ProductFields>, JsonRejection>,
) -> Result<Json<ProductResponse>, AppError> {
    let fields = product_body(body)?;
    let key = idempotency_key(&headers)?;
    let ctx = state.session().await?;
    let engine = state.engine.clone();

    let outcome = detached(async move {
        engine
            .update(&ctx, ProductId::from(id), fields, key)
            .await
    })
    .await?;
    tracing::info!(
        endpoint = "update_product",
        product_id = %outcome.product_id,
        state = %outcome.state,
        replayed = outcome.replayed,
        "Product updated"
    );
    let record = outcome
        .record
        .ok_or_else(|| AppError::internal("update returned no record"))?;
    Ok(Json(record.into()))
}

async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let key = idempotency_key(&headers)?;
    let ctx = state.session().await?;
    let engine = state.engine.clone();

    let outcome =
        detached(async move { engine.delete(&ctx, ProductId::from(id), key).await }).await?;
    tracing::info!(
        endpoint = "delete_product",
        product_id = %outcome.product_id,
        state = %outcome.state,
        replayed = outcome.replayed,
        "Product deleted"
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn run_sweep(State(state): State<AppState>) -> Result<Json<SweepReport>, AppError> {
    let ctx = state.session().await?;
    let engine = state.engine.clone();
    let report = detached(async move { engine.sweep(&ctx).await }).await?;
    Ok(Json(report))
}
