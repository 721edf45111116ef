use axum::{
    extract::Path,
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use hyper::Server;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::app::ports::{AuthorityCredentials, CredentialProvider};
use crate::app::TransmissionEngine;
use crate::domain::{Environment, NewDocument};
use crate::error::EngineError;

/// Shared handles injected into every handler.
#[derive(Clone)]
pub struct ApiContext {
    pub engine: Arc<TransmissionEngine>,
    pub credentials: Arc<dyn CredentialProvider>,
}

/// Error body: `{"code": "...", "message": "..."}`.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::AlreadyProcessed(_)
        | EngineError::InvalidStateTransition { .. }
        | EngineError::TransmissionInFlight(_) => StatusCode::CONFLICT,
        EngineError::InvalidDocument(_)
        | EngineError::EnvironmentMismatch { .. }
        | EngineError::Json(_) => StatusCode::BAD_REQUEST,
        EngineError::MissingCredentials(_) => StatusCode::UNAUTHORIZED,
        EngineError::AuthorityRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::AuthorityUnavailable(_) | EngineError::TokenUnavailable(_) => StatusCode::BAD_GATEWAY,
        EngineError::SigningUnavailable(_) | EngineError::SigningFailed(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EngineError::Storage(_) | EngineError::Config(_) | EngineError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = Json(serde_json::json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Authority identity for a request. The secret may be omitted when the
/// server has it configured for the identity.
#[derive(Debug, Deserialize)]
struct AuthorityAuth {
    identity: String,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
}

impl AuthorityAuth {
    fn tenant(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or("default")
    }

    async fn resolve(
        &self,
        provider: &dyn CredentialProvider,
        environment: Environment,
    ) -> ApiResult<AuthorityCredentials> {
        let secret = match &self.secret {
            Some(secret) => secret.clone(),
            None => provider
                .secret_for(self.tenant(), &self.identity)
                .await
                .ok_or_else(|| EngineError::MissingCredentials(self.identity.clone()))?,
        };
        Ok(AuthorityCredentials::new(self.identity.clone(), secret, environment))
    }
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum TransmitMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Deserialize)]
struct TransmitBody {
    #[serde(flatten)]
    auth: AuthorityAuth,
    #[serde(default)]
    mode: TransmitMode,
}

#[derive(Debug, Deserialize)]
struct AnnulBody {
    #[serde(flatten)]
    auth: AuthorityAuth,
    reason: String,
}

#[derive(Debug, Deserialize)]
struct ReopenBody {
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusQueryBody {
    #[serde(flatten)]
    auth: AuthorityAuth,
    generation_code: String,
    environment: Environment,
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "dte-transmitter",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn create_document(
    Extension(ctx): Extension<ApiContext>,
    Json(body): Json<NewDocument>,
) -> ApiResult<impl IntoResponse> {
    let doc = ctx.engine.create_document(body).await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn get_document(
    Extension(ctx): Extension<ApiContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.engine.get_document(id).await?))
}

async fn delete_document(
    Extension(ctx): Extension<ApiContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    ctx.engine.purge_document(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn document_events(
    Extension(ctx): Extension<ApiContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.engine.events(id).await?))
}

async fn transmit(
    Extension(ctx): Extension<ApiContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<TransmitBody>,
) -> ApiResult<Response> {
    let doc = ctx.engine.get_document(id).await?;
    let credentials = body.auth.resolve(ctx.credentials.as_ref(), doc.environment).await?;
    match body.mode {
        TransmitMode::Sync => {
            let result = ctx.engine.transmit_sync(id, &credentials).await?;
            Ok(Json(result).into_response())
        }
        TransmitMode::Async => {
            let submission = ctx
                .engine
                .transmit_async(id, body.auth.tenant(), &credentials)
                .await?;
            Ok((StatusCode::ACCEPTED, Json(submission)).into_response())
        }
    }
}

async fn annul(
    Extension(ctx): Extension<ApiContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<AnnulBody>,
) -> ApiResult<impl IntoResponse> {
    let doc = ctx.engine.get_document(id).await?;
    let credentials = body.auth.resolve(ctx.credentials.as_ref(), doc.environment).await?;
    Ok(Json(ctx.engine.annul(id, &body.reason, &credentials).await?))
}

async fn reopen(
    Extension(ctx): Extension<ApiContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<ReopenBody>,
) -> ApiResult<impl IntoResponse> {
    let note = body.note.unwrap_or_else(|| "re-opened by operator".to_string());
    Ok(Json(ctx.engine.reopen_rejected(id, &note).await?))
}

async fn authority_status(
    Extension(ctx): Extension<ApiContext>,
    Json(body): Json<StatusQueryBody>,
) -> ApiResult<impl IntoResponse> {
    let credentials = body.auth.resolve(ctx.credentials.as_ref(), body.environment).await?;
    Ok(Json(
        ctx.engine
            .query_status(&body.generation_code, &credentials)
            .await?,
    ))
}

async fn job_status(
    Extension(ctx): Extension<ApiContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.engine.job_status(id).await?))
}

/// Build the HTTP router over the engine.
pub fn create_server(ctx: ApiContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/documents", post(create_document))
        .route("/documents/:id", get(get_document).delete(delete_document))
        .route("/documents/:id/events", get(document_events))
        .route("/documents/:id/transmit", post(transmit))
        .route("/documents/:id/annul", post(annul))
        .route("/documents/:id/reopen", post(reopen))
        .route("/authority/status", post(authority_status))
        .route("/jobs/:id", get(job_status))
        .layer(Extension(ctx))
        .layer(ServiceBuilder::new().layer(cors))
}

/// Serve the API on `bind` until the process is stopped.
pub async fn start_server(ctx: ApiContext, bind: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind.parse()?;
    let app = create_server(ctx);

    info!("HTTP server running on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    Server::bind(&addr).serve(app.into_make_service()).await?;
    Ok(())
}
