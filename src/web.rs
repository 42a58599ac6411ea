//! The thin HTTP surface over the core APIs: health, ping and the
//! connection-diagnostics endpoint.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde_json::json;
use tracing::warn;

use drawbridge_domain::error::ErrorKind;
use drawbridge_domain::identity::Identity;
use drawbridge_domain::GatewayError;

use crate::ctx::GatewayCtx;
use crate::diag::{self, DiagnoseRequest};

/// The authenticated peer, extracted from the mTLS client certificate by
/// the connection layer
#[derive(Clone)]
pub struct PeerIdentity(pub Option<Identity>);

pub fn router() -> axum::Router<GatewayCtx> {
    axum::Router::new()
        .route("/health/readiness", get(readiness))
        .route("/v1/webapi/ping", get(ping))
        .route(
            "/v1/webapi/sites/:site/diagnostics/connections",
            post(diagnose_connection),
        )
}

async fn readiness() -> Response {
    Json(json!({ "status": "UP" })).into_response()
}

async fn ping(State(ctx): State<GatewayCtx>) -> Response {
    Json(json!({
        "cluster_name": ctx.config.cluster_name,
        "server_version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

async fn diagnose_connection(
    State(ctx): State<GatewayCtx>,
    Path(site): Path<String>,
    Extension(PeerIdentity(identity)): Extension<PeerIdentity>,
    Json(request): Json<DiagnoseRequest>,
) -> Result<Response, ApiError> {
    let identity = identity.ok_or(ApiError(GatewayError::AccessDenied))?;

    if site != ctx.config.cluster_name.as_str() {
        return Err(ApiError(GatewayError::NotFound(format!("site {site:?}"))));
    }

    let user = ctx.auth.get_user(&identity.username).await.map_err(ApiError)?;
    let roles = ctx.auth.role_set_for(&user).await.map_err(ApiError)?;

    let diagnostic = diag::diagnose_database(&ctx.backend, &roles, &request).await;
    Ok(Json(diagnostic).into_response())
}

pub struct ApiError(pub GatewayError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::InvalidArgument | ErrorKind::BadParameter => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExists => StatusCode::CONFLICT,
            ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
            ErrorKind::Locked => StatusCode::LOCKED,
            ErrorKind::LimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::ConnectionProblem
            | ErrorKind::Canceled
            | ErrorKind::DeadlineExceeded => StatusCode::BAD_GATEWAY,
        };

        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }

        // untrusted callers see the stripped message only
        (status, Json(json!({ "error": self.0.user_message() }))).into_response()
    }
}
