use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

/// Verifies the bearer token and stores the caller's
/// [`Identity`](huddle_types::Identity) in the request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .ok_or(ApiError::Unauthorized)?;

    let identity = state.verifier.verify(bearer.token()).ok_or_else(|| {
        debug!("Rejected bearer token on {}", req.uri().path());
        ApiError::Unauthorized
    })?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
