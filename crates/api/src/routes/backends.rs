use axum::routing::{get, post};
use axum::Router;

use crate::handlers::backends;
use crate::state::AppState;

/// Routes mounted at `/backends`.
///
/// ```text
/// GET    /                     -> list_backends
/// POST   /check                -> check_backends
/// GET    /{id}/capabilities    -> backend_capabilities
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(backends::list_backends))
        .route("/check", post(backends::check_backends))
        .route("/{id}/capabilities", get(backends::backend_capabilities))
}
