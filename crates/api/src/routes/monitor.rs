use axum::routing::{get, post};
use axum::Router;

use crate::handlers::monitor;
use crate::state::AppState;

/// Routes mounted at `/monitor`.
///
/// ```text
/// GET    /         -> monitor_status
/// POST   /start    -> start_monitor
/// POST   /stop     -> stop_monitor (admin)
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(monitor::monitor_status))
        .route("/start", post(monitor::start_monitor))
        .route("/stop", post(monitor::stop_monitor))
}
