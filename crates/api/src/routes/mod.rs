pub mod backends;
pub mod health;
pub mod jobs;
pub mod monitor;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /jobs                              submit (POST), list (GET)
/// /jobs/stats                        queue counters
/// /jobs/{id}                         status
/// /jobs/{id}/cancel                  cancel (POST)
/// /jobs/{id}/retry                   retry a failed job (POST)
///
/// /backends                          health table snapshot
/// /backends/check                    run a health check now (POST)
/// /backends/{id}/capabilities        models, LoRAs, samplers, schedulers
///
/// /monitor                           monitor status
/// /monitor/start                     start the monitor (POST)
/// /monitor/stop                      stop the monitor (POST, admin only)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/backends", backends::router())
        .nest("/monitor", monitor::router())
}
