use axum::routing::get;
use axum::Router;

use crate::handlers::backends;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/backends", get(backends::list_backends))
}
