//! Route table for the v1 API.

use axum::routing::get;
use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

use super::settings::ApiSettings;
use super::{callback, connect, forwarded};

/// Builds the application router, honoring the configured context path.
pub fn create_router(settings: ApiSettings) -> Router {
    let api = Router::new()
        .route("/callback", get(callback::sessions_get))
        .route("/callback/{callback_id}", get(callback::callback_get))
        .route("/connect", get(connect::sessions_get))
        .route("/connect/{callback_id}", get(connect::connect_get))
        .route("/events/callback", get(callback::subscribe))
        .route("/events/connect", get(connect::subscribe))
        .layer(middleware::from_fn_with_state(
            settings.clone(),
            forwarded::forwarded_middleware,
        ))
        .with_state(settings.clone());

    let app = Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http());

    match normalize_context_path(&settings.context_path) {
        Some(prefix) => Router::new().nest(&prefix, app),
        None => app,
    }
}

fn normalize_context_path(context_path: &str) -> Option<String> {
    let trimmed = context_path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("/{trimmed}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_path_normalization() {
        assert_eq!(normalize_context_path(""), None);
        assert_eq!(normalize_context_path("/"), None);
        assert_eq!(normalize_context_path("/base"), Some("/base".to_string()));
        assert_eq!(normalize_context_path("base/"), Some("/base".to_string()));
    }
}
