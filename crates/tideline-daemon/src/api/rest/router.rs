//! API Router configuration

use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the control router
pub fn create_router(state: AppState, enable_cors: bool) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::daemon_status))
        .route("/shutdown", post(handlers::shutdown_daemon))
        .layer(TraceLayer::new_for_http());

    let router = if enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tideline_engine::{ShutdownRegistry, TaskTracker};
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn state() -> (AppState, watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = AppState::new(
            ShutdownRegistry::new(),
            TaskTracker::new(),
            Vec::new(),
            shutdown_tx,
        );
        (state, shutdown_rx)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (state, _rx) = state();
        let response = create_router(state, true)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_shutdown_signals_reconcilers_and_server() {
        let (state, server_rx) = state();
        let reconciler_rx = state.registry.register().await;

        let response = create_router(state.clone(), false)
            .oneshot(Request::post("/shutdown").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(*reconciler_rx.borrow());
        assert!(*server_rx.borrow());
        assert!(state.registry.is_shutting_down().await);
    }

    #[tokio::test]
    async fn test_shutdown_requires_post() {
        let (state, _rx) = state();
        let response = create_router(state, false)
            .oneshot(Request::get("/shutdown").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
