use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

use crate::pw::manager::Manager;

#[derive(Clone)]
struct ApiState {
    manager: Arc<Manager>,
}

/// Start the HTTP control API when `[server] enabled = true`. Actions are
/// accepted asynchronously; the state machine guards illegal transitions, so
/// the surface never manipulates program state directly. The listener shuts
/// down with the manager.
pub fn start_server(manager: Arc<Manager>) {
    let cfg = manager.config().server.clone();
    if !cfg.enabled {
        return;
    }
    let logger = manager.logger().clone();
    tokio::spawn(async move {
        let app = Router::new()
            .route("/api/status", get(api_status))
            .route("/api/manager", get(api_manager))
            .route("/api/programs", get(api_programs))
            .route("/api/programs/:program", get(api_program))
            .route("/api/programs/:program/action/:action", put(api_action))
            .with_state(ApiState {
                manager: Arc::clone(&manager),
            });

        let listener = match tokio::net::TcpListener::bind(&cfg.address).await {
            Ok(l) => l,
            Err(e) => {
                logger.error("server", None, format!("bind {} failed: {e}", cfg.address));
                return;
            }
        };
        logger.info("server", None, format!("running API server at {}", cfg.address));

        let shutdown_manager = Arc::clone(&manager);
        let shutdown = async move { shutdown_manager.wait().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            logger.error("server", None, format!("API server stopped: {e}"));
        }
    });
}

async fn api_status() -> Json<serde_json::Value> {
    Json(json!({ "version": Manager::version() }))
}

async fn api_manager(State(st): State<ApiState>) -> Response {
    Json(st.manager.snapshot()).into_response()
}

async fn api_programs(State(st): State<ApiState>) -> Response {
    Json(st.manager.programs()).into_response()
}

async fn api_program(State(st): State<ApiState>, AxumPath(name): AxumPath<String>) -> Response {
    match st.manager.program(&name) {
        Some(program) => Json(program.snapshot()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            format!("program {name:?} not found"),
        )
            .into_response(),
    }
}

async fn api_action(
    State(st): State<ApiState>,
    AxumPath((name, action)): AxumPath<(String, String)>,
) -> Response {
    let Some(program) = st.manager.program(&name) else {
        return (
            StatusCode::NOT_FOUND,
            format!("program {name:?} not found"),
        )
            .into_response();
    };
    match action.to_ascii_lowercase().as_str() {
        "start" => program.request_start(),
        "stop" => program.request_stop(),
        "restart" => program.request_restart(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                format!("unknown action {action:?}"),
            )
                .into_response()
        }
    }
    StatusCode::NO_CONTENT.into_response()
}
