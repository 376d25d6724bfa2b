// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Dashboard-facing HTTP and WebSocket surface.
//
// Routes carry the relay's operations to browsers: REST endpoints for
// settings, printers and uploads, an SSE stream for printer-side transfer
// progress, and a WebSocket that pushes relay events and accepts printer
// actions.

mod routes;
mod socket;

use std::future::Future;

use axum::Json;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use chitui_core::error::ChituiError;
use chitui_core::human_errors::humanize_error;

use crate::services::app_services::AppServices;

/// Build the router (exposed for testing).
pub fn build_router(svc: AppServices) -> Router {
    Router::new()
        .route("/status", get(routes::get_status))
        .route("/settings", get(routes::get_settings).post(routes::post_settings))
        .route("/discover", post(routes::discover))
        .route("/printer/manual", post(routes::add_manual_printer))
        .route("/printer/{id}", delete(routes::remove_printer))
        .route("/progress", get(routes::progress))
        .route(
            "/upload",
            post(routes::upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/upload/{upload_id}", get(routes::upload_job))
        .route("/usb-gadget/refresh", post(routes::refresh_usb_gadget))
        .route("/thumbnail/{id}", get(routes::thumbnail))
        .route("/camera/{id}", get(routes::camera))
        .route("/ws", get(socket::ws_handler))
        .with_state(svc)
        .layer(TraceLayer::new_for_http())
}

/// Serve the dashboard surface on `listener` until `shutdown` resolves.
pub async fn serve(
    svc: AppServices,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "dashboard surface listening");
    }
    axum::serve(listener, build_router(svc))
        .with_graceful_shutdown(shutdown)
        .await
}

// -- Errors -------------------------------------------------------------------

/// HTTP status for a relay error.
pub(crate) fn status_for(err: &ChituiError) -> StatusCode {
    match err {
        ChituiError::UnknownDevice(_) => StatusCode::NOT_FOUND,
        ChituiError::DuplicateIdentity(_)
        | ChituiError::UnsupportedFile(_)
        | ChituiError::GadgetUnavailable
        | ChituiError::Settings(_) => StatusCode::BAD_REQUEST,
        ChituiError::SessionNotConnected(_) | ChituiError::SessionRemoved(_) => StatusCode::CONFLICT,
        ChituiError::UploadInProgress => StatusCode::TOO_MANY_REQUESTS,
        ChituiError::CommandTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ChituiError::PrinterRejected { .. } | ChituiError::Transport(_) | ChituiError::ProtocolMismatch { .. } => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A relay error rendered as `{success: false, message, suggestion}`.
pub(crate) struct ApiError(pub ChituiError);

impl From<ChituiError> for ApiError {
    fn from(err: ChituiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let human = humanize_error(&self.0);
        (
            status_for(&self.0),
            Json(json!({
                "success": false,
                "message": human.message,
                "suggestion": human.suggestion,
                "error": self.0.to_string(),
            })),
        )
            .into_response()
    }
}
