use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use observatory_common::{ControlError, Reply};

use crate::api::{Command, Outcome, ShutterApi};

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(api: ShutterApi) -> Router {
    Router::new()
        .route("/api", get(api_query))
        .route("/api/status", get(api_status))
        .route("/api/command", post(api_command))
        .with_state(api)
}

#[derive(Deserialize)]
struct ApiParams {
    json: Option<String>,
}

async fn api_query(State(api): State<ShutterApi>, Query(params): Query<ApiParams>) -> Response {
    let Some(raw) = params.json else {
        return (
            StatusCode::BAD_REQUEST,
            Json(Reply {
                rsp: "Error: unknown params".into(),
            }),
        )
            .into_response();
    };
    match serde_json::from_str::<Command>(&raw) {
        Ok(cmd) => respond(api.execute(cmd).await),
        Err(_) => wrong_syntax(),
    }
}

async fn api_command(
    State(api): State<ShutterApi>,
    body: Result<Json<Command>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(cmd)) => respond(api.execute(cmd).await),
        Err(_) => wrong_syntax(),
    }
}

async fn api_status(State(api): State<ShutterApi>) -> Response {
    respond(api.execute(Command::Status).await)
}

fn wrong_syntax() -> Response {
    (StatusCode::BAD_REQUEST, Json(Reply::wrong_syntax())).into_response()
}

fn respond(result: Result<Outcome, ControlError>) -> Response {
    match result {
        Ok(Outcome::Done) => Json(Reply::done()).into_response(),
        Ok(Outcome::Status(report)) => Json(report).into_response(),
        Err(e) => Json(Reply::error(&e)).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(api: ShutterApi) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web: api listening");

    axum::serve(listener, router(api))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
