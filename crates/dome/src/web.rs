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

use crate::api::{Command, DomeApi, Outcome};

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(api: DomeApi) -> Router {
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

/// `GET /api?json={"cmd":...}`, the form the site scripts use.
async fn api_query(State(api): State<DomeApi>, Query(params): Query<ApiParams>) -> Response {
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
    State(api): State<DomeApi>,
    body: Result<Json<Command>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(cmd)) => respond(api.execute(cmd).await),
        Err(_) => wrong_syntax(),
    }
}

async fn api_status(State(api): State<DomeApi>) -> Response {
    respond(api.execute(Command::Status).await)
}

fn wrong_syntax() -> Response {
    (StatusCode::BAD_REQUEST, Json(Reply::wrong_syntax())).into_response()
}

/// Rejections are still a 200: the outcome is in `rsp`.
fn respond(result: Result<Outcome, ControlError>) -> Response {
    match result {
        Ok(Outcome::Done) => Json(Reply::done()).into_response(),
        Ok(Outcome::Status(status)) => Json(status).into_response(),
        Ok(Outcome::EncoderConfig(report)) => Json(report).into_response(),
        Err(e) => Json(Reply::error(&e)).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(api: DomeApi) -> Result<()> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::rig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn app() -> Router {
        let r = rig(30).await;
        router(DomeApi::new(r.dome, Duration::from_millis(300)))
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn status_endpoint_reports_kebab_case_fields() {
        let (status, body) = call(app().await, get_req("/api/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dome-azimuth"], 30);
        assert_eq!(body["movement-status"], false);
        assert_eq!(body["optoin"]["auto"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn query_form_accepts_url_encoded_json() {
        let uri = "/api?json=%7B%22cmd%22%3A%22find-zero%22%7D";
        let (status, body) = call(app().await, get_req(uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rsp"], "done");
    }

    #[tokio::test(start_paused = true)]
    async fn query_without_json_param() {
        let (status, body) = call(app().await, get_req("/api?cmd=park")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["rsp"], "Error: unknown params");
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_json_is_wrong_syntax() {
        let uri = "/api?json=%7Bnope";
        let (status, body) = call(app().await, get_req(uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["rsp"], "Error: wrong syntax");
    }

    #[tokio::test(start_paused = true)]
    async fn post_command_rejection_is_in_rsp() {
        let req = Request::post("/api/command")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"cmd":"slew-to-az","az-target":400}"#))
            .unwrap();
        let (status, body) = call(app().await, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rsp"], "Error: target out of bound");
    }

    #[tokio::test(start_paused = true)]
    async fn post_unknown_command_is_wrong_syntax() {
        let req = Request::post("/api/command")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"cmd":"restart-universe"}"#))
            .unwrap();
        let (status, body) = call(app().await, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["rsp"], "Error: wrong syntax");
    }
}
