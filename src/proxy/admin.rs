//! Admin HTTP surface.
//!
//! A small axum router served connection-by-connection over the same
//! listener type as the RESP endpoints, so the admin UI shares the TLS
//! path and the one-second-deadline shutdown polling. Handlers hold no
//! mutable state of their own — everything goes through the coordinator
//! handle — and panics are converted into 500s.

use std::time::Duration;

use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::timeout;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, info, warn};

use super::acceptor::listening;
use super::addr::Listener;
use super::coordinator::ProxyHandle;

const STATUS_PAGE: &str = r#"<!DOCTYPE html>
<html>
	<head>
		<title>Proxy status</title>
	</head>
	<body>
		<pre>
%INFO%
		</pre>
		<div>As JSON: <a href="info.json">here</a></div>
		<form action="/cmd/" method="POST">
			<button type="submit" name="cmd" value="pause">pause</button>
			<button type="submit" name="cmd" value="pause-and-wait">pause and wait</button>
			<button type="submit" name="cmd" value="unpause">unpause</button>
			<button type="submit" name="cmd" value="reload">reload [=pause+reload config+unpause]</button>
			<button type="submit" name="cmd" value="terminate-raw-connections">terminate raw connections</button>
		</form>
	</body>
</html>
"#;

#[derive(Clone)]
struct AdminState {
    handle: ProxyHandle,
}

#[derive(Deserialize)]
struct CmdForm {
    cmd: String,
}

#[derive(Serialize)]
struct CmdResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn router(handle: ProxyHandle) -> Router {
    Router::new()
        .route("/", get(status_page))
        .route("/info.json", get(info_json))
        .route("/status.json", get(status_json))
        .route("/cmd/", post(run_cmd))
        .layer(CatchPanicLayer::new())
        .with_state(AdminState { handle })
}

async fn status_page(State(state): State<AdminState>) -> Response {
    match state.handle.info().await {
        Ok(info) => {
            let report = info.sanitized_for_publication();
            let text = serde_json::to_string_pretty(&report).unwrap_or_default();
            Html(STATUS_PAGE.replace("%INFO%", &text)).into_response()
        }
        Err(_) => proxy_gone(),
    }
}

async fn info_json(State(state): State<AdminState>) -> Response {
    match state.handle.info().await {
        Ok(info) => Json(info.sanitized_for_publication()).into_response(),
        Err(_) => proxy_gone(),
    }
}

/// Pre-`info.json` snapshot shape. Deprecated: kept only for tooling that
/// still scrapes it.
async fn status_json(State(state): State<AdminState>) -> Response {
    match state.handle.info().await {
        Ok(info) => Json(json!({
            "activeRequests": info.active_requests,
            "config": info.config.sanitized_for_publication(),
            "stateStr": info.state.as_str(),
        }))
        .into_response(),
        Err(_) => proxy_gone(),
    }
}

async fn run_cmd(State(state): State<AdminState>, Form(form): Form<CmdForm>) -> Response {
    info!("admin command: {}", form.cmd);
    let result = match form.cmd.as_str() {
        "pause" => state.handle.pause().await,
        "pause-and-wait" => state.handle.pause_and_wait().await,
        "unpause" => state.handle.unpause().await,
        "reload" => state.handle.reload().await,
        "terminate-raw-connections" => state.handle.terminate_raw_connections().await,
        other => {
            let body = Json(CmdResponse {
                ok: false,
                error: Some(format!("unknown command: '{}'", other)),
            });
            return (StatusCode::BAD_REQUEST, body).into_response();
        }
    };
    Json(CmdResponse {
        ok: result.is_ok(),
        error: result.err().map(|err| err.to_string()),
    })
    .into_response()
}

fn proxy_gone() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "proxy is stopped").into_response()
}

pub async fn run_admin(listener: Listener, handle: ProxyHandle) {
    let app = router(handle.clone());

    while listening(&handle).await {
        let incoming = match timeout(Duration::from_secs(1), listener.accept()).await {
            Err(_) => continue,
            Ok(Err(err)) => {
                warn!("error accepting an admin connection: {}", err);
                continue;
            }
            Ok(Ok(incoming)) => incoming,
        };

        let app = app.clone();
        tokio::spawn(async move {
            let (stream, peer) = match incoming.establish().await {
                Ok(conn) => conn,
                Err(err) => {
                    debug!("could not establish admin connection: {}", err);
                    return;
                }
            };
            let service = TowerToHyperService::new(app);
            let result = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await;
            if let Err(err) = result {
                debug!("admin connection {} ended with error: {}", peer, err);
            }
        });
    }
}
