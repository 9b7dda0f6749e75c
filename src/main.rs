//! Boot, HTTP boundary, and graceful shutdown for the live reaction hub.

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use hyper::header::HeaderValue;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{error, info};
use serde::Serialize;
use tokio::sync::watch;

use live_reaction_server::aggregator::Aggregator;
use live_reaction_server::clock::{iso_now, now_ms};
use live_reaction_server::config::Config;
use live_reaction_server::connection::handle_connection;
use live_reaction_server::db::Database;
use live_reaction_server::hub::Hub;
use live_reaction_server::store::{ActiveUserOverview, ReactionStore};
use live_reaction_server::AppContext;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            process::exit(2);
        }
    };

    if let Err(e) = run(config).await {
        eprintln!("fatal: {e}");
        process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), String> {
    let db = Database::connect(&config.database_url).await?;
    let ctx = AppContext {
        store: Arc::new(ReactionStore::new()),
        hub: Arc::new(Hub::new()),
        db,
    };

    // Flipped exactly once, at shutdown. Observed by the aggregator and
    // every connection.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let aggregator = Aggregator::new(ctx.store.clone(), ctx.hub.clone(), ctx.db.clone());
    let aggregator_task = tokio::spawn(aggregator.run(shutdown_rx.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let frontend_url = config.frontend_url.clone();
    let svc_ctx = ctx.clone();
    let svc_shutdown = shutdown_rx.clone();
    let make_svc = make_service_fn(move |_conn| {
        let ctx = svc_ctx.clone();
        let frontend_url = frontend_url.clone();
        let shutdown = svc_shutdown.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                handle_request(req, ctx.clone(), frontend_url.clone(), shutdown.clone())
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| format!("failed to bind {addr}: {e}"))?
        .serve(make_svc);

    info!("live reaction hub listening on http://{addr}");
    info!("WebSocket endpoint: ws://{addr}/ws");

    let graceful = server.with_graceful_shutdown(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!("failed to listen for shutdown signal: {e}"),
        }
    });
    graceful.await.map_err(|e| format!("server error: {e}"))?;

    // Stop the tick loop, tell every connection to close, then flush.
    let _ = shutdown_tx.send(true);
    ctx.hub.close_all();
    let _ = aggregator_task.await;
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    ctx.db.close().await;
    info!("shutdown complete");
    Ok(())
}

// ============================================
// HTTP boundary
// ============================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RootStatus {
    running: bool,
    connections: usize,
    database: String,
    time: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HubStatus {
    connections: usize,
    users: Vec<String>,
    dropped_frames: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AggregationDebug {
    active_users: Vec<ActiveUserOverview>,
}

async fn handle_request(
    mut req: Request<Body>,
    ctx: AppContext,
    frontend_url: String,
    shutdown: watch::Receiver<bool>,
) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // CORS preflight for the browser frontend.
    if method == Method::OPTIONS {
        let response = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("Access-Control-Max-Age", "86400")
            .body(Body::empty())
            .unwrap();
        return Ok(cors(response, &frontend_url));
    }

    if path == "/ws" {
        if hyper_tungstenite::is_upgrade_request(&req) {
            match hyper_tungstenite::upgrade(&mut req, None) {
                Ok((response, websocket)) => {
                    tokio::spawn(async move {
                        match websocket.await {
                            Ok(ws) => handle_connection(ws, ctx, shutdown).await,
                            Err(e) => error!("WebSocket handshake failed: {e}"),
                        }
                    });
                    return Ok(response);
                }
                Err(e) => {
                    error!("WebSocket upgrade error: {e}");
                    let response = plain(StatusCode::BAD_REQUEST, "invalid WebSocket upgrade");
                    return Ok(cors(response, &frontend_url));
                }
            }
        }
        return Ok(cors(
            plain(StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required"),
            &frontend_url,
        ));
    }

    let response = match path.as_str() {
        "/" if method == Method::GET => json(
            StatusCode::OK,
            &RootStatus {
                running: true,
                connections: ctx.hub.count(),
                database: ctx.db.display_path().to_string(),
                time: iso_now(),
            },
        ),
        "/health" if method == Method::GET => plain(StatusCode::OK, "ok"),
        "/status" if method == Method::GET => json(
            StatusCode::OK,
            &HubStatus {
                connections: ctx.hub.count(),
                users: ctx.hub.user_ids(),
                dropped_frames: ctx.hub.dropped_frames(),
            },
        ),
        "/debug/aggregation" if method == Method::GET => json(
            StatusCode::OK,
            &AggregationDebug {
                active_users: ctx.store.active_overview(now_ms()),
            },
        ),
        "/debug/database" if method == Method::GET => match ctx.db.debug_snapshot(5).await {
            Ok(snapshot) => json(StatusCode::OK, &snapshot),
            Err(e) => {
                error!("database debug endpoint: {e}");
                plain(StatusCode::INTERNAL_SERVER_ERROR, "database unavailable")
            }
        },
        _ => plain(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(cors(response, &frontend_url))
}

fn plain(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap()
}

fn json<T: Serialize>(status: StatusCode, payload: &T) -> Response<Body> {
    match serde_json::to_string(payload) {
        Ok(body) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .unwrap(),
        Err(e) => {
            error!("serializing response body: {e}");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "serialization failure")
        }
    }
}

fn cors(mut response: Response<Body>, frontend_url: &str) -> Response<Body> {
    let origin = HeaderValue::from_str(frontend_url)
        .unwrap_or_else(|_| HeaderValue::from_static("*"));
    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", origin);
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type"),
    );
    response
}
