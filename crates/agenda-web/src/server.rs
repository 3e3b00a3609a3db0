use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::header::ORIGIN;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use libagenda::cache::MemoryCache;
use libagenda::cipher::{self, CipherSettings};
use libagenda::notify::{HttpMailer, LogMailer, Notifier};
use libagenda::store::SqliteStorage;
use libagenda::{Services, SessionManager};
use serde::Deserialize;
use serde_json::{Value, json};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::WebConfig;
use crate::ws;

pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub config: WebConfig,
    about: Option<Value>,
}

impl AppState {
    /// Open storage, wire up collaborators and start the session manager.
    pub async fn build(config: WebConfig) -> Result<Arc<Self>> {
        let storage = match &config.db_path {
            Some(path) => SqliteStorage::open(path)?,
            None => SqliteStorage::open_in_memory()?,
        };

        let seed = config.availability_rows();
        if !seed.is_empty() {
            let days = seed.len();
            storage
                .replace_availability(seed)
                .await
                .context("failed to install configured availability")?;
            tracing::info!(rows = days, "installed configured availability");
        }

        let notifier: Arc<dyn Notifier> = match &config.mail.endpoint {
            Some(endpoint) => {
                tracing::info!(%endpoint, "delivering notifications through mail relay");
                Arc::new(HttpMailer::new(endpoint, &config.mail.owner_address))
            }
            None => Arc::new(LogMailer),
        };

        let about = match &config.about_path {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("failed to read about document {}", path.display()))?;
                let doc: Value = serde_json::from_str(&raw)
                    .with_context(|| format!("invalid about document {}", path.display()))?;
                Some(doc)
            }
            None => None,
        };

        let services = Arc::new(Services {
            storage: Arc::new(storage),
            cache: Arc::new(MemoryCache::new()),
            notifier,
            cipher: config.cipher.clone(),
        });
        let manager = SessionManager::new(services, config.manager_settings());

        Ok(Arc::new(Self {
            manager,
            config,
            about,
        }))
    }
}

pub fn router(state: Arc<AppState>) -> Result<Router> {
    let cors = build_cors(&state.config.allow_origins)?;
    Ok(Router::new()
        .route("/health", get(health))
        .route("/about", get(about))
        .route("/zypher", post(zypher))
        .route("/schedule", get(ws_schedule))
        .layer(cors)
        .with_state(state))
}

/// Serve until `shutdown` resolves, then stop every session and background task.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(Arc::clone(&state))?;
    let manager = Arc::clone(&state.manager);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        tracing::info!("shutting down");
        manager.shutdown().await;
    })
    .await
    .context("server error")?;
    Ok(())
}

fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any))
}

/// Requests without an `Origin` header come from non-browser clients and pass.
fn origin_allowed(allowed: &[String], origin: Option<&HeaderValue>) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    allowed.iter().any(|a| a == "*" || a == origin)
}

fn client_addr(headers: &HeaderMap, peer: SocketAddr, trust_forwarded: bool) -> SocketAddr {
    if !trust_forwarded {
        return peer;
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| IpAddr::from_str(first.trim()).ok())
        .map(|ip| SocketAddr::new(ip, peer.port()))
        .unwrap_or(peer)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.manager.session_count().await,
    }))
}

async fn about(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(doc) = &state.about else {
        return (StatusCode::NOT_FOUND, "about document not configured").into_response();
    };
    let addr = client_addr(&headers, peer, state.config.trust_forwarded_for);
    state.manager.track_visit(addr.ip());
    Json(doc.clone()).into_response()
}

#[derive(Debug, Deserialize)]
struct ZypherQuery {
    txt: Option<String>,
    shft: Option<String>,
    shftcount: Option<String>,
    hshcount: Option<String>,
    alt: Option<String>,
    ignspace: Option<String>,
    restricthash: Option<String>,
}

fn param<T: FromStr>(value: Option<&str>, name: &str) -> Result<T, (StatusCode, String)> {
    value
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("invalid '{name}' parameter")))
}

async fn zypher(
    Query(query): Query<ZypherQuery>,
) -> std::result::Result<Json<Value>, (StatusCode, String)> {
    let settings = CipherSettings {
        shift: param(query.shft.as_deref(), "shift")?,
        shift_count: param(query.shftcount.as_deref(), "shiftCount")?,
        hash_count: param(query.hshcount.as_deref(), "hashCount")?,
        alternate: param(query.alt.as_deref(), "alternate")?,
        ign_space: param(query.ignspace.as_deref(), "ignoreSpace")?,
        restrict_hash: param(query.restricthash.as_deref(), "restrictHash")?,
    };
    let text = query.txt.unwrap_or_default();
    match cipher::zyph(&text, &settings) {
        Ok(result) => Ok(Json(json!({ "result": result }))),
        Err(e) => {
            tracing::debug!(error = %e, "zypher request rejected");
            Err((StatusCode::BAD_REQUEST, e.to_string()))
        }
    }
}

async fn ws_schedule(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if !origin_allowed(&state.config.allow_origins, headers.get(ORIGIN)) {
        tracing::warn!(%peer, origin = ?headers.get(ORIGIN), "rejected websocket origin");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    let addr = client_addr(&headers, peer, state.config.trust_forwarded_for);
    let max_message = state.config.max_message_bytes;
    ws.max_message_size(max_message)
        .max_frame_size(max_message)
        .on_upgrade(move |socket| ws::run_session(socket, state, addr))
}
