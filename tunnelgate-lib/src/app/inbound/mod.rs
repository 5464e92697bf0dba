//! The websocket front door: every upgraded socket becomes one relay
//! session on its own task.

use std::{
    net::SocketAddr,
    sync::{Arc, LazyLock},
};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, FromRequest, Request, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::StreamExt;
use http::{HeaderMap, HeaderName, StatusCode, header};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::{
    app::session_table::SessionTable,
    config::{RelayConfig, RuntimeConfig},
    proxy::{relay::RelaySession, transport::WebsocketTransport, utils::Dialer},
    session::TargetAddr,
};

static FALLBACK_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/(.+[:=-]\d+)$").expect("fallback path regex must compile")
});

/// A per-session fallback target carried in the request path, e.g.
/// `/proxy.example.com:443` or `/1.2.3.4-443`.
pub fn fallback_from_path(path: &str) -> Option<TargetAddr> {
    let raw = FALLBACK_PATH_RE.captures(path)?.get(1)?.as_str();
    match raw.parse() {
        Ok(target) => Some(target),
        Err(e) => {
            debug!("ignoring fallback in path {}: {}", path, e);
            None
        }
    }
}

pub fn is_request_websocket(header: &HeaderMap) -> bool {
    trace!(
        "Checking if request is a WebSocket upgrade, headers: {:?}",
        header
    );
    header
        .get(header::CONNECTION)
        .and_then(|x| x.to_str().ok().map(|x| x.to_ascii_lowercase()))
        // Firefox sends "Connection: keep-alive, Upgrade"
        .is_some_and(|x| x.contains("upgrade"))
        && header
            .get(header::UPGRADE)
            .and_then(|x| x.to_str().ok().map(|x| x.to_ascii_lowercase()))
            .as_deref()
            == Some("websocket")
}

#[derive(Clone)]
struct ListenerState {
    relay: Arc<RelayConfig>,
    early_data_header: HeaderName,
    dialer: Arc<dyn Dialer>,
    sessions: SessionTable,
}

pub struct InboundListener {
    listen: SocketAddr,
    state: ListenerState,
}

impl InboundListener {
    pub fn new(
        config: &RuntimeConfig,
        dialer: Arc<dyn Dialer>,
        sessions: SessionTable,
    ) -> Self {
        Self {
            listen: config.listen,
            state: ListenerState {
                relay: config.relay.clone(),
                early_data_header: config.early_data_header.clone(),
                dialer,
                sessions,
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/sessions", get(handle_sessions))
            .fallback(handle_tunnel)
            .with_state(self.state.clone())
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
    }

    /// Serves until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> crate::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen).await?;
        info!("tunnel listener bound on {}", listener.local_addr()?);
        self.serve(listener, cancel).await
    }

    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        cancel: CancellationToken,
    ) -> crate::Result<()> {
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            info!("tunnel listener is closed");
        })
        .await?;
        Ok(())
    }
}

async fn handle_sessions(
    headers: HeaderMap,
    State(state): State<ListenerState>,
    req: Request<Body>,
) -> Response {
    if is_request_websocket(&headers) {
        return upgrade(state, headers, req).await;
    }
    Json(state.sessions.snapshot()).into_response()
}

async fn handle_tunnel(
    headers: HeaderMap,
    State(state): State<ListenerState>,
    req: Request<Body>,
) -> Response {
    if !is_request_websocket(&headers) {
        return (StatusCode::BAD_REQUEST, "expected a websocket upgrade")
            .into_response();
    }
    upgrade(state, headers, req).await
}

async fn upgrade(
    state: ListenerState,
    headers: HeaderMap,
    req: Request<Body>,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let fallback = fallback_from_path(req.uri().path());
    let early_data = headers
        .get(&state.early_data_header)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let mut ws = match WebSocketUpgrade::from_request(req, &state).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("ws upgrade error: {}", e);
            return e.into_response();
        }
    };
    // strict clients insist on the offered subprotocol coming back
    if state.early_data_header == header::SEC_WEBSOCKET_PROTOCOL {
        if let Some(value) = &early_data {
            ws = ws.protocols([value.clone()]);
        }
    }

    ws.on_failed_upgrade(|e| {
        warn!("ws upgrade error: {}", e);
    })
    .on_upgrade(move |socket| {
        let tracker = state.sessions.track(peer);
        let span = info_span!("session", id = %tracker.id());
        async move {
            debug!(
                "accepted from {}",
                peer.map(|p| p.to_string())
                    .unwrap_or_else(|| "unknown".to_owned())
            );
            let session =
                RelaySession::new(state.relay, state.dialer, fallback, tracker);
            let (writer, reader) = WebsocketTransport::new(socket).split();
            // the outcome is logged by the session itself
            let _ = session.run(reader, writer, early_data).await;
        }
        .instrument(span)
    })
}
