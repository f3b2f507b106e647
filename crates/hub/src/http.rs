//! HTTP surface: the `/ws` upgrade endpoint, a tiny `/` status page and
//! `GET /api/places` for introspection (supplements §6's sketch of the
//! hub's externally-visible surface), mirroring the shape of the
//! corpus's own agent-listing endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::auth::AuthPolicy;
use crate::session::SessionRole;
use crate::state::HubContext;
use crate::ws::{self, Outboxes};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<HubContext>,
    pub auth: Arc<dyn AuthPolicy>,
    pub outboxes: Outboxes,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/", get(status_page))
        .route("/api/places", get(list_places))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    role: Option<String>,
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let role = match query.role.as_deref() {
        Some("exporter") => SessionRole::Exporter,
        _ => SessionRole::Agent,
    };
    ws.on_upgrade(move |socket| {
        ws::handle_socket(
            socket,
            state.hub,
            state.auth,
            state.outboxes,
            role,
            query.token,
            remote_addr,
        )
    })
}

#[derive(Serialize)]
struct PlaceListItem {
    place_id: boardshare_model::PlaceId,
    host: String,
    port: u16,
    part_count: usize,
}

/// `GET /api/places` (§6: "introspection surface"): the current place
/// registry, without reservation state.
async fn list_places(State(state): State<AppState>) -> Json<Vec<PlaceListItem>> {
    let places = state.hub.list_places().await;
    Json(
        places
            .into_iter()
            .map(|p| PlaceListItem {
                place_id: p.id,
                host: p.host,
                port: p.port,
                part_count: p.parts.len(),
            })
            .collect(),
    )
}

async fn status_page(State(state): State<AppState>) -> Html<String> {
    let places = state.hub.list_places().await;
    let rows: String = places
        .iter()
        .map(|p| format!("<tr><td>{}</td><td>{}:{}</td><td>{}</td></tr>", p.id, p.host, p.port, p.parts.len()))
        .collect();
    Html(format!(
        "<html><head><title>boardshare hub</title></head><body>\
         <h1>boardshare hub</h1>\
         <table border=\"1\"><tr><th>place</th><th>address</th><th>parts</th></tr>{rows}</table>\
         </body></html>"
    ))
}
