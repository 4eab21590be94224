//! Admin HTTP API.
//!
//! Introspection of live sessions and rooms, server-originated message
//! injection, credential provisioning and forced disconnects. Every route
//! requires the configured static key presented verbatim in the
//! `Authorization` header; requests are logged with method, URI, status and
//! duration.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::db::{Db, User};
use crate::jid;
use crate::state::Registry;
use crate::xml::Element;

/// Shared context for every API handler.
#[derive(Clone)]
pub struct ApiContext {
    pub registry: Arc<Registry>,
    pub db: Db,
    /// Static key compared verbatim against the `Authorization` header.
    pub key: String,
}

/// Build the admin router.
pub fn router(ctx: ApiContext) -> Router {
    Router::new()
        .route("/api/sessions", get(get_sessions))
        .route("/api/rooms", get(get_rooms))
        .route("/api/users/{to}/message", post(send_user_message))
        .route("/api/rooms/{to}/message", post(send_room_message))
        .route("/api/users", post(upsert_user))
        .route("/api/users/{user}", delete(delete_user))
        .route("/api/users/{user}/kick", post(kick_user))
        .layer(middleware::from_fn_with_state(ctx.clone(), require_key))
        .layer(middleware::from_fn(log_request))
        .with_state(ctx)
}

/// Serve the admin API on an already bound listener.
pub async fn serve(ctx: ApiContext, listener: TcpListener) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "admin api listening");
    axum::serve(listener, router(ctx)).await
}

async fn require_key(State(ctx): State<ApiContext>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented != ctx.key {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(request).await
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();
    let response = next.run(request).await;
    info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        elapsed = ?start.elapsed(),
        "api request"
    );
    response
}

async fn get_sessions(State(ctx): State<ApiContext>) -> Json<Vec<String>> {
    Json(ctx.registry.sessions())
}

#[derive(Serialize)]
struct RoomInfo {
    name: String,
    members: Vec<String>,
}

async fn get_rooms(State(ctx): State<ApiContext>) -> Json<Vec<RoomInfo>> {
    let rooms = ctx
        .registry
        .room_snapshots()
        .into_iter()
        .map(|room| RoomInfo {
            name: jid::node(&room.jid).to_string(),
            members: room
                .member_jids
                .iter()
                .map(|m| jid::node(m).to_string())
                .collect(),
        })
        .collect();
    Json(rooms)
}

#[derive(Deserialize)]
struct MessageBody {
    #[serde(default)]
    from: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    subject: String,
}

async fn send_user_message(
    State(ctx): State<ApiContext>,
    Path(to): Path<String>,
    payload: Result<Json<MessageBody>, JsonRejection>,
) -> StatusCode {
    inject_message(&ctx, &to, payload, false)
}

async fn send_room_message(
    State(ctx): State<ApiContext>,
    Path(to): Path<String>,
    payload: Result<Json<MessageBody>, JsonRejection>,
) -> StatusCode {
    inject_message(&ctx, &to, payload, true)
}

/// Build a `<message>` stanza from the request body and hand it to the
/// router. `from` is taken as given: admin callers are trusted. Delivery is
/// not confirmed; a well-formed request is always a 200.
fn inject_message(
    ctx: &ApiContext,
    to: &str,
    payload: Result<Json<MessageBody>, JsonRejection>,
    room: bool,
) -> StatusCode {
    let Json(body) = match payload {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "error handling request");
            return StatusCode::BAD_REQUEST;
        }
    };

    let mut el = Element::new("message", "jabber:client");
    let mut body_el = Element::new("body", "jabber:client");
    body_el.text = body.body;
    let mut subject_el = Element::new("subject", "jabber:client");
    subject_el.text = body.subject;
    el.children.push(body_el);
    el.children.push(subject_el);

    el.set_attr("from", body.from);
    let service = if room {
        format!("conference.{}", ctx.registry.domain())
    } else {
        ctx.registry.domain().to_string()
    };
    el.set_attr("to", format!("{to}@{service}"));
    if room {
        el.set_attr("type", "groupchat");
    }
    ctx.registry.route_message(el);
    StatusCode::OK
}

#[derive(Deserialize)]
struct UserBody {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

async fn upsert_user(
    State(ctx): State<ApiContext>,
    payload: Result<Json<UserBody>, JsonRejection>,
) -> StatusCode {
    let Json(body) = match payload {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "error handling request");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };
    if !jid::node_valid(&body.username) {
        return StatusCode::BAD_REQUEST;
    }
    match ctx.db.upsert_user(&User {
        name: body.username,
        password: body.password.into_bytes(),
    }) {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "error handling request");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn delete_user(State(ctx): State<ApiContext>, Path(user): Path<String>) -> StatusCode {
    match ctx.db.delete_user(&user) {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "error handling request");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn kick_user(State(ctx): State<ApiContext>, Path(user): Path<String>) -> StatusCode {
    ctx.registry
        .kick_user(&format!("{user}@{}", ctx.registry.domain()));
    StatusCode::OK
}
