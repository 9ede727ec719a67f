use std::{
    collections::HashMap,
    env,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Multipart, Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{mpsc, Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::{
    chat_state::{ChatStateRegistry, DEFAULT_SUSPEND},
    faq::{self, DEFAULT_FAQ_THRESHOLD},
    store::{PgTenantStore, StoreError, TenantStore},
    transport::{request_automation_reply, Transport, TransportError, WhatsappBridge},
    types::*,
};

/// Pause between recipients on bulk sends; the transport is rate sensitive.
pub const BULK_SEND_DELAY: Duration = Duration::from_millis(1500);

/// Most recent records returned by the message-log endpoint.
const MESSAGE_PAGE: usize = 100;

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    pub tenant_by_client: HashMap<usize, String>,
}

pub struct AppState {
    pub store: Arc<dyn TenantStore>,
    pub registry: Arc<ChatStateRegistry>,
    pub transport: Arc<dyn Transport>,
    pub http: reqwest::Client,
    pub webhook_url: Option<String>,
    pub faq_threshold: f64,
    pub bulk_send_delay: Duration,
    pub messages: RwLock<HashMap<String, Vec<MessageRecord>>>,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
}

impl AppState {
    pub fn new(
        store: Arc<dyn TenantStore>,
        registry: Arc<ChatStateRegistry>,
        transport: Arc<dyn Transport>,
        webhook_url: Option<String>,
    ) -> Self {
        Self {
            store,
            registry,
            transport,
            http: reqwest::Client::new(),
            webhook_url,
            faq_threshold: DEFAULT_FAQ_THRESHOLD,
            bulk_send_delay: BULK_SEND_DELAY,
            messages: RwLock::new(HashMap::new()),
            realtime: Mutex::new(RealtimeState::default()),
            next_client_id: AtomicUsize::new(0),
        }
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Chat handles are phone-number derived: `<digits>@c.us`. Group chats use
/// `@g.us` and the status feed is the `status@broadcast` pseudo-chat; both
/// stay out of the automation pipeline.
fn is_direct_chat(numero: &str) -> bool {
    Regex::new(r"^[0-9]+@c\.us$")
        .ok()
        .map(|re| re.is_match(numero.trim()))
        .unwrap_or(false)
}

fn normalize_chat_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.ends_with("@c.us") {
        trimmed.to_string()
    } else {
        format!("{trimmed}@c.us")
    }
}

/// Bare phone number for contact-directory lookups.
fn contact_number(chat_id: &str) -> &str {
    chat_id.trim_end_matches("@c.us")
}

fn event_payload<T: serde::Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

pub async fn broadcast_to_tenant<T: serde::Serialize>(
    state: &Arc<AppState>,
    tenant_id: &str,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let senders = {
        let rt = state.realtime.lock().await;
        rt.tenant_by_client
            .iter()
            .filter(|(_, tenant)| tenant.as_str() == tenant_id)
            .filter_map(|(client_id, _)| rt.clients.get(client_id).cloned())
            .collect::<Vec<_>>()
    };

    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

async fn persist_message(state: &Arc<AppState>, tenant_id: &str, record: MessageRecord) {
    let mut messages = state.messages.write().await;
    messages
        .entry(tenant_id.to_string())
        .or_default()
        .push(record);
}

/// What the router decided to do with an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Group chat, status broadcast or empty body; never reaches state logic.
    Ignored,
    /// Sender is on the exclusion list; persisted, no automation attempted.
    Excluded,
    /// Bot inactive for the chat or tenant; persisted as received-only.
    Suppressed,
    FaqAnswered,
    WebhookAnswered,
    /// Automation ran but produced no reply (miss, or webhook failure).
    NoReply,
}

impl RouteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteOutcome::Ignored => "ignored",
            RouteOutcome::Excluded => "excluded",
            RouteOutcome::Suppressed => "suppressed",
            RouteOutcome::FaqAnswered => "faq",
            RouteOutcome::WebhookAnswered => "webhook",
            RouteOutcome::NoReply => "no_reply",
        }
    }
}

async fn broadcast_bot_response(state: &Arc<AppState>, tenant_id: &str, numero: &str, reply: &str) {
    broadcast_to_tenant(
        state,
        tenant_id,
        "new_bot_response",
        json!({ "numero": numero, "respuesta": reply, "hora": now_iso() }),
    )
    .await;
}

/// Decide once, in order, how an inbound message is answered: filter, show
/// to operators, honor the exclusion list, check the per-chat and global bot
/// flags, try the FAQ catalog, then delegate to the automation webhook.
pub async fn handle_incoming_message(
    state: &Arc<AppState>,
    tenant_id: &str,
    numero: &str,
    nombre: Option<String>,
    mensaje: &str,
    hora: Option<String>,
) -> RouteOutcome {
    let body = mensaje.trim();
    if body.is_empty() || !is_direct_chat(numero) {
        debug!(tenant_id, numero, "ignoring group/status/empty message");
        return RouteOutcome::Ignored;
    }

    let numero = numero.trim();
    let mut record = MessageRecord {
        id: Uuid::new_v4().to_string(),
        numero: numero.to_string(),
        nombre,
        mensaje: body.to_string(),
        hora: hora.filter(|h| !h.trim().is_empty()).unwrap_or_else(now_iso),
        tipo: DIRECTION_RECEIVED.to_string(),
        respuesta: None,
    };

    // Operators see every message that passed the chat filter, including
    // ones automation will not touch.
    broadcast_to_tenant(state, tenant_id, "new_message", &record).await;

    if state
        .store
        .is_excluded(tenant_id, contact_number(numero))
        .await
    {
        info!(tenant_id, numero, "contact excluded from automation");
        persist_message(state, tenant_id, record).await;
        return RouteOutcome::Excluded;
    }

    let automation_allowed = state.registry.is_bot_active(tenant_id, numero).await
        && state.store.bot_config(tenant_id).await;
    if !automation_allowed {
        persist_message(state, tenant_id, record).await;
        return RouteOutcome::Suppressed;
    }

    if let Some(answer) = faq::faq_answer(body, state.faq_threshold) {
        if let Err(err) = state.transport.send_message(tenant_id, numero, answer).await {
            warn!(tenant_id, numero, error = %err, "failed to send FAQ reply");
        }
        broadcast_bot_response(state, tenant_id, numero, answer).await;
        record.respuesta = Some(answer.to_string());
        persist_message(state, tenant_id, record).await;
        return RouteOutcome::FaqAnswered;
    }

    let Some(webhook_url) = state.webhook_url.clone() else {
        persist_message(state, tenant_id, record).await;
        return RouteOutcome::NoReply;
    };

    match request_automation_reply(&state.http, &webhook_url, &record).await {
        Ok(Some(reply)) => {
            if let Err(err) = state.transport.send_message(tenant_id, numero, &reply).await {
                warn!(tenant_id, numero, error = %err, "failed to send webhook reply");
            }
            broadcast_bot_response(state, tenant_id, numero, &reply).await;
            record.respuesta = Some(reply);
            persist_message(state, tenant_id, record).await;
            RouteOutcome::WebhookAnswered
        }
        Ok(None) => {
            persist_message(state, tenant_id, record).await;
            RouteOutcome::NoReply
        }
        Err(err) => {
            // Fire and forget: the message stays in the log, the reply
            // opportunity is lost.
            warn!(tenant_id, numero, error = %err, "automation webhook call failed");
            persist_message(state, tenant_id, record).await;
            RouteOutcome::NoReply
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// An automated caller tried to speak into an operator-held chat.
    Suppressed,
}

/// Operator/automation send path. A manual send suspends the bot for the
/// chat *before* touching the transport, so the takeover sticks even when
/// the send itself fails.
pub async fn send_operator_message(
    state: &Arc<AppState>,
    tenant_id: &str,
    numero: &str,
    mensaje: &str,
    is_automated: bool,
) -> Result<SendOutcome, TransportError> {
    let chat_id = normalize_chat_id(numero);

    if is_automated {
        if !state.registry.is_bot_active(tenant_id, &chat_id).await {
            info!(tenant_id, chat_id = %chat_id, "suppressing automated send, operator holds the chat");
            return Ok(SendOutcome::Suppressed);
        }
    } else {
        state
            .registry
            .set_bot_state(tenant_id, &chat_id, false, true, DEFAULT_SUSPEND)
            .await;
    }

    state
        .transport
        .send_message(tenant_id, &chat_id, mensaje)
        .await?;

    let record = MessageRecord {
        id: Uuid::new_v4().to_string(),
        numero: chat_id,
        nombre: None,
        mensaje: mensaje.to_string(),
        hora: now_iso(),
        tipo: DIRECTION_SENT.to_string(),
        respuesta: None,
    };
    broadcast_to_tenant(state, tenant_id, "new_message", &record).await;
    persist_message(state, tenant_id, record).await;
    Ok(SendOutcome::Sent)
}

/// Split a newline- and/or comma-separated number list into cleaned,
/// deduplicated digit strings. Entries shorter than 8 digits are dropped.
pub fn parse_number_list(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut numbers = Vec::new();
    for line in raw.split(['\n', '\r']) {
        for piece in line.split(',') {
            let cleaned: String = piece.chars().filter(char::is_ascii_digit).collect();
            if cleaned.len() < 8 {
                continue;
            }
            if seen.insert(cleaned.clone()) {
                numbers.push(cleaned);
            }
        }
    }
    numbers
}

/// Send a batch as manual operator messages, one recipient at a time with a
/// fixed delay. Excluded recipients are skipped; a failed recipient is
/// logged and the batch carries on. Returns the count actually sent.
pub async fn send_bulk(
    state: &Arc<AppState>,
    tenant_id: &str,
    batch: Vec<(String, String)>,
) -> usize {
    let mut sent = 0usize;
    for (index, (number, mensaje)) in batch.iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(state.bulk_send_delay).await;
        }
        if state.store.is_excluded(tenant_id, number).await {
            info!(tenant_id, number = %number, "skipping excluded contact in bulk send");
            continue;
        }
        match send_operator_message(state, tenant_id, number, mensaje, false).await {
            Ok(SendOutcome::Sent) => sent += 1,
            Ok(SendOutcome::Suppressed) => {}
            Err(err) => {
                warn!(tenant_id, number = %number, error = %err, "bulk send failed for recipient");
            }
        }
    }
    sent
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

async fn auth_tenant_from_headers(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<String, (StatusCode, Json<Value>)> {
    let token = bearer_token(headers).ok_or((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "missing bearer token" })),
    ))?;

    state.store.tenant_for_token(&token).await.ok_or((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "invalid token" })),
    ))
}

/// Tenant-scoped routes must be called with a token issued for that tenant.
async fn authorize_tenant(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    tenant_id: &str,
) -> Result<(), (StatusCode, Json<Value>)> {
    let token_tenant = auth_tenant_from_headers(state, headers).await?;
    if token_tenant != tenant_id {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "token does not belong to this tenant" })),
        ));
    }
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn get_bot_state(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<BotStateQuery>,
) -> impl IntoResponse {
    let tenant_id = match auth_tenant_from_headers(&state, &headers).await {
        Ok(tenant_id) => tenant_id,
        Err(err) => return err.into_response(),
    };
    if query.conversation.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "conversation is required" })),
        )
            .into_response();
    }

    let chat_id = normalize_chat_id(&query.conversation);
    let active = state.registry.is_bot_active(&tenant_id, &chat_id).await;
    Json(json!({ "conversation": chat_id, "botActive": active })).into_response()
}

async fn set_bot_state(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SetBotStateBody>,
) -> impl IntoResponse {
    let tenant_id = match auth_tenant_from_headers(&state, &headers).await {
        Ok(tenant_id) => tenant_id,
        Err(err) => return err.into_response(),
    };
    if body.conversation.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "conversation is required" })),
        )
            .into_response();
    }

    let chat_id = normalize_chat_id(&body.conversation);
    let active = state
        .registry
        .set_bot_state(&tenant_id, &chat_id, body.is_active, false, DEFAULT_SUSPEND)
        .await;
    Json(json!({ "conversation": chat_id, "botActive": active })).into_response()
}

async fn toggle_bot_state(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    let tenant_id = match auth_tenant_from_headers(&state, &headers).await {
        Ok(tenant_id) => tenant_id,
        Err(err) => return err.into_response(),
    };
    let chat_id = normalize_chat_id(&conversation);
    let active = state
        .registry
        .toggle_bot_state(&tenant_id, &chat_id, false)
        .await;
    Json(json!({ "conversation": chat_id, "botActive": active })).into_response()
}

async fn deactivate_bot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation): Path<String>,
    body: Option<Json<DeactivateBody>>,
) -> impl IntoResponse {
    let tenant_id = match auth_tenant_from_headers(&state, &headers).await {
        Ok(tenant_id) => tenant_id,
        Err(err) => return err.into_response(),
    };
    let minutes = body
        .and_then(|Json(body)| body.duration_minutes)
        .unwrap_or(60);
    if minutes == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "durationMinutes must be positive" })),
        )
            .into_response();
    }

    let chat_id = normalize_chat_id(&conversation);
    let duration = Duration::from_secs(minutes * 60);
    state
        .registry
        .set_bot_state(&tenant_id, &chat_id, false, true, duration)
        .await;
    Json(json!({
        "conversation": chat_id,
        "botActive": false,
        "autoReactivationInMinutes": minutes,
    }))
    .into_response()
}

async fn reactivate_bot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    let tenant_id = match auth_tenant_from_headers(&state, &headers).await {
        Ok(tenant_id) => tenant_id,
        Err(err) => return err.into_response(),
    };
    let chat_id = normalize_chat_id(&conversation);
    let active = state.registry.manual_reactivate(&tenant_id, &chat_id).await;
    Json(json!({ "conversation": chat_id, "botActive": active })).into_response()
}

async fn list_bot_chats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let tenant_id = match auth_tenant_from_headers(&state, &headers).await {
        Ok(tenant_id) => tenant_id,
        Err(err) => return err.into_response(),
    };
    let chats = state.registry.list_conversations(&tenant_id);
    Json(json!({ "chats": chats })).into_response()
}

async fn get_config_chatbot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    if let Err(err) = authorize_tenant(&state, &headers, &tenant_id).await {
        return err.into_response();
    }
    let active = state.store.bot_config(&tenant_id).await;
    Json(json!({ "active": active })).into_response()
}

async fn put_config_chatbot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Json(body): Json<ConfigChatbotBody>,
) -> impl IntoResponse {
    if let Err(err) = authorize_tenant(&state, &headers, &tenant_id).await {
        return err.into_response();
    }
    let active = state.store.set_bot_config(&tenant_id, body.active).await;
    Json(json!({ "active": active })).into_response()
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    if let Err(err) = authorize_tenant(&state, &headers, &tenant_id).await {
        return err.into_response();
    }
    if body.numero.trim().is_empty() || body.mensaje.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "numero and mensaje are required" })),
        )
            .into_response();
    }

    match send_operator_message(
        &state,
        &tenant_id,
        &body.numero,
        &body.mensaje,
        body.is_automated,
    )
    .await
    {
        Ok(SendOutcome::Sent) => Json(json!({ "status": "sent" })).into_response(),
        Ok(SendOutcome::Suppressed) => {
            Json(json!({ "status": "suppressed", "suppressed": true })).into_response()
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn send_bulk_from_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Json(body): Json<BulkListBody>,
) -> impl IntoResponse {
    if let Err(err) = authorize_tenant(&state, &headers, &tenant_id).await {
        return err.into_response();
    }
    if body.numeros.trim().is_empty() || body.mensaje.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "numeros and mensaje are required" })),
        )
            .into_response();
    }

    let batch = parse_number_list(&body.numeros)
        .into_iter()
        .map(|number| (number, body.mensaje.clone()))
        .collect::<Vec<_>>();
    let total = batch.len();
    let sent = send_bulk(&state, &tenant_id, batch).await;
    Json(json!({ "status": "completed", "total": total, "sent": sent })).into_response()
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    numero: String,
    mensaje: String,
}

async fn multipart_file(multipart: &mut Multipart, field_name: &str) -> Option<Vec<u8>> {
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some(field_name) {
            return field.bytes().await.ok().map(|bytes| bytes.to_vec());
        }
    }
    None
}

async fn send_bulk_from_csv(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    if let Err(err) = authorize_tenant(&state, &headers, &tenant_id).await {
        return err.into_response();
    }
    let Some(bytes) = multipart_file(&mut multipart, "archivo").await else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "multipart field 'archivo' is required" })),
        )
            .into_response();
    };

    let mut batch = Vec::new();
    let mut reader = csv::Reader::from_reader(bytes.as_slice());
    for row in reader.deserialize::<CsvRow>() {
        match row {
            Ok(row) if !row.numero.trim().is_empty() && !row.mensaje.trim().is_empty() => {
                batch.push((row.numero.trim().to_string(), row.mensaje.trim().to_string()));
            }
            Ok(_) => {}
            Err(err) => {
                warn!(tenant_id = %tenant_id, error = %err, "skipping malformed CSV row");
            }
        }
    }

    let total = batch.len();
    let sent = send_bulk(&state, &tenant_id, batch).await;
    Json(json!({ "status": "completed", "total": total, "sent": sent })).into_response()
}

async fn send_bulk_from_txt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    if let Err(err) = authorize_tenant(&state, &headers, &tenant_id).await {
        return err.into_response();
    }
    let Some(bytes) = multipart_file(&mut multipart, "archivoTxt").await else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "multipart field 'archivoTxt' is required" })),
        )
            .into_response();
    };

    // Each line is `numero,mensaje`; the message may itself contain commas.
    let content = String::from_utf8_lossy(&bytes);
    let mut batch = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        let Some((numero, mensaje)) = line.split_once(',') else {
            continue;
        };
        let numero = numero.trim();
        let mensaje = mensaje.trim();
        if numero.is_empty() || mensaje.is_empty() {
            continue;
        }
        batch.push((numero.to_string(), mensaje.to_string()));
    }

    let total = batch.len();
    let sent = send_bulk(&state, &tenant_id, batch).await;
    Json(json!({ "status": "completed", "total": total, "sent": sent })).into_response()
}

async fn get_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    if let Err(err) = authorize_tenant(&state, &headers, &tenant_id).await {
        return err.into_response();
    }
    let messages = state.messages.read().await;
    let page = messages
        .get(&tenant_id)
        .map(|log| {
            log.iter()
                .rev()
                .take(MESSAGE_PAGE)
                .cloned()
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    Json(page).into_response()
}

async fn inbound_message_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Json(body): Json<InboundMessageBody>,
) -> impl IntoResponse {
    if let Err(err) = authorize_tenant(&state, &headers, &tenant_id).await {
        return err.into_response();
    }
    if body.numero.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "numero is required" })),
        )
            .into_response();
    }

    let outcome = handle_incoming_message(
        &state,
        &tenant_id,
        &body.numero,
        body.nombre,
        &body.mensaje,
        body.hora,
    )
    .await;
    // Automation failures never surface here; the event was handled.
    Json(json!({ "status": "ok", "outcome": outcome.as_str() })).into_response()
}

async fn logout_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    if let Err(err) = authorize_tenant(&state, &headers, &tenant_id).await {
        return err.into_response();
    }
    state.registry.purge_tenant(&tenant_id);
    state.messages.write().await.remove(&tenant_id);
    broadcast_to_tenant(&state, &tenant_id, "session_closed", json!({})).await;
    info!(tenant_id = %tenant_id, "tenant session torn down");
    Json(json!({ "status": "ok" })).into_response()
}

async fn create_contact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateContactBody>,
) -> impl IntoResponse {
    let tenant_id = match auth_tenant_from_headers(&state, &headers).await {
        Ok(tenant_id) => tenant_id,
        Err(err) => return err.into_response(),
    };
    let number: String = body.number.chars().filter(char::is_ascii_digit).collect();
    if number.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "number is required" })),
        )
            .into_response();
    }

    let contact = Contact {
        tenant_id,
        number,
        name: body.name,
        excluded_from_automation: body.excluded_from_automation,
    };
    match state.store.create_contact(contact).await {
        Ok(contact) => (StatusCode::CREATED, Json(json!(contact))).into_response(),
        Err(StoreError::DuplicateContact) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "contact already exists" })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn list_contacts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let tenant_id = match auth_tenant_from_headers(&state, &headers).await {
        Ok(tenant_id) => tenant_id,
        Err(err) => return err.into_response(),
    };
    let contacts = state.store.list_contacts(&tenant_id).await;
    Json(contacts).into_response()
}

async fn patch_contact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(number): Path<String>,
    Json(body): Json<PatchContactBody>,
) -> impl IntoResponse {
    let tenant_id = match auth_tenant_from_headers(&state, &headers).await {
        Ok(tenant_id) => tenant_id,
        Err(err) => return err.into_response(),
    };
    match state
        .store
        .update_contact(&tenant_id, &number, body.name, body.excluded_from_automation)
        .await
    {
        Some(contact) => Json(json!(contact)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "contact not found" })),
        )
            .into_response(),
    }
}

async fn delete_contact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(number): Path<String>,
) -> impl IntoResponse {
    let tenant_id = match auth_tenant_from_headers(&state, &headers).await {
        Ok(tenant_id) => tenant_id,
        Err(err) => return err.into_response(),
    };
    if state.store.delete_contact(&tenant_id, &number).await {
        Json(json!({ "status": "deleted" })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "contact not found" })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct EventEnvelopeIn {
    event: String,
    #[serde(default)]
    data: Value,
}

async fn emit_to_client<T: serde::Serialize>(
    state: &Arc<AppState>,
    client_id: usize,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };

    if let Some(sender) = tx {
        let _ = sender.send(payload);
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Realtime push channel. Clients authenticate after connecting by sending
/// a `join` event carrying their bearer token and tenant id; once joined
/// they receive that tenant's `new_message` / `new_bot_response` stream.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        match envelope.event.as_str() {
            "join" => {
                let token = envelope
                    .data
                    .get("token")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let requested_tenant = envelope
                    .data
                    .get("tenantId")
                    .and_then(Value::as_str)
                    .unwrap_or("");

                let token_tenant = state.store.tenant_for_token(token).await;
                match token_tenant {
                    Some(tenant_id)
                        if requested_tenant.is_empty() || requested_tenant == tenant_id =>
                    {
                        {
                            let mut rt = state.realtime.lock().await;
                            rt.tenant_by_client.insert(client_id, tenant_id.clone());
                        }
                        emit_to_client(
                            &state,
                            client_id,
                            "joined_room",
                            json!({ "room": tenant_id, "success": true }),
                        )
                        .await;
                    }
                    _ => {
                        emit_to_client(
                            &state,
                            client_id,
                            "auth:error",
                            json!({ "message": "invalid token or tenant" }),
                        )
                        .await;
                    }
                }
            }
            "ping" => {
                emit_to_client(&state, client_id, "pong", json!({ "now": now_iso() })).await;
            }
            _ => {}
        }
    }

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
        rt.tenant_by_client.remove(&client_id);
    }

    send_task.abort();
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/bot/state", get(get_bot_state).post(set_bot_state))
        .route("/api/bot/chats", get(list_bot_chats))
        .route("/api/bot/{conversation}/toggle", post(toggle_bot_state))
        .route("/api/bot/{conversation}/deactivate", post(deactivate_bot))
        .route("/api/bot/{conversation}/reactivate", post(reactivate_bot))
        .route(
            "/api/configchatbot/{tenant_id}",
            get(get_config_chatbot).put(put_config_chatbot),
        )
        .route("/api/messages/send/{tenant_id}", post(send_message))
        .route(
            "/api/messages/send-bulk/{tenant_id}",
            post(send_bulk_from_list),
        )
        .route(
            "/api/messages/send-csv/{tenant_id}",
            post(send_bulk_from_csv),
        )
        .route(
            "/api/messages/send-txt/{tenant_id}",
            post(send_bulk_from_txt),
        )
        .route("/api/messages/{tenant_id}", get(get_messages))
        .route(
            "/api/events/message/{tenant_id}",
            post(inbound_message_event),
        )
        .route("/api/session/{tenant_id}/logout", post(logout_session))
        .route("/api/contacts", get(list_contacts).post(create_contact))
        .route(
            "/api/contacts/{number}",
            axum::routing::patch(patch_contact).delete(delete_contact),
        )
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "wa_gateway".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

pub async fn run() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();
    let webhook_url = env::var("AUTOMATION_WEBHOOK_URL")
        .ok()
        .filter(|url| !url.trim().is_empty());
    let bridge_url =
        env::var("WHATSAPP_BRIDGE_URL").unwrap_or_else(|_| "http://localhost:3001".to_string());
    let bridge_token = env::var("WHATSAPP_BRIDGE_TOKEN")
        .ok()
        .filter(|token| !token.trim().is_empty());

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    if webhook_url.is_none() {
        warn!("AUTOMATION_WEBHOOK_URL is not set; FAQ misses will get no reply");
    }

    let store: Arc<dyn TenantStore> = Arc::new(PgTenantStore::new(db));
    let registry = ChatStateRegistry::new(Arc::clone(&store));
    let transport: Arc<dyn Transport> = Arc::new(WhatsappBridge::new(bridge_url, bridge_token));
    let state = Arc::new(AppState::new(store, registry, transport, webhook_url));

    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!("wa gateway server running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_chat_detection() {
        assert!(is_direct_chat("51987654321@c.us"));
        assert!(!is_direct_chat("status@broadcast"));
        assert!(!is_direct_chat("123456789-987654@g.us"));
        assert!(!is_direct_chat(""));
    }

    #[test]
    fn chat_id_normalization() {
        assert_eq!(normalize_chat_id("51987654321"), "51987654321@c.us");
        assert_eq!(normalize_chat_id("51987654321@c.us"), "51987654321@c.us");
        assert_eq!(contact_number("51987654321@c.us"), "51987654321");
    }

    #[test]
    fn number_list_parsing() {
        let raw = "51987654321\n51912345678,51911122233\n\n51987654321\nabc\n555-123";
        assert_eq!(
            parse_number_list(raw),
            vec!["51987654321", "51912345678", "51911122233"]
        );
    }
}
