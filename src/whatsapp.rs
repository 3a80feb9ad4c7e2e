//! Meta WhatsApp Cloud API: Graph client, inbound webhook and number provisioning.

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    admin::{
        load_accessible_agent, require,
        sessions::{store_message, SESSION_OPEN},
    },
    app::now_iso,
    auth::authenticate,
    config::WhatsAppConfig,
    error::{success, ApiError, ApiResult},
    permissions::is_super_admin,
    realtime::emit_to_organisation_admins,
    types::{parse_agent_row, parse_chat_session_row, Agent, AppState, ChatSession, ConnectWhatsAppBody},
};

const GRAPH_BASE_URL: &str = "https://graph.facebook.com";

#[derive(Debug, Error)]
pub enum WhatsAppError {
    #[error("WHATSAPP_ACCESS_TOKEN not configured")]
    NotConfigured,
    #[error("graph request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("graph api returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid graph id: {0:?}")]
    InvalidId(String),
}

/// WABA and phone number ids are numeric Graph node ids.
pub fn is_graph_id(value: &str) -> bool {
    !value.is_empty() && value.len() <= 32 && value.chars().all(|c| c.is_ascii_digit())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneNumber {
    pub id: String,
    pub display_phone_number: String,
    pub verified_name: String,
    pub quality_rating: String,
}

pub struct WhatsAppClient {
    http: reqwest::Client,
    config: WhatsAppConfig,
}

impl WhatsAppClient {
    pub fn new(http: reqwest::Client, config: WhatsAppConfig) -> Self {
        Self { http, config }
    }

    pub fn is_configured(&self) -> bool {
        self.config.access_token.is_some()
    }

    fn url(&self, node_id: &str, edge: &str) -> Result<String, WhatsAppError> {
        if !is_graph_id(node_id) {
            return Err(WhatsAppError::InvalidId(node_id.to_string()));
        }
        Ok(format!("{GRAPH_BASE_URL}/{}/{node_id}/{edge}", self.config.graph_version))
    }

    async fn call(&self, request: reqwest::RequestBuilder) -> Result<Value, WhatsAppError> {
        let token = self
            .config
            .access_token
            .as_deref()
            .ok_or(WhatsAppError::NotConfigured)?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(WhatsAppError::Status {
                status: status.as_u16(),
                body: raw_body,
            });
        }
        Ok(serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body })))
    }

    pub async fn list_phone_numbers(&self, waba_id: &str) -> Result<Vec<PhoneNumber>, WhatsAppError> {
        let body = self
            .call(self.http.get(self.url(waba_id, "phone_numbers")?).query(&[(
                "fields",
                "id,display_phone_number,verified_name,quality_rating",
            )]))
            .await?;
        Ok(parse_phone_numbers(&body))
    }

    pub async fn register_phone_number(&self, phone_number_id: &str, pin: &str) -> Result<(), WhatsAppError> {
        self.call(
            self.http
                .post(self.url(phone_number_id, "register")?)
                .json(&json!({ "messaging_product": "whatsapp", "pin": pin })),
        )
        .await?;
        Ok(())
    }

    pub async fn subscribe_app(&self, waba_id: &str) -> Result<(), WhatsAppError> {
        self.call(self.http.post(self.url(waba_id, "subscribed_apps")?))
            .await?;
        Ok(())
    }

    /// Returns the Graph message id (`wamid.*`).
    pub async fn send_text(&self, phone_number_id: &str, to: &str, body: &str) -> Result<String, WhatsAppError> {
        let response = self
            .call(
                self.http
                    .post(self.url(phone_number_id, "messages")?)
                    .json(&json!({
                        "messaging_product": "whatsapp",
                        "recipient_type": "individual",
                        "to": to,
                        "type": "text",
                        "text": { "preview_url": false, "body": body }
                    })),
            )
            .await?;
        Ok(response
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|messages| messages.first())
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string())
    }
}

fn parse_phone_numbers(body: &Value) -> Vec<PhoneNumber> {
    let text = |item: &Value, key: &str| {
        item.get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    body.get("data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("id").and_then(Value::as_str).is_some())
                .map(|item| PhoneNumber {
                    id: text(item, "id"),
                    display_phone_number: text(item, "display_phone_number"),
                    verified_name: text(item, "verified_name"),
                    quality_rating: text(item, "quality_rating"),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Checks `X-Hub-Signature-256: sha256=<hex hmac of body>` in constant time.
pub fn verify_signature(app_secret: &str, body: &[u8], signature_header: Option<&str>) -> bool {
    let signature = signature_header.unwrap_or("").trim();
    let Some(signature) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

fn normalize_wa_id(raw: &str) -> Option<String> {
    let digits = raw.chars().filter(char::is_ascii_digit).collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub phone_number_id: String,
    pub wa_id: String,
    pub contact_name: String,
    pub wa_message_id: String,
    pub text: String,
}

fn message_text(message: &Value) -> Option<String> {
    let kind = message.get("type").and_then(Value::as_str).unwrap_or("");
    let text = match kind {
        "text" => message.pointer("/text/body"),
        "button" => message.pointer("/button/text"),
        "interactive" => message
            .pointer("/interactive/button_reply/title")
            .or_else(|| message.pointer("/interactive/list_reply/title")),
        _ => None,
    }?;
    let text = text.as_str()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Text-bearing messages of a webhook payload; statuses and media are skipped.
pub fn extract_inbound_messages(payload: &Value) -> Vec<InboundMessage> {
    let mut inbound = Vec::new();
    let entries = payload.get("entry").and_then(Value::as_array);
    for entry in entries.into_iter().flatten() {
        let changes = entry.get("changes").and_then(Value::as_array);
        for change in changes.into_iter().flatten() {
            let Some(value) = change.get("value") else {
                continue;
            };
            let phone_number_id = value
                .pointer("/metadata/phone_number_id")
                .and_then(Value::as_str)
                .unwrap_or("");
            if phone_number_id.is_empty() {
                continue;
            }

            let mut names = HashMap::new();
            for contact in value.get("contacts").and_then(Value::as_array).into_iter().flatten() {
                let Some(wa_id) = contact.get("wa_id").and_then(Value::as_str).and_then(normalize_wa_id) else {
                    continue;
                };
                let name = contact
                    .pointer("/profile/name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_string();
                names.insert(wa_id, name);
            }

            for message in value.get("messages").and_then(Value::as_array).into_iter().flatten() {
                let Some(wa_id) = message.get("from").and_then(Value::as_str).and_then(normalize_wa_id) else {
                    continue;
                };
                let Some(text) = message_text(message) else {
                    continue;
                };
                inbound.push(InboundMessage {
                    phone_number_id: phone_number_id.to_string(),
                    contact_name: names.get(&wa_id).cloned().unwrap_or_default(),
                    wa_message_id: message
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    wa_id,
                    text,
                });
            }
        }
    }
    inbound
}

pub async fn webhook_verify(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let token = params.get("hub.verify_token").map(String::as_str).unwrap_or("");
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    let expected = state.config.whatsapp.verify_token.as_deref().unwrap_or("");

    if mode == "subscribe" && !challenge.is_empty() && !expected.is_empty() && token == expected {
        return (StatusCode::OK, challenge).into_response();
    }
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "success": false, "error": "invalid webhook verification token" })),
    )
        .into_response()
}

/// Open session for the contact, created on first contact.
async fn find_or_create_session(
    state: &Arc<AppState>,
    agent: &Agent,
    inbound: &InboundMessage,
) -> Result<(ChatSession, bool), ApiError> {
    let existing = sqlx::query(
        "SELECT * FROM chat_sessions WHERE agent_id = $1 AND contact_wa_id = $2 AND status = $3 \
         ORDER BY last_message_at DESC LIMIT 1",
    )
    .bind(&agent.id)
    .bind(&inbound.wa_id)
    .bind(SESSION_OPEN)
    .fetch_optional(&state.db)
    .await?;
    if let Some(row) = existing {
        let mut session = parse_chat_session_row(&row);
        if session.contact_name.is_empty() && !inbound.contact_name.is_empty() {
            sqlx::query("UPDATE chat_sessions SET contact_name = $1 WHERE id = $2")
                .bind(&inbound.contact_name)
                .bind(&session.id)
                .execute(&state.db)
                .await?;
            session.contact_name = inbound.contact_name.clone();
        }
        return Ok((session, false));
    }

    let now = now_iso();
    let session = ChatSession {
        id: Uuid::new_v4().to_string(),
        agent_id: agent.id.clone(),
        contact_wa_id: inbound.wa_id.clone(),
        contact_name: inbound.contact_name.clone(),
        status: SESSION_OPEN.to_string(),
        last_message_at: now.clone(),
        created_at: now,
    };
    sqlx::query(
        "INSERT INTO chat_sessions (id, agent_id, contact_wa_id, contact_name, status, last_message_at, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7)",
    )
    .bind(&session.id)
    .bind(&session.agent_id)
    .bind(&session.contact_wa_id)
    .bind(&session.contact_name)
    .bind(&session.status)
    .bind(&session.last_message_at)
    .bind(&session.created_at)
    .execute(&state.db)
    .await?;
    Ok((session, true))
}

async fn ingest_message(state: &Arc<AppState>, inbound: &InboundMessage) -> Result<bool, ApiError> {
    let Some(row) = sqlx::query("SELECT * FROM agents WHERE phone_number_id = $1 LIMIT 1")
        .bind(&inbound.phone_number_id)
        .fetch_optional(&state.db)
        .await?
    else {
        debug!(phone_number_id = %inbound.phone_number_id, "no agent for phone number");
        return Ok(false);
    };
    let agent = parse_agent_row(&row);

    // Meta redelivers on timeouts.
    if !inbound.wa_message_id.is_empty() {
        let seen = sqlx::query_scalar::<_, String>("SELECT id FROM chat_messages WHERE wa_message_id = $1 LIMIT 1")
            .bind(&inbound.wa_message_id)
            .fetch_optional(&state.db)
            .await?;
        if seen.is_some() {
            return Ok(false);
        }
    }

    let (session, created) = find_or_create_session(state, &agent, inbound).await?;
    let message = store_message(state, &session.id, "user", &inbound.text, &inbound.wa_message_id).await?;
    if created {
        emit_to_organisation_admins(state, &agent.organisation_id, "session.updated", &json!(session)).await;
    }
    emit_to_organisation_admins(state, &agent.organisation_id, "message.created", &json!(message)).await;
    Ok(true)
}

pub async fn webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(app_secret) = state.config.whatsapp.app_secret.as_deref() {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_signature(app_secret, &body, signature) {
            warn!("rejected webhook with invalid signature");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "success": false, "error": "invalid webhook signature" })),
            )
                .into_response();
        }
    }

    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    let mut processed = 0usize;
    for inbound in extract_inbound_messages(&payload) {
        match ingest_message(&state, &inbound).await {
            Ok(true) => processed += 1,
            Ok(false) => {}
            Err(err) => warn!(error = %err, wa_message_id = %inbound.wa_message_id, "unable to store inbound message"),
        }
    }
    if processed > 0 {
        info!(processed, "whatsapp messages received");
    }
    success(json!({ "processed": processed }))
}

fn upstream(err: WhatsAppError) -> ApiError {
    ApiError::Upstream(err.to_string())
}

/// Lists numbers with the platform token, so it is limited to super admins.
pub async fn list_waba_phone_numbers(
    Path(waba_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    require(is_super_admin(&user), "only super admins can browse WhatsApp accounts")?;
    let waba_id = graph_id(&waba_id, "wabaId")?;
    let numbers = state
        .whatsapp
        .list_phone_numbers(&waba_id)
        .await
        .map_err(upstream)?;
    Ok(success(numbers))
}

fn graph_id(raw: &str, field: &str) -> Result<String, ApiError> {
    let id = raw.trim();
    if !is_graph_id(id) {
        return Err(ApiError::bad_request(format!("{field} must be a numeric id")));
    }
    Ok(id.to_string())
}

pub async fn connect_agent_whatsapp(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ConnectWhatsAppBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (mut agent, _) = load_accessible_agent(&state, &user, &agent_id).await?;
    let waba_id = graph_id(&body.waba_id, "wabaId")?;
    let phone_number_id = graph_id(&body.phone_number_id, "phoneNumberId")?;

    let taken = sqlx::query_scalar::<_, String>(
        "SELECT id FROM agents WHERE phone_number_id = $1 AND id <> $2 LIMIT 1",
    )
    .bind(&phone_number_id)
    .bind(&agent.id)
    .fetch_optional(&state.db)
    .await?;
    if taken.is_some() {
        return Err(ApiError::Conflict(
            "phone number is already connected to another agent".to_string(),
        ));
    }

    let numbers = state
        .whatsapp
        .list_phone_numbers(&waba_id)
        .await
        .map_err(upstream)?;
    let number = numbers
        .into_iter()
        .find(|n| n.id == phone_number_id)
        .ok_or_else(|| ApiError::bad_request("phone number does not belong to this WhatsApp account"))?;

    if let Some(pin) = body.pin.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        state
            .whatsapp
            .register_phone_number(&phone_number_id, pin)
            .await
            .map_err(upstream)?;
    }
    state.whatsapp.subscribe_app(&waba_id).await.map_err(upstream)?;

    agent.waba_id = waba_id;
    agent.phone_number_id = number.id;
    agent.display_phone_number = number.display_phone_number;
    agent.updated_at = now_iso();
    sqlx::query(
        "UPDATE agents SET waba_id = $1, phone_number_id = $2, display_phone_number = $3, updated_at = $4 WHERE id = $5",
    )
    .bind(&agent.waba_id)
    .bind(&agent.phone_number_id)
    .bind(&agent.display_phone_number)
    .bind(&agent.updated_at)
    .bind(&agent.id)
    .execute(&state.db)
    .await?;

    info!(agent_id = %agent.id, phone_number_id = %agent.phone_number_id, "agent connected to whatsapp");
    Ok(success(agent))
}
